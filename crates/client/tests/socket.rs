//! WebSocket lifecycle: connect, event decoding, reconnect, close.

use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt as _;
use promptfleet_client::{
    ClientSession, ConnectionState, ImageFormat, ServerEvent, SessionEvent, SessionOptions,
};
use reqwest::Url;
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

type ServerSide = WebSocketStream<TcpStream>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Accept loop handing each established server-side socket to the test.
async fn ws_listener() -> (u16, mpsc::UnboundedReceiver<ServerSide>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                continue;
            };
            if tx.send(ws).is_err() {
                return;
            }
        }
    });
    (port, rx)
}

fn session_on(port: u16) -> Arc<ClientSession> {
    let mut options =
        SessionOptions::new(Url::parse(&format!("http://127.0.0.1:{port}")).unwrap());
    options.client_id = "socket-test".into();
    options.reconnect_base_delay = Duration::from_millis(20);
    options.reconnect_max_delay = Duration::from_millis(50);
    ClientSession::new(options).unwrap()
}

async fn next_event(
    events: &mut tokio::sync::broadcast::Receiver<SessionEvent>,
) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for session event")
        .expect("event channel closed")
}

#[tokio::test]
async fn connects_decodes_and_reconnects() {
    init_tracing();
    let (port, mut conns) = ws_listener().await;
    let session = session_on(port);
    let mut events = session.subscribe();
    session.connect();

    let mut server = conns.recv().await.unwrap();
    assert!(matches!(next_event(&mut events).await, SessionEvent::Connected));
    assert_eq!(session.state(), ConnectionState::Connected);

    // Text frame decodes to a typed server event.
    let frame = json!({
        "type": "executing",
        "data": {"node": "3", "prompt_id": "p-1"},
    })
    .to_string();
    server.send(Message::text(frame)).await.unwrap();
    match next_event(&mut events).await {
        SessionEvent::Server(ServerEvent::Executing(e)) => {
            assert_eq!(e.node.as_deref(), Some("3"));
            assert_eq!(e.prompt_id.as_deref(), Some("p-1"));
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // Binary frame decodes to a preview.
    let mut preview = Vec::new();
    preview.extend_from_slice(&1u32.to_be_bytes());
    preview.extend_from_slice(&1u32.to_be_bytes());
    preview.extend_from_slice(b"jpeg-bytes");
    server.send(Message::binary(preview)).await.unwrap();
    match next_event(&mut events).await {
        SessionEvent::Preview(p) => {
            assert_eq!(p.format, ImageFormat::Jpeg);
            assert_eq!(p.data, b"jpeg-bytes");
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // Dropping the server side triggers disconnect + automatic reconnect.
    drop(server);
    assert!(matches!(next_event(&mut events).await, SessionEvent::Disconnected));

    let _server2 = conns.recv().await.unwrap();
    assert!(matches!(next_event(&mut events).await, SessionEvent::Reconnected));
    assert_eq!(session.state(), ConnectionState::Connected);

    session.close().await;
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn exhausted_reconnects_report_failure() {
    init_tracing();
    let (port, mut conns) = ws_listener().await;
    let session = {
        let mut options =
            SessionOptions::new(Url::parse(&format!("http://127.0.0.1:{port}")).unwrap());
        options.reconnect_base_delay = Duration::from_millis(5);
        options.reconnect_max_delay = Duration::from_millis(10);
        options.max_reconnect_attempts = 2;
        ClientSession::new(options).unwrap()
    };
    let mut events = session.subscribe();
    session.connect();

    // Let it connect once, then shut the listener's sockets for good.
    let server = conns.recv().await.unwrap();
    assert!(matches!(next_event(&mut events).await, SessionEvent::Connected));
    drop(server);
    assert!(matches!(next_event(&mut events).await, SessionEvent::Disconnected));

    // Subsequent accepts are immediately dropped by the test, so handshakes
    // fail until the attempt budget runs out.
    drop(conns);

    loop {
        match next_event(&mut events).await {
            SessionEvent::ReconnectionFailed => break,
            SessionEvent::Disconnected | SessionEvent::Reconnected => continue,
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert_eq!(session.state(), ConnectionState::Failed);
}

#[tokio::test]
async fn abort_reconnect_stops_pending_attempt() {
    init_tracing();
    let (port, mut conns) = ws_listener().await;
    let session = {
        let mut options =
            SessionOptions::new(Url::parse(&format!("http://127.0.0.1:{port}")).unwrap());
        options.reconnect_base_delay = Duration::from_secs(30);
        options.reconnect_max_delay = Duration::from_secs(30);
        ClientSession::new(options).unwrap()
    };
    let mut events = session.subscribe();
    session.connect();

    let server = conns.recv().await.unwrap();
    assert!(matches!(next_event(&mut events).await, SessionEvent::Connected));
    drop(server);
    assert!(matches!(next_event(&mut events).await, SessionEvent::Disconnected));

    // The session is now waiting out a long backoff; aborting settles it.
    session.abort_reconnect();
    let mut state = session.watch_state();
    tokio::time::timeout(Duration::from_secs(5), async {
        state
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
            .unwrap();
    })
    .await
    .expect("session did not settle after abort_reconnect");
}
