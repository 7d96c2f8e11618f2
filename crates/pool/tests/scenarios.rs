//! End-to-end scenarios against the in-process fake server.

mod support;

use std::collections::BTreeSet;
use std::time::Duration;

use serde_json::json;

use promptfleet_pool::{
    ExecError, JobOptions, JobStatus, OutputMap, PoolEvent, PoolOptions, WorkflowAffinity,
    WorkflowPool,
};
use support::{FakeServer, init_tracing, wait_for_event, workflow};

fn fast_options() -> PoolOptions {
    PoolOptions {
        retry_backoff: Duration::from_millis(50),
        health_check_interval: Duration::ZERO,
        ..PoolOptions::default()
    }
}

fn simple_workflow(marker: u64) -> promptfleet_pool::Workflow {
    workflow(json!({
        "1": {"class_type": "LoadCheckpoint", "inputs": {"ckpt_name": "sd15.safetensors", "marker": marker}},
        "2": {"class_type": "SaveImage", "inputs": {"images": ["1", 0]}},
    }))
}

#[tokio::test]
async fn happy_path_maps_outputs_and_streams_events() {
    init_tracing();
    let server = FakeServer::start("s1").await;
    let pool = WorkflowPool::start(vec![server.client_config("c1")], fast_options())
        .await
        .unwrap();
    let mut events = pool.events();

    let output_map = OutputMap::default().alias("2", "result");
    let job_id = pool
        .enqueue(simple_workflow(1), output_map, JobOptions::default())
        .await
        .unwrap();

    let accepted = wait_for_event(&mut events, |event| match event {
        PoolEvent::JobAccepted { job } if job.job_id == job_id => job.prompt_id.clone(),
        _ => None,
    })
    .await;
    let prompt = server.wait_for_prompt(1).await;
    assert_eq!(accepted, prompt.prompt_id);

    server.send_event(
        "executing",
        json!({"node": "2", "prompt_id": prompt.prompt_id}),
    );
    wait_for_event(&mut events, |event| {
        matches!(event, PoolEvent::JobStarted { job } if job.job_id == job_id).then_some(())
    })
    .await;

    server.send_event(
        "progress",
        json!({"value": 1, "max": 1, "node": "2", "prompt_id": prompt.prompt_id}),
    );
    let progress = wait_for_event(&mut events, |event| match event {
        PoolEvent::JobProgress { job_id: id, progress, .. } if *id == job_id => {
            Some(progress.clone())
        }
        _ => None,
    })
    .await;
    assert_eq!((progress.value, progress.max), (1, 1));

    // A plain preview frame is forwarded to the active job.
    let mut frame = Vec::new();
    frame.extend_from_slice(&1u32.to_be_bytes());
    frame.extend_from_slice(&1u32.to_be_bytes());
    frame.extend_from_slice(b"preview-bytes");
    server.send_binary(frame);
    let image = wait_for_event(&mut events, |event| match event {
        PoolEvent::JobPreview { job_id: id, image, .. } if *id == job_id => Some(image.clone()),
        _ => None,
    })
    .await;
    assert_eq!(image.data, b"preview-bytes");

    server.send_event(
        "executed",
        json!({
            "node": "2",
            "output": {"data": {"ok": true}},
            "prompt_id": prompt.prompt_id,
        }),
    );
    server.send_event("execution_success", json!({"prompt_id": prompt.prompt_id}));

    let job = wait_for_event(&mut events, |event| match event {
        PoolEvent::JobFailed { job, .. } if job.job_id == job_id => {
            panic!("unexpected failure: {:?}", job.last_error)
        }
        PoolEvent::JobCompleted { job } if job.job_id == job_id => Some(job.clone()),
        _ => None,
    })
    .await;

    let result = job.result.expect("completed job carries a result");
    assert_eq!(result.mapped["result"]["data"]["ok"], json!(true));
    assert_eq!(result.nodes, vec!["2".to_string()]);
    assert_eq!(result.aliases["2"], "result");
    assert_eq!(result.prompt_id, prompt.prompt_id);
    assert_eq!(job.status, JobStatus::Completed);

    pool.shutdown().await;
}

#[tokio::test]
async fn disconnect_recovery_completes_from_history() {
    init_tracing();
    let server = FakeServer::start("s1").await;
    let pool = WorkflowPool::start(vec![server.client_config("c1")], fast_options())
        .await
        .unwrap();
    let mut events = pool.events();

    let job_id = pool
        .enqueue(
            simple_workflow(2),
            OutputMap::default().alias("2", "result"),
            JobOptions::default(),
        )
        .await
        .unwrap();

    wait_for_event(&mut events, |event| {
        matches!(event, PoolEvent::JobAccepted { job } if job.job_id == job_id).then_some(())
    })
    .await;
    let prompt = server.wait_for_prompt(1).await;

    // Drop the socket mid-attempt; the result shows up in history shortly
    // after, and the session reconnects on its own.
    server.drop_connections();
    tokio::time::sleep(Duration::from_millis(20)).await;
    server
        .set_history(
            &prompt.prompt_id,
            json!({
                "status": {"completed": true, "status_str": "success"},
                "outputs": {"2": {"data": {"recovered": true}}},
            }),
        )
        .await;

    let job = wait_for_event(&mut events, |event| match event {
        PoolEvent::JobFailed { job, .. } if job.job_id == job_id => {
            panic!("disconnect recovery must not fail the job: {:?}", job.last_error)
        }
        PoolEvent::JobCompleted { job } if job.job_id == job_id => Some(job.clone()),
        _ => None,
    })
    .await;

    let result = job.result.expect("recovered job carries a result");
    assert_eq!(result.mapped["result"]["data"]["recovered"], json!(true));

    pool.shutdown().await;
}

#[tokio::test]
async fn cancellation_interrupts_the_running_prompt() {
    init_tracing();
    let server = FakeServer::start("s1").await;
    let pool = WorkflowPool::start(vec![server.client_config("c1")], fast_options())
        .await
        .unwrap();
    let mut events = pool.events();

    let job_id = pool
        .enqueue(
            simple_workflow(3),
            OutputMap::default().alias("2", "result"),
            JobOptions::default(),
        )
        .await
        .unwrap();

    wait_for_event(&mut events, |event| {
        matches!(event, PoolEvent::JobAccepted { job } if job.job_id == job_id).then_some(())
    })
    .await;
    let prompt = server.wait_for_prompt(1).await;

    assert!(pool.cancel(job_id).await);
    wait_for_event(&mut events, |event| {
        matches!(event, PoolEvent::JobCancelled { job } if job.job_id == job_id).then_some(())
    })
    .await;
    server.wait_for_interrupt(&prompt.prompt_id).await;

    // Terminal: a second cancel is a no-op, and the record stays cancelled.
    assert!(!pool.cancel(job_id).await);
    let snapshot = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(snapshot) = pool.job(job_id) {
                if snapshot.status.is_terminal() {
                    return snapshot;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job never reached a terminal state");
    assert_eq!(snapshot.status, JobStatus::Cancelled);

    pool.shutdown().await;
}

#[tokio::test]
async fn permanent_incompatibility_exhausts_the_client_set() {
    init_tracing();
    let server_a = FakeServer::start("a").await;
    let server_b = FakeServer::start("b").await;
    server_a
        .reject_prompts(400, json!({"error": "value_not_in_list"}))
        .await;
    server_b
        .reject_prompts(400, json!({"error": "value_not_in_list"}))
        .await;

    let pool = WorkflowPool::start(
        vec![
            server_a.client_config("c_a"),
            server_b.client_config("c_b"),
        ],
        fast_options(),
    )
    .await
    .unwrap();
    let mut events = pool.events();

    let job_id = pool
        .enqueue(
            simple_workflow(4),
            OutputMap::default().alias("2", "result"),
            JobOptions {
                max_attempts: 4,
                ..JobOptions::default()
            },
        )
        .await
        .unwrap();

    let mut final_failures = 0u32;
    let job = wait_for_event(&mut events, |event| match event {
        PoolEvent::JobFailed { job, will_retry: false } if job.job_id == job_id => {
            final_failures += 1;
            Some(job.clone())
        }
        _ => None,
    })
    .await;
    assert_eq!(final_failures, 1);

    // One attempt per client, not the full attempt budget.
    assert_eq!(job.attempts, 2);
    let expected: BTreeSet<String> = ["c_a".to_string(), "c_b".to_string()].into();
    assert_eq!(job.exclude_client_ids, expected);

    match job.last_error.expect("terminal job carries an error") {
        ExecError::WorkflowNotSupported { reasons, .. } => {
            let keys: BTreeSet<String> = reasons.keys().cloned().collect();
            assert_eq!(keys, expected);
            for reason in reasons.values() {
                assert!(
                    reason.contains("value_not_in_list"),
                    "reason missing rejection code: {reason}"
                );
            }
        }
        other => panic!("expected WorkflowNotSupported, got {other:?}"),
    }

    pool.shutdown().await;
}

#[tokio::test]
async fn selectivity_keeps_rare_jobs_unblocked() {
    init_tracing();
    let server_gen = FakeServer::start("gen").await;
    let server_edit = FakeServer::start("edit").await;

    let wf_gen_a = simple_workflow(10);
    let wf_gen_b = simple_workflow(10);
    let wf_edit = simple_workflow(20);

    let options = PoolOptions {
        workflow_affinities: vec![
            WorkflowAffinity {
                workflow_hash: wf_gen_a.structural_hash(),
                preferred_client_ids: ["gen".to_string()].into(),
                exclude_client_ids: BTreeSet::new(),
            },
            WorkflowAffinity {
                workflow_hash: wf_edit.structural_hash(),
                preferred_client_ids: ["edit".to_string()].into(),
                exclude_client_ids: BTreeSet::new(),
            },
        ],
        ..fast_options()
    };

    let pool = WorkflowPool::start(
        vec![
            server_gen.client_config("gen"),
            server_edit.client_config("edit"),
        ],
        options,
    )
    .await
    .unwrap();
    let mut events = pool.events();

    let map = || OutputMap::default().alias("2", "result");
    let gen_a = pool.enqueue(wf_gen_a, map(), JobOptions::default()).await.unwrap();
    let gen_b = pool.enqueue(wf_gen_b, map(), JobOptions::default()).await.unwrap();
    let edit = pool.enqueue(wf_edit, map(), JobOptions::default()).await.unwrap();

    // The edit job must be scheduled alongside the first gen job, not
    // blocked behind the second gen job waiting for the gen client.
    let mut accepted = Vec::new();
    while accepted.len() < 2 {
        let id = wait_for_event(&mut events, |event| match event {
            PoolEvent::JobAccepted { job } => Some(job.job_id),
            _ => None,
        })
        .await;
        accepted.push(id);
    }
    assert!(accepted.contains(&gen_a), "first gen job not scheduled");
    assert!(accepted.contains(&edit), "edit job was starved by gen jobs");
    assert!(!accepted.contains(&gen_b), "second gen job jumped the queue");

    // Finish the first gen job; the second follows on the gen client.
    let prompt_gen = server_gen.wait_for_prompt(1).await;
    server_gen.complete_prompt(&prompt_gen.prompt_id, "2", json!({"done": 1}));
    let id = wait_for_event(&mut events, |event| match event {
        PoolEvent::JobAccepted { job } => Some(job.job_id),
        _ => None,
    })
    .await;
    assert_eq!(id, gen_b);

    pool.shutdown().await;
}

#[tokio::test]
async fn priority_orders_acceptance() {
    init_tracing();
    let server = FakeServer::start("s1").await;
    let pool = WorkflowPool::start(vec![server.client_config("c1")], fast_options())
        .await
        .unwrap();
    let mut events = pool.events();

    let map = || OutputMap::default().alias("2", "result");

    // Occupy the only client so the three probe jobs queue up together.
    let blocker = pool
        .enqueue(simple_workflow(0), map(), JobOptions::default())
        .await
        .unwrap();
    wait_for_event(&mut events, |event| {
        matches!(event, PoolEvent::JobAccepted { job } if job.job_id == blocker).then_some(())
    })
    .await;

    for priority in [1, 10, 5] {
        pool.enqueue(
            simple_workflow(100 + priority as u64),
            map(),
            JobOptions {
                priority,
                ..JobOptions::default()
            },
        )
        .await
        .unwrap();
    }

    let blocker_prompt = server.wait_for_prompt(1).await;
    server.complete_prompt(&blocker_prompt.prompt_id, "2", json!({"done": true}));

    let mut order = Vec::new();
    let mut next_prompt = 2usize;
    while order.len() < 3 {
        let job = wait_for_event(&mut events, |event| match event {
            PoolEvent::JobAccepted { job } => Some(job.clone()),
            _ => None,
        })
        .await;
        order.push(job.priority);
        let prompt = server.wait_for_prompt(next_prompt).await;
        next_prompt += 1;
        server.complete_prompt(&prompt.prompt_id, "2", json!({"done": true}));
    }
    assert_eq!(order, vec![10, 5, 1]);

    pool.shutdown().await;
}

#[tokio::test]
async fn start_timeout_fails_the_attempt_as_transient() {
    init_tracing();
    let server = FakeServer::start("s1").await;
    let options = PoolOptions {
        execution_start_timeout: Duration::from_millis(150),
        ..fast_options()
    };
    let pool = WorkflowPool::start(vec![server.client_config("c1")], options)
        .await
        .unwrap();
    let mut events = pool.events();

    // The server accepts but never executes; one attempt, then terminal.
    let job_id = pool
        .enqueue(
            simple_workflow(7),
            OutputMap::default().alias("2", "result"),
            JobOptions {
                max_attempts: 1,
                ..JobOptions::default()
            },
        )
        .await
        .unwrap();

    let job = wait_for_event(&mut events, |event| match event {
        PoolEvent::JobFailed { job, will_retry: false } if job.job_id == job_id => {
            Some(job.clone())
        }
        _ => None,
    })
    .await;
    assert_eq!(job.attempts, 1);
    let error = job.last_error.expect("timeout must be recorded");
    assert_eq!(error.code(), "execution_timeout");

    pool.shutdown().await;
}

#[tokio::test]
async fn transient_rejection_retries_on_the_same_pool() {
    init_tracing();
    let server = FakeServer::start("s1").await;
    server
        .reject_prompts_times(503, json!({"error": "overloaded"}), 1)
        .await;

    let pool = WorkflowPool::start(vec![server.client_config("c1")], fast_options())
        .await
        .unwrap();
    let mut events = pool.events();

    let job_id = pool
        .enqueue(
            simple_workflow(5),
            OutputMap::default().alias("2", "result"),
            JobOptions::default(),
        )
        .await
        .unwrap();

    let (retried, delay) = wait_for_event(&mut events, |event| match event {
        PoolEvent::JobRetrying { job, delay } if job.job_id == job_id => {
            Some((job.clone(), *delay))
        }
        _ => None,
    })
    .await;
    assert_eq!(retried.attempts, 1);
    assert_eq!(delay, Duration::from_millis(50));

    // Second attempt is accepted and completes normally.
    wait_for_event(&mut events, |event| {
        matches!(event, PoolEvent::JobAccepted { job } if job.job_id == job_id).then_some(())
    })
    .await;
    let prompt = server.wait_for_prompt(1).await;
    server.complete_prompt(&prompt.prompt_id, "2", json!({"done": true}));

    let job = wait_for_event(&mut events, |event| match event {
        PoolEvent::JobCompleted { job } if job.job_id == job_id => Some(job.clone()),
        _ => None,
    })
    .await;
    assert_eq!(job.attempts, 2);

    pool.shutdown().await;
}

#[tokio::test]
async fn bypassed_node_is_rewired_out_of_the_submitted_graph() {
    init_tracing();
    let server = FakeServer::start("s1").await;
    server
        .set_object_info(
            "ImageFilter",
            json!({
                "input": {"required": {"image": ["IMAGE"], "strength": ["FLOAT", {"default": 0.5}]}},
                "output": ["IMAGE"],
            }),
        )
        .await;

    let pool = WorkflowPool::start(vec![server.client_config("c1")], fast_options())
        .await
        .unwrap();
    let mut events = pool.events();

    let wf = workflow(json!({
        "1": {"class_type": "LoadImage", "inputs": {"image": "a.png"}},
        "2": {"class_type": "ImageFilter", "inputs": {"image": ["1", 0], "strength": 0.8}},
        "3": {"class_type": "SaveImage", "inputs": {"images": ["2", 0]}},
    }));
    let job_id = pool
        .enqueue(
            wf,
            OutputMap::default().alias("3", "result"),
            JobOptions {
                bypass_node_ids: vec!["2".to_string()],
                ..JobOptions::default()
            },
        )
        .await
        .unwrap();

    wait_for_event(&mut events, |event| {
        matches!(event, PoolEvent::JobAccepted { job } if job.job_id == job_id).then_some(())
    })
    .await;
    let prompt = server.wait_for_prompt(1).await;

    // The bypassed node is gone and its consumer is wired to the upstream.
    assert!(prompt.workflow.get("2").is_none());
    assert_eq!(prompt.workflow["3"]["inputs"]["images"], json!(["1", 0]));

    server.complete_prompt(&prompt.prompt_id, "3", json!({"done": true}));
    wait_for_event(&mut events, |event| {
        matches!(event, PoolEvent::JobCompleted { job } if job.job_id == job_id).then_some(())
    })
    .await;

    pool.shutdown().await;
}

#[tokio::test]
async fn attachments_upload_before_submission() {
    init_tracing();
    let server = FakeServer::start("s1").await;
    let pool = WorkflowPool::start(vec![server.client_config("c1")], fast_options())
        .await
        .unwrap();
    let mut events = pool.events();

    let wf = workflow(json!({
        "1": {"class_type": "LoadImage", "inputs": {"image": "placeholder.png"}},
        "2": {"class_type": "SaveImage", "inputs": {"images": ["1", 0]}},
    }));
    let job_id = pool
        .enqueue(
            wf,
            OutputMap::default().alias("2", "result"),
            JobOptions {
                attachments: vec![promptfleet_pool::Attachment {
                    node_id: "1".to_string(),
                    input_name: "image".to_string(),
                    filename: "mask.png".to_string(),
                    bytes: b"fake-png".to_vec(),
                }],
                ..JobOptions::default()
            },
        )
        .await
        .unwrap();

    wait_for_event(&mut events, |event| {
        matches!(event, PoolEvent::JobAccepted { job } if job.job_id == job_id).then_some(())
    })
    .await;

    assert_eq!(server.uploads().await, vec!["mask.png".to_string()]);
    let prompt = server.wait_for_prompt(1).await;
    assert_eq!(prompt.workflow["1"]["inputs"]["image"], json!("mask.png"));

    server.complete_prompt(&prompt.prompt_id, "2", json!({"done": true}));
    wait_for_event(&mut events, |event| {
        matches!(event, PoolEvent::JobCompleted { job } if job.job_id == job_id).then_some(())
    })
    .await;

    pool.shutdown().await;
}

#[tokio::test]
async fn auto_seeds_match_the_submitted_payload() {
    init_tracing();
    let server = FakeServer::start("s1").await;
    let pool = WorkflowPool::start(vec![server.client_config("c1")], fast_options())
        .await
        .unwrap();
    let mut events = pool.events();

    let wf = workflow(json!({
        "1": {"class_type": "KSampler", "inputs": {"seed": -1, "steps": 4}},
        "2": {"class_type": "SaveImage", "inputs": {"images": ["1", 0]}},
    }));
    let job_id = pool
        .enqueue(wf, OutputMap::default().alias("2", "result"), JobOptions::default())
        .await
        .unwrap();

    wait_for_event(&mut events, |event| {
        matches!(event, PoolEvent::JobAccepted { job } if job.job_id == job_id).then_some(())
    })
    .await;
    let prompt = server.wait_for_prompt(1).await;

    let submitted_seed = prompt.workflow["1"]["inputs"]["seed"]
        .as_i64()
        .expect("seed must be submitted as an integer");
    assert!((0..(1 << 31)).contains(&submitted_seed));

    server.complete_prompt(&prompt.prompt_id, "2", json!({"done": true}));
    let job = wait_for_event(&mut events, |event| match event {
        PoolEvent::JobCompleted { job } if job.job_id == job_id => Some(job.clone()),
        _ => None,
    })
    .await;

    let result = job.result.expect("result present");
    assert_eq!(result.auto_seeds.len(), 1);
    assert_eq!(result.auto_seeds["1"], submitted_seed);

    pool.shutdown().await;
}
