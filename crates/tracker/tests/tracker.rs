// crates/tracker/tests/tracker.rs
//! End-to-end driver behavior against a mock API: stream-first tracking,
//! the hard cutover to polling, terminal bookkeeping, and claim
//! exclusivity across submit and resume.

use std::io::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mockito::ServerGuard;
use spendlens_api::{ApiClient, StaticTokenProvider};
use spendlens_tracker::{IngestTracker, JobRegistry, PollConfig, TrackerEvent};
use spendlens_types::{JobStatus, JobUpdate, SubmitResponse};
use tempfile::NamedTempFile;
use tokio::sync::broadcast;
use tokio::time::timeout;

fn tracker_for(server: &ServerGuard, poll: PollConfig) -> Arc<IngestTracker> {
    let api = Arc::new(ApiClient::new(
        server.url(),
        Arc::new(StaticTokenProvider::new("test-token")),
    ));
    IngestTracker::with_poll_config(api, Arc::new(JobRegistry::new()), poll)
}

fn fast_poll() -> PollConfig {
    PollConfig {
        initial_delay: Duration::from_millis(20),
        backoff_factor: 1.5,
        max_delay: Duration::from_millis(60),
        max_attempts: 3,
    }
}

fn statement_file() -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .prefix("statement")
        .suffix(".pdf")
        .tempfile()
        .unwrap();
    file.write_all(b"%PDF-1.4 statement body").unwrap();
    file
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

const USAGE_BODY: &str =
    r#"{"statementsUsed":4,"statementLimit":20,"periodEnd":"2026-09-01T00:00:00Z"}"#;

#[tokio::test]
async fn stream_drives_job_to_completion() {
    let mut server = mockito::Server::new_async().await;
    let submit = server
        .mock("POST", "/api/statements")
        .with_status(202)
        .with_body(r#"{"jobId":"job-1"}"#)
        .expect(1)
        .create_async()
        .await;
    let events = server
        .mock("GET", "/api/statements/jobs/job-1/events")
        .with_header("content-type", "text/event-stream")
        .with_chunked_body(|w| {
            w.write_all(
                b"event: update\ndata: {\"id\":\"job-1\",\"status\":\"RUNNING\",\"progress\":55}\n\n",
            )?;
            w.write_all(
                b"event: update\ndata: {\"id\":\"job-1\",\"status\":\"COMPLETED\",\"progress\":100}\n\n",
            )
        })
        .expect(1)
        .create_async()
        .await;
    let usage = server
        .mock("GET", "/api/usage")
        .with_body(USAGE_BODY)
        .expect(1)
        .create_async()
        .await;
    let status = server
        .mock("GET", "/api/statements/jobs/job-1")
        .with_body("{}")
        .expect(0)
        .create_async()
        .await;

    let tracker = tracker_for(&server, fast_poll());
    let file = statement_file();
    let outcome = tracker.submit(file.path()).await.unwrap();
    assert_eq!(
        outcome,
        SubmitResponse::Accepted {
            job_id: "job-1".into()
        }
    );

    // The driver has not run yet; the registry holds the snapshot.
    let registered = tracker.registry().find("job-1").unwrap();
    assert_eq!(registered.status, JobStatus::Pending);
    assert_eq!(registered.progress, 0);

    wait_until("job-1 to complete via the stream", || {
        tracker
            .registry()
            .find("job-1")
            .is_some_and(|j| j.status == JobStatus::Completed && j.progress == 100)
    })
    .await;
    wait_until("the driver to release its claim", || {
        tracker.active_jobs().is_empty()
    })
    .await;

    // A late update cannot thaw the finished entry.
    let stale = JobUpdate {
        id: "job-1".into(),
        status: JobStatus::Running,
        progress: 40,
        error: None,
    };
    assert_eq!(tracker.registry().apply(&stale), None);
    assert_eq!(
        tracker.registry().find("job-1").unwrap().status,
        JobStatus::Completed
    );

    submit.assert_async().await;
    events.assert_async().await;
    usage.assert_async().await;
    status.assert_async().await;
}

#[tokio::test]
async fn stream_failure_cuts_over_to_polling() {
    let mut server = mockito::Server::new_async().await;
    let _submit = server
        .mock("POST", "/api/statements")
        .with_status(202)
        .with_body(r#"{"jobId":"job-2"}"#)
        .create_async()
        .await;
    let events = server
        .mock("GET", "/api/statements/jobs/job-2/events")
        .with_status(500)
        .expect(1)
        .create_async()
        .await;
    let status = server
        .mock("GET", "/api/statements/jobs/job-2")
        .with_body(
            r#"{"id":"job-2","status":"RUNNING","progressPercent":10,"originalFilename":"visa.pdf"}"#,
        )
        .expect(3)
        .create_async()
        .await;
    let usage = server
        .mock("GET", "/api/usage")
        .with_body(USAGE_BODY)
        .expect(0)
        .create_async()
        .await;

    let tracker = tracker_for(&server, fast_poll());
    let file = statement_file();
    tracker.submit(file.path()).await.unwrap();

    wait_until("the poller to give up at the attempt cap", || {
        tracker.active_jobs().is_empty()
    })
    .await;

    // Never terminal, so the entry is left at its last polled state.
    let job = tracker.registry().find("job-2").unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.progress, 10);

    events.assert_async().await;
    status.assert_async().await;
    usage.assert_async().await;
}

#[tokio::test]
async fn fallback_polls_immediately_after_stream_failure() {
    let mut server = mockito::Server::new_async().await;
    let _submit = server
        .mock("POST", "/api/statements")
        .with_status(202)
        .with_body(r#"{"jobId":"job-3"}"#)
        .create_async()
        .await;
    let _events = server
        .mock("GET", "/api/statements/jobs/job-3/events")
        .with_status(503)
        .create_async()
        .await;
    let status = server
        .mock("GET", "/api/statements/jobs/job-3")
        .with_body(
            r#"{"id":"job-3","status":"COMPLETED","progressPercent":100,"originalFilename":"visa.pdf"}"#,
        )
        .expect(1)
        .create_async()
        .await;
    let usage = server
        .mock("GET", "/api/usage")
        .with_body(USAGE_BODY)
        .expect(1)
        .create_async()
        .await;

    // A first-poll delay this long would blow the deadline below.
    let slow = PollConfig {
        initial_delay: Duration::from_secs(5),
        ..PollConfig::default()
    };
    let tracker = tracker_for(&server, slow);
    let file = statement_file();
    let started = Instant::now();
    tracker.submit(file.path()).await.unwrap();

    wait_until("the first poll to land without the backoff delay", || {
        tracker
            .registry()
            .find("job-3")
            .is_some_and(|j| j.status == JobStatus::Completed)
    })
    .await;
    assert!(started.elapsed() < Duration::from_secs(2));

    wait_until("the driver to release its claim", || {
        tracker.active_jobs().is_empty()
    })
    .await;
    status.assert_async().await;
    usage.assert_async().await;
}

#[tokio::test]
async fn missing_job_stops_tracking_silently() {
    let mut server = mockito::Server::new_async().await;
    let _submit = server
        .mock("POST", "/api/statements")
        .with_status(202)
        .with_body(r#"{"jobId":"job-4"}"#)
        .create_async()
        .await;
    let _events = server
        .mock("GET", "/api/statements/jobs/job-4/events")
        .with_status(500)
        .create_async()
        .await;
    let status = server
        .mock("GET", "/api/statements/jobs/job-4")
        .with_status(404)
        .with_body(r#"{"error":"job not found"}"#)
        .expect(1)
        .create_async()
        .await;
    let usage = server
        .mock("GET", "/api/usage")
        .with_body(USAGE_BODY)
        .expect(0)
        .create_async()
        .await;

    let tracker = tracker_for(&server, fast_poll());
    let file = statement_file();
    tracker.submit(file.path()).await.unwrap();

    wait_until("tracking to stop on the missing job", || {
        tracker.active_jobs().is_empty()
    })
    .await;

    // No retries after the 404, and the snapshot is untouched.
    let job = tracker.registry().find("job-4").unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.progress, 0);

    status.assert_async().await;
    usage.assert_async().await;
}

#[tokio::test]
async fn resume_leaves_claimed_ids_alone() {
    let mut server = mockito::Server::new_async().await;
    let _submit = server
        .mock("POST", "/api/statements")
        .with_status(202)
        .with_body(r#"{"jobId":"job-5"}"#)
        .create_async()
        .await;
    // Held open so the driver is still in its stream phase when
    // resume_pending runs.
    let events = server
        .mock("GET", "/api/statements/jobs/job-5/events")
        .with_header("content-type", "text/event-stream")
        .with_chunked_body(|w| {
            w.write_all(
                b"event: update\ndata: {\"id\":\"job-5\",\"status\":\"RUNNING\",\"progress\":35}\n\n",
            )?;
            std::thread::sleep(Duration::from_millis(800));
            Ok(())
        })
        .expect(1)
        .create_async()
        .await;
    let list = server
        .mock("GET", "/api/statements/jobs")
        .with_body(
            r#"[{"id":"job-5","status":"RUNNING","progressPercent":35,"originalFilename":"visa.pdf"}]"#,
        )
        .expect(1)
        .create_async()
        .await;
    let status = server
        .mock("GET", "/api/statements/jobs/job-5")
        .with_body("{}")
        .expect(0)
        .create_async()
        .await;

    let tracker = tracker_for(&server, fast_poll());
    let file = statement_file();
    tracker.submit(file.path()).await.unwrap();
    wait_until("the stream update to land", || {
        tracker
            .registry()
            .find("job-5")
            .is_some_and(|j| j.progress == 35)
    })
    .await;

    let resumed = tracker.resume_pending().await.unwrap();
    assert_eq!(resumed, 0);
    assert_eq!(tracker.active_jobs(), vec!["job-5".to_string()]);

    tracker.shutdown();
    tracker.shutdown();
    wait_until("the cancelled driver to wind down", || {
        tracker.active_jobs().is_empty()
    })
    .await;
    assert_eq!(
        tracker.registry().find("job-5").unwrap().status,
        JobStatus::Running
    );

    events.assert_async().await;
    list.assert_async().await;
    status.assert_async().await;
}

#[tokio::test]
async fn resume_restarts_only_unclaimed_jobs() {
    let mut server = mockito::Server::new_async().await;
    let list = server
        .mock("GET", "/api/statements/jobs")
        .with_body(
            r#"[{"id":"job-6","status":"RUNNING","progressPercent":40,"originalFilename":"visa-may.pdf"},
               {"id":"job-7","status":"PENDING","progressPercent":0,"originalFilename":"visa-jun.pdf"},
               {"id":"job-8","status":"COMPLETED","progressPercent":100,"originalFilename":"visa-apr.pdf"}]"#,
        )
        .expect(2)
        .create_async()
        .await;
    let hold = |w: &mut dyn std::io::Write| {
        w.write_all(b": hold\n\n")?;
        std::thread::sleep(Duration::from_millis(800));
        Ok(())
    };
    let events_six = server
        .mock("GET", "/api/statements/jobs/job-6/events")
        .with_header("content-type", "text/event-stream")
        .with_chunked_body(hold)
        .expect(1)
        .create_async()
        .await;
    let events_seven = server
        .mock("GET", "/api/statements/jobs/job-7/events")
        .with_header("content-type", "text/event-stream")
        .with_chunked_body(hold)
        .expect(1)
        .create_async()
        .await;

    let tracker = tracker_for(&server, fast_poll());
    let resumed = tracker.resume_pending().await.unwrap();
    assert_eq!(resumed, 2);

    // Server-side state seeds each snapshot; the terminal job is skipped.
    let six = tracker.registry().find("job-6").unwrap();
    assert_eq!(six.status, JobStatus::Running);
    assert_eq!(six.progress, 40);
    assert_eq!(six.filename, "visa-may.pdf");
    assert!(tracker.registry().find("job-8").is_none());

    // Both ids are claimed now, so a second pass attaches nothing.
    let resumed_again = tracker.resume_pending().await.unwrap();
    assert_eq!(resumed_again, 0);
    let mut active = tracker.active_jobs();
    active.sort();
    assert_eq!(active, vec!["job-6".to_string(), "job-7".to_string()]);

    tracker.shutdown();
    wait_until("both drivers to wind down", || {
        tracker.active_jobs().is_empty()
    })
    .await;

    list.assert_async().await;
    events_six.assert_async().await;
    events_seven.assert_async().await;
}

#[tokio::test]
async fn broadcast_follows_the_job_lifecycle() {
    let mut server = mockito::Server::new_async().await;
    let _submit = server
        .mock("POST", "/api/statements")
        .with_status(202)
        .with_body(r#"{"jobId":"job-9"}"#)
        .create_async()
        .await;
    let _events = server
        .mock("GET", "/api/statements/jobs/job-9/events")
        .with_header("content-type", "text/event-stream")
        .with_chunked_body(|w| {
            w.write_all(
                b"event: update\ndata: {\"id\":\"job-9\",\"status\":\"RUNNING\",\"progress\":50}\n\n",
            )?;
            w.write_all(
                b"event: update\ndata: {\"id\":\"job-9\",\"status\":\"COMPLETED\",\"progress\":100}\n\n",
            )
        })
        .create_async()
        .await;
    let _usage = server
        .mock("GET", "/api/usage")
        .with_body(USAGE_BODY)
        .create_async()
        .await;

    let tracker = tracker_for(&server, fast_poll());
    let mut rx = tracker.subscribe();
    let file = statement_file();
    tracker.submit(file.path()).await.unwrap();

    match next_event(&mut rx).await {
        TrackerEvent::JobRegistered { job } => assert_eq!(job.status, JobStatus::Pending),
        other => panic!("expected registration, got {other:?}"),
    }
    match next_event(&mut rx).await {
        TrackerEvent::JobUpdated { job } => {
            assert_eq!(job.status, JobStatus::Running);
            assert_eq!(job.progress, 50);
        }
        other => panic!("expected the running update, got {other:?}"),
    }
    match next_event(&mut rx).await {
        TrackerEvent::JobUpdated { job } => assert_eq!(job.status, JobStatus::Completed),
        other => panic!("expected the completed update, got {other:?}"),
    }
    match next_event(&mut rx).await {
        TrackerEvent::JobFinished { job } => assert_eq!(job.status, JobStatus::Completed),
        other => panic!("expected the finish notice, got {other:?}"),
    }
    match next_event(&mut rx).await {
        TrackerEvent::UsageRefreshed { usage } => assert_eq!(usage.statements_used, 4),
        other => panic!("expected the usage refresh, got {other:?}"),
    }
}

async fn next_event(rx: &mut broadcast::Receiver<TrackerEvent>) -> TrackerEvent {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("tracker event within the deadline")
        .expect("broadcast channel open")
}

#[tokio::test]
async fn driver_outliving_shutdown_cannot_release_its_replacement() {
    let mut server = mockito::Server::new_async().await;
    let list = server
        .mock("GET", "/api/statements/jobs")
        .with_body(
            r#"[{"id":"job-10","status":"RUNNING","progressPercent":40,"originalFilename":"visa-aug.pdf"}]"#,
        )
        .expect(3)
        .create_async()
        .await;
    // Both drivers fail their stream attach and land in the poll phase.
    let events = server
        .mock("GET", "/api/statements/jobs/job-10/events")
        .with_status(500)
        .expect(2)
        .create_async()
        .await;
    // Poll responses arrive 900ms late, parking each driver mid-request;
    // cancellation is only observed once the response lands.
    let stall = |w: &mut dyn std::io::Write| {
        std::thread::sleep(Duration::from_millis(900));
        w.write_all(
            br#"{"id":"job-10","status":"RUNNING","progressPercent":40,"originalFilename":"visa-aug.pdf"}"#,
        )
    };
    let status = server
        .mock("GET", "/api/statements/jobs/job-10")
        .with_chunked_body(stall)
        .expect_at_least(2)
        .create_async()
        .await;

    let tracker = tracker_for(&server, fast_poll());
    assert_eq!(tracker.resume_pending().await.unwrap(), 1);

    // Let the first driver park in its poll request, then cancel it
    // while it is stuck there.
    tokio::time::sleep(Duration::from_millis(200)).await;
    tracker.shutdown();

    // The id is free again; rehydration hands it to a new driver.
    assert_eq!(tracker.resume_pending().await.unwrap(), 1);

    // The first driver's stalled response lands and it winds down. Its
    // exit must leave the replacement's claim in place: a third pass
    // attaches nothing, and exactly one driver stays live.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(tracker.resume_pending().await.unwrap(), 0);
    assert_eq!(tracker.active_jobs(), vec!["job-10".to_string()]);

    tracker.shutdown();
    list.assert_async().await;
    events.assert_async().await;
    status.assert_async().await;
}

#[tokio::test]
async fn password_required_registers_nothing() {
    let mut server = mockito::Server::new_async().await;
    let _submit = server
        .mock("POST", "/api/statements")
        .with_status(422)
        .with_body(r#"{"error":"password_required"}"#)
        .create_async()
        .await;

    let tracker = tracker_for(&server, fast_poll());
    let file = statement_file();
    let outcome = tracker.submit(file.path()).await.unwrap();
    assert_eq!(outcome, SubmitResponse::PasswordRequired);
    assert!(tracker.registry().is_empty());
    assert!(tracker.active_jobs().is_empty());
}

#[tokio::test]
async fn synchronous_completion_needs_no_tracking() {
    let mut server = mockito::Server::new_async().await;
    let _submit = server
        .mock("POST", "/api/statements")
        .with_status(200)
        .with_body(r#"{"statementId":"stmt-42","transactionCount":87}"#)
        .create_async()
        .await;

    let tracker = tracker_for(&server, fast_poll());
    let file = statement_file();
    let outcome = tracker.submit(file.path()).await.unwrap();
    match outcome {
        SubmitResponse::Completed(receipt) => {
            assert_eq!(receipt.statement_id, "stmt-42");
            assert_eq!(receipt.transaction_count, 87);
        }
        other => panic!("expected a synchronous import, got {other:?}"),
    }
    assert!(tracker.registry().is_empty());
    assert!(tracker.active_jobs().is_empty());
}
