//! Broker-level tests for claiming, long-polling, listening waits and
//! wake-up fan-out, without the network front end.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use vscope_broker::config::BrokerConfig;
use vscope_broker::scheduler::{AffinityFilter, NotificationSink, WorkerId};
use vscope_broker::{Broker, BrokerError, FetchOutcome, FetchRequest, SubmitRequest};

#[derive(Default)]
struct RecordingSink {
    sent: Mutex<Vec<(SocketAddr, String)>>,
}

impl RecordingSink {
    fn sent(&self) -> Vec<(SocketAddr, String)> {
        self.sent.lock().unwrap().clone()
    }
}

impl NotificationSink for RecordingSink {
    fn send(&self, target: SocketAddr, payload: &[u8]) -> io::Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((target, String::from_utf8_lossy(payload).into_owned()));
        Ok(())
    }
}

fn make_broker() -> (Arc<Broker>, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let broker = Arc::new(Broker::new(BrokerConfig::default(), sink.clone()));
    (broker, sink)
}

fn wn(node: &str) -> WorkerId {
    WorkerId::new(node, "session")
}

fn fetch_any(node: &str) -> FetchRequest {
    FetchRequest::immediate(wn(node), AffinityFilter::any())
}

fn notify_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

#[tokio::test]
async fn test_scope_isolation() {
    let (broker, _) = make_broker();
    broker.set_scope(&wn("wn_a"), "WN_SCOPE:::test_wn").await;
    broker.set_scope(&wn("wn_b"), "elsewhere").await;

    broker
        .submit(SubmitRequest::new("blah", "WN_SCOPE:::test_wn"))
        .await
        .unwrap();

    let other = broker.fetch(fetch_any("wn_b")).await.unwrap();
    assert_eq!(other, FetchOutcome::Empty);

    let own = broker.fetch(fetch_any("wn_a")).await.unwrap();
    assert!(own.job().is_some(), "expected a job, got {own:?}");
}

#[tokio::test]
async fn test_submit_from_uses_bound_scope() {
    let (broker, _) = make_broker();
    let submitter = wn("node");
    broker.set_scope(&submitter, "WN_SCOPE:::test_wn").await;
    broker
        .submit_from(&submitter, "blah", Default::default())
        .await
        .unwrap();

    let stranger = broker.fetch(fetch_any("test_not_matching_wn")).await.unwrap();
    assert_eq!(stranger, FetchOutcome::Empty);

    let job = broker.fetch(fetch_any("test_wn")).await.unwrap().into_job();
    assert_eq!(job.map(|j| j.scope), Some("WN_SCOPE:::test_wn".to_string()));
}

#[tokio::test]
async fn test_exactly_once_claim_under_concurrency() {
    let (broker, _) = make_broker();
    let id = broker.submit(SubmitRequest::new("only", "")).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..16 {
        let broker = broker.clone();
        handles.push(tokio::spawn(async move {
            broker.fetch(fetch_any(&format!("w{i}"))).await.unwrap()
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        if let Some(job) = handle.await.unwrap().into_job() {
            winners.push(job.id);
        }
    }
    assert_eq!(winners, vec![id]);
    assert!(broker.claimed_by(&id).await.is_some());
}

#[tokio::test]
async fn test_fifo_within_scope() {
    let (broker, _) = make_broker();
    let j1 = broker.submit(SubmitRequest::new("1", "")).await.unwrap();
    let j2 = broker.submit(SubmitRequest::new("2", "")).await.unwrap();

    let first = broker.fetch(fetch_any("w")).await.unwrap().into_job().unwrap();
    let second = broker.fetch(fetch_any("w")).await.unwrap().into_job().unwrap();
    assert_eq!(first.id, j1);
    assert_eq!(second.id, j2);
}

#[tokio::test]
async fn test_long_poll_woken_by_matching_submit() {
    let (broker, _) = make_broker();

    let waiter = {
        let broker = broker.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let outcome = broker.fetch(fetch_any("w").with_timeout(5)).await.unwrap();
            (outcome, started.elapsed())
        })
    };

    // Let the fetch register its wait
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.live_waiters(), 1);
    let id = broker.submit(SubmitRequest::new("late", "")).await.unwrap();

    let (outcome, elapsed) = waiter.await.unwrap();
    assert_eq!(outcome.into_job().map(|j| j.id), Some(id));
    assert!(elapsed < Duration::from_secs(5), "woke only at deadline");
    assert_eq!(broker.live_waiters(), 0);
}

#[tokio::test]
async fn test_long_poll_times_out_not_before_deadline() {
    let (broker, _) = make_broker();
    broker.set_scope(&wn("w"), "mine").await;

    let waiter = {
        let broker = broker.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let outcome = broker.fetch(fetch_any("w").with_timeout(1)).await.unwrap();
            (outcome, started.elapsed())
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    broker
        .submit(SubmitRequest::new("not for you", "theirs"))
        .await
        .unwrap();

    let (outcome, elapsed) = waiter.await.unwrap();
    assert_eq!(outcome, FetchOutcome::Empty);
    assert!(elapsed >= Duration::from_secs(1));
    assert_eq!(broker.live_waiters(), 0);
}

#[tokio::test]
async fn test_listening_fetch_returns_immediately_and_is_notified() {
    let (broker, sink) = make_broker();

    let outcome = broker
        .fetch(
            fetch_any("test_wn")
                .with_timeout(5)
                .with_notify_addr(notify_addr(9555)),
        )
        .await
        .unwrap();
    assert!(matches!(outcome, FetchOutcome::Listening(_)));

    broker
        .submit(SubmitRequest::new("blah", "WN_SCOPE:::test_wn"))
        .await
        .unwrap();

    let sent = sink.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, notify_addr(9555));
    assert!(sent[0].1.contains("queue=TEST"));
    assert!(sent[0].1.contains("WN_SCOPE:::test_wn"));

    // The notification did not take the job; a re-poll does.
    let job = broker.fetch(fetch_any("test_wn")).await.unwrap();
    assert!(job.job().is_some());
    assert_eq!(broker.live_waiters(), 0, "claim fulfils the wait");
}

#[tokio::test]
async fn test_non_matching_submit_sends_nothing() {
    let (broker, sink) = make_broker();
    broker
        .fetch(
            fetch_any("test_wn")
                .with_timeout(5)
                .with_notify_addr(notify_addr(9556)),
        )
        .await
        .unwrap();

    broker
        .submit(SubmitRequest::new("blah", "WN_SCOPE:::non_matching_test_wn"))
        .await
        .unwrap();
    broker.submit(SubmitRequest::new("blah", "other")).await.unwrap();

    assert!(sink.sent().is_empty());
    assert_eq!(broker.live_waiters(), 1);
}

#[tokio::test]
async fn test_every_matching_waiter_is_notified() {
    let (broker, sink) = make_broker();
    for (node, port) in [("a", 9601), ("b", 9602)] {
        broker.set_scope(&wn(node), "shared").await;
        broker
            .fetch(fetch_any(node).with_timeout(5).with_notify_addr(notify_addr(port)))
            .await
            .unwrap();
    }

    broker.submit(SubmitRequest::new("one", "shared")).await.unwrap();
    assert_eq!(sink.sent().len(), 2);

    // Both race for the single job; exactly one wins.
    let a = broker.fetch(fetch_any("a")).await.unwrap();
    let b = broker.fetch(fetch_any("b")).await.unwrap();
    assert_eq!(a.job().is_some() as u8 + b.job().is_some() as u8, 1);
}

#[tokio::test]
async fn test_expired_listener_gets_no_notification() {
    let (broker, sink) = make_broker();
    broker
        .fetch(fetch_any("w").with_timeout(1).with_notify_addr(notify_addr(9557)))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1100)).await;
    broker.submit(SubmitRequest::new("late", "")).await.unwrap();
    assert!(sink.sent().is_empty());

    assert_eq!(broker.expire_due(), 1);
    assert_eq!(broker.status().await.expired, 1);
}

#[tokio::test]
async fn test_cancel_wait_releases_long_poll() {
    let (broker, _) = make_broker();
    let waiter = {
        let broker = broker.clone();
        tokio::spawn(async move { broker.fetch(fetch_any("w").with_timeout(30)).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    let handle = broker.status().await.waiters[0].handle;
    assert!(broker.cancel_wait(handle));
    assert!(!broker.cancel_wait(handle), "second cancel is a no-op");

    let outcome = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("cancelled fetch should return promptly")
        .unwrap()
        .unwrap();
    assert_eq!(outcome, FetchOutcome::Empty);
}

#[tokio::test]
async fn test_newer_fetch_replaces_wait() {
    let (broker, sink) = make_broker();
    broker
        .fetch(fetch_any("w").with_timeout(5).with_notify_addr(notify_addr(9001)))
        .await
        .unwrap();
    broker
        .fetch(fetch_any("w").with_timeout(5).with_notify_addr(notify_addr(9002)))
        .await
        .unwrap();
    assert_eq!(broker.live_waiters(), 1);

    broker.submit(SubmitRequest::new("x", "")).await.unwrap();
    let sent = sink.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, notify_addr(9002));
}

#[tokio::test]
async fn test_displaced_long_poll_returns_promptly() {
    let (broker, _) = make_broker();
    let displaced = {
        let broker = broker.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let outcome = broker.fetch(fetch_any("w").with_timeout(3)).await.unwrap();
            (outcome, started.elapsed())
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    let outcome = broker
        .fetch(fetch_any("w").with_timeout(5).with_notify_addr(notify_addr(9005)))
        .await
        .unwrap();
    assert!(matches!(outcome, FetchOutcome::Listening(_)));

    let (outcome, elapsed) = tokio::time::timeout(Duration::from_secs(2), displaced)
        .await
        .expect("displaced long poll should not sit until its deadline")
        .unwrap();
    assert_eq!(outcome, FetchOutcome::Empty);
    assert!(elapsed < Duration::from_secs(1), "took {elapsed:?}");
    assert_eq!(broker.live_waiters(), 1);
}

#[tokio::test]
async fn test_dropped_long_poll_removes_its_wait() {
    let (broker, sink) = make_broker();

    let abandoned = tokio::time::timeout(
        Duration::from_millis(100),
        broker.fetch(fetch_any("w").with_timeout(30)),
    )
    .await;
    assert!(abandoned.is_err());
    assert_eq!(broker.live_waiters(), 0);

    let id = broker.submit(SubmitRequest::new("kept", "")).await.unwrap();
    assert!(sink.sent().is_empty());
    let job = broker.fetch(fetch_any("other")).await.unwrap().into_job();
    assert_eq!(job.map(|j| j.id), Some(id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_abandoned_fetches_never_lose_jobs() {
    let (broker, _) = make_broker();
    let sweeper_token = tokio_util::sync::CancellationToken::new();
    let sweeper = tokio::spawn(
        broker
            .clone()
            .run_sweeper(sweeper_token.clone()),
    );

    const JOBS: usize = 40;
    let mut fetchers = Vec::new();
    for i in 0..JOBS {
        let broker = broker.clone();
        fetchers.push(tokio::spawn(async move {
            // Each fetch is abandoned at a different point of its wait.
            let patience = Duration::from_millis(1 + (i as u64 * 7) % 50);
            match tokio::time::timeout(
                patience,
                broker.fetch(fetch_any(&format!("w{i}")).with_timeout(5)),
            )
            .await
            {
                Ok(outcome) => outcome.unwrap().into_job().map(|j| j.id),
                Err(_) => None,
            }
        }));
    }

    let mut submitted = Vec::new();
    for i in 0..JOBS {
        submitted.push(broker.submit(SubmitRequest::new(i.to_string(), "")).await.unwrap());
        tokio::task::yield_now().await;
    }

    let mut accounted: Vec<_> = Vec::new();
    for fetcher in fetchers {
        accounted.extend(fetcher.await.unwrap());
    }
    accounted.extend(broker.pending_jobs().await.into_iter().map(|j| j.id));

    accounted.sort();
    submitted.sort();
    assert_eq!(accounted, submitted, "every job is either returned or still pending");

    sweeper_token.cancel();
    sweeper.await.unwrap();
}

#[tokio::test]
async fn test_out_of_range_timeout_is_rejected() {
    let sink = Arc::new(RecordingSink::default());
    let config = BrokerConfig {
        max_wait_timeout_secs: u64::MAX,
        ..BrokerConfig::default()
    };
    let broker = Broker::new(config, sink);

    let err = broker
        .fetch(fetch_any("w").with_timeout(u64::MAX))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::InvalidParameter(_)));
    assert_eq!(broker.live_waiters(), 0);
}

#[tokio::test]
async fn test_affinity_on_wait_is_respected() {
    let (broker, sink) = make_broker();
    let request = FetchRequest::immediate(wn("w"), AffinityFilter::tags(["gpu"]))
        .with_timeout(5)
        .with_notify_addr(notify_addr(9003));
    broker.fetch(request).await.unwrap();

    broker.submit(SubmitRequest::new("untagged", "")).await.unwrap();
    assert!(sink.sent().is_empty());

    let mut tagged = SubmitRequest::new("tagged", "");
    tagged.affinities.insert("gpu".to_string());
    broker.submit(tagged).await.unwrap();
    assert_eq!(sink.sent().len(), 1);
}

#[tokio::test]
async fn test_queue_full_rejects_submit() {
    let sink = Arc::new(RecordingSink::default());
    let broker = Broker::new(BrokerConfig::default().with_max_jobs(1), sink);
    broker.submit(SubmitRequest::new("1", "")).await.unwrap();
    let err = broker.submit(SubmitRequest::new("2", "")).await.unwrap_err();
    assert!(matches!(err, BrokerError::QueueFull(1)));
}

#[tokio::test]
async fn test_shutdown_releases_waiters_and_refuses_work() {
    let (broker, _) = make_broker();
    broker.set_scope(&wn("w"), "s").await;
    let waiter = {
        let broker = broker.clone();
        tokio::spawn(async move { broker.fetch(fetch_any("w").with_timeout(30)).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    broker.shutdown().await;

    let outcome = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("shutdown should release the waiter")
        .unwrap()
        .unwrap();
    assert_eq!(outcome, FetchOutcome::Empty);
    assert_eq!(broker.get_scope(&wn("w")).await, "");
    assert!(matches!(
        broker.submit(SubmitRequest::new("x", "")).await,
        Err(BrokerError::ShutDown)
    ));
}

#[tokio::test]
async fn test_status_snapshot() {
    let (broker, _) = make_broker();
    broker.set_scope(&wn("w"), "s").await;
    broker.submit(SubmitRequest::new("a", "s")).await.unwrap();
    broker.submit(SubmitRequest::new("b", "")).await.unwrap();
    broker.fetch(fetch_any("w")).await.unwrap();
    broker
        .fetch(fetch_any("w").with_timeout(5).with_notify_addr(notify_addr(9004)))
        .await
        .unwrap();

    let status = broker.status().await;
    assert_eq!(status.queue, "TEST");
    assert_eq!(status.pending, 1);
    assert_eq!(status.pending_by_scope.get(""), Some(&1));
    assert_eq!(status.submitted, 2);
    assert_eq!(status.claimed, 1);
    assert_eq!(status.scope_bindings, 1);
    assert_eq!(status.waiters.len(), 1);
    assert_eq!(status.waiters[0].worker, "w/session");
    assert_eq!(status.waiters[0].notify_addr.as_deref(), Some("127.0.0.1:9004"));
}
