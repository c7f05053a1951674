#![cfg(feature = "sqlite")]

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::{Backend, RecordingHandler, harness, wait_for};
use leaseq_core::config::WorkerOptions;
use leaseq_core::domain::{MessageStatus, QueueId};
use leaseq_core::ports::{Clock, ExponentialRetryPolicy, PurgeFilter};
use leaseq_core::{CorrelationId, EnqueueOptions, HandlerError, QueueOptions, WorkerGroup};
use rstest::rstest;

fn workers(n: usize) -> WorkerOptions {
    WorkerOptions {
        workers: n,
        poll_interval_ms: 10,
        route: None,
    }
}

#[rstest]
#[case(Backend::Memory)]
#[case(Backend::Sqlite)]
#[case(Backend::Redis)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_message_is_delivered_exactly_once(#[case] backend: Backend) {
    let Some(h) = harness(backend, QueueOptions::new("scenario_one")).await else {
        return;
    };
    let mut ids = HashSet::new();
    for i in 0..10 {
        let id = h
            .engine
            .enqueue(format!("job {i}").into_bytes(), Vec::new(), EnqueueOptions::new())
            .await
            .unwrap();
        ids.insert(id);
    }

    let handler = RecordingHandler::new(Ok(()));
    let group = WorkerGroup::spawn(
        h.engine.clone(),
        handler.clone(),
        Arc::new(ExponentialRetryPolicy::default()),
        &workers(3),
    );
    wait_for(&h.engine, |c| c.live() == 0).await;
    group.shutdown_and_join().await;

    let deliveries = handler.deliveries();
    assert_eq!(deliveries.len(), 10);
    let delivered: HashSet<QueueId> = deliveries.into_iter().collect();
    assert_eq!(delivered, ids);
    assert_eq!(
        h.events.names().iter().filter(|n| **n == "completed").count(),
        10
    );
}

#[rstest]
#[case(Backend::Memory)]
#[case(Backend::Sqlite)]
#[case(Backend::Redis)]
#[tokio::test]
async fn delayed_message_waits_for_its_time(#[case] backend: Backend) {
    let Some(h) = harness(backend, QueueOptions::new("scenario_two")).await else {
        return;
    };
    let id = h
        .engine
        .enqueue(
            b"later".to_vec(),
            Vec::new(),
            EnqueueOptions::new().with_delay(Duration::from_secs(5)),
        )
        .await
        .unwrap();

    assert!(h.engine.dequeue(None).await.unwrap().is_none());
    h.clock.advance(Duration::from_secs(4));
    h.engine.promote_delayed().await.unwrap();
    assert!(h.engine.dequeue(None).await.unwrap().is_none());

    h.clock.advance(Duration::from_secs(2));
    let leased = h.engine.dequeue(None).await.unwrap().unwrap();
    assert_eq!(leased.queue_id, id);
    assert_eq!(leased.body, b"later");
}

#[rstest]
#[case(Backend::Memory)]
#[case(Backend::Sqlite)]
#[case(Backend::Redis)]
#[tokio::test]
async fn expired_message_is_never_delivered(#[case] backend: Backend) {
    let Some(h) = harness(backend, QueueOptions::new("scenario_three")).await else {
        return;
    };
    h.engine
        .enqueue(
            b"stale".to_vec(),
            Vec::new(),
            EnqueueOptions::new().with_expiration(Duration::from_secs(1)),
        )
        .await
        .unwrap();

    h.clock.advance(Duration::from_secs(2));
    assert!(h.engine.dequeue(None).await.unwrap().is_none());
    assert_eq!(h.engine.remove_expired().await.unwrap().len(), 1);
    assert_eq!(h.engine.counts().await.unwrap().live(), 0);
    assert!(h.engine.remove_expired().await.unwrap().is_empty());
}

#[rstest]
#[case(Backend::Memory)]
#[case(Backend::Sqlite)]
#[case(Backend::Redis)]
#[tokio::test]
async fn abandoned_lease_is_reclaimed(#[case] backend: Backend) {
    let mut options = QueueOptions::new("scenario_four");
    options.heartbeat.lease_timeout_ms = 2_000;
    options.heartbeat.renew_interval_ms = 500;
    let Some(h) = harness(backend, options).await else {
        return;
    };
    let id = h
        .engine
        .enqueue(b"crashy".to_vec(), Vec::new(), EnqueueOptions::new())
        .await
        .unwrap();

    let first = h.engine.dequeue(None).await.unwrap().unwrap();
    assert_eq!(first.delivery_count, 1);
    assert!(h.engine.dequeue(None).await.unwrap().is_none());

    h.clock.advance(Duration::from_secs(3));
    assert_eq!(h.engine.reset_expired_heartbeats().await.unwrap(), vec![id]);

    let second = h.engine.dequeue(None).await.unwrap().unwrap();
    assert_eq!(second.queue_id, id);
    assert_eq!(second.delivery_count, 2);
    assert!(h.engine.send_heartbeat(id).await.is_ok());
}

#[rstest]
#[case(Backend::Memory)]
#[case(Backend::Sqlite)]
#[case(Backend::Redis)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retries_are_bounded(#[case] backend: Backend) {
    let Some(h) = harness(backend, QueueOptions::new("scenario_five")).await else {
        return;
    };
    let id = h
        .engine
        .enqueue(b"widget".to_vec(), Vec::new(), EnqueueOptions::new())
        .await
        .unwrap();

    let handler = RecordingHandler::new(Err(HandlerError::failed(
        "WidgetException",
        "widget exploded",
    )));
    let retry = ExponentialRetryPolicy::default()
        .with_max_retries(2)
        .with_base_delay(Duration::ZERO);
    let group = WorkerGroup::spawn(h.engine.clone(), handler.clone(), Arc::new(retry), &workers(1));
    wait_for(&h.engine, |c| c.error == 1).await;
    group.shutdown_and_join().await;

    assert_eq!(handler.deliveries(), vec![id, id, id]);
    assert_eq!(h.engine.counts().await.unwrap().live(), 0);

    let errors = h.engine.error_messages(10).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].queue_id, id);
    assert!(errors[0].last_exception.contains("WidgetException"));

    let tracking = h.engine.error_tracking(id).await.unwrap();
    assert_eq!(tracking.len(), 1);
    assert_eq!(tracking[0].exception_type, "WidgetException");
    assert_eq!(tracking[0].retry_count, 2);
}

#[rstest]
#[case(Backend::Memory)]
#[case(Backend::Sqlite)]
#[case(Backend::Redis)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dequeue_leases_once(#[case] backend: Backend) {
    let Some(h) = harness(backend, QueueOptions::new("scenario_six")).await else {
        return;
    };
    for _ in 0..20 {
        h.engine
            .enqueue(b"contended".to_vec(), Vec::new(), EnqueueOptions::new())
            .await
            .unwrap();

        let a = tokio::spawn({
            let engine = h.engine.clone();
            async move { engine.dequeue(None).await.unwrap() }
        });
        let b = tokio::spawn({
            let engine = h.engine.clone();
            async move { engine.dequeue(None).await.unwrap() }
        });
        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        let leased: Vec<_> = [a, b].into_iter().flatten().collect();
        assert_eq!(leased.len(), 1);
        h.engine.complete(leased[0].queue_id).await.unwrap();
    }
}

#[rstest]
#[case(Backend::Memory)]
#[case(Backend::Sqlite)]
#[case(Backend::Redis)]
#[tokio::test]
async fn completion_is_terminal(#[case] backend: Backend) {
    let Some(h) = harness(backend, QueueOptions::new("terminal")).await else {
        return;
    };
    let id = h
        .engine
        .enqueue(b"once".to_vec(), Vec::new(), EnqueueOptions::new())
        .await
        .unwrap();
    h.engine.dequeue(None).await.unwrap().unwrap();
    h.engine.complete(id).await.unwrap();

    assert!(h.engine.dequeue(None).await.unwrap().is_none());
    assert!(h.engine.complete(id).await.unwrap_err().is_not_found());
    assert!(h.engine.rollback(id, None).await.unwrap_err().is_not_found());
}

#[rstest]
#[case(Backend::Memory)]
#[case(Backend::Sqlite)]
#[case(Backend::Redis)]
#[tokio::test]
async fn poison_bypasses_retry_tracking(#[case] backend: Backend) {
    let mut options = QueueOptions::new("poison");
    options.enable_status_table = true;
    let Some(h) = harness(backend, options).await else {
        return;
    };
    let correlation_id = CorrelationId::new();
    let id = h
        .engine
        .enqueue(
            b"\xff\xfe".to_vec(),
            Vec::new(),
            EnqueueOptions::new().with_correlation_id(correlation_id),
        )
        .await
        .unwrap();

    let handler = RecordingHandler::new(Err(HandlerError::poison("cannot decode body")));
    let group = WorkerGroup::spawn(
        h.engine.clone(),
        handler.clone(),
        Arc::new(ExponentialRetryPolicy::default()),
        &workers(1),
    );
    wait_for(&h.engine, |c| c.error == 1).await;
    group.shutdown_and_join().await;

    assert_eq!(handler.deliveries(), vec![id]);
    assert!(h.engine.error_tracking(id).await.unwrap().is_empty());
    let status = h.engine.status(correlation_id).await.unwrap().unwrap();
    assert_eq!(status.status, MessageStatus::Error);
    assert_eq!(status.queue_id, id);

    assert_eq!(
        h.engine.purge_error_messages(PurgeFilter::All).await.unwrap(),
        1
    );
    assert!(h.engine.status(correlation_id).await.unwrap().is_none());
    assert_eq!(h.engine.counts().await.unwrap().error, 0);
}

#[rstest]
#[case(Backend::Memory)]
#[case(Backend::Sqlite)]
#[case(Backend::Redis)]
#[tokio::test]
async fn higher_priority_first_then_fifo(#[case] backend: Backend) {
    let mut options = QueueOptions::new("priorities");
    options.enable_priority = true;
    let Some(h) = harness(backend, options).await else {
        return;
    };

    let enqueue = |priority: Option<u8>| {
        let engine = h.engine.clone();
        async move {
            let mut opts = EnqueueOptions::new();
            if let Some(p) = priority {
                opts = opts.with_priority(p);
            }
            engine.enqueue(Vec::new(), Vec::new(), opts).await.unwrap()
        }
    };
    let low = enqueue(Some(1)).await;
    let none = enqueue(None).await;
    let high_a = enqueue(Some(9)).await;
    let high_b = enqueue(Some(9)).await;

    let mut order = Vec::new();
    while let Some(record) = h.engine.dequeue(None).await.unwrap() {
        order.push(record.queue_id);
    }
    assert_eq!(order, vec![high_a, high_b, low, none]);
}

#[rstest]
#[case(Backend::Memory)]
#[case(Backend::Sqlite)]
#[case(Backend::Redis)]
#[tokio::test]
async fn route_filter_only_sees_its_route(#[case] backend: Backend) {
    let mut options = QueueOptions::new("routes");
    options.enable_routes = true;
    let Some(h) = harness(backend, options).await else {
        return;
    };

    let eu = h
        .engine
        .enqueue(Vec::new(), Vec::new(), EnqueueOptions::new().with_route("eu"))
        .await
        .unwrap();
    let us = h
        .engine
        .enqueue(Vec::new(), Vec::new(), EnqueueOptions::new().with_route("us"))
        .await
        .unwrap();

    let leased = h.engine.dequeue(Some("us")).await.unwrap().unwrap();
    assert_eq!(leased.queue_id, us);
    assert!(h.engine.dequeue(Some("us")).await.unwrap().is_none());

    let any = h.engine.dequeue(None).await.unwrap().unwrap();
    assert_eq!(any.queue_id, eu);
}

#[rstest]
#[case(Backend::Memory)]
#[case(Backend::Sqlite)]
#[case(Backend::Redis)]
#[tokio::test]
async fn purge_respects_cutoff(#[case] backend: Backend) {
    let Some(h) = harness(backend, QueueOptions::new("purge")).await else {
        return;
    };
    let mut ids = Vec::new();
    for _ in 0..2 {
        let id = h
            .engine
            .enqueue(Vec::new(), Vec::new(), EnqueueOptions::new())
            .await
            .unwrap();
        h.engine.dequeue(None).await.unwrap().unwrap();
        h.engine.move_to_error_queue(id, "Boom: failed").await.unwrap();
        ids.push(id);
        h.clock.advance(Duration::from_secs(10));
    }

    let cutoff = h.clock.now() - chrono::TimeDelta::seconds(15);
    assert_eq!(
        h.engine
            .purge_error_messages(PurgeFilter::OlderThan(cutoff))
            .await
            .unwrap(),
        1
    );
    let remaining = h.engine.error_messages(10).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].queue_id, ids[1]);
}

#[rstest]
#[case(Backend::Memory)]
#[case(Backend::Sqlite)]
#[case(Backend::Redis)]
#[tokio::test]
async fn status_tracks_each_message_sharing_a_correlation_id(#[case] backend: Backend) {
    let mut options = QueueOptions::new("shared_cid");
    options.enable_status_table = true;
    let Some(h) = harness(backend, options).await else {
        return;
    };
    let correlation_id = CorrelationId::new();
    let enqueue = || {
        h.engine.enqueue(
            Vec::new(),
            Vec::new(),
            EnqueueOptions::new().with_correlation_id(correlation_id),
        )
    };
    let first = enqueue().await.unwrap();
    let second = enqueue().await.unwrap();

    let leased = h.engine.dequeue(None).await.unwrap().unwrap();
    assert_eq!(leased.queue_id, first);
    let latest = h.engine.status(correlation_id).await.unwrap().unwrap();
    assert_eq!(latest.queue_id, second);
    assert_eq!(latest.status, MessageStatus::Waiting);

    h.engine.complete(first).await.unwrap();
    let latest = h.engine.status(correlation_id).await.unwrap().unwrap();
    assert_eq!(latest.queue_id, second);
    assert_eq!(latest.status, MessageStatus::Waiting);

    h.engine.dequeue(None).await.unwrap().unwrap();
    let latest = h.engine.status(correlation_id).await.unwrap().unwrap();
    assert_eq!(latest.status, MessageStatus::Processing);

    h.engine.complete(second).await.unwrap();
    assert!(h.engine.status(correlation_id).await.unwrap().is_none());
}

#[rstest]
#[case(Backend::Memory)]
#[case(Backend::Sqlite)]
#[case(Backend::Redis)]
#[tokio::test]
async fn leased_messages_do_not_block_expiry_of_others(#[case] backend: Backend) {
    let mut options = QueueOptions::new("expiry_batch");
    options.expiration.batch_size = 1;
    let Some(h) = harness(backend, options).await else {
        return;
    };
    let expiring = || {
        h.engine.enqueue(
            Vec::new(),
            Vec::new(),
            EnqueueOptions::new().with_expiration(Duration::from_secs(1)),
        )
    };
    let held = expiring().await.unwrap();
    let idle = expiring().await.unwrap();
    assert_eq!(h.engine.dequeue(None).await.unwrap().unwrap().queue_id, held);

    h.clock.advance(Duration::from_secs(2));
    assert_eq!(h.engine.remove_expired().await.unwrap(), vec![idle]);
    assert_eq!(h.engine.counts().await.unwrap().processing, 1);
}
