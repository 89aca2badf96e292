//! End-to-end pipeline tests: submit → broker → worker pool → store.
//!
//! Verifies:
//! - A submitted job runs once and its result is readable
//! - Retries stop after `max_attempts`
//! - Duplicate deliveries never execute a job twice
//! - Abandoned work is recovered by the reaper
//! - Many executors process a burst of jobs exactly once each

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;

    use jobforge_core::{
        ErrorKind, JobId, JobPolicy, JobState, Payload, PolicyTable, RetryPolicy, WorkerId,
    };

    use crate::broker::{Broker, InMemoryBroker};
    use crate::coordinator::{CoordinatorConfig, Dispatch, JobCoordinator};
    use crate::retry::InfraRetry;
    use crate::store::{InMemoryJobStore, JobStore};
    use crate::workers::{HandlerRegistry, Reaper, TaskFailure, WorkerPool, WorkerPoolConfig};

    struct Pipeline {
        store: Arc<InMemoryJobStore>,
        broker: Arc<InMemoryBroker>,
        coordinator: JobCoordinator,
    }

    fn pipeline(max_attempts: u32, lease_ttl: Duration) -> Pipeline {
        let store = Arc::new(InMemoryJobStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let policies = PolicyTable::new(JobPolicy {
            retry: RetryPolicy::exponential(max_attempts, Duration::ZERO, Duration::ZERO),
            execution_timeout: Duration::from_secs(5),
        });
        let coordinator = JobCoordinator::new(
            store.clone(),
            broker.clone(),
            policies,
            CoordinatorConfig {
                lease_ttl,
                orphan_grace: Duration::from_millis(50),
                infra_retry: InfraRetry::none(),
                ..Default::default()
            },
        );
        Pipeline {
            store,
            broker,
            coordinator,
        }
    }

    fn pool_config(concurrency: usize) -> WorkerPoolConfig {
        WorkerPoolConfig {
            concurrency,
            dequeue_timeout: Duration::from_millis(20),
            heartbeat_interval: Duration::from_millis(20),
            release_delay: Duration::from_millis(10),
            error_backoff: Duration::from_millis(10),
            name: "integration".to_string(),
        }
    }

    async fn wait_for_terminal(c: &JobCoordinator, id: JobId) -> JobState {
        for _ in 0..300 {
            let state = c.get_status(id).await.unwrap().state;
            if state.is_terminal() {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} never finished");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn submitted_job_runs_and_exposes_its_result() {
        let p = pipeline(3, Duration::from_secs(30));
        let mut registry = HandlerRegistry::new();
        registry.register_fn("*", |ctx| async move {
            let input: serde_json::Value = ctx.payload().decode_json().map_err(|e| TaskFailure::permanent(e.to_string()))?;
            let x = input["x"].as_i64().unwrap_or_default();
            Payload::json(&json!({ "y": x * 2 })).map_err(|e| TaskFailure::permanent(e.to_string()))
        });

        let id = p.coordinator.submit(Payload::json(&json!({ "x": 1 })).unwrap()).await.unwrap();
        assert_eq!(p.coordinator.get_status(id).await.unwrap().state, JobState::Pending);

        let handle = WorkerPool::new(p.coordinator.clone(), registry).spawn(pool_config(2));
        assert_eq!(wait_for_terminal(&p.coordinator, id).await, JobState::Succeeded);

        let status = p.coordinator.get_status(id).await.unwrap();
        let result: serde_json::Value = status.result.unwrap().decode_json().unwrap();
        assert_eq!(result, json!({ "y": 2 }));
        assert_eq!(status.attempt_count, 1);
        assert!(status.error.is_none());
        handle.shutdown().await;

        let depth = p.broker.depth();
        assert_eq!(depth.ready + depth.in_flight + depth.delayed, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn always_failing_job_stops_after_max_attempts() {
        let p = pipeline(3, Duration::from_secs(30));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut registry = HandlerRegistry::new();
        registry.register_fn("*", move |_ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(TaskFailure::transient("downstream unavailable")) }
        });
        let handle = WorkerPool::new(p.coordinator.clone(), registry).spawn(pool_config(1));

        let id = p.coordinator.submit(Payload::empty()).await.unwrap();
        assert_eq!(wait_for_terminal(&p.coordinator, id).await, JobState::Failed);

        let status = p.coordinator.get_status(id).await.unwrap();
        assert_eq!(status.attempt_count, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let error = status.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Transient);
        assert_eq!(error.attempt, 3);
        handle.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn duplicate_deliveries_execute_once() {
        let p = pipeline(3, Duration::from_secs(30));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut registry = HandlerRegistry::new();
        registry.register_fn("*", move |_ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(Payload::empty()) }
        });

        let id = p.coordinator.submit(Payload::empty()).await.unwrap();
        // Two extra copies of the same message, as a redelivering broker would produce.
        p.broker.enqueue(id, 0).await.unwrap();
        p.broker.enqueue(id, 0).await.unwrap();

        let handle = WorkerPool::new(p.coordinator.clone(), registry).spawn(pool_config(3));
        assert_eq!(wait_for_terminal(&p.coordinator, id).await, JobState::Succeeded);

        // Let the pool drain the duplicates.
        for _ in 0..100 {
            if handle.stats().skipped == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(handle.stats().skipped, 2);
        assert_eq!(p.coordinator.get_status(id).await.unwrap().attempt_count, 1);
        handle.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn crashed_executor_is_recovered_by_the_reaper() {
        let p = pipeline(3, Duration::from_millis(30));

        let id = p.coordinator.submit(Payload::empty()).await.unwrap();
        let message = p.coordinator.next_message(Duration::from_millis(50)).await.unwrap().unwrap();
        let Dispatch::Execute(_crashed) = p.coordinator.on_dequeue(&message, WorkerId::new()).await.unwrap()
        else {
            panic!("expected a claim");
        };
        // The executor dies here: no heartbeat, no outcome, no ack.

        let reaper = Reaper::new(p.coordinator.clone(), Duration::from_millis(20)).spawn();
        let mut registry = HandlerRegistry::new();
        registry.register_fn("*", |_ctx| async { Ok(Payload::empty()) });
        let pool = WorkerPool::new(p.coordinator.clone(), registry).spawn(pool_config(1));

        assert_eq!(wait_for_terminal(&p.coordinator, id).await, JobState::Succeeded);
        let job = p.store.get_job(id).await.unwrap();
        assert_eq!(job.attempt_count, 2);
        assert_eq!(job.last_error.unwrap().kind, ErrorKind::Abandoned);

        pool.shutdown().await;
        reaper.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn lost_enqueue_is_recovered_as_an_orphan() {
        let p = pipeline(3, Duration::from_secs(30));
        p.broker.set_available(false);
        let id = p.coordinator.submit(Payload::empty()).await.unwrap();
        p.broker.set_available(true);
        assert_eq!(p.broker.depth().ready, 0);

        let reaper = Reaper::new(p.coordinator.clone(), Duration::from_millis(20)).spawn();
        let mut registry = HandlerRegistry::new();
        registry.register_fn("*", |_ctx| async { Ok(Payload::empty()) });
        let pool = WorkerPool::new(p.coordinator.clone(), registry).spawn(pool_config(1));

        assert_eq!(wait_for_terminal(&p.coordinator, id).await, JobState::Succeeded);
        pool.shutdown().await;
        reaper.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn burst_of_jobs_is_processed_exactly_once() {
        let p = pipeline(3, Duration::from_secs(30));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut registry = HandlerRegistry::new();
        registry.register_fn("*", move |_ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_millis(2)).await;
                Ok(Payload::empty())
            }
        });
        let handle = WorkerPool::new(p.coordinator.clone(), registry).spawn(pool_config(8));

        let mut ids = Vec::new();
        for _ in 0..50 {
            ids.push(p.coordinator.submit(Payload::empty()).await.unwrap());
        }
        for id in &ids {
            assert_eq!(wait_for_terminal(&p.coordinator, *id).await, JobState::Succeeded);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 50);
        let stats = p.coordinator.stats().await.unwrap();
        assert_eq!(stats.total(), 50);
        assert_eq!(handle.stats().succeeded, 50);
        handle.shutdown().await;
    }
}
