//! In-memory broker for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::Instant;

use jobforge_core::{DeliveryToken, JobId, MessageHandle, TaskMessage};

use super::{Broker, BrokerError};

/// Default visibility window for in-flight messages.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct InFlight {
    message: TaskMessage,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct Queues {
    next_seq: u64,
    ready: VecDeque<TaskMessage>,
    in_flight: HashMap<DeliveryToken, InFlight>,
    delayed: Vec<(Instant, TaskMessage)>,
}

impl Queues {
    /// Move due delayed messages and expired deliveries back to `ready`.
    fn promote(&mut self, now: Instant) {
        let (due, later): (Vec<_>, Vec<_>) = self.delayed.drain(..).partition(|(at, _)| *at <= now);
        self.delayed = later;
        self.ready.extend(due.into_iter().map(|(_, m)| m));

        let expired: Vec<DeliveryToken> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(token, _)| token.clone())
            .collect();
        for token in expired {
            if let Some(f) = self.in_flight.remove(&token) {
                tracing::debug!(job_id = %f.message.job_id, token = %token, "visibility timeout expired, redelivering");
                self.ready.push_back(f.message);
            }
        }
    }

    /// Earliest instant at which something becomes deliverable.
    fn next_wakeup(&self) -> Option<Instant> {
        let delayed = self.delayed.iter().map(|(at, _)| *at);
        let in_flight = self.in_flight.values().map(|f| f.deadline);
        delayed.chain(in_flight).min()
    }

    fn schedule(&mut self, message: TaskMessage, delay: Duration, now: Instant) {
        if delay.is_zero() {
            self.ready.push_back(message);
        } else {
            self.delayed.push((now + delay, message));
        }
    }
}

/// Queue depth snapshot, for tests and diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerDepth {
    pub ready: usize,
    pub in_flight: usize,
    pub delayed: usize,
}

/// In-memory broker.
///
/// - FIFO ready queue
/// - Delivery tokens are stable across redeliveries of the same message
/// - In-flight messages return to the queue after the visibility timeout
#[derive(Debug)]
pub struct InMemoryBroker {
    queues: Mutex<Queues>,
    notify: Notify,
    visibility_timeout: Duration,
    available: AtomicBool,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_visibility_timeout(DEFAULT_VISIBILITY_TIMEOUT)
    }

    pub fn with_visibility_timeout(visibility_timeout: Duration) -> Self {
        Self {
            queues: Mutex::new(Queues::default()),
            notify: Notify::new(),
            visibility_timeout,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: every operation fails with `Unavailable` while off.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn depth(&self) -> BrokerDepth {
        match self.queues.lock() {
            Ok(q) => BrokerDepth {
                ready: q.ready.len(),
                in_flight: q.in_flight.len(),
                delayed: q.delayed.len(),
            },
            Err(_) => BrokerDepth::default(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Queues>, BrokerError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("in-memory broker is offline".to_string()));
        }
        self.queues
            .lock()
            .map_err(|_| BrokerError::Command("broker queue lock poisoned".to_string()))
    }

    /// Pop the next deliverable message, or report when to look again.
    fn try_take(&self) -> Result<Result<TaskMessage, Option<Instant>>, BrokerError> {
        let mut q = self.lock()?;
        let now = Instant::now();
        q.promote(now);

        match q.ready.pop_front() {
            Some(message) => {
                q.in_flight.insert(
                    message.token.clone(),
                    InFlight {
                        message: message.clone(),
                        deadline: now + self.visibility_timeout,
                    },
                );
                Ok(Ok(message))
            }
            None => Ok(Err(q.next_wakeup())),
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn enqueue(&self, job_id: JobId, attempt: u32) -> Result<MessageHandle, BrokerError> {
        let handle = {
            let mut q = self.lock()?;
            q.next_seq += 1;
            let token = DeliveryToken::new(format!("mem-{}", q.next_seq));
            let message = TaskMessage::new(job_id, attempt, Utc::now()).with_token(token);
            let handle = message.handle();
            q.ready.push_back(message);
            handle
        };
        self.notify.notify_one();
        Ok(handle)
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<TaskMessage>, BrokerError> {
        let give_up = Instant::now() + timeout;

        loop {
            let wake_at = match self.try_take()? {
                Ok(message) => return Ok(Some(message)),
                Err(next) => next.map_or(give_up, |at| at.min(give_up)),
            };
            if Instant::now() >= give_up {
                return Ok(None);
            }

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, handle: &MessageHandle) -> Result<(), BrokerError> {
        let mut q = self.lock()?;
        q.in_flight.remove(&handle.token);
        Ok(())
    }

    async fn nack(&self, handle: &MessageHandle, delay: Duration) -> Result<(), BrokerError> {
        {
            let mut q = self.lock()?;
            let now = Instant::now();
            let message = match q.in_flight.remove(&handle.token) {
                Some(f) => f.message,
                None => {
                    // Drop a queued redelivery of the same token before rescheduling.
                    q.ready.retain(|m| m.token != handle.token);
                    TaskMessage::new(handle.job_id, 0, Utc::now()).with_token(handle.token.clone())
                }
            };
            q.schedule(message, delay, now);
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        self.lock().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_fifo_order() {
        let broker = InMemoryBroker::new();
        let first = JobId::new();
        let second = JobId::new();
        broker.enqueue(first, 0).await.unwrap();
        broker.enqueue(second, 0).await.unwrap();

        let a = broker.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        let b = broker.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(a.job_id, first);
        assert_eq!(b.job_id, second);
        assert_ne!(a.token, b.token);
    }

    #[tokio::test]
    async fn empty_queue_times_out() {
        let broker = InMemoryBroker::new();
        let got = broker.dequeue(Duration::from_millis(20)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn waiting_consumer_is_woken_by_enqueue() {
        let broker = std::sync::Arc::new(InMemoryBroker::new());
        let consumer = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.dequeue(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let job_id = JobId::new();
        broker.enqueue(job_id, 0).await.unwrap();

        let got = consumer.await.unwrap().unwrap().unwrap();
        assert_eq!(got.job_id, job_id);
    }

    #[tokio::test]
    async fn acked_message_is_not_redelivered() {
        let broker = InMemoryBroker::with_visibility_timeout(Duration::from_millis(20));
        broker.enqueue(JobId::new(), 0).await.unwrap();

        let msg = broker.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        broker.ack(&msg.handle()).await.unwrap();

        assert!(broker.dequeue(Duration::from_millis(60)).await.unwrap().is_none());
        assert_eq!(broker.depth(), BrokerDepth::default());
    }

    #[tokio::test]
    async fn unacked_message_is_redelivered_with_the_same_token() {
        let broker = InMemoryBroker::with_visibility_timeout(Duration::from_millis(20));
        broker.enqueue(JobId::new(), 0).await.unwrap();

        let first = broker.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        let again = broker.dequeue(Duration::from_millis(200)).await.unwrap().unwrap();
        assert_eq!(first.job_id, again.job_id);
        assert_eq!(first.token, again.token);
    }

    #[tokio::test]
    async fn nack_redelivers_after_delay() {
        let broker = InMemoryBroker::new();
        broker.enqueue(JobId::new(), 1).await.unwrap();
        let msg = broker.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();

        broker.nack(&msg.handle(), Duration::from_millis(50)).await.unwrap();
        assert_eq!(broker.depth().delayed, 1);
        assert!(broker.dequeue(Duration::from_millis(5)).await.unwrap().is_none());

        let again = broker.dequeue(Duration::from_millis(500)).await.unwrap().unwrap();
        assert_eq!(again.job_id, msg.job_id);
        assert_eq!(again.attempt, 1);
    }

    #[tokio::test]
    async fn nack_of_released_handle_schedules_a_fresh_message() {
        let broker = InMemoryBroker::new();
        let handle = broker.enqueue(JobId::new(), 0).await.unwrap();
        let msg = broker.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        broker.ack(&msg.handle()).await.unwrap();

        broker.nack(&handle, Duration::ZERO).await.unwrap();
        let again = broker.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(again.job_id, handle.job_id);
    }

    #[tokio::test]
    async fn offline_broker_is_transient() {
        let broker = InMemoryBroker::new();
        broker.set_available(false);
        let err = broker.enqueue(JobId::new(), 0).await.unwrap_err();
        assert!(err.is_transient());
        assert!(broker.ping().await.is_err());

        broker.set_available(true);
        assert!(broker.ping().await.is_ok());
    }
}
