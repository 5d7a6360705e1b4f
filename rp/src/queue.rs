// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Work queue connecting the HTTP frontend to the background worker
//!
//! Delivery is at-least-once: a dequeued message becomes invisible for a
//! lease period and reappears if the consumer neither finishes it nor
//! extends the lease in time.  Consumers see how many times a message has
//! been delivered and give up on messages that keep coming back.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;
use terrane_common::provisioning::OperationRequest;
use terrane_common::Error;

/// A dequeued message holding a leased [`OperationRequest`].
#[derive(Clone, Debug)]
pub struct QueueMessage {
    /// Queue-assigned message identifier, used to finish or extend it.
    pub id: u64,
    /// Number of times this message has been delivered, this one included.
    pub dequeue_count: u32,
    pub request: OperationRequest,
}

#[async_trait]
pub trait Queue: Send + Sync {
    /// Adds a message to the queue.  A nonzero `delay` keeps the message
    /// invisible to consumers until it elapses.
    async fn enqueue(
        &self,
        request: &OperationRequest,
        delay: Duration,
    ) -> Result<(), Error>;

    /// Returns the next visible message, leasing it for `visibility`.
    /// Returns `None` when no message is currently visible.
    async fn dequeue(
        &self,
        visibility: Duration,
    ) -> Result<Option<QueueMessage>, Error>;

    /// Extends the lease on a previously dequeued message.
    async fn extend(
        &self,
        message: &QueueMessage,
        visibility: Duration,
    ) -> Result<(), Error>;

    /// Removes a message from the queue for good.  Finishing a message
    /// that has already been removed is a no-op.
    async fn finish(&self, message: &QueueMessage) -> Result<(), Error>;
}

struct QueueEntry {
    request: OperationRequest,
    dequeue_count: u32,
    visible_at: Instant,
}

/// In-memory [`Queue`] used by the simulated deployment and by tests
///
/// Tests exercising failure handling can make `enqueue` fail on demand
/// with [`InMemoryQueue::set_enqueue_error`].
pub struct InMemoryQueue {
    entries: Mutex<BTreeMap<u64, QueueEntry>>,
    next_id: Mutex<u64>,
    enqueue_error: AtomicBool,
}

impl InMemoryQueue {
    pub fn new() -> InMemoryQueue {
        InMemoryQueue {
            entries: Mutex::new(BTreeMap::new()),
            next_id: Mutex::new(0),
            enqueue_error: AtomicBool::new(false),
        }
    }

    /// When set, subsequent `enqueue` calls fail with an internal error.
    pub fn set_enqueue_error(&self, fail: bool) {
        self.enqueue_error.store(fail, Ordering::SeqCst);
    }

    /// Number of messages currently in the queue, leased or not.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Queue for InMemoryQueue {
    async fn enqueue(
        &self,
        request: &OperationRequest,
        delay: Duration,
    ) -> Result<(), Error> {
        if self.enqueue_error.load(Ordering::SeqCst) {
            return Err(Error::internal_error("queue unavailable"));
        }
        let id = {
            let mut next_id = self.next_id.lock().unwrap();
            *next_id += 1;
            *next_id
        };
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            id,
            QueueEntry {
                request: request.clone(),
                dequeue_count: 0,
                visible_at: Instant::now() + delay,
            },
        );
        Ok(())
    }

    async fn dequeue(
        &self,
        visibility: Duration,
    ) -> Result<Option<QueueMessage>, Error> {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        // BTreeMap iteration gives us oldest-first delivery.
        let Some((&id, entry)) =
            entries.iter_mut().find(|(_, entry)| entry.visible_at <= now)
        else {
            return Ok(None);
        };
        entry.dequeue_count += 1;
        entry.visible_at = now + visibility;
        Ok(Some(QueueMessage {
            id,
            dequeue_count: entry.dequeue_count,
            request: entry.request.clone(),
        }))
    }

    async fn extend(
        &self,
        message: &QueueMessage,
        visibility: Duration,
    ) -> Result<(), Error> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(&message.id) {
            Some(entry) => {
                entry.visible_at = Instant::now() + visibility;
                Ok(())
            }
            None => Err(Error::invalid_request(format!(
                "message {} is no longer in the queue",
                message.id
            ))),
        }
    }

    async fn finish(&self, message: &QueueMessage) -> Result<(), Error> {
        let mut entries = self.entries.lock().unwrap();
        entries.remove(&message.id);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::InMemoryQueue;
    use super::Queue;
    use std::time::Duration;
    use terrane_common::provisioning::OperationKind;
    use terrane_common::provisioning::OperationRequest;
    use terrane_common::Error;

    fn request() -> OperationRequest {
        OperationRequest {
            operation_id: uuid::Uuid::new_v4(),
            resource_id: "/planes/terrane/local/resourceGroups/rg1/providers/\
                 Terrane.Sim/machines/m1"
                .parse()
                .unwrap(),
            kind: OperationKind::Put,
            api_version: "2025-01-01".to_string(),
            timeout_secs: 120,
        }
    }

    #[tokio::test]
    async fn test_lease_hides_message() {
        let queue = InMemoryQueue::new();
        queue.enqueue(&request(), Duration::ZERO).await.unwrap();

        let message =
            queue.dequeue(Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(message.dequeue_count, 1);

        // Leased: nothing else is visible.
        assert!(queue.dequeue(Duration::from_secs(60)).await.unwrap().is_none());

        queue.finish(&message).await.unwrap();
        assert!(queue.is_empty());
        // Finishing twice is harmless.
        queue.finish(&message).await.unwrap();
    }

    #[tokio::test]
    async fn test_redelivery_after_lease_expiry() {
        let queue = InMemoryQueue::new();
        queue.enqueue(&request(), Duration::ZERO).await.unwrap();

        let first =
            queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        // The zero-length lease has already expired, so the message is
        // delivered again with a bumped dequeue count.
        let second =
            queue.dequeue(Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.dequeue_count, 2);
    }

    #[tokio::test]
    async fn test_extend_keeps_message_leased() {
        let queue = InMemoryQueue::new();
        queue.enqueue(&request(), Duration::ZERO).await.unwrap();

        let message = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        queue.extend(&message, Duration::from_secs(60)).await.unwrap();
        assert!(queue.dequeue(Duration::from_secs(60)).await.unwrap().is_none());

        queue.finish(&message).await.unwrap();
        let err = queue
            .extend(&message, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn test_enqueue_error_injection() {
        let queue = InMemoryQueue::new();
        queue.set_enqueue_error(true);
        let err = queue.enqueue(&request(), Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, Error::InternalError { .. }));
        queue.set_enqueue_error(false);
        queue.enqueue(&request(), Duration::ZERO).await.unwrap();
    }

    #[tokio::test]
    async fn test_delayed_enqueue() {
        let queue = InMemoryQueue::new();
        queue
            .enqueue(&request(), Duration::from_millis(50))
            .await
            .unwrap();

        assert!(queue.dequeue(Duration::from_secs(60)).await.unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(75)).await;
        assert!(queue.dequeue(Duration::from_secs(60)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_oldest_first_delivery() {
        let queue = InMemoryQueue::new();
        let first = request();
        let second = request();
        queue.enqueue(&first, Duration::ZERO).await.unwrap();
        queue.enqueue(&second, Duration::ZERO).await.unwrap();

        let message =
            queue.dequeue(Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(message.request.operation_id, first.operation_id);
    }
}
