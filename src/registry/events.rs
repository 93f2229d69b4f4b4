//! Fan-out of mapping events to token-scoped subscribers.
//!
//! Each subscription gets a sequence id, its own bounded channel and the
//! cancellation token that governs it. Emission visits subscribers in id
//! order and blocks on each send until the subscriber accepts the event or
//! its token fires. Retired subscribers are purged under the same lock the
//! emission pass holds, so a purge can never race a new subscription.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use log::debug;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::SubscriptionClosed;
use crate::types::MappingEvent;

/// Receiving half of a subscription.
///
/// `events` yields every event emitted after subscribing, in order, and is
/// closed once the subscription is retired; `closed` then resolves with the
/// reason.
#[derive(Debug)]
pub struct Subscription {
    pub id: u64,
    pub events: mpsc::Receiver<MappingEvent>,
    pub closed: oneshot::Receiver<SubscriptionClosed>,
}

impl Subscription {
    /// Waits for the retirement cause.
    pub async fn cause(self) -> SubscriptionClosed {
        self.closed
            .await
            .unwrap_or(SubscriptionClosed::RegistryDropped)
    }
}

struct Subscriber {
    events: mpsc::Sender<MappingEvent>,
    closed: Option<oneshot::Sender<SubscriptionClosed>>,
    token: CancellationToken,
    // Stops the reaper task once the subscriber is gone for any reason.
    retired: CancellationToken,
}

impl Subscriber {
    fn retire(mut self, cause: SubscriptionClosed) {
        if let Some(tx) = self.closed.take() {
            let _ = tx.send(cause);
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.retired.cancel();
    }
}

pub struct EventBus {
    subscribers: Mutex<BTreeMap<u64, Subscriber>>,
    next_id: AtomicU64,
    buffer: usize,
}

impl EventBus {
    /// `buffer` is the per-subscriber channel capacity; a full channel
    /// blocks emission.
    pub fn new(buffer: usize) -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        })
    }

    /// Registers a subscription that lives until `token` is canceled or the
    /// returned receiver is dropped.
    pub async fn subscribe(self: &Arc<Self>, token: CancellationToken) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (events_tx, events_rx) = mpsc::channel(self.buffer);
        let (closed_tx, closed_rx) = oneshot::channel();
        let retired = CancellationToken::new();

        self.subscribers.lock().await.insert(
            id,
            Subscriber {
                events: events_tx,
                closed: Some(closed_tx),
                token: token.clone(),
                retired: retired.clone(),
            },
        );
        debug!("event subscription {} registered", id);

        // Retire promptly on cancellation instead of waiting for the next
        // emission pass to notice.
        let bus: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    if let Some(bus) = bus.upgrade() {
                        bus.retire(id, SubscriptionClosed::Canceled).await;
                    }
                }
                _ = retired.cancelled() => {}
            }
        });

        Subscription {
            id,
            events: events_rx,
            closed: closed_rx,
        }
    }

    /// Delivers `event` to every live subscriber, then purges the ones that
    /// were found canceled or gone.
    pub async fn emit(&self, event: MappingEvent) {
        let mut subscribers = self.subscribers.lock().await;
        let mut disposable = Vec::new();

        for (id, sub) in subscribers.iter() {
            if sub.token.is_cancelled() {
                disposable.push((*id, SubscriptionClosed::Canceled));
                continue;
            }
            tokio::select! {
                biased;
                _ = sub.token.cancelled() => {
                    disposable.push((*id, SubscriptionClosed::Canceled));
                }
                sent = sub.events.send(event.clone()) => {
                    if sent.is_err() {
                        disposable.push((*id, SubscriptionClosed::ReceiverDropped));
                    }
                }
            }
        }

        for (id, cause) in disposable {
            if let Some(sub) = subscribers.remove(&id) {
                debug!("event subscription {} retired: {}", id, cause);
                sub.retire(cause);
            }
        }
    }

    async fn retire(&self, id: u64, cause: SubscriptionClosed) {
        if let Some(sub) = self.subscribers.lock().await.remove(&id) {
            debug!("event subscription {} retired: {}", id, cause);
            sub.retire(cause);
        }
    }

    #[cfg(test)]
    pub(crate) async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }
}
