//! Fan-out of store changes to every registered observer
//!
//! Each observer gets its own ordered queue. Notifications are pushed into
//! every queue in the order the store applied them, so per-field order holds
//! for each observer. The authority registers its own local observer through
//! the same path as remote ones.

use log::{debug, info};
use shared::{ChangeNotification, ParticipantId};
use std::collections::BTreeMap;
use tokio::sync::mpsc;

/// Receiving end of one observer's notification queue
#[derive(Debug)]
pub struct Subscription {
    observer: ParticipantId,
    receiver: mpsc::UnboundedReceiver<ChangeNotification>,
}

impl Subscription {
    pub fn observer(&self) -> ParticipantId {
        self.observer
    }

    pub fn try_next(&mut self) -> Option<ChangeNotification> {
        self.receiver.try_recv().ok()
    }

    /// Takes every notification queued so far
    pub fn drain(&mut self) -> Vec<ChangeNotification> {
        let mut drained = Vec::new();
        while let Ok(notification) = self.receiver.try_recv() {
            drained.push(notification);
        }
        drained
    }

    pub async fn recv(&mut self) -> Option<ChangeNotification> {
        self.receiver.recv().await
    }
}

pub struct ReplicationBroadcaster {
    feed: mpsc::UnboundedReceiver<ChangeNotification>,
    observers: BTreeMap<ParticipantId, mpsc::UnboundedSender<ChangeNotification>>,
    published: u64,
}

impl ReplicationBroadcaster {
    /// Creates a broadcaster that drains `feed`, the store's change feed
    pub fn new(feed: mpsc::UnboundedReceiver<ChangeNotification>) -> Self {
        Self {
            feed,
            observers: BTreeMap::new(),
            published: 0,
        }
    }

    /// Registers an observer, replacing any previous queue it had
    pub fn register_observer(&mut self, observer: ParticipantId) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        if self.observers.insert(observer, sender).is_some() {
            info!("Observer {} re-registered, old queue dropped", observer);
        } else {
            info!("Observer {} registered", observer);
        }
        Subscription { observer, receiver }
    }

    /// Drops an observer's queue along with anything still undelivered
    pub fn unregister_observer(&mut self, observer: ParticipantId) -> bool {
        let removed = self.observers.remove(&observer).is_some();
        if removed {
            info!("Observer {} unregistered", observer);
        }
        removed
    }

    pub fn is_registered(&self, observer: ParticipantId) -> bool {
        self.observers.contains_key(&observer)
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Total notifications fanned out since creation
    pub fn published(&self) -> u64 {
        self.published
    }

    /// Drains the change feed and fans each notification out to every
    /// observer, returning how many notifications were published
    pub fn pump(&mut self) -> usize {
        let mut count = 0;
        while let Ok(notification) = self.feed.try_recv() {
            self.fan_out(&notification);
            count += 1;
        }
        self.published += count as u64;
        count
    }

    /// Queues a notification for one observer only
    pub fn send_to(&mut self, observer: ParticipantId, notification: ChangeNotification) -> bool {
        let delivered = match self.observers.get(&observer) {
            Some(sender) => sender.send(notification).is_ok(),
            None => false,
        };
        if !delivered && self.observers.remove(&observer).is_some() {
            debug!("Observer {} queue closed, removed", observer);
        }
        delivered
    }

    fn fan_out(&mut self, notification: &ChangeNotification) {
        let mut closed = Vec::new();
        for (observer, sender) in &self.observers {
            if sender.send(notification.clone()).is_err() {
                closed.push(*observer);
            }
        }
        for observer in closed {
            debug!("Observer {} queue closed, removed", observer);
            self.observers.remove(&observer);
        }
    }
}
