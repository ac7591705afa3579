//! Live-update fan-out.
//!
//! One coordinator task owns the subscriber set. Register, unregister,
//! broadcast and shutdown all arrive through its intake and are handled one
//! at a time, so membership changes and deliveries are totally ordered.
//!
//! Each subscriber gets a bounded outbound buffer. A broadcast that finds a
//! buffer full evicts that subscriber instead of waiting for it.

mod socket;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use serde::Serialize;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};

use crate::{
    config::HubConfig,
    eid::Eid,
    pipeline::{CompletedItem, CompletionSink},
};

pub use socket::{pump, serve_socket};

/// Text frame pushed to clients when an item becomes ready.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: u64,
    pub title: String,
    pub tags: Vec<String>,
    pub thumbnail_url: String,
}

impl From<&CompletedItem> for LiveMessage {
    fn from(item: &CompletedItem) -> Self {
        Self {
            kind: "thumbnail_ready".to_string(),
            id: item.id,
            title: item.title.clone(),
            tags: item.tags.clone(),
            thumbnail_url: item.thumbnail_url.clone(),
        }
    }
}

enum Command {
    Register(Eid, mpsc::Sender<String>),
    Unregister(Eid),
    Broadcast(String),
    Count(oneshot::Sender<usize>),
}

#[derive(Clone)]
pub struct Hub {
    intake: mpsc::Sender<Command>,
    shutdown: Arc<watch::Sender<bool>>,
    coordinator: Arc<Mutex<Option<JoinHandle<()>>>>,
    subscriber_buffer: usize,
}

impl Hub {
    /// Spawn the coordinator on the current tokio runtime.
    pub fn start(config: &HubConfig) -> Self {
        let (intake, intake_rx) = mpsc::channel(config.intake_capacity);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let coordinator = tokio::spawn(coordinate(intake_rx, shutdown_rx));

        Self {
            intake,
            shutdown: Arc::new(shutdown),
            coordinator: Arc::new(Mutex::new(Some(coordinator))),
            subscriber_buffer: config.subscriber_buffer,
        }
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Add a subscriber. Returns its id and the receiving end of its
    /// outbound buffer, or `None` once the hub is shut down.
    pub async fn register(&self) -> Option<(Eid, mpsc::Receiver<String>)> {
        if self.is_shut_down() {
            return None;
        }

        let id = Eid::new();
        let (tx, rx) = mpsc::channel(self.subscriber_buffer);

        self.intake
            .send(Command::Register(id, tx))
            .await
            .ok()?;

        Some((id, rx))
    }

    /// Remove a subscriber and close its buffer. Unknown or already removed
    /// ids are ignored.
    pub async fn unregister(&self, id: Eid) {
        let _ = self.intake.send(Command::Unregister(id)).await;
    }

    /// Hand a message to the coordinator. Dropped after shutdown.
    pub async fn broadcast(&self, message: &LiveMessage) {
        if self.is_shut_down() {
            return;
        }

        match serde_json::to_string(message) {
            Ok(text) => {
                let _ = self.intake.send(Command::Broadcast(text)).await;
            }
            Err(err) => log::error!("couldnt encode live message: {err}"),
        }
    }

    /// `broadcast` for callers outside the async runtime, such as pipeline
    /// workers.
    pub fn broadcast_blocking(&self, message: &LiveMessage) {
        if self.is_shut_down() {
            return;
        }

        match serde_json::to_string(message) {
            Ok(text) => {
                let _ = self.intake.blocking_send(Command::Broadcast(text));
            }
            Err(err) => log::error!("couldnt encode live message: {err}"),
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.intake.send(Command::Count(tx)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Close every subscriber and stop the coordinator. Safe to call more
    /// than once.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);

        let handle = match self.coordinator.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                log::error!("hub coordinator failed: {err}");
            }
        }
    }
}

impl CompletionSink for Hub {
    fn item_completed(&self, item: &CompletedItem) {
        self.broadcast_blocking(&LiveMessage::from(item));
    }
}

async fn coordinate(mut intake: mpsc::Receiver<Command>, mut shutdown: watch::Receiver<bool>) {
    let mut subscribers: HashMap<Eid, mpsc::Sender<String>> = HashMap::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            command = intake.recv() => {
                let Some(command) = command else {
                    break;
                };

                match command {
                    Command::Register(id, tx) => {
                        subscribers.insert(id, tx);
                        log::info!("live client connected, total: {}", subscribers.len());
                    }
                    Command::Unregister(id) => {
                        // dropping the sender closes the buffer
                        if subscribers.remove(&id).is_some() {
                            log::info!("live client disconnected, total: {}", subscribers.len());
                        }
                    }
                    Command::Broadcast(text) => {
                        subscribers.retain(|id, tx| match tx.try_send(text.clone()) {
                            Ok(()) => true,
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                log::warn!("live client {id} is not keeping up, evicting");
                                false
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => false,
                        });
                    }
                    Command::Count(reply) => {
                        let _ = reply.send(subscribers.len());
                    }
                }
            }
        }
    }

    let closed = subscribers.len();
    subscribers.clear();
    log::info!("hub stopped, closed {closed} live clients");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: u64) -> LiveMessage {
        LiveMessage::from(&CompletedItem {
            id,
            title: format!("item {id}"),
            tags: vec!["cat".to_string()],
            thumbnail_url: format!("/thumbnails/thumb_{id}.webp"),
        })
    }

    fn small_hub(buffer: usize) -> Hub {
        Hub::start(&HubConfig {
            subscriber_buffer: buffer,
            intake_capacity: 8,
        })
    }

    #[test]
    fn test_live_message_json() {
        let json = serde_json::to_value(message(7)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "thumbnail_ready",
                "id": 7,
                "title": "item 7",
                "tags": ["cat"],
                "thumbnail_url": "/thumbnails/thumb_7.webp",
            })
        );
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_subscriber_in_order() {
        let hub = small_hub(8);
        let (_, mut a) = hub.register().await.unwrap();
        let (_, mut b) = hub.register().await.unwrap();

        hub.broadcast(&message(1)).await;
        hub.broadcast(&message(2)).await;

        for rx in [&mut a, &mut b] {
            let first: serde_json::Value =
                serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
            let second: serde_json::Value =
                serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
            assert_eq!(first["id"], 1);
            assert_eq!(second["id"], 2);
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_evicted() {
        let hub = small_hub(1);
        let (_, mut a) = hub.register().await.unwrap();
        let (_, mut b) = hub.register().await.unwrap();
        let (_, mut slow) = hub.register().await.unwrap();

        hub.broadcast(&message(1)).await;
        a.recv().await.unwrap();
        b.recv().await.unwrap();

        // `slow` still holds message 1, so message 2 overflows its buffer
        hub.broadcast(&message(2)).await;

        assert!(a.recv().await.unwrap().contains("\"id\":2"));
        assert!(b.recv().await.unwrap().contains("\"id\":2"));
        assert_eq!(hub.subscriber_count().await, 2);

        assert!(slow.recv().await.unwrap().contains("\"id\":1"));
        assert!(slow.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unregister_twice_is_harmless() {
        let hub = small_hub(4);
        let (id, mut rx) = hub.register().await.unwrap();
        let (_, _other) = hub.register().await.unwrap();

        hub.unregister(id).await;
        hub.unregister(id).await;

        assert!(rx.recv().await.is_none());
        assert_eq!(hub.subscriber_count().await, 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_subscribers_and_ignores_broadcasts() {
        let hub = small_hub(4);
        let (_, mut rx) = hub.register().await.unwrap();

        hub.shutdown().await;
        hub.shutdown().await;

        assert!(rx.recv().await.is_none());
        assert!(hub.is_shut_down());

        hub.broadcast(&message(1)).await;
        assert!(hub.register().await.is_none());
        assert_eq!(hub.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_blocking_broadcast_from_worker_thread() {
        let hub = small_hub(4);
        let (_, mut rx) = hub.register().await.unwrap();

        let sink = hub.clone();
        std::thread::spawn(move || {
            sink.item_completed(&CompletedItem {
                id: 3,
                title: "x".to_string(),
                tags: vec![],
                thumbnail_url: "/thumbnails/thumb_3.webp".to_string(),
            })
        })
        .join()
        .unwrap();

        assert!(rx.recv().await.unwrap().contains("thumbnail_ready"));

        hub.shutdown().await;
        // no panic and no block once the coordinator is gone
        std::thread::spawn(move || hub.broadcast_blocking(&message(4)))
            .join()
            .unwrap();
    }
}
