use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{PlayerListener, PlayerState};
use crate::core::lock;

struct Pending {
    state: Option<PlayerState>,
    seq: u64,
    closed: bool,
}

struct Shared {
    pending: Mutex<Pending>,
    wake: Notify,
}

/// Delivers snapshots to the listener from a dedicated task.
///
/// At most one delivery is in flight. Snapshots queued meanwhile collapse
/// into the newest one, which inherits the undelivered messages of the
/// snapshots it replaces. Messages from before a seek are dropped.
pub(crate) struct Emitter {
    shared: Arc<Shared>,
    queued: u64,
    delivered: watch::Receiver<u64>,
    task: Option<JoinHandle<()>>,
}

impl Emitter {
    pub fn new(listener: Arc<dyn PlayerListener>) -> Self {
        let shared = Arc::new(Shared {
            pending: Mutex::new(Pending {
                state: None,
                seq: 0,
                closed: false,
            }),
            wake: Notify::new(),
        });
        let (delivered_tx, delivered) = watch::channel(0);
        let task = tokio::spawn(deliver(shared.clone(), listener, delivered_tx));
        Self {
            shared,
            queued: 0,
            delivered,
            task: Some(task),
        }
    }

    pub fn queue(&mut self, mut state: PlayerState) {
        self.queued += 1;
        {
            let mut pending = lock(&self.shared.pending);
            let older = pending.state.take().and_then(|previous| previous.active_data);
            if let (Some(older), Some(newer)) = (older, state.active_data.as_mut()) {
                if older.last_seek_time == newer.last_seek_time {
                    let mut messages = older.messages;
                    messages.append(&mut newer.messages);
                    newer.messages = messages;
                } else if !older.messages.is_empty() {
                    debug!("Dropping {} undelivered messages from before a seek", older.messages.len());
                }
            }
            pending.state = Some(state);
            pending.seq = self.queued;
        }
        self.shared.wake.notify_one();
    }

    /// Wait until everything queued so far has been delivered
    pub async fn flush(&mut self) {
        let target = self.queued;
        // Err only if the delivery task is gone; nothing left to wait for then.
        let _ = self.delivered.wait_for(|seq| *seq >= target).await;
    }

    /// Deliver what is pending, then stop the delivery task
    pub async fn shutdown(mut self) {
        lock(&self.shared.pending).closed = true;
        self.shared.wake.notify_one();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Snapshot delivery task failed: {}", e);
            }
        }
    }
}

async fn deliver(shared: Arc<Shared>, listener: Arc<dyn PlayerListener>, delivered: watch::Sender<u64>) {
    loop {
        let next = {
            let mut pending = lock(&shared.pending);
            match pending.state.take() {
                Some(state) => Some((state, pending.seq)),
                None if pending.closed => return,
                None => None,
            }
        };
        match next {
            Some((state, seq)) => {
                listener.on_state(state).await;
                delivered.send_replace(seq);
            }
            None => shared.wake.notified().await,
        }
    }
}

impl Drop for Emitter {
    fn drop(&mut self) {
        let mut pending = lock(&self.shared.pending);
        if !pending.closed {
            pending.closed = true;
            drop(pending);
            self.shared.wake.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{MessageEvent, Time};
    use crate::playback::{ActiveData, PlayerPresence, Progress};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn state(values: &[u64], seek_secs: i64) -> PlayerState {
        PlayerState {
            name: None,
            player_id: "player-test".into(),
            presence: PlayerPresence::Present,
            progress: Progress::default(),
            capabilities: Vec::new(),
            problems: Vec::new(),
            active_data: Some(ActiveData {
                messages: values
                    .iter()
                    .map(|v| MessageEvent::new("a", Time::new(*v, 0), json!(v)))
                    .collect(),
                total_bytes_received: 0,
                current_time: Time::new(values.last().copied().unwrap_or(0), 0),
                start_time: Time::ZERO,
                end_time: Time::new(100, 0),
                is_playing: true,
                speed: 1.0,
                last_seek_time: Utc.timestamp_opt(seek_secs, 0).unwrap(),
                topics: Vec::new(),
                topic_stats: Default::default(),
                datatypes: Default::default(),
                published_topics: Default::default(),
            }),
        }
    }

    /// Listener that blocks until released, to hold a delivery in flight
    struct Gated {
        gate: tokio::sync::Semaphore,
        tx: mpsc::UnboundedSender<PlayerState>,
    }

    #[async_trait]
    impl PlayerListener for Gated {
        async fn on_state(&self, state: PlayerState) {
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            let _ = self.tx.send(state);
        }
    }

    #[tokio::test]
    async fn test_delivers_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut emitter = Emitter::new(Arc::new(tx));
        emitter.queue(state(&[1], 0));
        emitter.flush().await;
        emitter.queue(state(&[2], 0));
        emitter.flush().await;

        assert_eq!(rx.recv().await.unwrap().current_time(), Some(Time::new(1, 0)));
        assert_eq!(rx.recv().await.unwrap().current_time(), Some(Time::new(2, 0)));
        emitter.shutdown().await;
    }

    #[tokio::test]
    async fn test_coalesces_without_losing_messages() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = Arc::new(Gated {
            gate: tokio::sync::Semaphore::new(0),
            tx,
        });
        let mut emitter = Emitter::new(listener.clone());

        emitter.queue(state(&[1], 0));
        tokio::time::sleep(Duration::from_millis(10)).await;
        // First delivery is now parked in the listener.
        emitter.queue(state(&[2], 0));
        emitter.queue(state(&[3, 4], 0));
        listener.gate.add_permits(10);
        emitter.flush().await;

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.messages().len(), 1);
        let values: Vec<u64> = second.messages().iter().map(|m| m.message.as_u64().unwrap()).collect();
        assert_eq!(values, vec![2, 3, 4]);
        assert_eq!(second.current_time(), Some(Time::new(4, 0)));
        assert!(rx.try_recv().is_err());
        emitter.shutdown().await;
    }

    #[tokio::test]
    async fn test_coalescing_drops_messages_from_before_a_seek() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = Arc::new(Gated {
            gate: tokio::sync::Semaphore::new(0),
            tx,
        });
        let mut emitter = Emitter::new(listener.clone());

        emitter.queue(state(&[1], 0));
        tokio::time::sleep(Duration::from_millis(10)).await;
        emitter.queue(state(&[2], 0));
        emitter.queue(state(&[50], 1));
        emitter.queue(state(&[51], 1));
        listener.gate.add_permits(10);
        emitter.flush().await;

        rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        let values: Vec<u64> = second.messages().iter().map(|m| m.message.as_u64().unwrap()).collect();
        assert_eq!(values, vec![50, 51]);
        assert!(rx.try_recv().is_err());
        emitter.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_delivers_pending() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut emitter = Emitter::new(Arc::new(tx));
        emitter.queue(state(&[7], 0));
        emitter.shutdown().await;
        assert!(rx.recv().await.is_some());
    }
}
