//! In-process work queue with the same delivery semantics as the Redis backend.
//!
//! Timing uses `tokio::time` so tests can drive visibility expiry with a
//! paused clock.

use std::collections::{BTreeMap, VecDeque};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use granule_common::{GranuleError, GranuleResult};

use crate::queue::{
    DeadLetter, Delivery, MessageId, QueueConfig, QueueDepth, WorkQueue, MAX_RECEIVES_EXCEEDED,
};

struct Entry {
    id: MessageId,
    body: String,
    receive_count: u32,
    visible_at: Instant,
}

#[derive(Default)]
struct State {
    next_seq: u64,
    /// Keyed by send order so receives stay FIFO.
    entries: BTreeMap<u64, Entry>,
    dead: VecDeque<(Instant, DeadLetter)>,
}

impl State {
    fn seq_of(&self, id: &MessageId) -> Option<u64> {
        self.entries
            .iter()
            .find(|(_, entry)| &entry.id == id)
            .map(|(seq, _)| *seq)
    }

    fn push_dead(&mut self, entry: Entry, reason: &str) {
        warn!(message_id = %entry.id, receive_count = entry.receive_count, reason, "Message dead-lettered");
        self.dead.push_back((
            Instant::now(),
            DeadLetter {
                id: entry.id,
                body: entry.body,
                receive_count: entry.receive_count,
                reason: reason.to_string(),
                dead_lettered_at: Utc::now(),
            },
        ));
    }

    fn prune_dead(&mut self, retention: std::time::Duration) {
        let now = Instant::now();
        while let Some((at, _)) = self.dead.front() {
            if now.duration_since(*at) > retention {
                self.dead.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Work queue held in memory. Used by tests and single-process dry runs.
pub struct MemoryQueue {
    config: QueueConfig,
    state: Mutex<State>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Claim visible messages into `batch`. Returns the earliest future
    /// visibility instant among the remaining entries.
    fn claim_visible(&self, state: &mut State, batch: &mut Vec<Delivery>) -> Option<Instant> {
        let now = Instant::now();
        let mut next_visible: Option<Instant> = None;
        let mut exhausted = Vec::new();

        for (seq, entry) in state.entries.iter_mut() {
            if entry.visible_at > now {
                next_visible = Some(next_visible.map_or(entry.visible_at, |n| n.min(entry.visible_at)));
                continue;
            }
            if entry.receive_count >= self.config.max_receive_count {
                exhausted.push(*seq);
                continue;
            }
            if batch.len() >= self.config.max_batch_size {
                continue;
            }
            entry.receive_count += 1;
            entry.visible_at = now + self.config.visibility_timeout();
            batch.push(Delivery {
                id: entry.id.clone(),
                body: entry.body.clone(),
                receive_count: entry.receive_count,
            });
        }

        for seq in exhausted {
            if let Some(entry) = state.entries.remove(&seq) {
                state.push_dead(entry, MAX_RECEIVES_EXCEEDED);
            }
        }

        next_visible
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn send(&self, body: &str) -> GranuleResult<MessageId> {
        let id = {
            let mut state = self.state.lock().await;
            state.next_seq += 1;
            let seq = state.next_seq;
            let id = MessageId::new(format!("mem-{}", seq));
            state.entries.insert(
                seq,
                Entry {
                    id: id.clone(),
                    body: body.to_string(),
                    receive_count: 0,
                    visible_at: Instant::now(),
                },
            );
            id
        };
        self.notify.notify_waiters();
        debug!(message_id = %id, "Message enqueued");
        Ok(id)
    }

    async fn receive_batch(&self) -> GranuleResult<Vec<Delivery>> {
        let deadline = Instant::now() + self.config.max_batch_window();
        let mut batch = Vec::new();

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_visible = {
                let mut state = self.state.lock().await;
                self.claim_visible(&mut state, &mut batch)
            };

            if batch.len() >= self.config.max_batch_size || Instant::now() >= deadline {
                return Ok(batch);
            }

            let wake_at = next_visible.map_or(deadline, |n| n.min(deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, ids: &[MessageId]) -> GranuleResult<()> {
        let mut state = self.state.lock().await;
        for id in ids {
            if let Some(seq) = state.seq_of(id) {
                state.entries.remove(&seq);
            }
        }
        Ok(())
    }

    async fn dead_letter(&self, id: &MessageId, reason: &str) -> GranuleResult<()> {
        let mut state = self.state.lock().await;
        let seq = state
            .seq_of(id)
            .ok_or_else(|| GranuleError::UnknownMessage(id.to_string()))?;
        if let Some(entry) = state.entries.remove(&seq) {
            state.push_dead(entry, reason);
        }
        Ok(())
    }

    async fn dead_letters(&self) -> GranuleResult<Vec<DeadLetter>> {
        let mut state = self.state.lock().await;
        state.prune_dead(self.config.dlq_retention());
        Ok(state.dead.iter().map(|(_, letter)| letter.clone()).collect())
    }

    async fn depth(&self) -> GranuleResult<QueueDepth> {
        let mut state = self.state.lock().await;
        state.prune_dead(self.config.dlq_retention());
        let now = Instant::now();
        let in_flight = state
            .entries
            .values()
            .filter(|entry| entry.visible_at > now)
            .count() as u64;
        Ok(QueueDepth {
            visible: state.entries.len() as u64 - in_flight,
            in_flight,
            dead_lettered: state.dead.len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn queue(max_receive_count: u32) -> MemoryQueue {
        MemoryQueue::new(QueueConfig {
            max_batch_size: 10,
            max_batch_window_secs: 0,
            visibility_timeout_secs: 30,
            max_receive_count,
            dlq_retention_days: 14,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_is_fifo_and_hides_in_flight() {
        let q = queue(3);
        q.send("a").await.unwrap();
        q.send("b").await.unwrap();

        let batch = q.receive_batch().await.unwrap();
        let bodies: Vec<_> = batch.iter().map(|d| d.body.as_str()).collect();
        assert_eq!(bodies, vec!["a", "b"]);
        assert!(batch.iter().all(|d| d.receive_count == 1));

        assert!(q.receive_batch().await.unwrap().is_empty());
        let depth = q.depth().await.unwrap();
        assert_eq!(depth, QueueDepth { visible: 0, in_flight: 2, dead_lettered: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_message_reappears_after_visibility_timeout() {
        let q = queue(3);
        q.send("a").await.unwrap();
        let first = q.receive_batch().await.unwrap();
        assert_eq!(first.len(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        let second = q.receive_batch().await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, first[0].id);
        assert_eq!(second[0].receive_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acked_message_is_never_redelivered() {
        let q = queue(3);
        q.send("a").await.unwrap();
        let batch = q.receive_batch().await.unwrap();
        q.ack(&[batch[0].id.clone()]).await.unwrap();

        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(q.receive_batch().await.unwrap().is_empty());
        assert_eq!(q.depth().await.unwrap(), QueueDepth::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_message_moves_to_dead_letters() {
        let q = queue(2);
        q.send("poison").await.unwrap();

        for _ in 0..2 {
            assert_eq!(q.receive_batch().await.unwrap().len(), 1);
            tokio::time::advance(Duration::from_secs(31)).await;
        }

        assert!(q.receive_batch().await.unwrap().is_empty());
        let dead = q.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].body, "poison");
        assert_eq!(dead[0].receive_count, 2);
        assert_eq!(dead[0].reason, MAX_RECEIVES_EXCEEDED);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_dead_letter_and_retention() {
        let q = queue(5);
        q.send("bad").await.unwrap();
        let batch = q.receive_batch().await.unwrap();
        q.dead_letter(&batch[0].id, "malformed_message: missing collection")
            .await
            .unwrap();

        assert_eq!(q.dead_letters().await.unwrap().len(), 1);
        assert!(matches!(
            q.dead_letter(&batch[0].id, "again").await,
            Err(GranuleError::UnknownMessage(_))
        ));

        tokio::time::advance(Duration::from_secs(15 * 86_400)).await;
        assert!(q.dead_letters().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_window_waits_for_late_messages() {
        let q = std::sync::Arc::new(MemoryQueue::new(QueueConfig {
            max_batch_size: 2,
            max_batch_window_secs: 20,
            ..QueueConfig::default()
        }));
        q.send("early").await.unwrap();

        let sender = q.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            sender.send("late").await.unwrap();
        });

        let batch = q.receive_batch().await.unwrap();
        assert_eq!(batch.len(), 2);
    }
}
