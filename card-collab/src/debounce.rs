//! Debounced durable writes of card descriptions.
//!
//! Every applied edit schedules a write of the card's structured content.
//! Within a quiet period only the latest payload survives:
//!
//! ```text
//! schedule(42, v1) ──┐
//! schedule(42, v2) ──┼── timer reset each time
//! schedule(42, v3) ──┘
//!                     ··· quiet period ···  update_card_description(42, v3)
//! ```
//!
//! Each card owns one slot. A slot is either empty or holds a pending write
//! with a cancelable timer and a generation number; a timer that fires for a
//! superseded generation does nothing. Once a write has been taken out of its
//! slot it is in flight and nothing cancels it.
//!
//! There is no maximum wait: a card edited without pause is not written
//! until editing stops.

use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;

use crate::error::Result;
use crate::protocol::Actor;

/// Default quiet period before a card description is written.
pub const DEFAULT_QUIET_PERIOD: Duration = Duration::from_secs(2);

/// Downstream writer of card descriptions.
#[async_trait]
pub trait CardUpdater: Send + Sync {
    async fn update_card_description(
        &self,
        card_id: &str,
        content: Value,
        actor: Option<&Actor>,
    ) -> Result<()>;
}

struct PendingWrite {
    content: Value,
    actor: Option<Actor>,
}

enum SaveSlot {
    NoPendingWrite,
    PendingWrite {
        write: PendingWrite,
        generation: u64,
        timer: AbortHandle,
    },
}

impl SaveSlot {
    /// Move the pending write out, leaving the slot empty.
    fn take(&mut self) -> Option<(PendingWrite, u64, AbortHandle)> {
        match std::mem::replace(self, SaveSlot::NoPendingWrite) {
            SaveSlot::PendingWrite {
                write,
                generation,
                timer,
            } => Some((write, generation, timer)),
            SaveSlot::NoPendingWrite => None,
        }
    }
}

struct Inner {
    quiet: Duration,
    updater: Arc<dyn CardUpdater>,
    slots: Mutex<HashMap<String, SaveSlot>>,
    next_generation: Mutex<u64>,
}

impl Inner {
    /// Timer expiry for `card_id` at `generation`.
    async fn fire(&self, card_id: &str, generation: u64) {
        let write = {
            let mut slots = self.slots.lock();
            let current = match slots.get(card_id) {
                Some(SaveSlot::PendingWrite { generation: g, .. }) => *g == generation,
                _ => false,
            };
            if !current {
                return;
            }
            slots.remove(card_id).and_then(|mut slot| slot.take())
        };
        if let Some((write, _, _)) = write {
            self.run(card_id, write).await;
        }
    }

    async fn run(&self, card_id: &str, write: PendingWrite) {
        match self
            .updater
            .update_card_description(card_id, write.content, write.actor.as_ref())
            .await
        {
            Ok(()) => log::debug!("Saved description for card {card_id}"),
            Err(e) => log::error!("Failed to save description for card {card_id}: {e}"),
        }
    }
}

/// Per-card debounced writer.
#[derive(Clone)]
pub struct SaveDebouncer {
    inner: Arc<Inner>,
}

impl SaveDebouncer {
    pub fn new(quiet: Duration, updater: Arc<dyn CardUpdater>) -> Self {
        Self {
            inner: Arc::new(Inner {
                quiet,
                updater,
                slots: Mutex::new(HashMap::new()),
                next_generation: Mutex::new(0),
            }),
        }
    }

    pub fn quiet_period(&self) -> Duration {
        self.inner.quiet
    }

    /// Replace any pending write for the card and restart its timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule(&self, card_id: &str, content: Value, actor: Option<Actor>) {
        let generation = {
            let mut next = self.inner.next_generation.lock();
            *next += 1;
            *next
        };

        let mut slots = self.inner.slots.lock();
        if let Some((_, _, timer)) = slots.get_mut(card_id).and_then(SaveSlot::take) {
            timer.abort();
        }

        let inner = self.inner.clone();
        let card = card_id.to_string();
        let quiet = self.inner.quiet;
        let task = tokio::spawn(async move {
            tokio::time::sleep(quiet).await;
            inner.fire(&card, generation).await;
        });

        slots.insert(
            card_id.to_string(),
            SaveSlot::PendingWrite {
                write: PendingWrite { content, actor },
                generation,
                timer: task.abort_handle(),
            },
        );
        log::trace!("Scheduled description save for card {card_id} (generation {generation})");
    }

    /// Run every pending write now. Returns how many were run.
    pub async fn flush_all(&self) -> usize {
        let due: Vec<(String, PendingWrite)> = {
            let mut slots = self.inner.slots.lock();
            slots
                .drain()
                .filter_map(|(card_id, mut slot)| {
                    slot.take().map(|(write, _, timer)| {
                        timer.abort();
                        (card_id, write)
                    })
                })
                .collect()
        };

        let count = due.len();
        if count > 0 {
            log::info!("Flushing {count} pending description saves");
        }
        join_all(
            due.into_iter()
                .map(|(card_id, write)| async move { self.inner.run(&card_id, write).await }),
        )
        .await;
        count
    }

    pub fn pending_count(&self) -> usize {
        self.inner
            .slots
            .lock()
            .values()
            .filter(|slot| matches!(slot, SaveSlot::PendingWrite { .. }))
            .count()
    }

    pub fn is_pending(&self, card_id: &str) -> bool {
        matches!(
            self.inner.slots.lock().get(card_id),
            Some(SaveSlot::PendingWrite { .. })
        )
    }
}
