mod error;
mod mutations;
mod queries;

pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedSlotState = Arc<RwLock<SlotState>>;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as Ms
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit:
/// block until an Append arrives, drain everything immediately available into
/// one buffered write, then a single flush_sync for the whole batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    // Flush the batch first, then handle the non-append command
                    deferred = Some(other);
                    break;
                }
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
            .record(batch.len() as f64);
        let flush_start = Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());

        for (_, tx) in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(r);
        }

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    /// Machine catalog — entries are immutable after creation.
    pub(super) machines: DashMap<MachineId, Machine>,
    /// Per-(machine, scope) reservation state, created lazily on first
    /// mutation. Reads never create entries.
    pub(super) slots: DashMap<SlotKey, SharedSlotState>,
    /// Reverse lookup: hold token → slot, for token-only release.
    pub(super) token_index: DashMap<Ulid, SlotKey>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
}

/// Apply a slot-level event to a SlotState (no locking — caller holds the
/// lock). Tolerant of already-gone holds: compaction drops expired holds
/// from the WAL, so a later HoldReleased may replay against an empty slot.
fn apply_slot_event(slot: &mut SlotState, event: &Event, token_index: &DashMap<Ulid, SlotKey>) {
    match event {
        Event::HoldAcquired {
            machine_id,
            scope,
            token,
            holder,
            created_at,
            expires_at,
        } => {
            // A superseded (expired) hold dies here; drop its token mapping.
            if let Some(old) = slot.hold.take() {
                token_index.remove(&old.token);
            }
            slot.hold = Some(Hold {
                token: *token,
                holder: holder.clone(),
                created_at: *created_at,
                expires_at: *expires_at,
            });
            token_index.insert(*token, (*machine_id, scope.clone()));
        }
        Event::HoldReleased { token, .. } => {
            if slot.hold.as_ref().is_some_and(|h| h.token == *token) {
                slot.hold = None;
            }
            token_index.remove(token);
        }
        Event::BookingConfirmed {
            token,
            holder,
            created_at,
            ..
        } => {
            if slot.hold.as_ref().is_some_and(|h| h.token == *token) {
                slot.hold = None;
            }
            token_index.remove(token);
            slot.booking = Some(Booking {
                token: *token,
                holder: holder.clone(),
                created_at: *created_at,
            });
        }
        Event::BookingCancelled { .. } => {
            slot.booking = None;
        }
        // Handled at the catalog level, not here
        Event::MachineCreated { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            machines: DashMap::new(),
            slots: DashMap::new(),
            token_index: DashMap::new(),
            wal_tx,
        };

        // Replay — we're the sole owner of these Arcs, so try_write always
        // succeeds instantly (no contention).
        for event in &events {
            match event {
                Event::MachineCreated { id, row, col, name } => {
                    engine.machines.insert(
                        *id,
                        Machine {
                            id: *id,
                            row: *row,
                            col: *col,
                            name: name.clone(),
                        },
                    );
                }
                other => {
                    if let Some(key) = event_slot_key(other) {
                        let slot = engine.slot_entry(&key);
                        let mut guard = slot.try_write().expect("replay: uncontended write");
                        apply_slot_event(&mut guard, other, &engine.token_index);
                    }
                }
            }
        }

        Ok(engine)
    }

    /// Write an event to the WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append + apply in one call. State changes only after the append
    /// succeeds, so a store fault leaves the slot untouched.
    pub(super) async fn persist_and_apply(
        &self,
        slot: &mut SlotState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_slot_event(slot, event, &self.token_index);
        Ok(())
    }

    pub fn get_machine(&self, id: MachineId) -> Option<Machine> {
        self.machines.get(&id).map(|e| e.value().clone())
    }

    pub(super) fn get_slot(&self, key: &SlotKey) -> Option<SharedSlotState> {
        self.slots.get(key).map(|e| e.value().clone())
    }

    /// Get or lazily create the state for a (machine, scope) pair. The map
    /// guard is dropped before any lock on the slot is taken.
    pub(super) fn slot_entry(&self, key: &SlotKey) -> SharedSlotState {
        if let Some(existing) = self.slots.get(key) {
            return existing.value().clone();
        }
        self.slots.entry(key.clone()).or_default().value().clone()
    }
}

/// Extract the slot key from an event (for non-MachineCreated events).
fn event_slot_key(event: &Event) -> Option<SlotKey> {
    match event {
        Event::HoldAcquired {
            machine_id, scope, ..
        }
        | Event::HoldReleased {
            machine_id, scope, ..
        }
        | Event::BookingConfirmed {
            machine_id, scope, ..
        }
        | Event::BookingCancelled {
            machine_id, scope, ..
        } => Some((*machine_id, scope.clone())),
        Event::MachineCreated { .. } => None,
    }
}
