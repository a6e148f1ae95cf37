use tokio::sync::oneshot;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, WalCommand, now_ms};

fn validate_holder(holder: &str) -> Result<(), EngineError> {
    if holder.is_empty() {
        return Err(EngineError::InvalidInput("holder identity is required"));
    }
    if holder.len() > MAX_HOLDER_LEN {
        return Err(EngineError::LimitExceeded("holder identity too long"));
    }
    Ok(())
}

fn validate_scope(scope: &Scope) -> Result<(), EngineError> {
    if let Some(s) = scope
        && s.len() > MAX_SCOPE_LEN
    {
        return Err(EngineError::LimitExceeded("scope too long"));
    }
    Ok(())
}

impl Engine {
    /// Setup-time operation: register one machine. Machines are immutable
    /// after creation.
    pub async fn create_machine(
        &self,
        id: MachineId,
        row: u16,
        col: u16,
        name: Option<String>,
    ) -> Result<(), EngineError> {
        if self.machines.len() >= MAX_MACHINES {
            return Err(EngineError::LimitExceeded("too many machines"));
        }
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("machine name too long"));
        }
        if self.machines.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::MachineCreated {
            id,
            row,
            col,
            name: name.clone(),
        };
        self.wal_append(&event).await?;
        self.machines.insert(id, Machine { id, row, col, name });
        Ok(())
    }

    /// Seed a row-major numbered grid. Machines already present (e.g. from a
    /// replayed WAL) are left alone, so startup seeding is idempotent.
    pub async fn seed_grid(&self, rows: u16, cols: u16) -> Result<usize, EngineError> {
        if rows as usize * cols as usize > MAX_MACHINES {
            return Err(EngineError::LimitExceeded("grid too large"));
        }
        let mut created = 0;
        for row in 1..=rows {
            for col in 1..=cols {
                let id = (row as MachineId - 1) * cols as MachineId + col as MachineId;
                if self.machines.contains_key(&id) {
                    continue;
                }
                self.create_machine(id, row, col, None).await?;
                created += 1;
            }
        }
        Ok(created)
    }

    /// Place a provisional hold on a (machine, scope) pair. Of any set of
    /// racing acquires on the same pair, exactly one wins; the rest observe
    /// the fresh hold (or a booking) and fail deterministically.
    pub async fn acquire_hold(
        &self,
        machine_id: MachineId,
        holder: &str,
        scope: Scope,
    ) -> Result<Ulid, EngineError> {
        self.acquire_hold_at(machine_id, holder, scope, now_ms()).await
    }

    pub(crate) async fn acquire_hold_at(
        &self,
        machine_id: MachineId,
        holder: &str,
        scope: Scope,
        now: Ms,
    ) -> Result<Ulid, EngineError> {
        validate_holder(holder)?;
        let scope = normalize_scope(scope);
        validate_scope(&scope)?;
        if !self.machines.contains_key(&machine_id) {
            return Err(EngineError::UnknownMachine(machine_id));
        }
        let key = (machine_id, scope);
        if !self.slots.contains_key(&key) && self.slots.len() >= MAX_SLOTS {
            return Err(EngineError::LimitExceeded("too many live scopes"));
        }

        let slot = self.slot_entry(&key);
        let mut guard = slot.write().await;
        if guard.booking.is_some() {
            return Err(EngineError::AlreadyBooked(machine_id));
        }
        // An expired hold is dead; the new one simply overwrites it.
        if guard.live_hold(now).is_some() {
            return Err(EngineError::AlreadyHeld(machine_id));
        }

        let token = Ulid::new();
        let event = Event::HoldAcquired {
            machine_id,
            scope: key.1.clone(),
            token,
            holder: holder.to_string(),
            created_at: now,
            expires_at: now + HOLD_TTL_MS,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(token)
    }

    /// Promote a hold into a booking. Verify-hold, write-booking, and
    /// drop-hold happen under one slot lock and one WAL append, so a stale
    /// token can never produce two bookings or a booking plus a live hold.
    pub async fn confirm(
        &self,
        machine_id: MachineId,
        holder: &str,
        token: Ulid,
        scope: Scope,
    ) -> Result<(), EngineError> {
        self.confirm_at(machine_id, holder, token, scope, now_ms()).await
    }

    pub(crate) async fn confirm_at(
        &self,
        machine_id: MachineId,
        holder: &str,
        token: Ulid,
        scope: Scope,
        now: Ms,
    ) -> Result<(), EngineError> {
        validate_holder(holder)?;
        let scope = normalize_scope(scope);
        if !self.machines.contains_key(&machine_id) {
            return Err(EngineError::UnknownMachine(machine_id));
        }
        let Some(slot) = self.get_slot(&(machine_id, scope.clone())) else {
            return Err(EngineError::InvalidOrExpiredHold);
        };

        let mut guard = slot.write().await;
        let matched = guard
            .live_hold(now)
            .is_some_and(|h| h.token == token && h.holder == holder);
        if !matched {
            return Err(EngineError::InvalidOrExpiredHold);
        }

        let event = Event::BookingConfirmed {
            machine_id,
            scope,
            token,
            holder: holder.to_string(),
            created_at: now,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Explicitly drop an unconfirmed hold, expired or not. The token is the
    /// sole capability — no identity check. A hold consumed by `confirm` is
    /// indistinguishable from one that never existed.
    pub async fn release(&self, machine_id: MachineId, token: Ulid) -> Result<(), EngineError> {
        let Some(key) = self.token_index.get(&token).map(|e| e.value().clone()) else {
            return Err(EngineError::LockNotFound);
        };
        if key.0 != machine_id {
            return Err(EngineError::LockNotFound);
        }
        let Some(slot) = self.get_slot(&key) else {
            return Err(EngineError::LockNotFound);
        };

        let mut guard = slot.write().await;
        // Re-check under the lock — the hold may have been confirmed or
        // superseded between the index lookup and here.
        if !guard.hold.as_ref().is_some_and(|h| h.token == token) {
            return Err(EngineError::LockNotFound);
        }

        let event = Event::HoldReleased {
            machine_id: key.0,
            scope: key.1.clone(),
            token,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Delete a booking. The holder match doubles as the authorization
    /// check: only the identity recorded at confirm-time may cancel.
    pub async fn cancel_confirmed(
        &self,
        machine_id: MachineId,
        holder: &str,
        scope: Scope,
    ) -> Result<(), EngineError> {
        validate_holder(holder)?;
        let scope = normalize_scope(scope);
        if !self.machines.contains_key(&machine_id) {
            return Err(EngineError::UnknownMachine(machine_id));
        }
        let Some(slot) = self.get_slot(&(machine_id, scope.clone())) else {
            return Err(EngineError::BookingNotFound);
        };

        let mut guard = slot.write().await;
        if !guard.booking.as_ref().is_some_and(|b| b.holder == holder) {
            return Err(EngineError::BookingNotFound);
        }

        let event = Event::BookingCancelled {
            machine_id,
            scope,
            holder: holder.to_string(),
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Holds whose expiry has passed, for the reaper. Contended slots are
    /// skipped; the next sweep picks them up.
    pub fn collect_expired_holds(&self, now: Ms) -> Vec<(MachineId, Ulid)> {
        let mut expired = Vec::new();
        for entry in self.slots.iter() {
            if let Ok(guard) = entry.value().try_read()
                && let Some(hold) = guard.hold.as_ref()
                && hold.is_expired(now)
            {
                expired.push((entry.key().0, hold.token));
            }
        }
        expired
    }

    /// Rewrite the WAL with only the events needed to recreate current
    /// state. Expired holds are dropped here, so compaction doubles as
    /// physical garbage collection.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let now = now_ms();
        let mut events = Vec::new();

        let mut machines: Vec<Machine> = self.machines.iter().map(|e| e.value().clone()).collect();
        machines.sort_by_key(|m| m.id);
        for m in machines {
            events.push(Event::MachineCreated {
                id: m.id,
                row: m.row,
                col: m.col,
                name: m.name,
            });
        }

        let keys: Vec<SlotKey> = self.slots.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            let Some(slot) = self.get_slot(&key) else {
                continue;
            };
            let guard = slot.read().await;
            if let Some(hold) = guard.live_hold(now) {
                events.push(Event::HoldAcquired {
                    machine_id: key.0,
                    scope: key.1.clone(),
                    token: hold.token,
                    holder: hold.holder.clone(),
                    created_at: hold.created_at,
                    expires_at: hold.expires_at,
                });
            }
            if let Some(booking) = guard.booking.as_ref() {
                events.push(Event::BookingConfirmed {
                    machine_id: key.0,
                    scope: key.1.clone(),
                    token: booking.token,
                    holder: booking.holder.clone(),
                    created_at: booking.created_at,
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
