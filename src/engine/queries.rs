use crate::model::*;

use super::{Engine, now_ms};

impl Engine {
    /// Machine catalog ordered by position (row, then column).
    pub fn list_machines(&self) -> Vec<Machine> {
        let mut machines: Vec<Machine> = self.machines.iter().map(|e| e.value().clone()).collect();
        machines.sort_by_key(|m| (m.row, m.col, m.id));
        machines
    }

    /// Every machine with its derived status within `scope`, ordered by
    /// position. Expired holds are reported as absent — this is the
    /// purge-on-read path that makes dead holds externally invisible
    /// without depending on the background sweep.
    pub async fn list_state(&self, scope: Scope) -> Vec<MachineView> {
        self.list_state_at(scope, now_ms()).await
    }

    pub(crate) async fn list_state_at(&self, scope: Scope, now: Ms) -> Vec<MachineView> {
        let scope = normalize_scope(scope);
        let machines = self.list_machines();
        let mut views = Vec::with_capacity(machines.len());
        for m in machines {
            let mut view = MachineView {
                id: m.id,
                row: m.row,
                col: m.col,
                name: m.name,
                status: SlotStatus::Available,
                held_by: None,
                booked_by: None,
            };
            if let Some(slot) = self.get_slot(&(m.id, scope.clone())) {
                let guard = slot.read().await;
                view.status = guard.status(now);
                view.held_by = guard.live_hold(now).map(|h| h.holder.clone());
                view.booked_by = guard.booking.as_ref().map(|b| b.holder.clone());
            }
            views.push(view);
        }
        views
    }

    /// Derived status of a single (machine, scope) pair.
    pub async fn status(&self, machine_id: MachineId, scope: Scope) -> SlotStatus {
        self.status_at(machine_id, scope, now_ms()).await
    }

    pub(crate) async fn status_at(&self, machine_id: MachineId, scope: Scope, now: Ms) -> SlotStatus {
        let key = (machine_id, normalize_scope(scope));
        match self.get_slot(&key) {
            Some(slot) => slot.read().await.status(now),
            None => SlotStatus::Available,
        }
    }
}
