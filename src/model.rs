use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// Machine identifiers are small integers assigned at seed time (row-major).
pub type MachineId = u32;

/// Optional partition key: holds and bookings are exclusive per scope.
pub type Scope = Option<String>;

/// The unit of mutual exclusion: one machine within one scope.
pub type SlotKey = (MachineId, Scope);

/// Empty-string scopes collapse to "no scope".
pub fn normalize_scope(scope: Scope) -> Scope {
    scope.filter(|s| !s.is_empty())
}

/// One bookable unit on the floor grid. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub id: MachineId,
    pub row: u16,
    pub col: u16,
    pub name: Option<String>,
}

/// Ephemeral exclusive claim preceding confirmation. The token is the
/// capability proof for both `confirm` and `release`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    pub token: Ulid,
    pub holder: String,
    pub created_at: Ms,
    pub expires_at: Ms,
}

impl Hold {
    /// A hold with `expires_at <= now` is logically dead even while still
    /// physically present.
    pub fn is_expired(&self, now: Ms) -> bool {
        self.expires_at <= now
    }
}

/// Durable confirmed claim. `token` records the hold it was promoted from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub token: Ulid,
    pub holder: String,
    pub created_at: Ms,
}

/// Live reservation state of one (machine, scope) pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotState {
    pub hold: Option<Hold>,
    pub booking: Option<Booking>,
}

impl SlotState {
    /// Non-expired hold, if any.
    pub fn live_hold(&self, now: Ms) -> Option<&Hold> {
        self.hold.as_ref().filter(|h| !h.is_expired(now))
    }

    /// Derived status — computed, never stored. A slot can never be both
    /// booked and held: confirm removes the hold when it installs the booking.
    pub fn status(&self, now: Ms) -> SlotStatus {
        if self.booking.is_some() {
            SlotStatus::Booked
        } else if self.live_hold(now).is_some() {
            SlotStatus::Held
        } else {
            SlotStatus::Available
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotStatus {
    Available,
    Held,
    Booked,
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    MachineCreated {
        id: MachineId,
        row: u16,
        col: u16,
        name: Option<String>,
    },
    HoldAcquired {
        machine_id: MachineId,
        scope: Scope,
        token: Ulid,
        holder: String,
        created_at: Ms,
        expires_at: Ms,
    },
    HoldReleased {
        machine_id: MachineId,
        scope: Scope,
        token: Ulid,
    },
    BookingConfirmed {
        machine_id: MachineId,
        scope: Scope,
        token: Ulid,
        holder: String,
        created_at: Ms,
    },
    BookingCancelled {
        machine_id: MachineId,
        scope: Scope,
        holder: String,
    },
}

// ── Query result types ───────────────────────────────────────────

/// One row of `list_state`. Hold tokens are never exposed here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MachineView {
    pub id: MachineId,
    pub row: u16,
    pub col: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub status: SlotStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub held_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub booked_by: Option<String>,
}
