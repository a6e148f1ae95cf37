use crate::model::Ms;

/// Lifetime of a hold before it is logically dead: 2 minutes.
pub const HOLD_TTL_MS: Ms = 2 * 60 * 1000;

pub const MAX_MACHINES: usize = 4096;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_HOLDER_LEN: usize = 128;
pub const MAX_SCOPE_LEN: usize = 128;

/// Cap on live (machine, scope) entries, so scope flooding cannot grow the
/// slot map without bound.
pub const MAX_SLOTS: usize = 100_000;
