use crate::model::MachineId;

#[derive(Debug)]
pub enum EngineError {
    UnknownMachine(MachineId),
    AlreadyExists(MachineId),
    AlreadyHeld(MachineId),
    AlreadyBooked(MachineId),
    InvalidOrExpiredHold,
    LockNotFound,
    BookingNotFound,
    InvalidInput(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::UnknownMachine(id) => write!(f, "unknown machine: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "machine already exists: {id}"),
            EngineError::AlreadyHeld(id) => write!(f, "machine {id} is already held"),
            EngineError::AlreadyBooked(id) => write!(f, "machine {id} is already booked"),
            EngineError::InvalidOrExpiredHold => write!(f, "invalid or expired hold token"),
            EngineError::LockNotFound => write!(f, "hold not found or already expired"),
            EngineError::BookingNotFound => write!(f, "booking not found"),
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
