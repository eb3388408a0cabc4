#![forbid(unsafe_code)]

pub mod common;
pub mod identity;
pub mod presence;

pub use common::{Clock, ContractViolation, SchemaVersion, SystemClock, UnixTimeMs, Validate};
