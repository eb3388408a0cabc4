#![forbid(unsafe_code)]

pub mod journal;
pub mod registry;
pub mod repo;
pub mod snapshot;

pub use registry::{IdentityRegistry, RegistryConfig, ReportCommit, ReportOutcome, StorageError};
