use thiserror::Error;

use cdr_common::store::StoreError;

/// Enumeration of errors that can happen during a sync run.
/// Only `PersistenceFailure` is recovered from during a run: it costs one call, the run goes on.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Authentication failed, check the PBX username and password")]
    AuthenticationFailure,
    #[error("{0}")]
    TransportFailure(String),
    #[error("destination store error: {0}")]
    PersistenceFailure(#[from] StoreError),
    #[error("PBX refused to originate the call: {0}")]
    OriginateRejected(String),
    #[error("{0} is not configured")]
    ConfigurationMissing(&'static str),
    #[error("invalid source mode '{0}', expected remote or local")]
    InvalidSourceMode(String),
    #[error("invalid number rule '{0}', expected identity, digits or right:N")]
    InvalidRule(String),
}

/// A run that was aborted, along with what it managed to import first.
#[derive(Error, Debug)]
#[error("Experienced an error: {error}. Imported {imported} records before failing.")]
pub struct SyncFailure {
    pub error: SyncError,
    pub imported: u64,
}
