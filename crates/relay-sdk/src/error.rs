use thiserror::Error;

/// Errors raised by the event validator (C3).
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("event kind {actual} does not match expected kind {expected}")]
    InvalidKind { expected: u16, actual: u16 },
    #[error("kind {0} is not in the configured whitelist")]
    KindNotAllowed(u16),
    #[error("created_at {0} is outside the allowed time window")]
    BadTime(i64),
    #[error("schnorr signature verification failed")]
    BadSignature,
    #[error("malformed event envelope: {0}")]
    Malformed(String),
    #[error("missing required tag: {0}")]
    MissingTag(&'static str),
}

/// Errors raised by the admission filter (C8).
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("signer is not on the allowed-write list")]
    NotAllowed,
    #[error("signer is not the relay owner")]
    NotOwner,
    #[error("no active allocation or remaining quota for signer")]
    QuotaExhausted,
}

/// Errors raised by the pluggable persistence interfaces. The relay core
/// never inspects the backend-specific cause, only this taxonomy.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("record not found")]
    NotFound,
}

/// Errors raised by the allocation engine (C7).
#[derive(Debug, Error)]
pub enum AllocationError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("payment amount must be positive")]
    NonPositivePayment,
    #[error("wallet service unreachable: {0}")]
    WalletUnreachable(String),
    #[error("address pool did not reach required headroom in time")]
    AddressPoolTimeout,
    #[error("no tier available for the current mode")]
    NoTierAvailable,
}

/// Errors raised by kind handlers and the dispatch core (C2/C6).
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no handler registered for kind {0}")]
    NoHandler(u16),
    #[error("duplicate registration for handler key {0}")]
    DuplicateHandler(String),
}

/// Root error type aggregating every subsystem, for callers (the relay
/// binary, admin-facing code) that want a single error type rather than
/// matching on the subsystem that failed.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
