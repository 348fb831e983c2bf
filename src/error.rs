/// Failure of a guard backend. Plain contention is never a `GuardError`:
/// guards report "not acquired" as `Ok(false)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardError {
    /// The coordination tier could not be reached. Triggers the degraded path.
    Unavailable(String),
    /// The backend answered but the call failed.
    Backend(String),
    /// Input rejected before reaching the backend.
    Invalid(&'static str),
}

impl GuardError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, GuardError::Unavailable(_))
    }
}

impl std::fmt::Display for GuardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GuardError::Unavailable(e) => write!(f, "coordination backend unavailable: {e}"),
            GuardError::Backend(e) => write!(f, "coordination backend error: {e}"),
            GuardError::Invalid(msg) => write!(f, "invalid guard input: {msg}"),
        }
    }
}

impl std::error::Error for GuardError {}

impl From<redis::RedisError> for GuardError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
            GuardError::Unavailable(e.to_string())
        } else {
            GuardError::Backend(e.to_string())
        }
    }
}

impl From<tokio_postgres::Error> for GuardError {
    fn from(e: tokio_postgres::Error) -> Self {
        let connection_class = e
            .code()
            .is_some_and(|code| code.code().starts_with("08"));
        let io = std::error::Error::source(&e).is_some_and(|s| s.is::<std::io::Error>());
        if e.is_closed() || connection_class || io {
            GuardError::Unavailable(e.to_string())
        } else {
            GuardError::Backend(e.to_string())
        }
    }
}

/// Failure reported by an external collaborator (candidate loader, occupancy writer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Integrity constraint rejected the write (e.g. slot already taken).
    Constraint(String),
    /// Connection to the store failed.
    Connection(String),
    /// Retryable failure (serialization conflict, deadlock, timeout).
    Transient(String),
    Other(String),
}

impl StoreError {
    /// Errors the fallback coordinator folds into `PersistenceUnprocessable`.
    pub fn is_unprocessable(&self) -> bool {
        matches!(
            self,
            StoreError::Constraint(_) | StoreError::Connection(_) | StoreError::Transient(_)
        )
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Constraint(e) => write!(f, "constraint violation: {e}"),
            StoreError::Connection(e) => write!(f, "store connection failure: {e}"),
            StoreError::Transient(e) => write!(f, "transient store failure: {e}"),
            StoreError::Other(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Caller-facing outcome of a failed reservation. None of these are retried by
/// the controller itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    FeatureDisabled,
    RateLimited,
    LockContention,
    NoCandidates,
    CapacityExhausted,
    InfrastructureUnavailable(String),
    PersistenceUnprocessable(String),
    Store(StoreError),
    Invalid(&'static str),
}

impl AdmissionError {
    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AdmissionError::FeatureDisabled => "feature_disabled",
            AdmissionError::RateLimited => "rate_limited",
            AdmissionError::LockContention => "lock_contention",
            AdmissionError::NoCandidates => "no_candidates",
            AdmissionError::CapacityExhausted => "capacity_exhausted",
            AdmissionError::InfrastructureUnavailable(_) => "infrastructure_unavailable",
            AdmissionError::PersistenceUnprocessable(_) => "persistence_unprocessable",
            AdmissionError::Store(_) => "store_error",
            AdmissionError::Invalid(_) => "invalid",
        }
    }
}

impl std::fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdmissionError::FeatureDisabled => write!(f, "reservations are disabled"),
            AdmissionError::RateLimited => write!(f, "too many requests for this slot"),
            AdmissionError::LockContention => {
                write!(f, "simultaneous request conflict: slot is being reserved")
            }
            AdmissionError::NoCandidates => write!(f, "all seats already occupied"),
            AdmissionError::CapacityExhausted => write!(f, "all tables already occupied"),
            AdmissionError::InfrastructureUnavailable(e) => {
                write!(f, "coordination unavailable: {e}")
            }
            AdmissionError::PersistenceUnprocessable(e) => {
                write!(f, "unprocessable reservation: {e}")
            }
            AdmissionError::Store(e) => write!(f, "{e}"),
            AdmissionError::Invalid(msg) => write!(f, "invalid request: {msg}"),
        }
    }
}

impl std::error::Error for AdmissionError {}

impl From<GuardError> for AdmissionError {
    fn from(e: GuardError) -> Self {
        match e {
            GuardError::Unavailable(msg) | GuardError::Backend(msg) => {
                AdmissionError::InfrastructureUnavailable(msg)
            }
            GuardError::Invalid(msg) => AdmissionError::Invalid(msg),
        }
    }
}

impl From<StoreError> for AdmissionError {
    fn from(e: StoreError) -> Self {
        AdmissionError::Store(e)
    }
}
