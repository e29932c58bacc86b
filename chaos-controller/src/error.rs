use crate::resource::Phase;

/// How the engine treats a failed apply or recover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with backoff: unreachable daemon, api conflict.
    Transient,
    /// Invalid resource configuration; retrying cannot help.
    Config,
    /// The daemon ran the operation and it failed.
    Fatal,
    /// The target pod or container no longer exists.
    TargetGone,
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: String,
        namespace: String,
        name: String,
    },
    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        kind: String,
        namespace: String,
        name: String,
    },
    #[error("conflict updating {0}: resource version changed")]
    Conflict(String),
    #[error("cluster api unavailable: {0}")]
    Unavailable(String),
    #[error("invalid object: {0}")]
    Invalid(String),
}

impl ClusterError {
    pub fn not_found(kind: &str, namespace: &str, name: &str) -> Self {
        ClusterError::NotFound {
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn already_exists(kind: &str, namespace: &str, name: &str) -> Self {
        ClusterError::AlreadyExists {
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound { .. })
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            ClusterError::NotFound { .. } => ErrorClass::TargetGone,
            ClusterError::AlreadyExists { .. } => ErrorClass::Fatal,
            ClusterError::Conflict(_) | ClusterError::Unavailable(_) => ErrorClass::Transient,
            ClusterError::Invalid(_) => ErrorClass::Config,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no implementation registered for action {0:?}")]
    UnknownAction(String),
    #[error("action {0} is not registered")]
    Missing(&'static str),
    #[error("action {action} registered as {registered}, expected {expected}")]
    ScopeMismatch {
        action: &'static str,
        registered: &'static str,
        expected: &'static str,
    },
}

/// Failure of one implementation call.
#[derive(Debug, thiserror::Error)]
pub enum ImplError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("target {0} no longer exists")]
    TargetGone(String),
    #[error("chaos daemon at {address} unreachable: {reason}")]
    Unreachable { address: String, reason: String },
    #[error("chaos daemon error: {0}")]
    Daemon(String),
    #[error("chaos daemon reported failure: {0}")]
    Rejected(String),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl ImplError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ImplError::Config(_) => ErrorClass::Config,
            ImplError::TargetGone(_) => ErrorClass::TargetGone,
            ImplError::Unreachable { .. } => ErrorClass::Transient,
            ImplError::Daemon(_) | ImplError::Rejected(_) => ErrorClass::Fatal,
            ImplError::Cluster(e) => e.class(),
            ImplError::Dispatch(_) => ErrorClass::Fatal,
        }
    }

    /// Attach the phase the record is in after this failure.
    pub fn at(self, phase: Phase) -> PhaseError {
        PhaseError { phase, error: self }
    }
}

/// An implementation failure together with the phase the record ends up in.
#[derive(Debug, thiserror::Error)]
#[error("{error} (record left {phase})")]
pub struct PhaseError {
    pub phase: Phase,
    #[source]
    pub error: ImplError,
}

#[derive(Debug, thiserror::Error)]
pub enum SelectorError {
    #[error("selector mode {0} requires a value")]
    MissingValue(&'static str),
    #[error("invalid value {value:?} for selector mode {mode}: {reason}")]
    InvalidValue {
        mode: &'static str,
        value: String,
        reason: String,
    },
    #[error("selector mode fixed wants {wanted} targets but only {available} match")]
    NotEnoughTargets { wanted: usize, available: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}
