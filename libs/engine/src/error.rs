//! Shared error type for the engine.
//!
//! The propagation policy in the composite reconciler, the package revision
//! reconciler and the claim binder all dispatch on *kind*, not on the
//! concrete Rust variant, so [`ErrorKind`] is the thing callers should match
//! on rather than the [`Error`] enum itself.

use kube::core::ErrorResponse;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Classification used by the rate-limiting middleware and the status/event
/// surface to decide how to react to a failure, independent of which Rust
/// variant produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    Conflict,
    BindConflict,
    SecretConflict,
    CompositionFailure,
    FunctionFatal,
    LintFailure,
    VersionConstraint,
    WatchStartFailure,
    RateLimited,
    Transient,
    Fatal,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("controller {0} already started with different options")]
    AlreadyExists(String),

    #[error("optimistic concurrency conflict on {0}")]
    Conflict(String),

    #[error("claim already bound to a different composite: {0}")]
    BindConflict(String),

    #[error("connection secret is not controlled by the expected owner: {0}")]
    SecretConflict(String),

    #[error("composition function pipeline failed: {0}")]
    CompositionFailure(String),

    #[error("composition function {function} returned Fatal: {message}")]
    FunctionFatal { function: String, message: String },

    #[error("package failed linting: {0}")]
    LintFailure(String),

    #[error("package violates crossplane version constraint: {0}")]
    VersionConstraint(String),

    #[error("failed to start watch for {0}")]
    WatchStartFailure(String),

    #[error("rate limited, no token available")]
    RateLimited,

    #[error("transient error: {0}")]
    Transient(String),

    #[error("fatal configuration error, operator action required: {0}")]
    Fatal(String),

    #[error("two slots resolved to the same object: {0}")]
    DuplicateResource(String),

    #[error("invalid field path {0:?}: {1}")]
    FieldPath(String, String),

    #[error("malformed object: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("current span has no valid trace id")]
    InvalidTraceId,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::BindConflict(_) => ErrorKind::BindConflict,
            Error::SecretConflict(_) => ErrorKind::SecretConflict,
            Error::CompositionFailure(_) => ErrorKind::CompositionFailure,
            Error::FunctionFatal { .. } => ErrorKind::FunctionFatal,
            Error::LintFailure(_) => ErrorKind::LintFailure,
            Error::VersionConstraint(_) => ErrorKind::VersionConstraint,
            Error::WatchStartFailure(_) => ErrorKind::WatchStartFailure,
            Error::RateLimited => ErrorKind::RateLimited,
            Error::Fatal(_) => ErrorKind::Fatal,
            Error::DuplicateResource(_) => ErrorKind::CompositionFailure,
            Error::FieldPath(..) => ErrorKind::Fatal,
            Error::Serde(_) => ErrorKind::Fatal,
            Error::Transient(_) => ErrorKind::Transient,
            Error::InvalidTraceId => ErrorKind::Transient,
            Error::Kube(source) => classify_kube_error(source),
        }
    }

    /// Stable short token used both as a Prometheus label and as a Condition
    /// `Reason`.
    pub fn metric_label(&self) -> &'static str {
        match self.kind() {
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::Conflict => "conflict",
            ErrorKind::BindConflict => "bind_conflict",
            ErrorKind::SecretConflict => "secret_conflict",
            ErrorKind::CompositionFailure => "composition_failure",
            ErrorKind::FunctionFatal => "function_fatal",
            ErrorKind::LintFailure => "lint_failure",
            ErrorKind::VersionConstraint => "version_constraint",
            ErrorKind::WatchStartFailure => "watch_start_failure",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Transient => "transient",
            ErrorKind::Fatal => "fatal",
        }
    }
}

fn classify_kube_error(source: &kube::Error) -> ErrorKind {
    match source {
        kube::Error::Api(ErrorResponse { code: 404, .. }) => ErrorKind::NotFound,
        kube::Error::Api(ErrorResponse { code: 409, .. }) => ErrorKind::Conflict,
        _ => ErrorKind::Transient,
    }
}
