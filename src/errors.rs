//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// A container runtime command ran but reported failure.
    Runtime(String),
    /// The container runtime is unreachable. Fatal for untrusted turns.
    ContainerUnavailable(String),
    /// A workspace container exited unexpectedly.
    ContainerCrashed(String),
    /// The engine could not resume its transcript (missing or corrupt).
    ResumeFailed(String),
    /// The workspace has turns in flight and cannot be deleted.
    WorkspaceBusy(String),
    /// A turn exceeded its execution deadline.
    ExecTimeout(String),
    /// Agent engine wire protocol or process failure.
    Engine(String),
    /// File system path failed validation (traversal or symlink).
    PathViolation(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Caller supplied a malformed identifier or request.
    InvalidInput(String),
}

impl AppError {
    /// Stable kebab-case tag for this error, carried in `error` events.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Io(_) => "io",
            Self::Db(_) => "db",
            Self::Runtime(_) => "runtime",
            Self::ContainerUnavailable(_) => "container-unavailable",
            Self::ContainerCrashed(_) => "container-crashed",
            Self::ResumeFailed(_) => "resume-failed",
            Self::WorkspaceBusy(_) => "workspace-busy",
            Self::ExecTimeout(_) => "exec-timeout",
            Self::Engine(_) => "engine",
            Self::PathViolation(_) => "path-violation",
            Self::NotFound(_) => "not-found",
            Self::InvalidInput(_) => "invalid-input",
        }
    }

    /// Whether this error sits on the trust boundary and must never be
    /// recovered by falling back to host execution.
    #[must_use]
    pub fn is_fatal_trust_boundary(&self) -> bool {
        matches!(self, Self::ContainerUnavailable(_))
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Runtime(msg) => write!(f, "runtime: {msg}"),
            Self::ContainerUnavailable(msg) => write!(f, "container unavailable: {msg}"),
            Self::ContainerCrashed(msg) => write!(f, "container crashed: {msg}"),
            Self::ResumeFailed(msg) => write!(f, "resume failed: {msg}"),
            Self::WorkspaceBusy(msg) => write!(f, "workspace busy: {msg}"),
            Self::ExecTimeout(msg) => write!(f, "exec timeout: {msg}"),
            Self::Engine(msg) => write!(f, "engine: {msg}"),
            Self::PathViolation(msg) => write!(f, "path violation: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
