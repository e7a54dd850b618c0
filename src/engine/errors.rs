use crate::engine::descriptor::TaskState;
use std::path::PathBuf;

/// Coarse failure classes, as reported to callers and HTTP clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Io,
    Parse,
    NotFound,
    Duplicate,
    Capacity,
    Conflict,
}

#[derive(Debug)]
pub enum StoreError {
    EnsureDir {
        path: PathBuf,
        source: std::io::Error,
    },
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    RemovePath {
        path: PathBuf,
        source: std::io::Error,
    },
    NotFound {
        path: PathBuf,
    },
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    Serialize {
        source: serde_json::Error,
    },
    Invalid(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EnsureDir { .. }
            | Self::ReadFile { .. }
            | Self::WriteFile { .. }
            | Self::Rename { .. }
            | Self::RemovePath { .. }
            | Self::Serialize { .. } => ErrorKind::Io,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Parse { .. } => ErrorKind::Parse,
            Self::Invalid(_) => ErrorKind::Validation,
        }
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EnsureDir { path, source } => {
                write!(
                    f,
                    "failed to ensure directory '{}': {source}",
                    path.display()
                )
            }
            Self::ReadFile { path, source } => {
                write!(f, "failed to read '{}': {source}", path.display())
            }
            Self::WriteFile { path, source } => {
                write!(f, "failed to write '{}': {source}", path.display())
            }
            Self::Rename { from, to, source } => write!(
                f,
                "failed to rename '{}' -> '{}': {source}",
                from.display(),
                to.display()
            ),
            Self::RemovePath { path, source } => {
                write!(f, "failed to remove '{}': {source}", path.display())
            }
            Self::NotFound { path } => write!(f, "'{}' does not exist", path.display()),
            Self::Parse { path, source } => {
                write!(f, "malformed json in '{}': {source}", path.display())
            }
            Self::Serialize { source } => write!(f, "failed to serialize json: {source}"),
            Self::Invalid(msg) => write!(f, "invalid persisted state: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::EnsureDir { source, .. }
            | Self::ReadFile { source, .. }
            | Self::WriteFile { source, .. }
            | Self::Rename { source, .. }
            | Self::RemovePath { source, .. } => Some(source),
            Self::Parse { source, .. } | Self::Serialize { source } => Some(source),
            Self::NotFound { .. } | Self::Invalid(_) => None,
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    Store(StoreError),
    Validation(String),
    Duplicate(String),
    Capacity(usize),
    UnknownTask(String),
    Unavailable(String),
    InvalidTransition { from: TaskState, to: TaskState },
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(source) => source.kind(),
            Self::Validation(_) => ErrorKind::Validation,
            Self::Duplicate(_) => ErrorKind::Duplicate,
            Self::Capacity(_) => ErrorKind::Capacity,
            Self::UnknownTask(_) | Self::Unavailable(_) => ErrorKind::NotFound,
            Self::InvalidTransition { .. } => ErrorKind::Conflict,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(source) => write!(f, "{source}"),
            Self::Validation(msg) => write!(f, "validation failed: {msg}"),
            Self::Duplicate(hash) => write!(f, "content hash {hash} is already registered"),
            Self::Capacity(max) => write!(f, "task capacity reached ({max} files)"),
            Self::UnknownTask(hash) => write!(f, "no task for content hash {hash}"),
            Self::Unavailable(msg) => write!(f, "not available: {msg}"),
            Self::InvalidTransition { from, to } => {
                write!(f, "invalid task transition {from:?} -> {to:?}")
            }
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(source) => Some(source),
            Self::Validation(_)
            | Self::Duplicate(_)
            | Self::Capacity(_)
            | Self::UnknownTask(_)
            | Self::Unavailable(_)
            | Self::InvalidTransition { .. } => None,
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}
