use std::sync::Arc;

use thiserror::Error;

use crate::name::Name;

/// A string could not be parsed into a [`Name`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NameError {
    #[error("name is empty")]
    Empty,

    #[error("empty token at position {0} in '{1}'")]
    EmptyToken(usize, String),

    #[error("token body is empty")]
    EmptyBody,

    #[error("unterminated index in '{0}'")]
    UnterminatedIndex(String),

    #[error("invalid index '{0}', expected an unsigned integer")]
    InvalidIndex(String),

    #[error("unexpected character after index in '{0}'")]
    TrailingIndex(String),

    #[error("dangling escape at the end of '{0}'")]
    DanglingEscape(String),
}

/// Configuration lookup failed.
#[derive(Debug, Error, Clone)]
pub enum ConfigError {
    #[error(transparent)]
    Name(#[from] NameError),

    #[error("key '{0}' not found")]
    Missing(Name),

    #[error("key '{key}' holds {found}, expected {expected}")]
    WrongType {
        key: Name,
        expected: &'static str,
        found: &'static str,
    },

    #[error("configuration is not a JSON object")]
    NotAnObject,

    #[error("invalid JSON configuration: {0}")]
    Json(Arc<serde_json::Error>),
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Json(Arc::new(e))
    }
}

/// Outcome of a failed or cancelled [`Goal`](crate::Goal).
///
/// Errors are shared by every caller of the same goal, so this type is cheap
/// to clone. A goal which failed because one of its dependencies failed
/// reports [`GoalError::Dependency`], naming the dependency and carrying the
/// original cause, also reachable with [`GoalError::root_cause`].
#[derive(Debug, Error, Clone)]
pub enum GoalError {
    #[error(transparent)]
    Failed(Arc<anyhow::Error>),

    #[error("dependency '{goal}' failed: {source}")]
    Dependency {
        goal: String,
        #[source]
        source: Box<GoalError>,
    },

    #[error("goal was cancelled")]
    Cancelled,
}

impl GoalError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self::Failed(Arc::new(err.into()))
    }

    /// Walks the dependency chain down to the goal where things went wrong.
    pub fn root_cause(&self) -> &GoalError {
        let mut current = self;
        while let GoalError::Dependency { source, .. } = current {
            current = source;
        }
        current
    }

    /// Same as [`GoalError::root_cause`], by value.
    pub(crate) fn into_root(self) -> GoalError {
        let mut current = self;
        loop {
            match current {
                GoalError::Dependency { source, .. } => current = *source,
                other => return other,
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root_cause(), GoalError::Cancelled)
    }
}

impl From<anyhow::Error> for GoalError {
    fn from(e: anyhow::Error) -> Self {
        GoalError::Failed(Arc::new(e))
    }
}

#[derive(Debug, Error)]
pub enum DataError {
    #[error(transparent)]
    Name(#[from] NameError),

    #[error("Duplicate item '{0}'")]
    Duplicate(Name),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] glob::PatternError),
}

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("Action '{0}': {1}")]
    Item(String, anyhow::Error),

    #[error("Action '{0}' produced duplicate item '{1}'")]
    Duplicate(String, Name),

    #[error(transparent)]
    Data(#[from] DataError),
}

/// A task model could not be constructed. Nothing has been executed when
/// this error is returned.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Unknown data source '{0}'")]
    UnknownData(Name),

    #[error("Unknown task '{0}'")]
    UnknownTask(String),

    #[error("Task '{0}' depends on itself")]
    SelfReference(String),

    #[error("Dependency cycle between tasks: {0}")]
    Cycle(String),

    #[error("Data '{0}' holds {1}, but the task consumes {2}")]
    TypeMismatch(String, &'static str, &'static str),

    #[error("Model step of task '{0}':\n{1}")]
    Userland(String, anyhow::Error),
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("Stage '{0}':\n{1}")]
    Stage(String, ActionError),

    #[error("Task '{0}' produces {1}, requested {2}")]
    OutputType(String, &'static str, &'static str),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Couldn't encode cached result.\n{0}")]
    Encode(String),

    #[error("Couldn't decode cached result.\n{0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Target '{0}' not found")]
    UnknownTarget(String),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("Task '{0}':\n{1}")]
    Task(String, TaskError),

    #[error("Couldn't read workspace configuration.\n{0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Couldn't build worker pool.\n{0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// A loader operation failed. Pipelines log these and drop the row.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Loader is closed")]
    Closed,

    #[error("Row has {0} values, expected {1}")]
    Arity(usize, usize),

    #[error("Row has no key in column '{0}'")]
    MissingKey(String),

    #[error("Duplicate key {0}")]
    DuplicateKey(String),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Renderer '{0}' failed: {1}")]
    Render(&'static str, anyhow::Error),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Connection is {0}")]
    NotOpen(crate::io::remote::ConnectionState),

    #[error("Responder failed: {0}")]
    Responder(String),

    #[error("Response correlation mismatch: sent {sent}, received {received}")]
    Correlation { sent: u64, received: u64 },

    #[error("Malformed message: {0}")]
    Codec(String),
}
