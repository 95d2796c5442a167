use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Storage lock poisoned: {0}")]
    StorageLock(String),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Dependency cycle detected; unresolved phases: {}", phases.join(", "))]
    Cycle { phases: Vec<String> },

    #[error("Command failed: {0}")]
    Command(String),

    #[error("Phase {phase_id} failed: {error}")]
    PhaseFailed { phase_id: String, error: String },

    #[error("Progress {value} for task {task_id} is outside [0, 1]")]
    InvalidProgress { task_id: String, value: f64 },

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

pub type Result<T> = std::result::Result<T, Error>;
