/// Core error type for the host.
///
/// Adapter crates map their transport-specific failures into this type so the
/// supervisor can treat a failing account uniformly (log, skip, keep going).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("repository error: {0}")]
    Repository(#[from] rusqlite::Error),

    #[error("repository is closed")]
    RepositoryClosed,

    #[error("invalid prefix {0:?}: must be 1-3 non-whitespace characters")]
    InvalidPrefix(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unsupported by transport: {0}")]
    Unsupported(&'static str),

    #[error("module load failed: {0}")]
    Load(#[from] crate::modules::LoadError),

    #[error("external error: {0}")]
    External(String),
}

pub type Result<T> = std::result::Result<T, Error>;
