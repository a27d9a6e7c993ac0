use tollgate_core::{Gvk, ObjectError};
use tollgate_gvk::AggregatorError;

/// Errors surfaced by the cache manager. Collaborator failures carry the underlying message.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache manager config: missing {0}")]
    Config(&'static str),
    #[error("cache manager already started")]
    AlreadyStarted,
    #[error(transparent)]
    Aggregator(#[from] AggregatorError),
    #[error("invalid object: {0}")]
    Object(#[from] ObjectError),
    #[error("evaluating namespace exclusion for {gvk} object: {source}")]
    Exclusion { gvk: Gvk, source: ObjectError },
    #[error("adding {key} to data store: {cause:#}")]
    AddData { key: String, cause: anyhow::Error },
    #[error("removing {key} from data store: {cause:#}")]
    RemoveData { key: String, cause: anyhow::Error },
    #[error("wiping data store: {cause:#}")]
    Wipe { cause: anyhow::Error },
    #[error("listing {gvk}: {cause:#}")]
    List { gvk: Gvk, cause: anyhow::Error },
    #[error("syncing {gvk}: {source}")]
    Sync { gvk: Gvk, source: Box<CacheError> },
}

pub type Result<T, E = CacheError> = std::result::Result<T, E>;
