use thiserror::Error;
use ub_common::Family;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("controller error: {0}")]
    Controller(#[from] ub_unifi::UnifiError),

    #[error("store error: {0}")]
    Store(#[from] ub_store::StoreError),

    #[error("rate limited by local gate")]
    RateDeferred,

    #[error("no shard manager for site '{site}' family {family}")]
    UnknownSite { site: String, family: Family },

    #[error("zone '{0}' not present on controller")]
    UnknownZone(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("shutting down")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, EngineError>;
