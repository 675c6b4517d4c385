use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Lease lost for lock {key:?}")]
    LeaseLost { key: String },

    #[error("Lock service error: {0}")]
    LockService(String),

    #[error("Publish to {subject:?} failed: {reason}")]
    Publish { subject: String, reason: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Group member {name:?} exited: {reason}")]
    MemberExited { name: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<etcd_client::Error> for Error {
    fn from(err: etcd_client::Error) -> Self {
        Error::LockService(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
