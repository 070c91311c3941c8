use thiserror::Error as ThisError;

use crate::hash::Hash;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum Error {
    #[error("hash not present in store: {0}")]
    NotFound(Hash),

    #[error("malformed proof: {0}")]
    MalformedProof(String),

    #[error("store io: {0}")]
    StoreIo(String),

    #[error("empty keys are not allowed")]
    InvalidKey,

    #[error("tree has no backing store")]
    NoStore,

    #[error("corrupt tree: {0}")]
    Corrupt(String),

    #[error("failed to deserialize: {0}")]
    Deserialization(String),
}

impl From<hex::FromHexError> for Error {
    fn from(error: hex::FromHexError) -> Self {
        Error::Deserialization(format!("{}", error))
    }
}
