use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::policy::PolicyError;

/// An error talking to a backing store.
#[derive(Debug, Error)]
pub enum BackingError {
    /// The store did not answer within the configured timeout.
    #[error("backing store timed out after {0:?}")]
    Timeout(Duration),
    /// A value could not be serialized for the store.
    #[error("failed to encode cache entry")]
    Encode(#[source] serde_json::Error),
    /// A stored entry could not be read back.
    #[error("failed to decode cache entry")]
    Decode(#[source] serde_json::Error),
    #[error("backing store io failed")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The error returned from memoized calls.
///
/// Only the direct caller sees [`Policy`](Self::Policy) and [`Backing`](Self::Backing) errors.
/// A [`Producer`](Self::Producer) error is shared with every caller that was waiting for the same
/// computation.
#[derive(Debug, Error)]
pub enum MemoError<E> {
    #[error("{0}")]
    Producer(E),
    #[error("invalid time policy")]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Backing(#[from] BackingError),
}

impl<E> MemoError<E> {
    /// The producer error, if this is one.
    pub fn producer(&self) -> Option<&E> {
        match self {
            Self::Producer(err) => Some(err),
            _ => None,
        }
    }

    pub fn into_producer(self) -> Option<E> {
        match self {
            Self::Producer(err) => Some(err),
            _ => None,
        }
    }
}
