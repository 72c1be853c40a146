use thiserror::Error;

use crate::github::GithubError;
use crate::store::StoreError;

/// Boundary error type for engine construction and operations that can
/// fail against either the store or the forge.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("GitHub error: {0}")]
    Github(#[from] GithubError),
}

pub type Result<T> = std::result::Result<T, CoreError>;
