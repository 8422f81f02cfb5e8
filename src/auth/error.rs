//! Authentication and authorization errors

use crate::storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    /// Bad, unknown, expired or spent credential. Deliberately carries no
    /// detail about which.
    #[error("invalid credential")]
    InvalidCredential,

    /// Token absent at the store layer (also used for spent/expired tokens)
    #[error("not found")]
    NotFound,

    /// Caller is not permitted to perform the operation
    #[error("access denied")]
    AccessDenied,

    /// Operation needs a credential store and none is attached
    #[error("credential store not configured")]
    StoreUnavailable,

    #[error(transparent)]
    Store(#[from] StorageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_credential_carries_no_detail() {
        assert_eq!(AuthError::InvalidCredential.to_string(), "invalid credential");
    }

    #[test]
    fn test_store_error_is_transparent() {
        let err: AuthError = StorageError::Conflict("token already exists".to_string()).into();
        assert_eq!(err.to_string(), "conflict: token already exists");
    }
}
