// SPDX-License-Identifier: GPL-3.0-only

//! Error types for quiesce operations

use thiserror::Error;

/// Errors surfaced by a [`StorageOps`](crate::StorageOps) implementation.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The object or one of its interfaces disappeared between query and
    /// action. The resolver treats this as "nothing left to do there".
    #[error("object no longer present: {0}")]
    NotFound(String),

    /// The daemon rejected or failed the operation; the message is the
    /// daemon's own.
    #[error("operation failed: {0}")]
    Failed(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("D-Bus error: {0}")]
    Zbus(#[from] zbus::Error),
}

/// Errors from [`ensure_unused`](crate::ensure_unused), labelled with the
/// stage that failed.
#[derive(Debug, Error)]
pub enum QuiesceError {
    #[error("error unmounting filesystem: {source}")]
    Unmount { source: ServiceError },

    #[error("error locking device: {source}")]
    Lock { source: ServiceError },

    #[error("error disabling autoclear for loop device: {source}")]
    SetAutoclear { source: ServiceError },

    #[error("operation cancelled")]
    Cancelled,
}

impl QuiesceError {
    /// Whether this error is a caller-initiated abort. Callers typically
    /// skip the error dialog for these.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Unmount { source } | Self::Lock { source } | Self::SetAutoclear { source } => {
                matches!(source, ServiceError::Cancelled)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_labels_survive_into_display() {
        let err = QuiesceError::Unmount {
            source: ServiceError::Failed("target is busy".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.contains("error unmounting filesystem"));
        assert!(msg.contains("target is busy"));
    }

    #[test]
    fn cancellation_is_distinguishable_through_any_stage() {
        assert!(QuiesceError::Cancelled.is_cancelled());
        assert!(
            QuiesceError::Lock {
                source: ServiceError::Cancelled
            }
            .is_cancelled()
        );
        assert!(
            !QuiesceError::Lock {
                source: ServiceError::Failed("no".to_string())
            }
            .is_cancelled()
        );
    }
}
