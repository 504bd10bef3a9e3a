use std::path::PathBuf;

/// Failure taxonomy for the update pipeline.
///
/// `Network` and `Incomplete` are transient and retried on the next check.
/// `Parse` means the release index returned something we do not understand;
/// it is surfaced on manual checks only. `Locked` is retried with backoff
/// inside the swap helper, nowhere else.
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("network error: {0}")]
    Network(String),

    #[error("malformed release data: {0}")]
    Parse(String),

    #[error("incomplete download: expected {expected} bytes, wrote {written}")]
    Incomplete { expected: u64, written: u64 },

    #[error("no release asset named '{0}'")]
    AssetMissing(String),

    #[error("version marker not found at {}", .0.display())]
    Marker(PathBuf),

    #[error("file in use: {}", .0.display())]
    Locked(PathBuf),

    #[error("backup restore failed: {0}")]
    BackupRestore(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl UpdateError {
    /// Classify a reqwest failure: body/decode problems are `Parse`,
    /// everything else (connect, timeout, status) is `Network`.
    pub fn from_http(err: reqwest::Error) -> Self {
        if err.is_decode() {
            UpdateError::Parse(err.to_string())
        } else {
            UpdateError::Network(err.to_string())
        }
    }

    /// Whether the next scheduled check should retry opportunistically.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            UpdateError::Network(_) | UpdateError::Incomplete { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(UpdateError::Network("timeout".into()).is_transient());
        assert!(UpdateError::Incomplete {
            expected: 10,
            written: 3
        }
        .is_transient());
        assert!(!UpdateError::Parse("bad tag".into()).is_transient());
        assert!(!UpdateError::AssetMissing("app".into()).is_transient());
    }
}
