use thiserror::Error;

/// Errors surfaced by the versioning engines. Each variant carries the HTTP
/// status the enclosing service maps it to.
#[derive(Debug, Error)]
pub enum VersionError {
    #[error("invalid id: {0}")]
    NotFound(String),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("name already exists: {0}")]
    NameConflict(String),

    #[error("another operation is in progress, try again later")]
    BusyTryLater,

    /// The workspace has not changed since `version_id` was created. Callers
    /// should treat `version_id` as the resulting version.
    #[error("not modified")]
    NotModified { version_id: crate::store::FolderId },

    #[error("version is in use by a run and cannot be deleted")]
    VersionInUse,

    #[error("metadata store error: {0}")]
    Storage(#[from] crate::store::StoreError),

    #[error("filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    #[error("job queue error: {0}")]
    JobQueue(String),
}

pub type Result<T> = std::result::Result<T, VersionError>;

impl VersionError {
    pub fn http_status(&self) -> u16 {
        match self {
            VersionError::NotFound(_) => 400,
            VersionError::InvalidName(_) => 400,
            VersionError::NameConflict(_) => 409,
            VersionError::BusyTryLater => 409,
            VersionError::NotModified { .. } => 303,
            VersionError::VersionInUse => 461,
            VersionError::Storage(crate::store::StoreError::NotFound(_)) => 400,
            VersionError::Storage(_) => 500,
            VersionError::Filesystem(_) => 500,
            VersionError::JobQueue(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FolderId;

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(VersionError::NotFound("x".into()).http_status(), 400);
        assert_eq!(VersionError::InvalidName("a/b".into()).http_status(), 400);
        assert_eq!(VersionError::NameConflict("v1".into()).http_status(), 409);
        assert_eq!(VersionError::BusyTryLater.http_status(), 409);
        assert_eq!(VersionError::VersionInUse.http_status(), 461);
        let nm = VersionError::NotModified { version_id: FolderId::generate() };
        assert_eq!(nm.http_status(), 303);
    }

    #[test]
    fn test_io_error_conversion() {
        let err: VersionError =
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope").into();
        assert_eq!(err.http_status(), 500);
    }
}
