use thiserror::Error;

#[derive(Error, Debug)]
pub enum DittoError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Operation not allowed: {0}")]
    Conflict(String),

    #[error("Administrative privileges are required to run a scan")]
    PrivilegeRequired,

    #[error("External tool failed: {0}")]
    ExternalTool(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DittoError {
    pub fn not_found(kind: &str, id: &str) -> Self {
        DittoError::NotFound(format!("{} {}", kind, id))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DittoError::NotFound(_))
    }

    /// Prefix the message with `what`, keeping the error kind.
    pub fn context(self, what: &str) -> Self {
        match self {
            DittoError::Validation(m) => DittoError::Validation(format!("{}: {}", what, m)),
            DittoError::NotFound(m) => DittoError::NotFound(format!("{}: {}", what, m)),
            DittoError::Conflict(m) => DittoError::Conflict(format!("{}: {}", what, m)),
            DittoError::PrivilegeRequired => DittoError::PrivilegeRequired,
            DittoError::ExternalTool(m) => DittoError::ExternalTool(format!("{}: {}", what, m)),
            DittoError::Timeout(m) => DittoError::Timeout(format!("{}: {}", what, m)),
            DittoError::Internal(m) => DittoError::Internal(format!("{}: {}", what, m)),
            DittoError::Io(e) => DittoError::ExternalTool(format!("{}: {}", what, e)),
            DittoError::Json(e) => DittoError::ExternalTool(format!("{}: {}", what, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_keeps_error_kind() {
        let err = DittoError::Timeout("ran too long".to_string()).context("Scan failed");
        assert!(matches!(err, DittoError::Timeout(_)));
        assert_eq!(err.to_string(), "Timed out: Scan failed: ran too long");
    }

    #[test]
    fn context_turns_io_into_external_tool() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = DittoError::from(io).context("Failed to read results");
        assert!(matches!(err, DittoError::ExternalTool(_)));
        assert!(err.to_string().contains("Failed to read results: gone"));
    }

    #[test]
    fn not_found_names_the_kind() {
        let err = DittoError::not_found("scan", "scan_1");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Not found: scan scan_1");
    }
}

pub type Result<T> = std::result::Result<T, DittoError>;
