//! Error types for the provisioning pipeline.
//!
//! Every variant is fatal: the pipeline stops at the first error and the
//! caller must treat provisioning as not having happened.

/// Result type alias for provisioning operations.
pub type Result<T> = std::result::Result<T, ProvisionError>;

/// Errors that can occur while describing runtime provisioning.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    // =========================================================================
    // Runtime distribution
    // =========================================================================
    /// The archive, or its digest, could not be obtained.
    #[error("failed to fetch '{url}': {reason}")]
    Fetch { url: String, reason: String },

    /// The archive digest does not match the pinned checksum.
    #[error("checksum mismatch for '{archive}': expected sha256 {expected}, got {actual}")]
    Integrity {
        archive: String,
        expected: String,
        actual: String,
    },

    /// The archive is malformed or truncated.
    #[error("cannot extract '{archive}': {reason}")]
    Extraction { archive: String, reason: String },

    /// The distribution description itself is unusable.
    #[error("invalid runtime distribution: {0}")]
    InvalidDistribution(String),

    // =========================================================================
    // Tooling and packages
    // =========================================================================
    /// A tool or package install cannot be expressed safely.
    #[error("cannot install '{tool}': {reason}")]
    ToolInstall { tool: String, reason: String },

    /// A directory or artifact location is unusable.
    #[error("cannot write '{path}': {reason}")]
    ConfigWrite { path: String, reason: String },
}

impl ProvisionError {
    /// True for checksum mismatches.
    pub fn is_integrity(&self) -> bool {
        matches!(self, ProvisionError::Integrity { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integrity_message_names_both_digests() {
        let err = ProvisionError::Integrity {
            archive: "julia.tar.gz".into(),
            expected: "aa".into(),
            actual: "bb".into(),
        };

        let msg = err.to_string();
        assert!(msg.contains("julia.tar.gz"));
        assert!(msg.contains("expected sha256 aa"));
        assert!(msg.contains("got bb"));
        assert!(err.is_integrity());
    }

    #[test]
    fn test_non_integrity_errors() {
        let err = ProvisionError::ToolInstall {
            tool: "Bad\"Name".into(),
            reason: "invalid character".into(),
        };
        assert!(!err.is_integrity());
        assert!(err.to_string().starts_with("cannot install"));
    }
}
