use thiserror::Error;

/// regsweep error types
#[derive(Error, Debug)]
pub enum SweepError {
    /// Identifier is not a 24-character lowercase hex token
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// Identifier filter file contains a malformed entry
    #[error("Invalid filter entry on line {line}: {content:?} ({message})")]
    FilterParse {
        line: usize,
        content: String,
        message: String,
    },

    /// Repository or tag does not exist in the image store
    #[error("Not found: {0}")]
    NotFound(String),

    /// Backend answered "too many requests"
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Network failure, timeout or 5xx from a backend
    #[error("Transient backend error: {0}")]
    Transient(String),

    /// Permanent registry failure (auth, malformed response, ...)
    #[error("Registry error: {registry} - {message}")]
    Registry { registry: String, message: String },

    /// Metadata store failure
    #[error("Metadata store error: {0}")]
    Metadata(String),

    /// Backup of an image failed
    #[error("Backup failed: {0}")]
    Backup(String),

    /// Could not toggle delete enablement on the backing store
    #[error("Delete enablement error: {0}")]
    DeleteToggle(String),

    /// Checkpoint persistence failure
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Liveness provider failure
    #[error("Liveness provider error: {provider} - {message}")]
    Provider { provider: String, message: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Operation was cancelled between candidates
    #[error("Operation cancelled")]
    Cancelled,

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl SweepError {
    /// Whether the retry governor should try the call again.
    ///
    /// Unknown backend failures count as retryable; validation, not-found
    /// and permanent registry failures do not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SweepError::RateLimited(_) | SweepError::Transient(_) | SweepError::Other(_)
        )
    }

    /// Whether the backend explicitly asked us to slow down.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, SweepError::RateLimited(_))
    }

    /// Whether the error means the repository or tag is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SweepError::NotFound(_))
    }

    /// Classify a free-form backend failure message.
    ///
    /// Registries surface most conditions only through status codes and
    /// error envelopes embedded in the message text.
    pub fn classify(context: &str, message: &str) -> Self {
        let lower = message.to_lowercase();
        let detail = format!("{context}: {message}");

        if lower.contains("429") || lower.contains("too many requests") || lower.contains("rate limit") {
            return SweepError::RateLimited(detail);
        }
        if lower.contains("name_unknown")
            || lower.contains("nameunknown")
            || lower.contains("name unknown")
            || lower.contains("manifest_unknown")
            || lower.contains("manifestunknown")
            || lower.contains("manifest unknown")
            || lower.contains("not found")
            || lower.contains("404")
        {
            return SweepError::NotFound(detail);
        }
        if lower.contains("401")
            || lower.contains("403")
            || lower.contains("unauthorized")
            || lower.contains("forbidden")
            || lower.contains("denied")
        {
            return SweepError::Registry {
                registry: context.to_string(),
                message: message.to_string(),
            };
        }
        const NETWORK: &[&str] = &[
            "connection",
            "timeout",
            "timed out",
            "network",
            "dns",
            "refused",
            "unreachable",
            "reset",
            "broken pipe",
            "500",
            "502",
            "503",
            "504",
        ];
        if NETWORK.iter().any(|needle| lower.contains(needle)) {
            return SweepError::Transient(detail);
        }
        SweepError::Other(detail)
    }
}

impl From<serde_json::Error> for SweepError {
    fn from(err: serde_json::Error) -> Self {
        SweepError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for SweepError {
    fn from(err: serde_yaml::Error) -> Self {
        SweepError::Serialization(err.to_string())
    }
}

/// Result type alias for regsweep operations
pub type Result<T> = std::result::Result<T, SweepError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_parse_display_names_line() {
        let error = SweepError::FilterParse {
            line: 3,
            content: "environment:xyz".to_string(),
            message: "expected 24 characters".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Invalid filter entry on line 3: \"environment:xyz\" (expected 24 characters)"
        );
    }

    #[test]
    fn test_registry_error_display() {
        let error = SweepError::Registry {
            registry: "docker-registry:5000".to_string(),
            message: "Authentication failed".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Registry error: docker-registry:5000 - Authentication failed"
        );
    }

    #[test]
    fn test_provider_error_display() {
        let error = SweepError::Provider {
            provider: "workloads".to_string(),
            message: "report missing".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Liveness provider error: workloads - report missing"
        );
    }

    #[test]
    fn test_classify_rate_limit() {
        let error = SweepError::classify("list tags", "HTTP 429 Too Many Requests");
        assert!(error.is_rate_limited());
        assert!(error.is_retryable());
    }

    #[test]
    fn test_classify_not_found() {
        let error = SweepError::classify("list tags", "NAME_UNKNOWN: repository name not known");
        assert!(error.is_not_found());
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_classify_auth_is_permanent() {
        let error = SweepError::classify("registry", "401 Unauthorized");
        assert!(matches!(error, SweepError::Registry { .. }));
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_classify_network_is_transient() {
        let error = SweepError::classify("inspect", "connection reset by peer");
        assert!(matches!(error, SweepError::Transient(_)));
        assert!(error.is_retryable());
    }

    #[test]
    fn test_classify_unknown_defaults_to_retryable() {
        let error = SweepError::classify("inspect", "something odd happened");
        assert!(matches!(error, SweepError::Other(_)));
        assert!(error.is_retryable());
    }

    #[test]
    fn test_validation_errors_not_retryable() {
        assert!(!SweepError::InvalidIdentifier("zz".to_string()).is_retryable());
        assert!(!SweepError::Backup("copy failed".to_string()).is_retryable());
        assert!(!SweepError::Cancelled.is_retryable());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: SweepError = io_error.into();
        assert!(matches!(error, SweepError::Io(_)));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ invalid");
        let error: SweepError = result.unwrap_err().into();
        assert!(matches!(error, SweepError::Serialization(_)));
    }

    #[test]
    fn test_serde_yaml_error_conversion() {
        let result: std::result::Result<serde_yaml::Value, _> =
            serde_yaml::from_str("invalid: yaml: content:");
        let error: SweepError = result.unwrap_err().into();
        assert!(matches!(error, SweepError::Serialization(_)));
    }
}
