//! Configuration Validation
//!
//! Validates all configuration at startup. Every problem is collected so
//! the operator sees the full list at once.

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigValidationError {
    pub field: String,
    pub value: String,
    pub message: String,
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Invalid configuration for '{}': {} (value: {})",
            self.field, self.message, self.value
        )
    }
}

impl std::error::Error for ConfigValidationError {}

/// Result of config validation
pub type ConfigResult<T> = Result<T, Vec<ConfigValidationError>>;

/// Shown instead of secret values
const REDACTED: &str = "<redacted>";

/// Configuration validator
pub struct ConfigValidator {
    errors: Vec<ConfigValidationError>,
}

impl ConfigValidator {
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    fn error(&mut self, field: &str, value: impl std::fmt::Display, message: &str) {
        self.errors.push(ConfigValidationError {
            field: field.to_string(),
            value: value.to_string(),
            message: message.to_string(),
        });
    }

    /// Validate port number (1-65535)
    pub fn validate_port(&mut self, field: &str, port: u16) -> &mut Self {
        if port == 0 {
            self.error(field, port, "Port must be between 1 and 65535");
        }
        self
    }

    /// Validate range (inclusive)
    pub fn validate_range(&mut self, field: &str, value: i64, min: i64, max: i64) -> &mut Self {
        if value < min || value > max {
            self.error(field, value, &format!("Value must be between {} and {}", min, max));
        }
        self
    }

    /// Validate non-empty string
    pub fn validate_non_empty(&mut self, field: &str, value: &str) -> &mut Self {
        if value.trim().is_empty() {
            self.error(field, value, "Value cannot be empty");
        }
        self
    }

    /// Validate a secret is present and long enough; the value is never echoed
    pub fn validate_secret(&mut self, field: &str, value: &str, min_len: usize) -> &mut Self {
        if value.trim().is_empty() {
            self.error(field, REDACTED, "Secret cannot be empty");
        } else if value.len() < min_len {
            self.error(
                field,
                REDACTED,
                &format!("Secret must be at least {} characters", min_len),
            );
        }
        self
    }

    /// Validate HTTP URL format
    pub fn validate_url(&mut self, field: &str, value: &str) -> &mut Self {
        self.validate_url_scheme(field, value, &["http", "https"])
    }

    /// Validate URL starts with one of `schemes`. Credentials in the URL are
    /// not echoed back.
    pub fn validate_url_scheme(&mut self, field: &str, value: &str, schemes: &[&str]) -> &mut Self {
        let matches = schemes
            .iter()
            .any(|scheme| value.starts_with(&format!("{}://", scheme)));
        if !matches {
            let expected = schemes
                .iter()
                .map(|s| format!("{}://", s))
                .collect::<Vec<_>>()
                .join(" or ");
            self.error(
                field,
                redact_url(value),
                &format!("URL must start with {}", expected),
            );
        }
        self
    }

    /// Validate duration in seconds
    pub fn validate_duration_secs(&mut self, field: &str, secs: u64, min_secs: u64, max_secs: u64) -> &mut Self {
        if secs < min_secs || secs > max_secs {
            self.error(
                field,
                format!("{}s", secs),
                &format!("Duration must be between {}s and {}s", min_secs, max_secs),
            );
        }
        self
    }

    /// Finish validation and return result
    pub fn finish(self) -> ConfigResult<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self.errors)
        }
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// Strip `user:password@` from a connection URL
fn redact_url(value: &str) -> String {
    match (value.find("://"), value.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://{}@{}", &value[..scheme_end], REDACTED, &value[at + 1..])
        }
        _ => value.to_string(),
    }
}

/// Format validation errors for display
pub fn format_validation_errors(errors: &[ConfigValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_validation() {
        let mut v = ConfigValidator::new();
        v.validate_port("port", 4001);
        assert!(v.finish().is_ok());

        let mut v = ConfigValidator::new();
        v.validate_port("port", 0);
        assert!(v.finish().is_err());
    }

    #[test]
    fn test_range_validation() {
        let mut v = ConfigValidator::new();
        v.validate_range("retries", 2, 0, 10);
        assert!(v.finish().is_ok());

        let mut v = ConfigValidator::new();
        v.validate_range("retries", 20, 0, 10);
        let err = v.finish().unwrap_err();
        assert_eq!(err.len(), 1);
        assert!(err[0].message.contains("between"));
    }

    #[test]
    fn test_multiple_errors() {
        let mut v = ConfigValidator::new();
        v.validate_port("port", 0)
            .validate_range("pool", -5, 1, 1000)
            .validate_non_empty("host", "")
            .validate_duration_secs("interval", 10, 60, 86400);

        let errors = v.finish().unwrap_err();
        assert_eq!(errors.len(), 4);
    }

    #[test]
    fn test_secret_is_never_echoed() {
        let mut v = ConfigValidator::new();
        v.validate_secret("AGENT_TOKEN", "short", 16);
        let errors = v.finish().unwrap_err();
        assert_eq!(errors[0].value, REDACTED);
        assert!(!errors[0].to_string().contains("short"));
    }

    #[test]
    fn test_url_scheme() {
        let mut v = ConfigValidator::new();
        v.validate_url("AGENT_URL", "https://agent:4001")
            .validate_url_scheme("MONGODB_URL", "mongodb+srv://cluster", &["mongodb", "mongodb+srv"]);
        assert!(v.finish().is_ok());

        let mut v = ConfigValidator::new();
        v.validate_url_scheme("DATABASE_URL", "mysql://root:hunter2@db/app", &["postgres", "postgresql"]);
        let errors = v.finish().unwrap_err();
        assert_eq!(errors[0].value, "mysql://<redacted>@db/app");
        assert!(errors[0].message.contains("postgres://"));
    }
}
