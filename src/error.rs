use std::fmt;

/// Main error type
#[derive(Debug, Clone)]
pub enum Error {
    /// Configuration error
    Config(String),
    /// Policy failed validation at load time; the server must not start
    PolicyValidation(String),
    /// Cloud API error after retries were exhausted
    CloudApi(String),
    /// Cache backend error; callers treat this as a miss
    Cache(String),
    /// Input validation error with the offending field and reason
    Validation(String),
    /// Security violation detected by the guardrails; carries the kind only
    SecurityViolation(String),
    /// Outbound call or scan exceeded its deadline
    Timeout(String),
    /// Operation was cancelled
    Cancelled(String),
    /// Persistent store error
    Store(String),
    /// Parse error
    Parse(String),
    /// Not found error
    NotFound(String),
    /// Internal error
    Internal(String),
}

impl Error {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Error::Config(message.into())
    }

    /// Create a new policy validation error
    pub fn policy_validation<S: Into<String>>(message: S) -> Self {
        Error::PolicyValidation(message.into())
    }

    /// Create a new cloud API error
    pub fn cloud_api<S: Into<String>>(message: S) -> Self {
        Error::CloudApi(message.into())
    }

    /// Create a new cache error
    pub fn cache<S: Into<String>>(message: S) -> Self {
        Error::Cache(message.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Error::Validation(message.into())
    }

    /// Create a new security violation carrying the violation kind only
    pub fn security_violation<S: Into<String>>(kind: S) -> Self {
        Error::SecurityViolation(kind.into())
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Error::Timeout(message.into())
    }

    /// Create a new cancellation error
    pub fn cancelled<S: Into<String>>(message: S) -> Self {
        Error::Cancelled(message.into())
    }

    /// Create a new store error
    pub fn store<S: Into<String>>(message: S) -> Self {
        Error::Store(message.into())
    }

    /// Create a parse error
    pub fn parsing<S: Into<String>>(message: S) -> Self {
        Error::Parse(message.into())
    }

    /// Create a not found error
    pub fn not_found<S: Into<String>>(message: S) -> Self {
        Error::NotFound(message.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Error::Internal(message.into())
    }

    /// Stable kind string used by the error sanitiser and audit entries
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "config-error",
            Error::PolicyValidation(_) => "policy-validation-error",
            Error::CloudApi(_) => "cloud-api-error",
            Error::Cache(_) => "cache-error",
            Error::Validation(_) => "validation-error",
            Error::SecurityViolation(_) => "security-violation",
            Error::Timeout(_) => "timeout",
            Error::Cancelled(_) => "cancelled",
            Error::Store(_) => "store-error",
            Error::Parse(_) => "parse-error",
            Error::NotFound(_) => "not-found",
            Error::Internal(_) => "internal-error",
        }
    }

    /// Whether the error may be retried by the caller
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::CloudApi(_) | Error::Cache(_) | Error::Timeout(_) | Error::Store(_)
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(message) => write!(f, "Configuration error: {}", message),
            Error::PolicyValidation(message) => write!(f, "Policy validation error: {}", message),
            Error::CloudApi(message) => write!(f, "Cloud API error: {}", message),
            Error::Cache(message) => write!(f, "Cache error: {}", message),
            Error::Validation(message) => write!(f, "Validation error: {}", message),
            Error::SecurityViolation(kind) => write!(f, "Security violation: {}", kind),
            Error::Timeout(message) => write!(f, "Timeout: {}", message),
            Error::Cancelled(message) => write!(f, "Cancelled: {}", message),
            Error::Store(message) => write!(f, "Store error: {}", message),
            Error::Parse(message) => write!(f, "Parse error: {}", message),
            Error::NotFound(message) => write!(f, "Not found: {}", message),
            Error::Internal(message) => write!(f, "Internal error: {}", message),
        }
    }
}

impl std::error::Error for Error {}

/// Result type for the FinOps MCP server
pub type Result<T> = std::result::Result<T, Error>;

/// From serde_json::Error to Error
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Parse(format!("JSON error: {}", err))
    }
}

/// From std::io::Error to Error
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(format!("I/O error: {}", err))
    }
}

/// From sqlx::Error to Error
impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Store(format!("Database error: {}", err))
    }
}
