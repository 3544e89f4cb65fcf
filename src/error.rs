//! Unified error types for the sync engine
//!
//! Every failure that crosses a component boundary is a [`MailError`]. Errors
//! carry a stable numeric [`ErrorCode`] so that account status records survive
//! serialization and a UI-facing collaborator can render a specific message
//! ("password incorrect" vs. "no network") rather than a generic failure.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable numeric error codes persisted on account records.
///
/// The numeric ranges group errors into classes: 1000–1999 authentication,
/// 3000–3999 connection, 4000–4999 SSL/certificate, 5000–5999 server request,
/// 9800+ configuration, 10000+ internal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    pub const NONE: ErrorCode = ErrorCode(0);
    pub const BAD_USERNAME_OR_PASSWORD: ErrorCode = ErrorCode(1000);
    pub const MISSING_CREDENTIALS: ErrorCode = ErrorCode(1010);
    pub const ACCOUNT_LOCKED: ErrorCode = ErrorCode(1100);
    pub const ACCOUNT_UNAVAILABLE: ErrorCode = ErrorCode(1110);
    pub const ACCOUNT_WEB_LOGIN_REQUIRED: ErrorCode = ErrorCode(1120);
    pub const ACCOUNT_UNKNOWN_AUTH_ERROR: ErrorCode = ErrorCode(1299);
    pub const ACCOUNT_NEEDS_PROVISIONING: ErrorCode = ErrorCode(1310);
    pub const LOGIN_TIMEOUT: ErrorCode = ErrorCode(1320);
    pub const HOST_NOT_FOUND: ErrorCode = ErrorCode(3000);
    pub const CONNECTION_TIMED_OUT: ErrorCode = ErrorCode(3010);
    pub const CONNECTION_FAILED: ErrorCode = ErrorCode(3099);
    pub const NO_NETWORK: ErrorCode = ErrorCode(3200);
    pub const SSL_CERTIFICATE_EXPIRED: ErrorCode = ErrorCode(4000);
    pub const SSL_CERTIFICATE_NOT_TRUSTED: ErrorCode = ErrorCode(4010);
    pub const SSL_CERTIFICATE_INVALID: ErrorCode = ErrorCode(4020);
    pub const SSL_HOST_NAME_MISMATCHED: ErrorCode = ErrorCode(4100);
    pub const MAILBOX_FULL: ErrorCode = ErrorCode(5000);
    pub const FOLDER_NOT_FOUND: ErrorCode = ErrorCode(5100);
    pub const EMAIL_NOT_FOUND: ErrorCode = ErrorCode(5200);
    pub const SERVER_ERROR: ErrorCode = ErrorCode(5300);
    pub const BAD_PROTOCOL_CONFIG: ErrorCode = ErrorCode(9800);
    pub const INTERNAL_ERROR: ErrorCode = ErrorCode(10000);
    pub const INTERNAL_ACCOUNT_MISCONFIGURED: ErrorCode = ErrorCode(10001);

    /// True for connection-class errors (host lookup, timeouts, no network).
    pub fn is_connection_error(self) -> bool {
        (3000..4000).contains(&self.0)
    }

    /// True for SSL/certificate-class errors.
    pub fn is_ssl_error(self) -> bool {
        (4000..5000).contains(&self.0)
    }

    /// True for authentication-class errors requiring user action.
    pub fn is_auth_error(self) -> bool {
        (1000..2000).contains(&self.0) && self != Self::LOGIN_TIMEOUT
    }

    /// Transient errors are eligible for backoff retry; everything else needs
    /// external correction (credentials, configuration) or is a bug.
    pub fn is_transient(self) -> bool {
        self.is_connection_error()
            || self.is_ssl_error()
            || self == Self::LOGIN_TIMEOUT
            || self == Self::ACCOUNT_UNAVAILABLE
    }
}

/// Persisted error record: code plus human-readable text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    #[serde(rename = "errorCode")]
    pub code: u32,
    #[serde(rename = "errorText")]
    pub text: String,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, text: impl Into<String>) -> Self {
        Self { code: code.0, text: text.into() }
    }

    pub fn is_none(&self) -> bool {
        self.code == 0
    }

    pub fn code(&self) -> ErrorCode {
        ErrorCode(self.code)
    }
}

/// Engine-wide error type.
///
/// All errors are serializable so they can cross service boundaries, and each
/// variant maps onto a stable [`ErrorCode`].
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum MailError {
    #[error("Bad username or password: {0}")]
    BadCredentials(String),

    #[error("No saved credentials: {0}")]
    MissingCredentials(String),

    #[error("Account locked: {0}")]
    AccountLocked(String),

    #[error("Account temporarily unavailable: {0}")]
    AccountUnavailable(String),

    #[error("Web login required: {0}")]
    WebLoginRequired(String),

    #[error("Account needs provisioning: {0}")]
    NeedsProvisioning(String),

    #[error("Login timed out: {0}")]
    LoginTimeout(String),

    #[error("Host not found: {0}")]
    HostNotFound(String),

    #[error("Connection timed out: {0}")]
    ConnectionTimeout(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("No network available")]
    NoNetwork,

    #[error("SSL certificate expired: {0}")]
    SslCertificateExpired(String),

    #[error("SSL certificate not trusted: {0}")]
    SslCertificateNotTrusted(String),

    #[error("SSL certificate invalid: {0}")]
    SslCertificateInvalid(String),

    #[error("SSL hostname mismatch: {0}")]
    SslHostnameMismatch(String),

    #[error("Mailbox full")]
    MailboxFull,

    #[error("Folder not found: {0}")]
    FolderNotFound(String),

    #[error("Email not found: {0}")]
    EmailNotFound(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Bad protocol configuration: {0}")]
    BadConfig(String),

    #[error("Account misconfigured: {0}")]
    AccountMisconfigured(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MailError {
    pub fn code(&self) -> ErrorCode {
        match self {
            MailError::BadCredentials(_) => ErrorCode::BAD_USERNAME_OR_PASSWORD,
            MailError::MissingCredentials(_) => ErrorCode::MISSING_CREDENTIALS,
            MailError::AccountLocked(_) => ErrorCode::ACCOUNT_LOCKED,
            MailError::AccountUnavailable(_) => ErrorCode::ACCOUNT_UNAVAILABLE,
            MailError::WebLoginRequired(_) => ErrorCode::ACCOUNT_WEB_LOGIN_REQUIRED,
            MailError::NeedsProvisioning(_) => ErrorCode::ACCOUNT_NEEDS_PROVISIONING,
            MailError::LoginTimeout(_) => ErrorCode::LOGIN_TIMEOUT,
            MailError::HostNotFound(_) => ErrorCode::HOST_NOT_FOUND,
            MailError::ConnectionTimeout(_) => ErrorCode::CONNECTION_TIMED_OUT,
            MailError::ConnectionFailed(_) => ErrorCode::CONNECTION_FAILED,
            MailError::NoNetwork => ErrorCode::NO_NETWORK,
            MailError::SslCertificateExpired(_) => ErrorCode::SSL_CERTIFICATE_EXPIRED,
            MailError::SslCertificateNotTrusted(_) => ErrorCode::SSL_CERTIFICATE_NOT_TRUSTED,
            MailError::SslCertificateInvalid(_) => ErrorCode::SSL_CERTIFICATE_INVALID,
            MailError::SslHostnameMismatch(_) => ErrorCode::SSL_HOST_NAME_MISMATCHED,
            MailError::MailboxFull => ErrorCode::MAILBOX_FULL,
            MailError::FolderNotFound(_) => ErrorCode::FOLDER_NOT_FOUND,
            MailError::EmailNotFound(_) => ErrorCode::EMAIL_NOT_FOUND,
            MailError::ServerError(_) => ErrorCode::SERVER_ERROR,
            MailError::BadConfig(_) => ErrorCode::BAD_PROTOCOL_CONFIG,
            MailError::AccountMisconfigured(_) => ErrorCode::INTERNAL_ACCOUNT_MISCONFIGURED,
            MailError::Internal(_) => ErrorCode::INTERNAL_ERROR,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.code().is_transient()
    }

    pub fn is_auth_error(&self) -> bool {
        self.code().is_auth_error()
    }

    pub fn is_connection_error(&self) -> bool {
        self.code().is_connection_error()
    }

    /// Snapshot suitable for persisting on an account record.
    pub fn info(&self) -> ErrorInfo {
        ErrorInfo::new(self.code(), self.to_string())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        MailError::Internal(msg.into())
    }
}

/// Result type alias using MailError
pub type Result<T> = std::result::Result<T, MailError>;
