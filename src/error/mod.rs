use thiserror::Error;

/// Stable error codes, shown as `[CODE]` in error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Configuration errors
    ConfigMissingRequired,
    ConfigInvalidUrl,
    ConfigInvalidInterval,

    // Network errors
    NetworkError,
    NetworkTimeout,

    // HTTP errors
    HttpUnauthorized,
    HttpForbidden,
    HttpNotFound,
    HttpRateLimited,
    HttpServerError,
    HttpNoBody,
    HttpInvalidResponse,

    // Lifecycle errors
    ContextUpdateTimeout,
    ClientClosed,

    // Storage errors
    BackupReadError,
    BackupWriteError,
    BootstrapReadError,

    // Metrics errors
    MetricsSendFailed,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConfigMissingRequired => "CONFIG_MISSING_REQUIRED",
            ErrorCode::ConfigInvalidUrl => "CONFIG_INVALID_URL",
            ErrorCode::ConfigInvalidInterval => "CONFIG_INVALID_INTERVAL",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::NetworkTimeout => "NETWORK_TIMEOUT",
            ErrorCode::HttpUnauthorized => "HTTP_UNAUTHORIZED",
            ErrorCode::HttpForbidden => "HTTP_FORBIDDEN",
            ErrorCode::HttpNotFound => "HTTP_NOT_FOUND",
            ErrorCode::HttpRateLimited => "HTTP_RATE_LIMITED",
            ErrorCode::HttpServerError => "HTTP_SERVER_ERROR",
            ErrorCode::HttpNoBody => "HTTP_NO_BODY",
            ErrorCode::HttpInvalidResponse => "HTTP_INVALID_RESPONSE",
            ErrorCode::ContextUpdateTimeout => "CONTEXT_UPDATE_TIMEOUT",
            ErrorCode::ClientClosed => "CLIENT_CLOSED",
            ErrorCode::BackupReadError => "BACKUP_READ_ERROR",
            ErrorCode::BackupWriteError => "BACKUP_WRITE_ERROR",
            ErrorCode::BootstrapReadError => "BOOTSTRAP_READ_ERROR",
            ErrorCode::MetricsSendFailed => "METRICS_SEND_FAILED",
        }
    }

    /// Whether a later retry of the same operation may succeed without any
    /// change on the caller's side.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorCode::NetworkError
                | ErrorCode::NetworkTimeout
                | ErrorCode::HttpRateLimited
                | ErrorCode::HttpServerError
                | ErrorCode::HttpNoBody
                | ErrorCode::HttpInvalidResponse
                | ErrorCode::ContextUpdateTimeout
                | ErrorCode::MetricsSendFailed
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error returned by every fallible operation of the crate.
#[derive(Error, Debug)]
#[error("[{code}] {message}")]
pub struct FlagSyncError {
    pub code: ErrorCode,
    pub message: String,
    /// HTTP status that produced this error, when there was one.
    pub status: Option<u16>,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl FlagSyncError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status: None,
            source: None,
        }
    }

    pub fn with_source(
        code: ErrorCode,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            status: None,
            source: Some(Box::new(source)),
        }
    }

    pub fn config_error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(code, message)
    }

    /// Maps a non-success HTTP status onto the error taxonomy.
    pub fn from_status(status: u16) -> Self {
        let (code, category) = match status {
            401 => (ErrorCode::HttpUnauthorized, "Unauthorized"),
            403 => (ErrorCode::HttpForbidden, "Forbidden"),
            404 => (ErrorCode::HttpNotFound, "Not Found"),
            429 => (ErrorCode::HttpRateLimited, "Rate Limited"),
            _ => (ErrorCode::HttpServerError, "Server Error"),
        };
        Self {
            code,
            message: format!("{}: {}", category, status),
            status: Some(status),
            source: None,
        }
    }

    pub fn unauthorized() -> Self {
        Self::from_status(401)
    }

    pub fn no_body() -> Self {
        Self::new(ErrorCode::HttpNoBody, "Response had no body")
    }

    pub fn closed() -> Self {
        Self::new(ErrorCode::ClientClosed, "Client has been closed")
    }

    pub fn is_recoverable(&self) -> bool {
        self.code.is_recoverable()
    }

    pub fn is_unauthorized(&self) -> bool {
        self.code == ErrorCode::HttpUnauthorized
    }

    pub fn is_config_error(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::ConfigMissingRequired
                | ErrorCode::ConfigInvalidUrl
                | ErrorCode::ConfigInvalidInterval
        )
    }

    pub fn is_network_error(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::NetworkError
                | ErrorCode::NetworkTimeout
                | ErrorCode::HttpUnauthorized
                | ErrorCode::HttpForbidden
                | ErrorCode::HttpNotFound
                | ErrorCode::HttpRateLimited
                | ErrorCode::HttpServerError
                | ErrorCode::HttpNoBody
                | ErrorCode::HttpInvalidResponse
        )
    }
}

pub type Result<T> = std::result::Result<T, FlagSyncError>;
