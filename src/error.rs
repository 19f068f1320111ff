//! # Error Handling
//!
//! Two layers of errors live here:
//!
//! - **PipelineError**: what can go wrong inside the voice pipeline itself
//!   (microphone, transport, synthesis, decoding, output). These are logged at
//!   the boundary and degrade to "nothing happened" for the caller.
//! - **AppError**: what the HTTP control surface returns to the phone UI.
//!   Every `PipelineError` converts into one so handlers can use `?`.
//!
//! ## Key Rust Concepts for Error Handling:
//! - **Enums**: each variant is one failure category with its own message
//! - **From trait**: lets `?` convert library errors into ours automatically
//! - **ResponseError trait**: turns an `AppError` into a JSON HTTP response

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Failure categories of the voice pipeline.
///
/// ## Taxonomy:
/// - **Permission**: microphone access denied, the session cannot open
/// - **Capture**: no input device or unreadable capture source
/// - **Transport**: the streaming channel failed to open, send or receive
/// - **Synthesis**: one-shot speech generation failed
/// - **Decode**: malformed base64 or PCM payload
/// - **Output**: the output context refused to schedule audio
/// - **InvalidState**: an operation was issued in the wrong lifecycle state
/// - **Unavailable**: a resource limit was reached (e.g. too many calls)
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineError {
    Permission(String),
    Capture(String),
    Transport(String),
    Synthesis(String),
    Decode(String),
    Output(String),
    InvalidState(String),
    Unavailable(String),
}

impl PipelineError {
    /// Machine-readable kind, used in logs and API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Permission(_) => "permission_error",
            PipelineError::Capture(_) => "capture_error",
            PipelineError::Transport(_) => "transport_error",
            PipelineError::Synthesis(_) => "synthesis_error",
            PipelineError::Decode(_) => "decode_error",
            PipelineError::Output(_) => "output_error",
            PipelineError::InvalidState(_) => "invalid_state",
            PipelineError::Unavailable(_) => "unavailable",
        }
    }

    /// Whether the error ends the session that raised it.
    ///
    /// Decode errors only lose one chunk; everything else is terminal
    /// because there is no reconnection policy.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, PipelineError::Decode(_))
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Permission(msg) => write!(f, "Microphone permission denied: {}", msg),
            PipelineError::Capture(msg) => write!(f, "Capture error: {}", msg),
            PipelineError::Transport(msg) => write!(f, "Transport error: {}", msg),
            PipelineError::Synthesis(msg) => write!(f, "Speech synthesis failed: {}", msg),
            PipelineError::Decode(msg) => write!(f, "Decode error: {}", msg),
            PipelineError::Output(msg) => write!(f, "Audio output error: {}", msg),
            PipelineError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            PipelineError::Unavailable(msg) => write!(f, "Unavailable: {}", msg),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<base64::DecodeError> for PipelineError {
    fn from(err: base64::DecodeError) -> Self {
        PipelineError::Decode(format!("invalid base64 payload: {}", err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for PipelineError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        PipelineError::Transport(err.to_string())
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        PipelineError::Synthesis(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Transport(format!("malformed message: {}", err))
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Capture(err.to_string())
    }
}

/// Custom error types for the HTTP control surface.
///
/// ## Error Categories:
/// - **Internal**: server-side problems (500)
/// - **BadRequest**: client sent invalid data (400)
/// - **NotFound**: unknown call, persona or voicemail item (404)
/// - **ConfigError**: configuration problems (500)
/// - **ValidationError**: data validation failed (400)
/// - **Pipeline**: a voice pipeline failure, status depends on its kind
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
    ConfigError(String),
    ValidationError(String),
    Pipeline(PipelineError),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Pipeline(err) => write!(f, "{}", err),
        }
    }
}

/// Converts errors into JSON HTTP responses.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "permission_error",
///     "message": "Microphone permission denied: user declined",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;

        match self {
            AppError::Internal(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) | AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Pipeline(err) => match err {
                PipelineError::Permission(_) => StatusCode::FORBIDDEN,
                PipelineError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                PipelineError::InvalidState(_) => StatusCode::CONFLICT,
                PipelineError::Transport(_) | PipelineError::Synthesis(_) => StatusCode::BAD_GATEWAY,
                PipelineError::Capture(_) | PipelineError::Decode(_) | PipelineError::Output(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (error_type, message) = match self {
            AppError::Internal(msg) => ("internal_error", msg.clone()),
            AppError::BadRequest(msg) => ("bad_request", msg.clone()),
            AppError::NotFound(msg) => ("not_found", msg.clone()),
            AppError::ConfigError(msg) => ("config_error", msg.clone()),
            AppError::ValidationError(msg) => ("validation_error", msg.clone()),
            AppError::Pipeline(err) => (err.kind(), err.to_string()),
        };

        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        AppError::Pipeline(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always the client's fault, hence 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Shorthand for `Result<T, AppError>` in HTTP handlers.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;

    #[test]
    fn test_pipeline_error_status_mapping() {
        let denied = AppError::from(PipelineError::Permission("user declined".to_string()));
        assert_eq!(denied.status_code(), StatusCode::FORBIDDEN);

        let full = AppError::from(PipelineError::Unavailable("limit".to_string()));
        assert_eq!(full.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let wrong_state = AppError::from(PipelineError::InvalidState("closed".to_string()));
        assert_eq!(wrong_state.status_code(), StatusCode::CONFLICT);

        let upstream = AppError::from(PipelineError::Transport("socket reset".to_string()));
        assert_eq!(upstream.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_only_decode_errors_are_recoverable() {
        assert!(!PipelineError::Decode("bad".to_string()).is_fatal());
        assert!(PipelineError::Transport("gone".to_string()).is_fatal());
        assert!(PipelineError::Permission("denied".to_string()).is_fatal());
    }

    #[test]
    fn test_base64_error_becomes_decode_error() {
        use base64::Engine;
        let err = base64::engine::general_purpose::STANDARD
            .decode("not base64!!")
            .unwrap_err();
        let converted = PipelineError::from(err);
        assert_eq!(converted.kind(), "decode_error");
    }
}
