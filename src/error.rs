use crate::upstream::UpstreamCallError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct AppError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Structured error shape shared by pre-sink failures and `StreamSink::write_error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: u16,
    pub error: String,
}

impl ErrorPayload {
    pub fn new(err: impl std::fmt::Display, code: u16) -> Self {
        Self {
            code,
            error: err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorPayload::new(self.message, self.status.as_u16());
        (self.status, axum::Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error(
        "context length exceeds the model limit, shorten the input or start a new conversation"
    )]
    ContextExceedLimit,
    #[error("system prompt needs {tokens} tokens but the model accepts at most {limit}")]
    SystemPromptTooLarge { tokens: i64, limit: i64 },
    #[error("conversation has no usable messages")]
    EmptyConversation,
    #[error("request or response was rejected by the content filter: {0}")]
    ContentFilter(String),
    #[error(transparent)]
    Transport(#[from] UpstreamCallError),
    #[error("read stream failed: {0}")]
    StreamRead(String),
    #[error("upgrade websocket failed: {0}")]
    Upgrade(String),
    #[error("invalid request: {0}")]
    MalformedRequest(String),
    #[error("no provider is enabled")]
    NoProviderAvailable,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("stream sink is closed")]
    SinkClosed,
    #[error("encode payload failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ChatError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ContextExceedLimit => "context_exceed_limit",
            Self::SystemPromptTooLarge { .. } => "system_prompt_too_large",
            Self::EmptyConversation => "empty_conversation",
            Self::ContentFilter(_) => "content_filter",
            Self::Transport(_) => "upstream_error",
            Self::StreamRead(_) => "READ_STREAM_FAILED",
            Self::Upgrade(_) => "upgrade_failed",
            Self::MalformedRequest(_) => "invalid_request",
            Self::NoProviderAvailable => "no_provider_available",
            Self::Config(_) => "invalid_config",
            Self::SinkClosed => "sink_closed",
            Self::Encode(_) => "encode_failed",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::ContextExceedLimit
            | Self::SystemPromptTooLarge { .. }
            | Self::EmptyConversation
            | Self::ContentFilter(_)
            | Self::Upgrade(_)
            | Self::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            Self::Transport(err) => err.status.unwrap_or(StatusCode::BAD_GATEWAY),
            Self::StreamRead(_) => StatusCode::BAD_GATEWAY,
            Self::NoProviderAvailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Config(_) | Self::SinkClosed | Self::Encode(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<ChatError> for AppError {
    fn from(err: ChatError) -> Self {
        AppError::new(err.status(), err.code(), err.to_string())
    }
}
