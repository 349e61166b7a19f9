//! Response envelope
//!
//! Every JSON reply is `{code, message, data}` with HTTP 200, business errors
//! included. `code == 0` means success.

use axum::Json;
use serde::Serialize;

use crate::error::{ErrorKind, LedgerResult};

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: error_codes::SUCCESS,
            message: "ok".to_string(),
            data: Some(data),
        }
    }

    pub fn error(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

pub type ApiResult<T> = Json<ApiResponse<T>>;

pub mod error_codes {
    pub const SUCCESS: i32 = 0;
    pub const INVALID_PARAMETER: i32 = 400;
    pub const UNAUTHENTICATED: i32 = 401;
    pub const FORBIDDEN: i32 = 403;
    pub const SERVICE_UNAVAILABLE: i32 = 503;
    pub const ALREADY_SYNCING: i32 = 1301;
    pub const ALREADY_SETTLING: i32 = 1302;
}

/// Wrap a core result in the envelope
pub fn reply<T: Serialize>(result: LedgerResult<T>) -> ApiResult<T> {
    match result {
        Ok(data) => Json(ApiResponse::success(data)),
        Err(e) => {
            let message = if e.kind() == ErrorKind::Internal {
                tracing::error!(error = %e, code = e.code(), "Request failed");
                "internal error".to_string()
            } else {
                tracing::debug!(error = %e, code = e.code(), "Request rejected");
                e.to_string()
            };
            Json(ApiResponse::error(e.business_code(), message))
        }
    }
}
