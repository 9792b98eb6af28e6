// ABOUTME: Unified error type for the turn pipeline with HTTP status mapping
// ABOUTME: Defines error kinds, response formatting, and constructor helpers used across all modules
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Arbor Chat

//! # Unified Error Handling
//!
//! Every fallible operation in the server returns [`AppError`], which pairs a
//! closed [`ErrorKind`] with a human-readable message. The kind determines the
//! HTTP status of the rendered response, so pipeline stages never reason about
//! transport concerns directly.

use std::fmt;

use axum::response::{IntoResponse, Response};
use axum::Json;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Standard error kinds used throughout the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    // Request validation
    #[serde(rename = "INVALID_INPUT")]
    InvalidInput,
    #[serde(rename = "NOT_FOUND")]
    NotFound,

    // Quota and safety
    #[serde(rename = "QUOTA_EXCEEDED")]
    QuotaExceeded,
    #[serde(rename = "UNSAFE_CONTENT")]
    UnsafeContent,

    // Upstream model services (completion and moderation)
    #[serde(rename = "MODEL_UNAVAILABLE")]
    ModelUnavailable,

    // Duplicate submission with no stored reply
    #[serde(rename = "IDEMPOTENT_RESPONSE_MISSING")]
    IdempotentResponseMissing,

    // Internal failures
    #[serde(rename = "INTERNAL_ERROR")]
    Internal,
    #[serde(rename = "DATABASE_ERROR")]
    Database,
    #[serde(rename = "CONFIG_ERROR")]
    Config,
}

impl ErrorKind {
    /// Get the HTTP status code for this error kind
    #[must_use]
    pub fn http_status(self) -> u16 {
        match self {
            // 400 Bad Request
            Self::InvalidInput | Self::UnsafeContent => 400,

            // 404 Not Found
            Self::NotFound => 404,

            // 409 Conflict
            Self::IdempotentResponseMissing => 409,

            // 429 Too Many Requests
            Self::QuotaExceeded => 429,

            // 502 Bad Gateway
            Self::ModelUnavailable => 502,

            // 500 Internal Server Error
            Self::Internal | Self::Database | Self::Config => 500,
        }
    }

    /// Get a user-friendly description of this error kind
    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::InvalidInput => "The provided input is invalid",
            Self::NotFound => "The requested resource was not found",
            Self::QuotaExceeded => "Usage quota exceeded for your current plan",
            Self::UnsafeContent => "Content was blocked by safety checks",
            Self::ModelUnavailable => "An upstream model service is unavailable",
            Self::IdempotentResponseMissing => {
                "A duplicate request was detected but no stored response exists"
            }
            Self::Internal => "An internal server error occurred",
            Self::Database => "Database operation failed",
            Self::Config => "Configuration error encountered",
        }
    }
}

/// Unified error type for the application
#[derive(Debug, Error)]
pub struct AppError {
    /// Error kind
    pub kind: ErrorKind,
    /// Human-readable error message
    pub message: String,
    /// Source error for error chaining
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl AppError {
    /// Create a new `AppError` with the given kind and message
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Add a source error for error chaining
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Get the HTTP status code for this error
    #[must_use]
    pub fn http_status(&self) -> u16 {
        self.kind.http_status()
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.description(), self.message)
    }
}

/// Result type alias for convenience
pub type AppResult<T> = Result<T, AppError>;

/// HTTP error response format
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error payload
    pub error: ErrorResponseDetails,
}

/// Body of an HTTP error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponseDetails {
    /// Machine-readable error kind
    pub kind: ErrorKind,
    /// Human-readable message
    pub message: String,
}

impl From<AppError> for ErrorResponse {
    fn from(error: AppError) -> Self {
        Self {
            error: ErrorResponseDetails {
                kind: error.kind,
                message: error.message,
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.kind.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(ErrorResponse::from(self))).into_response()
    }
}

/// Convenience constructors for common errors
impl AppError {
    /// Invalid input
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    /// Resource not found
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::NotFound,
            format!("{} not found", resource.into()),
        )
    }

    /// Daily quota exhausted
    pub fn quota_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::QuotaExceeded, message)
    }

    /// Content blocked by the safety layer
    pub fn unsafe_content(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnsafeContent, message)
    }

    /// All model candidates failed or the moderation service is down
    pub fn model_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ModelUnavailable, message)
    }

    /// Duplicate request found without a stored assistant reply
    pub fn idempotent_response_missing() -> Self {
        Self::new(
            ErrorKind::IdempotentResponseMissing,
            "Idempotent response missing",
        )
    }

    /// Internal server error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Database error
    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Database, message)
    }

    /// Configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }
}

/// Conversion from `anyhow::Error` to `AppError`
impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        Self::new(ErrorKind::Internal, error.to_string())
    }
}
