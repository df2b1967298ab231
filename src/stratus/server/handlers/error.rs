/*
 * Copyright (C) 2025 The Stratus Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::stratus::storage::StorageError;

/// Error payload returned by every API endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    pub code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<HashMap<String, String>>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error: &'static str,
    message: String,
    details: Option<HashMap<String, String>>,
}

impl ApiError {
    pub(crate) fn new(status: StatusCode, error: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            error,
            message: message.into(),
            details: None,
        }
    }

    pub(crate) fn with_detail(mut self, key: &str, value: impl Into<String>) -> Self {
        self.details
            .get_or_insert_with(HashMap::new)
            .insert(key.to_string(), value.into());
        self
    }

    pub(crate) fn invalid_request(err: impl ToString) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "INVALID_REQUEST",
            "Invalid JSON format",
        )
        .with_detail("validation", err.to_string())
    }

    pub(crate) fn validation(what: &str, err: impl ToString) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            format!("{what} validation failed"),
        )
        .with_detail("validation", err.to_string())
    }

    pub(crate) fn name_mismatch(what: &str) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "NAME_MISMATCH",
            format!("{what} name does not match URL parameter"),
        )
    }

    pub(crate) fn namespace_mismatch(what: &str) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "NAMESPACE_MISMATCH",
            format!("{what} namespace does not match URL namespace"),
        )
    }

    pub(crate) fn serialization(err: impl ToString) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "SERIALIZATION_ERROR",
            "Failed to serialize resource data",
        )
        .with_detail("error", err.to_string())
    }

    pub(crate) fn parse(what: &str, err: impl ToString) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "SERIALIZATION_ERROR",
            format!("Failed to parse stored {what} data"),
        )
        .with_detail("error", err.to_string())
    }

    /// Map a storage failure onto the API taxonomy: 404 for missing keys,
    /// 409 for duplicate creates, 500 for everything else.
    pub(crate) fn storage(what: &str, err: StorageError) -> Self {
        if err.is_not_found() {
            Self::new(
                StatusCode::NOT_FOUND,
                "RESOURCE_NOT_FOUND",
                format!("{what} not found"),
            )
            .with_detail("error", err.to_string())
        } else if err.is_conflict() {
            Self::new(
                StatusCode::CONFLICT,
                "RESOURCE_EXISTS",
                format!("{what} already exists"),
            )
            .with_detail("error", err.to_string())
        } else {
            Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                format!("Storage operation on {what} failed"),
            )
            .with_detail("error", err.to_string())
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.error.to_string(),
            message: self.message,
            code: self.status.as_u16(),
            details: self.details,
        });
        (self.status, body).into_response()
    }
}
