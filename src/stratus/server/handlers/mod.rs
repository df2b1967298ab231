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

pub mod deployments;
pub mod error;
pub mod nodes;
pub mod pods;
pub mod services;

use axum::body::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::stratus::storage::Repository;
use error::ApiError;

pub(crate) const DEFAULT_NAMESPACE: &str = "default";

/// Shared state for all API handlers.
#[derive(Clone)]
pub struct ApiContext {
    pub repository: Repository,
}

/// Decode a JSON request body, mapping failures onto the 400 error shape.
pub(crate) fn parse_json<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(ApiError::invalid_request)
}

/// Body returned by successful deletes.
#[derive(Debug, Serialize)]
pub(crate) struct DeleteResponse {
    pub message: String,
}

impl DeleteResponse {
    pub(crate) fn new(what: &str) -> Self {
        DeleteResponse {
            message: format!("{what} deleted successfully"),
        }
    }
}
