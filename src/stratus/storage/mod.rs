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

mod database;
mod repository;

pub use database::Database;
pub use repository::Repository;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;

/// A generic persisted cluster object. Metadata, spec, and status are opaque
/// JSON blobs; the store never interprets them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub metadata: String,
    pub spec: String,
    pub status: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

impl Resource {
    pub fn new(kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Resource {
            id: String::new(),
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
            metadata: String::new(),
            spec: String::new(),
            status: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Authoritative record that a pod runs on a specific node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodBinding {
    #[serde(rename = "podId")]
    pub pod_id: String,
    #[serde(rename = "nodeId")]
    pub node_id: String,
    pub status: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

pub const BINDING_PENDING: &str = "Pending";
pub const BINDING_RUNNING: &str = "Running";
pub const BINDING_NODE_FAILED: &str = "NodeFailed";

/// Storage failures. Not-found and conflict are distinct conditions callers
/// are expected to match on; everything else propagates the backend error.
#[derive(Debug)]
pub enum StorageError {
    NotFound(String),
    Conflict(String),
    Backend(rusqlite::Error),
    Io(std::io::Error),
    Serde(serde_json::Error),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::Conflict(_))
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::NotFound(what) => write!(f, "not found: {what}"),
            StorageError::Conflict(what) => write!(f, "already exists: {what}"),
            StorageError::Backend(err) => write!(f, "storage backend error: {err}"),
            StorageError::Io(err) => write!(f, "storage i/o error: {err}"),
            StorageError::Serde(err) => write!(f, "serialization error: {err}"),
        }
    }
}

impl Error for StorageError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StorageError::Backend(err) => Some(err),
            StorageError::Io(err) => Some(err),
            StorageError::Serde(err) => Some(err),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::Backend(err)
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serde(err)
    }
}

pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
