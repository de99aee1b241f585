//! Request Models
//!
//! Deserialized HTTP request bodies with validation.

use serde::Deserialize;

use crate::cache::{MAX_KEY_LENGTH, MAX_VALUE_SIZE};
use crate::error::{CacheError, Result};

/// Body of `POST /cache`.
#[derive(Debug, Clone, Deserialize)]
pub struct SetRequest {
    /// Cache key.
    pub key: String,
    /// Value to store.
    pub value: String,
    /// Optional time-to-live in seconds; the server default applies when
    /// omitted.
    pub ttl: Option<u64>,
}

impl SetRequest {
    /// Validates the request.
    ///
    /// # Errors
    /// `InvalidArgument` for an empty or oversized key, an oversized value,
    /// or a zero TTL.
    pub fn validate(&self) -> Result<()> {
        if self.key.is_empty() {
            return Err(CacheError::InvalidArgument(
                "key must not be empty".to_string(),
            ));
        }
        if self.key.len() > MAX_KEY_LENGTH {
            return Err(CacheError::InvalidArgument(format!(
                "key must not exceed {} bytes",
                MAX_KEY_LENGTH
            )));
        }
        if self.value.len() > MAX_VALUE_SIZE {
            return Err(CacheError::InvalidArgument(format!(
                "value must not exceed {} bytes",
                MAX_VALUE_SIZE
            )));
        }
        if self.ttl == Some(0) {
            return Err(CacheError::InvalidArgument(
                "ttl must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
