//! Response Models
//!
//! Serialized HTTP response bodies.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cache::StatsSnapshot;

/// Body returned by `POST /cache`.
#[derive(Debug, Serialize)]
pub struct SetResponse {
    pub key: String,
    pub expires_at: DateTime<Utc>,
}

/// Body returned by `GET /cache/:key`.
#[derive(Debug, Serialize)]
pub struct GetResponse {
    pub key: String,
    pub value: String,
}

/// Body returned by `DELETE /cache/:key`.
#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub key: String,
    pub deleted: bool,
}

/// Body returned by `GET /stats`.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
    pub total_entries: usize,
    pub current_size: i64,
    pub persisted_entries: usize,
}

impl StatsResponse {
    pub fn from_snapshot(snapshot: StatsSnapshot, persisted_entries: usize) -> Self {
        Self {
            hits: snapshot.hits,
            misses: snapshot.misses,
            evictions: snapshot.evictions,
            hit_rate: snapshot.hit_rate(),
            total_entries: snapshot.total_entries,
            current_size: snapshot.current_size,
            persisted_entries,
        }
    }
}

/// Body returned by `GET /health`.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
}

impl HealthResponse {
    pub fn ok() -> Self {
        Self {
            status: "ok",
            timestamp: Utc::now(),
        }
    }
}
