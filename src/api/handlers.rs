//! API Handlers Module
//!
//! Request handlers for the HTTP cache surface. String values live in the
//! in-memory engine; deletes also clear any content-addressed backing file
//! so disk state never outlives the logical entry.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{TimeDelta, Utc};
use tracing::debug;

use crate::cache::store::CacheStore;
use crate::config::{CacheConfig, Config};
use crate::error::{CacheError, Result};
use crate::models::{
    DeleteResponse, GetResponse, HealthResponse, SetRequest, SetResponse, StatsResponse,
};
use crate::provider::{CacheProvider, EntryOptions};
use crate::storage::DiskStorage;

// == Application State ==
/// Shared state handed to every handler.
#[derive(Debug, Clone)]
pub struct AppState {
    pub provider: Arc<CacheProvider>,
    pub storage: Arc<DiskStorage>,
    pub default_ttl: u64,
}

impl AppState {
    pub fn new(provider: Arc<CacheProvider>, storage: Arc<DiskStorage>, default_ttl: u64) -> Self {
        Self {
            provider,
            storage,
            default_ttl,
        }
    }

    /// Builds the full state from server configuration.
    ///
    /// # Errors
    /// `InvalidArgument` if the derived cache configuration is invalid.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut cache_config = CacheConfig::default();
        if let Some(limit) = config.size_limit {
            cache_config = cache_config.with_size_limit(limit);
        }
        let store = CacheStore::new(cache_config)?;
        let storage = match &config.storage_dir {
            Some(dir) => DiskStorage::new(dir.clone()),
            None => DiskStorage::default(),
        };
        Ok(Self::new(
            Arc::new(CacheProvider::new(store)),
            Arc::new(storage),
            config.default_ttl,
        ))
    }
}

// == Handlers ==
/// `POST /cache` stores a string value with an optional TTL.
pub async fn set_entry(
    State(state): State<AppState>,
    Json(request): Json<SetRequest>,
) -> Result<(StatusCode, Json<SetResponse>)> {
    request.validate()?;
    let ttl = TimeDelta::seconds(request.ttl.unwrap_or(state.default_ttl) as i64);
    let size = request.value.len() as i64;

    let options = EntryOptions::default()
        .with_absolute_expiration_relative_to_now(ttl)
        .with_size(size);
    state
        .provider
        .set(&request.key, request.value, options)?;
    debug!(key = %request.key, size, "stored entry");

    Ok((
        StatusCode::CREATED,
        Json(SetResponse {
            key: request.key,
            expires_at: Utc::now() + ttl,
        }),
    ))
}

/// `GET /cache/:key` returns the stored string, or 404.
pub async fn get_entry(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<GetResponse>> {
    match state.provider.get::<String>(&key)? {
        Some(value) => Ok(Json(GetResponse {
            key,
            value: (*value).clone(),
        })),
        None => Err(CacheError::NotFound(key)),
    }
}

/// `DELETE /cache/:key` removes the entry and its backing file, or 404 if
/// neither existed.
pub async fn delete_entry(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<DeleteResponse>> {
    let in_memory = state.provider.remove(&key)?;
    let on_disk = state.storage.remove(key.as_str())?;
    if !in_memory && !on_disk {
        return Err(CacheError::NotFound(key));
    }
    Ok(Json(DeleteResponse { key, deleted: true }))
}

/// `GET /stats` reports engine counters plus the number of backing files.
pub async fn stats(State(state): State<AppState>) -> Result<Json<StatsResponse>> {
    let snapshot = state.provider.stats();
    let persisted = state.storage.count()?;
    Ok(Json(StatsResponse::from_snapshot(snapshot, persisted)))
}

/// `GET /health` liveness probe.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse::ok())
}
