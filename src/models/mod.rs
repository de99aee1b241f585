//! Models Module
//!
//! Request and response payloads for the HTTP surface.

pub mod requests;
pub mod responses;

pub use requests::SetRequest;
pub use responses::{
    DeleteResponse, GetResponse, HealthResponse, SetResponse, StatsResponse,
};
