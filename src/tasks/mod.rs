//! Tasks Module
//!
//! Background jobs that run for the lifetime of the server.

pub mod scan;

pub use scan::spawn_scan_task;
