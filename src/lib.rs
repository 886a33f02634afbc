//! Loopcast - Looping HLS stream server
//!
//! Accepts uploaded video files over HTTP and turns each into a continuously
//! looping HLS stream by driving an external ffmpeg process.
//!
//! Layout:
//! - config: Environment configuration
//! - supervisor: External transcoder process lifecycle
//! - registry: Active stream sessions and the concurrency cap
//! - merge: Two-phase upload-then-merge coordination
//! - reaper: Filesystem artifact cleanup
//! - http: Axum routes and handlers

pub mod config;
pub mod error;
pub mod http;
pub mod merge;
pub mod reaper;
pub mod registry;
pub mod supervisor;
pub mod util;

pub use config::Config;
pub use error::AppError;
pub use registry::StreamRegistry;
