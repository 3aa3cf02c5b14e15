//! # Repo Sync
//!
//! Keeps a repository catalog in line with the code hosts it is sourced
//! from and re-fetches every repo at an adaptive cadence.
//!
//! - [`syncer`] reconciles sourced repos into the [`store`] and runs periodic
//!   sync passes over each external service.
//! - [`scheduler`] decides when each repo is fetched from the git server and
//!   dispatches fetches under a live-resizable concurrency limit.

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod gitserver;
pub mod handlers;
pub mod models;
pub mod scheduler;
pub mod server;
pub mod singleflight;
pub mod sources;
pub mod store;
pub mod syncer;
pub mod telemetry;
pub mod types;
pub use migration;
