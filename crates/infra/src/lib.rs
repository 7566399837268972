//! Infrastructure layer: storage backends, the job queue and workers, the
//! lesson scheduler, webhook ingestion and configuration.

pub mod catalog;
pub mod config;
pub mod courses;
pub mod db;
pub mod delivery;
pub mod error;
pub mod ingestion;
pub mod jobs;
pub mod maintenance;
pub mod message_log;
pub mod progress;
pub mod reply_context;
pub mod scheduler;
pub mod stores;

pub use error::StoreError;
pub use stores::Stores;
