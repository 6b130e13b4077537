//! sitecache library
//!
//! Offline-aware data cache and realtime reconciliation for the site
//! management client: local drafts and snapshots, connectivity tracking,
//! cached project weather, live list updates and plan limit checks.

pub mod app;
pub mod backend;
pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod models;
pub mod realtime;
pub mod scope;
pub mod services;
pub mod storage;

pub use app::ClientContext;
pub use error::{AppError, Result};
