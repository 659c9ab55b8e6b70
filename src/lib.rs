pub mod cache;
pub mod config;
pub mod error;
pub mod export;
pub mod monitor;
pub mod provider;
pub mod retry;
pub mod scheduler;
