pub mod analyzer;
pub mod api;
pub mod collector;
pub mod concurrency;
pub mod config;
pub mod db;
mod migrations;
pub mod sales_sync;
pub mod scheduler;
