pub mod config;
pub mod deploy;
pub mod domain;
pub mod engine;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod server;
pub mod storage;
