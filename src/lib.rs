pub mod api;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod lease;
pub mod logging;
pub mod models;
pub mod reaper;
pub mod registry;
pub mod rerun;
pub mod scheduler;
pub mod server;
pub mod service;
pub mod store;
pub mod ticker;
pub mod token;
pub mod workflow;
