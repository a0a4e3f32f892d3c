pub mod app;
pub mod cache;
pub mod cli;
pub mod config;
pub mod cost;
pub mod error;
pub mod events;
pub mod fs;
pub mod history;
pub mod locator;
pub mod monitor;
pub mod notifier;
pub mod rate_limit;
pub mod registry;
pub mod tailer;
pub mod transcript;
pub mod util;
