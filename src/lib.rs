pub mod api;
pub mod app;
pub mod config;
pub mod config_io;
pub mod engine;
pub mod identity;
pub mod logging;
pub mod single_instance;
pub mod tracker;
