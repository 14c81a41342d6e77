pub mod app;
pub mod config;
pub mod ipc;
pub mod logging;
pub mod notify;
pub mod platform;
pub mod prompt;
pub mod relay;
pub mod setup;
pub mod single_instance;
pub mod supervisor;
