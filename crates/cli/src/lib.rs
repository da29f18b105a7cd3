pub mod cli;
pub mod config;
pub mod drivers;
pub mod logging;
pub mod server;
