pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod metrics;
pub mod proxy;
pub mod routing;
pub mod server;
pub mod upstream;
