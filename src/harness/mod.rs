pub mod artifacts;
pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod models;
pub mod transport;

#[cfg(test)]
pub(crate) mod testkit;
