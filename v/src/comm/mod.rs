#[cfg(feature = "config")]
pub mod config;
#[cfg(feature = "config")]
pub mod tracing;
