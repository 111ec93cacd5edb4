//! Tracing setup shared by services built on `mirror-solana-connector`.
//!
//! The connector itself only emits `tracing` events; installing a subscriber is
//! left to the embedding process, which calls [`init`] once at
//! startup with a [`LogConfig`] usually loaded alongside the connector config.

mod logging;

pub use logging::{init, LogConfig, LogFormat, LogOutput};
