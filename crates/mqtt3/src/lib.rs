#![warn(clippy::pedantic)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::module_name_repetitions)]

//! # mqtt3
//!
//! Asynchronous MQTT 3.1.1 broker core.
//!
//! The crate is the listener, session and dispatch engine of a broker: it
//! accepts byte-stream connections, runs one connection state machine per
//! client, routes messages through a topic trie and keeps QoS 1/2 state in an
//! append-only journal so it survives restarts.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mqtt3::broker::{BrokerConfig, MqttBroker};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BrokerConfig::default().with_port(1883);
//!     let mut broker = MqttBroker::with_config(config).await?;
//!     let shutdown = broker.shutdown_handle();
//!
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         shutdown.shutdown();
//!     });
//!
//!     broker.run().await?;
//!     Ok(())
//! }
//! ```

pub mod broker;

pub use mqtt3_protocol as protocol;
pub use mqtt3_protocol::{ErrorKind, MqttError, QoS, Result};
