//! MQTT 3.1.1 Broker Implementation
//!
//! Data flows from the acceptor in [`server`] into one
//! [`client_handler::ClientHandler`] per connection. CONNECT opens or resumes
//! a session in the [`session::SessionStore`], PUBLISH is matched against the
//! [`topic_tree::TopicTree`] by the [`router::MessageRouter`], and every
//! matched subscriber receives its own copy through its connection's channel.
//!
//! # Example
//!
//! ```rust,no_run
//! use mqtt3::broker::MqttBroker;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut broker = MqttBroker::bind("127.0.0.1:1883").await?;
//!     broker.run().await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod client_handler;
pub mod config;
pub mod message;
pub mod resource_monitor;
pub mod router;
pub mod server;
pub mod session;
pub mod storage;
pub mod topic_tree;
pub mod transport;

pub use auth::{AllowAllAuthProvider, AuthProvider, AuthResult, PasswordAuthProvider};
pub use config::{AuthConfig, BrokerConfig};
pub use message::{Delivery, Message};
pub use resource_monitor::{ConnectionPermit, ResourceMonitor};
pub use router::{DispatchResult, MessageRouter, RouterStats};
pub use server::{MqttBroker, ShutdownHandle};
pub use session::{OpenedSession, Session, SessionHandle, SessionStore};
pub use storage::{DynamicStorage, FileBackend, MemoryBackend, Storage, StorageBackend};
pub use topic_tree::TopicTree;

pub use crate::QoS;
