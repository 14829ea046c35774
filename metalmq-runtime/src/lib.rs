//! Consumer runtime for AMQP 0.9.1 brokers.
//!
//! It manages the lifecycle of connections, channels and consumers on top of a protocol library
//! plugged in through [`broker::Connector`]. Consumers are served either by the blocking
//! [`Connection::listen`] loop on the caller thread, or by a background worker which hands the
//! deliveries back to the caller thread in [`Connection::run_pending`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use metalmq_runtime::{memory::MemoryBroker, Connection, ConnectionConfig, ConsumerOptions};
//!
//! let mut conn = Connection::connect(ConnectionConfig::default(), Arc::new(MemoryBroker::new())).unwrap();
//!
//! conn.create_consumer("jobs", ConsumerOptions::default(), |msg| {
//!     println!("{}", msg.text());
//!     Ok(())
//! })
//! .unwrap();
//!
//! conn.listen(Duration::from_secs(5)).unwrap();
//! ```
mod background;
pub mod broker;
pub mod classify;

mod config;
pub use config::{ConnectionConfig, MAX_LISTEN_WAIT, POLL_INTERVAL, WORKER_IDLE_SLEEP, WORKER_POLL_TIMEOUT};

mod connection;
pub use connection::Connection;

mod consumer;
pub use consumer::{AckMode, ConsumerCallback, ConsumerHandle, ConsumerOptions};

mod deferred;

mod dev;
pub use dev::setup_logger;

mod error;
pub use error::{to_client_error, ClientError, ErrorKind};

mod listen;
pub use listen::ListenStop;

pub mod memory;

mod message;
pub use message::{Content, DeliveredMessage, Envelope, GetMessage, MessageProperties, PublishedMessage};

pub mod model;
pub use model::{ChannelNumber, ExchangeType, FieldTable, FieldValue};

mod registry;
pub use registry::{Registry, SlotKey};

mod state;
pub use state::{ChannelState, ConnectionState};
