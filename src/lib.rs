//! # redmux
//!
//! Asynchronous multiplexed RESP3 client core.
//!
//! One [`Connection`] holds one long-lived socket to a Redis-compatible
//! server. Concurrent tasks submit [`Request`]s; the connection
//! serializes them onto the wire (coalescing neighbors into single
//! writes), demultiplexes typed responses back to each submitter
//! through its [`adapter::ResponseAdapter`], and hands unsolicited
//! server pushes (pub/sub, keyspace notifications) to a dedicated
//! consumer via a single-slot rendezvous.
//!
//! ## Example
//!
//! ```ignore
//! use redmux::{Config, Connection, Request, adapter::TextSlots};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), redmux::Error> {
//!     let conn = Arc::new(Connection::new(Config::default()));
//!
//!     let driver = conn.clone();
//!     tokio::spawn(async move { driver.run().await });
//!
//!     let mut req = Request::new();
//!     req.push_args("HELLO", &["3"]);
//!     req.push_args("PING", &["hi"]);
//!     let (_bytes, resp) = conn.exec(&req, TextSlots::with_size(2)).await?;
//!     println!("{:?}", resp.slots[1]);
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod resp3;
pub mod transport;

mod connection;
mod error;
mod queue;
mod rendezvous;
mod request;

pub use connection::{Config, Connection, Event, Operation};
pub use error::{Error, Result};
pub use request::{Request, RequestConfig};
