//! Async client for a lightweight NATS-like publish-subscribe messaging bus.
//!
//! Build a connection with [`ConnectOptions`], then drive it through the
//! returned [`Client`]. The connection itself runs as a single background
//! task, so `Client` and [`Subscription`] are cheap to clone/hold across
//! tasks without any shared lock.
//!
//! ```no_run
//! # async fn example() -> Result<(), flotilla::ClientError> {
//! use flotilla::{Client, ConnectOptions};
//!
//! let client = Client::connect(ConnectOptions::new().server("nats://localhost:4222")).await?;
//! client.publish("updates.price", "42")?;
//! # Ok(())
//! # }
//! ```

mod auth;
mod error;
mod events;
mod fsm;
mod liveness;
mod mux;
mod nuid;
mod options;
mod parser;
mod protocol;
mod send_buffer;
mod server_list;
mod socket;
mod subs;

pub mod client;

pub use auth::{JwtSource, NonceSigner, SeedSigner};
pub use client::{Client, RequestMulti, SubEvent, Subscription};
pub use error::ClientError;
pub use events::{EventHandler, NoopEventHandler};
pub use options::{ConnectOptions, PayloadEncoding, TlsMode};
pub use subs::Message;
