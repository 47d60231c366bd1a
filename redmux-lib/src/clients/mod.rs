//! High level clients built on top of the multiplexed connection.

mod client;
pub use client::{Client, Message, Subscriber};
