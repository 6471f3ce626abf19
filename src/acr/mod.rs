//! Transport and command set for the Parker ACR motion controller

pub mod client;
pub mod protocol;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{AcrClient, AcrClientBuilder, CommandChannel, ConnectionConfig};
pub use protocol::Command;
