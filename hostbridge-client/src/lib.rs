//! # hostbridge-client
//!
//! Client library for hostbridge.
//!
//! This crate provides:
//! - Async TCP connection with request/response correlation by id
//! - High-level API for every command kind

pub mod client;
pub mod connection;
pub mod error;

pub use client::Client;
pub use connection::{Connection, ConnectionConfig};
pub use error::ClientError;
