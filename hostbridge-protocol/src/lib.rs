//! # hostbridge-protocol
//!
//! Wire protocol spoken between automation agents and the hostbridge server.
//!
//! This crate provides:
//! - Binary framing with a length prefix and CRC32C validation
//! - Request decoding with per-kind payload validation
//! - Response envelopes echoing the caller's request id
//! - The stable error-kind taxonomy shared by server and clients

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;

pub use codec::{Decoder, Encoder};
pub use error::{ErrorKind, ProtocolError};
pub use frame::{Frame, FrameFlags, FRAME_HEADER_SIZE, MAGIC};
pub use message::{
    CommandKind, CommandPayload, DiagnosticEntry, InfoResult, MutationDescriptor, ParsedRequest,
    ReloadRequest, ReloadResult, ReloadStatusResult, ReloadSummary, Request, Response,
    ResponseError, StateQuery, Verbosity,
};

/// Protocol version supported by this implementation.
pub const PROTOCOL_VERSION: u16 = 1;

/// Default port for the hostbridge server.
pub const DEFAULT_PORT: u16 = 7410;

/// Maximum frame payload size (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;
