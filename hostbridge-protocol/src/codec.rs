//! Encoder and decoder for frames and messages.

use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::message::{ParsedRequest, Request, Response};
use bytes::BytesMut;
use serde_json::Value;

/// Encodes requests and responses into frames.
pub struct Encoder;

impl Encoder {
    pub fn encode_request(request: &Request) -> Result<BytesMut, ProtocolError> {
        Frame::from_json(request)?.encode()
    }

    pub fn encode_response(response: &Response) -> Result<BytesMut, ProtocolError> {
        Frame::from_json(response)?.encode()
    }

    /// Encodes any JSON-serializable value into a frame.
    pub fn encode_json<T: serde::Serialize>(value: &T) -> Result<BytesMut, ProtocolError> {
        Frame::from_json(value)?.encode()
    }
}

/// Decodes frames into requests and responses.
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next frame from the buffer.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        Frame::decode(&mut self.buffer)
    }

    /// Attempts to decode and validate the next request.
    ///
    /// Envelope and payload-schema failures surface as
    /// [`ProtocolError::Malformed`] carrying the request id when known.
    pub fn decode_request(&mut self) -> Result<Option<ParsedRequest>, ProtocolError> {
        let frame = match self.decode_frame()? {
            Some(frame) => frame,
            None => return Ok(None),
        };

        let payload = std::str::from_utf8(&frame.payload).map_err(|_| ProtocolError::InvalidUtf8)?;
        let value: Value = serde_json::from_str(payload)
            .map_err(|e| ProtocolError::malformed(None, format!("invalid JSON: {}", e)))?;

        Request::from_value(value)?.parse().map(Some)
    }

    /// Attempts to decode the next response from the buffer.
    pub fn decode_response(&mut self) -> Result<Option<Response>, ProtocolError> {
        match self.decode_frame()? {
            Some(frame) => {
                let payload =
                    std::str::from_utf8(&frame.payload).map_err(|_| ProtocolError::InvalidUtf8)?;
                Ok(Some(serde_json::from_str(payload)?))
            }
            None => Ok(None),
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
