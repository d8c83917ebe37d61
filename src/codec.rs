//! # Stratum Line Protocol
//!
//! Stratum speaks newline-delimited JSON-RPC over plain TCP. [`LineCodec`]
//! frames the inbound byte stream into request lines and refuses to buffer
//! more than [`MAX_REQ_SIZE`] bytes looking for a terminator, which is how a
//! socket flood is detected. Outbound messages are any `Serialize` value
//! followed by `\n`.
//!
//! ## Envelopes
//! ```text
//! request:       {"id":1,"method":"eth_submitWork","params":[...],"worker":"rig1"}
//! result:        {"id":1,"jsonrpc":"2.0","error":null,"result":true}
//! error:         {"id":1,"jsonrpc":"2.0","error":{"code":-1,"message":"..."}}
//! notification:  {"jsonrpc":"2.0","result":[header,seed,target],"id":0}
//! ```

use std::cmp;

use bytes::{BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{CodecError, ErrorReply};

/// Maximum request line size in bytes, shared by every endpoint
pub const MAX_REQ_SIZE: usize = 1024;

pub const JSONRPC_VERSION: &str = "2.0";

/// Placeholder id carried by job notifications for Claymore compatibility
pub const NOTIFICATION_ID: u8 = 0;

/// Newline framing with a hard cap on line length
#[derive(Debug, Clone)]
pub struct LineCodec {
    max_length: usize,
    // Where to resume the terminator scan on the next decode call
    next_index: usize,
}

impl LineCodec {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
        }
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new(MAX_REQ_SIZE)
    }
}

impl Decoder for LineCodec {
    type Item = BytesMut;
    type Error = CodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<BytesMut>, CodecError> {
        // A terminator may sit at most at index `max_length`, one further
        // when a `\r` at the limit starts a `\r\n` pair
        let window = match buf.get(self.max_length) {
            Some(b'\r') => self.max_length.saturating_add(2),
            _ => self.max_length.saturating_add(1),
        };
        let read_to = cmp::min(window, buf.len());

        let newline = buf[self.next_index..read_to]
            .iter()
            .position(|b| *b == b'\n')
            .map(|offset| self.next_index + offset);

        match newline {
            Some(newline) => {
                self.next_index = 0;
                let mut line = buf.split_to(newline + 1);
                line.truncate(newline);
                if line.last() == Some(&b'\r') {
                    line.truncate(newline - 1);
                }
                Ok(Some(line))
            }
            None if buf.len() >= window => Err(CodecError::LineTooLong {
                limit: self.max_length,
            }),
            None => {
                self.next_index = read_to;
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<BytesMut>, CodecError> {
        match self.decode(buf)? {
            Some(line) => Ok(Some(line)),
            None if buf.is_empty() => Ok(None),
            None => {
                // Unterminated trailing line, hand it over as-is
                self.next_index = 0;
                Ok(Some(buf.split_to(buf.len())))
            }
        }
    }
}

impl<T: Serialize> Encoder<T> for LineCodec {
    type Error = CodecError;

    fn encode(&mut self, item: T, buf: &mut BytesMut) -> Result<(), CodecError> {
        serde_json::to_writer(buf.writer(), &item)?;
        buf.put_u8(b'\n');
        Ok(())
    }
}

/// One decoded request line
#[derive(Debug, Deserialize)]
pub struct StratumRequest {
    #[serde(default)]
    pub id: Option<Box<RawValue>>,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub params: Option<Box<RawValue>>,
    #[serde(default)]
    pub worker: String,
}

impl StratumRequest {
    pub fn id(&self) -> Option<&RawValue> {
        self.id.as_deref()
    }

    /// Decode the raw params for the method at hand. Missing params decode as `null`.
    pub fn params<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        let raw = self.params.as_deref().map(RawValue::get).unwrap_or("null");
        serde_json::from_str(raw)
    }
}

/// Direct reply to a request
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse<'a, T> {
    pub id: Option<&'a RawValue>,
    pub jsonrpc: &'static str,
    pub error: Option<&'a ErrorReply>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<&'a T>,
}

impl<'a, T> JsonRpcResponse<'a, T> {
    pub fn result(id: Option<&'a RawValue>, result: &'a T) -> Self {
        Self {
            id,
            jsonrpc: JSONRPC_VERSION,
            error: None,
            result: Some(result),
        }
    }
}

impl<'a> JsonRpcResponse<'a, ()> {
    pub fn error(id: Option<&'a RawValue>, reply: &'a ErrorReply) -> Self {
        Self {
            id,
            jsonrpc: JSONRPC_VERSION,
            error: Some(reply),
            result: None,
        }
    }
}

/// Server-initiated job notification
#[derive(Debug, Serialize)]
pub struct JsonPushMessage<'a, T> {
    pub jsonrpc: &'static str,
    pub result: &'a T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u8>,
}

impl<'a, T> JsonPushMessage<'a, T> {
    pub fn new(result: &'a T, placeholder_id: bool) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            result,
            id: placeholder_id.then_some(NOTIFICATION_ID),
        }
    }
}
