//! JSON codec
//!
//! `serialize`/`deserialize` convert single messages. `FrameDecoder` handles a
//! byte stream: complete WebSocket messages are pushed in, and whole JSON values
//! are pulled out one at a time, so a buffer holding several back-to-back values
//! yields several messages, while a truncated value waits for more input until
//! `finish` marks the end of the transport message.

use serde_json::Value;

use crate::protocol::message::Message;
use crate::utils::error::{MessageRouterError, Result};

pub fn serialize(message: &Message) -> Result<String> {
    serde_json::to_string(message).map_err(MessageRouterError::from)
}

pub fn deserialize(bytes: &[u8]) -> Result<Message> {
    serde_json::from_slice(bytes).map_err(MessageRouterError::from)
}

#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

enum Scan {
    Empty,
    Incomplete,
    Value(Value, usize),
    Malformed(serde_json::Error),
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Number of bytes waiting to be decoded.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Decodes the next message from the buffer.
    ///
    /// Returns `None` when the buffer holds no complete JSON value. A value that
    /// is valid JSON but not a known message is consumed and reported as an
    /// error. Syntactically broken input discards the whole buffer.
    pub fn decode_next(&mut self) -> Option<Result<Message>> {
        match self.scan() {
            Scan::Empty => {
                self.buffer.clear();
                None
            }
            Scan::Incomplete => None,
            Scan::Value(value, consumed) => {
                self.buffer.drain(..consumed);
                Some(serde_json::from_value(value).map_err(MessageRouterError::from))
            }
            Scan::Malformed(err) => {
                self.buffer.clear();
                Some(Err(err.into()))
            }
        }
    }

    /// Ends the current transport message. Bytes still buffered belong to a
    /// value that was cut off; they are discarded and reported.
    pub fn finish(&mut self) -> Option<MessageRouterError> {
        if self.buffer.iter().all(u8::is_ascii_whitespace) {
            self.buffer.clear();
            return None;
        }

        let dropped = self.buffer.len();
        self.buffer.clear();
        Some(MessageRouterError::MessageParse(format!(
            "{dropped} trailing bytes do not form a complete message"
        )))
    }

    fn scan(&self) -> Scan {
        let mut stream = serde_json::Deserializer::from_slice(&self.buffer).into_iter::<Value>();
        match stream.next() {
            None => Scan::Empty,
            Some(Ok(value)) => Scan::Value(value, stream.byte_offset()),
            Some(Err(err)) if err.is_eof() => Scan::Incomplete,
            Some(Err(err)) => Scan::Malformed(err),
        }
    }
}
