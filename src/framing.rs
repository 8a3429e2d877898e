//! Native-messaging wire framing.
//!
//! Frames are `uint32_le length || bytes json`. Reads and writes are
//! synchronous and never interleave with controller work on the same
//! frame. A violation of the wire format is unrecoverable: the caller
//! writes a best-effort terminal error and exits with code 2.

use std::io::{self, Read, Write};

use serde_json::{Map, Value};

/// Maximum accepted request frame body.
pub const MAX_REQUEST_SIZE: usize = 8 * 1024;
/// Maximum emitted response frame body.
pub const MAX_RESPONSE_SIZE: usize = 1024 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum FramingError {
    #[error("request frame of {0} bytes exceeds the {MAX_REQUEST_SIZE} byte limit")]
    RequestTooLarge(usize),
    #[error("response frame of {0} bytes exceeds the {MAX_RESPONSE_SIZE} byte limit")]
    ResponseTooLarge(usize),
    #[error("frame truncated by end of stream")]
    Truncated,
    #[error("frame body is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("stream error: {0}")]
    Io(#[from] io::Error),
}

/// The read half of the framed endpoint. Moves onto the input pump thread
/// once a card command is in flight.
pub struct FrameReader<R> {
    reader: R,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Read one request frame. `Ok(None)` on clean EOF before a header.
    pub fn read_request(&mut self) -> Result<Option<Value>, FramingError> {
        let mut header = [0u8; 4];
        match self.reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_le_bytes(header) as usize;
        if len > MAX_REQUEST_SIZE {
            return Err(FramingError::RequestTooLarge(len));
        }

        let mut body = vec![0u8; len];
        match self.reader.read_exact(&mut body) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(FramingError::Truncated);
            }
            Err(e) => return Err(e.into()),
        }

        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| FramingError::InvalidJson(e.to_string()))
    }
}

/// The write half of the framed endpoint. Stays on the main thread.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write one response frame.
    pub fn write_response(&mut self, response: &Value) -> Result<(), FramingError> {
        let body = serde_json::to_vec(response)
            .map_err(|e| FramingError::InvalidJson(e.to_string()))?;
        if body.len() > MAX_RESPONSE_SIZE {
            return Err(FramingError::ResponseTooLarge(body.len()));
        }
        self.writer.write_all(&(body.len() as u32).to_le_bytes())?;
        self.writer.write_all(&body)?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Build a success response, echoing the request id when present.
pub fn success_response(id: Option<&Value>, payload: Map<String, Value>) -> Value {
    let mut object = Map::new();
    if let Some(id) = id {
        object.insert("id".into(), id.clone());
    }
    object.extend(payload);
    Value::Object(object)
}

/// Build an error response, echoing the request id when present.
pub fn error_response(id: Option<&Value>, code: &str, message: &str) -> Value {
    let mut object = Map::new();
    if let Some(id) = id {
        object.insert("id".into(), id.clone());
    }
    object.insert(
        "error".into(),
        serde_json::json!({ "code": code, "message": message }),
    );
    Value::Object(object)
}
