//! Stream session identifiers
//!
//! The backend hands out stream IDs and the relay treats them as opaque: it
//! never inspects their contents, only echoes them into the upstream query
//! string (percent-escaped by the URL builder). Validation is therefore
//! limited to presence and a defensive length cap.

use thiserror::Error;

/// Length cap on stream IDs, in bytes
const MAX_STREAM_ID_LEN: usize = 512;

/// Errors that can occur during stream ID validation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StreamIdError {
    /// Stream ID is empty
    #[error("Stream ID cannot be empty")]
    Empty,

    /// Stream ID exceeds the length cap
    #[error("Stream ID exceeds maximum length of {MAX_STREAM_ID_LEN} bytes")]
    TooLong,
}

/// An opaque stream session identifier
///
/// Any non-empty string up to 512 bytes is a valid stream ID; the relay
/// forwards it verbatim and attaches no meaning to its contents.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamId(String);

impl StreamId {
    /// Get the stream ID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for StreamId {
    type Error = StreamIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            return Err(StreamIdError::Empty);
        }
        if value.len() > MAX_STREAM_ID_LEN {
            return Err(StreamIdError::TooLong);
        }
        Ok(StreamId(value))
    }
}

impl TryFrom<&str> for StreamId {
    type Error = StreamIdError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        StreamId::try_from(value.to_string())
    }
}

impl AsRef<str> for StreamId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
