//! Inbound frame decoding and validation.
//!
//! Runs before anything touches the message log. A frame that passes here is
//! safe to persist.

use roomcast_proto::ClientEvent;

use crate::error::IngestError;

/// Default content limit in Unicode scalar values.
pub const DEFAULT_MAX_CONTENT_CHARS: usize = 2000;

/// Validation policy for inbound frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestPolicy {
    /// Maximum message length in Unicode scalar values
    pub max_content_chars: usize,
}

impl Default for IngestPolicy {
    fn default() -> Self {
        Self { max_content_chars: DEFAULT_MAX_CONTENT_CHARS }
    }
}

impl IngestPolicy {
    /// Create a policy with the given content limit.
    pub fn new(max_content_chars: usize) -> Self {
        Self { max_content_chars }
    }

    /// Decode a text frame and validate its content.
    ///
    /// # Errors
    ///
    /// - `IngestError::MalformedFrame` if the frame does not decode
    /// - `IngestError::UnsupportedEvent` for unknown event types
    /// - `IngestError::EmptyMessage` / `ContentTooLong` from
    ///   [`Self::validate_content`]
    pub fn decode(&self, raw: &str) -> Result<ClientEvent, IngestError> {
        let event = ClientEvent::parse(raw)?;

        if let ClientEvent::Message { content } = &event {
            self.validate_content(content)?;
        }

        Ok(event)
    }

    /// Check message content against the policy.
    ///
    /// Content is stored as sent; trimming is only used for the emptiness
    /// check.
    ///
    /// # Errors
    ///
    /// - `IngestError::EmptyMessage` if empty or whitespace only
    /// - `IngestError::ContentTooLong` if over `max_content_chars`
    pub fn validate_content(&self, content: &str) -> Result<(), IngestError> {
        if content.trim().is_empty() {
            return Err(IngestError::EmptyMessage);
        }

        let len = content.chars().count();
        if len > self.max_content_chars {
            return Err(IngestError::ContentTooLong { len, max: self.max_content_chars });
        }

        Ok(())
    }
}
