//! Wire message codec
//!
//! A message is a block of `key:value` header lines, one blank line, then
//! the payload verbatim. The same shape is used for requests and responses.

use crate::error::{SyncError, SyncResult};

/// Header and payload of one request or response.
///
/// Header keys are case-sensitive and unique; insertion order is kept so
/// that encoding is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncMessage {
    headers: Vec<(String, String)>,
    payload: String,
}

impl SyncMessage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a header, replacing any previous value for the same key.
    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.headers.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.headers.push((key, value)),
        }
    }

    /// Header value with surrounding whitespace removed.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.trim())
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn set_payload(&mut self, payload: impl Into<String>) {
        self.payload = payload.into();
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Non-empty payload entries in order.
    pub fn payload_lines(&self) -> impl Iterator<Item = &str> {
        self.payload.lines().filter(|line| !line.trim().is_empty())
    }

    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(self.payload.len() + 64);
        for (key, value) in &self.headers {
            out.push_str(key);
            out.push(':');
            out.push_str(value);
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.payload);
        out
    }

    /// Parse a message. Fails with `MalformedMessage` when the header block
    /// is not terminated by a blank line or a header line has no `:`.
    pub fn decode(raw: &str) -> SyncResult<Self> {
        let mut message = SyncMessage::new();
        let mut rest = raw;

        loop {
            let Some(newline) = rest.find('\n') else {
                return Err(SyncError::MalformedMessage(
                    "missing blank line after headers".to_string(),
                ));
            };
            let (line, tail) = rest.split_at(newline);
            rest = tail.get(1..).unwrap_or_default();

            if line.is_empty() {
                break;
            }

            let (key, value) = line.split_once(':').ok_or_else(|| {
                SyncError::MalformedMessage(format!("header line without ':' separator: {}", line))
            })?;
            if message.headers.iter().any(|(k, _)| k == key) {
                return Err(SyncError::MalformedMessage(format!(
                    "duplicate header: {}",
                    key
                )));
            }
            message.headers.push((key.to_string(), value.to_string()));
        }

        message.payload = rest.to_string();
        Ok(message)
    }
}
