//! Ordered metadata batches exchanged with the transport.

use crate::error::StatusCode;

/// Key of the status code entry in trailing metadata.
pub const GRPC_STATUS: &str = "grpc-status";
/// Key of the human-readable status message in trailing metadata.
pub const GRPC_MESSAGE: &str = "grpc-message";
/// Key of the balancer-issued token attached to initial metadata.
pub const LB_TOKEN: &str = "lb-token";
/// Key of the content-type entry.
pub const CONTENT_TYPE: &str = "content-type";

/// An ordered list of key/value metadata entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, String)>,
}

impl Metadata {
    /// Creates an empty batch.
    pub fn new() -> Metadata {
        Metadata::default()
    }

    /// Appends an entry at the tail.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    /// First value for `key`, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Removes every entry with `key`.
    pub fn remove(&mut self, key: &str) {
        self.entries.retain(|(k, _)| k != key);
    }

    /// Whether the batch holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Transport-visible size: the sum of key and value byte lengths.
    pub fn byte_size(&self) -> usize {
        self.entries.iter().map(|(k, v)| k.len() + v.len()).sum()
    }

    /// Iterates entries in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Parses the `grpc-status` entry, if present and numeric.
    pub fn grpc_status(&self) -> Option<StatusCode> {
        self.get(GRPC_STATUS)
            .and_then(|v| v.parse::<i32>().ok())
            .and_then(StatusCode::from_code)
    }

    /// Sets the `grpc-status` entry, replacing any existing one.
    pub fn set_grpc_status(&mut self, status: StatusCode) {
        self.remove(GRPC_STATUS);
        self.add(GRPC_STATUS, status.code().to_string());
    }

    /// The `grpc-message` entry, if present.
    pub fn grpc_message(&self) -> Option<&str> {
        self.get(GRPC_MESSAGE)
    }
}

impl FromIterator<(String, String)> for Metadata {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Metadata {
        Metadata {
            entries: iter.into_iter().collect(),
        }
    }
}
