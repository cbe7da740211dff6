use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A document exactly as the cluster client returned it.
///
/// The content is opaque bytes; turning it into something typed is the job of
/// a [`Decoder`](crate::Decoder).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawDocument {
    pub id: String,
    pub content: Bytes,
    pub cas: u64,
    pub expiry: Option<u32>,
}

impl RawDocument {
    pub fn new(id: impl Into<String>, content: impl Into<Bytes>, cas: u64) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            cas,
            expiry: None,
        }
    }

    #[must_use]
    pub const fn with_expiry(mut self, expiry: u32) -> Self {
        self.expiry = Some(expiry);
        self
    }
}

/// A successfully fetched and decoded document.
///
/// Documents are only ever produced for keys that exist and decoded without
/// error. They are immutable once created; callers own them after they leave
/// the result sequence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document<T = serde_json::Value> {
    id: String,
    content: T,
    cas: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expiry: Option<u32>,
}

impl<T> Document<T> {
    pub fn new(id: impl Into<String>, content: T, cas: u64, expiry: Option<u32>) -> Self {
        Self {
            id: id.into(),
            content,
            cas,
            expiry,
        }
    }

    /// The document key.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The decoded content payload.
    pub const fn content(&self) -> &T {
        &self.content
    }

    /// The content-change token at the time of the fetch.
    pub const fn cas(&self) -> u64 {
        self.cas
    }

    /// Expiry in seconds, if the document has one.
    pub const fn expiry(&self) -> Option<u32> {
        self.expiry
    }

    pub fn into_content(self) -> T {
        self.content
    }
}
