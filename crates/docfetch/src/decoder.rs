//! Decoding raw document content into caller-chosen types.
//!
//! The decoder is picked explicitly per retrieval through
//! [`RetrieveOptions`](crate::RetrieveOptions) and defaults to
//! [`JsonDecoder`], which yields schema-less JSON documents.

use crate::{
    error::DecodeError,
    model::{Document, RawDocument},
};
use bytes::Bytes;
use core::marker::PhantomData;
use serde::de::DeserializeOwned;

/// Turns a [`RawDocument`] into the item type of a document sequence.
///
/// A decode failure only affects the document being decoded: it is counted and
/// skipped, sibling documents in the same partition are unaffected.
pub trait Decoder: Send + Sync + 'static {
    type Output: Send + 'static;

    /// # Errors
    ///
    /// Returns a [`DecodeError`] when the content does not have the expected
    /// shape.
    fn decode(&self, raw: RawDocument) -> Result<Self::Output, DecodeError>;
}

/// Decodes content as arbitrary JSON.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonDecoder;

impl Decoder for JsonDecoder {
    type Output = Document<serde_json::Value>;

    fn decode(&self, raw: RawDocument) -> Result<Self::Output, DecodeError> {
        decode_json(raw)
    }
}

/// Decodes content as JSON into a concrete `T`.
pub struct TypedDecoder<T>(PhantomData<fn() -> T>);

impl<T> TypedDecoder<T> {
    pub const fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for TypedDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for TypedDecoder<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> core::fmt::Debug for TypedDecoder<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("TypedDecoder")
            .field(&core::any::type_name::<T>())
            .finish()
    }
}

impl<T> Decoder for TypedDecoder<T>
where
    T: DeserializeOwned + Send + 'static,
{
    type Output = Document<T>;

    fn decode(&self, raw: RawDocument) -> Result<Self::Output, DecodeError> {
        decode_json(raw)
    }
}

/// Passes content through untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct RawDecoder;

impl Decoder for RawDecoder {
    type Output = Document<Bytes>;

    fn decode(&self, raw: RawDocument) -> Result<Self::Output, DecodeError> {
        Ok(Document::new(raw.id, raw.content, raw.cas, raw.expiry))
    }
}

fn decode_json<T: DeserializeOwned>(raw: RawDocument) -> Result<Document<T>, DecodeError> {
    match serde_json::from_slice(&raw.content) {
        Ok(content) => Ok(Document::new(raw.id, content, raw.cas, raw.expiry)),
        Err(e) => Err(DecodeError {
            id: raw.id,
            reason: e.to_string(),
        }),
    }
}
