//! Concurrent per-item bulk operations against a single connection.
//!
//! A bulk request is decomposed into one client call per key (or spec), with
//! at most `max_concurrency` calls in flight. Items are independent: a missing
//! key, a per-item timeout or a decode failure is absorbed into the result
//! shape and counted in [`SequenceStats`]; only a fatal client error (see
//! [`ClientError::is_fatal`]) escapes, and it ends the stream for the whole
//! partition.
//!
//! ## Ordering
//!
//! - [`BulkFetcher::fetch_documents`] yields in completion order. Missing keys
//!   are filtered out, so positions would not line up with the input anyway.
//! - [`BulkFetcher::fetch_subdocs`] yields in input order, one result per
//!   spec, so callers can zip results with the specs they submitted.

use crate::{
    client::Connection,
    decoder::Decoder,
    error::{ClientError, PathError},
    model::{RawLookupResult, SubdocLookupResult, SubdocLookupSpec},
    sequencer::SequenceStats,
};
use futures::{Stream, StreamExt, future, stream};
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc};

/// Issues bounded-concurrency bulk gets and sub-document lookups.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BulkFetcher {
    max_concurrency: usize,
}

enum Outcome<T> {
    Item(T),
    Skipped,
    Fatal(ClientError),
}

impl BulkFetcher {
    /// A concurrency of zero is treated as one.
    pub const fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: if max_concurrency == 0 {
                1
            } else {
                max_concurrency
            },
        }
    }

    pub const fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Fetches and decodes every key, yielding only documents that exist and
    /// decoded cleanly.
    ///
    /// The stream ends early with an `Err` on the first fatal client error.
    pub fn fetch_documents<C, D>(
        self,
        conn: Arc<C>,
        keys: Vec<String>,
        decoder: Arc<D>,
        stats: Arc<SequenceStats>,
    ) -> impl Stream<Item = Result<D::Output, ClientError>> + Send + 'static
    where
        C: Connection,
        D: Decoder,
    {
        stream::iter(keys)
            .map(move |key| {
                fetch_document(
                    Arc::clone(&conn),
                    key,
                    Arc::clone(&decoder),
                    Arc::clone(&stats),
                )
            })
            .buffer_unordered(self.max_concurrency)
            .filter_map(|outcome| {
                future::ready(match outcome {
                    Outcome::Item(doc) => Some(Ok(doc)),
                    Outcome::Skipped => None,
                    Outcome::Fatal(e) => Some(Err(e)),
                })
            })
    }

    /// Looks up every spec, yielding exactly one result per spec in input
    /// order.
    ///
    /// The stream ends early with an `Err` on the first fatal client error.
    pub fn fetch_subdocs<C>(
        self,
        conn: Arc<C>,
        specs: Vec<SubdocLookupSpec>,
        stats: Arc<SequenceStats>,
    ) -> impl Stream<Item = Result<SubdocLookupResult, ClientError>> + Send + 'static
    where
        C: Connection,
    {
        stream::iter(specs)
            .map(move |spec| lookup_subdoc(Arc::clone(&conn), spec, Arc::clone(&stats)))
            .buffered(self.max_concurrency)
    }
}

async fn fetch_document<C, D>(
    conn: Arc<C>,
    key: String,
    decoder: Arc<D>,
    stats: Arc<SequenceStats>,
) -> Outcome<D::Output>
where
    C: Connection,
    D: Decoder,
{
    match conn.get(&key).await {
        Ok(Some(raw)) => match decoder.decode(raw) {
            Ok(doc) => Outcome::Item(doc),
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!("Skipping `{key}`: {_e}");
                stats.record_failed();
                Outcome::Skipped
            }
        },
        Ok(None) | Err(ClientError::NotFound) => {
            #[cfg(feature = "tracing")]
            tracing::debug!("Skipping `{key}`: not found");
            stats.record_not_found();
            Outcome::Skipped
        }
        Err(e) if e.is_fatal() => Outcome::Fatal(e),
        Err(_e) => {
            #[cfg(feature = "tracing")]
            tracing::warn!("Skipping `{key}`: {_e}");
            stats.record_failed();
            Outcome::Skipped
        }
    }
}

async fn lookup_subdoc<C: Connection>(
    conn: Arc<C>,
    spec: SubdocLookupSpec,
    stats: Arc<SequenceStats>,
) -> Result<SubdocLookupResult, ClientError> {
    match conn.lookup_in(&spec).await {
        Ok(raw) => Ok(decode_lookup(&spec, raw)),
        Err(ClientError::NotFound) => {
            stats.record_not_found();
            Ok(SubdocLookupResult::not_found(&spec))
        }
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            #[cfg(feature = "tracing")]
            tracing::warn!("Lookup of `{}` failed: {e}", spec.id());
            stats.record_failed();
            Ok(SubdocLookupResult::failed(&spec, e.to_string()))
        }
    }
}

/// Decodes path values and makes sure every requested path has an entry,
/// whatever the client actually returned.
fn decode_lookup(spec: &SubdocLookupSpec, raw: RawLookupResult) -> SubdocLookupResult {
    let mut fields: BTreeMap<String, Result<Value, PathError>> = raw
        .fields
        .into_iter()
        .map(|(path, value)| {
            let value = value.and_then(|bytes| {
                serde_json::from_slice(&bytes).map_err(|e| PathError::Decode {
                    reason: e.to_string(),
                })
            });
            (path, value)
        })
        .collect();
    let mut exists: BTreeMap<String, Result<bool, PathError>> = raw.exists.into_iter().collect();

    let content = spec
        .get_paths()
        .iter()
        .map(|path| (path.clone(), fields.remove(path).unwrap_or_else(missing_path)))
        .collect();
    let exists = spec
        .exists_paths()
        .iter()
        .map(|path| (path.clone(), exists.remove(path).unwrap_or_else(missing_path)))
        .collect();

    SubdocLookupResult::new(spec.id(), raw.cas, content, exists)
}

fn missing_path<T>() -> Result<T, PathError> {
    Err(PathError::LookupFailed {
        reason: "no result returned for path".into(),
    })
}
