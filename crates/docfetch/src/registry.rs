//! Process-wide cache of pooled connections, keyed by collection name.
//!
//! One [`ConnectionRegistry`] lives for the lifetime of a worker process (it is
//! owned by the [`RetrievalEngine`](crate::RetrievalEngine)). Every partition
//! executing on the process shares the connections it hands out; no partition
//! ever closes one.
//!
//! ## Initialization races
//!
//! Each collection gets a slot holding a [`OnceCell`]. The slot table is only
//! locked long enough to find or insert the slot; connection establishment
//! happens outside that lock, inside the cell, so:
//!
//! - Concurrent `acquire` calls for the same collection establish exactly one
//!   connection. The losers wait for the winner and observe its handle.
//! - A failed establishment leaves the cell empty. The error goes to the
//!   caller that attempted it and a later `acquire` tries again.
//! - Acquiring different collections never serializes on each other.
//! - An establishment that finishes after [`shutdown`](ConnectionRegistry::shutdown)
//!   started closes the new connection and reports
//!   [`ClientError::Shutdown`] instead of handing it out.

use crate::{
    client::{Connection, Connector},
    error::ClientError,
};
use core::time::Duration;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tokio::{sync::OnceCell, time::timeout};
use tokio_util::sync::CancellationToken;

type Slot<T> = Arc<OnceCell<Arc<T>>>;

/// Caches one connection per collection for the worker process.
pub struct ConnectionRegistry<C: Connector> {
    connector: C,
    slots: Mutex<HashMap<String, Slot<C::Connection>>>,
    shutdown_token: CancellationToken,
    shutdown_timeout: Duration,
}

impl<C: Connector> ConnectionRegistry<C> {
    pub fn new(connector: C, shutdown_timeout: Duration) -> Self {
        Self {
            connector,
            slots: Mutex::new(HashMap::new()),
            shutdown_token: CancellationToken::new(),
            shutdown_timeout,
        }
    }

    /// The connector used to establish connections.
    pub const fn connector(&self) -> &C {
        &self.connector
    }

    /// Returns the cached connection for `collection`, establishing it on
    /// first use.
    ///
    /// # Errors
    ///
    /// Returns the connector's error if establishment fails (nothing is
    /// cached in that case), or [`ClientError::Shutdown`] once
    /// [`shutdown`](Self::shutdown) has started.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip(self)))]
    pub async fn acquire(&self, collection: &str) -> Result<Arc<C::Connection>, ClientError> {
        if self.shutdown_token.is_cancelled() {
            return Err(ClientError::Shutdown);
        }

        let slot = Arc::clone(self.slots.lock().entry(collection.to_owned()).or_default());

        let conn = slot
            .get_or_try_init(|| async {
                if self.shutdown_token.is_cancelled() {
                    return Err(ClientError::Shutdown);
                }

                #[cfg(feature = "tracing")]
                tracing::info!("Establishing connection to collection `{collection}`");

                let conn = self.connector.connect(collection).await;

                #[cfg(feature = "tracing")]
                {
                    if let Err(e) = &conn {
                        tracing::warn!("Connection to `{collection}` failed: {e}");
                    }
                }

                conn.map(Arc::new)
            })
            .await?;

        // Shutdown may have drained this slot while the connection was being
        // established, in which case nobody else will ever close it.
        if self.shutdown_token.is_cancelled() {
            let _ = timeout(self.shutdown_timeout, conn.close()).await;
            return Err(ClientError::Shutdown);
        }

        Ok(Arc::clone(conn))
    }

    /// Whether a connection to `collection` is currently established.
    pub fn contains(&self, collection: &str) -> bool {
        self.slots
            .lock()
            .get(collection)
            .is_some_and(|slot| slot.initialized())
    }

    /// Number of established connections.
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes every cached connection and refuses further acquisitions.
    ///
    /// Each close is bounded by the configured shutdown timeout; a close that
    /// fails or times out is logged and does not stop the others.
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();

        let slots: Vec<(String, Slot<C::Connection>)> = self.slots.lock().drain().collect();

        #[cfg(feature = "tracing")]
        tracing::info!("Closing {} cached connection(s)", slots.len());

        let closes = slots.into_iter().map(|(_name, slot)| async move {
            let Some(conn) = slot.get() else {
                return;
            };
            match timeout(self.shutdown_timeout, conn.close()).await {
                Ok(Ok(())) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("Closed connection to `{_name}`");
                }
                Ok(Err(_e)) => {
                    #[cfg(feature = "tracing")]
                    tracing::error!("Failed to close connection to `{_name}`: {_e}");
                }
                Err(_) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("Closing connection to `{_name}` timed out");
                }
            }
        });

        futures::future::join_all(closes).await;
    }
}
