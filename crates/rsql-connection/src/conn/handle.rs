//! The single driver connection owned by a `Conn`

use parking_lot::Mutex;
use rsql_core::{Driver, DriverConnection, Endpoint, QueryCancelHandle, Result};
use std::sync::Arc;

/// Cancel handle of the live connection, readable without the slot lock
pub(super) type CancelSlot = Arc<Mutex<Option<Arc<dyn QueryCancelHandle>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Health {
    Live,
    Dead,
}

struct Handle {
    conn: Arc<dyn DriverConnection>,
    health: Health,
    endpoint: Endpoint,
    /// BEGIN was sent and neither COMMIT nor ROLLBACK has completed
    in_txn: bool,
}

/// At most one driver connection plus its health.
///
/// A `Dead` handle is never used again: the next `ensure_live` drops it
/// and connects anew. The same goes for a handle left inside a transaction
/// whose `exec_txn` was dropped before it finished.
pub(super) struct HandleSlot {
    handle: Option<Handle>,
    cancel: CancelSlot,
    connects: u64,
}

impl HandleSlot {
    pub(super) fn new(cancel: CancelSlot) -> Self {
        Self {
            handle: None,
            cancel,
            connects: 0,
        }
    }

    /// Return a live connection, connecting to `endpoint` if there is none.
    ///
    /// A handle that is marked dead, that the driver already reports closed,
    /// or that still has an abandoned transaction open is discarded first;
    /// nothing was sent on it for this call. Dropping it ends the session,
    /// and the server rolls the abandoned transaction back.
    /// A failed connect leaves the slot empty so the next call tries again.
    pub(super) async fn ensure_live(
        &mut self,
        driver: &dyn Driver,
        endpoint: &Endpoint,
    ) -> Result<Arc<dyn DriverConnection>> {
        if let Some(handle) = &self.handle {
            if handle.health == Health::Live && !handle.in_txn && !handle.conn.is_closed() {
                return Ok(Arc::clone(&handle.conn));
            }
        }

        if let Some(stale) = self.discard() {
            if stale.in_txn && stale.health == Health::Live {
                tracing::warn!(endpoint = %stale.endpoint, "discarding connection with an abandoned transaction");
            }
            tracing::info!(
                previous = %stale.endpoint,
                endpoint = %endpoint,
                health = ?stale.health,
                "reconnecting"
            );
        }

        let conn = driver.connect(endpoint).await?;
        self.connects += 1;
        tracing::info!(
            endpoint = %endpoint,
            driver = conn.driver_name(),
            connects = self.connects,
            "connection established"
        );

        *self.cancel.lock() = conn.cancel_handle();
        self.handle = Some(Handle {
            conn: Arc::clone(&conn),
            health: Health::Live,
            endpoint: endpoint.clone(),
            in_txn: false,
        });
        Ok(conn)
    }

    /// Record that a transaction is about to be opened on the handle
    pub(super) fn begin_txn(&mut self) {
        if let Some(handle) = &mut self.handle {
            handle.in_txn = true;
        }
    }

    /// Record that the open transaction was committed or rolled back
    pub(super) fn end_txn(&mut self) {
        if let Some(handle) = &mut self.handle {
            handle.in_txn = false;
        }
    }

    /// Flag the handle as unusable without talking to the server
    pub(super) fn mark_dead(&mut self) {
        if let Some(handle) = &mut self.handle {
            if handle.health == Health::Live {
                tracing::warn!(endpoint = %handle.endpoint, "connection marked dead");
            }
            handle.health = Health::Dead;
        }
        self.cancel.lock().take();
    }

    /// Close and release the connection. Idempotent.
    pub(super) async fn teardown(&mut self) -> Result<()> {
        let Some(handle) = self.discard() else {
            return Ok(());
        };
        if handle.health == Health::Dead {
            return Ok(());
        }
        tracing::debug!(endpoint = %handle.endpoint, "closing connection");
        handle.conn.close().await
    }

    pub(super) fn health(&self) -> Option<Health> {
        self.handle.as_ref().map(|h| h.health)
    }

    #[cfg(test)]
    pub(super) fn in_txn(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| h.in_txn)
    }

    fn discard(&mut self) -> Option<Handle> {
        self.cancel.lock().take();
        self.handle.take()
    }
}
