//! Connection Registry
//!
//! Maps a connection name to its live driver. Drivers are created lazily on first use and shared
//! by every caller afterwards.
//!
//! Concurrent first use of a name shares one connect attempt: the first caller stores a shared
//! future in the slot and later callers await the same future, so exactly one driver is built
//! and every waiter sees the same instance or the same error. A failed attempt removes its slot
//! and the next call starts a fresh one.
//!
//! A connect attempt that does not finish within the connect timeout fails, so a server that
//! accepts the socket and never answers cannot leave a slot connecting forever. An attempt whose
//! slot was dropped by [`ConnectionRegistry::shutdown`] or [`ConnectionRegistry::disconnect`]
//! closes its driver instead of handing it out.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, info, warn};

use crate::config::{ConnectionSpec, DEFAULT_QUERY_TIMEOUT_MS};
use crate::engine::{BackendKind, DatabaseDriver, Driver};
use crate::error::{ConnectionCause, GatewayError, Result};

/// Opens drivers for the registry
pub trait Connector: Send + Sync + 'static {
    /// Build and connect a driver for `spec`
    fn connect(&self, name: &str, spec: &ConnectionSpec) -> BoxFuture<'static, Result<Driver>>;
}

/// Expands the location from the environment, then connects the backend's driver
#[derive(Debug, Clone, Copy, Default)]
pub struct DriverConnector;

impl Connector for DriverConnector {
    fn connect(&self, name: &str, spec: &ConnectionSpec) -> BoxFuture<'static, Result<Driver>> {
        let location = spec.resolved_location(name);
        let backend = spec.backend;
        async move {
            let driver = Driver::new(backend, &location?);
            driver.connect().await?;
            Ok(driver)
        }
        .boxed()
    }
}

/// A connected driver bound to one connection name
pub struct LiveConnection {
    name: String,
    driver: Driver,
    advisory_shown: AtomicBool,
}

impl LiveConnection {
    #[must_use]
    pub fn new(name: impl Into<String>, driver: Driver) -> Self {
        Self { name: name.into(), driver, advisory_shown: AtomicBool::new(false) }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn backend(&self) -> BackendKind {
        self.driver.backend()
    }

    #[must_use]
    pub const fn driver(&self) -> &Driver {
        &self.driver
    }

    /// Timeout advisory for this connection, returned only the first time it is asked for
    pub fn take_advisory(&self) -> Option<String> {
        let advisory = self.driver.timeout_support().advisory(self.backend())?;
        (!self.advisory_shown.swap(true, Ordering::AcqRel)).then_some(advisory)
    }
}

impl fmt::Debug for LiveConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveConnection").field("name", &self.name).field("backend", &self.backend()).finish()
    }
}

type ConnectFuture = Shared<BoxFuture<'static, Result<Arc<LiveConnection>>>>;

enum Slot {
    Ready(Arc<LiveConnection>),
    Connecting { attempt: u64, future: ConnectFuture },
}

/// What a finished attempt does to its slot
enum Settlement {
    Register,
    Forget,
    /// The slot belongs to someone else, or nobody
    Orphaned,
    Nothing,
}

/// Process-lifetime cache of live connections
pub struct ConnectionRegistry {
    connector: Arc<dyn Connector>,
    slots: Mutex<HashMap<String, Slot>>,
    attempts: AtomicU64,
    connect_timeout: Duration,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(Arc::new(DriverConnector))
    }
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            slots: Mutex::new(HashMap::new()),
            attempts: AtomicU64::new(0),
            connect_timeout: Duration::from_millis(DEFAULT_QUERY_TIMEOUT_MS),
        }
    }

    /// Bound every connect attempt by `timeout`
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the live connection for `name`, connecting it on first use
    pub async fn get_or_connect(&self, name: &str, spec: &ConnectionSpec) -> Result<Arc<LiveConnection>> {
        let (attempt, future) = {
            let mut slots = self.slots();
            match slots.get(name) {
                Some(Slot::Ready(live)) => return Ok(Arc::clone(live)),
                Some(Slot::Connecting { attempt, future }) => {
                    debug!(connection = name, "waiting on connect already in flight");
                    (*attempt, future.clone())
                }
                None => {
                    let attempt = self.attempts.fetch_add(1, Ordering::Relaxed);
                    let connecting = self.connector.connect(name, spec);
                    let owned_name = name.to_string();
                    let timeout = self.connect_timeout;
                    let future = async move {
                        let Ok(driver) = tokio::time::timeout(timeout, connecting).await else {
                            return Err(GatewayError::connection(
                                ConnectionCause::Other,
                                format!("'{owned_name}' did not answer within {} ms", timeout.as_millis()),
                            ));
                        };
                        Ok(Arc::new(LiveConnection::new(owned_name, driver?)))
                    }
                    .boxed()
                    .shared();
                    slots.insert(name.to_string(), Slot::Connecting { attempt, future: future.clone() });
                    info!(connection = name, backend = %spec.backend, "connecting");
                    (attempt, future)
                }
            }
        };

        let result = future.await;
        if let Some(orphan) = self.settle(name, attempt, &result) {
            close_live(&orphan).await;
            return Err(GatewayError::connection(
                ConnectionCause::Other,
                format!("'{name}' was closed while it was being opened"),
            ));
        }
        result
    }

    /// Replace the in-flight slot with its result; later waiters find it already settled
    ///
    /// Returns the connection when its slot is gone, so the caller can close it.
    fn settle(&self, name: &str, attempt: u64, result: &Result<Arc<LiveConnection>>) -> Option<Arc<LiveConnection>> {
        let mut slots = self.slots();
        let settlement = match (slots.get(name), result) {
            (Some(Slot::Connecting { attempt: current, .. }), Ok(_)) if *current == attempt => Settlement::Register,
            (Some(Slot::Connecting { attempt: current, .. }), Err(_)) if *current == attempt => Settlement::Forget,
            (Some(Slot::Ready(registered)), Ok(live)) if Arc::ptr_eq(registered, live) => Settlement::Nothing,
            (_, Ok(_)) => Settlement::Orphaned,
            (_, Err(_)) => Settlement::Nothing,
        };

        match (settlement, result) {
            (Settlement::Register, Ok(live)) => {
                slots.insert(name.to_string(), Slot::Ready(Arc::clone(live)));
                None
            }
            (Settlement::Forget, Err(e)) => {
                slots.remove(name);
                warn!(connection = name, code = e.error_code(), "connect failed");
                None
            }
            (Settlement::Orphaned, Ok(live)) => {
                debug!(connection = name, "connect finished after its slot was dropped");
                Some(Arc::clone(live))
            }
            _ => None,
        }
    }

    /// Whether `name` has a connected driver
    #[must_use]
    pub fn is_live(&self, name: &str) -> bool {
        matches!(self.slots().get(name), Some(Slot::Ready(_)))
    }

    /// Names with a connected driver, sorted
    #[must_use]
    pub fn live_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .slots()
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Ready(_)))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Close and forget one connection; the next use reconnects
    pub async fn disconnect(&self, name: &str) -> bool {
        let removed = self.slots().remove(name);
        match removed {
            Some(Slot::Ready(live)) => {
                close_live(&live).await;
                true
            }
            Some(Slot::Connecting { .. }) | None => false,
        }
    }

    /// Close every live connection and empty the registry
    ///
    /// Close failures are logged and do not stop the remaining closes.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, Slot)> = self.slots().drain().collect();
        let mut closed = 0usize;
        for (name, slot) in drained {
            match slot {
                Slot::Ready(live) => {
                    close_live(&live).await;
                    closed += 1;
                }
                Slot::Connecting { .. } => debug!(connection = %name, "dropping in-flight connect"),
            }
        }
        info!(closed, "registry shut down");
    }
}

async fn close_live(live: &LiveConnection) {
    if let Err(e) = live.driver.close().await {
        warn!(connection = live.name(), error = %e.message(), "close failed");
    }
}
