//! The boundary to the external client library.
//!
//! The wire transport and name discovery are not implemented here; they are an
//! external collaborator reached through the [`CaClient`] trait. The trait
//! mirrors the shape of a C-style Channel Access client API: context and
//! channel primitives, get/put/subscribe with per-operation callbacks, and an
//! out-of-band exception callback. Every request carries an opaque
//! [`RefToken`]; the library hands the same token back in its callbacks, which
//! it invokes on threads of its own choosing.
//!
//! [`CaContext`] wraps a client instance with two pieces of discipline this
//! engine relies on:
//! - initialization happens exactly once, its outcome is recorded, and repeat
//!   calls are no-ops that report the recorded outcome;
//! - a coarse lock serializes every call into the library, since it is not
//!   assumed to tolerate concurrent invocation from multiple consumer threads.

use crate::dbr::{Dbr, DbrValue};
use crate::marshal::EngineCallbacks;
use crate::safe_ref::{RefPool, RefToken};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Transport-level channel identifier. Zero means "no channel".
pub type ChannelId = u64;
/// Transport-level subscription identifier. Zero means "no subscription".
pub type SubscriptionId = u64;

/// Connection priority requested when establishing a channel
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Priority {
    Low,
    #[default]
    Default,
    High,
}

/// Tri-state outcome of a request submission
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CaStatus {
    Successful,
    ChannelDisconnected,
    Failed,
}

/// Synchronous rejection from the client library
#[derive(Debug, Clone, Error)]
pub enum CaError {
    #[error("request rejected by the client library: {0}")]
    Rejected(String),
    #[error("context has not been established")]
    NoContext,
    #[error("channel is not established")]
    NoChannel,
    #[error("type code {0} cannot be used for this request")]
    BadType(i32),
}

/// Host-reported channel properties, delivered with a connection callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub native_type: i32,
    pub element_count: u32,
    pub read_access: bool,
    pub write_access: bool,
}

/// Connection state change reported by the library on its own thread
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub token: RefToken,
    pub channel: ChannelId,
    pub up: bool,
    /// Present on up transitions
    pub info: Option<ChannelInfo>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DataEventKind {
    ReadResponse,
    SubscriptionUpdate,
    WriteAck,
}

/// Completion or update for a get/put/subscription, on the library's thread
#[derive(Debug, Clone)]
pub struct DataEvent {
    pub token: RefToken,
    pub channel: ChannelId,
    pub kind: DataEventKind,
    pub ok: bool,
    pub dbr: Option<Dbr>,
}

/// Out-of-band failure report; may carry no channel id at all
#[derive(Debug, Clone)]
pub struct ExceptionEvent {
    pub token: RefToken,
    pub channel: ChannelId,
    pub message: String,
}

/// The external client library, as this engine sees it.
///
/// All request methods are fire-and-forget: success means the request was
/// accepted for submission, and the real outcome arrives later through the
/// [`EngineCallbacks`] installed at context creation, on a thread the library
/// owns. Implementations must never invoke a callback while the caller is
/// still inside one of these methods.
pub trait CaClient: Send + Sync {
    /// Initialize the library context and install the callback entry points.
    fn context_create(&self, callbacks: Arc<EngineCallbacks>) -> Result<(), CaError>;

    /// Begin an asynchronous connect for a named channel.
    fn create_channel(
        &self,
        name: &str,
        priority: Priority,
        token: RefToken,
    ) -> Result<ChannelId, CaError>;

    /// Release a channel. Outstanding callbacks for it may still arrive.
    fn clear_channel(&self, id: ChannelId) -> Result<(), CaError>;

    /// One-shot read with the given decorated type code.
    fn read(&self, id: ChannelId, dbr_code: i32, count: u32, token: RefToken)
        -> Result<(), CaError>;

    /// One-shot write; `notify` requests an acknowledgement callback.
    fn write(
        &self,
        id: ChannelId,
        dbr_code: i32,
        count: u32,
        value: &DbrValue,
        notify: bool,
        token: RefToken,
    ) -> Result<(), CaError>;

    /// Begin a continuous subscription with the given decorated type code.
    fn subscribe(
        &self,
        id: ChannelId,
        dbr_code: i32,
        count: u32,
        token: RefToken,
    ) -> Result<SubscriptionId, CaError>;

    fn unsubscribe(&self, id: SubscriptionId) -> Result<(), CaError>;
}

/// One initialized client library instance plus the locks that guard it
pub struct CaContext {
    client: Arc<dyn CaClient>,
    callbacks: Arc<EngineCallbacks>,
    /// Serializes all calls into the client library
    guard: Mutex<()>,
    /// Recorded outcome of the first establish attempt
    established: Mutex<Option<CaStatus>>,
}

impl CaContext {
    pub fn new(client: Arc<dyn CaClient>, pool: Arc<RefPool>) -> Arc<Self> {
        Arc::new(CaContext {
            client,
            callbacks: Arc::new(EngineCallbacks::new(pool)),
            guard: Mutex::new(()),
            established: Mutex::new(None),
        })
    }

    /// Initialize the underlying context, once.
    ///
    /// The first call performs the initialization and installs the exception
    /// notification path; every later call reports the recorded outcome
    /// without touching the library again.
    pub fn establish(&self) -> CaStatus {
        let mut established = self.established.lock();
        if let Some(status) = *established {
            return status;
        }
        let status = {
            let _guard = self.guard.lock();
            match self.client.context_create(self.callbacks.clone()) {
                Ok(()) => {
                    debug!("client context established");
                    CaStatus::Successful
                }
                Err(e) => {
                    warn!("client context creation failed: {e}");
                    CaStatus::Failed
                }
            }
        };
        *established = Some(status);
        status
    }

    pub fn is_established(&self) -> bool {
        matches!(*self.established.lock(), Some(CaStatus::Successful))
    }

    /// The callback entry points the transport should invoke. Exposed so that
    /// in-process transports (and tests) can reach them without holding on to
    /// the `Arc` passed at context creation.
    pub fn callbacks(&self) -> Arc<EngineCallbacks> {
        self.callbacks.clone()
    }

    pub fn pool(&self) -> Arc<RefPool> {
        self.callbacks.pool().clone()
    }

    pub(crate) fn client(&self) -> &Arc<dyn CaClient> {
        &self.client
    }

    /// Take the coarse client-library lock.
    pub(crate) fn lock(&self) -> MutexGuard<'_, ()> {
        self.guard.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingClient {
        creates: AtomicUsize,
        fail: bool,
    }

    impl CaClient for CountingClient {
        fn context_create(&self, _callbacks: Arc<EngineCallbacks>) -> Result<(), CaError> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(CaError::Rejected("no resources".into()))
            } else {
                Ok(())
            }
        }
        fn create_channel(
            &self,
            _name: &str,
            _priority: Priority,
            _token: RefToken,
        ) -> Result<ChannelId, CaError> {
            Err(CaError::NoContext)
        }
        fn clear_channel(&self, _id: ChannelId) -> Result<(), CaError> {
            Ok(())
        }
        fn read(
            &self,
            _id: ChannelId,
            _dbr_code: i32,
            _count: u32,
            _token: RefToken,
        ) -> Result<(), CaError> {
            Err(CaError::NoContext)
        }
        fn write(
            &self,
            _id: ChannelId,
            _dbr_code: i32,
            _count: u32,
            _value: &DbrValue,
            _notify: bool,
            _token: RefToken,
        ) -> Result<(), CaError> {
            Err(CaError::NoContext)
        }
        fn subscribe(
            &self,
            _id: ChannelId,
            _dbr_code: i32,
            _count: u32,
            _token: RefToken,
        ) -> Result<SubscriptionId, CaError> {
            Err(CaError::NoContext)
        }
        fn unsubscribe(&self, _id: SubscriptionId) -> Result<(), CaError> {
            Ok(())
        }
    }

    #[test]
    fn establish_is_once_and_recorded() {
        let client = Arc::new(CountingClient {
            creates: AtomicUsize::new(0),
            fail: false,
        });
        let pool = Arc::new(RefPool::with_grace(Duration::from_secs(1)));
        let context = CaContext::new(client.clone(), pool);
        assert_eq!(context.establish(), CaStatus::Successful);
        assert_eq!(context.establish(), CaStatus::Successful);
        assert_eq!(client.creates.load(Ordering::SeqCst), 1);
        assert!(context.is_established());
    }

    #[test]
    fn establish_failure_is_recorded_not_retried() {
        let client = Arc::new(CountingClient {
            creates: AtomicUsize::new(0),
            fail: true,
        });
        let pool = Arc::new(RefPool::with_grace(Duration::from_secs(1)));
        let context = CaContext::new(client.clone(), pool);
        assert_eq!(context.establish(), CaStatus::Failed);
        assert_eq!(context.establish(), CaStatus::Failed);
        assert_eq!(client.creates.load(Ordering::SeqCst), 1);
        assert!(!context.is_established());
    }
}
