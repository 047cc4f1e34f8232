//! Connection and callback-marshalling engine for EPICS-style process
//! variables.
//!
//! The wire transport is an external collaborator reached through the
//! [`CaClient`] trait: a C-style asynchronous client API that invokes
//! callbacks on threads of its own choosing. This crate provides everything
//! between that API and single-threaded consumer code:
//!
//! - [`Pv`] — the consumer object: connect, subscribe, read, write, with a
//!   handler closure invoked on the owning thread after every notification;
//! - [`Record`] — the latest known metadata for a channel, with the
//!   protocol's sticky precision/units correction applied on update;
//! - [`RefPool`] — recyclable handles that make it safe to pass an opaque
//!   reference into callbacks that may fire arbitrarily late;
//! - [`EventContext`] — the per-thread queue that turns foreign-thread
//!   callbacks into ordered, gated notifications drained by their owner;
//! - the `machine` state machines that keep requests from overlapping.
//!
//! ```no_run
//! use std::rc::Rc;
//! use std::sync::Arc;
//! use cabridge::{CaContext, EventContext, Priority, Pv, RefPool};
//! # fn transport() -> Arc<dyn cabridge::CaClient> { unimplemented!() }
//!
//! let pool = Arc::new(RefPool::with_grace(std::time::Duration::from_secs(60)));
//! let events = Rc::new(EventContext::new(pool.clone()));
//! let ca = CaContext::new(transport(), pool);
//!
//! let pv = Pv::new(&events, ca, "SR:CURRENT");
//! pv.set_handler(|update| println!("{:?}", update.kind));
//! pv.connect(Priority::Default);
//! // ... in the owning thread's loop:
//! events.process_pending();
//! ```

pub mod client;
pub mod connection;
pub mod dbr;
pub mod machine;
pub mod marshal;
pub mod pv;
pub mod record;
pub mod safe_ref;

pub use client::{
    CaClient, CaContext, CaError, CaStatus, ChannelId, ChannelInfo, ConnectionEvent, DataEvent,
    DataEventKind, ExceptionEvent, Priority, SubscriptionId,
};
pub use connection::{ChannelConnection, ChannelState, LinkState};
pub use dbr::{CtrlMeta, Dbr, DbrBasicType, DbrCategory, DbrType, DbrValue, Status, TimeStamp};
pub use machine::{ConnectState, ReadState, SubscribeState, WriteState};
pub use marshal::{EventContext, Notifiable, NotifyPayload, Poster, QueuedNotification, Reason};
pub use pv::{Pv, Update, UpdateKind};
pub use record::{ProcessState, Record};
pub use safe_ref::{RefPool, RefToken, ResolveError};
