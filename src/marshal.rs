//! Marshalling of client-library callbacks onto the owning thread.
//!
//! Callbacks arrive on threads the library owns. Nothing in them may touch
//! consumer state directly; instead they are translated into plain-data
//! [`QueuedNotification`]s and pushed onto an unbounded channel. The thread
//! that owns the consumer objects drains that channel through its
//! [`EventContext`], which resolves each notification's token to a live
//! target and invokes it, or drops the notification when the target has gone
//! away in the meantime.
//!
//! Every notification carries a validity gate, an atomic flag cloned from its
//! target. A target flips its gate off as the first step of tearing itself
//! down, so notifications already sitting in the queue at that moment become
//! inert before they are ever looked at.

use crate::client::{ChannelId, ChannelInfo, ConnectionEvent, DataEvent, DataEventKind, ExceptionEvent};
use crate::dbr::Dbr;
use crate::safe_ref::{RefPool, RefToken};
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// What a queued notification reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    ConnectionUp,
    ConnectionDown,
    ReadComplete,
    ReadFailed,
    WriteComplete,
    WriteFailed,
    SubscriptionUpdate,
    SubscriptionFailed,
    Exception,
}

/// Data attached to a notification, already detached from library storage
#[derive(Debug)]
pub enum NotifyPayload {
    None,
    Channel(ChannelInfo),
    Data(Box<Dbr>),
    Message(String),
}

/// One callback, reduced to owned data and ready to cross threads
pub struct QueuedNotification {
    pub target: RefToken,
    pub channel: ChannelId,
    pub reason: Reason,
    pub payload: NotifyPayload,
    /// Cleared by the target when it starts tearing down
    gate: Arc<AtomicBool>,
}

impl QueuedNotification {
    pub fn live(&self) -> bool {
        self.gate.load(Ordering::Acquire)
    }
}

/// The capability a resolved token grants: enqueue notifications, nothing
/// else. Foreign threads never hold a reference to the target itself.
#[derive(Clone)]
pub struct Poster {
    tx: Sender<QueuedNotification>,
    gate: Arc<AtomicBool>,
}

impl Poster {
    pub fn new(tx: Sender<QueuedNotification>, gate: Arc<AtomicBool>) -> Poster {
        Poster { tx, gate }
    }

    pub fn post(&self, target: RefToken, channel: ChannelId, reason: Reason, payload: NotifyPayload) {
        let note = QueuedNotification {
            target,
            channel,
            reason,
            payload,
            gate: self.gate.clone(),
        };
        // The receiver lives as long as the owning thread's context; a send
        // failure means the whole context was torn down, and the notification
        // has nowhere to go anyway.
        if self.tx.send(note).is_err() {
            debug!("notification dropped, owning context is gone");
        }
    }
}

/// Implemented by owner-thread objects that consume marshalled notifications
pub trait Notifiable {
    fn notify(&mut self, note: QueuedNotification);

    /// Work queued by [`notify`] that must run while the target is not
    /// borrowed, so consumer code called from it can reach back into the
    /// target. Drained repeatedly after each delivery until it returns None.
    ///
    /// [`notify`]: Notifiable::notify
    fn next_callback(&mut self) -> Option<Box<dyn FnOnce()>> {
        None
    }
}

type Target = Rc<RefCell<dyn Notifiable>>;

struct ContextInner {
    targets: HashMap<RefToken, Target>,
    /// How many consumers have installed themselves; the context outlives
    /// them all and is reusable once the count returns to zero.
    installs: usize,
}

/// Owner-thread side of the marshalling queue.
///
/// Deliberately `!Send`: targets are `Rc` and only the thread that created
/// the context may register targets or drain the queue.
pub struct EventContext {
    tx: Sender<QueuedNotification>,
    rx: Receiver<QueuedNotification>,
    inner: RefCell<ContextInner>,
    pool: Arc<RefPool>,
}

impl EventContext {
    pub fn new(pool: Arc<RefPool>) -> EventContext {
        let (tx, rx) = crossbeam_channel::unbounded();
        EventContext {
            tx,
            rx,
            inner: RefCell::new(ContextInner {
                targets: HashMap::new(),
                installs: 0,
            }),
            pool,
        }
    }

    pub fn pool(&self) -> &Arc<RefPool> {
        &self.pool
    }

    pub fn sender(&self) -> Sender<QueuedNotification> {
        self.tx.clone()
    }

    /// Register a consumer under its token. Returns the install count so the
    /// caller can tell whether it was the first.
    pub fn install(&self, token: RefToken, target: Target) -> usize {
        let mut inner = self.inner.borrow_mut();
        inner.targets.insert(token, target);
        inner.installs += 1;
        trace!(slot = token.index(), installs = inner.installs, "target installed");
        inner.installs
    }

    /// Remove a consumer. Notifications for it still in the queue resolve to
    /// nothing and are dropped on delivery.
    pub fn remove(&self, token: RefToken) {
        let mut inner = self.inner.borrow_mut();
        if inner.targets.remove(&token).is_some() {
            inner.installs = inner.installs.saturating_sub(1);
            trace!(slot = token.index(), installs = inner.installs, "target removed");
        }
    }

    pub fn installed(&self) -> usize {
        self.inner.borrow().installs
    }

    /// Drain everything currently queued. Returns how many notifications were
    /// actually delivered (gated or orphaned ones count as processed but not
    /// delivered).
    pub fn process_pending(&self) -> usize {
        let mut delivered = 0;
        loop {
            match self.rx.try_recv() {
                Ok(note) => {
                    if self.deliver(note) {
                        delivered += 1;
                    }
                }
                Err(TryRecvError::Empty) => return delivered,
                Err(TryRecvError::Disconnected) => {
                    warn!("notification queue disconnected");
                    return delivered;
                }
            }
        }
    }

    /// Deliver at most one queued notification
    pub fn process_one(&self) -> bool {
        match self.rx.try_recv() {
            Ok(note) => self.deliver(note),
            Err(_) => false,
        }
    }

    fn deliver(&self, note: QueuedNotification) -> bool {
        if !note.live() {
            trace!(slot = note.target.index(), "gated notification dropped");
            return false;
        }
        // Holding no borrow of the registry while the target runs: the
        // target may install or remove other consumers from inside notify.
        let target = self.inner.borrow().targets.get(&note.target).cloned();
        match target {
            Some(target) => {
                target.borrow_mut().notify(note);
                loop {
                    let callback = target.borrow_mut().next_callback();
                    match callback {
                        Some(callback) => callback(),
                        None => break,
                    }
                }
                true
            }
            None => {
                debug!(slot = note.target.index(), reason = ?note.reason, "no target for notification");
                false
            }
        }
    }
}

/// Callbacks handed to the client library at context creation. These run on
/// library threads and only translate, resolve and post.
pub struct EngineCallbacks {
    pool: Arc<RefPool>,
}

impl EngineCallbacks {
    pub fn new(pool: Arc<RefPool>) -> EngineCallbacks {
        EngineCallbacks { pool }
    }

    pub fn pool(&self) -> &Arc<RefPool> {
        &self.pool
    }

    pub fn connection(&self, ev: ConnectionEvent) {
        let reason = if ev.up {
            Reason::ConnectionUp
        } else {
            Reason::ConnectionDown
        };
        let payload = match ev.info {
            Some(info) => NotifyPayload::Channel(info),
            None => NotifyPayload::None,
        };
        match self.pool.resolve(ev.token, ev.channel, false) {
            Ok(poster) => poster.post(ev.token, ev.channel, reason, payload),
            Err(err) => debug!(slot = ev.token.index(), %err, "connection callback dropped"),
        }
    }

    pub fn event(&self, ev: DataEvent) {
        let reason = match (ev.kind, ev.ok) {
            (DataEventKind::ReadResponse, true) => Reason::ReadComplete,
            (DataEventKind::ReadResponse, false) => Reason::ReadFailed,
            (DataEventKind::SubscriptionUpdate, true) => Reason::SubscriptionUpdate,
            (DataEventKind::SubscriptionUpdate, false) => Reason::SubscriptionFailed,
            (DataEventKind::WriteAck, true) => Reason::WriteComplete,
            (DataEventKind::WriteAck, false) => Reason::WriteFailed,
        };
        let payload = match ev.dbr {
            Some(dbr) => NotifyPayload::Data(Box::new(dbr)),
            None => NotifyPayload::None,
        };
        match self.pool.resolve(ev.token, ev.channel, false) {
            Ok(poster) => poster.post(ev.token, ev.channel, reason, payload),
            Err(err) => debug!(slot = ev.token.index(), %err, "data callback dropped"),
        }
    }

    /// Context-wide exceptions may arrive with no channel attached
    pub fn exception(&self, ev: ExceptionEvent) {
        match self.pool.resolve(ev.token, ev.channel, true) {
            Ok(poster) => poster.post(
                ev.token,
                ev.channel,
                Reason::Exception,
                NotifyPayload::Message(ev.message),
            ),
            Err(err) => debug!(slot = ev.token.index(), %err, "exception callback dropped"),
        }
    }
}
