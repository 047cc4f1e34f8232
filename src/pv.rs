//! The consumer-side process variable object.
//!
//! A [`Pv`] is what application code holds for one named remote value. It owns
//! a [`ChannelConnection`], a [`Record`] of the latest metadata, and the four
//! request/confirm state machines, and it receives every marshalled
//! notification on the thread that created it. Application code attaches a
//! handler closure and is called with an [`Update`] after each delivered
//! notification, always on the owning thread.
//!
//! Construction wires the cross-thread path: a handle is acquired from the
//! pool, a [`Poster`] built over the owning context's queue is stored in it,
//! and the inner core is registered with the context under the same token.
//! Dropping the [`Pv`] unwinds this in the reverse order that makes late
//! callbacks harmless: the validity gate goes dark first, then the handle is
//! discarded, then the channel is released, then the core is deregistered.

use crate::client::{CaContext, CaStatus, Priority};
use crate::connection::{ChannelConnection, ChannelState, LinkState};
use crate::dbr::{DbrCategory, DbrValue};
use crate::machine::{
    ConnectState, ConnectionMachine, ReadMachine, ReadState, SubscribeState, SubscriptionMachine,
    WriteMachine, WriteState,
};
use crate::marshal::{EventContext, Notifiable, NotifyPayload, Poster, QueuedNotification, Reason};
use crate::record::Record;
use crate::safe_ref::RefToken;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// What a delivered notification meant for the consumer
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UpdateKind {
    Connected,
    Disconnected,
    Value,
    ReadFailed,
    WriteComplete,
    WriteFailed,
    SubscriptionFailed,
    Exception,
}

/// Snapshot handed to the consumer handler. Owned, so the handler runs with
/// no borrow of the originating object held and may call back into it.
pub struct Update {
    pub kind: UpdateKind,
    pub record: Record,
    pub value: Option<DbrValue>,
    pub message: Option<String>,
}

type Handler = Box<dyn FnMut(Update)>;
type HandlerSlot = Rc<RefCell<Option<Handler>>>;

pub struct PvCore {
    connection: ChannelConnection,
    record: Record,
    connect: ConnectionMachine,
    subscription: SubscriptionMachine,
    read: ReadMachine,
    write: WriteMachine,
    last_value: Option<DbrValue>,
    /// Shared with the owning [`Pv`]; taken out of the slot only for the
    /// duration of each call.
    handler: HandlerSlot,
    /// Updates queued during [`Notifiable::notify`], handed out afterwards
    /// through [`Notifiable::next_callback`] so the handler runs unborrowed.
    pending: VecDeque<Update>,
}

impl PvCore {
    fn emit(&mut self, kind: UpdateKind, message: Option<&str>) {
        if self.handler.borrow().is_none() {
            return;
        }
        self.pending.push_back(Update {
            kind,
            record: self.record.clone(),
            value: self.last_value.clone(),
            message: message.map(str::to_string),
        });
    }

    fn on_connection_up(&mut self, note: &QueuedNotification) {
        if let NotifyPayload::Channel(info) = &note.payload {
            self.connection.note_connected(info);
            self.record.set_dbr_type(info.native_type);
        }
        // A reconnect after an expiry must not keep metadata from the old
        // incarnation of the channel.
        if self.connect.state() == ConnectState::ConnectionExpired {
            let basic = self.record.basic_type();
            self.record.reset();
            self.record.set_dbr_type(basic);
            self.last_value = None;
        }
        if let Err(e) = self.connect.process(ConnectState::Connected) {
            debug!(name = %self.record.name(), "{e}");
            return;
        }
        self.emit(UpdateKind::Connected, None);
    }

    fn on_connection_down(&mut self) {
        self.connection.note_disconnected();
        self.record.set_valid(false);
        // The transport subscription died with the link; unwind the machine so
        // the consumer can re-establish after a reconnect.
        if self.subscription.state() != SubscribeState::Unsubscribed {
            if let Err(e) = self.subscription.process(SubscribeState::Unsubscribed) {
                debug!(name = %self.record.name(), "{e}");
            }
        }
        let to = if self.connect.is_active() {
            ConnectState::ConnectionExpired
        } else {
            ConnectState::ConnectFail
        };
        if let Err(e) = self.connect.process(to) {
            debug!(name = %self.record.name(), "{e}");
            return;
        }
        self.emit(UpdateKind::Disconnected, None);
    }

    fn on_read_complete(&mut self, note: QueuedNotification) {
        if let NotifyPayload::Data(dbr) = note.payload {
            self.record.apply(&dbr);
            self.last_value = Some(dbr.take_value());
        }
        // The metadata-rich read that opens a subscription completes the
        // Subscribed leg; a plain one-shot read completes the read machine.
        if self.subscription.state() == SubscribeState::Subscribed {
            if let Err(e) = self.subscription.process(SubscribeState::SubscribedRead) {
                debug!(name = %self.record.name(), "{e}");
            }
        } else if let Err(e) = self.read.process(ReadState::Idle) {
            debug!(name = %self.record.name(), "{e}");
        }
        self.emit(UpdateKind::Value, None);
    }

    fn on_read_failed(&mut self) {
        if self.subscription.state() == SubscribeState::Subscribed {
            if let Err(e) = self.subscription.process(SubscribeState::SubscribeFail) {
                debug!(name = %self.record.name(), "{e}");
            }
            self.emit(UpdateKind::SubscriptionFailed, None);
            return;
        }
        if let Err(e) = self.read.process(ReadState::ReadingFail) {
            debug!(name = %self.record.name(), "{e}");
        }
        self.emit(UpdateKind::ReadFailed, None);
    }

    fn on_subscription_update(&mut self, note: QueuedNotification) {
        if let NotifyPayload::Data(dbr) = note.payload {
            self.record.apply(&dbr);
            self.last_value = Some(dbr.take_value());
        }
        if self.subscription.state() == SubscribeState::SubscribedRead {
            if let Err(e) = self.subscription.process(SubscribeState::SubscribeSuccess) {
                debug!(name = %self.record.name(), "{e}");
            }
        }
        self.emit(UpdateKind::Value, None);
    }

    fn on_subscription_failed(&mut self) {
        if let Err(e) = self.subscription.process(SubscribeState::SubscribeFail) {
            debug!(name = %self.record.name(), "{e}");
        }
        self.emit(UpdateKind::SubscriptionFailed, None);
    }

    fn on_write_result(&mut self, ok: bool) {
        let to = if ok { WriteState::Idle } else { WriteState::WritingFail };
        if let Err(e) = self.write.process(to) {
            debug!(name = %self.record.name(), "{e}");
            return;
        }
        self.emit(
            if ok { UpdateKind::WriteComplete } else { UpdateKind::WriteFailed },
            None,
        );
    }

    fn on_exception(&mut self, note: QueuedNotification) {
        let message = match note.payload {
            NotifyPayload::Message(ref m) => m.clone(),
            _ => String::new(),
        };
        warn!(name = %self.record.name(), channel = note.channel, "exception: {message}");
        self.emit(UpdateKind::Exception, Some(&message));
    }
}

impl Notifiable for PvCore {
    fn notify(&mut self, note: QueuedNotification) {
        trace!(name = %self.record.name(), reason = ?note.reason, "notification delivered");
        match note.reason {
            Reason::ConnectionUp => self.on_connection_up(&note),
            Reason::ConnectionDown => self.on_connection_down(),
            Reason::ReadComplete => self.on_read_complete(note),
            Reason::ReadFailed => self.on_read_failed(),
            Reason::SubscriptionUpdate => self.on_subscription_update(note),
            Reason::SubscriptionFailed => self.on_subscription_failed(),
            Reason::WriteComplete => self.on_write_result(true),
            Reason::WriteFailed => self.on_write_result(false),
            Reason::Exception => self.on_exception(note),
        }
    }

    fn next_callback(&mut self) -> Option<Box<dyn FnOnce()>> {
        let update = self.pending.pop_front()?;
        let slot = self.handler.clone();
        Some(Box::new(move || {
            let handler = slot.borrow_mut().take();
            let Some(mut handler) = handler else {
                return;
            };
            handler(update);
            // Restore unless the handler installed a replacement for itself
            let mut current = slot.borrow_mut();
            if current.is_none() {
                *current = Some(handler);
            }
        }))
    }
}

/// Handle to one process variable, owned by the thread that created it
pub struct Pv {
    core: Rc<RefCell<PvCore>>,
    events: Rc<EventContext>,
    token: RefToken,
    gate: Arc<AtomicBool>,
    handler: HandlerSlot,
}

impl Pv {
    /// Wire up a new consumer for `name` on the calling thread. The channel
    /// is not contacted until [`connect`] is called.
    ///
    /// [`connect`]: Pv::connect
    pub fn new(events: &Rc<EventContext>, ca: Arc<CaContext>, name: &str) -> Pv {
        let gate = Arc::new(AtomicBool::new(true));
        let poster = Poster::new(events.sender(), gate.clone());
        let token = events.pool().acquire(poster);
        let handler: HandlerSlot = Rc::new(RefCell::new(None));
        let core = Rc::new(RefCell::new(PvCore {
            connection: ChannelConnection::new(ca, token),
            record: Record::new(name),
            connect: ConnectionMachine::new(),
            subscription: SubscriptionMachine::new(),
            read: ReadMachine::new(),
            write: WriteMachine::new(),
            last_value: None,
            handler: handler.clone(),
            pending: VecDeque::new(),
        }));
        events.install(token, core.clone());
        Pv {
            core,
            events: events.clone(),
            token,
            gate,
            handler,
        }
    }

    /// Install the closure called after every delivered notification. May be
    /// called from inside a running handler to replace it.
    pub fn set_handler(&self, handler: impl FnMut(Update) + 'static) {
        *self.handler.borrow_mut() = Some(Box::new(handler));
    }

    /// Initialize the transport context and submit the channel connect.
    pub fn connect(&self, priority: Priority) -> CaStatus {
        let mut core = self.core.borrow_mut();
        let status = core.connection.establish_context();
        if status != CaStatus::Successful {
            return status;
        }
        let name = core.record.name().to_string();
        let status = core.connection.establish_channel(&name, priority);
        if status == CaStatus::Successful {
            core.connect.set_pending(true);
        }
        status
    }

    /// Submit the initial metadata-rich read plus the standing subscription.
    /// Requires a confirmed connection; the type codes come from the channel's
    /// host-reported native type.
    pub fn subscribe(&self) -> CaStatus {
        let mut core = self.core.borrow_mut();
        if core.subscription.process(SubscribeState::Subscribed).is_err() {
            debug!(name = %core.record.name(), "subscription already in progress");
            return CaStatus::Failed;
        }
        let initial = core.record.dbr_type(DbrCategory::Control);
        let update = core.record.dbr_type(DbrCategory::Time);
        let status = core.connection.establish_subscription(initial, update);
        if status != CaStatus::Successful {
            if let Err(e) = core.subscription.process(SubscribeState::SubscribeFail) {
                debug!(name = %core.record.name(), "{e}");
            }
        }
        status
    }

    /// Submit a one-shot read with full control metadata.
    pub fn read(&self) -> CaStatus {
        let mut core = self.core.borrow_mut();
        if core.read.process(ReadState::Reading).is_err() {
            debug!(name = %core.record.name(), "read already in progress");
            return CaStatus::Failed;
        }
        let code = core.record.dbr_type(DbrCategory::Control);
        let status = core.connection.read_channel(code);
        if status != CaStatus::Successful {
            if let Err(e) = core.read.process(ReadState::ReadingFail) {
                debug!(name = %core.record.name(), "{e}");
            }
        }
        status
    }

    /// Submit a write of `value` in the channel's native basic type.
    pub fn write(&self, value: &DbrValue) -> CaStatus {
        let mut core = self.core.borrow_mut();
        if core.write.process(WriteState::Writing).is_err() {
            debug!(name = %core.record.name(), "write already in progress");
            return CaStatus::Failed;
        }
        let code = core.record.dbr_type(DbrCategory::Basic);
        let count = value.get_count() as u32;
        let status = core.connection.write_channel(code, count, value);
        if status != CaStatus::Successful {
            if let Err(e) = core.write.process(WriteState::WritingFail) {
                debug!(name = %core.record.name(), "{e}");
            }
        } else if !core.connection.write_access() {
            debug!(name = %core.record.name(), "write submitted without write access");
        }
        status
    }

    pub fn set_requested_count(&self, count: u32) {
        self.core.borrow_mut().connection.set_requested_count(count);
    }

    pub fn set_write_with_ack(&self, ack: bool) {
        self.core.borrow_mut().connection.set_write_with_ack(ack);
    }

    /// Read-only access to the latest metadata snapshot.
    pub fn with_record<R>(&self, f: impl FnOnce(&Record) -> R) -> R {
        f(&self.core.borrow().record)
    }

    pub fn last_value(&self) -> Option<DbrValue> {
        self.core.borrow().last_value.clone()
    }

    pub fn link_state(&self) -> LinkState {
        self.core.borrow().connection.link_state()
    }

    pub fn channel_state(&self) -> ChannelState {
        self.core.borrow().connection.channel_state()
    }

    pub fn connect_state(&self) -> ConnectState {
        self.core.borrow().connect.state()
    }

    pub fn subscribe_state(&self) -> SubscribeState {
        self.core.borrow().subscription.state()
    }

    pub fn read_state(&self) -> ReadState {
        self.core.borrow().read.state()
    }

    pub fn write_state(&self) -> WriteState {
        self.core.borrow().write.state()
    }

    pub fn name(&self) -> String {
        self.core.borrow().record.name().to_string()
    }

    /// The handle this consumer passes to the transport in every request.
    pub fn token(&self) -> RefToken {
        self.token
    }
}

impl Drop for Pv {
    fn drop(&mut self) {
        // Gate first: anything already queued for this object becomes inert
        // before any other teardown step runs.
        self.gate.store(false, Ordering::Release);
        self.events.pool().discard(self.token);
        self.core.borrow_mut().connection.remove_channel();
        self.events.remove(self.token);
    }
}
