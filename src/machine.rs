//! Request/confirm state machines for one consumer object.
//!
//! Four small, independent machines track what has been requested against what
//! the channel has confirmed: connection, subscription, one-shot read, and
//! write. Their job is to stop a consumer from issuing a second overlapping
//! request and to distinguish "expired" (a connection that dropped mid-life)
//! from "never connected".
//!
//! Each machine has a single transition entry point, [`process`], which
//! validates the requested transition against a small per-machine table and
//! rejects illegal ones without side effects. The tables are kept separate per
//! concern rather than folded into one generic machine so each stays small
//! enough to audit at a glance.
//!
//! [`process`]: ConnectionMachine::process

use parking_lot::Mutex;
use thiserror::Error;

/// A transition that is not legal from the machine's current state
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal transition {from} -> {to}")]
pub struct TransitionError {
    pub from: &'static str,
    pub to: &'static str,
}

#[derive(Debug, Default)]
struct Flags<S> {
    state: S,
    pending: bool,
    active: bool,
    expired: bool,
}

/// Connection lifecycle of the channel itself
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ConnectState {
    #[default]
    Disconnected,
    Connected,
    ConnectFail,
    /// Was connected, then the link dropped; distinct from never-connected
    ConnectionExpired,
}

impl ConnectState {
    fn name(self) -> &'static str {
        match self {
            ConnectState::Disconnected => "Disconnected",
            ConnectState::Connected => "Connected",
            ConnectState::ConnectFail => "ConnectFail",
            ConnectState::ConnectionExpired => "ConnectionExpired",
        }
    }
}

#[derive(Debug, Default)]
pub struct ConnectionMachine {
    inner: Mutex<Flags<ConnectState>>,
}

impl ConnectionMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a confirmed transition, or reject it leaving the state unchanged.
    pub fn process(&self, to: ConnectState) -> Result<(), TransitionError> {
        let mut inner = self.inner.lock();
        let legal = matches!(
            (inner.state, to),
            (ConnectState::Disconnected, ConnectState::Connected)
                | (ConnectState::Disconnected, ConnectState::ConnectFail)
                | (ConnectState::Connected, ConnectState::Disconnected)
                | (ConnectState::Connected, ConnectState::ConnectionExpired)
                | (ConnectState::ConnectFail, ConnectState::Connected)
                | (ConnectState::ConnectFail, ConnectState::Disconnected)
                | (ConnectState::ConnectionExpired, ConnectState::Connected)
                | (ConnectState::ConnectionExpired, ConnectState::Disconnected)
        );
        if !legal {
            return Err(TransitionError {
                from: inner.state.name(),
                to: to.name(),
            });
        }
        inner.state = to;
        match to {
            ConnectState::Connected => {
                inner.pending = false;
                inner.active = true;
                inner.expired = false;
            }
            ConnectState::ConnectFail => {
                inner.pending = false;
                inner.active = false;
            }
            ConnectState::ConnectionExpired => {
                inner.active = false;
                inner.expired = true;
            }
            ConnectState::Disconnected => {
                inner.pending = false;
                inner.active = false;
                inner.expired = false;
            }
        }
        Ok(())
    }

    /// Mark that a connect request has been submitted but not yet confirmed.
    pub fn set_pending(&self, pending: bool) {
        self.inner.lock().pending = pending;
    }

    pub fn state(&self) -> ConnectState {
        self.inner.lock().state
    }
    pub fn is_pending(&self) -> bool {
        self.inner.lock().pending
    }
    pub fn is_active(&self) -> bool {
        self.inner.lock().active
    }
    pub fn is_expired(&self) -> bool {
        self.inner.lock().expired
    }
}

/// Subscription lifecycle: request, initial extended read, streamed updates
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum SubscribeState {
    #[default]
    Unsubscribed,
    /// Subscribe submitted; awaiting the initial extended read
    Subscribed,
    /// Initial extended read delivered; awaiting the first streamed update
    SubscribedRead,
    SubscribeSuccess,
    SubscribeFail,
}

impl SubscribeState {
    fn name(self) -> &'static str {
        match self {
            SubscribeState::Unsubscribed => "Unsubscribed",
            SubscribeState::Subscribed => "Subscribed",
            SubscribeState::SubscribedRead => "SubscribedRead",
            SubscribeState::SubscribeSuccess => "SubscribeSuccess",
            SubscribeState::SubscribeFail => "SubscribeFail",
        }
    }
}

#[derive(Debug, Default)]
pub struct SubscriptionMachine {
    inner: Mutex<Flags<SubscribeState>>,
}

impl SubscriptionMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process(&self, to: SubscribeState) -> Result<(), TransitionError> {
        let mut inner = self.inner.lock();
        let legal = matches!(
            (inner.state, to),
            (SubscribeState::Unsubscribed, SubscribeState::Subscribed)
                | (SubscribeState::Subscribed, SubscribeState::SubscribedRead)
                | (SubscribeState::Subscribed, SubscribeState::SubscribeFail)
                | (SubscribeState::Subscribed, SubscribeState::Unsubscribed)
                | (SubscribeState::SubscribedRead, SubscribeState::SubscribeSuccess)
                | (SubscribeState::SubscribedRead, SubscribeState::SubscribeFail)
                | (SubscribeState::SubscribedRead, SubscribeState::Unsubscribed)
                | (SubscribeState::SubscribeSuccess, SubscribeState::Unsubscribed)
                | (SubscribeState::SubscribeSuccess, SubscribeState::SubscribeFail)
                | (SubscribeState::SubscribeFail, SubscribeState::Subscribed)
                | (SubscribeState::SubscribeFail, SubscribeState::Unsubscribed)
        );
        if !legal {
            return Err(TransitionError {
                from: inner.state.name(),
                to: to.name(),
            });
        }
        inner.state = to;
        match to {
            SubscribeState::Subscribed => inner.pending = true,
            SubscribeState::SubscribedRead => {}
            SubscribeState::SubscribeSuccess => {
                inner.pending = false;
                inner.active = true;
            }
            SubscribeState::SubscribeFail => {
                inner.pending = false;
                inner.active = false;
            }
            SubscribeState::Unsubscribed => {
                inner.pending = false;
                inner.active = false;
                inner.expired = false;
            }
        }
        Ok(())
    }

    pub fn state(&self) -> SubscribeState {
        self.inner.lock().state
    }
    pub fn is_pending(&self) -> bool {
        self.inner.lock().pending
    }
    pub fn is_active(&self) -> bool {
        self.inner.lock().active
    }
}

/// One-shot read lifecycle
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ReadState {
    #[default]
    Idle,
    Reading,
    ReadingFail,
}

impl ReadState {
    fn name(self) -> &'static str {
        match self {
            ReadState::Idle => "Idle",
            ReadState::Reading => "Reading",
            ReadState::ReadingFail => "ReadingFail",
        }
    }
}

#[derive(Debug, Default)]
pub struct ReadMachine {
    inner: Mutex<Flags<ReadState>>,
}

impl ReadMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process(&self, to: ReadState) -> Result<(), TransitionError> {
        let mut inner = self.inner.lock();
        let legal = matches!(
            (inner.state, to),
            (ReadState::Idle, ReadState::Reading)
                | (ReadState::Reading, ReadState::Idle)
                | (ReadState::Reading, ReadState::ReadingFail)
                | (ReadState::ReadingFail, ReadState::Reading)
                | (ReadState::ReadingFail, ReadState::Idle)
        );
        if !legal {
            return Err(TransitionError {
                from: inner.state.name(),
                to: to.name(),
            });
        }
        inner.state = to;
        inner.pending = matches!(to, ReadState::Reading);
        Ok(())
    }

    pub fn state(&self) -> ReadState {
        self.inner.lock().state
    }
    pub fn is_pending(&self) -> bool {
        self.inner.lock().pending
    }
}

/// Write lifecycle, including the acknowledged variant
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum WriteState {
    #[default]
    Idle,
    Writing,
    WritingFail,
}

impl WriteState {
    fn name(self) -> &'static str {
        match self {
            WriteState::Idle => "Idle",
            WriteState::Writing => "Writing",
            WriteState::WritingFail => "WritingFail",
        }
    }
}

#[derive(Debug, Default)]
pub struct WriteMachine {
    inner: Mutex<Flags<WriteState>>,
}

impl WriteMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process(&self, to: WriteState) -> Result<(), TransitionError> {
        let mut inner = self.inner.lock();
        let legal = matches!(
            (inner.state, to),
            (WriteState::Idle, WriteState::Writing)
                | (WriteState::Writing, WriteState::Idle)
                | (WriteState::Writing, WriteState::WritingFail)
                | (WriteState::WritingFail, WriteState::Writing)
                | (WriteState::WritingFail, WriteState::Idle)
        );
        if !legal {
            return Err(TransitionError {
                from: inner.state.name(),
                to: to.name(),
            });
        }
        inner.state = to;
        inner.pending = matches!(to, WriteState::Writing);
        Ok(())
    }

    pub fn state(&self) -> WriteState {
        self.inner.lock().state
    }
    pub fn is_pending(&self) -> bool {
        self.inner.lock().pending
    }
}
