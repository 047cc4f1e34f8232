//! Per-channel ownership of the transport primitives.
//!
//! A [`ChannelConnection`] owns the context/channel/subscription handles for
//! one named process variable. All of its request methods are fire-and-forget:
//! they report whether the request was accepted for submission, and the real
//! outcome arrives later through the marshalled notification path. The
//! connection itself lives on the consumer's thread; every call into the
//! client library goes through the context's coarse lock.

use crate::client::{CaContext, CaStatus, ChannelId, ChannelInfo, Priority, SubscriptionId};
use crate::dbr::DbrValue;
use crate::safe_ref::RefToken;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Up/down state of the link to the host serving this channel
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum LinkState {
    Up,
    Down,
    #[default]
    Unknown,
}

/// Lifecycle state of the channel itself
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ChannelState {
    NeverConnected,
    PreviouslyConnected,
    Connected,
    Closed,
    #[default]
    Unknown,
}

/// The standing update request on a channel, at most one per connection
#[derive(Debug, Default)]
struct Subscription {
    id: SubscriptionId,
    activated: bool,
    /// How many times a subscription has been created over this channel's
    /// lifetime, for diagnostics across reconnect cycles
    creations: u32,
}

pub struct ChannelConnection {
    context: Arc<CaContext>,
    token: RefToken,
    name: String,
    channel: ChannelId,
    subscription: Subscription,
    link_state: LinkState,
    channel_state: ChannelState,
    /// Host-reported native type; -1 until the first connect
    channel_type: i32,
    /// Host-reported element count
    element_count: u32,
    /// Consumer-configured subscription width; 0 means all elements
    requested_count: u32,
    read_access: bool,
    write_access: bool,
    /// Ask the host to acknowledge completed writes
    write_with_ack: bool,
}

impl ChannelConnection {
    pub fn new(context: Arc<CaContext>, token: RefToken) -> ChannelConnection {
        ChannelConnection {
            context,
            token,
            name: String::new(),
            channel: 0,
            subscription: Subscription::default(),
            link_state: LinkState::Unknown,
            channel_state: ChannelState::Unknown,
            channel_type: -1,
            element_count: 0,
            requested_count: 0,
            read_access: false,
            write_access: false,
            write_with_ack: false,
        }
    }

    /// Initialize the transport context, once per context instance.
    pub fn establish_context(&self) -> CaStatus {
        self.context.establish()
    }

    /// Begin the asynchronous connect for `name`. Success here means only
    /// that the request was accepted; the connect outcome arrives through the
    /// connection notification.
    pub fn establish_channel(&mut self, name: &str, priority: Priority) -> CaStatus {
        if !self.context.is_established() {
            return CaStatus::Failed;
        }
        if self.channel != 0 {
            debug!(name, "channel already established");
            return CaStatus::Successful;
        }
        self.name = name.to_string();
        self.channel_state = ChannelState::NeverConnected;
        let result = {
            let _guard = self.context.lock();
            self.context.client().create_channel(name, priority, self.token)
        };
        match result {
            Ok(id) => {
                self.channel = id;
                let pool = self.context.pool();
                pool.bind_channel(self.token, id);
                pool.bind_name(self.token, name);
                trace!(name, channel = id, "channel create submitted");
                CaStatus::Successful
            }
            Err(e) => {
                warn!(name, "channel create rejected: {e}");
                CaStatus::Failed
            }
        }
    }

    /// Issue one read with the metadata-rich `initial_code`, then start the
    /// continuous subscription with the lighter `update_code`. Metadata
    /// rarely changes; values change on every update, so the standing
    /// subscription carries only value, status and timestamp.
    pub fn establish_subscription(&mut self, initial_code: i32, update_code: i32) -> CaStatus {
        if initial_code < 0 || update_code < 0 {
            debug!(name = %self.name, initial_code, update_code, "incompatible type for subscription");
            return CaStatus::Failed;
        }
        if self.channel == 0 {
            return CaStatus::Failed;
        }
        if self.channel_state != ChannelState::Connected {
            return CaStatus::ChannelDisconnected;
        }
        let _guard = self.context.lock();
        if let Err(e) = self
            .context
            .client()
            .read(self.channel, initial_code, self.requested_count, self.token)
        {
            warn!(name = %self.name, "initial read rejected: {e}");
            return CaStatus::Failed;
        }
        match self
            .context
            .client()
            .subscribe(self.channel, update_code, self.requested_count, self.token)
        {
            Ok(id) => {
                self.subscription.id = id;
                self.subscription.activated = true;
                self.subscription.creations += 1;
                trace!(name = %self.name, subscription = id, "subscription submitted");
                CaStatus::Successful
            }
            Err(e) => {
                warn!(name = %self.name, "subscribe rejected: {e}");
                CaStatus::Failed
            }
        }
    }

    /// One-shot read with the given decorated type code.
    pub fn read_channel(&self, dbr_code: i32) -> CaStatus {
        if dbr_code < 0 {
            debug!(name = %self.name, dbr_code, "incompatible type for read");
            return CaStatus::Failed;
        }
        if self.channel == 0 {
            return CaStatus::Failed;
        }
        if self.channel_state != ChannelState::Connected {
            return CaStatus::ChannelDisconnected;
        }
        let _guard = self.context.lock();
        match self
            .context
            .client()
            .read(self.channel, dbr_code, self.requested_count, self.token)
        {
            Ok(()) => CaStatus::Successful,
            Err(e) => {
                warn!(name = %self.name, "read rejected: {e}");
                CaStatus::Failed
            }
        }
    }

    /// One-shot write. Requests a completion acknowledgement when this
    /// connection is configured for it.
    pub fn write_channel(&self, dbr_code: i32, count: u32, value: &DbrValue) -> CaStatus {
        if dbr_code < 0 {
            debug!(name = %self.name, dbr_code, "incompatible type for write");
            return CaStatus::Failed;
        }
        if self.channel == 0 {
            return CaStatus::Failed;
        }
        if self.channel_state != ChannelState::Connected {
            return CaStatus::ChannelDisconnected;
        }
        let _guard = self.context.lock();
        match self.context.client().write(
            self.channel,
            dbr_code,
            count,
            value,
            self.write_with_ack,
            self.token,
        ) {
            Ok(()) => CaStatus::Successful,
            Err(e) => {
                warn!(name = %self.name, "write rejected: {e}");
                CaStatus::Failed
            }
        }
    }

    /// Release the subscription and channel at the transport level. Safe to
    /// call repeatedly; the connection object itself stays usable for state
    /// queries afterwards.
    pub fn remove_channel(&mut self) {
        let _guard = self.context.lock();
        if self.subscription.activated {
            if let Err(e) = self.context.client().unsubscribe(self.subscription.id) {
                debug!(name = %self.name, "unsubscribe failed: {e}");
            }
            self.subscription.id = 0;
            self.subscription.activated = false;
        }
        if self.channel != 0 {
            if let Err(e) = self.context.client().clear_channel(self.channel) {
                debug!(name = %self.name, "channel clear failed: {e}");
            }
            self.channel = 0;
            self.channel_state = ChannelState::Closed;
            self.link_state = LinkState::Down;
        }
    }

    /// Record a connection-up notification's channel properties.
    pub fn note_connected(&mut self, info: &ChannelInfo) {
        self.link_state = LinkState::Up;
        self.channel_state = ChannelState::Connected;
        self.channel_type = info.native_type;
        self.element_count = info.element_count;
        self.read_access = info.read_access;
        self.write_access = info.write_access;
        trace!(name = %self.name, native_type = info.native_type, count = info.element_count, "channel up");
    }

    /// Record a connection-down notification.
    pub fn note_disconnected(&mut self) {
        self.link_state = LinkState::Down;
        if self.channel_state == ChannelState::Connected {
            self.channel_state = ChannelState::PreviouslyConnected;
        }
        self.subscription.activated = false;
        trace!(name = %self.name, "channel down");
    }

    pub fn set_requested_count(&mut self, count: u32) {
        self.requested_count = count;
    }

    pub fn set_write_with_ack(&mut self, ack: bool) {
        self.write_with_ack = ack;
    }

    pub fn link_state(&self) -> LinkState {
        self.link_state
    }

    pub fn channel_state(&self) -> ChannelState {
        self.channel_state
    }

    /// Host-reported native type, -1 before the first connect
    pub fn channel_type(&self) -> i32 {
        self.channel_type
    }

    /// Host-reported element count
    pub fn element_count(&self) -> u32 {
        self.element_count
    }

    /// Consumer-configured subscription width, 0 meaning all elements
    pub fn requested_count(&self) -> u32 {
        self.requested_count
    }

    pub fn read_access(&self) -> bool {
        self.read_access
    }

    pub fn write_access(&self) -> bool {
        self.write_access
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel
    }

    pub fn subscribed(&self) -> bool {
        self.subscription.activated
    }

    pub fn subscription_creations(&self) -> u32 {
        self.subscription.creations
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{CaClient, CaError};
    use crate::marshal::{EngineCallbacks, Poster};
    use crate::safe_ref::RefPool;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Create(String),
        Clear(ChannelId),
        Read(ChannelId, i32),
        Write(ChannelId, i32, bool),
        Subscribe(ChannelId, i32),
        Unsubscribe(SubscriptionId),
    }

    #[derive(Default)]
    struct ScriptedClient {
        calls: Mutex<Vec<Call>>,
        reject_reads: bool,
    }

    impl CaClient for ScriptedClient {
        fn context_create(&self, _callbacks: Arc<EngineCallbacks>) -> Result<(), CaError> {
            Ok(())
        }
        fn create_channel(
            &self,
            name: &str,
            _priority: Priority,
            _token: RefToken,
        ) -> Result<ChannelId, CaError> {
            self.calls.lock().push(Call::Create(name.to_string()));
            Ok(17)
        }
        fn clear_channel(&self, id: ChannelId) -> Result<(), CaError> {
            self.calls.lock().push(Call::Clear(id));
            Ok(())
        }
        fn read(
            &self,
            id: ChannelId,
            dbr_code: i32,
            _count: u32,
            _token: RefToken,
        ) -> Result<(), CaError> {
            if self.reject_reads {
                return Err(CaError::Rejected("read refused".into()));
            }
            self.calls.lock().push(Call::Read(id, dbr_code));
            Ok(())
        }
        fn write(
            &self,
            id: ChannelId,
            dbr_code: i32,
            _count: u32,
            _value: &DbrValue,
            notify: bool,
            _token: RefToken,
        ) -> Result<(), CaError> {
            self.calls.lock().push(Call::Write(id, dbr_code, notify));
            Ok(())
        }
        fn subscribe(
            &self,
            id: ChannelId,
            dbr_code: i32,
            _count: u32,
            _token: RefToken,
        ) -> Result<SubscriptionId, CaError> {
            self.calls.lock().push(Call::Subscribe(id, dbr_code));
            Ok(5)
        }
        fn unsubscribe(&self, id: SubscriptionId) -> Result<(), CaError> {
            self.calls.lock().push(Call::Unsubscribe(id));
            Ok(())
        }
    }

    fn connected_info() -> ChannelInfo {
        ChannelInfo {
            native_type: 6,
            element_count: 1,
            read_access: true,
            write_access: true,
        }
    }

    fn setup(client: Arc<ScriptedClient>) -> ChannelConnection {
        let pool = Arc::new(RefPool::with_grace(Duration::from_secs(60)));
        let (tx, _rx) = crossbeam_channel::unbounded();
        let token = pool.acquire(Poster::new(tx, Arc::new(AtomicBool::new(true))));
        let context = CaContext::new(client, pool);
        let conn = ChannelConnection::new(context, token);
        assert_eq!(conn.establish_context(), CaStatus::Successful);
        conn
    }

    #[test]
    fn establish_channel_records_id_and_is_idempotent() {
        let client = Arc::new(ScriptedClient::default());
        let mut conn = setup(client.clone());
        assert_eq!(conn.establish_channel("TEST:PV", Priority::Default), CaStatus::Successful);
        assert_eq!(conn.channel_id(), 17);
        assert_eq!(conn.channel_state(), ChannelState::NeverConnected);
        // Second call must not issue another create
        assert_eq!(conn.establish_channel("TEST:PV", Priority::Default), CaStatus::Successful);
        assert_eq!(client.calls.lock().len(), 1);
    }

    #[test]
    fn subscription_reads_then_subscribes() {
        let client = Arc::new(ScriptedClient::default());
        let mut conn = setup(client.clone());
        conn.establish_channel("TEST:PV", Priority::Default);
        conn.note_connected(&connected_info());

        assert_eq!(conn.establish_subscription(34, 20), CaStatus::Successful);
        assert!(conn.subscribed());
        assert_eq!(conn.subscription_creations(), 1);
        assert_eq!(
            *client.calls.lock(),
            vec![
                Call::Create("TEST:PV".into()),
                Call::Read(17, 34),
                Call::Subscribe(17, 20)
            ]
        );
    }

    #[test]
    fn negative_type_code_never_reaches_transport() {
        let client = Arc::new(ScriptedClient::default());
        let mut conn = setup(client.clone());
        conn.establish_channel("TEST:PV", Priority::Default);
        conn.note_connected(&connected_info());

        assert_eq!(conn.establish_subscription(-1, 20), CaStatus::Failed);
        assert_eq!(conn.read_channel(-1), CaStatus::Failed);
        assert_eq!(
            conn.write_channel(-1, 1, &DbrValue::Double(vec![1.0])),
            CaStatus::Failed
        );
        // Only the channel create itself went out
        assert_eq!(client.calls.lock().len(), 1);
    }

    #[test]
    fn requests_before_connect_report_disconnected() {
        let client = Arc::new(ScriptedClient::default());
        let mut conn = setup(client);
        conn.establish_channel("TEST:PV", Priority::Default);
        assert_eq!(conn.read_channel(13), CaStatus::ChannelDisconnected);
        assert_eq!(conn.establish_subscription(34, 20), CaStatus::ChannelDisconnected);
    }

    #[test]
    fn rejected_initial_read_fails_without_subscribing() {
        let client = Arc::new(ScriptedClient {
            reject_reads: true,
            ..ScriptedClient::default()
        });
        let mut conn = setup(client.clone());
        conn.establish_channel("TEST:PV", Priority::Default);
        conn.note_connected(&connected_info());
        assert_eq!(conn.establish_subscription(34, 20), CaStatus::Failed);
        assert!(!conn.subscribed());
        assert!(!client.calls.lock().iter().any(|c| matches!(c, Call::Subscribe(..))));
    }

    #[test]
    fn write_honours_ack_flag() {
        let client = Arc::new(ScriptedClient::default());
        let mut conn = setup(client.clone());
        conn.establish_channel("TEST:PV", Priority::Default);
        conn.note_connected(&connected_info());
        conn.set_write_with_ack(true);
        assert_eq!(
            conn.write_channel(6, 1, &DbrValue::Double(vec![2.5])),
            CaStatus::Successful
        );
        assert!(client.calls.lock().contains(&Call::Write(17, 6, true)));
    }

    #[test]
    fn remove_channel_is_idempotent() {
        let client = Arc::new(ScriptedClient::default());
        let mut conn = setup(client.clone());
        conn.establish_channel("TEST:PV", Priority::Default);
        conn.note_connected(&connected_info());
        conn.establish_subscription(34, 20);

        conn.remove_channel();
        conn.remove_channel();
        assert_eq!(conn.channel_id(), 0);
        assert_eq!(conn.channel_state(), ChannelState::Closed);
        assert_eq!(conn.link_state(), LinkState::Down);
        let tears: Vec<_> = client
            .calls
            .lock()
            .iter()
            .filter(|c| matches!(c, Call::Clear(_) | Call::Unsubscribe(_)))
            .cloned()
            .collect();
        assert_eq!(tears, vec![Call::Unsubscribe(5), Call::Clear(17)]);
    }

    #[test]
    fn disconnect_marks_previously_connected() {
        let client = Arc::new(ScriptedClient::default());
        let mut conn = setup(client);
        conn.establish_channel("TEST:PV", Priority::Default);
        conn.note_connected(&connected_info());
        assert_eq!(conn.channel_state(), ChannelState::Connected);
        conn.note_disconnected();
        assert_eq!(conn.channel_state(), ChannelState::PreviouslyConnected);
        assert_eq!(conn.link_state(), LinkState::Down);
        assert!(!conn.subscribed());
    }
}
