//! Recyclable indirection handles for callbacks we cannot cancel.
//!
//! The client library invokes callbacks at times of its own choosing, on its
//! own threads, possibly long after the consumer object a request belonged to
//! has been destroyed. Handing the library a direct reference to the consumer
//! is therefore never safe. Instead every request carries a [`RefToken`]
//! naming a slot in a [`RefPool`], and the callback side resolves the token
//! back into a [`Poster`] only after validating it.
//!
//! Slots are never removed from the pool, only recycled: a token that was ever
//! handed to the library stays resolvable (to a rejection) for the life of the
//! pool. When a consumer object is destroyed its slot is marked discarded and
//! queued for reuse, but a new owner may only take it after a grace window has
//! passed, giving genuinely late callbacks time to arrive and be rejected
//! rather than delivered to an unrelated new owner.
//!
//! Validation on resolve, in order: the slot's magic tag (a corrupt token
//! means the library broke its contract - logged loudly), the discarded flag
//! (a late callback for a dead owner - logged quietly, dropped), and the
//! channel id carried by the callback against the one bound to the slot (a
//! mismatch means the slot has been recycled since the request was issued).

use crate::client::ChannelId;
use crate::marshal::Poster;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, trace};

/// Tag stamped into every live slot; anything else means the token is garbage
const REF_MAGIC: u32 = 0x4361_5265;

/// Minimum idle time before a discarded slot may serve a new owner
const DEFAULT_GRACE: Duration = Duration::from_secs(60);

/// Opaque handle standing in for "the object this callback is for".
///
/// Cheap to copy and safe to send anywhere, including across the client
/// library boundary; it is only meaningful to the pool that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RefToken(usize);

impl RefToken {
    /// Display form for log messages
    pub fn index(self) -> usize {
        self.0
    }
}

/// Why a token failed to resolve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// The token does not name a live slot at all. This indicates a contract
    /// violation in the client library, not a normal race.
    #[error("token does not name a pool slot (bad magic)")]
    BadMagic,
    /// The owner was destroyed before this callback arrived.
    #[error("handle was discarded; late callback dropped")]
    Stale,
    /// The callback carried no channel id and this callback kind requires one.
    #[error("callback carried channel id zero")]
    ZeroChannel,
    /// The callback's channel id does not match the one bound to the slot,
    /// so it was meant for a previous occupant.
    #[error("callback channel {got} does not match bound channel {bound}")]
    ChannelMismatch { got: ChannelId, bound: ChannelId },
}

struct Slot {
    magic: u32,
    discarded: bool,
    /// Bumped each time the slot is handed to a new owner
    generation: u64,
    /// Number of successful resolves for the current owner
    uses: u64,
    /// Channel this owner is working with; zero until bound
    channel: ChannelId,
    name: String,
    poster: Option<Poster>,
    discarded_at: Option<Instant>,
}

struct PoolInner {
    slots: Vec<Slot>,
    /// FIFO of discarded slot indices, oldest first
    retired: VecDeque<usize>,
}

/// Lock-protected table of recyclable handles
pub struct RefPool {
    inner: Mutex<PoolInner>,
    grace: Duration,
}

/// Counters for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub retired: usize,
}

impl RefPool {
    /// The process-wide pool. Never torn down; slots handed to the client
    /// library remain valid to (fail to) resolve forever.
    pub fn global() -> &'static RefPool {
        static GLOBAL: OnceLock<RefPool> = OnceLock::new();
        GLOBAL.get_or_init(|| RefPool::with_grace(DEFAULT_GRACE))
    }

    pub fn with_grace(grace: Duration) -> RefPool {
        RefPool {
            inner: Mutex::new(PoolInner {
                slots: Vec::new(),
                retired: VecDeque::new(),
            }),
            grace,
        }
    }

    /// Hand out a handle for a new owner, recycling a retired slot whose
    /// grace window has elapsed if one is available.
    pub fn acquire(&self, poster: Poster) -> RefToken {
        self.acquire_at(poster, Instant::now())
    }

    fn reusable_front(&self, inner: &PoolInner, now: Instant) -> bool {
        inner
            .retired
            .front()
            .and_then(|&idx| inner.slots[idx].discarded_at)
            .is_some_and(|at| now.duration_since(at) >= self.grace)
    }

    pub(crate) fn acquire_at(&self, poster: Poster, now: Instant) -> RefToken {
        let mut inner = self.inner.lock();
        if self.reusable_front(&inner, now) {
            let idx = match inner.retired.pop_front() {
                Some(idx) => idx,
                None => return self.push_new(&mut inner, poster),
            };
            let slot = &mut inner.slots[idx];
            slot.discarded = false;
            slot.generation += 1;
            slot.uses = 0;
            slot.channel = 0;
            slot.name.clear();
            slot.poster = Some(poster);
            slot.discarded_at = None;
            trace!(slot = idx, generation = slot.generation, "recycled handle");
            return RefToken(idx);
        }
        self.push_new(&mut inner, poster)
    }

    fn push_new(&self, inner: &mut PoolInner, poster: Poster) -> RefToken {
        let idx = inner.slots.len();
        inner.slots.push(Slot {
            magic: REF_MAGIC,
            discarded: false,
            generation: 0,
            uses: 0,
            channel: 0,
            name: String::new(),
            poster: Some(poster),
            discarded_at: None,
        });
        trace!(slot = idx, "allocated handle");
        RefToken(idx)
    }

    /// Mark a handle's owner as destroyed and queue the slot for deferred
    /// reuse. Idempotent; the slot itself is never deallocated.
    pub fn discard(&self, token: RefToken) {
        self.discard_at(token, Instant::now());
    }

    pub(crate) fn discard_at(&self, token: RefToken, now: Instant) {
        let mut inner = self.inner.lock();
        let Some(slot) = inner.slots.get_mut(token.0) else {
            error!(slot = token.0, "discard of a token outside the pool");
            return;
        };
        if slot.discarded {
            return;
        }
        slot.discarded = true;
        slot.poster = None;
        slot.discarded_at = Some(now);
        debug!(slot = token.0, channel = slot.channel, name = %slot.name, "handle discarded");
        inner.retired.push_back(token.0);
    }

    /// Validate a token carried by a callback and return the way to reach its
    /// owner. On any failure the caller must drop the notification.
    ///
    /// `channel_hint` is the channel id the callback carried; pass
    /// `allow_zero_channel` for callback kinds that legitimately carry none.
    pub fn resolve(
        &self,
        token: RefToken,
        channel_hint: ChannelId,
        allow_zero_channel: bool,
    ) -> Result<Poster, ResolveError> {
        let mut inner = self.inner.lock();
        let slot = match inner.slots.get_mut(token.0) {
            Some(slot) if slot.magic == REF_MAGIC => slot,
            _ => {
                error!(
                    slot = token.0,
                    "callback carried a token that is not a valid handle"
                );
                return Err(ResolveError::BadMagic);
            }
        };
        if slot.discarded {
            debug!(
                slot = token.0,
                channel = channel_hint,
                "late callback for a discarded handle"
            );
            return Err(ResolveError::Stale);
        }
        if channel_hint == 0 && !allow_zero_channel {
            debug!(slot = token.0, "callback without a channel id rejected");
            return Err(ResolveError::ZeroChannel);
        }
        if channel_hint != 0 && slot.channel != 0 && slot.channel != channel_hint {
            debug!(
                slot = token.0,
                got = channel_hint,
                bound = slot.channel,
                "callback for a since-recycled handle"
            );
            return Err(ResolveError::ChannelMismatch {
                got: channel_hint,
                bound: slot.channel,
            });
        }
        slot.uses += 1;
        match &slot.poster {
            Some(poster) => Ok(poster.clone()),
            // Discard clears the poster before setting the flag, so this arm
            // should be unreachable; treat it as stale rather than panic.
            None => Err(ResolveError::Stale),
        }
    }

    /// Record the channel this handle's owner is working with, for use in the
    /// mismatch check and in diagnostics.
    pub fn bind_channel(&self, token: RefToken, channel: ChannelId) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.slots.get_mut(token.0) {
            slot.channel = channel;
        }
    }

    pub fn bind_name(&self, token: RefToken, name: &str) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.slots.get_mut(token.0) {
            slot.name = name.to_string();
        }
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            total: inner.slots.len(),
            retired: inner.retired.len(),
        }
    }

    /// Resolve count for the slot's current owner, for diagnostics.
    pub fn uses(&self, token: RefToken) -> u64 {
        self.inner
            .lock()
            .slots
            .get(token.0)
            .map(|s| s.uses)
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn corrupt_magic(&self, token: RefToken) {
        self.inner.lock().slots[token.0].magic = 0xDEAD_BEEF;
    }
}
