//! §4.D Subscription Registry.

use std::collections::HashMap;

use bytes::Bytes;

/// A single delivered message, handed to the subscriber's callback/channel.
#[derive(Debug, Clone)]
pub struct Message {
    pub subject: String,
    pub sid: u64,
    pub reply: Option<String>,
    pub payload: Bytes,
}

/// Outcome a delivered message produces for the registry to apply -- kept
/// separate from the channel send so the registry's bookkeeping doesn't
/// depend on whether the send succeeded.
pub enum Delivery {
    /// Deliver normally; sub stays.
    Deliver,
    /// Deliver, then the sub's `max` was reached exactly: unsubscribe.
    DeliverThenUnsubscribe,
    /// `received` had already passed `max` (an UNSUB-with-limit race);
    /// unsubscribe and drop the callback, no further delivery.
    UnsubscribeWithoutDelivery,
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub sid: u64,
    pub subject: String,
    pub queue_group: Option<String>,
    pub received: u64,
    pub max: Option<u64>,
    /// Set by `.timeout(...)`: fire `cb` once if fewer than `expected`
    /// messages have arrived by the deadline.
    pub expected_for_timeout: Option<u64>,
}

impl Subscription {
    fn new(sid: u64, subject: String, queue_group: Option<String>) -> Self {
        Subscription {
            sid,
            subject,
            queue_group,
            received: 0,
            max: None,
            expected_for_timeout: None,
        }
    }
}

/// Keyed by sid. sids are strictly increasing positive integers starting at
/// 1; sid=0 is invalid (§3 invariant).
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    next_sid: u64,
    subs: HashMap<u64, Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        SubscriptionRegistry {
            next_sid: 1,
            subs: HashMap::new(),
        }
    }

    pub fn insert(&mut self, subject: String, queue_group: Option<String>) -> u64 {
        let sid = self.next_sid;
        self.next_sid += 1;
        self.subs.insert(sid, Subscription::new(sid, subject, queue_group));
        sid
    }

    /// Reserve the next sid without registering a subscription. The mux
    /// wildcard subscription (`mux.rs`) lives outside this registry but must
    /// still draw from the same sid space (§3 invariant: one sid space).
    pub fn reserve_sid(&mut self) -> u64 {
        let sid = self.next_sid;
        self.next_sid += 1;
        sid
    }

    pub fn set_max(&mut self, sid: u64, max: u64) {
        if let Some(sub) = self.subs.get_mut(&sid) {
            sub.max = Some(max);
        }
    }

    pub fn set_timeout_expected(&mut self, sid: u64, expected: u64) {
        if let Some(sub) = self.subs.get_mut(&sid) {
            sub.expected_for_timeout = Some(expected);
        }
    }

    pub fn remove(&mut self, sid: u64) -> Option<Subscription> {
        self.subs.remove(&sid)
    }

    pub fn get(&self, sid: u64) -> Option<&Subscription> {
        self.subs.get(&sid)
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    /// Full-registry iteration in insertion-stable order, used for SUB
    /// replay after reconnect (§4.H: the FSM re-emits every sub via SUB
    /// before processing application traffic).
    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        let mut sids: Vec<&u64> = self.subs.keys().collect();
        sids.sort_unstable();
        sids.into_iter().map(move |sid| &self.subs[sid])
    }

    /// Apply one incoming MSG with sid `S`: bump `received`, decide the
    /// unsubscribe outcome per `max`, and report whether the timeout timer
    /// (if any) should now be cancelled.
    ///
    /// Returns `None` if no such subscription exists (drop silently).
    pub fn record_delivery(&mut self, sid: u64) -> Option<(Delivery, bool)> {
        let sub = self.subs.get_mut(&sid)?;
        sub.received += 1;

        let cancel_timeout = matches!(sub.expected_for_timeout, Some(expected) if sub.received >= expected);

        let delivery = match sub.max {
            Some(max) if sub.received == max => Delivery::DeliverThenUnsubscribe,
            Some(max) if sub.received > max => Delivery::UnsubscribeWithoutDelivery,
            _ => Delivery::Deliver,
        };

        Some((delivery, cancel_timeout))
    }
}
