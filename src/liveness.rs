//! §4.F Liveness: periodic PING scheduling and the outstanding-pong queue.
//!
//! The scheduling itself (the one-shot timer re-armed on every fire) lives
//! in `fsm.rs`, where it has access to the socket; this module holds the
//! pure bookkeeping so it can be unit tested without a socket or a clock.

use std::collections::VecDeque;

/// An optional completion signal for one outstanding PING. `None` is a
/// routine keepalive ping; `Some` pairs a `flush()` call (or the initial
/// connect/reconnect handshake ping, §4.H) with the PONG that completes it.
pub type PongWaiter = ();

#[derive(Debug, Default)]
pub struct Liveness {
    /// One entry per PING sent, popped in order on each PONG (§3 invariant:
    /// |sent_pings_unacked| == |pong_queue|).
    pongs: VecDeque<Option<PongWaiter>>,
    pout: u32,
    pub max_ping_out: u32,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PingOutcome {
    /// Send the PING and push a routine (un-awaited) pong slot.
    Send,
    /// `pout` exceeded `max_ping_out`: synthesize a stale-connection error
    /// and do not reschedule.
    Stale,
}

impl Liveness {
    pub fn new(max_ping_out: u32) -> Self {
        Liveness {
            pongs: VecDeque::new(),
            pout: 0,
            max_ping_out,
        }
    }

    /// Called when the ping timer fires. Increments `pout` and decides
    /// whether the connection should be declared stale.
    pub fn on_ping_timer_fire(&mut self) -> PingOutcome {
        self.pout += 1;
        if self.pout > self.max_ping_out {
            PingOutcome::Stale
        } else {
            PingOutcome::Send
        }
    }

    /// Record that a PING was actually written to the wire, with an
    /// optional waiter to notify when the matching PONG arrives.
    pub fn push_ping(&mut self, waiter: Option<PongWaiter>) {
        self.pongs.push_back(waiter);
    }

    /// Pop the front pong-queue entry on a received PONG, and reset `pout`.
    pub fn on_pong(&mut self) -> Option<PongWaiter> {
        self.pout = 0;
        self.pongs.pop_front().flatten()
    }

    pub fn outstanding_pings(&self) -> usize {
        self.pongs.len()
    }

    pub fn pout(&self) -> u32 {
        self.pout
    }

    /// Drop every outstanding pong-queue entry and outstanding-ping count.
    /// A fresh dial starts a fresh session (§3 invariant: the pong queue
    /// corresponds to the PINGs sent *on this connection*) -- entries left
    /// over from a dead socket must never be popped by a PONG on the new one.
    pub fn reset(&mut self) {
        self.pongs.clear();
        self.pout = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_after_exceeding_max_ping_out() {
        let mut live = Liveness::new(2);
        assert_eq!(live.on_ping_timer_fire(), PingOutcome::Send);
        assert_eq!(live.on_ping_timer_fire(), PingOutcome::Send);
        assert_eq!(live.on_ping_timer_fire(), PingOutcome::Stale);
    }

    #[test]
    fn reset_drops_outstanding_pongs_and_pout() {
        let mut live = Liveness::new(2);
        live.on_ping_timer_fire();
        live.push_ping(None);
        live.on_ping_timer_fire();
        live.push_ping(Some(()));
        assert_eq!(live.outstanding_pings(), 2);

        live.reset();
        assert_eq!(live.outstanding_pings(), 0);
        assert_eq!(live.pout(), 0);
    }

    #[test]
    fn pong_resets_pout_and_pops_queue_in_order() {
        let mut live = Liveness::new(5);
        live.on_ping_timer_fire();
        live.push_ping(None);
        live.on_ping_timer_fire();
        live.push_ping(Some(()));
        assert_eq!(live.outstanding_pings(), 2);

        let first = live.on_pong();
        assert_eq!(first, None);
        assert_eq!(live.pout(), 0);
        assert_eq!(live.outstanding_pings(), 1);

        let second = live.on_pong();
        assert_eq!(second, Some(()));
        assert_eq!(live.outstanding_pings(), 0);
    }
}
