//! §6 event surface, as a typed observer trait rather than an anonymous
//! event-emitter fan-out (§9 REDESIGN FLAGS: "Event-emitter fan-out").
//! Implementors only override the events they care about.

use crate::error::ClientError;

/// A typed substitute for the variadic event-emitter tuples in the
/// original's event bus. One method per event in §6.
pub trait EventHandler: Send + Sync {
    fn on_connect(&self) {}
    fn on_reconnect(&self) {}
    fn on_reconnecting(&self) {}
    fn on_disconnect(&self) {}
    fn on_close(&self) {}
    fn on_error(&self, _err: &ClientError) {}
    fn on_permission_error(&self, _err: &ClientError) {}
    fn on_subscribe(&self, _sid: u64, _subject: &str, _queue_group: Option<&str>) {}
    fn on_unsubscribe(&self, _sid: u64, _subject: &str) {}
    fn on_servers(&self, _new_urls: &[String]) {}
    fn on_servers_discovered(&self, _new_urls: &[String]) {}
    fn on_ping_timer(&self) {}
    fn on_ping_count(&self, _pout: u32) {}
}

/// A handler that does nothing; the default when the caller registers none.
pub struct NoopEventHandler;

impl EventHandler for NoopEventHandler {}
