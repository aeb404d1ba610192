//! §4.E Request Multiplexer.
//!
//! One wildcard subscription `<root>.*` backs every in-flight request;
//! per-request state lives in `requests`, keyed by the token that forms the
//! final segment of the reply inbox. Mux ids are negative and strictly
//! decreasing, disjoint from the positive sid space (§3 invariant).

use std::collections::HashMap;

use crate::nuid;

pub struct MuxRequest {
    pub token: String,
    pub inbox: String,
    pub id: i64,
    pub received: u64,
    pub expected: Option<u64>,
}

/// Lazily created on first `request()` call; lives until `close()`.
pub struct MuxRoot {
    pub root_inbox: String,
    prefix_len: usize,
    pub sid: u64,
    next_id: i64,
    requests: HashMap<String, MuxRequest>,
}

impl MuxRoot {
    /// `sid` is the sid assigned to the wildcard `<root>.*` subscription by
    /// the caller's subscription registry (createResponseMux, §4.E).
    pub fn new(sid: u64) -> Self {
        let root_inbox = format!("_INBOX.{}", nuid::next());
        let prefix_len = root_inbox.len() + 1;
        MuxRoot {
            root_inbox,
            prefix_len,
            sid,
            next_id: -1,
            requests: HashMap::new(),
        }
    }

    pub fn wildcard_subject(&self) -> String {
        format!("{}.*", self.root_inbox)
    }

    /// Allocate a fresh token + reply inbox + negative id, and register the
    /// pending request. Returns `(id, inbox)` -- the caller publishes with
    /// `inbox` as the reply subject and uses `id` as the public handle.
    pub fn add_request(&mut self, expected: Option<u64>) -> (i64, String) {
        let token = nuid::next();
        let inbox = format!("{}.{}", self.root_inbox, token);
        let id = self.next_id;
        self.next_id -= 1;

        self.requests.insert(
            token.clone(),
            MuxRequest {
                token,
                inbox: inbox.clone(),
                id,
                received: 0,
                expected,
            },
        );
        (id, inbox)
    }

    /// Extract the token from an incoming subject by stripping the
    /// `<root>.` prefix, and look up the matching request.
    pub fn dispatch<'a>(&'a mut self, subject: &str) -> Option<&'a mut MuxRequest> {
        if subject.len() <= self.prefix_len {
            return None;
        }
        let token = &subject[self.prefix_len..];
        self.requests.get_mut(token)
    }

    /// Bump `received` for the request matching `subject`; returns `true`
    /// if `expected` was set and has now been reached (caller should cancel).
    pub fn record_delivery(&mut self, subject: &str) -> Option<bool> {
        let request = self.dispatch(subject)?;
        request.received += 1;
        Some(matches!(request.expected, Some(expected) if request.received >= expected))
    }

    /// Cancel (remove) a request by its token. Does NOT unsubscribe the
    /// shared wildcard.
    pub fn cancel_by_token(&mut self, token: &str) -> Option<MuxRequest> {
        self.requests.remove(token)
    }

    /// Cancel by the public negative id (`unsubscribe(negativeId)` maps to
    /// this).
    pub fn cancel_by_id(&mut self, id: i64) -> Option<MuxRequest> {
        let token = self
            .requests
            .values()
            .find(|r| r.id == id)
            .map(|r| r.token.clone())?;
        self.cancel_by_token(&token)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
