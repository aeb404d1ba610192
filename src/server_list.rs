//! §4.A Server List — an ordered, rotating pool of candidate endpoints.

use rand::seq::SliceRandom;
use url::Url;

use crate::error::ClientError;

/// One candidate endpoint, with per-entry attempt state (§3 Endpoint).
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub url: Url,
    pub did_connect: bool,
    pub reconnects: u64,
    /// Set when learned from a server INFO gossip list rather than configured
    /// by the caller.
    pub implicit: bool,
}

impl Endpoint {
    fn new(url: Url, implicit: bool) -> Self {
        Endpoint {
            url,
            did_connect: false,
            reconnects: 0,
            implicit,
        }
    }
}

/// Ordered rotating pool. `select_server` pops the head and pushes it back
/// to the tail, so servers are tried round-robin once a rotation starts.
#[derive(Debug)]
pub struct ServerList {
    servers: Vec<Endpoint>,
}

impl ServerList {
    /// Build from the caller's configured endpoints, optionally shuffled,
    /// then make sure a separately-supplied `url` (if any) is tried first.
    pub fn new(urls: Vec<Url>, primary: Option<Url>, randomize: bool) -> Result<Self, ClientError> {
        if urls.is_empty() && primary.is_none() {
            return Err(ClientError::BadOptions(
                "no servers configured".to_owned(),
            ));
        }

        let mut servers: Vec<Endpoint> = urls.into_iter().map(|u| Endpoint::new(u, false)).collect();

        if randomize {
            servers.shuffle(&mut rand::thread_rng());
        }

        if let Some(primary) = primary {
            if !servers.iter().any(|e| e.url == primary) {
                servers.insert(0, Endpoint::new(primary, false));
            } else if let Some(pos) = servers.iter().position(|e| e.url == primary) {
                let entry = servers.remove(pos);
                servers.insert(0, entry);
            }
        }

        Ok(ServerList { servers })
    }

    /// Pop the head, mark it current (returned), push it to the tail.
    pub fn select_server(&mut self) -> Option<Endpoint> {
        if self.servers.is_empty() {
            return None;
        }
        let current = self.servers.remove(0);
        self.servers.push(current.clone());
        Some(current)
    }

    /// Record the outcome of a dial attempt against whichever entry matches
    /// `url` (the head, just rotated to the tail by `select_server`).
    pub fn mark_connected(&mut self, url: &Url) {
        if let Some(e) = self.servers.iter_mut().find(|e| &e.url == url) {
            e.did_connect = true;
        }
    }

    pub fn mark_reconnect_attempt(&mut self, url: &Url) {
        if let Some(e) = self.servers.iter_mut().find(|e| &e.url == url) {
            e.reconnects += 1;
        }
    }

    /// §4.H socket-error purge: drop an endpoint that never connected, unless
    /// `wait_on_first_connect` says to pretend it had.
    pub fn purge_never_connected(&mut self, url: &Url) {
        self.servers.retain(|e| &e.url != url || e.did_connect);
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Whether at least one endpoint still has reconnect attempts left
    /// under `max` (§4.H reconnect-attempt cap).
    pub fn any_within_reconnect_cap(&self, max: u32) -> bool {
        self.servers.iter().any(|e| e.reconnects < max)
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn urls(&self) -> Vec<String> {
        self.servers.iter().map(|e| e.url.to_string()).collect()
    }

    /// §4.H `processServerUpdate` — reconcile against a server-advertised
    /// peer list. Returns the URLs that were newly added, if any (drives
    /// the `servers`/`serversDiscovered` events).
    pub fn reconcile_gossip(&mut self, current: &Url, connect_urls: &[String]) -> Vec<String> {
        let incoming: Vec<Url> = connect_urls
            .iter()
            .filter_map(|raw| normalize_gossip_url(raw).ok())
            .collect();

        self.servers.retain(|e| {
            !(e.implicit && &e.url != current && !incoming.contains(&e.url))
        });

        let mut added = Vec::new();
        for url in incoming {
            if !self.servers.iter().any(|e| e.url == url) {
                self.servers.push(Endpoint::new(url.clone(), true));
                added.push(url.to_string());
            }
        }
        added
    }
}

/// Gossip entries are bare `host:port`; reuse the `nats://` default scheme
/// rule from §6 so they compare equal to configured URLs with the same host.
fn normalize_gossip_url(raw: &str) -> Result<Url, url::ParseError> {
    if raw.contains("://") {
        Url::parse(raw)
    } else {
        Url::parse(&format!("nats://{raw}"))
    }
}
