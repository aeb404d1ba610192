//! §4.H Connection FSM: the single task that owns the socket and every
//! piece of mutable client state (§5 concurrency model -- this task *is*
//! the "single logical thread" the spec asks for; every public API call
//! reaches it only through `Command` messages, never a shared mutex).

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::codec::Decoder;
use tracing::{debug, warn};
use url::Url;

use crate::error::ClientError;
use crate::liveness::{Liveness, PingOutcome};
use crate::mux::MuxRoot;
use crate::options::{ClientConfig, TlsMode};
use crate::parser::{ControlEvent, MsgHeader, Parser};
use crate::protocol::{ConnectPayload, ServerInfo};
use crate::send_buffer::{ChunkKind, OutBuffer};
use crate::server_list::ServerList;
use crate::socket::{self, Socket};
use crate::subs::{Delivery, Message, SubscriptionRegistry};

/// What a subscriber's channel carries. `JsonError` renders the spec's
/// deliberately odd §4.D contract ("pass the parse error itself as the
/// message") as a distinct, typed variant instead of silently reusing `Msg`.
#[derive(Debug, Clone)]
pub enum SubEvent {
    Msg(Message),
    JsonError { message: Message, error: String },
    /// Fired once by `.timeout(...)` if fewer than `expected` messages had
    /// arrived by the deadline; the sub is unsubscribed immediately after.
    Timeout,
}

pub(crate) enum Command {
    Publish {
        subject: String,
        reply: Option<String>,
        payload: Bytes,
    },
    Subscribe {
        subject: String,
        queue_group: Option<String>,
        respond: oneshot::Sender<(u64, mpsc::UnboundedReceiver<SubEvent>)>,
    },
    Unsubscribe {
        sid: u64,
        max: Option<u64>,
    },
    SubTimeout {
        sid: u64,
        expected: u64,
        after: Duration,
    },
    Request {
        subject: String,
        payload: Bytes,
        expected: Option<u64>,
        timeout: Option<Duration>,
        respond: mpsc::UnboundedSender<Result<Message, ClientError>>,
        /// Hands the caller back the mux request's negative id (§3) so a
        /// dropped request/request_multi can tell the FSM to clean up its
        /// `requestMap` entry early instead of leaking it until `expected`
        /// or a timeout is reached (`useOldRequestStyle` has no id of this
        /// kind, so it sends `0`, a value `cancel_by_id` never matches).
        id_reply: oneshot::Sender<i64>,
    },
    CancelRequest {
        id: i64,
    },
    Flush {
        respond: oneshot::Sender<Result<(), ClientError>>,
    },
    Drain {
        respond: oneshot::Sender<Result<(), ClientError>>,
    },
    Close,
}

#[derive(Default)]
pub(crate) struct Shared {
    pub connected: AtomicBool,
    pub closed: AtomicBool,
    pub num_subs: AtomicUsize,
}

enum TimerKind {
    Ping,
    RequestTimeout { token: String },
    LegacyRequestTimeout { sid: u64 },
    SubTimeout { sid: u64 },
}

/// What a PONG should do once it arrives, kept in lockstep with the PINGs
/// enqueued (§3 invariant: one pong-queue entry per PING, popped in order).
/// `liveness.pongs` counts outstanding PINGs for staleness; this queue is the
/// Fsm-level payload for the same slots, since both are pushed together at
/// every `push_ping` call site.
enum PongAction {
    /// A routine keepalive PING; nothing to do on its PONG.
    None,
    /// A `flush()` caller awaiting the round trip.
    Flush(oneshot::Sender<Result<(), ClientError>>),
    /// The handshake PING sent right after CONNECT (§4.H): its PONG is what
    /// actually confirms the connection, not the act of sending CONNECT --
    /// an auth failure surfaces as `-ERR` instead of this PONG.
    ConnectConfirm { reconnect: bool },
}

enum ShouldReconnect {
    Yes,
    No,
}

pub(crate) struct Fsm {
    config: ClientConfig,
    server_list: ServerList,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    shared: Arc<Shared>,

    out: OutBuffer,
    subs: SubscriptionRegistry,
    sub_channels: HashMap<u64, mpsc::UnboundedSender<SubEvent>>,
    mux: Option<MuxRoot>,
    mux_callbacks: HashMap<String, mpsc::UnboundedSender<Result<Message, ClientError>>>,
    /// `useOldRequestStyle` (§4.E): one fresh subscription per request
    /// instead of the shared mux wildcard. Kept as a separate, sid-keyed
    /// map since these requests are plain subscriptions in `subs`, not mux
    /// entries -- the distinction is which callback map `deliver_msg` routes
    /// a delivery to, not a different wire protocol.
    legacy_request_callbacks: HashMap<u64, mpsc::UnboundedSender<Result<Message, ClientError>>>,

    liveness: Liveness,
    pong_actions: VecDeque<PongAction>,
    first_connect: Option<oneshot::Sender<Result<(), ClientError>>>,
    current_url: Option<Url>,
    ever_connected: bool,
    draining: bool,

    timers: BTreeMap<(Instant, u64), TimerKind>,
    timer_seq: u64,
}

impl Fsm {
    pub(crate) fn new(
        config: ClientConfig,
        cmd_rx: mpsc::UnboundedReceiver<Command>,
        shared: Arc<Shared>,
        first_connect: oneshot::Sender<Result<(), ClientError>>,
    ) -> Result<Self, ClientError> {
        let server_list = ServerList::new(config.urls.clone(), config.primary.clone(), config.randomize)?;
        let max_ping_out = config.max_ping_out;
        Ok(Fsm {
            config,
            server_list,
            cmd_rx,
            shared,
            out: OutBuffer::new(),
            subs: SubscriptionRegistry::new(),
            sub_channels: HashMap::new(),
            mux: None,
            mux_callbacks: HashMap::new(),
            legacy_request_callbacks: HashMap::new(),
            liveness: Liveness::new(max_ping_out),
            pong_actions: VecDeque::new(),
            first_connect: Some(first_connect),
            current_url: None,
            ever_connected: false,
            draining: false,
            timers: BTreeMap::new(),
            timer_seq: 0,
        })
    }

    fn schedule(&mut self, at: Instant, kind: TimerKind) {
        self.timer_seq += 1;
        self.timers.insert((at, self.timer_seq), kind);
    }

    pub(crate) async fn run(mut self) {
        loop {
            match self.connect_and_serve().await {
                Ok(ShouldReconnect::No) => break,
                Ok(ShouldReconnect::Yes) => {
                    if !self.wait_for_reconnect_slot() {
                        break;
                    }
                }
                Err(fatal) => {
                    self.config.event_handler.on_error(&fatal);
                    if let Some(tx) = self.first_connect.take() {
                        let _ = tx.send(Err(fatal));
                    }
                    break;
                }
            }
        }
        if let Some(tx) = self.first_connect.take() {
            let _ = tx.send(Err(ClientError::ConnErr(
                "unable to establish initial connection".to_owned(),
            )));
        }
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.closed.store(true, Ordering::SeqCst);
        self.config.event_handler.on_close();
    }

    fn wait_for_reconnect_slot(&mut self) -> bool {
        if !self.config.reconnect || self.server_list.is_empty() {
            return false;
        }
        self.config.event_handler.on_reconnecting();
        true
    }

    /// One full dial→handshake→steady-state→disconnect cycle.
    async fn connect_and_serve(&mut self) -> Result<ShouldReconnect, ClientError> {
        let Some(endpoint) = self.server_list.select_server() else {
            return Ok(ShouldReconnect::No);
        };

        if let Some(max) = self.config.max_reconnect_attempts {
            if endpoint.reconnects >= max {
                if self.server_list.any_within_reconnect_cap(max) {
                    return Ok(ShouldReconnect::Yes);
                }
                return Ok(ShouldReconnect::No);
            }
        }

        // §4.H: wait reconnectTimeWait only if *this candidate* has been
        // dialed before -- a cold, never-connected candidate (e.g. one just
        // learned from gossip) is retried immediately. `was_connected` below
        // is a separate question (has the client *ever* connected to
        // anything) and stays keyed off `self.ever_connected`.
        let was_connected = self.ever_connected;
        if endpoint.did_connect {
            tokio::time::sleep(self.config.reconnect_wait).await;
        }
        self.server_list.mark_reconnect_attempt(&endpoint.url);
        self.current_url = Some(endpoint.url.clone());

        // §3/§8 invariant 1: the pong queue corresponds to PINGs sent *on
        // this connection*. Any PING left unacked by the dead session (the
        // normal stale-connection case, and any flush() still in flight)
        // must not linger into the new one, or the handshake PONG pops a
        // stale entry instead of the one it actually answers.
        self.pong_actions.clear();
        self.liveness.reset();

        // §4.H pending-buffer rebuild, done fresh for every dial attempt.
        // PUBs survive; PINGs never do -- the pong queue they would have
        // answered was just reset above, so resending one now would put an
        // untracked PING on the new wire with nothing in `pong_actions` to
        // pop it. A flush() whose PING never made it out before the
        // disconnect resolves when its oneshot sender is dropped, the same
        // as any other in-flight call across a reconnect.
        self.out.rebuild_for_reconnect(|| false);
        let kept = self.out.drain_coalesced();

        let host = endpoint.url.host_str().unwrap_or("localhost").to_owned();
        let port = endpoint.url.port().unwrap_or(4222);

        let tcp = match socket::dial(&host, port).await {
            Ok(tcp) => tcp,
            Err(e) => {
                if !endpoint.did_connect {
                    if self.config.wait_on_first_connect {
                        self.server_list.mark_connected(&endpoint.url);
                    } else {
                        self.server_list.purge_never_connected(&endpoint.url);
                    }
                }
                if !self.ever_connected && self.server_list.is_empty() {
                    return Err(ClientError::ConnErr(format!(
                        "unable to connect to any server: {e}"
                    )));
                }
                warn!(%host, port, error = %e, "dial failed");
                return Ok(ShouldReconnect::Yes);
            }
        };
        self.server_list.mark_connected(&endpoint.url);

        let mut parser = Parser::new();
        let mut read_buf = BytesMut::with_capacity(4096);
        let mut socket = Socket::Plain(tcp);
        socket.set_nodelay().ok();

        // AWAITING_INFO: read until the first INFO frame arrives.
        let info = match self.read_first_info(&mut socket, &mut parser, &mut read_buf).await {
            Ok(info) => info,
            Err(e) => {
                warn!(error = %e, "connection dropped before INFO");
                return Ok(ShouldReconnect::Yes);
            }
        };

        self.check_tls_reconciliation(&info)?;

        if info.tls_required {
            let tcp = match socket {
                Socket::Plain(tcp) => tcp,
                Socket::Tls(_) => unreachable!("not yet upgraded"),
            };
            socket = socket::upgrade_to_tls(tcp, &host).await?;
        }

        let connect_payload = self.config.auth.build_connect_payload(
            &info,
            self.config.verbose,
            self.config.pedantic,
            self.config.no_echo,
        )?;

        self.enqueue_connect(&connect_payload)?;
        self.enqueue_sub_replay();
        if !kept.is_empty() {
            self.out.enqueue(ChunkKind::Other, kept);
        }
        // §4.H: the paired PONG, not the act of sending CONNECT, is what
        // confirms the handshake -- an auth failure arrives as `-ERR`
        // instead of this PONG, and must not be preceded by a `connect` event.
        self.liveness.push_ping(None);
        self.pong_actions.push_back(PongAction::ConnectConfirm { reconnect: was_connected });
        self.out.enqueue(ChunkKind::Ping, Bytes::from_static(b"PING\r\n"));

        self.flush_socket(&mut socket).await?;

        self.shared.connected.store(true, Ordering::SeqCst);

        self.schedule(Instant::now() + self.config.ping_interval, TimerKind::Ping);

        let outcome = self.steady_state_loop(socket, parser, read_buf).await;
        self.shared.connected.store(false, Ordering::SeqCst);
        self.config.event_handler.on_disconnect();

        match outcome {
            Ok(ShouldReconnect::No) => Ok(ShouldReconnect::No),
            Ok(ShouldReconnect::Yes) => {
                if self.draining || !self.config.reconnect {
                    Ok(ShouldReconnect::No)
                } else {
                    Ok(ShouldReconnect::Yes)
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn read_first_info(
        &mut self,
        socket: &mut Socket,
        parser: &mut Parser,
        read_buf: &mut BytesMut,
    ) -> Result<ServerInfo, ClientError> {
        loop {
            if let Some(ControlEvent::Info(json)) = parser.decode(read_buf)? {
                return parse_info(&json);
            }
            let mut chunk = [0u8; 4096];
            let n = socket
                .read(&mut chunk)
                .await
                .map_err(|e| ClientError::ConnErr(e.to_string()))?;
            if n == 0 {
                return Err(ClientError::ConnErr("eof before INFO".to_owned()));
            }
            read_buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn check_tls_reconciliation(&self, info: &ServerInfo) -> Result<(), ClientError> {
        match self.config.tls {
            TlsMode::Off if info.tls_required => return Err(ClientError::SecureConnReq),
            TlsMode::On | TlsMode::OnWithCertConfig if !info.tls_required => {
                return Err(ClientError::NonSecureConnReq)
            }
            _ => {}
        }
        if info.tls_verify && !self.config.has_client_cert {
            return Err(ClientError::ClientCertReq);
        }
        Ok(())
    }

    fn enqueue_connect(&mut self, payload: &ConnectPayload) -> Result<(), ClientError> {
        let json = serde_json::to_string(payload)
            .map_err(|e| ClientError::BadOptions(format!("encoding CONNECT: {e}")))?;
        let line = format!("CONNECT {json}\r\n");
        self.out.enqueue(ChunkKind::Connect, Bytes::from(line.into_bytes()));
        Ok(())
    }

    fn enqueue_sub_replay(&mut self) {
        for sub in self.subs.iter() {
            let line = match &sub.queue_group {
                Some(q) => format!("SUB {} {} {}\r\n", sub.subject, q, sub.sid),
                None => format!("SUB {} {}\r\n", sub.subject, sub.sid),
            };
            self.out.enqueue(ChunkKind::Sub, Bytes::from(line.into_bytes()));
        }
        if let Some(mux) = &self.mux {
            let line = format!("SUB {} {}\r\n", mux.wildcard_subject(), mux.sid);
            self.out.enqueue(ChunkKind::Sub, Bytes::from(line.into_bytes()));
        }
    }

    async fn flush_socket(&mut self, socket: &mut Socket) -> Result<(), ClientError> {
        if self.out.is_empty() {
            return Ok(());
        }
        let bytes = self.out.drain_coalesced();
        socket
            .write_all(&bytes)
            .await
            .map_err(|e| ClientError::ConnErr(e.to_string()))
    }

    /// CONNECTED: service commands, inbound frames, and timers until the
    /// socket drops or `close()`/`drain()` is requested.
    /// Only genuinely unrecoverable failures (none arise in steady state
    /// today -- they all happen earlier, during the handshake) should give
    /// up the whole client; everything else here maps to `ShouldReconnect::Yes`
    /// and lets `connect_and_serve`'s caller redial. A socket that breaks, a
    /// server that sends malformed framing, or a stale PING count are all
    /// ordinary disconnects from the FSM's point of view (§4.H `close` /
    /// `error` transitions), not fatal errors.
    async fn steady_state_loop(
        &mut self,
        mut socket: Socket,
        mut parser: Parser,
        mut read_buf: BytesMut,
    ) -> Result<ShouldReconnect, ClientError> {
        let mut read_chunk = [0u8; 8192];
        'outer: loop {
            // §4.B cooperative yield: a flood of already-buffered frames
            // (e.g. just after a big read) shouldn't starve the rest of the
            // scheduler. `decode_started` is reset every time we come back
            // here, including right after yielding, so this only triggers
            // on a genuinely long run of back-to-back decodes.
            let decode_started = Instant::now();
            loop {
                match parser.decode(&mut read_buf) {
                    Ok(Some(event)) => {
                        if let Some(outcome) = self.handle_control_event(event) {
                            return Ok(outcome);
                        }
                        if let Some(yield_time) = self.config.yield_time {
                            if decode_started.elapsed() >= yield_time {
                                tokio::task::yield_now().await;
                                continue 'outer;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "protocol error, reconnecting");
                        self.config.event_handler.on_error(&e);
                        return Ok(ShouldReconnect::Yes);
                    }
                }
            }

            let next_deadline = self.timers.keys().next().map(|(at, _)| *at);
            let sleep = async {
                match next_deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;

                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if let Some(outcome) = self.handle_command(cmd, &mut socket).await {
                                return Ok(outcome);
                            }
                        }
                        None => return Ok(ShouldReconnect::No),
                    }
                }

                () = sleep => {
                    if let Some(outcome) = self.fire_due_timers(&mut socket).await {
                        return Ok(outcome);
                    }
                }

                n = socket.read(&mut read_chunk) => {
                    match n {
                        Ok(0) => return Ok(ShouldReconnect::Yes),
                        Ok(n) => read_buf.extend_from_slice(&read_chunk[..n]),
                        Err(e) => {
                            warn!(error = %e, "socket read failed, reconnecting");
                            return Ok(ShouldReconnect::Yes);
                        }
                    }
                }
            }

            if !self.out.is_empty() {
                if let Err(e) = self.flush_socket(&mut socket).await {
                    warn!(error = %e, "socket write failed, reconnecting");
                    return Ok(ShouldReconnect::Yes);
                }
            }
        }
    }

    fn handle_control_event(&mut self, event: ControlEvent) -> Option<ShouldReconnect> {
        match event {
            ControlEvent::Ping => {
                self.out.enqueue(ChunkKind::Pong, Bytes::from_static(b"PONG\r\n"));
            }
            ControlEvent::Pong => {
                self.liveness.on_pong();
                match self.pong_actions.pop_front() {
                    Some(PongAction::None) | None => {}
                    Some(PongAction::Flush(tx)) => {
                        let _ = tx.send(Ok(()));
                    }
                    Some(PongAction::ConnectConfirm { reconnect }) => {
                        self.ever_connected = true;
                        if let Some(tx) = self.first_connect.take() {
                            let _ = tx.send(Ok(()));
                        }
                        if reconnect {
                            self.config.event_handler.on_reconnect();
                        } else {
                            self.config.event_handler.on_connect();
                        }
                    }
                }
            }
            ControlEvent::Ok => {}
            ControlEvent::Err(text) => {
                let lower = text.to_ascii_lowercase();
                if lower.contains("stale connection") {
                    debug!("stale connection reported by server, reconnecting silently");
                    return Some(ShouldReconnect::Yes);
                } else if lower.contains("permissions violation") {
                    self.config
                        .event_handler
                        .on_permission_error(&ClientError::NatsProtocolErr(text));
                } else {
                    self.config
                        .event_handler
                        .on_error(&ClientError::NatsProtocolErr(text));
                    return Some(ShouldReconnect::Yes);
                }
            }
            ControlEvent::Info(json) => match parse_info(&json) {
                Ok(info) => {
                    let current = self
                        .current_url
                        .clone()
                        .unwrap_or_else(|| Url::parse("nats://unknown").expect("static url parses"));
                    let added = self.server_list.reconcile_gossip(&current, &info.connect_urls);
                    if !added.is_empty() {
                        self.config.event_handler.on_servers(&added);
                        self.config.event_handler.on_servers_discovered(&added);
                    }
                }
                Err(e) => warn!(error = %e, "ignoring malformed gossip INFO frame"),
            },
            ControlEvent::Msg { header, payload } => {
                self.deliver_msg(header, payload);
            }
        }
        None
    }

    fn deliver_msg(&mut self, header: MsgHeader, payload: Vec<u8>) {
        if let Some(mux) = &mut self.mux {
            if header.subject.starts_with(mux.root_inbox.as_str()) {
                if let Some(reached_expected) = mux.record_delivery(&header.subject) {
                    let token = header.subject[mux.root_inbox.len() + 1..].to_owned();
                    if let Some(tx) = self.mux_callbacks.get(&token) {
                        let msg = Message {
                            subject: header.subject.clone(),
                            sid: header.sid,
                            reply: header.reply.clone(),
                            payload: Bytes::from(payload),
                        };
                        let _ = tx.send(Ok(msg));
                    }
                    if reached_expected {
                        mux.cancel_by_token(&token);
                        self.mux_callbacks.remove(&token);
                    }
                    return;
                }
            }
        }

        let Some((delivery, cancel_timeout)) = self.subs.record_delivery(header.sid) else {
            return;
        };
        if cancel_timeout {
            self.timers
                .retain(|_, kind| !matches!(kind, TimerKind::SubTimeout { sid } if *sid == header.sid));
        }

        let subject = header.subject.clone();

        if let Some(tx) = self.legacy_request_callbacks.get(&header.sid) {
            if !matches!(delivery, Delivery::UnsubscribeWithoutDelivery) {
                let _ = tx.send(Ok(Message {
                    subject: subject.clone(),
                    sid: header.sid,
                    reply: header.reply.clone(),
                    payload: Bytes::from(payload),
                }));
            }
            if matches!(delivery, Delivery::DeliverThenUnsubscribe | Delivery::UnsubscribeWithoutDelivery) {
                self.subs.remove(header.sid);
                self.legacy_request_callbacks.remove(&header.sid);
                self.shared.num_subs.store(self.subs.len(), Ordering::SeqCst);
                self.config.event_handler.on_unsubscribe(header.sid, &subject);
            }
            return;
        }
        if !matches!(delivery, Delivery::UnsubscribeWithoutDelivery) {
            if let Some(tx) = self.sub_channels.get(&header.sid) {
                let event = if self.config.json {
                    match serde_json::from_slice::<serde_json::Value>(&payload) {
                        Ok(_) => SubEvent::Msg(Message {
                            subject: subject.clone(),
                            sid: header.sid,
                            reply: header.reply.clone(),
                            payload: Bytes::from(payload.clone()),
                        }),
                        Err(e) => SubEvent::JsonError {
                            message: Message {
                                subject: subject.clone(),
                                sid: header.sid,
                                reply: header.reply.clone(),
                                payload: Bytes::from(payload.clone()),
                            },
                            error: e.to_string(),
                        },
                    }
                } else {
                    SubEvent::Msg(Message {
                        subject: subject.clone(),
                        sid: header.sid,
                        reply: header.reply.clone(),
                        payload: Bytes::from(payload),
                    })
                };
                let _ = tx.send(event);
            }
        }

        if matches!(delivery, Delivery::DeliverThenUnsubscribe | Delivery::UnsubscribeWithoutDelivery) {
            self.subs.remove(header.sid);
            self.sub_channels.remove(&header.sid);
            self.shared.num_subs.store(self.subs.len(), Ordering::SeqCst);
            self.config.event_handler.on_unsubscribe(header.sid, &subject);
        }
    }

    async fn fire_due_timers(&mut self, socket: &mut Socket) -> Option<ShouldReconnect> {
        let now = Instant::now();
        let due: Vec<(Instant, u64)> = self.timers.range(..=(now, u64::MAX)).map(|(k, _)| *k).collect();
        for key in due {
            if let Some(kind) = self.timers.remove(&key) {
                if let Some(outcome) = self.fire_timer(kind, socket).await {
                    return Some(outcome);
                }
            }
        }
        None
    }

    /// A stale connection is a disconnect like any other (§4.F, §7: "mapped
    /// to reconnect, not surfaced") -- no `on_error` event, just a silent
    /// redial.
    async fn fire_timer(&mut self, kind: TimerKind, socket: &mut Socket) -> Option<ShouldReconnect> {
        match kind {
            TimerKind::Ping => {
                self.config.event_handler.on_ping_timer();
                match self.liveness.on_ping_timer_fire() {
                    PingOutcome::Stale => {
                        self.config.event_handler.on_ping_count(self.liveness.pout());
                        debug!("stale connection (no pong received), reconnecting silently");
                        return Some(ShouldReconnect::Yes);
                    }
                    PingOutcome::Send => {
                        self.config.event_handler.on_ping_count(self.liveness.pout());
                        self.liveness.push_ping(None);
                        self.pong_actions.push_back(PongAction::None);
                        self.out.enqueue(ChunkKind::Ping, Bytes::from_static(b"PING\r\n"));
                        if let Err(e) = self.flush_socket(socket).await {
                            warn!(error = %e, "socket write failed, reconnecting");
                            return Some(ShouldReconnect::Yes);
                        }
                        self.schedule(Instant::now() + self.config.ping_interval, TimerKind::Ping);
                    }
                }
            }
            TimerKind::RequestTimeout { token } => {
                if let Some(mux) = &mut self.mux {
                    if mux.cancel_by_token(&token).is_some() {
                        if let Some(tx) = self.mux_callbacks.remove(&token) {
                            let _ = tx.send(Err(ClientError::ReqTimeout));
                        }
                    }
                }
            }
            TimerKind::LegacyRequestTimeout { sid } => {
                if let Some(tx) = self.legacy_request_callbacks.remove(&sid) {
                    let _ = tx.send(Err(ClientError::ReqTimeout));
                    if self.subs.remove(sid).is_some() {
                        self.shared.num_subs.store(self.subs.len(), Ordering::SeqCst);
                        self.out
                            .enqueue(ChunkKind::Unsub, Bytes::from(format!("UNSUB {sid}\r\n").into_bytes()));
                    }
                }
            }
            TimerKind::SubTimeout { sid } => {
                let fire = self
                    .subs
                    .get(sid)
                    .and_then(|s| s.expected_for_timeout.map(|exp| s.received < exp))
                    .unwrap_or(false);
                if fire {
                    if let Some(tx) = self.sub_channels.get(&sid) {
                        let _ = tx.send(SubEvent::Timeout);
                    }
                    self.subs.remove(sid);
                    self.sub_channels.remove(&sid);
                    self.shared.num_subs.store(self.subs.len(), Ordering::SeqCst);
                }
            }
        }
        None
    }

    async fn handle_command(&mut self, cmd: Command, socket: &mut Socket) -> Option<ShouldReconnect> {
        match cmd {
            Command::Publish { subject, reply, payload } => {
                if validate_subject(&subject).is_err() {
                    warn!(%subject, "publish rejected: bad subject");
                    return None;
                }
                let line = match &reply {
                    Some(r) => format!("PUB {subject} {r} {}\r\n", payload.len()),
                    None => format!("PUB {subject} {}\r\n", payload.len()),
                };
                self.out.enqueue(ChunkKind::Pub, framed(&line, &payload));
            }
            Command::Subscribe { subject, queue_group, respond } => {
                let sid = self.subs.insert(subject.clone(), queue_group.clone());
                let (tx, rx) = mpsc::unbounded_channel();
                self.sub_channels.insert(sid, tx);
                self.shared.num_subs.store(self.subs.len(), Ordering::SeqCst);

                let line = match &queue_group {
                    Some(q) => format!("SUB {subject} {q} {sid}\r\n"),
                    None => format!("SUB {subject} {sid}\r\n"),
                };
                self.out.enqueue(ChunkKind::Sub, Bytes::from(line.into_bytes()));
                self.config.event_handler.on_subscribe(sid, &subject, queue_group.as_deref());
                let _ = respond.send((sid, rx));
            }
            Command::Unsubscribe { sid, max } => {
                if max.is_none() {
                    if let Some(sub) = self.subs.remove(sid) {
                        self.sub_channels.remove(&sid);
                        self.shared.num_subs.store(self.subs.len(), Ordering::SeqCst);
                        self.out
                            .enqueue(ChunkKind::Unsub, Bytes::from(format!("UNSUB {sid}\r\n").into_bytes()));
                        self.config.event_handler.on_unsubscribe(sid, &sub.subject);
                    }
                } else {
                    let max = max.expect("checked above");
                    self.subs.set_max(sid, max);
                    self.out
                        .enqueue(ChunkKind::Unsub, Bytes::from(format!("UNSUB {sid} {max}\r\n").into_bytes()));
                }
            }
            Command::SubTimeout { sid, expected, after } => {
                self.subs.set_timeout_expected(sid, expected);
                self.schedule(Instant::now() + after, TimerKind::SubTimeout { sid });
            }
            Command::Request { subject, payload, expected, timeout, respond, id_reply } => {
                if self.config.use_old_request_style {
                    let _ = id_reply.send(0);
                    self.send_legacy_request(subject, payload, expected, timeout, respond);
                } else {
                    if self.mux.is_none() {
                        let sid = self.subs.reserve_sid();
                        self.mux = Some(MuxRoot::new(sid));
                        let mux = self.mux.as_ref().expect("just created");
                        let line = format!("SUB {} {}\r\n", mux.wildcard_subject(), mux.sid);
                        self.out.enqueue(ChunkKind::Sub, Bytes::from(line.into_bytes()));
                    }
                    let mux = self.mux.as_mut().expect("just created above");
                    let (id, inbox) = mux.add_request(expected);
                    let token = inbox[mux.root_inbox.len() + 1..].to_owned();
                    self.mux_callbacks.insert(token.clone(), respond);
                    let _ = id_reply.send(id);

                    if let Some(dur) = timeout {
                        self.schedule(Instant::now() + dur, TimerKind::RequestTimeout { token });
                    }

                    let line = format!("PUB {subject} {inbox} {}\r\n", payload.len());
                    self.out.enqueue(ChunkKind::Pub, framed(&line, &payload));
                }
            }
            Command::CancelRequest { id } => {
                if let Some(mux) = &mut self.mux {
                    if let Some(request) = mux.cancel_by_id(id) {
                        self.mux_callbacks.remove(&request.token);
                    }
                }
            }
            Command::Flush { respond } => {
                self.liveness.push_ping(None);
                self.pong_actions.push_back(PongAction::Flush(respond));
                self.out.enqueue(ChunkKind::Ping, Bytes::from_static(b"PING\r\n"));
            }
            Command::Drain { respond } => {
                self.draining = true;
                let sids: Vec<u64> = self.subs.iter().map(|s| s.sid).collect();
                for sid in sids {
                    self.out
                        .enqueue(ChunkKind::Unsub, Bytes::from(format!("UNSUB {sid}\r\n").into_bytes()));
                }
                let _ = respond.send(Ok(()));
            }
            Command::Close => {
                return Some(ShouldReconnect::No);
            }
        }
        if !self.out.is_empty() {
            if let Err(e) = self.flush_socket(socket).await {
                warn!(error = %e, "socket write failed, reconnecting");
                return Some(ShouldReconnect::Yes);
            }
        }
        None
    }

    /// `useOldRequestStyle` (§4.E): a fresh subscription per request rather
    /// than the shared mux wildcard, auto-unsubscribed after `expected`
    /// replies (default 1, matching `requestOne`). Drawn from the same sid
    /// space as every other subscription (§3 invariant), and replayed like
    /// any other sub on reconnect since it lives in `self.subs`.
    fn send_legacy_request(
        &mut self,
        subject: String,
        payload: Bytes,
        expected: Option<u64>,
        timeout: Option<Duration>,
        respond: mpsc::UnboundedSender<Result<Message, ClientError>>,
    ) {
        let inbox = format!("_INBOX.{}", crate::nuid::next());
        let max = expected.unwrap_or(1);
        let sid = self.subs.insert(inbox.clone(), None);
        self.subs.set_max(sid, max);
        self.legacy_request_callbacks.insert(sid, respond);

        self.out
            .enqueue(ChunkKind::Sub, Bytes::from(format!("SUB {inbox} {sid}\r\n").into_bytes()));
        self.out
            .enqueue(ChunkKind::Unsub, Bytes::from(format!("UNSUB {sid} {max}\r\n").into_bytes()));

        if let Some(dur) = timeout {
            self.schedule(Instant::now() + dur, TimerKind::LegacyRequestTimeout { sid });
        }

        let line = format!("PUB {subject} {inbox} {}\r\n", payload.len());
        self.out.enqueue(ChunkKind::Pub, framed(&line, &payload));
    }
}

fn framed(line: &str, payload: &Bytes) -> Bytes {
    let mut bytes = BytesMut::with_capacity(line.len() + payload.len() + 2);
    bytes.extend_from_slice(line.as_bytes());
    bytes.extend_from_slice(payload);
    bytes.extend_from_slice(b"\r\n");
    bytes.freeze()
}

fn parse_info(json: &str) -> Result<ServerInfo, ClientError> {
    serde_json::from_str(json).map_err(|e| ClientError::NatsProtocolErr(format!("bad INFO json: {e}")))
}

fn validate_subject(subject: &str) -> Result<(), ClientError> {
    if subject.is_empty() || subject.chars().any(char::is_whitespace) {
        return Err(ClientError::BadSubject(subject.to_owned()));
    }
    Ok(())
}
