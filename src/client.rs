//! §4.I Public API: the handles applications actually hold. Everything
//! here is a thin, cloneable façade over the `Command` channel into the
//! FSM task (§5) -- no field on `Client` or `Subscription` is ever mutated
//! outside that task.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::error::ClientError;
use crate::fsm::{Command, Fsm, Shared};
use crate::options::ConnectOptions;
use crate::subs::Message;

pub use crate::fsm::SubEvent;

/// A live connection. Cloning shares the same underlying FSM task; closing
/// through any clone closes them all (§4.I: `close()` is idempotent and
/// affects every handle).
#[derive(Clone)]
pub struct Client {
    cmd_tx: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl Client {
    /// Build the FSM from `options`, spawn it, and wait for either the
    /// first successful CONNECTED transition or a fatal configuration
    /// error -- mirroring the original's "connect resolves once" contract
    /// without blocking on every subsequent reconnect.
    pub async fn connect(options: ConnectOptions) -> Result<Client, ClientError> {
        let config = options.build()?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());
        let (first_connect_tx, first_connect_rx) = oneshot::channel();

        let fsm = Fsm::new(config, cmd_rx, shared.clone(), first_connect_tx)?;
        tokio::spawn(fsm.run());

        match first_connect_rx.await {
            Ok(Ok(())) => Ok(Client { cmd_tx, shared }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ClientError::ConnErr("connection task ended before connecting".to_owned())),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn num_subscriptions(&self) -> usize {
        self.shared.num_subs.load(Ordering::SeqCst)
    }

    pub fn publish(&self, subject: impl Into<String>, payload: impl Into<Bytes>) -> Result<(), ClientError> {
        self.send(Command::Publish {
            subject: subject.into(),
            reply: None,
            payload: payload.into(),
        })
    }

    pub fn publish_with_reply(
        &self,
        subject: impl Into<String>,
        reply: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Result<(), ClientError> {
        self.send(Command::Publish {
            subject: subject.into(),
            reply: Some(reply.into()),
            payload: payload.into(),
        })
    }

    pub async fn subscribe(&self, subject: impl Into<String>) -> Result<Subscription, ClientError> {
        self.subscribe_inner(subject.into(), None).await
    }

    pub async fn queue_subscribe(
        &self,
        subject: impl Into<String>,
        queue_group: impl Into<String>,
    ) -> Result<Subscription, ClientError> {
        self.subscribe_inner(subject.into(), Some(queue_group.into())).await
    }

    async fn subscribe_inner(&self, subject: String, queue_group: Option<String>) -> Result<Subscription, ClientError> {
        let (respond, reply) = oneshot::channel();
        self.send(Command::Subscribe { subject, queue_group, respond })?;
        let (sid, rx) = reply
            .await
            .map_err(|_| ClientError::ConnClosed)?;
        Ok(Subscription {
            sid,
            rx,
            cmd_tx: self.cmd_tx.clone(),
        })
    }

    /// Single-reply request (§4.E). Resolves with the first matching reply,
    /// or `ReqTimeout` if `timeout` elapses first.
    pub async fn request(
        &self,
        subject: impl Into<String>,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Message, ClientError> {
        let (respond, mut rx) = mpsc::unbounded_channel();
        let (id_reply, id_rx) = oneshot::channel();
        self.send(Command::Request {
            subject: subject.into(),
            payload: payload.into(),
            expected: Some(1),
            timeout: Some(timeout),
            respond,
            id_reply,
        })?;
        // Holds the mux id alive so a caller that wraps this call in an
        // external timeout (dropping the future early) still tells the FSM
        // to drop its requestMap entry instead of leaking it (§3).
        let _guard = id_rx.await.ok().map(|id| RequestGuard { id, cmd_tx: self.cmd_tx.clone() });
        rx.recv().await.ok_or(ClientError::ConnClosed)?
    }

    /// Many-reply request (§9 REDESIGN FLAGS keeps this as an explicit,
    /// separate method rather than an `{max}` option bolted onto the common
    /// case). The stream ends when `expected` replies have arrived, the
    /// timeout elapses, or the returned handle is dropped.
    pub fn request_multi(
        &self,
        subject: impl Into<String>,
        payload: impl Into<Bytes>,
        expected: Option<u64>,
        timeout: Option<Duration>,
    ) -> Result<RequestMulti, ClientError> {
        let (respond, rx) = mpsc::unbounded_channel();
        let (id_reply, id_rx) = oneshot::channel();
        self.send(Command::Request {
            subject: subject.into(),
            payload: payload.into(),
            expected,
            timeout,
            respond,
            id_reply,
        })?;
        Ok(RequestMulti {
            rx,
            id_rx: Some(id_rx),
            cmd_tx: self.cmd_tx.clone(),
        })
    }

    /// Round-trips a PING/PONG through the server to confirm every command
    /// enqueued before this call has been written and acknowledged.
    pub async fn flush(&self) -> Result<(), ClientError> {
        let (respond, reply) = oneshot::channel();
        self.send(Command::Flush { respond })?;
        reply.await.map_err(|_| ClientError::ConnClosed)?
    }

    /// Unsubscribe everything, flush, then close (§1.2 supplemented
    /// feature). Does not wait for in-flight messages beyond that flush.
    pub async fn drain(&self) -> Result<(), ClientError> {
        let (respond, reply) = oneshot::channel();
        self.send(Command::Drain { respond })?;
        reply.await.map_err(|_| ClientError::ConnClosed)??;
        self.flush().await?;
        self.close();
        Ok(())
    }

    /// Idempotent: additional calls after the first are no-ops.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close);
    }

    fn send(&self, cmd: Command) -> Result<(), ClientError> {
        self.cmd_tx.send(cmd).map_err(|_| ClientError::ConnClosed)
    }
}

/// A single active subscription. Dropping it unsubscribes (§4.D): no
/// explicit `unsubscribe()` call is required, matching the teacher's
/// guard-object style for other per-call resources.
pub struct Subscription {
    sid: u64,
    rx: mpsc::UnboundedReceiver<SubEvent>,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl Subscription {
    pub fn sid(&self) -> u64 {
        self.sid
    }

    pub async fn next(&mut self) -> Option<SubEvent> {
        self.rx.recv().await
    }

    /// Auto-unsubscribe after `max` total deliveries (§4.D).
    pub fn unsubscribe_after(&self, max: u64) {
        let _ = self.cmd_tx.send(Command::Unsubscribe {
            sid: self.sid,
            max: Some(max),
        });
    }

    /// Fire `SubEvent::Timeout` once if fewer than `expected` messages have
    /// arrived within `after`.
    pub fn timeout(&self, after: Duration, expected: u64) {
        let _ = self.cmd_tx.send(Command::SubTimeout {
            sid: self.sid,
            expected,
            after,
        });
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Command::Unsubscribe { sid: self.sid, max: None });
    }
}

/// Holds a mux request's negative id alive so dropping the request future
/// early (an external `tokio::time::timeout`, or the caller losing interest)
/// still tells the FSM to drop its requestMap entry (§3) instead of leaking
/// it until `expected` or the request's own timeout fires.
struct RequestGuard {
    id: i64,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Command::CancelRequest { id: self.id });
    }
}

/// Handle for `request_multi` (§4.E many-reply requests).
pub struct RequestMulti {
    rx: mpsc::UnboundedReceiver<Result<Message, ClientError>>,
    id_rx: Option<oneshot::Receiver<i64>>,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl RequestMulti {
    pub async fn next(&mut self) -> Option<Result<Message, ClientError>> {
        self.rx.recv().await
    }
}

impl Drop for RequestMulti {
    fn drop(&mut self) {
        if let Some(id_rx) = self.id_rx.take() {
            let cmd_tx = self.cmd_tx.clone();
            tokio::spawn(async move {
                if let Ok(id) = id_rx.await {
                    let _ = cmd_tx.send(Command::CancelRequest { id });
                }
            });
        }
    }
}

fn _assert_send_sync() {
    fn is_send_sync<T: Send + Sync>() {}
    is_send_sync::<Client>();
    is_send_sync::<Command>();
}
