// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Control-socket client used by the facade in remote mode.
//!
//! One long-lived connection carries request/reply traffic, serialized
//! under a mutex (the protocol is one request, one reply). Each subscribe
//! opens its own connection, because a Subscribe upgrades the connection
//! to a one-way stream. When the control connection drops, in-flight
//! operations fail with `closed` and a background task reconnects with
//! bounded exponential backoff; nothing is buffered or retried here.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use roostd::error::{ErrorKind, SessionError};
use roostd::wire::{
    self, BareError, EofReason, HelloFrame, IdArgs, OkBody, Op, Reply, ReplyBody, Request, Role,
};

const BACKOFF_FLOOR: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(10);

struct Conn {
    rd: OwnedReadHalf,
    wr: OwnedWriteHalf,
}

/// Client side of the supervisor's control socket.
pub struct ControlClient {
    socket: PathBuf,
    build: String,
    conn: tokio::sync::Mutex<Option<Conn>>,
    corr: AtomicU64,
    reconnecting: AtomicBool,
}

impl ControlClient {
    /// Connect and complete the fingerprint handshake.
    ///
    /// Fails with `supervisor_unavailable` when nothing answers on the
    /// socket and `incompatible_build` when the daemon refuses our build.
    pub async fn connect(socket: &Path, build: &str) -> Result<Arc<Self>, SessionError> {
        let conn = Self::open(socket, build).await?;
        Ok(Arc::new(Self {
            socket: socket.to_path_buf(),
            build: build.to_owned(),
            conn: tokio::sync::Mutex::new(Some(conn)),
            corr: AtomicU64::new(1),
            reconnecting: AtomicBool::new(false),
        }))
    }

    pub fn build(&self) -> &str {
        &self.build
    }

    async fn open(socket: &Path, build: &str) -> Result<Conn, SessionError> {
        let stream = UnixStream::connect(socket).await.map_err(|e| {
            SessionError::supervisor_unavailable(format!(
                "connect {}: {e}",
                socket.display()
            ))
        })?;
        let (mut rd, mut wr) = stream.into_split();

        wire::write_frame(&mut wr, &HelloFrame::new(Role::Client, build))
            .await
            .map_err(|e| SessionError::supervisor_unavailable(format!("hello send: {e}")))?;

        // The daemon answers with its own hello, or a bare error frame when
        // it refuses the handshake.
        let value = wire::read_frame_value(&mut rd)
            .await
            .map_err(|e| SessionError::supervisor_unavailable(format!("hello recv: {e}")))?;
        if let Ok(refusal) = serde_json::from_value::<BareError>(value.clone()) {
            let mut err = SessionError::from(refusal.error.clone());
            if err.kind == ErrorKind::IncompatibleBuild {
                err = SessionError::incompatible_build(
                    refusal.error.build.as_deref().unwrap_or("unknown"),
                );
            }
            return Err(err);
        }
        let hello: HelloFrame = serde_json::from_value(value)
            .map_err(|e| SessionError::supervisor_unavailable(format!("bad hello: {e}")))?;
        if hello.hello.role != Role::Daemon {
            return Err(SessionError::supervisor_unavailable("peer is not a daemon"));
        }
        Ok(Conn { rd, wr })
    }

    /// One request, one reply, on the shared control connection.
    pub async fn request(self: &Arc<Self>, op: Op) -> Result<OkBody, SessionError> {
        let mut guard = self.conn.lock().await;
        let Some(conn) = guard.as_mut() else {
            return Err(SessionError::closed());
        };

        let corr = self.corr.fetch_add(1, Ordering::Relaxed);
        match round_trip(conn, corr, op).await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(remote)) => Err(remote),
            Err(e) => {
                debug!("control connection lost: {e}");
                *guard = None;
                drop(guard);
                self.spawn_reconnect();
                Err(SessionError::closed())
            }
        }
    }

    /// Open a dedicated streaming connection for one subscription.
    ///
    /// Always yields a stream when the wire cooperates; a session that is
    /// gone or already ended shows up as an immediately-closed stream.
    pub async fn subscribe(self: &Arc<Self>, id: &str) -> Result<RemoteStream, SessionError> {
        let mut conn = Self::open(&self.socket, &self.build).await?;
        let corr = self.corr.fetch_add(1, Ordering::Relaxed);
        wire::write_frame(
            &mut conn.wr,
            &Request { id: corr, op: Op::Subscribe(IdArgs { id: id.to_owned() }) },
        )
        .await
        .map_err(|_| SessionError::closed())?;

        let (tx, rx) = mpsc::channel(roostd::session::SUBSCRIBER_QUEUE);
        let cancel = CancellationToken::new();
        let reason: Arc<parking_lot::Mutex<Option<EofReason>>> =
            Arc::new(parking_lot::Mutex::new(None));

        let pump_cancel = cancel.clone();
        let pump_reason = Arc::clone(&reason);
        tokio::spawn(async move {
            let Conn { mut rd, mut wr } = conn;
            loop {
                tokio::select! {
                    _ = pump_cancel.cancelled() => {
                        let unsub = Request { id: corr + 1, op: Op::Unsubscribe };
                        let _ = wire::write_frame(&mut wr, &unsub).await;
                        return;
                    }
                    frame = wire::read_frame::<_, Reply>(&mut rd) => {
                        let reply = match frame {
                            Ok(reply) => reply,
                            Err(e) => {
                                debug!("subscribe stream closed: {e}");
                                return;
                            }
                        };
                        match reply.body {
                            ReplyBody::Stream(frame) if frame.is_eof() => {
                                *pump_reason.lock() = frame.reason;
                                return;
                            }
                            ReplyBody::Stream(frame) => {
                                let Some(ref b64) = frame.data else { continue };
                                let Ok(data) = wire::decode_data(b64) else { return };
                                if tx.send(Bytes::from(data)).await.is_err() {
                                    return;
                                }
                            }
                            // A refusal (e.g. not_found) ends the stream
                            // before it begins: the receiver just sees a
                            // closed channel.
                            ReplyBody::Error(e) => {
                                debug!("subscribe refused: {}", e.kind);
                                return;
                            }
                            ReplyBody::Ok(_) => {}
                        }
                    }
                }
            }
        });

        Ok(RemoteStream { rx, cancel, reason })
    }

    /// Background reconnect with 1 s → 10 s exponential backoff.
    fn spawn_reconnect(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::AcqRel) {
            return;
        }
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut backoff = BACKOFF_FLOOR;
            loop {
                tokio::time::sleep(backoff).await;
                match Self::open(&client.socket, &client.build).await {
                    Ok(conn) => {
                        *client.conn.lock().await = Some(conn);
                        client.reconnecting.store(false, Ordering::Release);
                        info!("control connection restored");
                        return;
                    }
                    Err(e) => {
                        warn!("control reconnect failed: {e}");
                        backoff = (backoff * 2).min(BACKOFF_CAP);
                    }
                }
            }
        });
    }
}

/// Returns `Err` for transport failures (connection is dead) and
/// `Ok(Err)` for errors the daemon reported.
async fn round_trip(
    conn: &mut Conn,
    corr: u64,
    op: Op,
) -> io::Result<Result<OkBody, SessionError>> {
    wire::write_frame(&mut conn.wr, &Request { id: corr, op }).await?;
    loop {
        let value = wire::read_frame_value(&mut conn.rd).await?;
        // Protocol-level refusals (unknown_op) arrive without an id.
        if value.get("id").is_none() {
            if let Ok(bare) = serde_json::from_value::<BareError>(value) {
                return Ok(Err(bare.error.into()));
            }
            return Err(io::Error::new(io::ErrorKind::InvalidData, "frame without id"));
        }
        let reply: Reply = serde_json::from_value(value)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if reply.id != corr {
            // Stale frame from an earlier subscription teardown; skip it.
            continue;
        }
        return match reply.body {
            ReplyBody::Ok(body) => Ok(Ok(body)),
            ReplyBody::Error(e) => Ok(Err(e.into())),
            ReplyBody::Stream(_) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "stream frame on the control connection",
            )),
        };
    }
}

/// Live output stream for one remote session.
pub struct RemoteStream {
    rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
    reason: Arc<parking_lot::Mutex<Option<EofReason>>>,
}

impl RemoteStream {
    /// Next payload; `None` once the stream ended.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Why the stream ended, once it has.
    pub fn eof_reason(&self) -> Option<EofReason> {
        *self.reason.lock()
    }

    /// End the subscription; idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for RemoteStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
