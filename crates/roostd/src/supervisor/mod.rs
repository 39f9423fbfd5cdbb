// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Control-socket server: accepts client connections, gates them on the
//! build fingerprint, and dispatches protocol requests onto the registry.

pub mod daemon;

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ErrorKind;
use crate::registry::Registry;
use crate::session::{Session, SessionSpec, Subscription};
use crate::wire::{
    self, BareError, EofReason, HelloFrame, OkBody, Op, Reply, ReplyBody, Request, Role,
    StreamFrame, WireError, PROTO_VERSION,
};

/// Read deadline for the handshake frame; established streams have none.
pub const HELLO_DEADLINE: Duration = Duration::from_secs(5);

/// Depth of the per-connection outbound frame queue. When it fills, stream
/// forwarders block on the socket, which in turn surfaces as payload drops
/// at the session's subscriber queue rather than here.
const OUT_QUEUE: usize = 64;

/// The supervisor's control-plane server.
pub struct Supervisor {
    registry: Arc<Registry>,
    build: String,
    shutdown: CancellationToken,
    connections: AtomicUsize,
}

impl Supervisor {
    pub fn new(registry: Arc<Registry>, build: String, shutdown: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            registry,
            build,
            shutdown,
            connections: AtomicUsize::new(0),
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn build(&self) -> &str {
        &self.build
    }

    /// Currently accepted control connections.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Accept control connections until shutdown, then drain handlers.
    ///
    /// Per-connection failures (framing, truncated JSON) close only that
    /// connection; sessions are never affected.
    pub async fn serve(self: Arc<Self>, listener: UnixListener) {
        let mut handlers = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let sup = Arc::clone(&self);
                        handlers.spawn(async move { sup.handle_conn(stream).await });
                    }
                    Err(e) => {
                        warn!("control accept error: {e}");
                    }
                },
                // Reap finished handlers so the set stays bounded.
                Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
            }
        }
        // Bounded drain: a peer that stopped reading must not be able to
        // wedge the daemon's exit.
        let _ = timeout(Duration::from_secs(5), async {
            while handlers.join_next().await.is_some() {}
        })
        .await;
    }

    async fn handle_conn(self: Arc<Self>, stream: UnixStream) {
        self.connections.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.conn_loop(stream).await {
            debug!("control connection closed: {e}");
        }
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }

    async fn conn_loop(&self, stream: UnixStream) -> io::Result<()> {
        let (mut rd, mut wr) = stream.into_split();

        if !self.handshake(&mut rd, &mut wr).await? {
            return Ok(());
        }

        // All post-handshake frames leave through one writer task so
        // replies and stream frames never interleave mid-frame.
        let (out_tx, mut out_rx) = mpsc::channel::<Value>(OUT_QUEUE);
        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if wire::write_frame(&mut wr, &frame).await.is_err() {
                    break;
                }
            }
        });

        let mut active_stream: Option<ActiveStream> = None;
        let mut graceful = false;
        let result = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    graceful = true;
                    break Ok(());
                }
                frame = wire::read_frame_value(&mut rd) => {
                    let value = match frame {
                        Ok(value) => value,
                        // Normal close from the peer.
                        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break Ok(()),
                        Err(e) => break Err(e),
                    };
                    if !self.dispatch(value, &out_tx, &mut active_stream).await {
                        break Ok(());
                    }
                }
            }
        };

        // On graceful shutdown the forwarder's own shutdown branch emits the
        // terminal supervisor_shutdown frame; cancelling here would race it.
        if let Some(stream) = active_stream.take() {
            if !graceful {
                stream.cancel.cancel();
            }
        }
        drop(out_tx);
        let _ = writer.await;
        result
    }

    /// Exchange hello frames. Returns false when the connection was
    /// politely refused (role or fingerprint mismatch).
    async fn handshake(
        &self,
        rd: &mut OwnedReadHalf,
        wr: &mut OwnedWriteHalf,
    ) -> io::Result<bool> {
        let hello: HelloFrame = match timeout(HELLO_DEADLINE, wire::read_frame(rd)).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "handshake deadline"));
            }
        };

        if hello.hello.role != Role::Client {
            let refusal = BareError {
                error: WireError {
                    kind: ErrorKind::Internal,
                    msg: Some("only client hellos are accepted".to_owned()),
                    build: None,
                },
            };
            wire::write_frame(wr, &refusal).await?;
            return Ok(false);
        }

        if hello.hello.build != self.build || hello.hello.proto != PROTO_VERSION {
            debug!(
                theirs = %hello.hello.build,
                ours = %self.build,
                "refusing incompatible client"
            );
            let refusal = BareError {
                error: WireError {
                    kind: ErrorKind::IncompatibleBuild,
                    msg: None,
                    build: Some(self.build.clone()),
                },
            };
            wire::write_frame(wr, &refusal).await?;
            return Ok(false);
        }

        wire::write_frame(wr, &HelloFrame::new(Role::Daemon, &self.build)).await?;
        Ok(true)
    }

    /// Handle one request frame. Returns false to close the connection.
    async fn dispatch(
        &self,
        value: Value,
        out_tx: &mpsc::Sender<Value>,
        active_stream: &mut Option<ActiveStream>,
    ) -> bool {
        let req: Request = match serde_json::from_value(value.clone()) {
            Ok(req) => req,
            Err(_) => {
                // A verb we have never heard of gets a protocol-level error;
                // a known verb with malformed args closes the connection.
                let op = value.get("op").and_then(Value::as_str);
                if op.is_some_and(|op| !KNOWN_OPS.contains(&op)) {
                    let unknown = BareError {
                        error: WireError { kind: ErrorKind::UnknownOp, msg: None, build: None },
                    };
                    return send(out_tx, &unknown).await;
                }
                return false;
            }
        };

        let corr = req.id;
        let body = match req.op {
            Op::Start(args) => {
                let spec = SessionSpec {
                    id: args.id,
                    argv: args.argv,
                    cwd: args.cwd.into(),
                    env: args.env.into_iter().collect(),
                    rows: args.rows,
                    cols: args.cols,
                };
                match self.registry.start(spec) {
                    Ok(session) => ReplyBody::Ok(OkBody::Started { pid: session.pid() }),
                    Err(e) => ReplyBody::Error(e.into()),
                }
            }
            Op::Write(args) => match wire::decode_data(&args.data) {
                Ok(data) => match self.registry.write(&args.id, &data).await {
                    Ok(n) => ReplyBody::Ok(OkBody::Written { n }),
                    Err(e) => ReplyBody::Error(e.into()),
                },
                Err(e) => ReplyBody::Error(e.into()),
            },
            Op::Resize(args) => match self.registry.resize(&args.id, args.rows, args.cols) {
                Ok(()) => ReplyBody::Ok(OkBody::Empty {}),
                Err(e) => ReplyBody::Error(e.into()),
            },
            Op::Stop(args) => match self.registry.stop(&args.id) {
                Ok(()) => ReplyBody::Ok(OkBody::Empty {}),
                Err(e) => ReplyBody::Error(e.into()),
            },
            Op::List => ReplyBody::Ok(OkBody::Sessions { sessions: self.registry.list() }),
            Op::Get(args) => match self.registry.info(&args.id) {
                Ok(info) => ReplyBody::Ok(OkBody::Info(info)),
                Err(e) => ReplyBody::Error(e.into()),
            },
            Op::Tail(args) => {
                match self.registry.tail(&args.id, args.max.unwrap_or(usize::MAX)) {
                    Ok(data) => ReplyBody::Ok(OkBody::Data { data: wire::encode_data(&data) }),
                    Err(e) => ReplyBody::Error(e.into()),
                }
            }
            Op::Subscribe(args) => {
                if active_stream.is_some() {
                    ReplyBody::Error(WireError {
                        kind: ErrorKind::Internal,
                        msg: Some("connection already streaming".to_owned()),
                        build: None,
                    })
                } else {
                    match self.registry.get(&args.id) {
                        Some(session) => {
                            debug!(session = %args.id, corr, "subscribe stream opened");
                            let sub = session.subscribe();
                            let cancel = CancellationToken::new();
                            spawn_stream_forwarder(
                                corr,
                                session,
                                sub,
                                out_tx.clone(),
                                cancel.clone(),
                                self.shutdown.clone(),
                            );
                            *active_stream = Some(ActiveStream { cancel });
                            // The stream frames themselves are the reply.
                            return true;
                        }
                        None => {
                            ReplyBody::Error(crate::error::SessionError::not_found(&args.id).into())
                        }
                    }
                }
            }
            Op::Unsubscribe => {
                if let Some(stream) = active_stream.take() {
                    stream.cancel.cancel();
                }
                ReplyBody::Ok(OkBody::Empty {})
            }
        };

        send(out_tx, &Reply { id: corr, body }).await
    }
}

const KNOWN_OPS: [&str; 9] = [
    "start",
    "write",
    "resize",
    "stop",
    "list",
    "get",
    "tail",
    "subscribe",
    "unsubscribe",
];

struct ActiveStream {
    cancel: CancellationToken,
}

/// Serialize a frame into the connection's writer queue.
async fn send(out_tx: &mpsc::Sender<Value>, frame: &impl Serialize) -> bool {
    match serde_json::to_value(frame) {
        Ok(value) => out_tx.send(value).await.is_ok(),
        Err(e) => {
            warn!("failed to serialize control frame: {e}");
            false
        }
    }
}

/// Pump one subscription into the connection writer as stream frames.
///
/// Ends with an eof frame when the session ends (reason from its exit
/// status) or the supervisor shuts down; a cancelled stream (unsubscribe
/// or connection close) ends silently.
fn spawn_stream_forwarder(
    corr: u64,
    session: Arc<Session>,
    mut sub: Subscription,
    out_tx: mpsc::Sender<Value>,
    cancel: CancellationToken,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut seq = 0u64;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = shutdown.cancelled() => {
                    seq += 1;
                    let frame = Reply {
                        id: corr,
                        body: ReplyBody::Stream(StreamFrame::eof(seq, EofReason::SupervisorShutdown)),
                    };
                    let _ = send(&out_tx, &frame).await;
                    return;
                }
                payload = sub.recv() => match payload {
                    Some(bytes) => {
                        seq += 1;
                        let frame = Reply {
                            id: corr,
                            body: ReplyBody::Stream(StreamFrame::data(seq, &bytes)),
                        };
                        if !send(&out_tx, &frame).await {
                            return;
                        }
                    }
                    None => {
                        seq += 1;
                        let reason = session
                            .exit_status()
                            .map(EofReason::from)
                            .unwrap_or(EofReason::Exited);
                        let frame = Reply {
                            id: corr,
                            body: ReplyBody::Stream(StreamFrame::eof(seq, reason)),
                        };
                        let _ = send(&out_tx, &frame).await;
                        return;
                    }
                }
            }
        }
    });
}
