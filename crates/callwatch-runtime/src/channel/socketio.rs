//! Socket.IO websocket transport.
//!
//! Each link runs one background task: connect, Engine.IO handshake,
//! Socket.IO connect with the bearer token, replay the business room, then
//! read frames until the socket drops. Failures are retried forever with
//! exponential backoff; the backoff resets once a connection is accepted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use callwatch_core::protocol::{
    self, ENGINE_QUERY, EnginePacket, SocketPacket, decode_frame, encode_connect, encode_pong,
};
use callwatch_core::{BusinessId, ClientCommand, EscalationEvent, ServerEvent, SessionCredential};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::{EventSink, Transport, TransportLink};
use crate::error::ChannelError;

/// How long to wait for the Engine.IO open packet and the Socket.IO connect reply.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DEBUG_LOG_THRESHOLD: u32 = 10;

#[derive(Debug, Clone)]
pub struct SocketIoConfig {
    /// Full websocket url including the Engine.IO query.
    pub url: String,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl SocketIoConfig {
    pub fn new(
        socket_url: &str,
        socket_path: &str,
        initial_backoff: Duration,
        max_backoff: Duration,
    ) -> Result<Self, ChannelError> {
        Ok(Self {
            url: channel_url(socket_url, socket_path)?,
            initial_backoff,
            max_backoff,
        })
    }
}

/// `http(s)://host` + `/path` -> `ws(s)://host/path/?EIO=4&transport=websocket`.
pub fn channel_url(socket_url: &str, socket_path: &str) -> Result<String, ChannelError> {
    let mut url = Url::parse(socket_url).map_err(|e| ChannelError::Url(format!("{socket_url}: {e}")))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(ChannelError::Url(format!("unsupported scheme {other:?}"))),
    };
    url.set_scheme(scheme)
        .map_err(|()| ChannelError::Url(format!("cannot use scheme {scheme} for {socket_url}")))?;
    url.set_path(&format!("{}/", socket_path.trim_end_matches('/')));
    url.set_query(Some(ENGINE_QUERY));
    Ok(url.to_string())
}

pub struct SocketIoTransport {
    config: SocketIoConfig,
}

impl SocketIoTransport {
    pub fn new(config: SocketIoConfig) -> Self {
        Self { config }
    }
}

impl Transport for SocketIoTransport {
    fn open(&self, credential: &SessionCredential, sink: EventSink) -> Box<dyn TransportLink> {
        let shared = Arc::new(LinkShared::default());
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let task = LinkTask {
            config: self.config.clone(),
            credential: credential.clone(),
            sink,
            shared: Arc::clone(&shared),
            cancel: cancel.clone(),
        };
        tokio::spawn(task.run(cmd_rx));

        Box::new(SocketIoLink {
            shared,
            cmd_tx,
            cancel,
        })
    }
}

#[derive(Default)]
struct LinkShared {
    connected: AtomicBool,
    room: Mutex<Option<BusinessId>>,
}

impl LinkShared {
    fn room(&self) -> Option<BusinessId> {
        self.room.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

enum LinkCommand {
    Join(BusinessId),
    Emit(ClientCommand),
}

struct SocketIoLink {
    shared: Arc<LinkShared>,
    cmd_tx: mpsc::UnboundedSender<LinkCommand>,
    cancel: CancellationToken,
}

impl TransportLink for SocketIoLink {
    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    fn join(&self, business: &BusinessId) {
        *self.shared.room.lock().unwrap_or_else(PoisonError::into_inner) = Some(business.clone());
        // Replayed on the next connect if the link is down right now.
        let _ = self.cmd_tx.send(LinkCommand::Join(business.clone()));
    }

    fn emit(&self, command: ClientCommand) -> Result<(), ChannelError> {
        if !self.is_connected() {
            return Err(ChannelError::TransportUnavailable("reconnecting"));
        }
        self.cmd_tx
            .send(LinkCommand::Emit(command))
            .map_err(|_| ChannelError::TransportUnavailable("link closed"))
    }

    fn close(self: Box<Self>) {
        self.cancel.cancel();
    }
}

impl Drop for SocketIoLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct LinkTask {
    config: SocketIoConfig,
    credential: SessionCredential,
    sink: EventSink,
    shared: Arc<LinkShared>,
    cancel: CancellationToken,
}

impl LinkTask {
    async fn run(self, mut cmd_rx: mpsc::UnboundedReceiver<LinkCommand>) {
        let mut backoff = self.config.initial_backoff;
        let mut consecutive_failures: u32 = 0;

        loop {
            let mut established = false;
            let result = tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::debug!("socket.io: link closed");
                    return;
                }
                result = self.connect_and_listen(&mut cmd_rx, &mut established) => result,
            };
            if established {
                backoff = self.config.initial_backoff;
                consecutive_failures = 0;
            }
            match result {
                Ok(()) => tracing::info!("socket.io: connection closed"),
                Err(e) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    if consecutive_failures >= DEBUG_LOG_THRESHOLD {
                        tracing::debug!(consecutive_failures, "socket.io: connection error: {e}");
                    } else {
                        tracing::warn!("socket.io: connection error: {e}");
                    }
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::debug!("socket.io: link closed during backoff");
                    return;
                }
                _ = tokio::time::sleep(backoff) => {
                    tracing::info!(
                        url = %self.config.url,
                        backoff_ms = backoff.as_millis() as u64,
                        consecutive_failures,
                        "socket.io: reconnecting"
                    );
                }
            }
            backoff = (backoff * 2).min(self.config.max_backoff);
        }
    }

    async fn connect_and_listen(
        &self,
        cmd_rx: &mut mpsc::UnboundedReceiver<LinkCommand>,
        established: &mut bool,
    ) -> Result<(), ChannelError> {
        let (ws, _response) = tokio_tungstenite::connect_async(self.config.url.as_str()).await?;
        let (mut write, mut read) = ws.split();

        // Engine.IO open.
        let handshake = match next_packet(&mut read, HANDSHAKE_TIMEOUT).await? {
            Some(EnginePacket::Open(hs)) => hs,
            Some(other) => return Err(ChannelError::Handshake(format!("expected open, got {other:?}"))),
            None => return Err(ChannelError::Handshake("closed before open".into())),
        };
        let liveness = Duration::from_millis(handshake.liveness_window_ms());
        tracing::debug!(sid = %handshake.sid, liveness_ms = liveness.as_millis() as u64, "socket.io: engine open");

        // Socket.IO connect with auth.
        let auth = protocol::connect_auth(self.credential.expose());
        write.send(Message::text(encode_connect(&auth))).await?;
        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match next_packet(&mut read, remaining).await? {
                Some(EnginePacket::Message(SocketPacket::Connect { namespace, .. })) if namespace == "/" => break,
                Some(EnginePacket::Message(SocketPacket::ConnectError { message, .. })) => {
                    return Err(ChannelError::ConnectRefused(message));
                }
                Some(EnginePacket::Ping(data)) => write.send(Message::text(encode_pong(&data))).await?,
                Some(EnginePacket::Close) | None => {
                    return Err(ChannelError::Handshake("closed before connect".into()));
                }
                Some(other) => tracing::debug!(?other, "socket.io: ignored before connect"),
            }
        }

        // Anything queued while offline is stale: joins are replayed from
        // the remembered room, emits were refused at the call site.
        while let Ok(stale) = cmd_rx.try_recv() {
            if let LinkCommand::Emit(cmd) = stale {
                tracing::warn!(event = cmd.event_name(), "socket.io: dropped command queued while offline");
            }
        }

        let mut joined: Option<BusinessId> = None;
        if let Some(room) = self.shared.room() {
            let join = ClientCommand::JoinBusiness { business_id: room.clone() };
            write.send(Message::text(join.encode())).await?;
            joined = Some(room);
        }

        self.shared.connected.store(true, Ordering::Release);
        let _online = OnlineGuard(&self.shared.connected);
        *established = true;
        tracing::info!(room = joined.as_ref().map(BusinessId::as_str), "socket.io: connected");

        let heartbeat = tokio::time::sleep(liveness);
        tokio::pin!(heartbeat);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = write.send(Message::text("41")).await;
                    let _ = write.close().await;
                    return Ok(());
                }
                () = &mut heartbeat => {
                    return Err(ChannelError::HeartbeatTimeout(liveness.as_millis() as u64));
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(LinkCommand::Join(room)) => {
                            if joined.as_ref() != Some(&room) {
                                let join = ClientCommand::JoinBusiness { business_id: room.clone() };
                                write.send(Message::text(join.encode())).await?;
                                joined = Some(room);
                            }
                        }
                        Some(LinkCommand::Emit(command)) => {
                            write.send(Message::text(command.encode())).await?;
                        }
                        None => return Ok(()),
                    }
                }
                msg = read.next() => {
                    let text = match msg {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Err(e.into()),
                    };
                    match decode_frame(&text) {
                        Ok(EnginePacket::Ping(data)) => {
                            write.send(Message::text(encode_pong(&data))).await?;
                            heartbeat.as_mut().reset(Instant::now() + liveness);
                        }
                        Ok(EnginePacket::Close) => return Ok(()),
                        Ok(EnginePacket::Message(SocketPacket::Disconnect { .. })) => {
                            tracing::info!("socket.io: server disconnected the socket");
                            return Ok(());
                        }
                        Ok(EnginePacket::Message(SocketPacket::Event { name, args, .. })) => {
                            self.deliver(&name, &args);
                        }
                        Ok(other) => tracing::trace!(?other, "socket.io: ignored packet"),
                        Err(e) => tracing::warn!("socket.io: undecodable frame: {e}"),
                    }
                }
            }
        }
    }

    fn deliver(&self, name: &str, args: &[serde_json::Value]) {
        match ServerEvent::from_event(name, args) {
            Ok(ServerEvent::Escalation(payload)) => {
                match EscalationEvent::from_payload(payload, Utc::now()) {
                    Some(event) => {
                        tracing::info!(call_id = %event.call_id, score = event.score, "socket.io: escalation");
                        self.sink.dispatch(&event);
                    }
                    None => tracing::debug!("socket.io: escalation without call id dropped"),
                }
            }
            Ok(ServerEvent::Other { name }) => tracing::debug!(event = %name, "socket.io: unhandled event"),
            Err(e) => tracing::warn!(event = %name, "socket.io: bad event payload: {e}"),
        }
    }
}

/// Clears the connected flag when the listen loop exits, however it exits.
struct OnlineGuard<'a>(&'a AtomicBool);

impl Drop for OnlineGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Next decodable Engine.IO packet, skipping non-text frames.
async fn next_packet<S>(read: &mut S, wait: Duration) -> Result<Option<EnginePacket>, ChannelError>
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let msg = tokio::time::timeout(wait, read.next())
            .await
            .map_err(|_| ChannelError::Handshake(format!("no reply within {}ms", wait.as_millis())))?;
        match msg {
            Some(Ok(Message::Text(text))) => return Ok(Some(decode_frame(&text)?)),
            Some(Ok(Message::Close(_))) | None => return Ok(None),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}
