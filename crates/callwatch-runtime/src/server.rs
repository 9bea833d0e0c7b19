//! UDS JSON-RPC control server.
//! Connection-per-request, newline-delimited JSON; `subscribe` keeps the
//! connection open and streams notifications.

use std::sync::Arc;

use callwatch_core::{CallId, SessionCredential};
use chrono::Utc;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::{broadcast, mpsc};

use crate::error::ChannelError;
use crate::reconciler::{ReconcileInput, SharedView, ViewNotification};
use crate::rest::{ApiClient, OperatorDefaults, resolve_operator};
use crate::session::SessionStore;
use crate::supervisor::SharedChannel;

/// JSON-RPC error code for "push transport unavailable".
pub const TRANSPORT_UNAVAILABLE: i64 = -32001;
/// The backend refused the credential given to `login`.
pub const AUTH_REJECTED: i64 = -32002;
const INVALID_PARAMS: i64 = -32602;
const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Clone)]
pub struct ServerContext {
    pub view: SharedView,
    pub api: Arc<ApiClient>,
    /// Configured scope and phone, applied on every `login`.
    pub defaults: OperatorDefaults,
    pub channel: SharedChannel,
    pub session: SessionStore,
    pub reconcile_tx: mpsc::Sender<ReconcileInput>,
    pub notify_tx: broadcast::Sender<ViewNotification>,
}

#[derive(Debug, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<ChannelError> for RpcError {
    fn from(e: ChannelError) -> Self {
        let code = match e {
            ChannelError::TransportUnavailable(_) => TRANSPORT_UNAVAILABLE,
            ChannelError::InvalidRequest(_) => INVALID_PARAMS,
            _ => -32000,
        };
        Self::new(code, e.to_string())
    }
}

pub async fn run_server(socket_path: &str, ctx: ServerContext) -> anyhow::Result<()> {
    let socket_dir = std::path::Path::new(socket_path)
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid socket path"))?;

    std::fs::create_dir_all(socket_dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_dir, std::fs::Permissions::from_mode(0o700))?;
    }

    if std::path::Path::new(socket_path).exists() {
        if tokio::net::UnixStream::connect(socket_path).await.is_err() {
            std::fs::remove_file(socket_path)?;
            tracing::info!("removed stale socket at {socket_path}");
        } else {
            anyhow::bail!("another daemon is already running at {socket_path}");
        }
    }

    let listener = UnixListener::bind(socket_path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
    }

    tracing::info!("control socket listening on {socket_path}");

    loop {
        let (stream, _) = listener.accept().await?;
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, ctx).await {
                tracing::debug!("connection error: {e}");
            }
        });
    }
}

async fn handle_connection(stream: tokio::net::UnixStream, ctx: ServerContext) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    reader.read_line(&mut line).await?;

    let request: Value = serde_json::from_str(line.trim())?;
    let method = request["method"].as_str().unwrap_or("");
    let id = request["id"].clone();

    if method == "subscribe" {
        return stream_notifications(&mut writer, id, ctx.notify_tx.subscribe()).await;
    }

    let response = match dispatch(&ctx, method, &request["params"]).await {
        Ok(result) => json!({ "jsonrpc": "2.0", "result": result, "id": id }),
        Err(e) => json!({
            "jsonrpc": "2.0",
            "error": { "code": e.code, "message": e.message },
            "id": id,
        }),
    };
    write_line(&mut writer, &response).await
}

async fn write_line(writer: &mut OwnedWriteHalf, value: &Value) -> anyhow::Result<()> {
    let mut out = serde_json::to_string(value)?;
    out.push('\n');
    writer.write_all(out.as_bytes()).await?;
    Ok(())
}

/// Acknowledge, then forward every notification until the client hangs up.
async fn stream_notifications(
    writer: &mut OwnedWriteHalf,
    id: Value,
    mut rx: broadcast::Receiver<ViewNotification>,
) -> anyhow::Result<()> {
    write_line(writer, &json!({ "jsonrpc": "2.0", "result": { "subscribed": true }, "id": id })).await?;
    loop {
        match rx.recv().await {
            Ok(note) => {
                let msg = json!({ "jsonrpc": "2.0", "method": "notification", "params": note });
                write_line(writer, &msg).await?;
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "subscriber lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}

pub(crate) async fn dispatch(ctx: &ServerContext, method: &str, params: &Value) -> Result<Value, RpcError> {
    match method {
        "view" => {
            let snapshot = ctx.view.read().await.at(Utc::now());
            serde_json::to_value(snapshot).map_err(|e| RpcError::new(-32603, e.to_string()))
        }
        "status" => Ok(build_status(ctx).await),
        "request_takeover" => request_takeover(ctx, params).await,
        "login" => login(ctx, params).await,
        "logout" => {
            let logged_out = ctx.session.logout();
            Ok(json!({ "logged_out": logged_out }))
        }
        _ => Err(RpcError::new(METHOD_NOT_FOUND, "method not found")),
    }
}

async fn build_status(ctx: &ServerContext) -> Value {
    let (status, scope, epoch, active, pending, last_snapshot_at, last_error) = {
        let view = ctx.view.read().await;
        (
            view.status,
            view.scope.clone(),
            view.epoch,
            view.active.len(),
            view.pending_escalations.len(),
            view.last_snapshot_at,
            view.last_error.clone(),
        )
    };
    let channel = ctx.channel.lock().await.as_ref().map(|m| m.status());
    json!({
        "authenticated": ctx.session.snapshot().is_authenticated(),
        "status": status,
        "scope": scope,
        "epoch": epoch,
        "active_calls": active,
        "pending_escalations": pending,
        "last_snapshot_at": last_snapshot_at,
        "last_error": last_error,
        "channel": channel,
    })
}

/// Install a new credential and resolve its scope. The supervisor rebuilds
/// the push channel from the session change.
async fn login(ctx: &ServerContext, params: &Value) -> Result<Value, RpcError> {
    let token = params["token"]
        .as_str()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| RpcError::new(INVALID_PARAMS, "missing token"))?;
    let known = OperatorDefaults {
        business_id: params["business_id"]
            .as_str()
            .map(str::to_string)
            .or_else(|| ctx.defaults.business_id.clone()),
        takeover_phone: params["phone_number"]
            .as_str()
            .map(str::to_string)
            .or_else(|| ctx.defaults.takeover_phone.clone()),
    };

    ctx.session.login(SessionCredential::new(token));
    let business = resolve_operator(&ctx.api, &ctx.session, known)
        .await
        .map_err(|e| RpcError::new(AUTH_REJECTED, e.to_string()))?;
    Ok(json!({ "logged_in": true, "business_id": business }))
}

async fn request_takeover(ctx: &ServerContext, params: &Value) -> Result<Value, RpcError> {
    let call_id = params["call_id"]
        .as_str()
        .ok_or_else(|| RpcError::new(INVALID_PARAMS, "missing call_id"))?;
    let phone_number = params["phone_number"]
        .as_str()
        .map(str::to_string)
        .or_else(|| ctx.session.operator_phone())
        .ok_or_else(|| {
            RpcError::new(
                INVALID_PARAMS,
                "no phone number: pass one or configure takeover_phone",
            )
        })?;
    let call_id = CallId::new(call_id);

    {
        let slot = ctx.channel.lock().await;
        let mgr = slot
            .as_ref()
            .ok_or(ChannelError::TransportUnavailable("no active session"))?;
        mgr.request_takeover(&call_id, &phone_number)?;
    }

    let requested_at = Utc::now();
    let input = ReconcileInput::TakeoverRequested {
        call_id: call_id.clone(),
        phone_number: phone_number.clone(),
        requested_at,
    };
    if ctx.reconcile_tx.send(input).await.is_err() {
        tracing::warn!(call_id = %call_id, "takeover sent but view update dropped");
    }
    Ok(json!({
        "call_id": call_id,
        "phone_number": phone_number,
        "requested_at": requested_at,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SessionChannelManager;
    use crate::channel::testing::MockTransport;
    use crate::reconciler::ViewSnapshot;
    use crate::supervisor::SessionSupervisor;
    use callwatch_core::{BusinessId, ClientCommand};
    use std::time::Duration;
    use tokio::sync::{Mutex, RwLock};
    use tokio_util::sync::CancellationToken;

    fn context() -> (ServerContext, mpsc::Receiver<ReconcileInput>) {
        let (tx, rx) = mpsc::channel(8);
        let (ntx, _) = broadcast::channel(8);
        let session = SessionStore::new();
        // Nothing listens on the discard port; tests never reach /auth/me.
        let api = ApiClient::new("http://127.0.0.1:9/api/v1", Duration::from_secs(1), session.clone())
            .unwrap();
        let ctx = ServerContext {
            view: Arc::new(RwLock::new(ViewSnapshot::default())),
            api: Arc::new(api),
            defaults: OperatorDefaults::default(),
            channel: Arc::new(Mutex::new(None)),
            session,
            reconcile_tx: tx,
            notify_tx: ntx,
        };
        (ctx, rx)
    }

    async fn with_manager(ctx: &ServerContext) -> MockTransport {
        let transport = MockTransport::default();
        let mut mgr = SessionChannelManager::new(Arc::new(transport.clone()));
        mgr.connect(&SessionCredential::new("tok"));
        *ctx.channel.lock().await = Some(mgr);
        transport
    }

    #[tokio::test]
    async fn takeover_without_session_is_transport_unavailable() {
        let (ctx, _rx) = context();
        let err = dispatch(&ctx, "request_takeover", &json!({"call_id": "c1", "phone_number": "+1"}))
            .await
            .unwrap_err();
        assert_eq!(err.code, TRANSPORT_UNAVAILABLE);
    }

    #[tokio::test]
    async fn takeover_uses_operator_phone_and_updates_view() {
        let (ctx, mut rx) = context();
        let transport = with_manager(&ctx).await;
        ctx.session.set_operator_phone(Some("+15550009999".into()));

        let result = dispatch(&ctx, "request_takeover", &json!({"call_id": "c1"}))
            .await
            .unwrap();
        assert_eq!(result["phone_number"], "+15550009999");
        assert_eq!(
            transport.emitted(),
            vec![ClientCommand::RequestTakeover {
                call_id: CallId::from("c1"),
                phone_number: "+15550009999".into(),
            }]
        );
        assert!(matches!(
            rx.recv().await,
            Some(ReconcileInput::TakeoverRequested { .. })
        ));
    }

    #[tokio::test]
    async fn takeover_without_any_phone_is_invalid() {
        let (ctx, _rx) = context();
        let transport = with_manager(&ctx).await;
        let err = dispatch(&ctx, "request_takeover", &json!({"call_id": "c1"}))
            .await
            .unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);
        assert!(transport.emitted().is_empty());
    }

    #[tokio::test]
    async fn status_reports_view_and_channel() {
        let (ctx, _rx) = context();
        with_manager(&ctx).await;
        let status = dispatch(&ctx, "status", &Value::Null).await.unwrap();
        assert_eq!(status["status"], "no_business_linked");
        assert_eq!(status["channel"]["linked"], true);
        assert_eq!(status["authenticated"], false);
    }

    #[tokio::test]
    async fn logout_and_unknown_method() {
        let (ctx, _rx) = context();
        ctx.session.login(SessionCredential::new("tok"));
        let out = dispatch(&ctx, "logout", &Value::Null).await.unwrap();
        assert_eq!(out["logged_out"], true);
        assert!(ctx.session.credential().is_none());

        let err = dispatch(&ctx, "nope", &Value::Null).await.unwrap_err();
        assert_eq!(err.code, METHOD_NOT_FOUND);
    }

    async fn eventually(mut cond: impl FnMut() -> bool) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn login_after_logout_rebuilds_channel_and_rejoins() {
        let (ctx, _rx) = context();
        let transport = MockTransport::default();
        let cancel = CancellationToken::new();
        let supervisor = SessionSupervisor::new(
            ctx.session.clone(),
            Arc::new(transport.clone()),
            Arc::clone(&ctx.channel),
            ctx.reconcile_tx.clone(),
            cancel.clone(),
        );
        tokio::spawn(supervisor.run());

        ctx.session.login(SessionCredential::new("tok-1"));
        ctx.session.set_business(Some(BusinessId::from("biz-A")));
        eventually(|| transport.join_count() == 1).await;

        dispatch(&ctx, "logout", &Value::Null).await.unwrap();
        eventually(|| transport.open_links() == 0).await;
        let err = dispatch(&ctx, "request_takeover", &json!({"call_id": "c1", "phone_number": "+1"}))
            .await
            .unwrap_err();
        assert_eq!(err.code, TRANSPORT_UNAVAILABLE);

        let out = dispatch(
            &ctx,
            "login",
            &json!({"token": "tok-2", "business_id": "biz-A", "phone_number": "+15550001111"}),
        )
        .await
        .unwrap();
        assert_eq!(out["business_id"], "biz-A");
        eventually(|| transport.opened() == 2 && transport.open_links() == 1 && transport.join_count() == 2).await;
        assert_eq!(ctx.session.credential().map(|c| c.expose().to_string()).as_deref(), Some("tok-2"));
        assert_eq!(ctx.session.operator_phone().as_deref(), Some("+15550001111"));

        dispatch(&ctx, "request_takeover", &json!({"call_id": "c1"}))
            .await
            .unwrap();
        assert_eq!(
            transport.emitted(),
            vec![ClientCommand::RequestTakeover {
                call_id: CallId::from("c1"),
                phone_number: "+15550001111".into(),
            }]
        );
        cancel.cancel();
    }

    #[tokio::test]
    async fn login_without_token_is_invalid() {
        let (ctx, _rx) = context();
        let err = dispatch(&ctx, "login", &json!({"token": "  "})).await.unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);
        assert!(ctx.session.credential().is_none());
    }

    #[tokio::test]
    async fn serves_requests_over_the_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("cw").join("callwatchd.sock");
        let socket = socket.to_str().unwrap().to_string();
        let (ctx, _rx) = context();
        let notify = ctx.notify_tx.clone();

        let server_socket = socket.clone();
        let server = tokio::spawn(async move { run_server(&server_socket, ctx).await });
        for _ in 0..200 {
            if std::path::Path::new(&socket).exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let view = crate::client::rpc_call(&socket, "view", json!({})).await.unwrap();
        assert_eq!(view["status"], "no_business_linked");

        let err = crate::client::rpc_call(&socket, "request_takeover", json!({"call_id": "c1", "phone_number": "+1"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("-32001"));

        // subscribe: ack first, then notifications.
        let stream = tokio::net::UnixStream::connect(&socket).await.unwrap();
        let (r, mut w) = stream.into_split();
        w.write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"subscribe\",\"params\":{},\"id\":7}\n")
            .await
            .unwrap();
        let mut lines = BufReader::new(r).lines();
        let ack: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(ack["result"]["subscribed"], true);

        notify
            .send(ViewNotification::PollFailed {
                epoch: callwatch_core::ScopeEpoch(3),
                error: "timeout".into(),
            })
            .unwrap();
        let note: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(note["params"]["type"], "poll_failed");

        server.abort();
    }
}
