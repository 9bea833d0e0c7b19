//! Daemon wiring: session, REST client, reconciler, poller, push channel
//! supervisor and control socket, all in one process.

use std::sync::Arc;

use callwatch_core::SessionCredential;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::channel::SocketIoTransport;
use crate::channel::socketio::SocketIoConfig;
use crate::cli::DaemonOpts;
use crate::config::Config;
use crate::poller::CallSnapshotPoller;
use crate::reconciler::{Reconciler, SharedView, ViewSnapshot};
use crate::rest::{ApiClient, OperatorDefaults, resolve_operator};
use crate::server::{self, ServerContext};
use crate::session::SessionStore;
use crate::supervisor::{SessionSupervisor, SharedChannel};

const INPUT_CAPACITY: usize = 256;
const NOTIFY_CAPACITY: usize = 256;

pub async fn run_daemon(opts: DaemonOpts, socket_path: &str) -> anyhow::Result<()> {
    let mut config = Config::load(opts.config.as_deref())?;
    config.apply_opts(&opts);
    config.validate()?;

    let token = config
        .token
        .clone()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| anyhow::anyhow!("no token: set CALLWATCH_TOKEN or `token` in the config file"))?;

    let session = SessionStore::new();
    session.login(SessionCredential::new(token));

    let api = Arc::new(ApiClient::new(
        &config.api_base_url,
        config.request_timeout(),
        session.clone(),
    )?);
    let defaults = OperatorDefaults {
        business_id: config.business_id.clone(),
        takeover_phone: config.takeover_phone.clone(),
    };
    if let Err(e) = resolve_operator(&api, &session, defaults.clone()).await {
        anyhow::bail!("backend rejected the token: {e}");
    }

    let cancel = CancellationToken::new();
    let (input_tx, input_rx) = mpsc::channel(INPUT_CAPACITY);
    let (notify_tx, _) = broadcast::channel(NOTIFY_CAPACITY);
    let view: SharedView = Arc::new(RwLock::new(ViewSnapshot::default()));
    let channel: SharedChannel = Arc::new(Mutex::new(None));

    let mut reconciler = Reconciler::new(
        input_rx,
        notify_tx.clone(),
        Arc::clone(&view),
        config.takeover_display_ms,
        cancel.clone(),
    );
    let reconciler_handle = tokio::spawn(async move { reconciler.run().await });

    let poller = CallSnapshotPoller::new(
        Arc::clone(&api),
        session.clone(),
        input_tx.clone(),
        config.poll.clone(),
        cancel.clone(),
    );
    let poller_handle = tokio::spawn(poller.run());

    let transport = SocketIoTransport::new(SocketIoConfig::new(
        &config.socket_url,
        &config.socket_path,
        config.reconnect.initial_backoff(),
        config.reconnect.max_backoff(),
    )?);
    let supervisor = SessionSupervisor::new(
        session.clone(),
        Arc::new(transport),
        Arc::clone(&channel),
        input_tx.clone(),
        cancel.clone(),
    );
    let supervisor_handle = tokio::spawn(supervisor.run());

    let ctx = ServerContext {
        view,
        api,
        defaults,
        channel,
        session: session.clone(),
        reconcile_tx: input_tx,
        notify_tx,
    };
    let server_socket = socket_path.to_string();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server::run_server(&server_socket, ctx).await {
            tracing::error!("control socket error: {e}");
        }
    });

    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => tracing::info!("received ctrl-c, shutting down"),
                _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
            }
        }

        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            tracing::info!("received ctrl-c, shutting down");
        }
    };

    tokio::select! {
        () = shutdown => {}
        _ = server_handle => {
            tracing::warn!("control socket exited unexpectedly");
        }
        _ = poller_handle => {
            tracing::warn!("poller exited unexpectedly");
        }
    }

    cancel.cancel();
    let _ = supervisor_handle.await;
    let _ = reconciler_handle.await;

    let _ = std::fs::remove_file(socket_path);
    tracing::info!("daemon stopped");
    Ok(())
}
