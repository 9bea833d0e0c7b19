//! callwatch: live call tracking daemon and CLI.
//! The daemon merges the escalation push channel with a polled call
//! snapshot; the other subcommands talk to it over a Unix socket.

use clap::Parser;

mod channel;
mod cli;
mod client;
mod config;
mod daemon;
mod error;
mod poller;
mod reconciler;
mod rest;
mod server;
mod session;
mod supervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();
    let socket_path = args.socket_path.unwrap_or_else(cli::default_socket_path);

    match args.command {
        cli::Command::Daemon(opts) => {
            let filter = std::env::var("CALLWATCH_LOG")
                .or_else(|_| std::env::var("RUST_LOG"))
                .unwrap_or_else(|_| "info".to_string());
            tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
                .init();

            tracing::info!("callwatch daemon starting");
            daemon::run_daemon(opts, &socket_path).await?;
        }
        cli::Command::Calls(opts) => client::cmd_calls(&socket_path, opts.json).await?,
        cli::Command::Status => client::cmd_status(&socket_path).await?,
        cli::Command::Takeover(opts) => {
            client::cmd_takeover(&socket_path, &opts.call_id, opts.phone_number.as_deref()).await?;
        }
        cli::Command::Watch => client::cmd_watch(&socket_path).await?,
        cli::Command::Login(opts) => client::cmd_login(&socket_path, &opts).await?,
        cli::Command::Logout => client::cmd_logout(&socket_path).await?,
    }

    Ok(())
}
