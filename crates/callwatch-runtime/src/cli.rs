//! CLI definition using clap derive.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "callwatch", about = "live call tracking and escalation alerts")]
pub struct Cli {
    /// UDS socket path (default: $XDG_RUNTIME_DIR/callwatch/callwatchd.sock)
    #[arg(long, short = 's', global = true)]
    pub socket_path: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the daemon (push channel, poller, control socket)
    Daemon(DaemonOpts),
    /// Show active calls and pending escalations
    Calls(CallsOpts),
    /// Show daemon status summary
    Status,
    /// Ask the backend to transfer a live call to a human
    Takeover(TakeoverOpts),
    /// Stream escalations and view changes
    Watch,
    /// Give the running daemon a new session token
    Login(LoginOpts),
    /// Clear the daemon's session and close the push channel
    Logout,
}

#[derive(clap::Args)]
pub struct DaemonOpts {
    /// TOML config file
    #[arg(long, short = 'c', env = "CALLWATCH_CONFIG")]
    pub config: Option<PathBuf>,

    /// REST base url, including the version prefix
    #[arg(long, env = "CALLWATCH_API_URL")]
    pub api_url: Option<String>,

    /// Push channel server origin
    #[arg(long, env = "CALLWATCH_SOCKET_URL")]
    pub socket_url: Option<String>,

    /// Bearer token for the backend
    #[arg(long, env = "CALLWATCH_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Business to observe (default: the operator's business)
    #[arg(long, env = "CALLWATCH_BUSINESS_ID")]
    pub business_id: Option<String>,

    /// Default phone number for takeovers (default: the operator's phone)
    #[arg(long, env = "CALLWATCH_TAKEOVER_PHONE")]
    pub takeover_phone: Option<String>,

    /// Poll interval in milliseconds
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,
}

#[derive(clap::Args)]
pub struct CallsOpts {
    /// Print the raw view as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(clap::Args)]
pub struct TakeoverOpts {
    pub call_id: String,

    /// Phone number to transfer to (default: the daemon's takeover phone)
    pub phone_number: Option<String>,
}

#[derive(clap::Args)]
pub struct LoginOpts {
    /// Bearer token for the backend
    #[arg(long, env = "CALLWATCH_TOKEN", hide_env_values = true)]
    pub token: String,

    /// Business to observe (default: configured, then the operator's)
    #[arg(long)]
    pub business_id: Option<String>,

    /// Takeover phone for this session
    #[arg(long)]
    pub phone_number: Option<String>,
}

/// Default socket path using $USER for per-user isolation.
pub fn default_socket_path() -> String {
    if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR") {
        return format!("{dir}/callwatch/callwatchd.sock");
    }
    let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    format!("/tmp/callwatch-{user}/callwatchd.sock")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_takeover_with_optional_phone() {
        let cli = Cli::try_parse_from(["callwatch", "takeover", "c1"]).unwrap();
        match cli.command {
            Command::Takeover(opts) => {
                assert_eq!(opts.call_id, "c1");
                assert!(opts.phone_number.is_none());
            }
            _ => panic!("expected takeover"),
        }

        let cli = Cli::try_parse_from(["callwatch", "-s", "/tmp/x.sock", "takeover", "c1", "+1555"]).unwrap();
        assert_eq!(cli.socket_path.as_deref(), Some("/tmp/x.sock"));
        match cli.command {
            Command::Takeover(opts) => assert_eq!(opts.phone_number.as_deref(), Some("+1555")),
            _ => panic!("expected takeover"),
        }
    }

    #[test]
    fn parses_daemon_flags() {
        let cli = Cli::try_parse_from([
            "callwatch",
            "daemon",
            "--business-id",
            "biz-A",
            "--poll-interval-ms",
            "2000",
        ])
        .unwrap();
        match cli.command {
            Command::Daemon(opts) => {
                assert_eq!(opts.business_id.as_deref(), Some("biz-A"));
                assert_eq!(opts.poll_interval_ms, Some(2000));
            }
            _ => panic!("expected daemon"),
        }
    }

    #[test]
    fn parses_login() {
        let cli = Cli::try_parse_from([
            "callwatch",
            "login",
            "--token",
            "tok-2",
            "--business-id",
            "biz-A",
        ])
        .unwrap();
        match cli.command {
            Command::Login(opts) => {
                assert_eq!(opts.token, "tok-2");
                assert_eq!(opts.business_id.as_deref(), Some("biz-A"));
                assert!(opts.phone_number.is_none());
            }
            _ => panic!("expected login"),
        }
    }

    #[test]
    fn takeover_requires_call_id() {
        assert!(Cli::try_parse_from(["callwatch", "takeover"]).is_err());
    }
}
