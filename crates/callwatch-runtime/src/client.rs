//! UDS JSON-RPC client and CLI subcommands.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::cli::LoginOpts;
use crate::server::TRANSPORT_UNAVAILABLE;

pub(crate) async fn rpc_call(socket_path: &str, method: &str, params: Value) -> anyhow::Result<Value> {
    let stream = UnixStream::connect(socket_path)
        .await
        .map_err(|e| anyhow::anyhow!("cannot connect to daemon at {socket_path}: {e}"))?;

    let (reader, mut writer) = stream.into_split();

    let request = serde_json::json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
        "id": 1,
    });
    let mut req = serde_json::to_string(&request)?;
    req.push('\n');
    writer.write_all(req.as_bytes()).await?;
    writer.shutdown().await?;

    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    reader.read_line(&mut line).await?;

    let response: Value = serde_json::from_str(line.trim())?;

    if let Some(error) = response.get("error") {
        if error["code"].as_i64() == Some(TRANSPORT_UNAVAILABLE) {
            anyhow::bail!(
                "takeover not sent, push channel unavailable ({}): {error}",
                error["message"].as_str().unwrap_or("")
            );
        }
        anyhow::bail!("RPC error: {error}");
    }

    Ok(response["result"].clone())
}

/// `callwatch calls`: active calls and pending escalations.
pub async fn cmd_calls(socket_path: &str, json: bool) -> anyhow::Result<()> {
    let view = rpc_call(socket_path, "view", serde_json::json!({})).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else {
        print!("{}", format_view(&view, Utc::now()));
    }
    Ok(())
}

pub async fn cmd_status(socket_path: &str) -> anyhow::Result<()> {
    let status = match rpc_call(socket_path, "status", serde_json::json!({})).await {
        Ok(s) => s,
        Err(e) => {
            println!("daemon: not running ({e})");
            return Ok(());
        }
    };
    print!("{}", format_status(&status));
    Ok(())
}

pub async fn cmd_takeover(socket_path: &str, call_id: &str, phone: Option<&str>) -> anyhow::Result<()> {
    let mut params = serde_json::json!({ "call_id": call_id });
    if let Some(phone) = phone {
        params["phone_number"] = Value::String(phone.to_string());
    }
    let result = rpc_call(socket_path, "request_takeover", params).await?;
    println!(
        "takeover requested for {} -> {}",
        result["call_id"].as_str().unwrap_or(call_id),
        result["phone_number"].as_str().unwrap_or("?")
    );
    Ok(())
}

pub async fn cmd_login(socket_path: &str, opts: &LoginOpts) -> anyhow::Result<()> {
    let mut params = serde_json::json!({ "token": opts.token });
    if let Some(business) = &opts.business_id {
        params["business_id"] = Value::String(business.clone());
    }
    if let Some(phone) = &opts.phone_number {
        params["phone_number"] = Value::String(phone.clone());
    }
    let result = rpc_call(socket_path, "login", params).await?;
    match result["business_id"].as_str() {
        Some(business) => println!("logged in, watching business {business}"),
        None => println!("logged in, no business linked"),
    }
    Ok(())
}

pub async fn cmd_logout(socket_path: &str) -> anyhow::Result<()> {
    let result = rpc_call(socket_path, "logout", serde_json::json!({})).await?;
    if result["logged_out"].as_bool() == Some(true) {
        println!("logged out");
    } else {
        println!("already logged out");
    }
    Ok(())
}

/// `callwatch watch`: stream view notifications until interrupted.
pub async fn cmd_watch(socket_path: &str) -> anyhow::Result<()> {
    let stream = UnixStream::connect(socket_path)
        .await
        .map_err(|e| anyhow::anyhow!("cannot connect to daemon at {socket_path}: {e}"))?;
    let (reader, mut writer) = stream.into_split();
    writer
        .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"subscribe\",\"params\":{},\"id\":1}\n")
        .await?;

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        let msg: Value = serde_json::from_str(&line)?;
        if let Some(text) = format_notification(&msg["params"]) {
            println!("{text}");
        }
    }
    Ok(())
}

/// Pure formatting for `calls`, separated for testability.
pub(crate) fn format_view(view: &Value, now: DateTime<Utc>) -> String {
    let mut out = String::new();
    let status = view["status"].as_str().unwrap_or("unknown");
    if status == "no_business_linked" {
        out.push_str("no business linked\n");
        return out;
    }
    let scope = view["scope"].as_str().unwrap_or("-");
    out.push_str(&format!("business {scope} [{status}]\n"));
    if let Some(err) = view["last_error"].as_str() {
        out.push_str(&format!("  last poll failed: {err}\n"));
    }

    let empty = Vec::new();
    let active = view["active"].as_array().unwrap_or(&empty);
    out.push_str(&format!("active calls: {}\n", active.len()));
    for call in active {
        let mut flags = Vec::new();
        if call["escalation_pending"].as_bool() == Some(true) {
            flags.push("ESCALATION");
        }
        if call["takeover_until"].is_string() {
            flags.push("TAKEOVER REQUESTED");
        }
        let caller = call["caller_name"]
            .as_str()
            .or(call["caller_number"].as_str())
            .unwrap_or("?");
        let elapsed = call["started_at"]
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| format_elapsed((now - t.with_timezone(&Utc)).num_seconds()))
            .unwrap_or_else(|| "--:--".to_string());
        let mut line = format!(
            "  {:<12} {:<20} {:>6}",
            call["id"].as_str().unwrap_or("?"),
            caller,
            elapsed
        );
        if !flags.is_empty() {
            line.push_str(&format!("  [{}]", flags.join(", ")));
        }
        out.push_str(&line);
        out.push('\n');
        if let Some(text) = call["last_transcript"].as_str() {
            out.push_str(&format!("      \"{}\"\n", truncate(text, 72)));
        }
    }

    let pending = view["pending_escalations"].as_array().unwrap_or(&empty);
    if !pending.is_empty() {
        out.push_str(&format!("pending escalations: {}\n", pending.len()));
        for p in pending {
            let origin = p["origin"].as_str().unwrap_or("?");
            let reason = p["reason"].as_str().unwrap_or("");
            out.push_str(&format!(
                "  {:<12} {:<12} {reason}\n",
                p["call"]["id"].as_str().unwrap_or("?"),
                origin
            ));
        }
    }
    out
}

pub(crate) fn format_status(status: &Value) -> String {
    let mut out = String::new();
    let session = if status["authenticated"].as_bool() == Some(true) {
        "logged in"
    } else {
        "logged out"
    };
    out.push_str(&format!("session: {session}\n"));
    out.push_str(&format!(
        "view:    {} (scope {}, {})\n",
        status["status"].as_str().unwrap_or("unknown"),
        status["scope"].as_str().unwrap_or("-"),
        status["epoch"].as_u64().map_or("epoch ?".to_string(), |e| format!("epoch {e}")),
    ));
    out.push_str(&format!(
        "calls:   {} active, {} pending escalation\n",
        status["active_calls"].as_u64().unwrap_or(0),
        status["pending_escalations"].as_u64().unwrap_or(0),
    ));
    let channel = &status["channel"];
    let link = if channel.is_null() {
        "none".to_string()
    } else if channel["connected"].as_bool() == Some(true) {
        format!("connected, room {}", channel["room"].as_str().unwrap_or("-"))
    } else {
        "reconnecting".to_string()
    };
    out.push_str(&format!("channel: {link}\n"));
    if let Some(err) = status["last_error"].as_str() {
        out.push_str(&format!("error:   {err}\n"));
    }
    out
}

pub(crate) fn format_notification(note: &Value) -> Option<String> {
    match note["type"].as_str()? {
        "escalation" => {
            let mut line = format!("ESCALATION {}", note["call_id"].as_str().unwrap_or("?"));
            if let Some(score) = note["score"].as_f64() {
                line.push_str(&format!(" score={score:.2}"));
            }
            if let Some(reason) = note["reason"].as_str() {
                line.push_str(&format!(" reason={reason:?}"));
            }
            Some(line)
        }
        "snapshot_applied" => Some(format!(
            "snapshot: {} active, {} escalated",
            note["active"].as_u64().unwrap_or(0),
            note["escalated"].as_u64().unwrap_or(0)
        )),
        "poll_failed" => Some(format!(
            "poll failed: {}",
            note["error"].as_str().unwrap_or("unknown error")
        )),
        "scope_changed" => Some(match note["business"].as_str() {
            Some(b) => format!("scope: {b}"),
            None => "scope: none".to_string(),
        }),
        "takeover_requested" => Some(format!(
            "takeover requested for {}",
            note["call_id"].as_str().unwrap_or("?")
        )),
        _ => None,
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

fn format_elapsed(secs: i64) -> String {
    let secs = secs.max(0);
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T10:02:05Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn view_without_business() {
        let out = format_view(&json!({"status": "no_business_linked"}), now());
        assert_eq!(out, "no business linked\n");
    }

    #[test]
    fn view_lists_active_calls_with_flags() {
        let view = json!({
            "status": "live",
            "scope": "biz-A",
            "active": [
                {"id": "c1", "caller_number": "+15550001", "caller_name": null,
                 "started_at": "2026-01-01T10:00:00Z", "escalation_pending": true,
                 "takeover_until": "2026-01-01T10:02:06Z"},
                {"id": "c2", "caller_number": "+15550002", "caller_name": "Ada",
                 "started_at": "2026-01-01T10:01:00Z", "escalation_pending": false,
                 "takeover_until": null}
            ],
            "pending_escalations": [
                {"call": {"id": "c1"}, "origin": "provisional", "reason": "asked for manager"}
            ]
        });
        let out = format_view(&view, now());
        assert!(out.starts_with("business biz-A [live]\n"));
        assert!(out.contains("active calls: 2"));
        let c1 = out.lines().find(|l| l.contains("c1 ")).unwrap();
        assert!(c1.contains("02:05"));
        assert!(c1.contains("[ESCALATION, TAKEOVER REQUESTED]"));
        let c2 = out.lines().find(|l| l.contains("c2 ")).unwrap();
        assert!(c2.contains("Ada"));
        assert!(!c2.contains('['));
        assert!(out.contains("pending escalations: 1"));
        assert!(out.contains("asked for manager"));
    }

    #[test]
    fn stale_view_shows_error() {
        let view = json!({"status": "stale", "scope": "biz-A", "last_error": "timeout", "active": []});
        let out = format_view(&view, now());
        assert!(out.contains("[stale]"));
        assert!(out.contains("last poll failed: timeout"));
    }

    #[test]
    fn status_lines() {
        let out = format_status(&json!({
            "authenticated": true,
            "status": "live",
            "scope": "biz-A",
            "epoch": 2,
            "active_calls": 3,
            "pending_escalations": 1,
            "channel": {"linked": true, "connected": true, "room": "biz-A"}
        }));
        assert!(out.contains("session: logged in"));
        assert!(out.contains("live (scope biz-A, epoch 2)"));
        assert!(out.contains("3 active, 1 pending escalation"));
        assert!(out.contains("channel: connected, room biz-A"));

        let out = format_status(&json!({"authenticated": false, "channel": null}));
        assert!(out.contains("logged out"));
        assert!(out.contains("channel: none"));
    }

    #[test]
    fn notification_lines() {
        let esc = json!({"type": "escalation", "call_id": "c1", "score": 0.876, "reason": "angry"});
        assert_eq!(
            format_notification(&esc).unwrap(),
            "ESCALATION c1 score=0.88 reason=\"angry\""
        );
        assert_eq!(
            format_notification(&json!({"type": "scope_changed", "business": null})).unwrap(),
            "scope: none"
        );
        assert!(format_notification(&json!({"type": "mystery"})).is_none());
        assert!(format_notification(&json!({})).is_none());
    }

    #[test]
    fn transcript_is_shown_and_truncated() {
        let long = "x".repeat(100);
        let view = json!({
            "status": "live",
            "scope": "biz-A",
            "active": [{"id": "c1", "caller_number": "+1", "started_at": "2026-01-01T10:00:00Z",
                        "last_transcript": long}]
        });
        let out = format_view(&view, now());
        let line = out.lines().find(|l| l.trim_start().starts_with('"')).unwrap();
        assert!(line.ends_with("...\""));
        assert_eq!(truncate("short", 72), "short");
    }

    #[test]
    fn elapsed_is_minutes_seconds() {
        assert_eq!(format_elapsed(0), "00:00");
        assert_eq!(format_elapsed(125), "02:05");
        assert_eq!(format_elapsed(-5), "00:00");
    }
}
