//! Operator console.
//!
//! ```text
//! broadcast-file <path>            push a file to every file subscriber
//! broadcast-json <type> <json>     push an envelope to every duplex subscriber
//! broadcast-bytes <type> <text>    push bytes to every byte subscriber
//! subscribers                      list registered subscribers
//! help
//! quit
//! ```

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use tether_core::{ByteMessage, JsonEnvelope};

use crate::hub::{BroadcastHub, BroadcastReport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    BroadcastFile(PathBuf),
    BroadcastJson { kind: String, json: String },
    BroadcastBytes { kind: String, text: String },
    Subscribers,
    Help,
    Quit,
}

impl FromStr for ConsoleCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();

        match verb {
            "broadcast-file" if !rest.is_empty() => Ok(Self::BroadcastFile(PathBuf::from(rest))),
            "broadcast-json" | "broadcast-bytes" => {
                let Some((kind, body)) = rest.split_once(char::is_whitespace) else {
                    return Err(format!("usage: {verb} <type> <payload>"));
                };
                let (kind, body) = (kind.to_string(), body.trim().to_string());
                if verb == "broadcast-json" {
                    Ok(Self::BroadcastJson { kind, json: body })
                } else {
                    Ok(Self::BroadcastBytes { kind, text: body })
                }
            }
            "broadcast-file" => Err("usage: broadcast-file <path>".into()),
            "subscribers" => Ok(Self::Subscribers),
            "help" | "?" => Ok(Self::Help),
            "quit" | "exit" => Ok(Self::Quit),
            other => Err(format!("unknown command: {other} (try help)")),
        }
    }
}

const HELP: &str = "\
commands:
  broadcast-file <path>
  broadcast-json <type> <json>
  broadcast-bytes <type> <text>
  subscribers
  quit";

/// Read commands from `input` until `quit`, end of input, or shutdown.
/// `quit` cancels `shutdown`.
pub async fn run_console<R>(input: R, hub: Arc<BroadcastHub>, shutdown: CancellationToken)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => return,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                warn!("console read failed: {e}");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match line.parse::<ConsoleCommand>() {
            Ok(ConsoleCommand::Quit) => {
                shutdown.cancel();
                return;
            }
            Ok(command) => println!("{}", execute(&hub, command).await),
            Err(e) => println!("{e}"),
        }
    }
}

/// Run one command and describe the outcome.
pub async fn execute(hub: &BroadcastHub, command: ConsoleCommand) -> String {
    match command {
        ConsoleCommand::BroadcastFile(path) => match hub.broadcast_file(&path).await {
            Ok(report) => describe(&report),
            Err(e) => format!("broadcast failed: {e}"),
        },
        ConsoleCommand::BroadcastJson { kind, json } => {
            if let Err(e) = serde_json::from_str::<serde_json::Value>(&json) {
                return format!("invalid json: {e}");
            }
            describe(&hub.broadcast_json(&JsonEnvelope::new(kind, json)).await)
        }
        ConsoleCommand::BroadcastBytes { kind, text } => {
            describe(&hub.broadcast_bytes(&ByteMessage::new(kind, text.into_bytes())).await)
        }
        ConsoleCommand::Subscribers => {
            let subscribers = hub.subscribers();
            if subscribers.is_empty() {
                return "no subscribers".into();
            }
            subscribers
                .iter()
                .map(|s| format!("{:>4}  {:<5}  {}", s.id, s.kind, s.label))
                .collect::<Vec<_>>()
                .join("\n")
        }
        ConsoleCommand::Help => HELP.into(),
        ConsoleCommand::Quit => "bye".into(),
    }
}

fn describe(report: &BroadcastReport) -> String {
    if report.is_failure() {
        format!("broadcast failed: {report}")
    } else {
        report.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        assert_eq!(
            "broadcast-file  /tmp/a b.txt ".parse::<ConsoleCommand>().unwrap(),
            ConsoleCommand::BroadcastFile(PathBuf::from("/tmp/a b.txt"))
        );
        assert_eq!(
            r#"broadcast-json alert {"level": 3}"#.parse::<ConsoleCommand>().unwrap(),
            ConsoleCommand::BroadcastJson {
                kind: "alert".into(),
                json: r#"{"level": 3}"#.into()
            }
        );
        assert_eq!("subscribers".parse::<ConsoleCommand>().unwrap(), ConsoleCommand::Subscribers);
        assert_eq!("quit".parse::<ConsoleCommand>().unwrap(), ConsoleCommand::Quit);
        assert!("broadcast-json onlytype".parse::<ConsoleCommand>().is_err());
        assert!("broadcast-file".parse::<ConsoleCommand>().is_err());
        assert!("reboot".parse::<ConsoleCommand>().is_err());
    }

    #[tokio::test]
    async fn broadcasts_without_subscribers_report_failure() {
        let hub = BroadcastHub::default();
        let out = execute(&hub, ConsoleCommand::BroadcastBytes { kind: "t".into(), text: "x".into() }).await;
        assert_eq!(out, "broadcast failed: reached 0 of 0 subscribers");
        let out = execute(&hub, ConsoleCommand::BroadcastJson { kind: "t".into(), json: "{nope".into() }).await;
        assert!(out.starts_with("invalid json"));
    }

    #[tokio::test]
    async fn quit_cancels_shutdown() {
        let hub = Arc::new(BroadcastHub::default());
        let shutdown = CancellationToken::new();
        let input: &[u8] = b"subscribers\nquit\nsubscribers\n";
        run_console(input, hub, shutdown.clone()).await;
        assert!(shutdown.is_cancelled());
    }
}
