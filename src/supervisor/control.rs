//! Worker → supervisor control channel.
//!
//! A worker process writes one JSON object per line on stdout; the
//! supervisor reads the pipe. Log output never goes to stdout.

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use super::WorkerId;

/// Environment variable carrying the worker id into a re-executed worker.
pub const WORKER_ID_ENV: &str = "HX_WORKER_ID";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Every listener is accepting.
    Ready { pid: u32, addresses: Vec<String> },
    /// SIGTERM received; no new connections are accepted.
    Draining { pid: u32 },
}

impl ControlMessage {
    pub fn parse(line: &str) -> Option<Self> {
        serde_json::from_str(line.trim()).ok()
    }

    /// Write the message to this process's stdout.
    pub async fn announce(&self) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(self).map_err(std::io::Error::other)?;
        line.push(b'\n');
        let mut stdout = tokio::io::stdout();
        stdout.write_all(&line).await?;
        stdout.flush().await
    }
}

/// Id assigned by the supervisor, if this process is a spawned worker.
pub fn worker_id_from_env() -> Option<WorkerId> {
    std::env::var(WORKER_ID_ENV)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(WorkerId::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format() {
        let ready = ControlMessage::Ready {
            pid: 42,
            addresses: vec!["0.0.0.0:8000".into()],
        };
        let json = serde_json::to_string(&ready).unwrap();
        assert_eq!(json, r#"{"event":"ready","pid":42,"addresses":["0.0.0.0:8000"]}"#);
        assert_eq!(ControlMessage::parse(&json), Some(ready));
        assert_eq!(
            ControlMessage::parse(r#"{"event":"draining","pid":7}"#),
            Some(ControlMessage::Draining { pid: 7 })
        );
    }

    #[test]
    fn ignores_other_output() {
        assert_eq!(ControlMessage::parse("hello"), None);
        assert_eq!(ControlMessage::parse(r#"{"event":"unknown"}"#), None);
    }
}
