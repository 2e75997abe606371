//! The parent↔child bootstrap protocol (§4.8): a private, ordered control
//! channel independent of the IPC socket. In this implementation the
//! channel is the child's stdin/stdout, one JSON object per line — simpler
//! than a second socket and already private by construction (inherited
//! pipe, no filesystem node, no peer but the parent that spawned it).
//!
//! `Config` carries `agents` as a plain `BTreeMap<String, _>` and `services`
//! as an order-preserving map, so it serializes to JSON without any of the
//! host→service map's structure needing special handling here; the
//! domain→service *resolver* built from it (longest-prefix routing) is
//! reconstructed independently on each side from the same `Config`, never
//! serialized itself (§9 open question iii).

use keyhole_config::Config;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParentMessage {
    Bootstrap {
        ott: String,
        config: Config,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        vault_passphrase: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent: Option<String>,
    },
    Unlock {
        passphrase: String,
    },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootState {
    Ready,
    PendingUnlock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChildMessage {
    Ready { socket_path: String, state: BootState },
    Unlocked { state: BootState },
    Error { message: String },
}

/// Write one message as a single JSON line. The bootstrap channel is
/// strictly ordered and message-at-a-time, so a newline delimiter (instead
/// of length-prefixed framing) is sufficient here; only the IPC socket
/// needs to survive arbitrary binary bodies.
pub async fn write_message<W, M>(writer: &mut W, msg: &M) -> std::io::Result<()>
where
    W: AsyncWriteExt + Unpin,
    M: Serialize,
{
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

/// Read one message, or `Ok(None)` on clean EOF (the peer closed the pipe).
pub async fn read_message<R, M>(reader: &mut BufReader<R>) -> std::io::Result<Option<M>>
where
    R: tokio::io::AsyncRead + Unpin,
    M: for<'de> Deserialize<'de>,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    let msg = serde_json::from_str(line.trim_end()).map_err(|e| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
    })?;
    Ok(Some(msg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn bootstrap_message_round_trips_through_the_line_codec() {
        let config = Config {
            services: keyhole_config::ServiceMap::new(),
            agents: BTreeMap::new(),
            logging: None,
            socket_dir: None,
            vault_path: None,
        };
        let msg = ParentMessage::Bootstrap {
            ott: "deadbeef".to_string(),
            config,
            vault_passphrase: Some("hunter2-but-longer".to_string()),
            agent: None,
        };

        let mut buf: Vec<u8> = Vec::new();
        write_message(&mut buf, &msg).await.unwrap();

        let mut reader = BufReader::new(buf.as_slice());
        let got: ParentMessage = read_message(&mut reader).await.unwrap().unwrap();
        match got {
            ParentMessage::Bootstrap { ott, vault_passphrase, .. } => {
                assert_eq!(ott, "deadbeef");
                assert_eq!(vault_passphrase.as_deref(), Some("hunter2-but-longer"));
            }
            _ => panic!("expected Bootstrap"),
        }
    }

    #[tokio::test]
    async fn clean_eof_yields_none() {
        let mut reader = BufReader::new(&b""[..]);
        let got: Option<ParentMessage> = read_message(&mut reader).await.unwrap();
        assert!(got.is_none());
    }
}
