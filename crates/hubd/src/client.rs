//! Control socket client used by the CLI and the VPN hooks

use hub_core::control::{ControlRequest, ControlResponse};
use hub_core::{Error, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::debug;

/// Sends one request per connection to a running daemon
#[derive(Debug, Clone)]
pub struct ControlClient {
    socket: PathBuf,
}

impl ControlClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Send `request` and return the reply's data, keeping its error class
    pub async fn request(&self, request: &ControlRequest) -> Result<Value> {
        let stream = UnixStream::connect(&self.socket).await.map_err(|e| {
            Error::transport(
                "hubd",
                format!(
                    "cannot reach daemon at {}: {}. Is `hubd run` running?",
                    self.socket.display(),
                    e
                ),
            )
        })?;
        exchange(stream, request).await
    }
}

/// Write one request line and read one reply line
pub async fn exchange<S>(stream: S, request: &ControlRequest) -> Result<Value>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut line = serde_json::to_string(request)?;
    debug!("→ {}", line);
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;

    let mut reply = String::new();
    let n = BufReader::new(reader).read_line(&mut reply).await?;
    if n == 0 {
        return Err(Error::transport("hubd", "daemon closed the connection without a reply"));
    }
    debug!("← {}", reply.trim_end());
    serde_json::from_str::<ControlResponse>(&reply)?.into_result()
}
