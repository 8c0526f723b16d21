//! One management-interface connection
//!
//! ```text
//! ← ENTER PASSWORD:            (only when a password is configured, no newline)
//! → <password>
//! ← SUCCESS: password is correct
//! ← >INFO:OpenVPN Management Interface Version 5 -- type 'help' for more info
//! → status 3
//! ← TITLE ... / CLIENT_LIST ... / END
//! → kill web-1
//! ← SUCCESS: common name 'web-1' found, 1 client(s) killed
//! → quit
//! ```
//!
//! Lines starting with `>` are asynchronous notifications and are skipped
//! wherever a command reply is expected.

use hub_core::config::{ManagementConfig, ManagementEndpoint};
use hub_core::{Error, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UnixStream};
use tracing::debug;

/// Ends with `:` and no newline
const PASSWORD_PROMPT: &str = "ENTER PASSWORD:";
const GREETING: &str = ">INFO";
const END_MARKER: &str = "END";

trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// An authenticated management connection
///
/// Nothing here applies a timeout; callers bound the whole round trip.
pub struct ManagementSession {
    transport: String,
    stream: BufReader<Box<dyn Stream>>,
}

impl ManagementSession {
    /// Connect, authenticate if needed and consume the greeting
    pub async fn connect(transport: &str, config: &ManagementConfig) -> Result<Self> {
        let stream: Box<dyn Stream> = match &config.endpoint {
            ManagementEndpoint::Tcp { address } => Box::new(
                TcpStream::connect(address)
                    .await
                    .map_err(|e| Error::transport(transport, format!("connect to {}: {}", address, e)))?,
            ),
            ManagementEndpoint::Unix { path } => Box::new(UnixStream::connect(path).await.map_err(|e| {
                Error::transport(transport, format!("connect to {}: {}", path.display(), e))
            })?),
        };

        let mut session = Self {
            transport: transport.to_string(),
            stream: BufReader::new(stream),
        };

        if let Some(password) = &config.password {
            session.skip_past(PASSWORD_PROMPT).await?;
            session.write_line(password.expose()).await?;
            let reply = session.reply_line().await?;
            if !reply.starts_with("SUCCESS") {
                return Err(session.error("management password rejected"));
            }
        }

        loop {
            let line = session.read_line().await?;
            if line.starts_with(GREETING) {
                break;
            }
            debug!("{}: skipping pre-greeting line '{}'", session.transport, line);
        }
        Ok(session)
    }

    /// Send a command with a one-line reply
    pub async fn command(&mut self, command: &str) -> Result<String> {
        self.write_line(command).await?;
        self.reply_line().await
    }

    /// Send a command whose reply ends with an `END` line
    pub async fn command_multiline(&mut self, command: &str) -> Result<Vec<String>> {
        self.write_line(command).await?;
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line == END_MARKER {
                return Ok(lines);
            }
            if line.starts_with("ERROR") {
                return Err(self.error(format!("{} failed: {}", command, line)));
            }
            if !line.starts_with('>') {
                lines.push(line);
            }
        }
    }

    /// Say goodbye and close the connection
    pub async fn disconnect(mut self) -> Result<()> {
        self.write_line("quit").await?;
        self.stream.get_mut().shutdown().await.map_err(|e| self.io_error(e))
    }

    async fn reply_line(&mut self) -> Result<String> {
        loop {
            let line = self.read_line().await?;
            if !line.starts_with('>') {
                return Ok(line);
            }
        }
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        self.stream.write_all(&data).await.map_err(|e| self.io_error(e))?;
        self.stream.flush().await.map_err(|e| self.io_error(e))
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut raw = Vec::new();
        let n = self
            .stream
            .read_until(b'\n', &mut raw)
            .await
            .map_err(|e| self.io_error(e))?;
        if n == 0 {
            return Err(self.error("connection closed by peer"));
        }
        let line = String::from_utf8_lossy(&raw);
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Consume input up to and including `marker`, whose last byte is `:`
    async fn skip_past(&mut self, marker: &str) -> Result<()> {
        let mut seen = Vec::new();
        loop {
            let n = self
                .stream
                .read_until(b':', &mut seen)
                .await
                .map_err(|e| self.io_error(e))?;
            if n == 0 {
                return Err(self.error("connection closed by peer"));
            }
            if seen.ends_with(marker.as_bytes()) {
                return Ok(());
            }
        }
    }

    fn io_error(&self, e: std::io::Error) -> Error {
        self.error(e.to_string())
    }

    fn error(&self, message: impl Into<String>) -> Error {
        Error::transport(self.transport.clone(), message)
    }
}
