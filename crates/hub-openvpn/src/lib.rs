// # OpenVPN Management Client
//
// `VpnManagement` implementation speaking the OpenVPN management-interface
// line protocol over TCP or a Unix socket. One client exists per peer
// class; each runs its own OpenVPN instance.
//
// Every trait call is a complete round trip (connect, authenticate,
// command, quit) bounded by the configured timeout, so a wedged
// management socket can stall the job queue for at most that long.

pub mod session;

use async_trait::async_trait;
use hub_core::config::ManagementConfig;
use hub_core::traits::VpnManagement;
use hub_core::{Error, Result};
use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

pub use session::ManagementSession;

/// Connected-client rows of `status 3`
const CLIENT_LIST: &str = "CLIENT_LIST";

/// Common name OpenVPN reports before authentication completes
const UNDEF: &str = "UNDEF";

/// Common names listed in a `status 3` reply
pub fn parse_status(lines: &[String]) -> BTreeSet<String> {
    lines
        .iter()
        .filter_map(|line| {
            let mut fields = line.split('\t');
            match (fields.next(), fields.next()) {
                (Some(CLIENT_LIST), Some(name)) if !name.is_empty() && name != UNDEF => {
                    Some(name.to_string())
                }
                _ => None,
            }
        })
        .collect()
}

/// Management client for one OpenVPN instance
#[derive(Debug, Clone)]
pub struct OpenVpnManagement {
    name: String,
    config: ManagementConfig,
}

impl OpenVpnManagement {
    pub fn new(name: impl Into<String>, config: ManagementConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    /// Run `f` on a fresh session, bounded by the timeout
    async fn round_trip<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce(ManagementSession) -> Fut,
        Fut: Future<Output = Result<(ManagementSession, T)>>,
    {
        let work = async {
            let session = ManagementSession::connect(&self.name, &self.config).await?;
            let (session, value) = f(session).await?;
            if let Err(e) = session.disconnect().await {
                debug!("{}: unclean disconnect: {}", self.name, e);
            }
            Ok(value)
        };

        match tokio::time::timeout(self.timeout(), work).await {
            Ok(result) => result,
            Err(_) => Err(Error::transport(
                self.name.clone(),
                format!(
                    "no reply from {} within {}s",
                    self.config.endpoint, self.config.timeout_secs
                ),
            )),
        }
    }
}

#[async_trait]
impl VpnManagement for OpenVpnManagement {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connected_identifiers(&self) -> Result<BTreeSet<String>> {
        let lines = self
            .round_trip(|mut session| async move {
                let lines = session.command_multiline("status 3").await?;
                Ok((session, lines))
            })
            .await?;
        let live = parse_status(&lines);
        debug!("{}: {} clients connected", self.name, live.len());
        Ok(live)
    }

    async fn send_command(&self, command: &str) -> Result<String> {
        let command = command.to_string();
        self.round_trip(|mut session| async move {
            let reply = session.command(&command).await?;
            Ok((session, reply))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_core::config::{ManagementEndpoint, Secret};
    use hub_core::ErrorClass;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, UnixListener};

    const STATUS: &str = "TITLE\tOpenVPN 2.6.8 x86_64-pc-linux-gnu\n\
TIME\t2024-05-01 10:00:00\t1714557600\n\
HEADER\tCLIENT_LIST\tCommon Name\tReal Address\tVirtual Address\n\
CLIENT_LIST\tweb-1\t203.0.113.7:51820\t100.7.224.2\n\
CLIENT_LIST\tUNDEF\t203.0.113.9:40000\t\n\
>BYTECOUNT:1024,2048\n\
CLIENT_LIST\tlaptop\t198.51.100.3:1194\t100.7.208.2\n\
HEADER\tROUTING_TABLE\tVirtual Address\tCommon Name\n\
GLOBAL_STATS\tMax bcast/mcast queue length\t0\n\
END\n";

    /// Speak the server side of one session, recording received lines
    async fn serve<S>(stream: S, password: Option<&str>, log: Arc<Mutex<Vec<String>>>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut lines = BufReader::new(reader).lines();

        if let Some(expected) = password {
            writer.write_all(b"ENTER PASSWORD:").await.unwrap();
            let given = lines.next_line().await.unwrap().unwrap();
            if given != expected {
                writer.write_all(b"ERROR: bad password\n").await.unwrap();
                return;
            }
            writer.write_all(b"SUCCESS: password is correct\n").await.unwrap();
        }
        writer
            .write_all(b">INFO:OpenVPN Management Interface Version 5 -- type 'help' for more info\n")
            .await
            .unwrap();

        while let Ok(Some(line)) = lines.next_line().await {
            log.lock().unwrap().push(line.clone());
            let reply = match line.as_str() {
                "status 3" => STATUS.to_string(),
                "quit" => return,
                cmd if cmd.starts_with("kill ") => {
                    format!(">NOTIFY:info\nSUCCESS: common name '{}' found, 1 client(s) killed\n", &cmd[5..])
                }
                _ => "ERROR: unknown command, enter 'help' for more options\n".to_string(),
            };
            writer.write_all(reply.as_bytes()).await.unwrap();
        }
    }

    async fn tcp_server(password: Option<&'static str>) -> (ManagementConfig, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let log = Arc::new(Mutex::new(Vec::new()));
        let server_log = log.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                serve(stream, password, server_log.clone()).await;
            }
        });

        let mut config = ManagementConfig::new(ManagementEndpoint::Tcp { address });
        config.timeout_secs = 2;
        if let Some(password) = password {
            config.password = Some(Secret::new(password));
        }
        (config, log)
    }

    #[test]
    fn test_parse_status_skips_headers_and_undef() {
        let lines: Vec<String> = STATUS.lines().map(String::from).collect();
        let live = parse_status(&lines);
        assert_eq!(live, BTreeSet::from(["laptop".to_string(), "web-1".to_string()]));
    }

    #[tokio::test]
    async fn test_connected_identifiers_over_tcp() {
        let (config, log) = tcp_server(None).await;
        let client = OpenVpnManagement::new("openvpn-servers", config);

        let live = client.connected_identifiers().await.unwrap();
        assert_eq!(live.len(), 2);
        assert_eq!(log.lock().unwrap().first().map(String::as_str), Some("status 3"));
    }

    #[tokio::test]
    async fn test_kill_skips_notifications() {
        let (config, _log) = tcp_server(None).await;
        let client = OpenVpnManagement::new("openvpn-users", config);

        client.kill("laptop").await.unwrap();
        let reply = client.send_command("bogus").await.unwrap();
        assert!(reply.starts_with("ERROR"));
    }

    #[tokio::test]
    async fn test_password_authentication() {
        let (config, _log) = tcp_server(Some("hunter2")).await;
        let client = OpenVpnManagement::new("openvpn-servers", config.clone());
        assert_eq!(client.connected_identifiers().await.unwrap().len(), 2);

        let mut wrong = config;
        wrong.password = Some(Secret::new("nope"));
        let err = OpenVpnManagement::new("openvpn-servers", wrong)
            .connected_identifiers()
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Transport);
    }

    #[tokio::test]
    async fn test_prompt_split_across_reads() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = tokio::io::split(stream);
            let mut lines = BufReader::new(reader).lines();

            writer.write_all(b"NOTE: legacy banner\nENTER PAS").await.unwrap();
            writer.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            writer.write_all(b"SWORD:").await.unwrap();

            assert_eq!(lines.next_line().await.unwrap().unwrap(), "hunter2");
            writer
                .write_all(b"SUCCESS: password is correct\n>INFO:OpenVPN Management Interface\n")
                .await
                .unwrap();
            let command = lines.next_line().await.unwrap().unwrap();
            assert_eq!(command, "kill web-1");
            writer
                .write_all(b"SUCCESS: common name 'web-1' found, 1 client(s) killed\n")
                .await
                .unwrap();
            let _ = lines.next_line().await;
        });

        let mut config = ManagementConfig::new(ManagementEndpoint::Tcp { address });
        config.timeout_secs = 2;
        config.password = Some(Secret::new("hunter2"));
        OpenVpnManagement::new("openvpn-servers", config)
            .kill("web-1")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unix_socket_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("management.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let server_log = log.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            serve(stream, None, server_log).await;
        });

        let config = ManagementConfig::new(ManagementEndpoint::Unix { path });
        let live = OpenVpnManagement::new("openvpn-users", config)
            .connected_identifiers()
            .await
            .unwrap();
        assert!(live.contains("web-1"));
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            // accept and hold the connection without greeting
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let mut config = ManagementConfig::new(ManagementEndpoint::Tcp { address });
        config.timeout_secs = 1;
        let err = OpenVpnManagement::new("openvpn-servers", config)
            .connected_identifiers()
            .await
            .unwrap_err();
        assert!(err.is_transport());
        assert!(err.to_string().contains("within 1s"));
    }

    #[tokio::test]
    async fn test_refused_connection_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let config = ManagementConfig::new(ManagementEndpoint::Tcp { address });
        let err = OpenVpnManagement::new("openvpn-servers", config)
            .connected_identifiers()
            .await
            .unwrap_err();
        assert!(err.is_transport());
    }
}
