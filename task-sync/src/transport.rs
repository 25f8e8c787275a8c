//! Mutually authenticated TLS transport
//!
//! Every message on the wire is preceded by a 4-byte big-endian length
//! that counts the prefix itself. One sync exchange is one request and
//! one response on a fresh connection.

use crate::config::{SyncConfig, TaskwarriorAccount};
use crate::error::{SyncError, SyncResult};
use crate::message::SyncMessage;
use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;

const LENGTH_PREFIX: usize = 4;

/// An open channel to a sync server
#[async_trait]
pub trait Connection: Send {
    async fn send(&mut self, message: &SyncMessage) -> SyncResult<()>;

    async fn receive(&mut self) -> SyncResult<SyncMessage>;

    /// Shut the channel down. Closing twice is a no-op.
    async fn close(&mut self) -> SyncResult<()>;
}

/// Opens connections for an account
#[async_trait]
pub trait Connector: Send + Sync {
    type Conn: Connection;

    async fn connect(&self, account: &TaskwarriorAccount, config: &SyncConfig) -> SyncResult<Self::Conn>;
}

/// Length-prefixed message framing over any byte stream
pub struct FramedConnection<T> {
    stream: Option<T>,
    io_timeout: Duration,
    max_message_size: usize,
}

impl<T> FramedConnection<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: T, config: &SyncConfig) -> Self {
        Self {
            stream: Some(stream),
            io_timeout: config.io_timeout,
            max_message_size: config.max_message_size,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    fn stream(&mut self) -> SyncResult<&mut T> {
        self.stream
            .as_mut()
            .ok_or_else(|| SyncError::Protocol("connection already closed".into()))
    }

    async fn write_frame(&mut self, body: &[u8]) -> SyncResult<()> {
        let total = body
            .len()
            .checked_add(LENGTH_PREFIX)
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| SyncError::Protocol(format!("message of {} bytes is too large", body.len())))?;

        let stream = self.stream()?;
        stream.write_all(&total.to_be_bytes()).await?;
        stream.write_all(body).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn read_frame(&mut self) -> SyncResult<Vec<u8>> {
        let max = self.max_message_size;
        let stream = self.stream()?;

        let mut prefix = [0u8; LENGTH_PREFIX];
        stream
            .read_exact(&mut prefix)
            .await
            .map_err(|e| SyncError::Protocol(format!("failed to read length prefix: {}", e)))?;

        let total = usize::try_from(u32::from_be_bytes(prefix))
            .map_err(|_| SyncError::Protocol("length prefix does not fit in memory".into()))?;
        let body_len = total
            .checked_sub(LENGTH_PREFIX)
            .ok_or_else(|| SyncError::Protocol(format!("length prefix {} is shorter than itself", total)))?;
        if body_len > max {
            return Err(SyncError::Protocol(format!(
                "response of {} bytes exceeds limit of {}",
                body_len, max
            )));
        }

        let mut body = vec![0u8; body_len];
        stream
            .read_exact(&mut body)
            .await
            .map_err(|e| SyncError::Protocol(format!("truncated response: {}", e)))?;
        Ok(body)
    }
}

#[async_trait]
impl<T> Connection for FramedConnection<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, message: &SyncMessage) -> SyncResult<()> {
        let encoded = message.encode();
        tracing::trace!(bytes = encoded.len(), "Sending message");
        let limit = self.io_timeout;
        timeout(limit, self.write_frame(encoded.as_bytes()))
            .await
            .map_err(|_| SyncError::Protocol(format!("send timed out after {:?}", limit)))?
    }

    async fn receive(&mut self) -> SyncResult<SyncMessage> {
        let limit = self.io_timeout;
        let body = timeout(limit, self.read_frame())
            .await
            .map_err(|_| SyncError::Protocol(format!("receive timed out after {:?}", limit)))??;
        tracing::trace!(bytes = body.len(), "Received message");

        let text = String::from_utf8(body)
            .map_err(|e| SyncError::Protocol(format!("response is not UTF-8: {}", e)))?;
        SyncMessage::decode(&text)
    }

    async fn close(&mut self) -> SyncResult<()> {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                tracing::debug!(error = %e, "Shutdown after sync failed");
            }
        }
        Ok(())
    }
}

/// Connects to a Taskwarrior server with the account's client certificate
#[derive(Debug, Default, Clone, Copy)]
pub struct TlsConnector;

impl TlsConnector {
    /// Build the rustls client configuration for an account.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Certificate` when any PEM input is unusable.
    pub fn client_config(account: &TaskwarriorAccount) -> SyncResult<ClientConfig> {
        let mut roots = RootCertStore::empty();
        for cert in parse_certs(&account.root_cert, "CA")? {
            roots
                .add(cert)
                .map_err(|e| SyncError::Certificate(format!("invalid CA certificate: {}", e)))?;
        }

        let chain = parse_certs(&account.client_cert, "client")?;
        let key = parse_key(&account.client_key)?;

        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| SyncError::Certificate(e.to_string()))?
            .with_root_certificates(roots)
            .with_client_auth_cert(chain, key)
            .map_err(|e| SyncError::Certificate(format!("client certificate rejected: {}", e)))
    }
}

#[async_trait]
impl Connector for TlsConnector {
    type Conn = FramedConnection<TlsStream<TcpStream>>;

    async fn connect(&self, account: &TaskwarriorAccount, config: &SyncConfig) -> SyncResult<Self::Conn> {
        let client_config = Self::client_config(account)?;
        let server_name = ServerName::try_from(account.host.clone())
            .map_err(|e| SyncError::Connect(format!("invalid host {}: {}", account.host, e)))?;

        let address = (account.host.as_str(), account.port);
        let tcp = timeout(config.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| SyncError::Connect(format!("timed out connecting to {}", account.label())))?
            .map_err(|e| SyncError::Connect(format!("{}: {}", account.label(), e)))?;

        let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));
        let tls = timeout(config.connect_timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| SyncError::Connect(format!("TLS handshake with {} timed out", account.label())))?
            .map_err(|e| SyncError::Connect(format!("TLS handshake with {} failed: {}", account.label(), e)))?;

        tracing::debug!(server = %account.label(), "TLS connection established");
        Ok(FramedConnection::new(tls, config))
    }
}

fn parse_certs(pem: &str, what: &str) -> SyncResult<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| SyncError::Certificate(format!("unreadable {} certificate: {}", what, e)))?;
    if certs.is_empty() {
        return Err(SyncError::Certificate(format!("no {} certificate found", what)));
    }
    Ok(certs)
}

fn parse_key(pem: &str) -> SyncResult<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| SyncError::Certificate(format!("unreadable client key: {}", e)))?
        .ok_or_else(|| SyncError::Certificate("no client key found".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn config() -> SyncConfig {
        SyncConfig {
            io_timeout: Duration::from_secs(2),
            max_message_size: 1024,
            ..SyncConfig::default()
        }
    }

    fn account(root_cert: &str) -> TaskwarriorAccount {
        TaskwarriorAccount {
            account_id: 1,
            host: "localhost".into(),
            port: 53589,
            org: "Public".into(),
            user: "alice".into(),
            user_key: "key".into(),
            root_cert: root_cert.into(),
            client_cert: String::new(),
            client_key: String::new(),
        }
    }

    #[tokio::test]
    async fn test_frame_prefix_counts_itself() {
        let (client, mut server) = duplex(4096);
        let mut conn = FramedConnection::new(client, &config());

        let mut message = SyncMessage::new();
        message.set_header("type", "sync");
        conn.send(&message).await.unwrap();

        let encoded = message.encode();
        let mut prefix = [0u8; 4];
        server.read_exact(&mut prefix).await.unwrap();
        assert_eq!(u32::from_be_bytes(prefix) as usize, encoded.len() + 4);

        let mut body = vec![0u8; encoded.len()];
        server.read_exact(&mut body).await.unwrap();
        assert_eq!(body, encoded.as_bytes());
    }

    #[tokio::test]
    async fn test_round_trip_between_peers() {
        let (a, b) = duplex(4096);
        let mut left = FramedConnection::new(a, &config());
        let mut right = FramedConnection::new(b, &config());

        let mut message = SyncMessage::new();
        message.set_header("code", "200");
        message.set_payload("line one\nline two\n");
        left.send(&message).await.unwrap();

        let received = right.receive().await.unwrap();
        assert_eq!(received.header("code"), Some("200"));
        assert_eq!(received.payload_lines().count(), 2);
    }

    #[tokio::test]
    async fn test_rejects_short_and_oversized_prefix() {
        let (client, mut server) = duplex(4096);
        let mut conn = FramedConnection::new(client, &config());
        server.write_all(&2u32.to_be_bytes()).await.unwrap();
        assert!(matches!(conn.receive().await, Err(SyncError::Protocol(_))));

        let (client, mut server) = duplex(4096);
        let mut conn = FramedConnection::new(client, &config());
        server.write_all(&4096u32.to_be_bytes()).await.unwrap();
        assert!(matches!(conn.receive().await, Err(SyncError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_truncated_response_is_protocol_error() {
        let (client, mut server) = duplex(4096);
        let mut conn = FramedConnection::new(client, &config());
        server.write_all(&20u32.to_be_bytes()).await.unwrap();
        server.write_all(b"code:200").await.unwrap();
        drop(server);

        assert!(matches!(conn.receive().await, Err(SyncError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_receive_times_out() {
        let (client, _server) = duplex(64);
        let mut conn = FramedConnection::new(
            client,
            &SyncConfig {
                io_timeout: Duration::from_millis(20),
                ..config()
            },
        );
        assert!(matches!(conn.receive().await, Err(SyncError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (client, _server) = duplex(64);
        let mut conn = FramedConnection::new(client, &config());
        conn.close().await.unwrap();
        conn.close().await.unwrap();
        assert!(conn.is_closed());
        assert!(conn.send(&SyncMessage::new()).await.is_err());
    }

    #[test]
    fn test_missing_certificates_are_rejected() {
        let err = TlsConnector::client_config(&account("not a pem")).unwrap_err();
        assert!(matches!(err, SyncError::Certificate(_)));
    }
}
