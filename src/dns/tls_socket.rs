//! Persistent DNS-over-TLS connection.
//!
//! # Responsibilities
//! - Keep one TLS connection to the configured resolver
//! - Frame queries with the 2-byte length prefix of DNS-over-TCP
//! - Match responses to pending queries by random transaction id
//! - Reconnect once when the socket reports EOF mid-query
//!
//! # Data Flow
//! ```text
//! lookup_ip(host)
//!     → register id in pending map → write [len][query]
//!     → reader task reads [len][response] → pending[id].send(response)
//!     → EOF / error → every pending query fails with Disconnected
//! ```

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use super::message::{build_query, message_id, parse_response, RecordType};
use crate::config::DnsOverTlsConfig;
use crate::error::{ProxyError, Result};
use crate::sync::lock;

type Pending = Arc<Mutex<HashMap<u16, oneshot::Sender<QueryResult>>>>;

#[derive(Debug)]
enum QueryResult {
    Answer(Vec<u8>),
    Disconnected,
}

struct Connection {
    writer: WriteHalf<TlsStream<TcpStream>>,
    pending: Pending,
    alive: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// A DNS-over-TLS client bound to one resolver.
pub struct DnsOverTlsSocket {
    settings: DnsOverTlsConfig,
    connector: TlsConnector,
    query_timeout: Duration,
    connection: tokio::sync::Mutex<Option<Connection>>,
    closed: AtomicBool,
}

impl DnsOverTlsSocket {
    pub fn new(
        settings: DnsOverTlsConfig,
        tls: Arc<rustls::ClientConfig>,
        query_timeout: Duration,
    ) -> Self {
        Self {
            settings,
            connector: TlsConnector::from(tls),
            query_timeout,
            connection: tokio::sync::Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &DnsOverTlsConfig {
        &self.settings
    }

    /// Resolves A records for `host`.
    pub async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>> {
        match self.query(host).await {
            Err(ProxyError::SocketClosed(_)) if !self.is_closed() => {
                tracing::debug!(host, resolver = %self.settings.host, "DNS socket ended mid-query, reconnecting");
                self.query(host).await.map_err(|e| match e {
                    ProxyError::SocketClosed(_) => ProxyError::canceled("dns socket disconnected"),
                    other => other,
                })
            }
            Err(ProxyError::SocketClosed(_)) => Err(ProxyError::canceled("dns socket closed")),
            other => other,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Closes the connection and cancels every pending query.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(mut connection) = self.connection.lock().await.take() {
            cancel_pending(&connection.pending);
            let _ = connection.writer.shutdown().await;
        }
    }

    async fn query(&self, host: &str) -> Result<Vec<IpAddr>> {
        let (id, rx, pending) = {
            let mut guard = self.connection.lock().await;
            if self.is_closed() {
                return Err(ProxyError::canceled("dns socket closed"));
            }
            let needs_connect = guard
                .as_ref()
                .map_or(true, |c| !c.alive.load(Ordering::SeqCst));
            if needs_connect {
                *guard = Some(self.connect().await?);
            }
            let Some(connection) = guard.as_mut() else {
                return Err(ProxyError::SocketClosed("before dns query"));
            };

            let (tx, rx) = oneshot::channel();
            let id = {
                let mut pending = lock(&connection.pending);
                let mut id: u16 = rand::random();
                while pending.contains_key(&id) {
                    id = rand::random();
                }
                pending.insert(id, tx);
                id
            };

            let query = build_query(id, host, RecordType::A)
                .map_err(|e| ProxyError::Dns(e.to_string()))?;
            let mut framed = Vec::with_capacity(query.len() + 2);
            framed.extend_from_slice(&(query.len() as u16).to_be_bytes());
            framed.extend_from_slice(&query);
            if let Err(error) = connection.writer.write_all(&framed).await {
                tracing::debug!(%error, "DNS query write failed");
                connection.alive.store(false, Ordering::SeqCst);
                lock(&connection.pending).remove(&id);
                return Err(ProxyError::SocketClosed("while writing dns query"));
            }
            (id, rx, connection.pending.clone())
        };

        match tokio::time::timeout(self.query_timeout, rx).await {
            Ok(Ok(QueryResult::Answer(bytes))) => {
                let response = parse_response(&bytes).map_err(|e| ProxyError::Dns(e.to_string()))?;
                Ok(response.addresses)
            }
            Ok(Ok(QueryResult::Disconnected)) | Ok(Err(_)) => {
                Err(ProxyError::SocketClosed("during dns query"))
            }
            Err(_) => {
                lock(&pending).remove(&id);
                Err(ProxyError::canceled(format!(
                    "dns query for {} timed out after {:?}",
                    host, self.query_timeout
                )))
            }
        }
    }

    async fn connect(&self) -> Result<Connection> {
        let address = (self.settings.host.as_str(), self.settings.port);
        let tcp = tokio::time::timeout(self.query_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| ProxyError::Timeout {
                what: "dns connect",
                after: self.query_timeout,
            })??;
        tcp.set_nodelay(true)?;
        let server_name = ServerName::try_from(self.settings.servername.clone())
            .map_err(|e| ProxyError::Dns(e.to_string()))?;
        let tls = self.connector.connect(server_name, tcp).await?;

        tracing::debug!(
            resolver = %self.settings.host,
            servername = %self.settings.servername,
            "DNS-over-TLS connected"
        );

        let (reader, writer) = tokio::io::split(tls);
        let pending: Pending = Arc::default();
        let alive = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(read_responses(reader, pending.clone(), alive.clone()));
        Ok(Connection {
            writer,
            pending,
            alive,
            reader,
        })
    }
}

async fn read_responses(
    mut reader: ReadHalf<TlsStream<TcpStream>>,
    pending: Pending,
    alive: Arc<AtomicBool>,
) {
    loop {
        let len = match reader.read_u16().await {
            Ok(len) => len as usize,
            Err(_) => break,
        };
        let mut message = vec![0; len];
        if reader.read_exact(&mut message).await.is_err() {
            break;
        }
        let Some(id) = message_id(&message) else { continue };
        if let Some(tx) = lock(&pending).remove(&id) {
            let _ = tx.send(QueryResult::Answer(message));
        }
    }
    alive.store(false, Ordering::SeqCst);
    cancel_pending(&pending);
}

fn cancel_pending(pending: &Pending) {
    for (_, tx) in lock(pending).drain() {
        let _ = tx.send(QueryResult::Disconnected);
    }
}
