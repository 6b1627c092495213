//! IMAP mailbox source. Raw IMAP4rev1 over rustls (implicit TLS, port 993).
//!
//! Socket work is blocking and runs under `spawn_blocking`. Connect, read and
//! write all carry the configured operation timeout.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rustls_pki_types::ServerName;
use secrecy::ExposeSecret;
use tracing::{debug, info, warn};

use crate::channels::mailbox::{MailboxSession, MailboxSource, Message, UnreadMessages};
use crate::config::MailboxConfig;
use crate::error::MailboxError;

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// Real mailbox source speaking IMAP.
pub struct ImapMailbox {
    config: MailboxConfig,
}

impl ImapMailbox {
    pub fn new(config: MailboxConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MailboxSource for ImapMailbox {
    async fn connect(&self) -> Result<Box<dyn MailboxSession>, MailboxError> {
        let config = self.config.clone();
        let conn = tokio::task::spawn_blocking(move || ImapConnection::open(&config))
            .await
            .map_err(|e| MailboxError::Protocol(format!("IMAP connect task failed: {e}")))??;

        info!(host = %self.config.host, folder = %self.config.folder, "Connected to IMAP mailbox");
        Ok(Box::new(ImapSession {
            conn: Arc::new(Mutex::new(Some(conn))),
            host: self.config.host.clone(),
            uid_index: HashMap::new(),
        }))
    }
}

/// An open, authenticated, folder-selected IMAP session.
struct ImapSession {
    conn: Arc<Mutex<Option<ImapConnection>>>,
    host: String,
    /// Message id → UID for messages fetched in this session.
    uid_index: HashMap<String, u32>,
}

impl ImapSession {
    /// Run a blocking operation against the connection.
    async fn with_conn<T, F>(&self, op: F) -> Result<T, MailboxError>
    where
        F: FnOnce(&mut ImapConnection) -> Result<T, MailboxError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| MailboxError::Protocol("IMAP session lock poisoned".into()))?;
            let conn = guard
                .as_mut()
                .ok_or_else(|| MailboxError::Protocol("IMAP session is closed".into()))?;
            op(conn)
        })
        .await
        .map_err(|e| MailboxError::Protocol(format!("IMAP task failed: {e}")))?
    }
}

#[async_trait]
impl MailboxSession for ImapSession {
    async fn fetch_unread(&mut self) -> Result<UnreadMessages, MailboxError> {
        let uids = self.with_conn(|conn| conn.search_unseen()).await?;
        debug!(count = uids.len(), "Found unread messages");
        Ok(UnreadMessages::new(uids))
    }

    async fn next_message(
        &mut self,
        unread: &mut UnreadMessages,
    ) -> Result<Option<Message>, MailboxError> {
        while let Some(uid) = unread.next_key() {
            let raw = self.with_conn(move |conn| conn.fetch_peek(uid)).await?;
            let Some(raw) = raw else {
                debug!(uid, "Message disappeared before fetch");
                continue;
            };
            match Message::parse(&raw, || format!("imap-uid-{uid}")) {
                Some(message) => {
                    self.uid_index.insert(message.message_id.clone(), uid);
                    return Ok(Some(message));
                }
                None => warn!(uid, "Skipping unparseable message"),
            }
        }
        Ok(None)
    }

    async fn mark_read(&mut self, message_id: &str) -> Result<(), MailboxError> {
        let known = self.uid_index.get(message_id).copied();
        let id = message_id.to_string();
        self.with_conn(move |conn| {
            let uids = match known {
                Some(uid) => vec![uid],
                None => conn.search_message_id(&id)?,
            };
            if uids.is_empty() {
                return Err(MailboxError::NotFound { message_id: id });
            }
            conn.add_seen(&uids)
        })
        .await?;
        debug!(message_id, "Marked message as read");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), MailboxError> {
        let conn = Arc::clone(&self.conn);
        let result = tokio::task::spawn_blocking(move || {
            let taken = conn.lock().ok().and_then(|mut guard| guard.take());
            match taken {
                Some(mut conn) => conn.logout(),
                None => Ok(()),
            }
        })
        .await
        .map_err(|e| MailboxError::Protocol(format!("IMAP logout task failed: {e}")))?;
        debug!(host = %self.host, "IMAP session closed");
        result
    }
}

// ── Wire protocol ───────────────────────────────────────────────────

/// Tagged command response: untagged lines plus any literals, in order.
#[derive(Debug, Default)]
struct Response {
    lines: Vec<String>,
    literals: Vec<Vec<u8>>,
}

/// Blocking IMAP connection over TLS.
struct ImapConnection {
    stream: BufReader<TlsStream>,
    next_tag: u32,
}

impl ImapConnection {
    /// Connect, read the greeting, log in and select the configured folder.
    fn open(config: &MailboxConfig) -> Result<Self, MailboxError> {
        let connection_error = |reason: String| MailboxError::Connection {
            host: config.host.clone(),
            reason,
        };

        let addr = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .map_err(|e| connection_error(format!("DNS lookup failed: {e}")))?
            .next()
            .ok_or_else(|| connection_error("no address found".into()))?;

        let tcp = TcpStream::connect_timeout(&addr, config.timeout).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                MailboxError::Timeout {
                    timeout: config.timeout,
                }
            } else {
                connection_error(e.to_string())
            }
        })?;
        tcp.set_read_timeout(Some(config.timeout))?;
        tcp.set_write_timeout(Some(config.timeout))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = ServerName::try_from(config.host.clone())
            .map_err(|e| connection_error(format!("invalid server name: {e}")))?;
        let tls_conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| connection_error(format!("TLS setup failed: {e}")))?;

        let mut conn = Self {
            stream: BufReader::new(rustls::StreamOwned::new(tls_conn, tcp)),
            next_tag: 1,
        };

        let greeting = conn.read_line()?;
        if !greeting.starts_with("* OK") && !greeting.starts_with("* PREAUTH") {
            return Err(connection_error(format!(
                "unexpected greeting: {}",
                greeting.trim_end()
            )));
        }

        conn.command(&format!(
            "LOGIN {} {}",
            quote(&config.username),
            quote(config.password.expose_secret())
        ))
        .map_err(|e| match e {
            MailboxError::Protocol(_) => MailboxError::AuthFailed {
                username: config.username.clone(),
            },
            other => other,
        })?;

        conn.command(&format!("SELECT {}", quote(&config.folder)))?;
        Ok(conn)
    }

    fn search_unseen(&mut self) -> Result<Vec<u32>, MailboxError> {
        let resp = self.command("UID SEARCH UNSEEN")?;
        Ok(parse_search(&resp.lines))
    }

    fn search_message_id(&mut self, message_id: &str) -> Result<Vec<u32>, MailboxError> {
        let resp = self.command(&format!(
            "UID SEARCH HEADER Message-ID {}",
            quote(message_id)
        ))?;
        Ok(parse_search(&resp.lines))
    }

    /// Fetch the full message without setting `\Seen`.
    fn fetch_peek(&mut self, uid: u32) -> Result<Option<Vec<u8>>, MailboxError> {
        let resp = self.command(&format!("UID FETCH {uid} BODY.PEEK[]"))?;
        Ok(resp.literals.into_iter().next())
    }

    fn add_seen(&mut self, uids: &[u32]) -> Result<(), MailboxError> {
        let set = uids
            .iter()
            .map(|u| u.to_string())
            .collect::<Vec<_>>()
            .join(",");
        self.command(&format!("UID STORE {set} +FLAGS.SILENT (\\Seen)"))?;
        Ok(())
    }

    fn logout(&mut self) -> Result<(), MailboxError> {
        self.command("LOGOUT").map(|_| ())
    }

    fn read_line(&mut self) -> Result<String, MailboxError> {
        let mut buf = Vec::new();
        let n = self.stream.read_until(b'\n', &mut buf)?;
        if n == 0 {
            return Err(MailboxError::Protocol("IMAP connection closed".into()));
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Send a tagged command and collect the response up to its tagged status.
    fn command(&mut self, cmd: &str) -> Result<Response, MailboxError> {
        let tag = format!("A{} ", self.next_tag);
        self.next_tag += 1;

        let stream = self.stream.get_mut();
        stream.write_all(format!("{tag}{cmd}\r\n").as_bytes())?;
        stream.flush()?;

        let mut resp = Response::default();
        loop {
            let line = self.read_line()?;
            if let Some(status) = line.strip_prefix(&tag) {
                let status = status.trim();
                if status.starts_with("OK") {
                    return Ok(resp);
                }
                return Err(MailboxError::Protocol(format!(
                    "{} failed: {status}",
                    cmd.split_whitespace().take(2).collect::<Vec<_>>().join(" ")
                )));
            }
            if let Some(len) = literal_length(&line) {
                let mut literal = vec![0u8; len];
                self.stream.read_exact(&mut literal)?;
                resp.literals.push(literal);
            }
            resp.lines.push(line);
        }
    }
}

/// Quote a string as an IMAP quoted string.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Length of a literal announced at the end of a line (`... {123}\r\n`).
fn literal_length(line: &str) -> Option<usize> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    let body = trimmed.strip_suffix('}')?;
    let open = body.rfind('{')?;
    body[open + 1..].parse().ok()
}

/// Collect numbers from `* SEARCH n n n` lines.
fn parse_search(lines: &[String]) -> Vec<u32> {
    lines
        .iter()
        .filter_map(|line| line.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace())
        .filter_map(|n| n.parse().ok())
        .collect()
}
