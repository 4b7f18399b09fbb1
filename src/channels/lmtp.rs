//! LMTP delivery to the mail store.
//!
//! One TCP connection per message; every read and write is bounded by the
//! configured I/O timeout. Only a 2xx final reply counts as delivered.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, info};

use crate::error::DeliveryError;
use crate::safety::{self, LOG_MAX_LEN};

/// Longest reply line accepted from the server.
const MAX_REPLY_LINE: usize = 4096;

/// Most continuation lines accepted in one reply.
const MAX_REPLY_LINES: usize = 64;

/// Somewhere a SAFE message can be handed off.
#[async_trait]
pub trait MailStore: Send + Sync {
    /// Deliver `raw` to `recipient`. `Ok` only once the store accepted it.
    async fn deliver(&self, recipient: &str, raw: &[u8]) -> Result<(), DeliveryError>;

    /// Confirm the store is reachable and speaking the protocol.
    async fn check_connection(&self) -> Result<(), DeliveryError>;
}

/// A parsed server reply: status code plus text of every line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn message(&self) -> String {
        self.lines.join(" ")
    }

    fn class(&self) -> u16 {
        self.code / 100
    }
}

/// LMTP client for a single host/port.
#[derive(Debug, Clone)]
pub struct LmtpClient {
    host: String,
    port: u16,
    io_timeout: Duration,
    lhlo_name: String,
}

impl LmtpClient {
    pub fn new(host: impl Into<String>, port: u16, io_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            io_timeout,
            lhlo_name: "postal-scan".to_string(),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn connect(&self) -> Result<Session, DeliveryError> {
        let endpoint = self.endpoint();
        let stream = tokio::time::timeout(self.io_timeout, TcpStream::connect(&endpoint))
            .await
            .map_err(|_| DeliveryError::Timeout(self.io_timeout))?
            .map_err(|e| DeliveryError::Connect {
                endpoint: endpoint.clone(),
                reason: e.to_string(),
            })?;
        let (read, write) = stream.into_split();
        let mut session = Session {
            reader: BufReader::new(read),
            writer: write,
            io_timeout: self.io_timeout,
        };

        let greeting = session.read_reply("greeting").await?;
        expect_class("greeting", &greeting, 2)?;

        let lhlo = session
            .command("LHLO", &format!("LHLO {}", self.lhlo_name))
            .await?;
        expect_class("LHLO", &lhlo, 2)?;

        Ok(session)
    }
}

#[async_trait]
impl MailStore for LmtpClient {
    async fn deliver(&self, recipient: &str, raw: &[u8]) -> Result<(), DeliveryError> {
        if recipient.is_empty() || recipient.contains(['<', '>', '\r', '\n']) {
            return Err(DeliveryError::Protocol {
                stage: "RCPT TO",
                reason: "invalid recipient".into(),
            });
        }

        let mut session = self.connect().await?;

        let reply = session.command("MAIL FROM", "MAIL FROM:<>").await?;
        expect_class("MAIL FROM", &reply, 2)?;

        let reply = session
            .command("RCPT TO", &format!("RCPT TO:<{recipient}>"))
            .await?;
        expect_class("RCPT TO", &reply, 2)?;

        let reply = session.command("DATA", "DATA").await?;
        expect_class("DATA", &reply, 3)?;

        session.write_all(&dot_stuff(raw)).await?;
        // LMTP answers once per accepted recipient; there is exactly one.
        let reply = session.read_reply("end of data").await?;
        expect_class("end of data", &reply, 2)?;

        session.quit().await;
        info!(recipient, bytes = raw.len(), code = reply.code, "LMTP delivery accepted");
        Ok(())
    }

    async fn check_connection(&self) -> Result<(), DeliveryError> {
        let mut session = self.connect().await?;
        session.quit().await;
        debug!(endpoint = %self.endpoint(), "LMTP endpoint reachable");
        Ok(())
    }
}

struct Session {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    io_timeout: Duration,
}

impl Session {
    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), DeliveryError> {
        let timeout = self.io_timeout;
        tokio::time::timeout(timeout, async {
            self.writer.write_all(bytes).await?;
            self.writer.flush().await
        })
        .await
        .map_err(|_| DeliveryError::Timeout(timeout))?
        .map_err(DeliveryError::from)
    }

    async fn command(&mut self, stage: &'static str, line: &str) -> Result<Reply, DeliveryError> {
        let mut bytes = Vec::with_capacity(line.len() + 2);
        bytes.extend_from_slice(line.as_bytes());
        bytes.extend_from_slice(b"\r\n");
        self.write_all(&bytes).await?;
        self.read_reply(stage).await
    }

    async fn read_reply(&mut self, stage: &'static str) -> Result<Reply, DeliveryError> {
        let mut code = None;
        let mut lines = Vec::new();

        loop {
            let mut buf = String::new();
            let timeout = self.io_timeout;
            // One byte past the limit is enough to tell an overlong line.
            let mut limited = (&mut self.reader).take(MAX_REPLY_LINE as u64 + 1);
            let n = tokio::time::timeout(timeout, limited.read_line(&mut buf))
                .await
                .map_err(|_| DeliveryError::Timeout(timeout))?
                .map_err(|e| match e.kind() {
                    std::io::ErrorKind::InvalidData => DeliveryError::Protocol {
                        stage,
                        reason: "reply is not valid UTF-8".into(),
                    },
                    _ => DeliveryError::from(e),
                })?;
            if n == 0 {
                return Err(DeliveryError::Protocol {
                    stage,
                    reason: "connection closed".into(),
                });
            }
            if buf.len() > MAX_REPLY_LINE || lines.len() >= MAX_REPLY_LINES {
                return Err(DeliveryError::Protocol {
                    stage,
                    reason: "reply too long".into(),
                });
            }

            let line = buf.trim_end_matches(['\r', '\n']);
            let (line_code, last, text) =
                parse_reply_line(line).ok_or_else(|| DeliveryError::Protocol {
                    stage,
                    reason: format!(
                        "unparseable reply line: {}",
                        safety::sanitize_for_log(line, LOG_MAX_LEN)
                    ),
                })?;

            match code {
                None => code = Some(line_code),
                Some(c) if c != line_code => {
                    return Err(DeliveryError::Protocol {
                        stage,
                        reason: format!("mixed reply codes {c} and {line_code}"),
                    });
                }
                Some(_) => {}
            }
            lines.push(text.to_string());

            if last {
                break;
            }
        }

        let code = code.ok_or_else(|| DeliveryError::Protocol {
            stage,
            reason: "empty reply".into(),
        })?;
        Ok(Reply { code, lines })
    }

    /// Best effort; the outcome is already decided.
    async fn quit(&mut self) {
        let _ = self.write_all(b"QUIT\r\n").await;
    }
}

/// Split `250-text` / `250 text` / `250` into (code, is_last, text).
fn parse_reply_line(line: &str) -> Option<(u16, bool, &str)> {
    let digits = line.get(..3)?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let code: u16 = digits.parse().ok()?;
    if !(200..600).contains(&code) {
        return None;
    }
    match line.as_bytes().get(3) {
        None => Some((code, true, "")),
        Some(b' ') => Some((code, true, &line[4..])),
        Some(b'-') => Some((code, false, &line[4..])),
        Some(_) => None,
    }
}

fn expect_class(stage: &'static str, reply: &Reply, class: u16) -> Result<(), DeliveryError> {
    if reply.class() == class {
        return Ok(());
    }
    let message = reply.message();
    Err(match reply.class() {
        4 => DeliveryError::Temporary {
            stage,
            code: reply.code,
            message,
        },
        5 => DeliveryError::Permanent {
            stage,
            code: reply.code,
            message,
        },
        _ => DeliveryError::Protocol {
            stage,
            reason: format!("unexpected reply {} {message}", reply.code),
        },
    })
}

/// Normalize line endings to CRLF, escape leading dots and append the
/// `.` terminator.
pub fn dot_stuff(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len() + raw.len() / 32 + 5);
    let mut at_line_start = true;
    let mut i = 0;

    while i < raw.len() {
        let b = raw[i];
        match b {
            b'\r' if raw.get(i + 1) == Some(&b'\n') => {
                out.extend_from_slice(b"\r\n");
                at_line_start = true;
                i += 2;
                continue;
            }
            b'\r' | b'\n' => {
                out.extend_from_slice(b"\r\n");
                at_line_start = true;
            }
            _ => {
                if at_line_start && b == b'.' {
                    out.push(b'.');
                }
                out.push(b);
                at_line_start = false;
            }
        }
        i += 1;
    }

    if !at_line_start {
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b".\r\n");
    out
}
