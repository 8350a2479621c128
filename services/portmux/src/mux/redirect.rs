//! Plaintext HTTP to HTTPS redirects.
//!
//! Only the request line and the Host header are looked at. Whatever was read
//! before a blank line, EOF, the size cap or the deadline is parsed, and
//! anything missing or unusable degrades to a default (`/`, fallback host).
//! Request content is never forwarded anywhere.

use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout_at, Instant};
use tracing::debug;

/// Maximum number of request bytes read before answering.
pub const MAX_REQUEST_HEAD: usize = 4096;

/// Default budget for reading the request head.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

const READ_CHUNK: usize = 1024;

/// Where a plaintext request gets sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectTarget {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl RedirectTarget {
    /// Value of the `Location` header.
    pub fn location(&self) -> String {
        format!("https://{}:{}{}", self.host, self.port, self.path)
    }

    /// Complete `301` response.
    pub fn to_response(&self) -> String {
        format!(
            "HTTP/1.1 301 Moved Permanently\r\n\
             Location: {}\r\n\
             Content-Length: 0\r\n\
             Connection: close\r\n\
             \r\n",
            self.location()
        )
    }
}

/// Builds and sends redirects for plaintext connections.
#[derive(Debug, Clone)]
pub struct Redirector {
    public_port: u16,
    fallback_host: String,
    read_timeout: Duration,
}

impl Redirector {
    /// Create a redirector advertising `public_port`.
    pub fn new(public_port: u16, fallback_host: impl Into<String>) -> Self {
        Self {
            public_port,
            fallback_host: fallback_host.into(),
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    /// Override the request head read budget.
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Compute the redirect target for a (possibly truncated) request head.
    pub fn target_for(&self, head: &[u8]) -> RedirectTarget {
        let text = String::from_utf8_lossy(head);
        let path = parse_path(&text).unwrap_or("/");
        let host = parse_host(&text).unwrap_or(&self.fallback_host);

        RedirectTarget {
            host: host.to_string(),
            port: self.public_port,
            path: path.to_string(),
        }
    }

    /// Read the request head from `stream`, answer with a redirect and close
    /// the write side.
    pub async fn respond<S>(&self, stream: &mut S) -> io::Result<RedirectTarget>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let head = read_request_head(stream, self.read_timeout).await;
        let target = self.target_for(&head);

        debug!(
            head_bytes = head.len(),
            location = %target.location(),
            "Sending redirect"
        );

        stream.write_all(target.to_response().as_bytes()).await?;
        stream.flush().await?;
        stream.shutdown().await?;

        Ok(target)
    }
}

/// Read until a blank line, EOF, [`MAX_REQUEST_HEAD`] bytes or `budget`
/// elapses, whichever comes first. Read errors end the head early.
pub async fn read_request_head<R>(stream: &mut R, budget: Duration) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let deadline = Instant::now() + budget;
    let mut head = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];

    while head.len() < MAX_REQUEST_HEAD && !has_blank_line(&head) {
        let want = (MAX_REQUEST_HEAD - head.len()).min(READ_CHUNK);
        match timeout_at(deadline, stream.read(&mut chunk[..want])).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => head.extend_from_slice(&chunk[..n]),
            Ok(Err(e)) => {
                debug!(error = %e, "Request head read failed");
                break;
            }
            Err(_) => {
                debug!(head_bytes = head.len(), "Request head read timed out");
                break;
            }
        }
    }

    head
}

fn has_blank_line(data: &[u8]) -> bool {
    data.windows(4).any(|w| w == b"\r\n\r\n")
}

/// Second token of the request line, when it is an origin-form target.
fn parse_path(head: &str) -> Option<&str> {
    let request_line = head.lines().next()?;
    let target = request_line.split_whitespace().nth(1)?;

    (target.starts_with('/') && target.bytes().all(|b| b.is_ascii_graphic())).then_some(target)
}

/// Hostname portion of the first Host header, if it is well formed.
fn parse_host(head: &str) -> Option<&str> {
    head.lines()
        .skip(1)
        .take_while(|line| !line.is_empty())
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim().eq_ignore_ascii_case("host").then_some(value.trim())
        })
        .map(strip_port)
        .filter(|host| is_valid_host(host))
}

fn strip_port(value: &str) -> &str {
    if value.starts_with('[') {
        return match value.find(']') {
            Some(end) => &value[..=end],
            None => value,
        };
    }
    value.split(':').next().unwrap_or(value)
}

fn is_valid_host(host: &str) -> bool {
    if let Some(inner) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        return !inner.is_empty()
            && inner
                .chars()
                .all(|c| c.is_ascii_hexdigit() || c == ':' || c == '.');
    }

    !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}
