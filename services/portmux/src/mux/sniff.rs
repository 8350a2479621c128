//! Protocol classification for freshly accepted connections.
//!
//! The first bytes of a connection are peeked (`MSG_PEEK`) instead of read,
//! so whichever stage takes the connection next sees the stream untouched.
//!
//! Classification rule:
//! - byte 0 = 0x16 (handshake record) and byte 1 = 0x03 (TLS major version) => TLS
//! - any other non-empty data => plaintext HTTP
//! - EOF, peek error or timeout with nothing received => unknown

use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::debug;

/// Default time to wait for the first bytes of a connection.
pub const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_secs(5);

/// Number of bytes inspected (one TLS record header).
pub const SNIFF_BYTES: usize = 5;

/// TLS record content type for handshake messages.
const TLS_HANDSHAKE_RECORD: u8 = 0x16;

/// Major version byte shared by SSLv3 and every TLS version.
const TLS_MAJOR_VERSION: u8 = 0x03;

/// Pause between peeks while only a partial record header is buffered.
const REPEEK_INTERVAL: Duration = Duration::from_millis(10);

/// Classification of a connection by its first bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// A TLS record header was seen.
    Tls,
    /// Anything else that sent at least one byte.
    Http,
    /// Nothing arrived before EOF or the timeout.
    Unknown,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tls => "tls",
            Protocol::Http => "http",
            Protocol::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a buffer of leading connection bytes.
pub fn classify_bytes(data: &[u8]) -> Protocol {
    match data {
        [] => Protocol::Unknown,
        [TLS_HANDSHAKE_RECORD, TLS_MAJOR_VERSION, ..] => Protocol::Tls,
        _ => Protocol::Http,
    }
}

/// A lone 0x16 could still become a TLS header once the next byte lands.
fn is_partial_tls_header(data: &[u8]) -> bool {
    data == [TLS_HANDSHAKE_RECORD]
}

/// Non-destructive protocol sniffer.
#[derive(Debug, Clone)]
pub struct Sniffer {
    timeout: Duration,
}

impl Sniffer {
    /// Create a sniffer with the given classification timeout.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Classification timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Peek at up to [`SNIFF_BYTES`] bytes of `stream` and classify it.
    ///
    /// Never consumes data from the socket.
    pub async fn classify(&self, stream: &TcpStream) -> Protocol {
        let deadline = Instant::now() + self.timeout;
        let mut buf = [0u8; SNIFF_BYTES];
        let mut seen = 0usize;

        loop {
            match timeout_at(deadline, stream.peek(&mut buf)).await {
                Ok(Ok(0)) => {
                    debug!("Connection closed before sending data");
                    return Protocol::Unknown;
                }
                Ok(Ok(n)) => {
                    seen = n;
                    if !is_partial_tls_header(&buf[..n]) {
                        return classify_bytes(&buf[..n]);
                    }
                }
                Ok(Err(e)) => {
                    debug!(error = %e, "Peek failed");
                    return classify_bytes(&buf[..seen]);
                }
                Err(_) => {
                    debug!(bytes_seen = seen, "Classification timeout");
                    return classify_bytes(&buf[..seen]);
                }
            }

            // peek returns immediately while data is buffered, so back off
            // until the rest of the record header arrives.
            if Instant::now() + REPEEK_INTERVAL >= deadline {
                return classify_bytes(&buf[..seen]);
            }
            sleep(REPEEK_INTERVAL).await;
        }
    }
}

impl Default for Sniffer {
    fn default() -> Self {
        Self::new(DEFAULT_SNIFF_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[rstest]
    #[case::tls10(&[0x16, 0x03, 0x01, 0x00, 0x5f], Protocol::Tls)]
    #[case::tls12(&[0x16, 0x03, 0x03, 0x02, 0x00], Protocol::Tls)]
    #[case::ssl3(&[0x16, 0x03, 0x00], Protocol::Tls)]
    #[case::two_bytes(&[0x16, 0x03], Protocol::Tls)]
    #[case::get(b"GET /", Protocol::Http)]
    #[case::post(b"POST ", Protocol::Http)]
    #[case::handshake_wrong_version(&[0x16, 0x02, 0x01], Protocol::Http)]
    #[case::alert_record(&[0x15, 0x03, 0x03], Protocol::Http)]
    #[case::lone_byte(&[0x16], Protocol::Http)]
    #[case::empty(&[], Protocol::Unknown)]
    fn classifies_leading_bytes(#[case] data: &[u8], #[case] expected: Protocol) {
        assert_eq!(classify_bytes(data), expected);
    }

    proptest! {
        #[test]
        fn tls_header_always_tls(rest in proptest::collection::vec(any::<u8>(), 0..3)) {
            let mut data = vec![0x16, 0x03];
            data.extend(rest);
            prop_assert_eq!(classify_bytes(&data), Protocol::Tls);
        }

        #[test]
        fn http_methods_always_http(
            method in prop::sample::select(vec![
                "GET", "HEAD", "POST", "PUT", "DELETE", "CONNECT", "OPTIONS", "TRACE", "PATCH",
            ]),
            tail in "[ -~]{0,8}",
        ) {
            let request = format!("{} {}", method, tail);
            let data = &request.as_bytes()[..request.len().min(SNIFF_BYTES)];
            prop_assert_eq!(classify_bytes(data), Protocol::Http);
        }

        #[test]
        fn non_empty_never_unknown(data in proptest::collection::vec(any::<u8>(), 1..=SNIFF_BYTES)) {
            prop_assert_ne!(classify_bytes(&data), Protocol::Unknown);
        }
    }

    #[tokio::test]
    async fn classify_does_not_consume() {
        let (mut client, server) = connected_pair().await;
        client.write_all(b"GET /index.html HTTP/1.1\r\n").await.unwrap();

        let protocol = Sniffer::default().classify(&server).await;
        assert_eq!(protocol, Protocol::Http);

        let mut server = server;
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET ");
    }

    #[tokio::test]
    async fn classify_waits_for_split_tls_header() {
        let (mut client, server) = connected_pair().await;
        client.write_all(&[0x16]).await.unwrap();

        let writer = tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            client.write_all(&[0x03, 0x01]).await.unwrap();
            client
        });

        let protocol = Sniffer::new(Duration::from_secs(2)).classify(&server).await;
        assert_eq!(protocol, Protocol::Tls);
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn classify_eof_is_unknown() {
        let (client, server) = connected_pair().await;
        drop(client);
        assert_eq!(Sniffer::default().classify(&server).await, Protocol::Unknown);
    }

    #[tokio::test]
    async fn classify_silent_client_times_out() {
        let (_client, server) = connected_pair().await;
        let started = Instant::now();
        let protocol = Sniffer::new(Duration::from_millis(100)).classify(&server).await;
        assert_eq!(protocol, Protocol::Unknown);
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
