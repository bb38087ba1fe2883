//! Newline-delimited JSON framing over TCP or TLS. Realizes the "out of
//! scope" listener of the distilled spec as concrete code: both
//! [`crate::peer::PeerLink`] and the inbound request handler in
//! [`crate::router`] read and write one JSON array per line through a
//! [`Link`].

use std::time::Duration;

use meeseeks_core::error::PeerError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;

use crate::tls::TlsConfig;

/// Anything that can carry the framed protocol: a plain TCP stream or a
/// TLS-wrapped one, erased behind a trait object so the rest of this crate
/// doesn't need to be generic over the transport.
pub trait AsyncDuplex: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncDuplex for T {}

pub type BoxedDuplex = Box<dyn AsyncDuplex>;

/// One framed connection, plain or TLS, read/write split so a write never
/// blocks behind a pending read.
pub struct Link {
    reader: BufReader<ReadHalf<BoxedDuplex>>,
    writer: WriteHalf<BoxedDuplex>,
}

impl Link {
    pub fn new(stream: BoxedDuplex) -> Self {
        let (read_half, writer) = tokio::io::split(stream);
        Link {
            reader: BufReader::new(read_half),
            writer,
        }
    }

    /// Connects to `addr` (`host:port`), optionally negotiating TLS.
    pub async fn connect(addr: &str, tls: Option<&TlsConfig>) -> Result<Self, PeerError> {
        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|e| PeerError::Connect(addr.to_string(), e))?;
        tcp.set_nodelay(true).ok();
        let stream: BoxedDuplex = match tls {
            Some(cfg) => {
                let connector = crate::tls::build_connector(cfg)?;
                let connector = tokio_native_tls::TlsConnector::from(connector);
                let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
                let tls_stream = connector
                    .connect(host, tcp)
                    .await
                    .map_err(|e| PeerError::Tls(e.to_string()))?;
                Box::new(tls_stream)
            }
            None => Box::new(tcp),
        };
        Ok(Link::new(stream))
    }

    /// Wraps an already-accepted inbound connection, completing a TLS
    /// handshake if the listener is configured for one.
    pub async fn accept(
        tcp: TcpStream,
        acceptor: Option<&tokio_native_tls::TlsAcceptor>,
    ) -> Result<Self, PeerError> {
        tcp.set_nodelay(true).ok();
        let stream: BoxedDuplex = match acceptor {
            Some(acceptor) => {
                let tls_stream = acceptor
                    .accept(tcp)
                    .await
                    .map_err(|e| PeerError::Tls(e.to_string()))?;
                Box::new(tls_stream)
            }
            None => Box::new(tcp),
        };
        Ok(Link::new(stream))
    }

    /// Writes one compact JSON line (a request or response batch).
    pub async fn write_line<T: Serialize>(&mut self, value: &T) -> Result<(), PeerError> {
        self.write_line_with(value, false).await
    }

    /// Writes one JSON line, pretty-printed when `options.pretty` was set on
    /// the request batch this is a response to.
    pub async fn write_line_with<T: Serialize>(
        &mut self,
        value: &T,
        pretty: bool,
    ) -> Result<(), PeerError> {
        let json = if pretty {
            serde_json::to_string_pretty(value)?
        } else {
            serde_json::to_string(value)?
        };
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Reads one JSON line, deserializing into `T`. `Ok(None)` on clean EOF.
    pub async fn read_line<T: DeserializeOwned>(&mut self) -> Result<Option<T>, PeerError> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(line.trim_end())?))
    }

    /// Same as [`Link::read_line`] but treats EOF as an error and bounds the
    /// wait, for the round-trip side of a request (server-side reads use the
    /// plain, unbounded [`Link::read_line`] since a client may be idle).
    pub async fn read_line_timeout<T: DeserializeOwned>(
        &mut self,
        timeout: Duration,
    ) -> Result<T, PeerError> {
        match tokio::time::timeout(timeout, self.read_line::<T>()).await {
            Ok(Ok(Some(v))) => Ok(v),
            Ok(Ok(None)) => Err(PeerError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "peer closed connection",
            ))),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(PeerError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn linked_pair() -> (Link, Link) {
        let (a, b) = tokio::io::duplex(4096);
        (Link::new(Box::new(a)), Link::new(Box::new(b)))
    }

    #[tokio::test]
    async fn a_written_line_round_trips_through_the_reader() {
        let (mut a, mut b) = linked_pair();
        a.write_line(&json!(["submit", {"pool": "default"}])).await.unwrap();
        let got: serde_json::Value = b.read_line().await.unwrap().unwrap();
        assert_eq!(got, json!(["submit", {"pool": "default"}]));
    }

    // A pretty-printed body embeds literal newlines, so it cannot be framed
    // like a normal compact line; callers treat it as the final message on
    // the connection and read the raw bytes through to EOF instead of
    // line-by-line (see `router::serve_connection`).
    #[tokio::test]
    async fn pretty_printed_bodies_parse_once_read_to_eof() {
        let (mut a, mut b) = linked_pair();
        a.write_line_with(&json!({"a": 1}), true).await.unwrap();
        drop(a);
        let mut raw = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut b.reader, &mut raw)
            .await
            .unwrap();
        let text = String::from_utf8(raw).unwrap();
        assert!(text.contains('\n'), "pretty body should span multiple lines");
        let got: serde_json::Value = serde_json::from_str(text.trim_end()).unwrap();
        assert_eq!(got, json!({"a": 1}));
    }

    #[tokio::test]
    async fn read_line_returns_none_on_clean_eof() {
        let (a, mut b) = linked_pair();
        drop(a);
        let got: Option<serde_json::Value> = b.read_line().await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn read_line_timeout_errors_when_nothing_arrives_in_time() {
        let (_a, mut b) = linked_pair();
        let res = b
            .read_line_timeout::<serde_json::Value>(Duration::from_millis(20))
            .await;
        assert!(matches!(res, Err(PeerError::Timeout)));
    }

    #[tokio::test]
    async fn read_line_timeout_treats_eof_as_an_error_not_a_none() {
        let (a, mut b) = linked_pair();
        drop(a);
        let res = b
            .read_line_timeout::<serde_json::Value>(Duration::from_millis(20))
            .await;
        assert!(res.is_err());
        assert!(!matches!(res, Err(PeerError::Timeout)));
    }
}
