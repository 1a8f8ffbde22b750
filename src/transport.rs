//! Framed transport: newline-delimited JSON over TLS or plain TCP.
//!
//! One parsed object per read, one flushed line per write. No length
//! prefix — the wire format is bit-exact newline-delimited JSON; the
//! surrounding read/write/deadline shape follows the rest of this crate.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tracing::debug;

use crate::error::TransportError;
use crate::message::Message;

/// Either side of a transport, unified so the rest of the client doesn't
/// care whether TLS is in play.
enum Inner {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl tokio::io::AsyncRead for Inner {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Inner::Plain(s) => std::pin::Pin::new(s).poll_read(cx, buf),
            Inner::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl tokio::io::AsyncWrite for Inner {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Inner::Plain(s) => std::pin::Pin::new(s).poll_write(cx, buf),
            Inner::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Inner::Plain(s) => std::pin::Pin::new(s).poll_flush(cx),
            Inner::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Inner::Plain(s) => std::pin::Pin::new(s).poll_shutdown(cx),
            Inner::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Read half: single-consumer line reader.
pub struct FrameReader {
    reader: BufReader<tokio::io::ReadHalf<Inner>>,
    max_message_size: usize,
    read_deadline: Duration,
    line_buf: String,
}

/// Write half: single-producer, guarded by a mutex at the session layer.
pub struct FrameWriter {
    writer: tokio::io::WriteHalf<Inner>,
    max_message_size: usize,
    write_deadline: Duration,
}

pub fn split(
    stream: TcpStream,
    max_message_size: usize,
    read_deadline: Duration,
    write_deadline: Duration,
) -> (FrameReader, FrameWriter) {
    split_inner(
        Inner::Plain(stream),
        max_message_size,
        read_deadline,
        write_deadline,
    )
}

pub fn split_tls(
    stream: TlsStream<TcpStream>,
    max_message_size: usize,
    read_deadline: Duration,
    write_deadline: Duration,
) -> (FrameReader, FrameWriter) {
    split_inner(
        Inner::Tls(Box::new(stream)),
        max_message_size,
        read_deadline,
        write_deadline,
    )
}

fn split_inner(
    inner: Inner,
    max_message_size: usize,
    read_deadline: Duration,
    write_deadline: Duration,
) -> (FrameReader, FrameWriter) {
    let (read_half, write_half) = tokio::io::split(inner);
    (
        FrameReader {
            reader: BufReader::new(read_half),
            max_message_size,
            read_deadline,
            line_buf: String::new(),
        },
        FrameWriter {
            writer: write_half,
            max_message_size,
            write_deadline,
        },
    )
}

impl FrameReader {
    /// Read and parse the next frame, enforcing the read deadline and the
    /// max frame size. Returns `Ok(None)` on clean EOF.
    pub async fn read_message(&mut self) -> Result<Option<Message>, TransportError> {
        self.line_buf.clear();
        let read = tokio::time::timeout(
            self.read_deadline,
            self.reader.read_line(&mut self.line_buf),
        )
        .await
        .map_err(|_| TransportError::Timeout(self.read_deadline))?
        .map_err(|e| TransportError::Read(e.to_string()))?;

        if read == 0 {
            return Ok(None);
        }
        if self.line_buf.len() > self.max_message_size {
            return Err(TransportError::FrameTooLarge {
                size: self.line_buf.len(),
                limit: self.max_message_size,
            });
        }
        let trimmed = self.line_buf.trim_end_matches(['\n', '\r']);
        let message: Message =
            serde_json::from_str(trimmed).map_err(|e| TransportError::Read(e.to_string()))?;
        debug!(r#type = message.type_name(), "received frame");
        Ok(Some(message))
    }
}

impl FrameWriter {
    /// Serialize and write one frame, enforcing the write deadline and the
    /// max frame size. The size check happens before anything is written,
    /// per the framing contract (`FrameTooLarge` without a partial write).
    pub async fn write_message(&mut self, message: &Message) -> Result<(), TransportError> {
        let mut encoded =
            serde_json::to_vec(message).map_err(|e| TransportError::Write(e.to_string()))?;
        if encoded.len() > self.max_message_size {
            return Err(TransportError::FrameTooLarge {
                size: encoded.len(),
                limit: self.max_message_size,
            });
        }
        encoded.push(b'\n');
        tokio::time::timeout(self.write_deadline, async {
            self.writer.write_all(&encoded).await?;
            self.writer.flush().await
        })
        .await
        .map_err(|_| TransportError::Timeout(self.write_deadline))?
        .map_err(|e| TransportError::Write(e.to_string()))?;
        debug!(r#type = message.type_name(), "sent frame");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connector = TcpStream::connect(addr);
        let (accepted, connected) = tokio::join!(listener.accept(), connector);
        (accepted.unwrap().0, connected.unwrap())
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let (server_sock, client_sock) = loopback_pair().await;
        let (_r1, mut w1) = split(
            server_sock,
            1024 * 1024,
            Duration::from_secs(5),
            Duration::from_secs(5),
        );
        let (mut r2, _w2) = split(
            client_sock,
            1024 * 1024,
            Duration::from_secs(5),
            Duration::from_secs(5),
        );

        let msg = Message::hello(vec!["tls".into()]);
        w1.write_message(&msg).await.unwrap();
        let received = r2.read_message().await.unwrap().unwrap();
        assert_eq!(received, msg);
    }

    #[tokio::test]
    async fn oversized_write_is_rejected_before_sending() {
        let (server_sock, client_sock) = loopback_pair().await;
        let (_r1, mut w1) = split(server_sock, 16, Duration::from_secs(5), Duration::from_secs(5));
        let (mut r2, _w2) =
            split(client_sock, 16, Duration::from_secs(5), Duration::from_secs(5));

        let msg = Message::hello(vec!["tls".into(), "heartbeat".into(), "tunnel_info".into()]);
        let err = w1.write_message(&msg).await.unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { .. }));

        // Nothing was sent; confirm the peer has no data to read.
        drop(w1);
        let eof = r2.read_message().await.unwrap();
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn eof_yields_none() {
        let (server_sock, client_sock) = loopback_pair().await;
        drop(server_sock);
        let (mut r2, _w2) =
            split(client_sock, 1024, Duration::from_secs(5), Duration::from_secs(5));
        let result = r2.read_message().await.unwrap();
        assert!(result.is_none());
    }
}
