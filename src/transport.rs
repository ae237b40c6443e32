//! Buffered connection to postgres.
//!
//! Framing only: one byte message type (absent for the startup family) and
//! a big-endian length inclusive of itself. Protocol state lives in the
//! [`machine`][crate::machine] layer; this type just moves frames between
//! buffers and the socket.
use std::{
    io,
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
};

use bytes::{Buf, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::{TcpStream, UnixStream},
};
use tokio_rustls::{
    client::TlsStream,
    rustls::{pki_types::ServerName, ClientConfig, RootCertStore},
    TlsConnector,
};

use crate::{
    config::{Config, TlsMode},
    error::{Error, Result, TlsError},
    postgres::{frontend, BackendMessage, BackendProtocol, FrontendProtocol},
};

const DEFAULT_BUF_CAPACITY: usize = 8 * 1024;

/// The underlying byte stream.
enum Socket {
    Tcp(TcpStream),
    Unix(UnixStream),
    Tls(Box<TlsStream<TcpStream>>),
}

macro_rules! with_socket {
    ($self:expr, $socket:pat => $expr:expr) => {
        match $self.get_mut() {
            Socket::Tcp($socket) => $expr,
            Socket::Unix($socket) => $expr,
            Socket::Tls($socket) => $expr,
        }
    };
}

impl AsyncRead for Socket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        with_socket!(self, s => Pin::new(s).poll_read(cx, buf))
    }
}

impl AsyncWrite for Socket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        with_socket!(self, s => Pin::new(s).poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        with_socket!(self, s => Pin::new(s).poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        with_socket!(self, s => Pin::new(s).poll_shutdown(cx))
    }
}

/// A buffered postgres stream: write side batches frontend messages, read
/// side decodes one backend frame at a time.
pub(crate) struct PgStream {
    socket: Socket,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl PgStream {
    /// Connect the raw socket per `config` (TLS comes later, after the
    /// server accepts the SSLRequest).
    pub async fn connect(config: &Config) -> Result<Self> {
        let socket = match &config.socket {
            Some(path) => Socket::Unix(UnixStream::connect(path.as_str()).await?),
            None => {
                let tcp = TcpStream::connect((config.host.as_str(), config.port)).await?;
                tcp.set_nodelay(true)?;
                Socket::Tcp(tcp)
            },
        };

        Ok(Self {
            socket,
            read_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            write_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
        })
    }

    /// Buffer a frontend message; [`flush`][Self::flush] sends it.
    pub fn send<F: FrontendProtocol>(&mut self, message: &F) {
        frontend::write(message, &mut self.write_buf);
    }

    pub fn send_startup(&mut self, startup: &frontend::Startup<'_>) {
        startup.write(&mut self.write_buf);
    }

    pub fn send_ssl_request(&mut self) {
        frontend::SslRequest.write(&mut self.write_buf);
    }

    pub fn wants_flush(&self) -> bool {
        !self.write_buf.is_empty()
    }

    pub fn poll_flush(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.write_buf.is_empty() {
            let n = ready!(Pin::new(&mut self.socket).poll_write(cx, &self.write_buf))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.write_buf.advance(n);
        }
        Pin::new(&mut self.socket).poll_flush(cx)
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        std::future::poll_fn(|cx| self.poll_flush(cx)).await
    }

    /// Read more bytes into the buffer; `Ok(0)` is EOF.
    pub fn poll_read(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        self.read_buf.reserve(DEFAULT_BUF_CAPACITY / 2);
        let spare = self.read_buf.spare_capacity_mut();
        let mut buf = ReadBuf::uninit(spare);
        ready!(Pin::new(&mut self.socket).poll_read(cx, &mut buf))?;
        let n = buf.filled().len();
        // SAFETY: poll_read initialized `n` bytes of the spare capacity
        unsafe { self.read_buf.set_len(self.read_buf.len() + n) };
        Poll::Ready(Ok(n))
    }

    /// Decode one complete frame out of the read buffer, if any.
    pub fn try_decode(&mut self) -> Result<Option<BackendMessage>> {
        let Some(mut header) = self.read_buf.get(..5) else {
            return Ok(None);
        };

        let msgtype = header.get_u8();
        let len = header.get_i32() as usize;

        if self.read_buf.len() - 1 < len {
            self.read_buf.reserve(1 + len - self.read_buf.len());
            return Ok(None);
        }

        self.read_buf.advance(5);
        let body = self.read_buf.split_to(len - 4).freeze();
        crate::common::verbose!("recv message {:?}", msgtype as char);

        Ok(Some(BackendMessage::decode(msgtype, body)?))
    }

    /// Receive one message, reading as needed; startup-phase helper.
    pub async fn recv(&mut self) -> Result<BackendMessage> {
        loop {
            if let Some(message) = self.try_decode()? {
                return Ok(message);
            }
            let n = std::future::poll_fn(|cx| self.poll_read(cx)).await?;
            if n == 0 {
                return Err(Error::unclean_shutdown());
            }
        }
    }

    /// Read the single-byte SSLRequest reply: `S` or `N`.
    pub async fn recv_ssl_reply(&mut self) -> Result<u8> {
        loop {
            if let Some(reply) = self.read_buf.first().copied() {
                self.read_buf.advance(1);
                return Ok(reply);
            }
            let n = std::future::poll_fn(|cx| self.poll_read(cx)).await?;
            if n == 0 {
                return Err(Error::unclean_shutdown());
            }
        }
    }

    /// Upgrade the TCP socket to TLS, presenting `config`'s SNI name.
    ///
    /// The read buffer must be empty: the server speaks TLS immediately
    /// after its `S` reply.
    pub async fn establish_tls(self, config: &Config) -> Result<Self> {
        debug_assert!(self.read_buf.is_empty(), "plaintext bytes left before TLS handshake");
        debug_assert!(config.tls == TlsMode::Require);

        let Socket::Tcp(tcp) = self.socket else {
            return Err(io::Error::other("TLS upgrade requires a TCP socket").into());
        };

        let mut roots = RootCertStore::empty();
        for cert in rustls_native_certs::load_native_certs().certs {
            let _ = roots.add(cert);
        }
        let tls_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let server_name = ServerName::try_from(config.sni_name().to_owned())
            .map_err(|_| TlsError::InvalidServerName)?;

        let connector = TlsConnector::from(Arc::new(tls_config));
        let tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| TlsError::Handshake(Arc::new(e)))?;

        Ok(Self {
            socket: Socket::Tls(Box::new(tls)),
            read_buf: self.read_buf,
            write_buf: self.write_buf,
        })
    }

    pub fn poll_shutdown(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.socket).poll_shutdown(cx)
    }
}

#[cfg(test)]
impl PgStream {
    /// A connected loopback pair for protocol tests.
    pub(crate) fn test_pair() -> (Self, Self) {
        let (a, b) = UnixStream::pair().unwrap();
        (Self::from_unix(a), Self::from_unix(b))
    }

    fn from_unix(socket: UnixStream) -> Self {
        Self {
            socket: Socket::Unix(socket),
            read_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            write_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
        }
    }

    pub(crate) fn take_read_buf(&mut self) -> BytesMut {
        self.read_buf.split()
    }

    pub(crate) fn send_raw(&mut self, bytes: &[u8]) {
        self.write_buf.extend_from_slice(bytes);
    }
}

impl std::fmt::Debug for PgStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.socket {
            Socket::Tcp(_) => "tcp",
            Socket::Unix(_) => "unix",
            Socket::Tls(_) => "tls",
        };
        f.debug_struct("PgStream")
            .field("socket", &kind)
            .field("buffered_read", &self.read_buf.len())
            .field("buffered_write", &self.write_buf.len())
            .finish()
    }
}

/// Framing sanity over a loopback socket pair.
#[cfg(test)]
mod test {
    use bytes::BufMut;

    use super::*;
    use crate::postgres::ProtocolError;

    fn stream_with_read_buf(bytes: &[u8]) -> PgStream {
        // the socket itself is never read in these tests
        let (client, _server) = UnixStream::pair().unwrap();
        PgStream {
            socket: Socket::Unix(client),
            read_buf: BytesMut::from(bytes),
            write_buf: BytesMut::new(),
        }
    }

    #[tokio::test]
    async fn decodes_a_complete_frame() {
        let mut frame = BytesMut::new();
        frame.put_u8(b'Z');
        frame.put_i32(5);
        frame.put_u8(b'I');
        let mut stream = stream_with_read_buf(&frame);

        let message = stream.try_decode().unwrap().unwrap();
        assert!(matches!(message, BackendMessage::ReadyForQuery(_)));
        assert!(stream.try_decode().unwrap().is_none());
    }

    #[tokio::test]
    async fn partial_frames_wait_for_more_bytes() {
        let mut frame = BytesMut::new();
        frame.put_u8(b'C');
        frame.put_i32(20); // declares more than is buffered
        frame.put_slice(b"SELECT");
        let mut stream = stream_with_read_buf(&frame);

        assert!(stream.try_decode().unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_message_type_is_a_protocol_error() {
        let mut frame = BytesMut::new();
        frame.put_u8(b'@');
        frame.put_i32(4);
        let mut stream = stream_with_read_buf(&frame);

        let err = stream.try_decode().unwrap_err();
        assert!(matches!(
            err.kind(),
            crate::error::ErrorKind::Protocol(ProtocolError::Unexpected { .. }),
        ));
    }

    #[tokio::test]
    async fn round_trip_over_the_loopback_pair() {
        let (client, server) = UnixStream::pair().unwrap();
        let mut stream = PgStream {
            socket: Socket::Unix(client),
            read_buf: BytesMut::new(),
            write_buf: BytesMut::new(),
        };
        let mut server = PgStream {
            socket: Socket::Unix(server),
            read_buf: BytesMut::new(),
            write_buf: BytesMut::new(),
        };

        stream.send(&frontend::Sync);
        assert!(stream.wants_flush());
        stream.flush().await.unwrap();

        // the peer sees exactly the framed message
        let n = std::future::poll_fn(|cx| server.poll_read(cx)).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(&server.read_buf[..], &[b'S', 0, 0, 0, 4]);
    }
}
