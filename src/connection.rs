use crate::protocol::MAX_MESSAGE_LEN;
use crate::wire_format::BackendMessage;
use crate::{Error, Result};
use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf,
    WriteHalf,
};
use tokio::net::TcpStream;
use tracing::debug;

/// Default buffer sizes for reading and writing
pub const DEFAULT_MIN_READ_BUFFER_SIZE: usize = 8192;
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 8192;

/// Size of the chunks message bodies are carved from. Independent of the
/// read buffer so every read-buffer size pays the same allocation cost.
pub const BODY_CHUNK_SIZE: usize = 64 * 1024;

/// Byte stream a connection runs over
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

/// Transport-level connection settings
#[derive(Clone, Debug)]
pub struct ConnectionOptions {
    /// Capacity of the read buffer network bytes are accumulated in
    pub min_read_buffer_size: usize,
    /// Capacity of the write buffer
    pub write_buffer_size: usize,
    /// Bound on the TCP connect; `None` waits for the OS
    pub connect_timeout: Option<Duration>,
    /// Disable Nagle's algorithm
    pub tcp_nodelay: bool,
    /// TCP keepalive idle time; `None` leaves the OS default
    pub tcp_keepalive: Option<Duration>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            min_read_buffer_size: DEFAULT_MIN_READ_BUFFER_SIZE,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            connect_timeout: None,
            tcp_nodelay: true,
            tcp_keepalive: None,
        }
    }
}

impl ConnectionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the read buffer capacity in bytes
    pub fn min_read_buffer_size(mut self, bytes: usize) -> Self {
        self.min_read_buffer_size = bytes;
        self
    }

    /// Set the write buffer capacity in bytes
    pub fn write_buffer_size(mut self, bytes: usize) -> Self {
        self.write_buffer_size = bytes;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }

    pub fn tcp_keepalive(mut self, idle: Duration) -> Self {
        self.tcp_keepalive = Some(idle);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.min_read_buffer_size == 0 {
            return Err(Error::InvalidArgument(
                "min_read_buffer_size must be positive".to_string(),
            ));
        }
        if self.write_buffer_size == 0 {
            return Err(Error::InvalidArgument(
                "write_buffer_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Async connection wrapper for the server socket.
///
/// Every byte from the server passes through a `BufReader` whose capacity is
/// the configured minimum read-buffer size; it is fixed for the connection's
/// lifetime.
pub struct Connection {
    reader: BufReader<ReadHalf<Box<dyn Stream>>>,
    writer: BufWriter<WriteHalf<Box<dyn Stream>>>,
    read_buffer_size: usize,
    write_buffer_size: usize,
    body: BytesMut,
}

impl Connection {
    /// Wrap an established stream
    pub fn new<S: Stream + 'static>(stream: S, options: &ConnectionOptions) -> Self {
        let stream: Box<dyn Stream> = Box::new(stream);
        let (read_half, write_half) = tokio::io::split(stream);

        Self {
            reader: BufReader::with_capacity(options.min_read_buffer_size, read_half),
            writer: BufWriter::with_capacity(options.write_buffer_size, write_half),
            read_buffer_size: options.min_read_buffer_size,
            write_buffer_size: options.write_buffer_size,
            body: BytesMut::with_capacity(BODY_CHUNK_SIZE),
        }
    }

    /// Connect to a PostgreSQL server over TCP
    pub async fn connect(host: &str, port: u16, options: &ConnectionOptions) -> Result<Self> {
        options.validate()?;

        let addr = format!("{}:{}", host, port);
        let connect = TcpStream::connect(&addr);
        let stream = match options.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, connect).await.map_err(|_| {
                Error::Connection(format!("Timed out connecting to {} after {:?}", addr, limit))
            })?,
            None => connect.await,
        }
        .map_err(|e| Error::Connection(format!("Failed to connect to {}: {}", addr, e)))?;

        stream
            .set_nodelay(options.tcp_nodelay)
            .map_err(|e| Error::Connection(format!("Failed to set TCP_NODELAY: {}", e)))?;

        if let Some(idle) = options.tcp_keepalive {
            let keepalive = socket2::TcpKeepalive::new().with_time(idle);
            socket2::SockRef::from(&stream)
                .set_tcp_keepalive(&keepalive)
                .map_err(|e| Error::Connection(format!("Failed to set keepalive: {}", e)))?;
        }

        debug!(
            %addr,
            read_buffer = options.min_read_buffer_size,
            "TCP connection established"
        );
        Ok(Self::new(stream, options))
    }

    /// Capacity of the read buffer
    pub fn read_buffer_size(&self) -> usize {
        self.read_buffer_size
    }

    /// Read one framed message body: type byte, then the body without its
    /// length word.
    pub async fn read_frame(&mut self) -> Result<(u8, Bytes)> {
        let code = self.reader.read_u8().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::Connection("Server closed the connection".to_string())
            } else {
                Error::Io(e)
            }
        })?;
        let len = self.reader.read_i32().await?;

        if len < 4 {
            return Err(Error::Protocol(format!("Invalid message length: {}", len)));
        }
        let len = len as usize - 4;
        if len > MAX_MESSAGE_LEN {
            return Err(Error::Protocol(format!("Message too large: {}", len)));
        }

        // Consecutive bodies share one chunk; a chunk is freed once every
        // frame and value sliced from it is dropped.
        self.body.clear();
        if self.body.capacity() < len {
            self.body = BytesMut::with_capacity(len.max(BODY_CHUNK_SIZE));
        }
        while self.body.len() < len {
            let wanted = (len - self.body.len()) as u64;
            let n = (&mut self.reader).take(wanted).read_buf(&mut self.body).await?;
            if n == 0 {
                return Err(Error::Connection(
                    "Server closed the connection mid-message".to_string(),
                ));
            }
        }
        Ok((code, self.body.split().freeze()))
    }

    /// Read and decode the next server message
    pub async fn read_message(&mut self) -> Result<BackendMessage> {
        let (code, body) = self.read_frame().await?;
        BackendMessage::decode(code, body)
    }

    /// Queue encoded frontend bytes
    pub async fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        Ok(self.writer.write_all(data).await?)
    }

    /// Flush the write buffer
    pub async fn flush(&mut self) -> Result<()> {
        Ok(self.writer.flush().await?)
    }

    /// Write a complete message and flush it
    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.write_bytes(data).await?;
        self.flush().await
    }

    /// Shut down the write side of the socket
    pub async fn shutdown(&mut self) -> Result<()> {
        Ok(self.writer.shutdown().await?)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("read_buffer_size", &self.read_buffer_size)
            .field("write_buffer_size", &self.write_buffer_size)
            .finish()
    }
}
