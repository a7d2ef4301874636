//! Local out-of-band message listeners.
//!
//! The stream listener takes exactly one framed message per connection and then closes it.
//! The datagram listener treats every datagram as one complete message.

use crate::framing;

use bytes::Bytes;
use std::{io, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    io::AsyncRead,
    net::{ToSocketAddrs, UdpSocket},
    sync::mpsc,
    time,
};
use tracing::{debug, warn};

/// Bytes read per datagram. Anything longer is truncated by the socket.
pub const DATAGRAM_READ_SIZE: usize = 1024;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, message: Bytes);
}

impl MessageHandler for mpsc::UnboundedSender<Bytes> {
    fn handle(&self, message: Bytes) {
        let _ = self.send(message);
    }
}

/// Read one frame from `stream` and pass it on. Returns whether a message was delivered.
pub async fn handle_connection<S, H>(stream: S, handler: &H) -> io::Result<bool>
where
    S: AsyncRead + Unpin,
    H: MessageHandler + ?Sized,
{
    match framing::read_frame(stream).await? {
        Some(message) => {
            handler.handle(message);
            Ok(true)
        }
        None => {
            debug!("connection closed before a whole frame arrived");
            Ok(false)
        }
    }
}

#[cfg(unix)]
pub use self::stream::MessageServer;

#[cfg(unix)]
mod stream {
    use super::*;
    use std::path::{Path, PathBuf};
    use tokio::net::UnixListener;

    pub struct MessageServer {
        listener: UnixListener,
        path: PathBuf,
    }

    impl MessageServer {
        /// Bind at `path`, replacing a socket file left behind by an earlier run.
        pub fn bind(path: impl Into<PathBuf>) -> io::Result<Self> {
            let path = path.into();
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "removed stale socket"),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
            let listener = UnixListener::bind(&path)?;
            Ok(Self { listener, path })
        }

        pub fn path(&self) -> &Path {
            &self.path
        }

        /// Accept connections forever, each one handled on its own task.
        pub async fn serve<H: MessageHandler>(self, handler: Arc<H>) {
            loop {
                match self.listener.accept().await {
                    Ok((stream, _)) => {
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle_connection(stream, &*handler).await {
                                warn!(%err, "socket connection failed");
                            }
                            // the stream drops here, closing the connection
                        });
                    }
                    Err(err) => {
                        warn!(%err, "failed to accept socket connection");
                        time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        }
    }
}

pub struct DatagramListener {
    socket: UdpSocket,
}

impl DatagramListener {
    pub async fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        Ok(Self {
            socket: UdpSocket::bind(addr).await?,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn serve<H: MessageHandler>(self, handler: Arc<H>) {
        let mut buf = vec![0u8; DATAGRAM_READ_SIZE];
        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, peer)) => {
                    debug!(%peer, bytes = len, "datagram received");
                    handler.handle(Bytes::copy_from_slice(&buf[..len]));
                }
                Err(err) => warn!(%err, "failed to receive datagram"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::error::TryRecvError;

    #[tokio::test]
    async fn connection_without_whole_frame_delivers_nothing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let wire = 9u32.to_be_bytes();
        let delivered = handle_connection(&wire[..], &tx).await.unwrap();
        assert!(!delivered);
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stream_server_hands_over_one_message_per_connection() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::UnixStream;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobrunner.sock");
        let server = MessageServer::bind(&path).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(server.serve(Arc::new(tx)));

        // a connection that only sends the prefix is dropped silently
        let mut short = UnixStream::connect(&path).await.unwrap();
        short.write_all(&4u32.to_be_bytes()).await.unwrap();
        short.shutdown().await.unwrap();

        let mut conn = UnixStream::connect(&path).await.unwrap();
        framing::write_frame(&mut conn, b"status: ok").await.unwrap();
        assert_eq!(&rx.recv().await.unwrap()[..], b"status: ok");

        // the server closes the connection after the message
        let mut rest = Vec::new();
        conn.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stale_socket_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobrunner.sock");
        std::fs::write(&path, b"").unwrap();
        let server = MessageServer::bind(&path).unwrap();
        assert_eq!(server.path(), path.as_path());
    }

    #[tokio::test]
    async fn datagrams_are_whole_messages() {
        let listener = DatagramListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(listener.serve(Arc::new(tx)));

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"ping", addr).await.unwrap();
        assert_eq!(&rx.recv().await.unwrap()[..], b"ping");

        let oversized = vec![b'z'; DATAGRAM_READ_SIZE + 100];
        sender.send_to(&oversized, addr).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().len(), DATAGRAM_READ_SIZE);
    }
}
