use std::net::SocketAddr;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::debug;

use crate::codec::WireCodec;
use crate::message::Message;
use crate::params::Network;
use crate::NetworkError;

/// Per-operation deadlines. An elapsed deadline surfaces as
/// [`NetworkError::Timeout`] and callers retry the operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeouts {
    pub read: Duration,
    pub write: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            read: Duration::from_secs(30),
            write: Duration::from_secs(10),
        }
    }
}

pub struct Connection<T = TcpStream> {
    framed: Framed<T, WireCodec>,
    peer: SocketAddr,
    timeouts: Timeouts,
}

impl Connection<TcpStream> {
    pub async fn connect(
        addr: SocketAddr,
        network: Network,
        timeouts: Timeouts,
        connect_timeout: Duration,
    ) -> Result<Self, NetworkError> {
        let stream = match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(NetworkError::Connect { addr, source }),
            Err(_) => return Err(NetworkError::Timeout),
        };
        stream.set_nodelay(true)?;
        Ok(Self::new(stream, addr, network, timeouts))
    }
}

impl<T> Connection<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: T, peer: SocketAddr, network: Network, timeouts: Timeouts) -> Self {
        Self {
            framed: Framed::new(io, WireCodec::new(network)),
            peer,
            timeouts,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub async fn send(&mut self, message: Message) -> Result<(), NetworkError> {
        debug!(peer = %self.peer, command = %message.command(), "sending");
        match timeout(self.timeouts.write, self.framed.send(message)).await {
            Ok(result) => result,
            Err(_) => Err(NetworkError::Timeout),
        }
    }

    /// Reads the next message. `ConnectionClosed` on EOF.
    pub async fn recv(&mut self) -> Result<Message, NetworkError> {
        match timeout(self.timeouts.read, self.framed.next()).await {
            Ok(Some(result)) => result,
            Ok(None) => Err(NetworkError::ConnectionClosed),
            Err(_) => Err(NetworkError::Timeout),
        }
    }

    pub fn split(self) -> (MessageWriter<T>, MessageReader<T>) {
        let (sink, stream) = self.framed.split();
        (
            MessageWriter {
                sink,
                peer: self.peer,
                deadline: self.timeouts.write,
            },
            MessageReader {
                stream,
                peer: self.peer,
                deadline: self.timeouts.read,
            },
        )
    }
}

/// Write half of a split connection.
pub struct MessageWriter<T> {
    sink: SplitSink<Framed<T, WireCodec>, Message>,
    peer: SocketAddr,
    deadline: Duration,
}

impl<T> MessageWriter<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Writes one message, retrying on elapsed deadlines until it is flushed
    /// or a hard error occurs. Callers bound the retries by racing this
    /// against their stop signal.
    pub async fn write(&mut self, message: Message) -> Result<(), NetworkError> {
        debug!(peer = %self.peer, command = %message.command(), "sending");
        loop {
            match timeout(self.deadline, self.sink.feed(message.clone())).await {
                Ok(result) => {
                    result?;
                    break;
                }
                Err(_) => debug!(peer = %self.peer, "write deadline elapsed, retrying"),
            }
        }
        loop {
            match timeout(self.deadline, self.sink.flush()).await {
                Ok(result) => return result,
                Err(_) => debug!(peer = %self.peer, "flush deadline elapsed, retrying"),
            }
        }
    }

    /// Flushes pending frames and shuts the write side down.
    pub async fn close(mut self) -> Result<(), NetworkError> {
        match timeout(self.deadline, self.sink.close()).await {
            Ok(result) => result,
            Err(_) => Err(NetworkError::Timeout),
        }
    }
}

/// Read half of a split connection.
pub struct MessageReader<T> {
    stream: SplitStream<Framed<T, WireCodec>>,
    peer: SocketAddr,
    deadline: Duration,
}

impl<T> MessageReader<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Waits up to the read deadline for the next message. Dropping the
    /// returned future never loses buffered bytes.
    pub async fn read(&mut self) -> Result<Message, NetworkError> {
        match timeout(self.deadline, self.stream.next()).await {
            Ok(Some(result)) => result,
            Ok(None) => Err(NetworkError::ConnectionClosed),
            Err(_) => Err(NetworkError::Timeout),
        }
    }
}
