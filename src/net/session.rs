// TCP realization of the buffer transport. Frames are u64 length-prefixed.
// Connections are opened lazily on first egress, announce the dialer's listen
// address in a fixed-size preamble so the accepting side can route return
// traffic through the same stream, and live in an LRU keyed by the last
// outgoing use. Ingress never promotes a connection in the cache: an evicted
// connection keeps receiving (its read task stays alive), only egress
// migrates to a fresh stream.

use std::{io::ErrorKind, net::SocketAddr, time::Duration};

use bytes::Bytes;
use lru::LruCache;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    time::Instant,
};
use tracing::warn;

use crate::{
    event::{OnEvent, SendEvent, Timer},
    net::SendMessage,
};

const MAX_CONNECTION_NUM: usize = 1024;

const MAX_FRAME_LEN: usize = 1 << 20;

const PREAMBLE_LEN: usize = 32;

#[derive(Debug)]
pub enum NetEvent {
    Outgoing(SocketAddr, Bytes),
    Incoming(SocketAddr, TcpStream),
}

/// Egress handle held by message nets; forwards addressed buffers into the
/// connection session.
#[derive(Debug, Clone)]
pub struct Tcp<E>(pub E);

impl<E: SendEvent<NetEvent>> SendMessage<SocketAddr, Bytes> for Tcp<E> {
    fn send(&mut self, dest: SocketAddr, buf: Bytes) -> anyhow::Result<()> {
        self.0.send(NetEvent::Outgoing(dest, buf))
    }
}

pub struct TcpControl<F> {
    connections: LruCache<SocketAddr, Connection>,
    on_buf: F,
    preamble: Bytes,
}

#[derive(Debug)]
struct Connection {
    sender: UnboundedSender<Bytes>,
    used_at: Instant,
}

const ANONYMOUS: SocketAddr = SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0);

impl<F> TcpControl<F> {
    pub fn new(on_buf: F, addr: impl Into<Option<SocketAddr>>) -> Self {
        let addr = addr.into().unwrap_or(ANONYMOUS);
        let mut preamble = addr.to_string();
        assert!(preamble.len() < PREAMBLE_LEN);
        preamble += &" ".repeat(PREAMBLE_LEN - preamble.len());
        Self {
            connections: LruCache::new(MAX_CONNECTION_NUM.try_into().unwrap()),
            on_buf,
            preamble: preamble.into_bytes().into(),
        }
    }
}

impl<F: FnMut(&[u8]) -> anyhow::Result<()>> TcpControl<F> {
    async fn read_task(mut stream: OwnedReadHalf, mut on_buf: F, remote: SocketAddr) {
        loop {
            let len = match stream.read_u64().await {
                Ok(len) => len as usize,
                Err(err) => {
                    if !matches!(err.kind(), ErrorKind::UnexpectedEof) {
                        warn!("<<< {remote} {err}")
                    }
                    break;
                }
            };
            if let Err(err) = async {
                anyhow::ensure!(len <= MAX_FRAME_LEN, "frame length {len} out of bounds");
                let mut buf = vec![0; len];
                stream.read_exact(&mut buf).await?;
                on_buf(&buf)
            }
            .await
            {
                warn!("<<< {remote} {err}");
                break;
            }
        }
    }
}

impl<F> TcpControl<F> {
    async fn write_task(
        mut stream: OwnedWriteHalf,
        mut receiver: UnboundedReceiver<Bytes>,
        remote: SocketAddr,
    ) {
        while let Some(buf) = receiver.recv().await {
            if let Err(err) = async {
                stream.write_u64(buf.len() as _).await?;
                stream.write_all(&buf).await?;
                stream.flush().await
            }
            .await
            {
                warn!(">>> {remote} {err}");
                break;
            }
        }
    }
}

impl<F: FnMut(&[u8]) -> anyhow::Result<()> + Clone + Send + 'static> TcpControl<F> {
    fn on_outgoing(&mut self, remote: SocketAddr, mut buf: Bytes) -> anyhow::Result<()> {
        if let Some(connection) = self.connections.get_mut(&remote) {
            match connection.sender.send(buf) {
                Ok(()) => {
                    connection.used_at = Instant::now();
                    return Ok(());
                }
                Err(err) => {
                    self.connections.pop(&remote);
                    buf = err.0
                }
            }
        }
        while self.connections.len() >= MAX_CONNECTION_NUM {
            let (_, idle) = self.connections.peek_lru().unwrap();
            if idle.used_at.elapsed() < Duration::from_secs(15) {
                warn!("dropping egress to {remote}, connection cache full of active streams");
                return Ok(());
            }
            self.connections.pop_lru();
        }
        let (sender, receiver) = unbounded_channel::<Bytes>();
        let preamble = self.preamble.clone();
        let on_buf = self.on_buf.clone();
        tokio::spawn(async move {
            let dial = async {
                let mut stream = TcpStream::connect(remote).await?;
                stream.set_nodelay(true)?;
                stream.write_all(&preamble).await?;
                anyhow::Result::<_>::Ok(stream)
            };
            let stream = match dial.await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(">>> {remote} {err}");
                    return;
                }
            };
            let (read, write) = stream.into_split();
            tokio::spawn(Self::read_task(read, on_buf, remote));
            tokio::spawn(Self::write_task(write, receiver, remote));
        });
        if sender.send(buf).is_err() {
            warn!(">>> {remote} connection closed before first frame")
        } else {
            self.connections.push(
                remote,
                Connection {
                    sender,
                    used_at: Instant::now(),
                },
            );
        }
        Ok(())
    }

    fn on_incoming(&mut self, remote: SocketAddr, stream: TcpStream) -> anyhow::Result<()> {
        let (sender, receiver) = unbounded_channel::<Bytes>();
        let (read, write) = stream.into_split();
        tokio::spawn(Self::read_task(read, self.on_buf.clone(), remote));
        tokio::spawn(Self::write_task(write, receiver, remote));
        if remote != ANONYMOUS {
            let replaced = self.connections.put(
                remote,
                Connection {
                    sender,
                    used_at: Instant::now(),
                },
            );
            if replaced.is_some() {
                warn!("<<< {remote} replacing previous connection")
            }
        }
        Ok(())
    }
}

impl<F: FnMut(&[u8]) -> anyhow::Result<()> + Clone + Send + 'static> OnEvent<NetEvent>
    for TcpControl<F>
{
    fn on_event(&mut self, event: NetEvent, _: &mut impl Timer<NetEvent>) -> anyhow::Result<()> {
        match event {
            NetEvent::Outgoing(remote, buf) => self.on_outgoing(remote, buf),
            NetEvent::Incoming(remote, stream) => self.on_incoming(remote, stream),
        }
    }
}

pub async fn accept_session(
    listener: TcpListener,
    mut sender: impl SendEvent<NetEvent>,
) -> anyhow::Result<()> {
    loop {
        let (mut stream, peer_addr) = listener.accept().await?;
        let handshake = async {
            stream.set_nodelay(true)?;
            let mut preamble = vec![0; PREAMBLE_LEN];
            stream.read_exact(&mut preamble).await?;
            anyhow::Result::<SocketAddr>::Ok(std::str::from_utf8(&preamble)?.trim_end().parse()?)
        };
        match handshake.await {
            Ok(remote) => sender.send(NetEvent::Incoming(remote, stream))?,
            Err(err) => warn!("{peer_addr} {err}"),
        }
    }
}
