//! TCP link to one peer: hello handshake, then length-prefixed JSON frames both ways.
//! A reader task forwards inbound frame bodies; a writer task drains a bounded queue that
//! the session's [`TcpChannel`] feeds.

use anyhow::{bail, Context};
use peerlink_core::{encode_frame, ChannelAdapter, ChannelError, Identity, Message, PeerId, MAX_FRAME_LEN};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::signal::{self, Control, Frame};

const LEN_SIZE: usize = 4;
/// Frames queued towards the socket before sends are refused.
pub const LINK_BACKLOG: usize = 64;

/// An established link, ready to hand to the session.
pub struct Link {
    pub peer: PeerId,
    pub channel: TcpChannel,
    /// Inbound frame bodies; closes when the peer goes away.
    pub inbound: mpsc::Receiver<Vec<u8>>,
}

pub async fn listen(port: u16) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    Ok(listener)
}

pub async fn accept(listener: &TcpListener, local: &PeerId) -> anyhow::Result<Link> {
    loop {
        let (mut stream, addr) = listener.accept().await?;
        match handshake(&mut stream, local).await {
            Ok(peer) => {
                info!(%peer, %addr, "peer connected");
                return Ok(spawn_io(stream, peer));
            }
            Err(e) => warn!(%addr, error = %e, "handshake failed"),
        }
    }
}

pub async fn connect(addr: &str, local: &PeerId) -> anyhow::Result<Link> {
    let mut stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connecting to {addr}"))?;
    let peer = handshake(&mut stream, local).await?;
    info!(%peer, %addr, "connected");
    Ok(spawn_io(stream, peer))
}

/// Exchange hello frames. Both sides send first, so neither blocks on the other.
async fn handshake<S>(stream: &mut S, local: &PeerId) -> anyhow::Result<PeerId>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello = Control::Hello(local.as_str().to_string()).to_frame()?;
    stream.write_all(&hello).await?;
    stream.flush().await?;
    let Some(body) = read_frame(stream).await? else {
        bail!("peer closed during handshake");
    };
    match signal::demux(&body)? {
        Frame::Control(Control::Hello(name)) => {
            let identity = Identity::login(&name).context("peer sent an invalid name")?;
            if identity.peer_id() == local {
                bail!("peer uses our own name {local}");
            }
            Ok(identity.peer_id().clone())
        }
        other => bail!("expected hello, got {other:?}"),
    }
}

/// Read one frame body. `None` on a clean end of stream at a frame boundary.
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; LEN_SIZE];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

fn spawn_io(stream: TcpStream, peer: PeerId) -> Link {
    let (mut reader, mut writer) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(LINK_BACKLOG);
    let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(LINK_BACKLOG);

    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if let Err(e) = writer.write_all(&frame).await {
                warn!(error = %e, "link write failed");
                break;
            }
        }
        let _ = writer.shutdown().await;
        debug!("link writer done");
    });

    let reader_peer = peer.clone();
    tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(Some(body)) => {
                    if in_tx.send(body).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    info!(peer = %reader_peer, "link closed by peer");
                    break;
                }
                Err(e) => {
                    warn!(peer = %reader_peer, error = %e, "link read failed");
                    break;
                }
            }
        }
    });

    Link {
        peer: peer.clone(),
        channel: TcpChannel {
            peer,
            tx: out_tx,
            open: true,
        },
        inbound: in_rx,
    }
}

/// Session-side end of a link. Dropping it lets the writer finish and close the socket.
pub struct TcpChannel {
    peer: PeerId,
    tx: mpsc::Sender<Vec<u8>>,
    open: bool,
}

impl TcpChannel {
    /// Channel with no socket behind it; the receiver sees what would be written.
    #[cfg(test)]
    pub fn detached(peer: PeerId) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(LINK_BACKLOG);
        (Self { peer, tx, open: true }, rx)
    }

    /// Free slots in the outbound queue.
    pub fn headroom(&self) -> usize {
        self.tx.capacity()
    }

    pub fn send_control(&mut self, control: &Control) -> Result<(), ChannelError> {
        let frame = control
            .to_frame()
            .map_err(|e| ChannelError::Send(e.to_string()))?;
        self.enqueue(frame)
    }

    fn enqueue(&mut self, frame: Vec<u8>) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ChannelError::Full,
            mpsc::error::TrySendError::Closed(_) => ChannelError::Closed,
        })
    }
}

impl ChannelAdapter for TcpChannel {
    fn peer(&self) -> &PeerId {
        &self.peer
    }

    fn is_open(&self) -> bool {
        self.open && !self.tx.is_closed()
    }

    fn send(&mut self, msg: &Message) -> Result<(), ChannelError> {
        let frame = encode_frame(msg).map_err(|e| ChannelError::Send(e.to_string()))?;
        self.enqueue(frame)
    }

    fn close(&mut self) {
        self.open = false;
    }
}
