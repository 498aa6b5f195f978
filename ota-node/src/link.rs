//! Host link: TCP stand-in for the radio. One peer at a time; each frame travels as
//! `[len_hi][len_lo][frame]` and is answered with a one-byte link-level acknowledgment.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use ota_core::{DeliveryStatus, Event};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x15;
const LEN_SIZE: usize = 2;

#[derive(Debug, Clone, Copy)]
pub struct LinkTiming {
    pub connect_delay: Duration,
    pub frame_interval: Duration,
    pub ack_timeout: Duration,
    pub loss_percent: u8,
}

impl LinkTiming {
    fn drops(&self, rng: &mut StdRng) -> bool {
        self.loss_percent > 0 && rng.gen_range(0..100u8) < self.loss_percent
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &[u8]) -> io::Result<()> {
    let len = u16::try_from(frame.len()).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "frame longer than 65535 bytes")
    })?;
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(frame).await?;
    w.flush().await
}

pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; LEN_SIZE];
    r.read_exact(&mut len_buf).await?;
    let mut frame = vec![0u8; u16::from_be_bytes(len_buf) as usize];
    r.read_exact(&mut frame).await?;
    Ok(frame)
}

/// Sender side: accept receivers one at a time and stream whatever the core queues on `outbound`.
/// Every frame's fate is reported back as `Event::Delivery`.
pub async fn serve(
    listener: TcpListener,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    events: mpsc::UnboundedSender<Event>,
    timing: LinkTiming,
) -> anyhow::Result<()> {
    let mut rng = StdRng::from_entropy();
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(x) => x,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };
        tracing::info!(%peer, "receiver connected");
        // Frames queued for a previous peer are stale.
        while outbound.try_recv().is_ok() {}
        if events.send(Event::Connected).is_err() {
            return Ok(());
        }
        match stream_frames(stream, &mut outbound, &events, &timing, &mut rng).await {
            Ok(()) => tracing::info!(%peer, "receiver disconnected"),
            Err(e) => tracing::warn!(%peer, error = %e, "link dropped"),
        }
        if events.send(Event::Disconnected).is_err() {
            return Ok(());
        }
    }
}

async fn stream_frames(
    mut stream: TcpStream,
    outbound: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    events: &mpsc::UnboundedSender<Event>,
    timing: &LinkTiming,
    rng: &mut StdRng,
) -> io::Result<()> {
    tokio::time::sleep(timing.connect_delay).await;
    let mut probe = [0u8; 1];
    loop {
        let frame = tokio::select! {
            frame = outbound.recv() => match frame {
                Some(f) => f,
                None => return Ok(()),
            },
            // Nothing is expected while idle; a read only tells us the peer went away.
            n = stream.read(&mut probe) => match n? {
                0 => return Ok(()),
                _ => continue,
            },
        };
        let status = if timing.drops(rng) {
            tracing::debug!(len = frame.len(), "simulated loss");
            DeliveryStatus::Failed
        } else {
            write_frame(&mut stream, &frame).await?;
            match tokio::time::timeout(timing.ack_timeout, stream.read_u8()).await {
                Ok(Ok(ACK)) => DeliveryStatus::Delivered,
                Ok(Ok(_)) => DeliveryStatus::Failed,
                Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    // A late ack would be read as the answer to the next frame, so the
                    // connection is unusable; the receiver reconnects and gets a fresh Announce.
                    let _ = events.send(Event::Delivery(DeliveryStatus::Failed));
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "ack timeout"));
                }
            }
        };
        tokio::time::sleep(timing.frame_interval).await;
        if events.send(Event::Delivery(status)).is_err() {
            return Ok(());
        }
    }
}

/// Receiver side: connect to the sender, retrying every `connect_delay`, and forward frames.
pub async fn connect(
    addr: SocketAddr,
    events: mpsc::UnboundedSender<Event>,
    timing: LinkTiming,
) -> anyhow::Result<()> {
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                tracing::info!(%addr, "connected to sender");
                if events.send(Event::Connected).is_err() {
                    return Ok(());
                }
                match receive_frames(stream, &events).await {
                    Ok(()) => tracing::info!(%addr, "sender disconnected"),
                    Err(e) => tracing::warn!(%addr, error = %e, "link dropped"),
                }
                if events.send(Event::Disconnected).is_err() {
                    return Ok(());
                }
            }
            Err(e) => tracing::debug!(%addr, error = %e, "sender not reachable"),
        }
        tokio::time::sleep(timing.connect_delay).await;
    }
}

async fn receive_frames(
    mut stream: TcpStream,
    events: &mpsc::UnboundedSender<Event>,
) -> io::Result<()> {
    loop {
        let frame = match read_frame(&mut stream).await {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        if frame.is_empty() {
            stream.write_u8(NAK).await?;
            continue;
        }
        stream.write_u8(ACK).await?;
        if events.send(Event::FrameReceived(frame)).is_err() {
            return Ok(());
        }
    }
}
