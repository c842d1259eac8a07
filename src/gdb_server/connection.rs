//! One client connection: byte I/O, framing, the ack protocol and
//! wake-interruptible reads.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::probe::TransportError;

use super::packet::{
    self, RawPacket, INTERRUPT_BYTE, PACKET_ACK, PACKET_END, PACKET_NACK, PACKET_START,
};

/// A client should never send anything near this much in one packet.
/// Exceeding it is treated as a broken peer and kills the connection.
pub const MAX_INBOUND_PACKET_SIZE: usize = 2_097_000; // ~2 MiB

/// Granularity of the blocking-read loop; the wake flag is checked at
/// this interval.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Lets another thread abort a blocking read without closing the
/// socket.
#[derive(Debug, Clone, Default)]
pub struct WakeHandle(Arc<AtomicBool>);

impl WakeHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wake(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// The result of waiting for one inbound packet.
#[derive(Debug)]
pub enum ReadOutcome {
    Packet(RawPacket),
    /// The wake handle fired before a packet arrived.
    Interrupted,
    /// The deadline passed before a packet arrived.
    TimedOut,
}

pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    wake: WakeHandle,
    buffer: Vec<u8>,
    /// Last framed response, kept for retransmission on `-`.
    last_response: Option<Vec<u8>>,
}

impl Connection {
    pub fn new(stream: TcpStream, wake: WakeHandle) -> Result<Self, Error> {
        let peer = stream
            .peer_addr()
            .map_err(|error| Error::Transport(TransportError::Io(error.to_string())))?;
        stream
            .set_read_timeout(Some(READ_POLL_INTERVAL))
            .map_err(|error| Error::Transport(TransportError::Io(error.to_string())))?;
        stream.set_nodelay(true).ok();

        Ok(Self {
            stream,
            peer,
            wake,
            buffer: Vec::new(),
            last_response: None,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Wait for one inbound packet.
    ///
    /// Returns [`ReadOutcome::Interrupted`] when the wake handle fires
    /// and [`ReadOutcome::TimedOut`] when `timeout` elapses, leaving
    /// the socket open in both cases.
    pub fn read_packet(&mut self, timeout: Option<Duration>) -> Result<ReadOutcome, Error> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        loop {
            if let Some(packet) = self.extract_packet()? {
                return Ok(ReadOutcome::Packet(packet));
            }

            if self.wake.take() {
                return Ok(ReadOutcome::Interrupted);
            }

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Ok(ReadOutcome::TimedOut);
                }
            }

            self.fill()?;
        }
    }

    /// Frame and send a response payload.
    pub fn write_packet(&mut self, payload: &[u8]) -> Result<(), Error> {
        let framed = packet::encode(payload);
        log::trace!("RSP > {}", String::from_utf8_lossy(&framed));

        self.stream
            .write_all(&framed)
            .map_err(|error| Error::Transport(TransportError::Io(error.to_string())))?;
        self.last_response = Some(framed);
        Ok(())
    }

    /// One timed read into the inbound buffer.
    fn fill(&mut self) -> Result<(), Error> {
        let mut chunk = [0u8; 4096];

        match self.stream.read(&mut chunk) {
            Ok(0) => Err(Error::Transport(TransportError::Io(
                "client disconnected".into(),
            ))),
            Ok(read) => {
                self.buffer.extend_from_slice(&chunk[..read]);

                if self.buffer.len() > MAX_INBOUND_PACKET_SIZE {
                    return Err(Error::InvalidArgument(format!(
                        "inbound packet exceeds the {MAX_INBOUND_PACKET_SIZE} byte limit"
                    )));
                }

                Ok(())
            }
            Err(error)
                if matches!(
                    error.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                Ok(())
            }
            Err(error) => Err(Error::Transport(TransportError::Io(error.to_string()))),
        }
    }

    /// Scan the inbound buffer for one complete packet, servicing acks
    /// and the interrupt byte along the way.
    fn extract_packet(&mut self) -> Result<Option<RawPacket>, Error> {
        loop {
            match self.buffer.first() {
                None => return Ok(None),
                Some(&PACKET_ACK) => {
                    self.buffer.remove(0);
                    self.last_response = None;
                }
                Some(&PACKET_NACK) => {
                    self.buffer.remove(0);
                    if let Some(framed) = self.last_response.clone() {
                        log::warn!("Client rejected our response - retransmitting");
                        self.stream.write_all(&framed).map_err(|error| {
                            Error::Transport(TransportError::Io(error.to_string()))
                        })?;
                    }
                }
                Some(&INTERRUPT_BYTE) => {
                    // Interrupts arrive as a bare byte; fake a packet so
                    // the rest of the pipeline needs no special case.
                    self.buffer.remove(0);
                    log::trace!("RSP < <interrupt>");
                    return Ok(Some(RawPacket::interrupt()));
                }
                Some(&PACKET_START) => {
                    let Some(end) = self.buffer.iter().position(|&byte| byte == PACKET_END)
                    else {
                        return Ok(None);
                    };

                    if self.buffer.len() < end + 3 {
                        // Checksum digits still in flight
                        return Ok(None);
                    }

                    let body = self.buffer[1..end].to_vec();
                    let checksum_text =
                        String::from_utf8_lossy(&self.buffer[end + 1..end + 3]).into_owned();
                    self.buffer.drain(..end + 3);

                    let expected = u8::from_str_radix(&checksum_text, 16)
                        .map_err(|_| Error::InvalidArgument("malformed packet checksum".into()))?;

                    if packet::checksum(&body) != expected {
                        log::warn!("Dropping packet with bad checksum");
                        self.stream.write_all(&[PACKET_NACK]).map_err(|error| {
                            Error::Transport(TransportError::Io(error.to_string()))
                        })?;
                        continue;
                    }

                    self.stream.write_all(&[PACKET_ACK]).map_err(|error| {
                        Error::Transport(TransportError::Io(error.to_string()))
                    })?;

                    let data = packet::decode(&body)?;
                    log::trace!("RSP < {}", String::from_utf8_lossy(&data));
                    return Ok(Some(RawPacket::new(data)));
                }
                Some(_) => {
                    // Noise between packets
                    self.buffer.remove(0);
                }
            }
        }
    }
}
