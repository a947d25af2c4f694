//! Art-Net ArtDmx encoding and a rate-limited UDP sender.

use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use crate::dmx_types::{DMX_CHANNELS, DmxFrame};

/// Packet identifier every Art-Net packet starts with.
pub const ARTNET_ID: [u8; 8] = *b"Art-Net\0";
/// OpDmx, sent little-endian.
pub const OP_DMX: u16 = 0x5000;
/// Protocol revision, sent big-endian.
pub const PROTOCOL_VERSION: u16 = 14;
pub const HEADER_LEN: usize = 18;
pub const PACKET_LEN: usize = HEADER_LEN + DMX_CHANNELS;
pub const ARTNET_PORT: u16 = 6454;

/// Upper bound of the scheduling jitter the rate limiter tolerates. The
/// actual allowance is a twentieth of the send interval, capped here.
const MAX_SEND_JITTER: Duration = Duration::from_millis(1);

/// Builds an ArtDmx packet for one universe. Sequence and physical port are
/// always zero.
pub fn encode(universe: u16, channels: &DmxFrame) -> [u8; PACKET_LEN] {
    let mut packet = [0u8; PACKET_LEN];
    packet[0..8].copy_from_slice(&ARTNET_ID);
    packet[8..10].copy_from_slice(&OP_DMX.to_le_bytes());
    packet[10..12].copy_from_slice(&PROTOCOL_VERSION.to_be_bytes());
    // 12: sequence, 13: physical
    packet[14..16].copy_from_slice(&universe.to_le_bytes());
    packet[16..18].copy_from_slice(&(DMX_CHANNELS as u16).to_be_bytes());
    packet[HEADER_LEN..].copy_from_slice(channels);
    packet
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, strum::Display)]
pub enum SendOutcome {
    Sent,
    /// Dropped by the rate limiter
    Throttled,
    /// Transport error, already logged
    Failed,
}

/// Sends packets to one destination, at most `max_rate` per second.
///
/// Each accepted send claims the next slot of a fixed schedule, so a caller
/// running slightly early is tolerated without the long-run rate ever
/// exceeding `max_rate`.
///
/// The socket is bound on first use and rebound after a failure. Transport
/// errors never propagate: they are logged once per failure streak and
/// reported as [`SendOutcome::Failed`].
pub struct ArtNetSender {
    socket: Option<UdpSocket>,
    destination: SocketAddr,
    min_interval: Duration,
    slot: Option<Instant>,
    failing: bool,
}

impl ArtNetSender {
    pub fn new(destination: SocketAddr, max_rate: f64) -> Self {
        let min_interval = if max_rate > 0.0 {
            Duration::from_secs_f64(1.0 / max_rate)
        } else {
            Duration::ZERO
        };
        Self {
            socket: None,
            destination,
            min_interval,
            slot: None,
            failing: false,
        }
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Encodes and sends one frame to the configured destination.
    pub fn send_frame(&mut self, universe: u16, frame: &DmxFrame) -> SendOutcome {
        self.send(&encode(universe, frame))
    }

    pub fn send(&mut self, packet: &[u8]) -> SendOutcome {
        self.send_to(packet, self.destination)
    }

    pub fn send_to(&mut self, packet: &[u8], destination: SocketAddr) -> SendOutcome {
        if !self.admit_at(Instant::now()) {
            return SendOutcome::Throttled;
        }

        match self.transmit(packet, destination) {
            Ok(()) => {
                if self.failing {
                    tracing::info!(%destination, "art-net output recovered");
                    self.failing = false;
                }
                SendOutcome::Sent
            }
            Err(e) => {
                if !self.failing {
                    tracing::warn!(%destination, error = %e, "art-net send failed");
                    self.failing = true;
                }
                SendOutcome::Failed
            }
        }
    }

    fn admit_at(&mut self, now: Instant) -> bool {
        let slack = (self.min_interval / 20).min(MAX_SEND_JITTER);
        self.slot = match self.slot {
            None => Some(now),
            Some(slot) => {
                let due = slot + self.min_interval;
                if now + slack < due {
                    return false;
                }
                Some(due.max(now))
            }
        };
        true
    }

    /// The socket is only kept after a successful send.
    fn transmit(&mut self, packet: &[u8], destination: SocketAddr) -> std::io::Result<()> {
        let socket = match self.socket.take() {
            Some(socket) => socket,
            None => {
                let socket = UdpSocket::bind(("0.0.0.0", 0))?;
                socket.set_broadcast(true)?;
                socket
            }
        };
        socket.send_to(packet, destination)?;
        self.socket = Some(socket);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receiver() -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        socket
    }

    #[test]
    fn packet_layout() {
        let mut frame = [0u8; DMX_CHANNELS];
        frame[0] = 255;
        frame[511] = 7;
        let packet = encode(0x0102, &frame);

        assert_eq!(packet.len(), 530);
        assert_eq!(&packet[0..8], b"Art-Net\0");
        assert_eq!(&packet[8..10], &[0x00, 0x50]);
        assert_eq!(&packet[10..12], &[0x00, 14]);
        assert_eq!(&packet[12..14], &[0, 0]);
        assert_eq!(&packet[14..16], &[0x02, 0x01]);
        assert_eq!(&packet[16..18], &[0x02, 0x00]);
        assert_eq!(packet[18], 255);
        assert_eq!(packet[529], 7);
    }

    #[test]
    fn packet_shape_is_independent_of_values() {
        for fill in [0u8, 128, 255] {
            let packet = encode(3, &[fill; DMX_CHANNELS]);
            assert_eq!(packet.len(), PACKET_LEN);
            assert_eq!(&packet[0..8], &ARTNET_ID);
        }
    }

    #[test]
    fn sends_reach_the_destination() {
        let rx = receiver();
        let mut sender = ArtNetSender::new(rx.local_addr().unwrap(), 44.0);
        let frame = [9u8; DMX_CHANNELS];
        assert_eq!(sender.send_frame(1, &frame), SendOutcome::Sent);

        let mut buf = [0u8; 1024];
        let (len, _) = rx.recv_from(&mut buf).unwrap();
        assert_eq!(len, PACKET_LEN);
        assert_eq!(&buf[..len], &encode(1, &frame)[..]);
    }

    #[test]
    fn sends_inside_the_interval_are_dropped() {
        let rx = receiver();
        let mut sender = ArtNetSender::new(rx.local_addr().unwrap(), 10.0);
        let frame = [1u8; DMX_CHANNELS];
        assert_eq!(sender.send_frame(0, &frame), SendOutcome::Sent);
        assert_eq!(sender.send_frame(0, &frame), SendOutcome::Throttled);
        assert_eq!(sender.send_frame(0, &frame), SendOutcome::Throttled);

        let mut buf = [0u8; 1024];
        assert!(rx.recv_from(&mut buf).is_ok());
        rx.set_read_timeout(Some(Duration::from_millis(30))).unwrap();
        assert!(rx.recv_from(&mut buf).is_err());

        std::thread::sleep(sender.min_interval());
        assert_eq!(sender.send_frame(0, &frame), SendOutcome::Sent);
        rx.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        assert!(rx.recv_from(&mut buf).is_ok());
    }

    #[test]
    fn high_rates_still_throttle() {
        let rx = receiver();
        let mut sender = ArtNetSender::new(rx.local_addr().unwrap(), 1000.0);
        let frame = [0u8; DMX_CHANNELS];
        let outcomes: Vec<_> = (0..5).map(|_| sender.send_frame(0, &frame)).collect();
        assert_eq!(outcomes[0], SendOutcome::Sent);
        assert!(outcomes.contains(&SendOutcome::Throttled));

        let mut sender = ArtNetSender::new(rx.local_addr().unwrap(), 1000.0);
        let t0 = Instant::now();
        assert!(sender.admit_at(t0));
        assert!(!sender.admit_at(t0 + Duration::from_micros(10)));
        assert!(!sender.admit_at(t0 + Duration::from_micros(900)));
        assert!(sender.admit_at(t0 + Duration::from_micros(960)));
    }

    #[test]
    fn early_cadence_cannot_exceed_the_target_rate() {
        let rx = receiver();
        let mut sender = ArtNetSender::new(rx.local_addr().unwrap(), 44.0);
        let interval = sender.min_interval();
        let step = interval - Duration::from_micros(900);
        let t0 = Instant::now();

        assert!(sender.admit_at(t0));
        assert!(sender.admit_at(t0 + step));
        assert!(!sender.admit_at(t0 + step * 2));

        let mut sender = ArtNetSender::new(rx.local_addr().unwrap(), 44.0);
        let admitted = (0..200)
            .filter(|i| sender.admit_at(t0 + step * *i))
            .count();
        let elapsed = (step * 199).as_secs_f64();
        assert!(admitted as f64 <= elapsed * 44.0 + 2.0, "{admitted} sends in {elapsed}s");
    }

    #[test]
    fn independent_senders_do_not_share_limits() {
        let rx = receiver();
        let frame = [0u8; DMX_CHANNELS];
        let mut a = ArtNetSender::new(rx.local_addr().unwrap(), 1.0);
        let mut b = ArtNetSender::new(rx.local_addr().unwrap(), 1.0);
        assert_eq!(a.send_frame(0, &frame), SendOutcome::Sent);
        assert_eq!(b.send_frame(0, &frame), SendOutcome::Sent);
    }
}
