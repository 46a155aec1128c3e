#![doc = include_str!("../README.md")]

//! Wire framing, transport, and RTT estimation for concord (`spec.md` §6, §2 component 11).
//!
//! [codec] turns a [concord_pb::Packet] into a length-prefixed frame and back; [Transport] is the
//! seam the spec calls out as an external collaborator to *define* rather than fully implement;
//! [UdpTransport] is one concrete, runnable instance of it; [ping] estimates per-peer round-trip
//! time from `Ping`/`Pong` traffic.

pub mod ping;

use std::io;
use std::net::{SocketAddr, UdpSocket};

use buffertk::{stack_pack, Unpacker};
use concord_pb::Packet;

///////////////////////////////////////////// biometrics ///////////////////////////////////////////

static FRAME_ENCODED: biometrics::Counter = biometrics::Counter::new("concord_net.frame.encoded");
static FRAME_DECODED: biometrics::Counter = biometrics::Counter::new("concord_net.frame.decoded");
static FRAME_TRUNCATED: biometrics::Counter = biometrics::Counter::new("concord_net.frame.truncated");
static FRAME_CORRUPT: biometrics::Counter = biometrics::Counter::new("concord_net.frame.corrupt");
static UDP_SEND: biometrics::Counter = biometrics::Counter::new("concord_net.udp.send");
static UDP_RECV: biometrics::Counter = biometrics::Counter::new("concord_net.udp.recv");
static UDP_RECV_DROPPED: biometrics::Counter = biometrics::Counter::new("concord_net.udp.recv.dropped");

/// Register this crate's sensors, plus [ping]'s, with `collector`, per the pack's
/// `register_biometrics` convention (see `busyrpc::register_biometrics`, which aggregates
/// `client`/`channel`/`server`/`poll` the same way).
pub fn register_biometrics(collector: &mut biometrics::Collector) {
    collector.register_counter(&FRAME_ENCODED);
    collector.register_counter(&FRAME_DECODED);
    collector.register_counter(&FRAME_TRUNCATED);
    collector.register_counter(&FRAME_CORRUPT);
    collector.register_counter(&UDP_SEND);
    collector.register_counter(&UDP_RECV);
    collector.register_counter(&UDP_RECV_DROPPED);
    ping::register_biometrics(collector);
}

///////////////////////////////////////////// logging //////////////////////////////////////////////

static COLLECTOR: indicio::Collector = indicio::Collector::new();

///////////////////////////////////////////// codec ////////////////////////////////////////////////

/// A frame was malformed or the buffer ran out before a full frame arrived.
#[derive(Debug)]
pub enum FrameError {
    /// Fewer than 4 bytes of length header, or fewer body bytes than the header promised.
    Truncated,
    /// The length header parsed, but the body did not decode to a [Packet].
    Corrupt(prototk::Error),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            FrameError::Truncated => write!(f, "frame truncated"),
            FrameError::Corrupt(err) => write!(f, "frame corrupt: {err:?}"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Encode `packet` as a single `len:u32 | body` frame, per `spec.md` §6.
pub fn encode(packet: &Packet) -> Vec<u8> {
    let body = stack_pack(packet).to_vec();
    let len = u32::try_from(body.len()).expect("a single packet never exceeds u32::MAX bytes");
    let mut framed = Vec::with_capacity(4 + body.len());
    framed.extend_from_slice(&len.to_le_bytes());
    framed.extend_from_slice(&body);
    FRAME_ENCODED.click();
    framed
}

/// Decode one `len:u32 | body` frame from the front of `buf`, returning the [Packet] and
/// whatever bytes followed it.  Callers over a stream transport loop this until [FrameError]
/// signals they need more bytes; callers over a datagram transport expect exactly one frame per
/// call and an empty remainder.
pub fn decode(buf: &[u8]) -> Result<(Packet, &[u8]), FrameError> {
    if buf.len() < 4 {
        FRAME_TRUNCATED.click();
        return Err(FrameError::Truncated);
    }
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&buf[..4]);
    let len = u32::from_le_bytes(len_bytes) as usize;
    let rest = &buf[4..];
    if rest.len() < len {
        FRAME_TRUNCATED.click();
        return Err(FrameError::Truncated);
    }
    let (frame, remainder) = rest.split_at(len);
    let mut up = Unpacker::new(frame);
    let packet: Packet = up.unpack().map_err(|err| {
        FRAME_CORRUPT.click();
        FrameError::Corrupt(err)
    })?;
    FRAME_DECODED.click();
    Ok((packet, remainder))
}

///////////////////////////////////////////// Transport /////////////////////////////////////////////

/// The external-collaborator seam `spec.md` §6 calls out: concord drives consensus against
/// whatever implements this, and is agnostic to the underlying medium.
pub trait Transport {
    /// Send `packet` to `packet.destination`.
    fn send(&mut self, packet: &Packet) -> io::Result<()>;
    /// Block until one packet arrives, or return `Ok(None)` if the transport was closed.
    fn recv(&mut self) -> io::Result<Option<Packet>>;
}

///////////////////////////////////////////// UdpTransport //////////////////////////////////////////

/// A concrete [Transport] over `std::net::UdpSocket`.  Each UDP datagram carries exactly one
/// framed [Packet]; the length prefix is redundant over a datagram medium (the kernel already
/// preserves message boundaries) but kept so the same [encode]/[decode] pair works unmodified
/// over a future stream-oriented transport.
pub struct UdpTransport {
    socket: UdpSocket,
    peer_addr: std::collections::BTreeMap<concord_pb::ReplicaID, SocketAddr>,
    recv_buf: Vec<u8>,
}

impl UdpTransport {
    /// Bind a new transport to `bind_addr`, routing outbound packets to `peer_addr` by
    /// destination replica id.
    pub fn bind(
        bind_addr: SocketAddr,
        peer_addr: std::collections::BTreeMap<concord_pb::ReplicaID, SocketAddr>,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(bind_addr)?;
        Ok(Self {
            socket,
            peer_addr,
            recv_buf: vec![0u8; 64 * 1024],
        })
    }

    /// Put the socket in non-blocking mode; `recv` then returns `Ok(None)` immediately instead of
    /// blocking when nothing has arrived.
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self.socket.set_nonblocking(nonblocking)
    }
}

impl Transport for UdpTransport {
    fn send(&mut self, packet: &Packet) -> io::Result<()> {
        let Some(addr) = self.peer_addr.get(&packet.destination) else {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no known address for {}", packet.destination),
            ));
        };
        let frame = encode(packet);
        self.socket.send_to(&frame, addr)?;
        UDP_SEND.click();
        Ok(())
    }

    fn recv(&mut self) -> io::Result<Option<Packet>> {
        let n = match self.socket.recv(&mut self.recv_buf) {
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(err) => return Err(err),
        };
        match decode(&self.recv_buf[..n]) {
            Ok((packet, _remainder)) => {
                UDP_RECV.click();
                Ok(Some(packet))
            }
            Err(err) => {
                UDP_RECV_DROPPED.click();
                indicio::clue!(COLLECTOR, indicio::WARNING, {
                    event: "udp.recv.dropped",
                    reason: err.to_string(),
                });
                Ok(None)
            }
        }
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use concord_pb::{PacketBody, PingBody, ReplicaID};

    fn packet() -> Packet {
        Packet {
            origin: ReplicaID::new(1),
            destination: ReplicaID::new(2),
            body: PacketBody::Ping(PingBody { id: 42 }),
        }
    }

    #[test]
    fn encode_decode_roundtrips() {
        let p = packet();
        let framed = encode(&p);
        let (got, remainder) = decode(&framed).unwrap();
        assert_eq!(got, p);
        assert!(remainder.is_empty());
    }

    #[test]
    fn decode_rejects_truncated_header() {
        assert!(matches!(decode(&[1, 2]), Err(FrameError::Truncated)));
    }

    #[test]
    fn decode_rejects_truncated_body() {
        let framed = encode(&packet());
        assert!(matches!(decode(&framed[..framed.len() - 1]), Err(FrameError::Truncated)));
    }

    #[test]
    fn decode_finds_the_next_frame_after_the_first() {
        let mut both = encode(&packet());
        both.extend_from_slice(&encode(&packet()));
        let (first, rest) = decode(&both).unwrap();
        assert_eq!(first, packet());
        let (second, rest) = decode(rest).unwrap();
        assert_eq!(second, packet());
        assert!(rest.is_empty());
    }

    #[test]
    fn udp_transport_round_trips_a_packet_between_two_sockets() {
        let addr_a: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let addr_b: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let replica_a = ReplicaID::new(1);
        let replica_b = ReplicaID::new(2);

        let mut a = UdpTransport::bind(addr_a, Default::default()).unwrap();
        let mut b = UdpTransport::bind(addr_b, Default::default()).unwrap();
        let a_addr = a.socket.local_addr().unwrap();
        let b_addr = b.socket.local_addr().unwrap();
        a.peer_addr.insert(replica_b, b_addr);
        b.peer_addr.insert(replica_a, a_addr);
        b.set_nonblocking(true).unwrap();

        let packet = Packet {
            origin: replica_a,
            destination: replica_b,
            body: PacketBody::Ping(PingBody { id: 7 }),
        };
        a.send(&packet).unwrap();

        let mut got = None;
        for _ in 0..1000 {
            if let Some(p) = b.recv().unwrap() {
                got = Some(p);
                break;
            }
        }
        assert_eq!(got, Some(packet));
    }
}
