//! One process per client, per `spec.md` §6's CLI note. Issues a single `Mutator` command against
//! a target replica, retrying on timeout, and prints the `ClientResponse` it gets back.
//!
//! `spec.md` calls the client driver an external collaborator ("retries on timeout, follows
//! leader redirects"); concord's wire protocol has no redirect packet because every replica can
//! lead its own instances (that's the point of a leaderless protocol), so this driver only needs
//! the retry half.

use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use arrrg::CommandLine;

use concord_pb::{ClientRequestBody, ClientResponseBody, Command, CommandID, Key, PacketBody, Packet, ReplicaID};

#[derive(arrrg_derive::CommandLine, Debug, Default, Eq, PartialEq)]
struct ClientOptions {
    #[arrrg(required, "address of the replica to send the request to", "HOST:PORT")]
    target: String,
    #[arrrg(required, "the mutator operation name", "OP")]
    op: String,
    #[arrrg(optional, "how long to wait for a response before retrying, in milliseconds", "MS")]
    timeout_ms: u64,
    #[arrrg(optional, "how many times to retry before giving up", "N")]
    retries: u64,
}

fn main() {
    let (options, keys) = ClientOptions::from_command_line(
        "Usage: concord-client --target HOST:PORT --op OP [OPTIONS] KEY [KEY...]",
    );
    if keys.is_empty() {
        eprintln!("at least one key is required");
        std::process::exit(1);
    }

    let target: SocketAddr = options
        .target
        .parse()
        .unwrap_or_else(|_| panic!("--target {:?} is not a valid socket address", options.target));
    let timeout = Duration::from_millis(if options.timeout_ms == 0 { 500 } else { options.timeout_ms });
    let retries = if options.retries == 0 { 5 } else { options.retries };

    let command = Command::mutator(
        CommandID::generate().expect("urandom should never be exhausted"),
        options.op.clone(),
        keys.iter().map(|k| Key::from(k.as_bytes().to_vec())).collect(),
    );

    let socket = UdpSocket::bind("0.0.0.0:0").expect("binding an ephemeral client socket never fails");
    socket.set_read_timeout(Some(timeout)).expect("setting a read timeout never fails");

    // The client has no slot of its own; `ReplicaID::TOP` marks packets that originate outside
    // the cluster, mirroring `spec.md` §6's "one process per client" note that the client is not
    // itself a replica.
    let request = Packet {
        origin: ReplicaID::TOP,
        destination: ReplicaID::BOTTOM,
        body: PacketBody::ClientRequest(ClientRequestBody {
            command: command.clone(),
        }),
    };

    let mut buf = [0u8; 64 * 1024];
    for attempt in 0..=retries {
        let frame = concord_net::encode(&request);
        if let Err(e) = socket.send_to(&frame, target) {
            eprintln!("send to {target} failed: {e}");
            continue;
        }
        match socket.recv(&mut buf) {
            Ok(n) => match concord_net::decode(&buf[..n]) {
                Ok((packet, _)) => {
                    if let PacketBody::ClientResponse(ClientResponseBody { command: committed }) = packet.body {
                        if committed.id == command.id {
                            println!("committed: {}", committed.id);
                            return;
                        }
                    }
                }
                Err(e) => eprintln!("malformed response: {e}"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {
                eprintln!("attempt {attempt}/{retries} timed out, retrying");
            }
            Err(e) => eprintln!("recv failed: {e}"),
        }
    }
    eprintln!("giving up after {retries} retries");
    std::process::exit(1);
}
