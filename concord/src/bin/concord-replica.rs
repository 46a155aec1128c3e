//! One process per replica, per `spec.md` §6's CLI note. Parses a fixed cluster configuration
//! from the command line, binds a [concord_net::UdpTransport], and drives [concord_router::Router]
//! from a blocking poll loop: `spec.md` §5's "main loop is a blocking poll on the transport with a
//! bounded timeout derived from the next scheduled tick."

use std::collections::BTreeMap;
use std::fs::File;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use arrrg::CommandLine;

use biometrics::{Collector as BiometricsCollector, PlainTextEmitter};

use concord_net::{Transport, UdpTransport};
use concord_pb::{Configuration, FastPath, ReplicaID};
use concord_router::{Effect, Router};

static COLLECTOR: indicio::Collector = indicio::Collector::new();

///////////////////////////////////////////// ReplicaOptions ///////////////////////////////////////

/// Command-line configuration for one replica process. `peers` is a list of `id=host:port` pairs
/// (one per peer, self excluded) rather than a single map-typed flag: `arrrg` derives options from
/// `FromStr` scalars, with no map type, so free arguments carry the peer set instead, the same way
/// `busyrpc-benchmark-server` takes its service set as free arguments.
#[derive(arrrg_derive::CommandLine, Debug, Default, Eq, PartialEq)]
struct ReplicaOptions {
    #[arrrg(required, "this replica's id", "ID")]
    replica_id: u32,
    #[arrrg(required, "address to bind the UDP socket to", "HOST:PORT")]
    bind: String,
    #[arrrg(optional, "ballot epoch for this run", "EPOCH")]
    epoch: u32,
    #[arrrg(optional, "ticks per second", "JIFFIES")]
    jiffies: u32,
    #[arrrg(optional, "explicit-prepare base timeout, in ticks", "TICKS")]
    timeout: u32,
    #[arrrg(optional, "explicit-prepare jitter range, in ticks", "TICKS")]
    timeout_range: u32,
    #[arrrg(optional, "committed instances between scheduled checkpoints", "N")]
    checkpoint_each: u64,
    #[arrrg(optional, "instances allowed to run ahead of the checkpoint frontier", "N")]
    alpha: u64,
    #[arrrg(flag, "use the EPaxos paper's f + floor((f+1)/2) fast quorum instead of 2f")]
    paper_fast_quorum: bool,
}

fn parse_peer(arg: &str) -> (ReplicaID, SocketAddr) {
    let (id, addr) = arg
        .split_once('=')
        .unwrap_or_else(|| panic!("peer argument {arg:?} must be of the form ID=HOST:PORT"));
    let id: u32 = id
        .parse()
        .unwrap_or_else(|_| panic!("peer argument {arg:?} has a non-numeric id"));
    let addr: SocketAddr = addr
        .parse()
        .unwrap_or_else(|_| panic!("peer argument {arg:?} has an unparseable address"));
    (ReplicaID::new(id), addr)
}

fn spawn_biometrics_emitter() {
    std::thread::spawn(|| {
        let mut collector = BiometricsCollector::new();
        concord_router::register_biometrics(&mut collector);
        let fout = match File::create("/dev/stdout") {
            Ok(f) => f,
            Err(_) => return,
        };
        let mut emit = PlainTextEmitter::new(fout);
        loop {
            let now = SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .expect("clock should never fail")
                .as_millis()
                .try_into()
                .expect("millis since epoch should fit u64");
            if let Err(e) = collector.emit(&mut emit, now) {
                eprintln!("collector error: {e:?}");
            }
            std::thread::sleep(Duration::from_millis(249));
        }
    });
}

/// Spawn the signal-waiting thread: `main` has already blocked every signal on the process before
/// this is called, so this thread (and every other) inherits that mask, and only this thread ever
/// observes a signal, via `sigwait`. It parks in `minimal_signals::wait` until `SIGTERM` arrives,
/// at which point it sets `shutdown` and exits, letting the poll loop in `main` notice on its next
/// iteration. Any other signal is ignored and the wait resumes, the same loop-and-filter shape
/// `busyrpc-service-discovery-server` uses around `minimal_signals::wait`.
fn install_sigterm_handler() -> Arc<AtomicBool> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    std::thread::spawn(move || loop {
        let signal_set = minimal_signals::SignalSet::new().fill();
        if minimal_signals::wait(signal_set) == Some(minimal_signals::SIGTERM) {
            flag.store(true, Ordering::Relaxed);
            break;
        }
    });
    shutdown
}

fn main() {
    // Must run before any other thread is spawned: a thread inherits the calling thread's signal
    // mask at creation time, so `spawn_biometrics_emitter` and the signal-waiting thread below
    // both need every signal already blocked here.
    minimal_signals::block();

    let (options, free) = ReplicaOptions::from_command_line(
        "Usage: concord-replica --replica-id ID --bind HOST:PORT [OPTIONS] ID=HOST:PORT ...",
    );
    let peer_addr: BTreeMap<ReplicaID, SocketAddr> = free.iter().map(|s| parse_peer(s)).collect();

    COLLECTOR.set_verbosity(indicio::INFO);
    COLLECTOR.register(indicio::stdio::StdioEmitter);
    spawn_biometrics_emitter();

    let config = Configuration {
        replica_id: ReplicaID::new(options.replica_id),
        epoch: options.epoch,
        peer_addr: peer_addr
            .iter()
            .map(|(id, addr)| (*id, addr.to_string()))
            .collect(),
        jiffies: if options.jiffies == 0 {
            concord_pb::DEFAULT_JIFFIES
        } else {
            options.jiffies
        },
        timeout: if options.timeout == 0 { 10 } else { options.timeout },
        timeout_range: if options.timeout_range == 0 {
            10
        } else {
            options.timeout_range
        },
        checkpoint_each: if options.checkpoint_each == 0 {
            256
        } else {
            options.checkpoint_each
        },
        alpha: if options.alpha == 0 {
            concord_pb::DEFAULT_ALPHA
        } else {
            options.alpha
        },
        fast_path: if options.paper_fast_quorum {
            FastPath::FPlusHalfFPlusOne
        } else {
            FastPath::TwoF
        },
    };

    let bind_addr: SocketAddr = options
        .bind
        .parse()
        .unwrap_or_else(|_| panic!("--bind {:?} is not a valid socket address", options.bind));
    let mut transport =
        UdpTransport::bind(bind_addr, peer_addr.clone()).unwrap_or_else(|e| panic!("bind {bind_addr}: {e}"));
    transport
        .set_nonblocking(true)
        .expect("setting non-blocking mode never fails on a bound socket");

    let timeout_seed = u64::from(options.replica_id) ^ 0x636f_6e63_6f72_64u64;
    let tick_interval = u64::from(config.checkpoint_each).max(1) / 4;
    let mut router = Router::new(&config, timeout_seed, tick_interval);

    let shutdown = install_sigterm_handler();
    let seconds_per_tick = 1.0 / f64::from(config.jiffies.max(1));
    let mut now: u64 = 0;
    let mut last_ping = 0u64;

    indicio::clue!(COLLECTOR, indicio::ALWAYS, {
        event: "concord.replica.start",
        replica_id: config.replica_id.to_string(),
        bind: options.bind.clone(),
        peers: peer_addr.len() as u64,
    });

    while !shutdown.load(Ordering::Relaxed) {
        drain_effects(&mut transport, router.on_tick(now));

        if now.saturating_sub(last_ping) >= u64::from(config.jiffies.max(1)) {
            last_ping = now;
            for peer in peer_addr.keys().copied() {
                let effect = router.ping_peer(peer, now);
                drain_effects(&mut transport, vec![effect]);
            }
        }

        match transport.recv() {
            Ok(Some(packet)) => {
                let effects = router.on_packet(now, packet);
                drain_effects(&mut transport, effects);
            }
            Ok(None) => {}
            Err(e) => {
                indicio::clue!(COLLECTOR, indicio::WARNING, {
                    event: "concord.replica.recv_error",
                    error: e.to_string(),
                });
            }
        }

        std::thread::sleep(Duration::from_secs_f64(seconds_per_tick));
        now += 1;
    }
}

fn drain_effects(transport: &mut UdpTransport, effects: Vec<Effect>) {
    for effect in effects {
        match effect {
            Effect::Send(packet) => {
                if let Err(e) = transport.send(&packet) {
                    indicio::clue!(COLLECTOR, indicio::WARNING, {
                        event: "concord.replica.send_error",
                        destination: packet.destination.to_string(),
                        body: packet.body.type_name(),
                        error: e.to_string(),
                    });
                }
            }
            Effect::Applied(item) => {
                // Applying the command to a concrete state machine (a key-value store, say) is
                // outside concord's scope per `spec.md`'s component table; log the order so an
                // operator can see the replicated sequence.
                indicio::clue!(COLLECTOR, indicio::INFO, {
                    event: "concord.replica.applied",
                    slot: item.slot.to_string(),
                    seq: item.seq,
                    command: item
                        .command
                        .as_ref()
                        .map(|c| c.id.to_string())
                        .unwrap_or_else(|| "noop".to_string()),
                });
            }
        }
    }
}
