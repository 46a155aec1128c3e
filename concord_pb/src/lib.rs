#![doc = include_str!("../README.md")]

//! Wire types and the error taxonomy for the concord EPaxos engine: slots, ballots, stages,
//! commands, and the packet bodies exchanged between acceptor, leader, and client actors.

use std::convert::TryFrom;
use std::fmt::Debug;

use prototk_derive::Message;

use one_two_eight::{generate_id, generate_id_prototk};

use zerror_core::ErrorCore;

///////////////////////////////////////////// Constants ////////////////////////////////////////////

/// Default ticks-per-second for the `jiffies` configuration field.
pub const DEFAULT_JIFFIES: u32 = 33;
/// Default number of instances allowed to run ahead of the checkpoint frontier.
pub const DEFAULT_ALPHA: u64 = 256;

//////////////////////////////////////////////// IDs ///////////////////////////////////////////////

generate_id! {CommandID, "command:"}
generate_id_prototk! {CommandID}

///////////////////////////////////////////// ReplicaID ////////////////////////////////////////////

/// The identity of a replica within a fixed cluster.  Kept as a plain counter-scale identifier
/// distinct from `CommandID`'s 128 bits, which are reserved for globally
/// unique things.
#[derive(Clone, Copy, Debug, Default, Eq, Message, PartialEq, PartialOrd, Ord, Hash)]
pub struct ReplicaID {
    #[prototk(1, uint32)]
    pub id: u32,
}

impl ReplicaID {
    /// The smallest possible replica id.
    pub const BOTTOM: ReplicaID = ReplicaID { id: 0 };
    /// The largest possible replica id.
    pub const TOP: ReplicaID = ReplicaID { id: u32::MAX };

    /// Construct a [ReplicaID] from a raw `u32`.
    pub const fn new(id: u32) -> Self {
        Self { id }
    }
}

impl std::fmt::Display for ReplicaID {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "replica:{}", self.id)
    }
}

////////////////////////////////////////////// Key /////////////////////////////////////////////////

/// An opaque, application-defined key.  Two [Command]s interfere when their key sets intersect.
#[derive(Clone, Default, Eq, Message, PartialEq, PartialOrd, Ord, Hash)]
pub struct Key {
    #[prototk(1, bytes)]
    pub bytes: Vec<u8>,
}

impl Key {
    /// Construct a [Key] from raw bytes.
    pub fn new<B: Into<Vec<u8>>>(bytes: B) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }
}

impl Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Key({:?})", String::from_utf8_lossy(&self.bytes))
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::new(s.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for Key {
    fn from(bytes: Vec<u8>) -> Self {
        Key::new(bytes)
    }
}

////////////////////////////////////////////// Slot ////////////////////////////////////////////////

/// A consensus slot: the global identifier of an instance of the protocol.  Totally ordered by the
/// lexicographic pair `(replica_id, instance_id)`.
#[derive(Clone, Copy, Debug, Default, Eq, Message, PartialEq, PartialOrd, Ord, Hash)]
pub struct Slot {
    #[prototk(1, message)]
    pub replica_id: ReplicaID,
    #[prototk(2, uint64)]
    pub instance_id: u64,
}

impl Slot {
    /// Construct a new [Slot].
    pub const fn new(replica_id: ReplicaID, instance_id: u64) -> Self {
        Self {
            replica_id,
            instance_id,
        }
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "({}, {})", self.replica_id, self.instance_id)
    }
}

///////////////////////////////////////////// Ballot ///////////////////////////////////////////////

/// A Paxos-style round number, ordered lexicographically by `(epoch, counter, replica_id)`.  Only
/// the listed `replica_id` may issue proposals under a given ballot.
#[derive(Clone, Copy, Debug, Default, Eq, Message, PartialEq, PartialOrd, Ord, Hash)]
pub struct Ballot {
    #[prototk(1, uint32)]
    pub epoch: u32,
    #[prototk(2, uint32)]
    pub counter: u32,
    #[prototk(3, message)]
    pub replica_id: ReplicaID,
}

impl Ballot {
    /// The initial ballot for any slot in the given epoch.
    pub const fn initial(epoch: u32, replica_id: ReplicaID) -> Self {
        Self {
            epoch,
            counter: 0,
            replica_id,
        }
    }

    /// Bump this ballot to the next counter, claimed by `replica_id`.
    pub const fn next(self, replica_id: ReplicaID) -> Self {
        Self {
            epoch: self.epoch,
            counter: self.counter + 1,
            replica_id,
        }
    }
}

//////////////////////////////////////////////// Stage /////////////////////////////////////////////

/// The per-slot protocol phase.  Declaration order *is* the total order:
/// `Prepared < PreAccepted < Accepted < Committed < Executed < Purged`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub enum Stage {
    /// A ballot has been reserved for the slot, but no command is attached yet.
    Prepared,
    /// The fast-path tentative value.
    PreAccepted,
    /// The slow-path committed value.
    Accepted,
    /// The final, immutable value.
    Committed,
    /// Applied to the replicated state machine; a local-only marker.
    Executed,
    /// Purged by checkpoint truncation; a local-only marker.
    Purged,
}

impl Default for Stage {
    fn default() -> Self {
        Stage::Prepared
    }
}

impl From<Stage> for u32 {
    fn from(stage: Stage) -> u32 {
        match stage {
            Stage::Prepared => 0,
            Stage::PreAccepted => 1,
            Stage::Accepted => 2,
            Stage::Committed => 3,
            Stage::Executed => 4,
            Stage::Purged => 5,
        }
    }
}

impl TryFrom<u32> for Stage {
    type Error = u32;

    fn try_from(x: u32) -> Result<Self, u32> {
        match x {
            0 => Ok(Stage::Prepared),
            1 => Ok(Stage::PreAccepted),
            2 => Ok(Stage::Accepted),
            3 => Ok(Stage::Committed),
            4 => Ok(Stage::Executed),
            5 => Ok(Stage::Purged),
            _ => Err(x),
        }
    }
}

//////////////////////////////////////////// Configuration /////////////////////////////////////////

/// Which fast-quorum formula a cluster uses: `2f` or the original EPaxos paper's
/// `f + floor((f+1)/2)`.  The two coincide at `N=5`; larger clusters must pick one.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FastPath {
    /// `fast := 2f`, the default.
    TwoF,
    /// `fast := f + floor((f+1)/2)`, the original EPaxos paper's quorum.
    FPlusHalfFPlusOne,
}

impl Default for FastPath {
    fn default() -> Self {
        FastPath::TwoF
    }
}

/// Static, per-run cluster configuration: fixed at startup and treated as a constant for the
/// duration of a run.  Membership changes are a non-goal; `peer_addr` is set once and never
/// mutated.
#[derive(Clone, Debug)]
pub struct Configuration {
    /// This replica's identity.
    pub replica_id: ReplicaID,
    /// The epoch this replica starts in.
    pub epoch: u32,
    /// The address of every other replica in the cluster, keyed by id.  Does not include `self`.
    pub peer_addr: std::collections::BTreeMap<ReplicaID, String>,
    /// Ticks per second for timer-driven actors.
    pub jiffies: u32,
    /// Base timeout, in jiffies, before an explicit-prepare round is triggered.
    pub timeout: u32,
    /// Width of the random jitter range added to `timeout`, in jiffies.
    pub timeout_range: u32,
    /// How many newly-committed instances accumulate before a checkpoint is proposed.
    pub checkpoint_each: u64,
    /// How many instances are allowed to run ahead of the last checkpoint before new proposals
    /// block.
    pub alpha: u64,
    /// Which fast-quorum formula this cluster uses.
    pub fast_path: FastPath,
}

impl Configuration {
    /// The number of replicas in the cluster, including `self`.
    pub fn cluster_size(&self) -> usize {
        self.peer_addr.len() + 1
    }

    /// `f`: the number of replica failures this cluster tolerates.
    pub fn f(&self) -> usize {
        (self.cluster_size() - 1) / 2
    }

    /// The size of a slow-path (classic Paxos majority) quorum, including `self`.
    pub fn slow_quorum(&self) -> usize {
        self.f() + 1
    }

    /// The size of a fast-path quorum, including `self`, per `self.fast_path`.
    pub fn fast_quorum(&self) -> usize {
        let f = self.f();
        match self.fast_path {
            FastPath::TwoF => 2 * f,
            FastPath::FPlusHalfFPlusOne => f + (f + 1) / 2,
        }
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            replica_id: ReplicaID::default(),
            epoch: 0,
            peer_addr: std::collections::BTreeMap::new(),
            jiffies: DEFAULT_JIFFIES,
            timeout: 10,
            timeout_range: 10,
            checkpoint_each: 256,
            alpha: DEFAULT_ALPHA,
            fast_path: FastPath::default(),
        }
    }
}

///////////////////////////////////////////// Payload //////////////////////////////////////////////

/// The body of a [MutatorBody]: an opaque application-level operation over a set of interfering
/// keys.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct MutatorBody {
    #[prototk(1, string)]
    pub op: String,
    #[prototk(2, message)]
    pub keys: Vec<Key>,
}

/// The body of a [CheckpointBody]: a distinguished barrier command, numbered so replicas can tell
/// checkpoint cycles apart in logs.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct CheckpointBody {
    #[prototk(1, uint64)]
    pub n: u64,
}

/// `prototk_derive`'s `#[derive(Message)]` only supports enum variants of the form
/// `Variant(VariantBody)` wrapping a single nested message (see `DESIGN.md`); `Payload` is written
/// in that form rather than as named-field variants.
#[derive(Clone, Debug, Eq, Message, PartialEq)]
pub enum Payload {
    #[prototk(1, message)]
    Mutator(MutatorBody),
    #[prototk(2, message)]
    Checkpoint(CheckpointBody),
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Mutator(MutatorBody::default())
    }
}

////////////////////////////////////////////// Command /////////////////////////////////////////////

/// `(id, payload)`.  A `Mutator` interferes with any other `Mutator` that shares
/// at least one key; a `Checkpoint` interferes with every `Mutator` and every earlier `Checkpoint`.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct Command {
    #[prototk(1, message)]
    pub id: CommandID,
    #[prototk(2, message)]
    pub payload: Payload,
}

impl Command {
    /// Construct a `Mutator` command.
    pub fn mutator(id: CommandID, op: impl Into<String>, keys: Vec<Key>) -> Self {
        Self {
            id,
            payload: Payload::Mutator(MutatorBody {
                op: op.into(),
                keys,
            }),
        }
    }

    /// Construct a `Checkpoint` command.
    pub fn checkpoint(id: CommandID, n: u64) -> Self {
        Self {
            id,
            payload: Payload::Checkpoint(CheckpointBody { n }),
        }
    }

    /// The keys this command touches.  Empty for `Checkpoint`, which interferes with everything by
    /// a separate rule rather than a shared key set.
    pub fn keys(&self) -> &[Key] {
        match &self.payload {
            Payload::Mutator(m) => &m.keys,
            Payload::Checkpoint(_) => &[],
        }
    }

    /// True iff this command is the distinguished `Checkpoint` variant.
    pub fn is_checkpoint(&self) -> bool {
        matches!(self.payload, Payload::Checkpoint(_))
    }

    /// `Checkpoint`s interfere with everything; `Mutator`s interfere iff their key sets intersect.
    pub fn interferes_with(&self, other: &Command) -> bool {
        if self.is_checkpoint() || other.is_checkpoint() {
            return true;
        }
        self.keys().iter().any(|k| other.keys().contains(k))
    }
}

///////////////////////////////////////////// Packet ///////////////////////////////////////////////

/// Fields common to every wire packet.  A separate `type_name` field was dropped: the `prototk`
/// oneof discriminant on [PacketBody] already disambiguates the payload (see `DESIGN.md`).
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct Packet {
    #[prototk(1, message)]
    pub origin: ReplicaID,
    #[prototk(2, message)]
    pub destination: ReplicaID,
    #[prototk(3, message)]
    pub body: PacketBody,
}

#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct ClientRequestBody {
    #[prototk(1, message)]
    pub command: Command,
}

#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct ClientResponseBody {
    #[prototk(1, message)]
    pub command: Command,
}

#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct PreAcceptRequestBody {
    #[prototk(1, message)]
    pub slot: Slot,
    #[prototk(2, message)]
    pub ballot: Ballot,
    #[prototk(3, message)]
    pub command: Option<Command>,
    #[prototk(4, uint64)]
    pub seq: u64,
    #[prototk(5, message)]
    pub deps: Vec<Slot>,
}

#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct PreAcceptAckBody {
    #[prototk(1, message)]
    pub slot: Slot,
    #[prototk(2, message)]
    pub ballot: Ballot,
    #[prototk(3, uint64)]
    pub seq: u64,
    #[prototk(4, message)]
    pub deps: Vec<Slot>,
    /// Bit `i` set means `deps[i]` was `>= Committed` at the replying acceptor.  A `u64` bitmask
    /// rather than a repeated bool field: `prototk`
    /// has no confirmed support for repeated primitive (non-message) fields in this pack, and 64
    /// dependencies comfortably covers any one instance's fan-in.
    #[prototk(5, uint64)]
    pub deps_committed_mask: u64,
}

#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct PreAcceptNackBody {
    #[prototk(1, message)]
    pub slot: Slot,
    #[prototk(2, message)]
    pub ballot: Ballot,
    #[prototk(3, string)]
    pub reason: String,
}

#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct AcceptRequestBody {
    #[prototk(1, message)]
    pub slot: Slot,
    #[prototk(2, message)]
    pub ballot: Ballot,
    #[prototk(3, message)]
    pub command: Option<Command>,
    #[prototk(4, uint64)]
    pub seq: u64,
    #[prototk(5, message)]
    pub deps: Vec<Slot>,
}

#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct AcceptAckBody {
    #[prototk(1, message)]
    pub slot: Slot,
    #[prototk(2, message)]
    pub ballot: Ballot,
}

#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct AcceptNackBody {
    #[prototk(1, message)]
    pub slot: Slot,
    #[prototk(2, message)]
    pub ballot: Ballot,
}

#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct CommitRequestBody {
    #[prototk(1, message)]
    pub slot: Slot,
    #[prototk(2, message)]
    pub ballot: Ballot,
    #[prototk(3, message)]
    pub command: Option<Command>,
    #[prototk(4, uint64)]
    pub seq: u64,
    #[prototk(5, message)]
    pub deps: Vec<Slot>,
}

#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct PrepareRequestBody {
    #[prototk(1, message)]
    pub slot: Slot,
    #[prototk(2, message)]
    pub ballot: Ballot,
}

#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct PrepareAckBody {
    #[prototk(1, message)]
    pub slot: Slot,
    #[prototk(2, message)]
    pub ballot: Ballot,
    #[prototk(3, message)]
    pub command: Option<Command>,
    #[prototk(4, uint64)]
    pub seq: u64,
    #[prototk(5, message)]
    pub deps: Vec<Slot>,
    #[prototk(6, uint32)]
    pub stage: u32,
}

#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct PrepareNackBody {
    #[prototk(1, message)]
    pub slot: Slot,
    #[prototk(2, message)]
    pub ballot: Ballot,
}

#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct PingBody {
    #[prototk(1, uint64)]
    pub id: u64,
}

#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct PongBody {
    #[prototk(1, uint64)]
    pub id: u64,
}

/// Sent in reply to a [PrepareRequestBody] or any acceptor request touching a slot below the
/// checkpoint frontier (`Error::SlotTooOld`): the peer has fallen far enough behind that
/// it must catch up out of band.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct DivergedBody {
    #[prototk(1, message)]
    pub slot: Slot,
}

/// The tagged union of every wire packet body exchanged between actors.
#[derive(Clone, Debug, Eq, Message, PartialEq)]
pub enum PacketBody {
    #[prototk(1, message)]
    ClientRequest(ClientRequestBody),
    #[prototk(2, message)]
    ClientResponse(ClientResponseBody),
    #[prototk(3, message)]
    PreAcceptRequest(PreAcceptRequestBody),
    #[prototk(4, message)]
    PreAcceptAck(PreAcceptAckBody),
    #[prototk(5, message)]
    PreAcceptNack(PreAcceptNackBody),
    #[prototk(6, message)]
    AcceptRequest(AcceptRequestBody),
    #[prototk(7, message)]
    AcceptAck(AcceptAckBody),
    #[prototk(8, message)]
    AcceptNack(AcceptNackBody),
    #[prototk(9, message)]
    CommitRequest(CommitRequestBody),
    #[prototk(10, message)]
    PrepareRequest(PrepareRequestBody),
    #[prototk(11, message)]
    PrepareAck(PrepareAckBody),
    #[prototk(12, message)]
    PrepareNack(PrepareNackBody),
    #[prototk(13, message)]
    Ping(PingBody),
    #[prototk(14, message)]
    Pong(PongBody),
    #[prototk(15, message)]
    Diverged(DivergedBody),
}

impl Default for PacketBody {
    fn default() -> Self {
        PacketBody::Ping(PingBody::default())
    }
}

impl PacketBody {
    /// A short, stable name for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            PacketBody::ClientRequest(_) => "ClientRequest",
            PacketBody::ClientResponse(_) => "ClientResponse",
            PacketBody::PreAcceptRequest(_) => "PreAcceptRequest",
            PacketBody::PreAcceptAck(_) => "PreAcceptAck",
            PacketBody::PreAcceptNack(_) => "PreAcceptNack",
            PacketBody::AcceptRequest(_) => "AcceptRequest",
            PacketBody::AcceptAck(_) => "AcceptAck",
            PacketBody::AcceptNack(_) => "AcceptNack",
            PacketBody::CommitRequest(_) => "CommitRequest",
            PacketBody::PrepareRequest(_) => "PrepareRequest",
            PacketBody::PrepareAck(_) => "PrepareAck",
            PacketBody::PrepareNack(_) => "PrepareNack",
            PacketBody::Ping(_) => "Ping",
            PacketBody::Pong(_) => "Pong",
            PacketBody::Diverged(_) => "Diverged",
        }
    }
}

/////////////////////////////////////////////// Error //////////////////////////////////////////////

static INCORRECT_BALLOT: biometrics::Counter = biometrics::Counter::new("concord_pb.error.incorrect_ballot");
static INCORRECT_STAGE: biometrics::Counter = biometrics::Counter::new("concord_pb.error.incorrect_stage");
static INCORRECT_COMMAND: biometrics::Counter = biometrics::Counter::new("concord_pb.error.incorrect_command");
static SLOT_TOO_OLD: biometrics::Counter = biometrics::Counter::new("concord_pb.error.slot_too_old");
static EXPLICIT_PREPARE: biometrics::Counter = biometrics::Counter::new("concord_pb.error.explicit_prepare");
static TRANSPORT: biometrics::Counter = biometrics::Counter::new("concord_pb.error.transport");

/// Register this crate's sensors with `collector`, mirroring `busyrpc::register_biometrics`.
pub fn register_biometrics(collector: &mut biometrics::Collector) {
    collector.register_counter(&INCORRECT_BALLOT);
    collector.register_counter(&INCORRECT_STAGE);
    collector.register_counter(&INCORRECT_COMMAND);
    collector.register_counter(&SLOT_TOO_OLD);
    collector.register_counter(&EXPLICIT_PREPARE);
    collector.register_counter(&TRANSPORT);
}

/// The engine's error taxonomy.  None of these cross the wire as `Error` values -- they are
/// local, typed control flow; ballot/stage rejections surface as `*Nack` packet bodies instead, and
/// `SlotTooOld` surfaces as [DivergedBody].
#[derive(Clone, zerror_derive::Z)]
pub enum Error {
    /// A proposed transition at a ballot lower than the stored one.
    IncorrectBallot { core: ErrorCore, old: Ballot },
    /// A proposed transition that would regress `stage`.
    IncorrectStage { core: ErrorCore, old: u32 },
    /// An attempt to change an already-committed command.  Fatal: a safety violation.
    IncorrectCommand { core: ErrorCore },
    /// A load or update below the checkpoint frontier.
    SlotTooOld { core: ErrorCore, slot: Slot },
    /// A recovery round is needed; local control flow, not a wire error.
    ExplicitPrepare { core: ErrorCore, reason: String },
    /// The transport could not deliver a packet; logged and dropped, never retried here.
    Transport { core: ErrorCore, what: String },
}

impl Error {
    /// Construct [Error::IncorrectBallot].
    pub fn incorrect_ballot(old: Ballot) -> Self {
        Error::IncorrectBallot {
            core: ErrorCore::new(
                "concord@rescrv.net",
                "proposed transition uses a ballot lower than the stored ballot",
                &INCORRECT_BALLOT,
            ),
            old,
        }
    }

    /// Construct [Error::IncorrectStage].
    pub fn incorrect_stage(old: Stage) -> Self {
        Error::IncorrectStage {
            core: ErrorCore::new(
                "concord@rescrv.net",
                "proposed transition regresses stage",
                &INCORRECT_STAGE,
            ),
            old: old.into(),
        }
    }

    /// Construct [Error::IncorrectCommand].
    pub fn incorrect_command() -> Self {
        Error::IncorrectCommand {
            core: ErrorCore::new(
                "concord@rescrv.net",
                "attempt to change a committed command; this is a safety violation",
                &INCORRECT_COMMAND,
            ),
        }
    }

    /// Construct [Error::SlotTooOld].
    pub fn slot_too_old(slot: Slot) -> Self {
        Error::SlotTooOld {
            core: ErrorCore::new(
                "concord@rescrv.net",
                "load or update on a slot below the checkpoint frontier",
                &SLOT_TOO_OLD,
            ),
            slot,
        }
    }

    /// Construct [Error::ExplicitPrepare].
    pub fn explicit_prepare(reason: impl Into<String>) -> Self {
        Error::ExplicitPrepare {
            core: ErrorCore::new("concord@rescrv.net", "explicit prepare required", &EXPLICIT_PREPARE),
            reason: reason.into(),
        }
    }

    /// Construct [Error::Transport].
    pub fn transport(what: impl Into<String>) -> Self {
        Error::Transport {
            core: ErrorCore::new("concord@rescrv.net", "transport could not deliver a packet", &TRANSPORT),
            what: what.into(),
        }
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_total_order() {
        assert!(Stage::Prepared < Stage::PreAccepted);
        assert!(Stage::PreAccepted < Stage::Accepted);
        assert!(Stage::Accepted < Stage::Committed);
        assert!(Stage::Committed < Stage::Executed);
        assert!(Stage::Executed < Stage::Purged);
    }

    #[test]
    fn stage_roundtrip() {
        for stage in [
            Stage::Prepared,
            Stage::PreAccepted,
            Stage::Accepted,
            Stage::Committed,
            Stage::Executed,
            Stage::Purged,
        ] {
            let wire: u32 = stage.into();
            assert_eq!(stage, Stage::try_from(wire).unwrap());
        }
    }

    #[test]
    fn slot_ordering_is_lexicographic() {
        let r1 = ReplicaID::new(1);
        let r2 = ReplicaID::new(2);
        assert!(Slot::new(r1, 100) < Slot::new(r2, 0));
        assert!(Slot::new(r1, 0) < Slot::new(r1, 1));
    }

    #[test]
    fn ballot_ordering_is_lexicographic() {
        let r1 = ReplicaID::new(1);
        let r2 = ReplicaID::new(2);
        assert!(Ballot::initial(0, r1) < Ballot::initial(1, r1));
        assert!(Ballot::initial(0, r1).next(r2) > Ballot::initial(0, r1));
    }

    #[test]
    fn mutator_interference() {
        let id1 = CommandID::generate().unwrap();
        let id2 = CommandID::generate().unwrap();
        let a = Command::mutator(id1, "SET", vec![Key::from("x")]);
        let b = Command::mutator(id2, "SET", vec![Key::from("x")]);
        let c = Command::mutator(id2, "SET", vec![Key::from("y")]);
        assert!(a.interferes_with(&b));
        assert!(!a.interferes_with(&c));
    }

    #[test]
    fn checkpoint_interferes_with_everything() {
        let id1 = CommandID::generate().unwrap();
        let id2 = CommandID::generate().unwrap();
        let a = Command::mutator(id1, "SET", vec![Key::from("x")]);
        let cp = Command::checkpoint(id2, 1);
        assert!(a.interferes_with(&cp));
        assert!(cp.interferes_with(&a));
    }

    #[test]
    fn quorum_sizes_match_spec_formula() {
        let mut cfg = Configuration {
            peer_addr: std::collections::BTreeMap::from([
                (ReplicaID::new(1), "a".to_string()),
                (ReplicaID::new(2), "b".to_string()),
                (ReplicaID::new(3), "c".to_string()),
                (ReplicaID::new(4), "d".to_string()),
            ]),
            ..Configuration::default()
        };
        assert_eq!(cfg.cluster_size(), 5);
        assert_eq!(cfg.f(), 2);
        assert_eq!(cfg.slow_quorum(), 3);
        assert_eq!(cfg.fast_quorum(), 4);
        cfg.fast_path = FastPath::FPlusHalfFPlusOne;
        assert_eq!(cfg.fast_quorum(), 4);
    }

    #[test]
    fn packet_roundtrips() {
        use buffertk::{stack_pack, Unpacker};
        let packet = Packet {
            origin: ReplicaID::new(1),
            destination: ReplicaID::new(2),
            body: PacketBody::Ping(PingBody { id: 7 }),
        };
        let bytes = stack_pack(&packet).to_vec();
        let mut up = Unpacker::new(&bytes);
        let got: Packet = up.unpack().unwrap();
        assert_eq!(packet, got);
    }
}
