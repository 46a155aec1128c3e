#![doc = include_str!("../README.md")]

//! The router (`spec.md` §4.9/§5 and §9's design note): the single owner of one replica's mutable
//! state. Every other crate in this workspace is a pure function or a small struct that returns an
//! effect rather than talking to its neighbors directly; `Router` is where those effects meet the
//! store and fan back out as packets to send.
//!
//! `Router::on_tick` and `Router::on_packet` are the only two entry points. Both return a
//! `Vec<Effect>` for the caller (the `concord` binary, or a test) to drain: every packet to send,
//! and every command the executor applied to the replicated state machine.

use std::collections::HashSet;

use concord_checkpoint::CheckpointScheduler;
use concord_client::{ClientHandler, ClientRequestOutcome};
use concord_exec::{ExecutedItem, Executor};
use concord_leader::Leader;
use concord_net::ping::PingTracker;
use concord_pb::{
    ClientRequestBody, ClientResponseBody, Command, Configuration, Packet, PacketBody, PongBody,
    ReplicaID, Slot, Stage,
};
use concord_store::{InstanceState, InstanceStore};
use concord_timeout::TimeoutWheel;

///////////////////////////////////////////// biometrics ///////////////////////////////////////////

static PACKET_DISPATCHED: biometrics::Counter = biometrics::Counter::new("concord_router.packet.dispatched");
static TICK: biometrics::Counter = biometrics::Counter::new("concord_router.tick");
static CHECKPOINT_PROPOSED: biometrics::Counter = biometrics::Counter::new("concord_router.checkpoint.proposed");

/// Register every sensor in the workspace with `collector`: this crate's own, plus every actor
/// crate it wires together, mirroring `busyrpc::register_biometrics`'s aggregation of
/// `client`/`channel`/`server`/`poll` into one call a binary's startup can make.
pub fn register_biometrics(collector: &mut biometrics::Collector) {
    collector.register_counter(&PACKET_DISPATCHED);
    collector.register_counter(&TICK);
    collector.register_counter(&CHECKPOINT_PROPOSED);
    concord_pb::register_biometrics(collector);
    concord_store::register_biometrics(collector);
    concord_timeout::register_biometrics(collector);
    concord_acceptor::register_biometrics(collector);
    concord_leader::register_biometrics(collector);
    concord_exec::register_biometrics(collector);
    concord_client::register_biometrics(collector);
    concord_checkpoint::register_biometrics(collector);
    concord_net::register_biometrics(collector);
}

///////////////////////////////////////////// logging //////////////////////////////////////////////

static COLLECTOR: indicio::Collector = indicio::Collector::new();

///////////////////////////////////////////// Effect ///////////////////////////////////////////////

/// Something the router needs the caller to do with the outside world.
#[derive(Clone, Debug)]
pub enum Effect {
    /// Send this packet over the transport.
    Send(Packet),
    /// This command was just applied, in order, to the replicated state machine. Applying it for
    /// real (e.g. to a key-value store) is outside concord's scope, per `spec.md`'s component
    /// table; the router only reports the order.
    Applied(ExecutedItem),
}

///////////////////////////////////////////// Router ///////////////////////////////////////////////

/// Owns every piece of mutable state at one replica and drives it forward one tick or one packet
/// at a time. `spec.md` §5's concurrency model: a single owner, no locks, actors that never call
/// each other directly.
pub struct Router {
    self_id: ReplicaID,
    peers: Vec<ReplicaID>,
    store: InstanceStore,
    leader: Leader,
    client: ClientHandler,
    executor: Executor,
    timeouts: TimeoutWheel,
    checkpoint: CheckpointScheduler,
    pings: PingTracker,
    /// Slots already fed into the executor, so a duplicate `Commit` delivery (or a redundant
    /// Explicit Prepare re-commit) never re-enters `Executor::on_committed` for the same slot.
    notified_committed: HashSet<Slot>,
}

impl Router {
    /// Construct a router for `config`. `timeout_seed` should be distinct per replica (see
    /// [TimeoutWheel::new]); `tick_interval` is the tick-based checkpoint trigger, independent of
    /// `config.checkpoint_each`'s count-based one (`0` disables it).
    pub fn new(config: &Configuration, timeout_seed: u64, tick_interval: u64) -> Self {
        Self {
            self_id: config.replica_id,
            peers: config.peer_addr.keys().copied().collect(),
            store: InstanceStore::new(config.replica_id, config.epoch),
            leader: Leader::new(config),
            client: ClientHandler::new(),
            executor: Executor::new(),
            timeouts: TimeoutWheel::new(timeout_seed, config.timeout, config.timeout_range),
            checkpoint: CheckpointScheduler::new(config.checkpoint_each, tick_interval),
            pings: PingTracker::new(),
            notified_committed: HashSet::new(),
        }
    }

    /// Read-only access to the instance store, for introspection and tests.
    pub fn store(&self) -> &InstanceStore {
        &self.store
    }

    /// Read-only access to the executor, for introspection and tests.
    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    //////////////////////////////////////////// tick ///////////////////////////////////////////////

    /// Drive every timer-based actor forward to tick `now`: fired explicit-prepare deadlines are
    /// retried, and the checkpoint scheduler's tick trigger is polled.
    pub fn on_tick(&mut self, now: u64) -> Vec<Effect> {
        TICK.click();
        let mut effects = Vec::new();
        for slot in self.timeouts.poll(now) {
            let leffects = self.leader.explicit_prepare(&mut self.store, slot);
            self.wrap_sends(leffects, &mut effects);
            self.after_store_touch(slot, now, &mut effects);
        }
        if let Some(cmd) = self.checkpoint.on_tick() {
            CHECKPOINT_PROPOSED.click();
            self.propose(cmd, now, &mut effects);
        }
        effects
    }

    /// Send a `Ping` to `peer` at tick `now`. Ping cadence is a caller policy, not something the
    /// router schedules itself: `Configuration` carries no ping-interval knob.
    pub fn ping_peer(&mut self, peer: ReplicaID, now: u64) -> Effect {
        let body = self.pings.ping(peer, now);
        self.send(peer, PacketBody::Ping(body))
    }

    //////////////////////////////////////////// packets ////////////////////////////////////////////

    /// Dispatch one inbound packet to the actor that owns its kind, per `spec.md` §4's data flow.
    pub fn on_packet(&mut self, now: u64, packet: Packet) -> Vec<Effect> {
        PACKET_DISPATCHED.click();
        let from = packet.origin;
        let mut effects = Vec::new();
        match packet.body {
            PacketBody::ClientRequest(body) => {
                self.on_client_request(now, from, body.command, &mut effects);
            }
            PacketBody::ClientResponse(_) => {
                // This replica issues client requests to itself only via `propose`, whose
                // responses are observed through `ClientHandler`, not through inbound packets.
            }
            PacketBody::PreAcceptRequest(req) => {
                let slot = req.slot;
                let outcome = concord_acceptor::handle_pre_accept(&mut self.store, req);
                self.apply_acceptor_outcome(from, outcome, &mut effects);
                self.after_store_touch(slot, now, &mut effects);
            }
            PacketBody::PreAcceptAck(ack) => {
                let slot = ack.slot;
                let leffects = self.leader.on_pre_accept_ack(&mut self.store, from, ack);
                self.wrap_sends(leffects, &mut effects);
                self.after_store_touch(slot, now, &mut effects);
            }
            PacketBody::PreAcceptNack(_) => {
                // A slow leader round times out and is retried via Explicit Prepare; the nack
                // itself carries nothing actionable beyond that, per `spec.md` §4.4.
            }
            PacketBody::AcceptRequest(req) => {
                let slot = req.slot;
                let outcome = concord_acceptor::handle_accept(&mut self.store, req);
                self.apply_acceptor_outcome(from, outcome, &mut effects);
                self.after_store_touch(slot, now, &mut effects);
            }
            PacketBody::AcceptAck(ack) => {
                let slot = ack.slot;
                let leffects = self.leader.on_accept_ack(&mut self.store, from, ack);
                self.wrap_sends(leffects, &mut effects);
                self.after_store_touch(slot, now, &mut effects);
            }
            PacketBody::AcceptNack(nack) => {
                self.leader.on_accept_nack(nack.slot);
            }
            PacketBody::CommitRequest(req) => {
                let slot = req.slot;
                let outcome = concord_acceptor::handle_commit(&mut self.store, req);
                self.apply_acceptor_outcome(from, outcome, &mut effects);
                self.after_store_touch(slot, now, &mut effects);
            }
            PacketBody::PrepareRequest(req) => {
                let outcome = concord_acceptor::handle_prepare(&self.store, req);
                self.apply_acceptor_outcome(from, outcome, &mut effects);
            }
            PacketBody::PrepareAck(ack) => {
                let slot = ack.slot;
                let leffects = self.leader.on_prepare_ack(&mut self.store, from, ack);
                self.wrap_sends(leffects, &mut effects);
                self.after_store_touch(slot, now, &mut effects);
            }
            PacketBody::PrepareNack(nack) => {
                self.leader.on_prepare_nack(nack.slot, nack);
            }
            PacketBody::Ping(ping) => {
                effects.push(self.send(from, PacketBody::Pong(PongBody { id: ping.id })));
            }
            PacketBody::Pong(pong) => {
                self.pings.pong(from, pong, now);
            }
            PacketBody::Diverged(body) => {
                // Catching this replica up from a snapshot is out of scope (`spec.md` §7: "outside
                // the core"); just note it so an operator can see a peer has fallen behind.
                indicio::clue!(COLLECTOR, indicio::WARNING, {
                    event: "diverged",
                    from: from.to_string(),
                    slot: body.slot.to_string(),
                });
            }
        }
        effects
    }

    fn on_client_request(&mut self, now: u64, peer: ReplicaID, cmd: Command, effects: &mut Vec<Effect>) {
        let looked_up = self.store.load_by_command_id(cmd.id);
        match self.client.on_client_request(peer, looked_up) {
            ClientRequestOutcome::RespondNow(committed) => {
                effects.push(self.send(
                    peer,
                    PacketBody::ClientResponse(ClientResponseBody { command: committed }),
                ));
            }
            ClientRequestOutcome::Remembered => {}
            ClientRequestOutcome::StartLeader => {
                let (slot, leffects) = self.leader.client_request(&mut self.store, cmd);
                self.client.remember(slot, peer);
                self.wrap_sends(leffects, effects);
                self.after_store_touch(slot, now, effects);
            }
        }
    }

    fn propose(&mut self, cmd: Command, now: u64, effects: &mut Vec<Effect>) {
        let (slot, leffects) = self.leader.client_request(&mut self.store, cmd);
        self.wrap_sends(leffects, effects);
        self.after_store_touch(slot, now, effects);
    }

    fn apply_acceptor_outcome(
        &mut self,
        to: ReplicaID,
        outcome: concord_acceptor::AcceptorOutcome,
        effects: &mut Vec<Effect>,
    ) {
        if let Some(body) = outcome.reply {
            effects.push(self.send(to, body));
        }
        if let Some(slot) = outcome.leader_stop {
            self.leader.leader_stop(slot);
        }
    }

    /// After any handler may have changed `slot`'s stage, propagate that change to every other
    /// actor that cares: the timeout wheel re-arms (or clears) its deadline, the leader cancels
    /// its sub-coroutine if one raced to completion, and — the first time a slot is observed
    /// `Committed` — the executor, client handler, and checkpoint scheduler react.
    fn after_store_touch(&mut self, slot: Slot, now: u64, effects: &mut Vec<Effect>) {
        let Ok((_, state)) = self.store.load(slot) else {
            self.timeouts.cancel(slot);
            return;
        };
        self.timeouts.schedule(slot, state.stage, now);
        self.leader.on_instance_state(slot, state.stage);
        if state.stage >= Stage::Committed && self.notified_committed.insert(slot) {
            self.on_slot_committed(slot, state, now, effects);
        }
    }

    fn on_slot_committed(&mut self, slot: Slot, state: InstanceState, now: u64, effects: &mut Vec<Effect>) {
        if let Some(cmd) = &state.command {
            if let Some((peer, reply)) = self.client.on_committed(slot, cmd) {
                effects.push(self.send(peer, PacketBody::ClientResponse(ClientResponseBody { command: reply })));
            }
        }
        let exec_effects = self.executor.on_committed(slot, state.seq, state.deps, state.command);
        for item in &exec_effects.executed {
            effects.push(Effect::Applied(item.clone()));
        }
        if let Some(cmd) = self.checkpoint.on_executed(exec_effects.executed.len()) {
            CHECKPOINT_PROPOSED.click();
            self.propose(cmd, now, effects);
        }
        for event in &exec_effects.checkpoints {
            concord_checkpoint::apply_checkpoint_event(&mut self.store, &mut self.executor, event);
            self.timeouts.cancel(event.slot);
        }
    }

    fn wrap_sends(&self, leffects: concord_leader::LeaderEffects, effects: &mut Vec<Effect>) {
        for (peer, body) in leffects.sends {
            effects.push(self.send(peer, body));
        }
    }

    fn send(&self, destination: ReplicaID, body: PacketBody) -> Effect {
        Effect::Send(Packet {
            origin: self.self_id,
            destination,
            body,
        })
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use concord_pb::{FastPath, Key};

    fn replica(id: u32) -> ReplicaID {
        ReplicaID::new(id)
    }

    fn config(self_id: u32, peers: &[u32]) -> Configuration {
        Configuration {
            replica_id: replica(self_id),
            epoch: 0,
            peer_addr: peers
                .iter()
                .map(|&p| (replica(p), format!("127.0.0.1:{p}")))
                .collect(),
            jiffies: 10,
            timeout: 20,
            timeout_range: 0,
            checkpoint_each: 100,
            alpha: 10,
            fast_path: FastPath::TwoF,
        }
    }

    fn mutator() -> Command {
        use concord_pb::CommandID;
        Command::mutator(CommandID::generate().unwrap(), "SET", vec![Key::from("a")])
    }

    fn client_request(cmd: Command) -> Packet {
        Packet {
            origin: ReplicaID::new(999),
            destination: ReplicaID::new(1),
            body: PacketBody::ClientRequest(ClientRequestBody { command: cmd }),
        }
    }

    fn only_sends(effects: &[Effect]) -> Vec<Packet> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Send(p) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn single_replica_client_request_commits_and_replies_and_applies() {
        let cfg = config(1, &[]);
        let mut router = Router::new(&cfg, 1, 0);
        let peer = ReplicaID::new(999);
        let cmd = mutator();
        let effects = router.on_packet(0, client_request(cmd.clone()));

        assert!(
            only_sends(&effects)
                .iter()
                .any(|p| p.destination == peer && matches!(p.body, PacketBody::ClientResponse(_)))
        );
        assert!(effects.iter().any(|e| matches!(e, Effect::Applied(item) if item.command == Some(cmd))));
    }

    #[test]
    fn five_node_cluster_drives_preaccept_through_commit_via_router_dispatch() {
        let cfg = config(1, &[2, 3, 4, 5]);
        let mut router = Router::new(&cfg, 1, 0);
        let cmd = mutator();
        let effects = router.on_packet(0, client_request(cmd));
        let sends = only_sends(&effects);
        assert_eq!(sends.len(), 4);
        let PacketBody::PreAcceptRequest(req) = &sends[0].body else {
            panic!("expected PreAcceptRequest");
        };
        let slot = req.slot;

        let ballot = req.ballot;
        let mut any_committed = false;
        for peer_id in [2u32, 3, 4] {
            let ack = Packet {
                origin: replica(peer_id),
                destination: replica(1),
                body: PacketBody::PreAcceptAck(concord_pb::PreAcceptAckBody {
                    slot,
                    ballot,
                    seq: 0,
                    deps: vec![],
                    deps_committed_mask: 0,
                }),
            };
            let effects = router.on_packet(0, ack);
            if only_sends(&effects).iter().any(|p| matches!(p.body, PacketBody::CommitRequest(_))) {
                any_committed = true;
            }
        }
        assert!(any_committed);
        let (_, state) = router.store().load(slot).unwrap();
        assert_eq!(state.stage, Stage::Committed);
        assert!(router.executor().is_executed(slot));
    }

    #[test]
    fn duplicate_client_request_after_commit_replies_without_restarting_consensus() {
        let cfg = config(1, &[]);
        let mut router = Router::new(&cfg, 1, 0);
        let cmd = mutator();
        router.on_packet(0, client_request(cmd.clone()));
        let effects = router.on_packet(1, client_request(cmd));
        let sends = only_sends(&effects);
        assert_eq!(sends.len(), 1);
        assert!(matches!(sends[0].body, PacketBody::ClientResponse(_)));
    }

    #[test]
    fn ping_then_pong_round_trip_through_the_router() {
        let cfg = config(1, &[2]);
        let mut router_a = Router::new(&cfg, 1, 0);
        let effect = router_a.ping_peer(replica(2), 100);
        let Effect::Send(ping_packet) = effect else {
            panic!("expected a Send effect");
        };

        let cfg_b = config(2, &[1]);
        let mut router_b = Router::new(&cfg_b, 2, 0);
        let effects = router_b.on_packet(105, ping_packet);
        let sends = only_sends(&effects);
        assert_eq!(sends.len(), 1);
        assert!(matches!(sends[0].body, PacketBody::Pong(_)));

        let pong_packet = sends[0].clone();
        let effects = router_a.on_packet(110, pong_packet);
        assert!(only_sends(&effects).is_empty());
    }

    #[test]
    fn fired_timeout_retriggers_explicit_prepare() {
        let cfg = config(2, &[1, 3, 4, 5]);
        let mut router = Router::new(&cfg, 1, 0);
        let dead_leader_slot = Slot::new(replica(1), 0);
        router.timeouts.schedule(dead_leader_slot, Stage::Prepared, 0);

        let effects = router.on_tick(1000);
        let sends = only_sends(&effects);
        assert_eq!(sends.len(), 4);
        assert!(sends.iter().all(|p| matches!(p.body, PacketBody::PrepareRequest(_))));
    }

    #[test]
    fn checkpoint_count_trigger_proposes_through_the_leader() {
        let mut cfg = config(1, &[]);
        cfg.checkpoint_each = 1;
        let mut router = Router::new(&cfg, 1, 0);
        let effects = router.on_packet(0, client_request(mutator()));
        // the mutator's own commit plus the checkpoint command it triggers both execute.
        let applied: Vec<_> = effects
            .iter()
            .filter_map(|e| match e {
                Effect::Applied(item) => Some(item.clone()),
                _ => None,
            })
            .collect();
        assert!(applied.iter().any(|item| item.command.as_ref().map(|c| c.is_checkpoint()).unwrap_or(false)));
    }
}
