#![doc = include_str!("../README.md")]

//! The leader sub-coroutine (`spec.md` §4.4): drives a client-requested instance through
//! PreAccept, optionally Accept, and Commit; and drives Explicit Prepare recovery for a slot
//! whose owner has gone quiet.  There is at most one leader sub-coroutine per slot at this
//! replica; it is destroyed the moment the slot reaches `Committed` or the acceptor reports
//! `LeaderStop`, per `spec.md` §4.3/§4.4.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::convert::TryFrom;

use concord_pb::{
    AcceptAckBody, AcceptRequestBody, Ballot, Command, CommitRequestBody, Configuration,
    PrepareAckBody, PrepareNackBody, PrepareRequestBody, PreAcceptAckBody, PreAcceptRequestBody,
    PacketBody, ReplicaID, Slot, Stage,
};
use concord_store::{InstanceState, InstanceStore};

///////////////////////////////////////////// biometrics ///////////////////////////////////////////

static CLIENT_REQUESTS: biometrics::Counter = biometrics::Counter::new("concord_leader.client_request");
static FAST_PATH_COMMITS: biometrics::Counter = biometrics::Counter::new("concord_leader.commit.fast_path");
static SLOW_PATH_COMMITS: biometrics::Counter = biometrics::Counter::new("concord_leader.commit.slow_path");
static COMMIT_ABANDONED: biometrics::Counter = biometrics::Counter::new("concord_leader.commit.abandoned");
static EXPLICIT_PREPARES: biometrics::Counter = biometrics::Counter::new("concord_leader.explicit_prepare");
static EXPLICIT_PREPARE_NACKED: biometrics::Counter =
    biometrics::Counter::new("concord_leader.explicit_prepare.nacked");
static LEADER_STOPPED: biometrics::Counter = biometrics::Counter::new("concord_leader.stopped");

/// Register this crate's sensors with `collector`, mirroring `busyrpc::register_biometrics`.
pub fn register_biometrics(collector: &mut biometrics::Collector) {
    collector.register_counter(&CLIENT_REQUESTS);
    collector.register_counter(&FAST_PATH_COMMITS);
    collector.register_counter(&SLOW_PATH_COMMITS);
    collector.register_counter(&COMMIT_ABANDONED);
    collector.register_counter(&EXPLICIT_PREPARES);
    collector.register_counter(&EXPLICIT_PREPARE_NACKED);
    collector.register_counter(&LEADER_STOPPED);
}

///////////////////////////////////////////// logging //////////////////////////////////////////////

static COLLECTOR: indicio::Collector = indicio::Collector::new();

///////////////////////////////////////////// LeaderEffects ////////////////////////////////////////

/// Packets the router must send as a consequence of a leader transition.  `sends` is empty when a
/// call was a no-op (stale ballot, unknown slot, duplicate ack).
#[derive(Clone, Debug, Default)]
pub struct LeaderEffects {
    pub sends: Vec<(ReplicaID, PacketBody)>,
}

///////////////////////////////////////////// LeaderState ///////////////////////////////////////////

/// The state of one slot's leader sub-coroutine.
#[derive(Clone, Debug)]
enum LeaderState {
    /// Awaiting `PreAcceptAck`s.  `non_fast` disables the fast-path commit check: set when this
    /// round was started by explicit prepare's "non-fast PreAccept" branches, per `spec.md`
    /// §4.4's recovery decision table.
    PreAccept {
        ballot: Ballot,
        command: Option<Command>,
        local_seq: u64,
        local_deps: BTreeSet<Slot>,
        non_fast: bool,
        replied: HashMap<ReplicaID, (u64, BTreeSet<Slot>)>,
    },
    /// Awaiting `AcceptAck`s.
    Accept {
        ballot: Ballot,
        command: Option<Command>,
        seq: u64,
        deps: BTreeSet<Slot>,
        replied: HashSet<ReplicaID>,
    },
    /// Awaiting `PrepareAck`s during Explicit Prepare recovery.
    Prepare {
        ballot: Ballot,
        replied: HashMap<ReplicaID, PrepareAckBody>,
    },
}

///////////////////////////////////////////// Leader ////////////////////////////////////////////////

/// Owns every leader sub-coroutine active at this replica, keyed by slot.  A slot's owning
/// replica (`slot.replica_id`) need not be `self_id`: any replica may run Explicit Prepare
/// recovery for any slot, per `spec.md` §4.4's recovery scenario.
#[derive(Debug)]
pub struct Leader {
    self_id: ReplicaID,
    epoch: u32,
    peers: Vec<ReplicaID>,
    fast_quorum: usize,
    slow_quorum: usize,
    next_instance_id: u64,
    slots: HashMap<Slot, LeaderState>,
}

impl Leader {
    /// Construct a leader for `config`.  `config.replica_id` owns every slot this leader
    /// allocates via [Leader::client_request].
    pub fn new(config: &Configuration) -> Self {
        Self {
            self_id: config.replica_id,
            epoch: config.epoch,
            peers: config.peer_addr.keys().copied().collect(),
            fast_quorum: config.fast_quorum(),
            slow_quorum: config.slow_quorum(),
            next_instance_id: 0,
            slots: HashMap::new(),
        }
    }

    /// True iff a leader sub-coroutine for `slot` is currently active.
    pub fn is_active(&self, slot: Slot) -> bool {
        self.slots.contains_key(&slot)
    }

    //////////////////////////////////////// client-request flow ///////////////////////////////////

    /// Start a new instance for `cmd`: allocate the next slot owned by `self_id`, store it
    /// `PreAccepted` at the initial ballot, and broadcast `PreAcceptRequest` to every peer, per
    /// `spec.md` §4.4 steps 1-3.
    pub fn client_request(&mut self, store: &mut InstanceStore, cmd: Command) -> (Slot, LeaderEffects) {
        CLIENT_REQUESTS.click();
        let slot = Slot::new(self.self_id, self.next_instance_id);
        self.next_instance_id += 1;
        let ballot = Ballot::initial(self.epoch, self.self_id);
        let new = InstanceState {
            ballot,
            stage: Stage::PreAccepted,
            command: Some(cmd),
            seq: 0,
            deps: BTreeSet::new(),
        };
        let (_, upd) = store
            .update(slot, new)
            .expect("a freshly allocated slot cannot fail its first update");
        indicio::clue!(COLLECTOR, indicio::INFO, {
            event: "client_request.allocated",
            slot: slot.to_string(),
        });
        let mut effects = LeaderEffects::default();
        self.broadcast_pre_accept(slot, ballot, &upd, &mut effects);
        if self.fast_quorum.saturating_sub(1) == 0 {
            self.try_commit(store, slot, ballot, upd.command, upd.seq, upd.deps, &mut effects);
        } else {
            self.slots.insert(
                slot,
                LeaderState::PreAccept {
                    ballot,
                    command: upd.command,
                    local_seq: upd.seq,
                    local_deps: upd.deps,
                    non_fast: false,
                    replied: HashMap::new(),
                },
            );
        }
        (slot, effects)
    }

    /// Handle a `PreAcceptAck` from `from`.  Ignored if no matching `PreAccept` round for
    /// `ack.slot` is in flight, or the ack's ballot does not match the round's.
    pub fn on_pre_accept_ack(
        &mut self,
        store: &mut InstanceStore,
        from: ReplicaID,
        ack: PreAcceptAckBody,
    ) -> LeaderEffects {
        let mut effects = LeaderEffects::default();
        let matches = matches!(
            self.slots.get(&ack.slot),
            Some(LeaderState::PreAccept { ballot, .. }) if *ballot == ack.ballot
        );
        if !matches {
            return effects;
        }
        if let Some(LeaderState::PreAccept { replied, .. }) = self.slots.get_mut(&ack.slot) {
            replied.insert(from, (ack.seq, ack.deps.iter().copied().collect()));
        }
        let needed = self.fast_quorum.saturating_sub(1);
        let ready = matches!(
            self.slots.get(&ack.slot),
            Some(LeaderState::PreAccept { replied, .. }) if replied.len() >= needed
        );
        if !ready {
            return effects;
        }
        let Some(LeaderState::PreAccept {
            ballot,
            command,
            local_seq,
            local_deps,
            non_fast,
            replied,
        }) = self.slots.remove(&ack.slot)
        else {
            return effects;
        };
        let all_match = replied
            .values()
            .all(|(seq, deps)| *seq == local_seq && *deps == local_deps);
        if !non_fast && all_match {
            FAST_PATH_COMMITS.click();
            self.try_commit(store, ack.slot, ballot, command, local_seq, local_deps, &mut effects);
        } else {
            let mut seq = local_seq;
            let mut deps = local_deps;
            for (s, d) in replied.values() {
                seq = seq.max(*s);
                deps.extend(d.iter().copied());
            }
            self.start_accept(store, ack.slot, ballot, command, seq, deps, &mut effects);
        }
        effects
    }

    /// Handle an `AcceptAck` from `from`.  Ignored if no matching `Accept` round for `ack.slot`
    /// is in flight, or the ack's ballot does not match the round's.
    pub fn on_accept_ack(
        &mut self,
        store: &mut InstanceStore,
        from: ReplicaID,
        ack: AcceptAckBody,
    ) -> LeaderEffects {
        let mut effects = LeaderEffects::default();
        let matches = matches!(
            self.slots.get(&ack.slot),
            Some(LeaderState::Accept { ballot, .. }) if *ballot == ack.ballot
        );
        if !matches {
            return effects;
        }
        if let Some(LeaderState::Accept { replied, .. }) = self.slots.get_mut(&ack.slot) {
            replied.insert(from);
        }
        let needed = self.slow_quorum.saturating_sub(1);
        let ready = matches!(
            self.slots.get(&ack.slot),
            Some(LeaderState::Accept { replied, .. }) if replied.len() >= needed
        );
        if !ready {
            return effects;
        }
        let Some(LeaderState::Accept {
            ballot,
            command,
            seq,
            deps,
            ..
        }) = self.slots.remove(&ack.slot)
        else {
            return effects;
        };
        SLOW_PATH_COMMITS.click();
        self.try_commit(store, ack.slot, ballot, command, seq, deps, &mut effects);
        effects
    }

    /// Nacks carry no information this leader needs beyond "abandon"; an abandoned `Accept`
    /// round simply times out and is retried via Explicit Prepare, per `spec.md` §4.4.
    pub fn on_accept_nack(&mut self, slot: Slot) {
        self.slots.remove(&slot);
    }

    //////////////////////////////////////// explicit prepare flow /////////////////////////////////

    /// Begin Explicit Prepare recovery for `slot`: bump its ballot, store the bump, and broadcast
    /// `PrepareRequest` to every peer, per `spec.md` §4.4's recovery flow steps 1-3.  A
    /// synthesized self-reply is folded in immediately so the local vote always counts.
    pub fn explicit_prepare(&mut self, store: &mut InstanceStore, slot: Slot) -> LeaderEffects {
        EXPLICIT_PREPARES.click();
        let mut effects = LeaderEffects::default();
        let Ok((_, old)) = store.load(slot) else {
            return effects;
        };
        let new_ballot = old.ballot.next(self.self_id);
        let new = InstanceState {
            ballot: new_ballot,
            stage: old.stage,
            command: old.command.clone(),
            seq: old.seq,
            deps: old.deps.clone(),
        };
        let Ok((_, upd)) = store.update(slot, new) else {
            return effects;
        };
        indicio::clue!(COLLECTOR, indicio::INFO, {
            event: "explicit_prepare.started",
            slot: slot.to_string(),
            ballot: format!("{new_ballot:?}"),
        });
        for &peer in &self.peers {
            effects.sends.push((
                peer,
                PacketBody::PrepareRequest(PrepareRequestBody {
                    slot,
                    ballot: new_ballot,
                }),
            ));
        }
        let self_reply = PrepareAckBody {
            slot,
            ballot: new_ballot,
            command: upd.command.clone(),
            seq: upd.seq,
            deps: upd.deps.iter().copied().collect(),
            stage: u32::from(upd.stage),
        };
        let mut replied = HashMap::new();
        replied.insert(self.self_id, self_reply);
        if self.slow_quorum.saturating_sub(1) == 0 {
            self.decide_prepare(store, slot, new_ballot, replied, &mut effects);
        } else {
            self.slots.insert(slot, LeaderState::Prepare { ballot: new_ballot, replied });
        }
        effects
    }

    /// Handle a `PrepareAck` from `from`.  Ignored unless a matching `Prepare` round for
    /// `ack.slot` is in flight at the same ballot.
    pub fn on_prepare_ack(
        &mut self,
        store: &mut InstanceStore,
        from: ReplicaID,
        ack: PrepareAckBody,
    ) -> LeaderEffects {
        let mut effects = LeaderEffects::default();
        let matches = matches!(
            self.slots.get(&ack.slot),
            Some(LeaderState::Prepare { ballot, .. }) if *ballot == ack.ballot
        );
        if !matches {
            return effects;
        }
        if let Some(LeaderState::Prepare { replied, .. }) = self.slots.get_mut(&ack.slot) {
            replied.insert(from, ack.clone());
        }
        let ready = matches!(
            self.slots.get(&ack.slot),
            Some(LeaderState::Prepare { replied, .. }) if replied.len() >= self.slow_quorum
        );
        if !ready {
            return effects;
        }
        let Some(LeaderState::Prepare { ballot, replied }) = self.slots.remove(&ack.slot) else {
            return effects;
        };
        self.decide_prepare(store, ack.slot, ballot, replied, &mut effects);
        effects
    }

    /// A nack with a matching ballot terminates recovery; the timeout wheel will eventually
    /// retrigger Explicit Prepare for `slot`, per `spec.md` §4.4.
    pub fn on_prepare_nack(&mut self, slot: Slot, nack: PrepareNackBody) {
        let matches = matches!(
            self.slots.get(&slot),
            Some(LeaderState::Prepare { ballot, .. }) if *ballot == nack.ballot
        );
        if matches {
            EXPLICIT_PREPARE_NACKED.click();
            self.slots.remove(&slot);
        }
    }

    //////////////////////////////////////// cancellation //////////////////////////////////////////

    /// A slot's state reached `stage`.  Once any slot commits, its leader sub-coroutine (if any)
    /// is destroyed: there is nothing left for it to drive, per `spec.md` §4.4.
    pub fn on_instance_state(&mut self, slot: Slot, stage: Stage) {
        if stage >= Stage::Committed && self.slots.remove(&slot).is_some() {
            LEADER_STOPPED.click();
        }
    }

    /// The acceptor reported `LeaderStop` for `slot`: another replica's ballot has superseded
    /// this one, per `spec.md` §4.3.  Destroy the local leader sub-coroutine, if any.
    pub fn leader_stop(&mut self, slot: Slot) {
        if self.slots.remove(&slot).is_some() {
            LEADER_STOPPED.click();
        }
    }

    //////////////////////////////////////// internals //////////////////////////////////////////////

    fn broadcast_pre_accept(&self, slot: Slot, ballot: Ballot, state: &InstanceState, effects: &mut LeaderEffects) {
        for &peer in &self.peers {
            effects.sends.push((
                peer,
                PacketBody::PreAcceptRequest(PreAcceptRequestBody {
                    slot,
                    ballot,
                    command: state.command.clone(),
                    seq: state.seq,
                    deps: state.deps.iter().copied().collect(),
                }),
            ));
        }
    }

    fn start_accept(
        &mut self,
        store: &mut InstanceStore,
        slot: Slot,
        ballot: Ballot,
        command: Option<Command>,
        seq: u64,
        deps: BTreeSet<Slot>,
        effects: &mut LeaderEffects,
    ) {
        let new = InstanceState {
            ballot,
            stage: Stage::Accepted,
            command: command.clone(),
            seq,
            deps: deps.clone(),
        };
        let Ok((_, upd)) = store.update(slot, new) else {
            COMMIT_ABANDONED.click();
            return;
        };
        for &peer in &self.peers {
            effects.sends.push((
                peer,
                PacketBody::AcceptRequest(AcceptRequestBody {
                    slot,
                    ballot,
                    command: upd.command.clone(),
                    seq: upd.seq,
                    deps: upd.deps.iter().copied().collect(),
                }),
            ));
        }
        if self.slow_quorum.saturating_sub(1) == 0 {
            self.try_commit(store, slot, ballot, upd.command, upd.seq, upd.deps, effects);
        } else {
            self.slots.insert(
                slot,
                LeaderState::Accept {
                    ballot,
                    command: upd.command,
                    seq: upd.seq,
                    deps: upd.deps,
                    replied: HashSet::new(),
                },
            );
        }
    }

    fn try_commit(
        &mut self,
        store: &mut InstanceStore,
        slot: Slot,
        ballot: Ballot,
        command: Option<Command>,
        seq: u64,
        deps: BTreeSet<Slot>,
        effects: &mut LeaderEffects,
    ) {
        let new = InstanceState {
            ballot,
            stage: Stage::Committed,
            command: command.clone(),
            seq,
            deps: deps.clone(),
        };
        match store.update(slot, new) {
            Ok(_) => {
                for &peer in &self.peers {
                    effects.sends.push((
                        peer,
                        PacketBody::CommitRequest(CommitRequestBody {
                            slot,
                            ballot,
                            command: command.clone(),
                            seq,
                            deps: deps.iter().copied().collect(),
                        }),
                    ));
                }
            }
            Err(_) => {
                COMMIT_ABANDONED.click();
            }
        }
        self.slots.remove(&slot);
    }

    fn start_pre_accept_non_fast(
        &mut self,
        store: &mut InstanceStore,
        slot: Slot,
        ballot: Ballot,
        command: Option<Command>,
        seq: u64,
        deps: BTreeSet<Slot>,
        effects: &mut LeaderEffects,
    ) {
        let new = InstanceState {
            ballot,
            stage: Stage::PreAccepted,
            command: command.clone(),
            seq,
            deps: deps.clone(),
        };
        let Ok((_, upd)) = store.update(slot, new) else {
            return;
        };
        self.broadcast_pre_accept(slot, ballot, &upd, effects);
        if self.fast_quorum.saturating_sub(1) == 0 {
            self.start_accept(store, slot, ballot, upd.command, upd.seq, upd.deps, effects);
        } else {
            self.slots.insert(
                slot,
                LeaderState::PreAccept {
                    ballot,
                    command: upd.command,
                    local_seq: upd.seq,
                    local_deps: upd.deps,
                    non_fast: true,
                    replied: HashMap::new(),
                },
            );
        }
    }

    /// Apply the Explicit Prepare decision table of `spec.md` §4.4 to the gathered `PrepareAck`s.
    fn decide_prepare(
        &mut self,
        store: &mut InstanceStore,
        slot: Slot,
        ballot: Ballot,
        replied: HashMap<ReplicaID, PrepareAckBody>,
        effects: &mut LeaderEffects,
    ) {
        let stage_of = |a: &PrepareAckBody| Stage::try_from(a.stage).unwrap_or(Stage::Prepared);
        let Some(max_stage) = replied.values().map(stage_of).max() else {
            return;
        };

        if max_stage == Stage::Committed {
            if let Some(a) = replied.values().find(|a| stage_of(a) == max_stage) {
                let a = a.clone();
                self.try_commit(store, slot, ballot, a.command, a.seq, a.deps.into_iter().collect(), effects);
            }
            return;
        }
        if max_stage == Stage::Accepted {
            if let Some(a) = replied.values().find(|a| stage_of(a) == max_stage) {
                let a = a.clone();
                self.start_accept(store, slot, ballot, a.command, a.seq, a.deps.into_iter().collect(), effects);
            }
            return;
        }
        if max_stage == Stage::PreAccepted {
            let pre_accepted: Vec<&PrepareAckBody> = replied
                .iter()
                .filter(|(&origin, a)| origin != slot.replica_id && stage_of(a) == Stage::PreAccepted)
                .map(|(_, a)| a)
                .collect();
            let needed = self.slow_quorum.saturating_sub(1);
            let mut best: Option<(&PrepareAckBody, usize)> = None;
            for a in &pre_accepted {
                let count = pre_accepted
                    .iter()
                    .filter(|b| b.command == a.command && b.seq == a.seq && b.deps == a.deps)
                    .count();
                if best.map(|(_, c)| count > c).unwrap_or(true) {
                    best = Some((a, count));
                }
            }
            if let Some((a, count)) = best {
                if needed > 0 && count >= needed {
                    let command = a.command.clone();
                    let seq = a.seq;
                    let deps: BTreeSet<Slot> = a.deps.iter().copied().collect();
                    let new = InstanceState {
                        ballot,
                        stage: Stage::PreAccepted,
                        command: command.clone(),
                        seq,
                        deps: deps.clone(),
                    };
                    if let Ok((_, upd)) = store.update(slot, new) {
                        self.start_accept(store, slot, ballot, upd.command, upd.seq, upd.deps, effects);
                    }
                    return;
                }
            }
            if let Some(a) = replied.values().find(|a| stage_of(a) == Stage::PreAccepted) {
                let a = a.clone();
                self.start_pre_accept_non_fast(
                    store,
                    slot,
                    ballot,
                    a.command,
                    a.seq,
                    a.deps.into_iter().collect(),
                    effects,
                );
                return;
            }
        }
        self.start_pre_accept_non_fast(store, slot, ballot, None, 0, BTreeSet::new(), effects);
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
