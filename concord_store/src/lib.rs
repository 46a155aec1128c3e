#![doc = include_str!("../README.md")]

//! The authoritative per-slot instance store (`spec.md` §4.2): applies the transition rules that
//! guard ballot/stage/command safety, folds in the dependency cache on the fast path, maintains the
//! command-id index for client deduplication, and rotates the checkpoint frontier.

use std::collections::{BTreeSet, HashMap};

use concord_depcache::DependencyCache;
use concord_pb::{Ballot, Command, CommandID, Error, ReplicaID, Slot, Stage};

///////////////////////////////////////////// logging //////////////////////////////////////////////

static COLLECTOR: indicio::Collector = indicio::Collector::new();

///////////////////////////////////////////// biometrics ///////////////////////////////////////////

static LOAD: biometrics::Counter = biometrics::Counter::new("concord_store.load");
static UPDATE_OK: biometrics::Counter = biometrics::Counter::new("concord_store.update.ok");
static UPDATE_BALLOT_REJECTED: biometrics::Counter =
    biometrics::Counter::new("concord_store.update.ballot_rejected");
static UPDATE_STAGE_REJECTED: biometrics::Counter =
    biometrics::Counter::new("concord_store.update.stage_rejected");
static UPDATE_COMMAND_REJECTED: biometrics::Counter =
    biometrics::Counter::new("concord_store.update.command_rejected");
static CHECKPOINT_ADVANCE: biometrics::Counter = biometrics::Counter::new("concord_store.checkpoint.advance");
static CHECKPOINT_PURGE: biometrics::Counter = biometrics::Counter::new("concord_store.checkpoint.purge");

/// Register this crate's sensors with `collector`, plus [concord_depcache]'s (the store is its
/// only caller), per the pack's `register_biometrics` convention (see
/// `busyrpc::register_biometrics`, which aggregates `client`/`channel`/`server`/`poll` the same
/// way).
pub fn register_biometrics(collector: &mut biometrics::Collector) {
    collector.register_counter(&LOAD);
    collector.register_counter(&UPDATE_OK);
    collector.register_counter(&UPDATE_BALLOT_REJECTED);
    collector.register_counter(&UPDATE_STAGE_REJECTED);
    collector.register_counter(&UPDATE_COMMAND_REJECTED);
    collector.register_counter(&CHECKPOINT_ADVANCE);
    collector.register_counter(&CHECKPOINT_PURGE);
    concord_depcache::register_biometrics(collector);
}

///////////////////////////////////////////// InstanceState ////////////////////////////////////////

/// The full state of one slot, per `spec.md` §3/§4.2.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InstanceState {
    pub ballot: Ballot,
    pub stage: Stage,
    pub command: Option<Command>,
    pub seq: u64,
    pub deps: BTreeSet<Slot>,
}

impl InstanceState {
    /// A freshly-prepared instance, never before touched, at `ballot`.
    pub fn prepared(ballot: Ballot) -> Self {
        Self {
            ballot,
            stage: Stage::Prepared,
            command: None,
            seq: 0,
            deps: BTreeSet::new(),
        }
    }
}

///////////////////////////////////////////// InstanceStore ////////////////////////////////////////

/// The per-replica store of every in-flight and recently-committed instance, keyed by [Slot].
#[derive(Debug)]
pub struct InstanceStore {
    replica_id: ReplicaID,
    epoch: u32,
    instances: HashMap<Slot, InstanceState>,
    command_index: HashMap<CommandID, Slot>,
    depcache: DependencyCache,
    /// The retiring checkpoint frontier: slots strictly below `cp_old[r]` for replica `r` have
    /// been purged.
    cp_old: HashMap<ReplicaID, u64>,
    /// The frontier most recently proposed by `advance_checkpoint`, not yet retired.
    cp_mid: HashMap<ReplicaID, u64>,
}

impl InstanceStore {
    /// Construct an empty store for `replica_id` starting in `epoch`.
    pub fn new(replica_id: ReplicaID, epoch: u32) -> Self {
        Self {
            replica_id,
            epoch,
            instances: HashMap::new(),
            command_index: HashMap::new(),
            depcache: DependencyCache::new(),
            cp_old: HashMap::new(),
            cp_mid: HashMap::new(),
        }
    }

    /// Load `slot`'s current state.  `exists` is `false` when the slot has never been touched; the
    /// returned state is then a synthetic `Prepared` instance at the slot's initial ballot, per
    /// `spec.md` §4.2.  Fails [Error::SlotTooOld] if `slot` is below the retired checkpoint
    /// frontier.
    pub fn load(&self, slot: Slot) -> Result<(bool, InstanceState), Error> {
        LOAD.click();
        if self.below_frontier(slot, &self.cp_old) {
            return Err(Error::slot_too_old(slot));
        }
        match self.instances.get(&slot) {
            Some(state) => Ok((true, state.clone())),
            None => Ok((
                false,
                InstanceState::prepared(Ballot::initial(self.epoch, slot.replica_id)),
            )),
        }
    }

    /// Find the slot currently holding `cid`, if any.
    pub fn load_by_command_id(&self, cid: CommandID) -> Option<(Slot, InstanceState)> {
        let slot = *self.command_index.get(&cid)?;
        let state = self.instances.get(&slot)?.clone();
        Some((slot, state))
    }

    /// Apply a proposed new state to `slot`, per the transition rules of `spec.md` §4.2.  Returns
    /// `(old, upd)`: the state before the update and the state actually stored (which may carry a
    /// merged `seq`/`deps` on the fast path, so `upd` can differ from the caller's `new`).
    pub fn update(&mut self, slot: Slot, mut new: InstanceState) -> Result<(InstanceState, InstanceState), Error> {
        if self.below_frontier(slot, &self.cp_old) {
            return Err(Error::slot_too_old(slot));
        }
        let old = match self.instances.get(&slot) {
            Some(state) => state.clone(),
            None => InstanceState::prepared(Ballot::initial(self.epoch, slot.replica_id)),
        };

        if new.ballot < old.ballot {
            UPDATE_BALLOT_REJECTED.click();
            indicio::clue!(COLLECTOR, indicio::WARNING, {
                event: "update.ballot_rejected",
                slot: slot.to_string(),
                old_ballot: old.ballot.counter,
                new_ballot: new.ballot.counter,
            });
            return Err(Error::incorrect_ballot(old.ballot));
        }
        if new.stage < old.stage {
            UPDATE_STAGE_REJECTED.click();
            indicio::clue!(COLLECTOR, indicio::WARNING, {
                event: "update.stage_rejected",
                slot: slot.to_string(),
                old_stage: u32::from(old.stage),
                new_stage: u32::from(new.stage),
            });
            return Err(Error::incorrect_stage(old.stage));
        }
        if new.command.is_none() {
            new.command = old.command.clone();
        }
        if old.stage > Stage::PreAccepted && old.command.is_some() && new.command != old.command {
            UPDATE_COMMAND_REJECTED.click();
            indicio::clue!(COLLECTOR, indicio::ERROR, {
                event: "update.command_rejected",
                slot: slot.to_string(),
            });
            return Err(Error::incorrect_command());
        }
        if new.stage == Stage::PreAccepted {
            if let Some(cmd) = new.command.clone() {
                let (exchange_seq, exchange_deps) = self.depcache.exchange(slot, &cmd);
                new.seq = new.seq.max(exchange_seq);
                new.deps.extend(exchange_deps);
            }
        }

        if let Some(new_cmd) = &new.command {
            if old.command.as_ref().map(|c| c.id) != Some(new_cmd.id) {
                if let Some(old_cmd) = &old.command {
                    if self.command_index.get(&old_cmd.id) == Some(&slot) {
                        self.command_index.remove(&old_cmd.id);
                    }
                }
                self.command_index.insert(new_cmd.id, slot);
            }
        }

        UPDATE_OK.click();
        self.instances.insert(slot, new.clone());
        Ok((old, new))
    }

    /// Rotate the three-tier checkpoint window: the current `cp_mid` becomes `cp_old` (and is
    /// therefore enforced), and `frontier` becomes the new `cp_mid`.  Every slot strictly below the
    /// retiring `cp_old[replica]` is purged from every in-memory map.  Fatal (panics) if a slot
    /// being purged is not yet `Committed` or later: execution would otherwise be inconsistent, per
    /// `spec.md` §4.2.
    pub fn advance_checkpoint(&mut self, frontier: HashMap<ReplicaID, u64>) {
        CHECKPOINT_ADVANCE.click();
        let retiring = std::mem::replace(&mut self.cp_mid, frontier);
        self.cp_old = retiring;

        let mut purge_slots: Vec<Slot> = Vec::new();
        for (&slot, state) in self.instances.iter() {
            if self.below_frontier(slot, &self.cp_old) {
                assert!(
                    state.stage >= Stage::Committed,
                    "checkpoint purge of {slot} while stage is {:?}, below Committed: execution would be inconsistent",
                    state.stage,
                );
                purge_slots.push(slot);
            }
        }
        for slot in &purge_slots {
            if let Some(state) = self.instances.remove(slot) {
                if let Some(cmd) = &state.command {
                    if self.command_index.get(&cmd.id) == Some(slot) {
                        self.command_index.remove(&cmd.id);
                    }
                }
                CHECKPOINT_PURGE.click();
            }
        }
    }

    fn below_frontier(&self, slot: Slot, frontier: &HashMap<ReplicaID, u64>) -> bool {
        match frontier.get(&slot.replica_id) {
            Some(&bound) => slot.instance_id < bound,
            None => false,
        }
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use concord_pb::Key;

    fn replica(id: u32) -> ReplicaID {
        ReplicaID::new(id)
    }

    fn mutator(keys: &[&str]) -> Command {
        Command::mutator(
            CommandID::generate().unwrap(),
            "SET",
            keys.iter().map(|k| Key::from(*k)).collect(),
        )
    }

    #[test]
    fn load_of_untouched_slot_is_synthetic_prepared() {
        let store = InstanceStore::new(replica(1), 0);
        let slot = Slot::new(replica(1), 0);
        let (exists, state) = store.load(slot).unwrap();
        assert!(!exists);
        assert_eq!(state.stage, Stage::Prepared);
        assert_eq!(state.ballot, Ballot::initial(0, replica(1)));
    }

    #[test]
    fn update_with_lower_ballot_is_rejected() {
        let mut store = InstanceStore::new(replica(1), 0);
        let slot = Slot::new(replica(1), 0);
        let ballot = Ballot::initial(0, replica(1));
        let mut first = InstanceState::prepared(ballot.next(replica(1)));
        first.stage = Stage::PreAccepted;
        first.command = Some(mutator(&["a"]));
        store.update(slot, first).unwrap();

        let mut stale = InstanceState::prepared(ballot);
        stale.stage = Stage::PreAccepted;
        stale.command = Some(mutator(&["a"]));
        let err = store.update(slot, stale).unwrap_err();
        assert!(matches!(err, Error::IncorrectBallot { .. }));
    }

    #[test]
    fn update_regressing_stage_is_rejected() {
        let mut store = InstanceStore::new(replica(1), 0);
        let slot = Slot::new(replica(1), 0);
        let ballot = Ballot::initial(0, replica(1));
        let mut accepted = InstanceState::prepared(ballot);
        accepted.stage = Stage::Accepted;
        accepted.command = Some(mutator(&["a"]));
        store.update(slot, accepted).unwrap();

        let mut regressed = InstanceState::prepared(ballot);
        regressed.stage = Stage::PreAccepted;
        regressed.command = Some(mutator(&["a"]));
        let err = store.update(slot, regressed).unwrap_err();
        assert!(matches!(err, Error::IncorrectStage { .. }));
    }

    #[test]
    fn changing_a_committed_command_is_rejected() {
        let mut store = InstanceStore::new(replica(1), 0);
        let slot = Slot::new(replica(1), 0);
        let ballot = Ballot::initial(0, replica(1));
        let cmd = mutator(&["a"]);
        let mut committed = InstanceState::prepared(ballot);
        committed.stage = Stage::Committed;
        committed.command = Some(cmd);
        store.update(slot, committed).unwrap();

        let mut different = InstanceState::prepared(ballot);
        different.stage = Stage::Committed;
        different.command = Some(mutator(&["b"]));
        let err = store.update(slot, different).unwrap_err();
        assert!(matches!(err, Error::IncorrectCommand { .. }));
    }

    #[test]
    fn preaccept_update_folds_in_dependency_cache() {
        let mut store = InstanceStore::new(replica(1), 0);
        let s1 = Slot::new(replica(1), 0);
        let s2 = Slot::new(replica(2), 0);
        let ballot1 = Ballot::initial(0, replica(1));
        let ballot2 = Ballot::initial(0, replica(2));

        let mut first = InstanceState::prepared(ballot1);
        first.stage = Stage::PreAccepted;
        first.command = Some(mutator(&["a"]));
        let (_, upd1) = store.update(s1, first).unwrap();
        assert_eq!(upd1.seq, 1);
        assert!(upd1.deps.is_empty());

        let mut second = InstanceState::prepared(ballot2);
        second.stage = Stage::PreAccepted;
        second.command = Some(mutator(&["a"]));
        let (_, upd2) = store.update(s2, second).unwrap();
        assert_eq!(upd2.seq, 2);
        assert_eq!(upd2.deps, BTreeSet::from([s1]));
    }

    #[test]
    fn command_index_tracks_the_current_slot() {
        let mut store = InstanceStore::new(replica(1), 0);
        let slot = Slot::new(replica(1), 0);
        let ballot = Ballot::initial(0, replica(1));
        let cmd = mutator(&["a"]);
        let cid = cmd.id;
        let mut state = InstanceState::prepared(ballot);
        state.stage = Stage::PreAccepted;
        state.command = Some(cmd);
        store.update(slot, state).unwrap();

        let (found_slot, found_state) = store.load_by_command_id(cid).unwrap();
        assert_eq!(found_slot, slot);
        assert_eq!(found_state.command.unwrap().id, cid);
    }

    #[test]
    fn update_rejects_slots_below_the_retired_frontier() {
        let mut store = InstanceStore::new(replica(1), 0);
        store.advance_checkpoint(HashMap::from([(replica(1), 5)]));
        store.advance_checkpoint(HashMap::from([(replica(1), 10)]));

        let slot = Slot::new(replica(1), 2);
        let err = store.load(slot).unwrap_err();
        assert!(matches!(err, Error::SlotTooOld { .. }));
    }

    #[test]
    fn advance_checkpoint_purges_committed_slots_below_the_retiring_frontier() {
        let mut store = InstanceStore::new(replica(1), 0);
        let slot = Slot::new(replica(1), 0);
        let ballot = Ballot::initial(0, replica(1));
        let mut committed = InstanceState::prepared(ballot);
        committed.stage = Stage::Committed;
        let cmd = mutator(&["a"]);
        let cid = cmd.id;
        committed.command = Some(cmd);
        store.update(slot, committed).unwrap();

        store.advance_checkpoint(HashMap::from([(replica(1), 1)]));
        assert!(store.instances.get(&slot).is_some());
        store.advance_checkpoint(HashMap::from([(replica(1), 1)]));
        assert!(store.instances.get(&slot).is_none());
        assert!(store.load_by_command_id(cid).is_none());
    }

    #[test]
    #[should_panic(expected = "execution would be inconsistent")]
    fn advance_checkpoint_panics_on_uncommitted_slot_below_frontier() {
        let mut store = InstanceStore::new(replica(1), 0);
        let slot = Slot::new(replica(1), 0);
        let ballot = Ballot::initial(0, replica(1));
        let mut preaccepted = InstanceState::prepared(ballot);
        preaccepted.stage = Stage::PreAccepted;
        preaccepted.command = Some(mutator(&["a"]));
        store.update(slot, preaccepted).unwrap();

        store.advance_checkpoint(HashMap::from([(replica(1), 1)]));
        store.advance_checkpoint(HashMap::from([(replica(1), 1)]));
    }
}
