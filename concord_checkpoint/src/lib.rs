#![doc = include_str!("../README.md")]

//! Checkpoint scheduling and frontier rotation (`spec.md` §4.2 "Checkpoint rotation", §4.5
//! "Checkpoint effect"), supplemented per `SPEC_FULL.md` §4.8 with a count-based trigger in
//! addition to the tick-based one: several `original_source` revisions keep a rolling count of
//! instances committed since the last checkpoint, proposing a new one once that count reaches
//! `Configuration::checkpoint_each`.

use concord_exec::{CheckpointEvent, Executor};
use concord_pb::{Command, CommandID};
use concord_store::InstanceStore;

///////////////////////////////////////////// biometrics ///////////////////////////////////////////

static PROPOSED: biometrics::Counter = biometrics::Counter::new("concord_checkpoint.proposed");
static FRONTIER_ADVANCED: biometrics::Counter = biometrics::Counter::new("concord_checkpoint.frontier.advanced");

/// Register this crate's sensors with `collector`, mirroring `busyrpc::register_biometrics`.
pub fn register_biometrics(collector: &mut biometrics::Collector) {
    collector.register_counter(&PROPOSED);
    collector.register_counter(&FRONTIER_ADVANCED);
}

///////////////////////////////////////////// logging //////////////////////////////////////////////

static COLLECTOR: indicio::Collector = indicio::Collector::new();

///////////////////////////////////////////// CheckpointScheduler //////////////////////////////////

/// Decides when to propose a new `Checkpoint` command.  Triggers on whichever of two conditions
/// comes first, per `SPEC_FULL.md` §4.8:
///
/// - `checkpoint_each` newly-executed instances have accumulated since the last proposal, or
/// - `tick_interval` ticks have elapsed since the last proposal (a `0` interval disables the
///   tick-based trigger, matching a purely count-driven schedule).
#[derive(Debug)]
pub struct CheckpointScheduler {
    checkpoint_each: u64,
    tick_interval: u64,
    since_last_count: u64,
    since_last_tick: u64,
    next_n: u64,
}

impl CheckpointScheduler {
    /// Construct a scheduler that proposes a checkpoint every `checkpoint_each` newly-executed
    /// instances, or every `tick_interval` ticks, whichever comes first.
    pub fn new(checkpoint_each: u64, tick_interval: u64) -> Self {
        Self {
            checkpoint_each,
            tick_interval,
            since_last_count: 0,
            since_last_tick: 0,
            next_n: 0,
        }
    }

    /// Record that `newly_executed` more instances were just applied to the state machine.
    /// Returns a `Checkpoint` command to propose if the count threshold was crossed.
    pub fn on_executed(&mut self, newly_executed: usize) -> Option<Command> {
        self.since_last_count += newly_executed as u64;
        if self.checkpoint_each > 0 && self.since_last_count >= self.checkpoint_each {
            Some(self.propose())
        } else {
            None
        }
    }

    /// Record that one timer tick elapsed.  Returns a `Checkpoint` command to propose if the
    /// tick threshold was crossed.
    pub fn on_tick(&mut self) -> Option<Command> {
        if self.tick_interval == 0 {
            return None;
        }
        self.since_last_tick += 1;
        if self.since_last_tick >= self.tick_interval {
            Some(self.propose())
        } else {
            None
        }
    }

    fn propose(&mut self) -> Command {
        PROPOSED.click();
        self.since_last_count = 0;
        self.since_last_tick = 0;
        let n = self.next_n;
        self.next_n += 1;
        indicio::clue!(COLLECTOR, indicio::INFO, {
            event: "checkpoint.proposed",
            n: n,
        });
        Command::checkpoint(
            CommandID::generate().expect("the OS RNG is available to generate a command id"),
            n,
        )
    }
}

///////////////////////////////////////////// frontier rotation /////////////////////////////////////

/// Apply an executed `Checkpoint` command's effect: rotate the store's truncation frontier and
/// drop the executor's bookkeeping for everything it summarizes, per `spec.md` §4.2/§4.5.
///
/// `InstanceStore::advance_checkpoint` rotates two generations (the frontier passed last time
/// becomes the retiring one, purged now; the frontier passed this time becomes the new
/// not-yet-retired one), so purging always lags one checkpoint cycle behind proposal — a
/// deliberate safety margin, not a bug: it guarantees every slot a checkpoint's frontier names was
/// already visible to every replica's executor before it is ever purged.
pub fn apply_checkpoint_event(store: &mut InstanceStore, executor: &mut Executor, event: &CheckpointEvent) {
    FRONTIER_ADVANCED.click();
    store.advance_checkpoint(event.frontier.clone());
    executor.purge_below(&event.frontier);
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use concord_pb::{Ballot, ReplicaID, Slot};
    use std::collections::HashMap;

    #[test]
    fn count_trigger_fires_once_threshold_reached() {
        let mut sched = CheckpointScheduler::new(5, 0);
        assert!(sched.on_executed(3).is_none());
        assert!(sched.on_executed(1).is_none());
        let cmd = sched.on_executed(1).unwrap();
        assert!(cmd.is_checkpoint());
    }

    #[test]
    fn count_trigger_resets_after_firing() {
        let mut sched = CheckpointScheduler::new(2, 0);
        assert!(sched.on_executed(2).is_some());
        assert!(sched.on_executed(1).is_none());
        assert!(sched.on_executed(1).is_some());
    }

    #[test]
    fn tick_trigger_fires_on_interval() {
        let mut sched = CheckpointScheduler::new(0, 3);
        assert!(sched.on_tick().is_none());
        assert!(sched.on_tick().is_none());
        assert!(sched.on_tick().is_some());
    }

    #[test]
    fn zero_tick_interval_disables_the_tick_trigger() {
        let mut sched = CheckpointScheduler::new(0, 0);
        for _ in 0..100 {
            assert!(sched.on_tick().is_none());
        }
    }

    #[test]
    fn sequence_numbers_increase_monotonically() {
        let mut sched = CheckpointScheduler::new(1, 0);
        let a = sched.on_executed(1).unwrap();
        let b = sched.on_executed(1).unwrap();
        let n = |cmd: &Command| match &cmd.payload {
            concord_pb::Payload::Checkpoint(body) => body.n,
            _ => unreachable!(),
        };
        assert!(n(&b) > n(&a));
    }

    #[test]
    fn apply_checkpoint_event_rotates_the_store_and_executor() {
        let replica = ReplicaID::new(1);
        let mut store = InstanceStore::new(replica, 0);
        let mut executor = Executor::new();

        let slot = Slot::new(replica, 0);
        let ballot = Ballot::initial(0, replica);
        let mut state = concord_store::InstanceState::prepared(ballot);
        state.stage = concord_pb::Stage::Committed;
        store.update(slot, state).unwrap();
        executor.on_committed(slot, 0, Default::default(), None);

        let mut frontier = HashMap::new();
        frontier.insert(replica, 1);
        let event = CheckpointEvent {
            slot: Slot::new(replica, 1),
            frontier: frontier.clone(),
        };
        apply_checkpoint_event(&mut store, &mut executor, &event);
        // first rotation only seeds cp_mid; nothing purges yet.
        assert!(store.load(slot).is_ok());

        apply_checkpoint_event(&mut store, &mut executor, &event);
        assert!(matches!(store.load(slot), Err(concord_pb::Error::SlotTooOld { .. })));
    }
}
