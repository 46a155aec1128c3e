#![doc = include_str!("../README.md")]

//! The dependency cache (`spec.md` §4.1): a per-key "last writer" map yielding the sequence
//! number and dependency set a replica would assign a command on the fast path.

use std::collections::HashMap;

use concord_pb::{Command, Key, Payload, Slot};

///////////////////////////////////////////// biometrics ///////////////////////////////////////////

static MUTATOR_EXCHANGE: biometrics::Counter = biometrics::Counter::new("concord_depcache.exchange.mutator");
static CHECKPOINT_EXCHANGE: biometrics::Counter = biometrics::Counter::new("concord_depcache.exchange.checkpoint");

/// Register this crate's sensors with `collector`, mirroring `busyrpc::register_biometrics`.
pub fn register_biometrics(collector: &mut biometrics::Collector) {
    collector.register_counter(&MUTATOR_EXCHANGE);
    collector.register_counter(&CHECKPOINT_EXCHANGE);
}

///////////////////////////////////////// DependencyCache ///////////////////////////////////////////

/// Per-replica, per-key "last writer" map, plus a single checkpoint snapshot standing in for
/// `spec.md` §4.1's "single `(slot, seq, deps)` snapshot plus reset flag": `None` doubles as "no
/// checkpoint has passed through this cache yet".
#[derive(Clone, Debug, Default)]
pub struct DependencyCache {
    last: HashMap<Key, (Slot, u64)>,
    checkpoint: Option<CheckpointSnapshot>,
}

#[derive(Clone, Copy, Debug)]
struct CheckpointSnapshot {
    slot: Slot,
    seq: u64,
}

impl DependencyCache {
    /// Construct an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the cache with `command` at `slot`, returning the `(seq, deps)` this replica would
    /// assign on the fast path.  `deps` is sorted and deduplicated.
    pub fn exchange(&mut self, slot: Slot, command: &Command) -> (u64, Vec<Slot>) {
        match &command.payload {
            Payload::Mutator(body) => self.exchange_mutator(slot, &body.keys),
            Payload::Checkpoint(_) => self.exchange_checkpoint(slot),
        }
    }

    fn exchange_mutator(&mut self, slot: Slot, keys: &[Key]) -> (u64, Vec<Slot>) {
        MUTATOR_EXCHANGE.click();
        let mut deps: Vec<Slot> = Vec::new();
        let mut max_seq: u64 = 0;
        for key in keys {
            if let Some(&(entry_slot, entry_seq)) = self.last.get(key) {
                if entry_slot != slot && entry_slot < slot {
                    deps.push(entry_slot);
                    max_seq = max_seq.max(entry_seq);
                }
            }
        }
        if let Some(cp) = self.checkpoint {
            deps.push(cp.slot);
            max_seq = max_seq.max(cp.seq);
        }
        deps.sort();
        deps.dedup();
        let seq = 1 + max_seq;
        for key in keys {
            let overwrite = match self.last.get(key) {
                Some(&(entry_slot, _)) => entry_slot < slot,
                None => true,
            };
            if overwrite {
                self.last.insert(key.clone(), (slot, seq));
            }
        }
        (seq, deps)
    }

    fn exchange_checkpoint(&mut self, slot: Slot) -> (u64, Vec<Slot>) {
        CHECKPOINT_EXCHANGE.click();
        let mut by_replica: HashMap<concord_pb::ReplicaID, Slot> = HashMap::new();
        let mut max_seq: u64 = 0;
        for &(entry_slot, entry_seq) in self.last.values() {
            max_seq = max_seq.max(entry_seq);
            by_replica
                .entry(entry_slot.replica_id)
                .and_modify(|s| {
                    if entry_slot > *s {
                        *s = entry_slot;
                    }
                })
                .or_insert(entry_slot);
        }
        if let Some(cp) = self.checkpoint {
            max_seq = max_seq.max(cp.seq);
            by_replica
                .entry(cp.slot.replica_id)
                .and_modify(|s| {
                    if cp.slot > *s {
                        *s = cp.slot;
                    }
                })
                .or_insert(cp.slot);
        }
        let mut deps: Vec<Slot> = by_replica.into_values().collect();
        deps.sort();
        let seq = 1 + max_seq;
        self.checkpoint = Some(CheckpointSnapshot { slot, seq });
        self.last.clear();
        (seq, deps)
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use concord_pb::{CommandID, ReplicaID};

    fn replica(id: u32) -> ReplicaID {
        ReplicaID::new(id)
    }

    fn mutator(op: &str, keys: &[&str]) -> Command {
        Command::mutator(
            CommandID::generate().unwrap(),
            op,
            keys.iter().map(|k| Key::from(*k)).collect(),
        )
    }

    #[test]
    fn first_writer_has_no_deps() {
        let mut cache = DependencyCache::new();
        let slot = Slot::new(replica(1), 0);
        let (seq, deps) = cache.exchange(slot, &mutator("SET", &["a"]));
        assert_eq!(seq, 1);
        assert!(deps.is_empty());
    }

    #[test]
    fn second_writer_observes_first_as_dependency() {
        let mut cache = DependencyCache::new();
        let s1 = Slot::new(replica(1), 0);
        let s2 = Slot::new(replica(2), 0);
        cache.exchange(s1, &mutator("SET", &["a"]));
        let (seq, deps) = cache.exchange(s2, &mutator("SET", &["a"]));
        assert_eq!(seq, 2);
        assert_eq!(deps, vec![s1]);
    }

    #[test]
    fn non_interfering_keys_do_not_depend() {
        let mut cache = DependencyCache::new();
        let s1 = Slot::new(replica(1), 0);
        let s2 = Slot::new(replica(2), 0);
        cache.exchange(s1, &mutator("SET", &["a"]));
        let (seq, deps) = cache.exchange(s2, &mutator("SET", &["b"]));
        assert_eq!(seq, 1);
        assert!(deps.is_empty());
    }

    #[test]
    fn same_slot_does_not_self_depend() {
        let mut cache = DependencyCache::new();
        let slot = Slot::new(replica(1), 0);
        let cmd = mutator("SET", &["a"]);
        let (seq1, _) = cache.exchange(slot, &cmd);
        let (seq2, deps2) = cache.exchange(slot, &cmd);
        assert_eq!(seq1, seq2);
        assert!(deps2.is_empty());
    }

    #[test]
    fn checkpoint_collapses_to_one_slot_per_replica() {
        let mut cache = DependencyCache::new();
        cache.exchange(Slot::new(replica(1), 0), &mutator("SET", &["a"]));
        cache.exchange(Slot::new(replica(1), 1), &mutator("SET", &["b"]));
        cache.exchange(Slot::new(replica(2), 0), &mutator("SET", &["c"]));
        let (seq, deps) =
            cache.exchange(Slot::new(replica(3), 0), &Command::checkpoint(CommandID::generate().unwrap(), 1));
        assert_eq!(seq, 2);
        assert_eq!(deps, vec![Slot::new(replica(1), 1), Slot::new(replica(2), 0)]);
        // the per-key map was cleared
        let (seq2, deps2) = cache.exchange(Slot::new(replica(4), 0), &mutator("SET", &["a"]));
        assert_eq!(seq2, 3);
        assert_eq!(deps2, vec![Slot::new(replica(3), 0)]);
    }
}
