#![doc = include_str!("../README.md")]

//! The executor (`spec.md` §4.5): consumes committed instances, clusters them by shared
//! dependencies until a cluster's external dependencies are fully resolved, then emits the
//! strongly-connected region in deterministic `(seq, slot)` order.

use std::collections::{BTreeSet, HashMap, HashSet};

use concord_pb::{Command, ReplicaID, Slot};

///////////////////////////////////////////// biometrics ///////////////////////////////////////////

static INSERT: biometrics::Counter = biometrics::Counter::new("concord_exec.insert");
static CLUSTERS_MERGED: biometrics::Counter = biometrics::Counter::new("concord_exec.clusters_merged");
static CLUSTER_READY: biometrics::Counter = biometrics::Counter::new("concord_exec.cluster_ready");
static ITEM_EXECUTED: biometrics::Counter = biometrics::Counter::new("concord_exec.item_executed");

/// Register this crate's sensors with `collector`, mirroring `busyrpc::register_biometrics`.
pub fn register_biometrics(collector: &mut biometrics::Collector) {
    collector.register_counter(&INSERT);
    collector.register_counter(&CLUSTERS_MERGED);
    collector.register_counter(&CLUSTER_READY);
    collector.register_counter(&ITEM_EXECUTED);
}

///////////////////////////////////////////// logging //////////////////////////////////////////////

static COLLECTOR: indicio::Collector = indicio::Collector::new();

////////////////////////////////////////////// Cluster /////////////////////////////////////////////

/// A partial strongly-connected sub-graph of the dependency DAG, per `spec.md` §4.5: `ins` are
/// dependencies still needed from outside the cluster, `outs` are committed slots inside the
/// cluster some other pending slot depends on, `items` are slots fully internal to the cluster.
#[derive(Clone, Debug, Default)]
struct Cluster {
    ins: BTreeSet<Slot>,
    outs: BTreeSet<Slot>,
    items: BTreeSet<Slot>,
}

impl Cluster {
    fn singleton(slot: Slot, deps: BTreeSet<Slot>) -> Self {
        Self {
            ins: deps,
            outs: BTreeSet::from([slot]),
            items: BTreeSet::new(),
        }
    }

    fn overlaps(&self, other: &Cluster) -> bool {
        self.ins.iter().any(|s| other.contains(s))
            || self.outs.iter().any(|s| other.contains(s))
            || self.items.iter().any(|s| other.contains(s))
    }

    fn contains(&self, slot: &Slot) -> bool {
        self.ins.contains(slot) || self.outs.contains(slot) || self.items.contains(slot)
    }

    /// Merge `other` into `self`, per `spec.md` §4.5's three-set recomputation.
    fn merge(self, other: Cluster) -> Cluster {
        let ins_u: BTreeSet<Slot> = self.ins.union(&other.ins).cloned().collect();
        let outs_u: BTreeSet<Slot> = self.outs.union(&other.outs).cloned().collect();
        let overlap: BTreeSet<Slot> = ins_u.intersection(&outs_u).cloned().collect();
        let items_u: BTreeSet<Slot> = self
            .items
            .union(&other.items)
            .cloned()
            .chain(overlap.iter().cloned())
            .collect();
        let mut ins: BTreeSet<Slot> = ins_u.difference(&outs_u).cloned().collect();
        let mut outs: BTreeSet<Slot> = outs_u.difference(&ins_u).cloned().collect();
        for slot in &items_u {
            ins.remove(slot);
            outs.remove(slot);
        }
        Cluster {
            ins,
            outs,
            items: items_u,
        }
    }

    fn is_ready(&self) -> bool {
        self.ins.is_empty()
    }

    /// Every slot this cluster will emit on execution, once ready.
    fn members(&self) -> BTreeSet<Slot> {
        self.outs.union(&self.items).cloned().collect()
    }
}

///////////////////////////////////////////// CommittedInfo ////////////////////////////////////////

#[derive(Clone, Debug)]
struct CommittedInfo {
    seq: u64,
    deps: BTreeSet<Slot>,
    command: Option<Command>,
}

///////////////////////////////////////////// ExecutedItem /////////////////////////////////////////

/// One slot emitted by the executor, in the order it should be applied to the state machine.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExecutedItem {
    pub slot: Slot,
    pub seq: u64,
    pub command: Option<Command>,
}

/// The frontier at which a just-executed `Checkpoint` command allows truncation, per `spec.md`
/// §4.5: `frontier[r] := max dep.slot with dep.replica_id == r`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CheckpointEvent {
    pub slot: Slot,
    pub frontier: HashMap<ReplicaID, u64>,
}

/// What `Executor::on_committed` produced: zero or more newly-executed items in application order,
/// plus a checkpoint event for every executed `Checkpoint` command among them.
#[derive(Clone, Debug, Default)]
pub struct ExecutionEffects {
    pub executed: Vec<ExecutedItem>,
    pub checkpoints: Vec<CheckpointEvent>,
}

///////////////////////////////////////////////// Executor /////////////////////////////////////////

/// Builds strongly-connected components of the committed dependency graph and emits commands in
/// deterministic order, per `spec.md` §4.5.
#[derive(Debug, Default)]
pub struct Executor {
    clusters: Vec<Cluster>,
    /// Committed `(seq, deps, command)` for every slot referenced by a pending cluster, keyed by
    /// slot; removed once the slot executes.
    pending_info: HashMap<Slot, CommittedInfo>,
    executed: HashSet<Slot>,
    pending_ids: HashMap<ReplicaID, BTreeSet<u64>>,
    executed_cut: HashMap<ReplicaID, u64>,
}

impl Executor {
    /// Construct an empty executor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-replica highest contiguously-executed instance id, per `spec.md` §8 invariant 5.
    pub fn executed_cut(&self) -> &HashMap<ReplicaID, u64> {
        &self.executed_cut
    }

    /// True iff `slot` has already been applied to the state machine.  `executed` only holds
    /// slots at or above `executed_cut[replica]` (`record_executed` prunes everything below, per
    /// `spec.md` §8 invariant 5's "contiguous prefix"), so a slot below the cut is also executed
    /// even though it no longer appears there.
    pub fn is_executed(&self, slot: Slot) -> bool {
        self.executed.contains(&slot)
            || matches!(self.executed_cut.get(&slot.replica_id), Some(&cut) if slot.instance_id < cut)
    }

    /// Feed a newly-committed instance into the executor.  `deps` and `seq` are the instance's
    /// final, immutable committed values.  Returns every slot that becomes executable as a result,
    /// in application order, plus any checkpoint events among them.
    pub fn on_committed(
        &mut self,
        slot: Slot,
        seq: u64,
        deps: BTreeSet<Slot>,
        command: Option<Command>,
    ) -> ExecutionEffects {
        INSERT.click();
        if self.is_executed(slot) {
            return ExecutionEffects::default();
        }

        let effective_deps: BTreeSet<Slot> = deps
            .iter()
            .filter(|d| !self.is_executed(**d))
            .cloned()
            .collect();

        let mut info = HashMap::new();
        info.insert(
            slot,
            CommittedInfo {
                seq,
                deps,
                command,
            },
        );
        // slots already in stored clusters carry their own CommittedInfo recorded at their own
        // insertion time; we thread a fresh map in and merge it below rather than keep a
        // permanent side table, bounding memory to "currently pending" slots only.
        let mut new = Cluster::singleton(slot, effective_deps);

        loop {
            let mut merged_any = false;
            let mut i = 0;
            while i < self.clusters.len() {
                if self.clusters[i].overlaps(&new) {
                    let other = self.clusters.remove(i);
                    new = new.merge(other);
                    merged_any = true;
                    CLUSTERS_MERGED.click();
                } else {
                    i += 1;
                }
            }
            if !merged_any {
                break;
            }
        }

        if new.is_ready() {
            CLUSTER_READY.click();
            self.execute_cluster(new, info)
        } else {
            self.pending_info.extend(info);
            self.clusters.push(new);
            ExecutionEffects::default()
        }
    }

    fn execute_cluster(&mut self, cluster: Cluster, mut fresh_info: HashMap<Slot, CommittedInfo>) -> ExecutionEffects {
        let members = cluster.members();
        let mut rows: Vec<(u64, Slot, Option<Command>, BTreeSet<Slot>)> = Vec::with_capacity(members.len());
        for slot in &members {
            let info = fresh_info
                .remove(slot)
                .or_else(|| self.pending_info.remove(slot))
                .expect("every cluster member was recorded via on_committed before becoming ready");
            rows.push((info.seq, *slot, info.command, info.deps));
        }
        rows.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        let mut effects = ExecutionEffects::default();
        for (seq, slot, command, deps) in rows {
            self.record_executed(slot);
            ITEM_EXECUTED.click();
            indicio::clue!(COLLECTOR, indicio::INFO, {
                event: "execute",
                slot: slot.to_string(),
                seq: seq,
            });
            if let Some(cmd) = &command {
                if cmd.is_checkpoint() {
                    effects.checkpoints.push(CheckpointEvent {
                        slot,
                        frontier: checkpoint_frontier(&deps),
                    });
                }
            }
            effects.executed.push(ExecutedItem { slot, seq, command });
        }
        effects
    }

    fn record_executed(&mut self, slot: Slot) {
        self.executed.insert(slot);
        let pending = self.pending_ids.entry(slot.replica_id).or_default();
        pending.insert(slot.instance_id);
        let cut = self.executed_cut.entry(slot.replica_id).or_insert(0);
        while pending.remove(cut) {
            *cut += 1;
        }
        // entries at or above `cut` but not contiguous remain in `pending_ids`/`executed` as gaps;
        // everything strictly below `cut` is summarized by `executed_cut` and can be forgotten.
        self.executed
            .retain(|s| s.replica_id != slot.replica_id || s.instance_id >= *cut);
    }

    /// Drop any bookkeeping for slots strictly below `frontier`, per the checkpoint rotation every
    /// actor (store, acceptor, leader, executor) performs on a `CheckpointEvent`.
    pub fn purge_below(&mut self, frontier: &HashMap<ReplicaID, u64>) {
        self.executed.retain(|slot| match frontier.get(&slot.replica_id) {
            Some(&bound) => slot.instance_id >= bound,
            None => true,
        });
    }
}

fn checkpoint_frontier(deps: &BTreeSet<Slot>) -> HashMap<ReplicaID, u64> {
    let mut frontier: HashMap<ReplicaID, u64> = HashMap::new();
    for dep in deps {
        frontier
            .entry(dep.replica_id)
            .and_modify(|v| *v = (*v).max(dep.instance_id))
            .or_insert(dep.instance_id);
    }
    frontier
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use concord_pb::{CommandID, Key};

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
    fn instance_with_no_deps_executes_immediately() {
        let mut exec = Executor::new();
        let slot = Slot::new(replica(1), 0);
        let effects = exec.on_committed(slot, 1, BTreeSet::new(), Some(mutator(&["a"])));
        assert_eq!(effects.executed.len(), 1);
        assert_eq!(effects.executed[0].slot, slot);
        assert_eq!(*exec.executed_cut().get(&replica(1)).unwrap(), 1);
    }

    #[test]
    fn waits_for_missing_dependency_then_executes_both() {
        let mut exec = Executor::new();
        let s0 = Slot::new(replica(1), 0);
        let s1 = Slot::new(replica(1), 1);

        // s1 depends on s0, which hasn't committed yet: nothing executes.
        let effects = exec.on_committed(s1, 2, BTreeSet::from([s0]), Some(mutator(&["a"])));
        assert!(effects.executed.is_empty());

        // s0 arrives: both become ready and execute s0 before s1 (lower seq).
        let effects = exec.on_committed(s0, 1, BTreeSet::new(), Some(mutator(&["a"])));
        assert_eq!(effects.executed.len(), 2);
        assert_eq!(effects.executed[0].slot, s0);
        assert_eq!(effects.executed[1].slot, s1);
    }

    #[test]
    fn cyclic_scc_executes_in_seq_then_slot_order() {
        let mut exec = Executor::new();
        let a = Slot::new(replica(1), 0);
        let b = Slot::new(replica(2), 0);
        let c = Slot::new(replica(3), 0);

        exec.on_committed(a, 3, BTreeSet::from([b]), Some(mutator(&["k"])));
        exec.on_committed(b, 3, BTreeSet::from([c]), Some(mutator(&["k"])));
        let effects = exec.on_committed(c, 3, BTreeSet::from([a]), Some(mutator(&["k"])));

        assert_eq!(effects.executed.len(), 3);
        let order: Vec<Slot> = effects.executed.iter().map(|e| e.slot).collect();
        assert_eq!(order, vec![a, b, c]);
    }

    #[test]
    fn checkpoint_execution_emits_frontier_from_its_deps() {
        let mut exec = Executor::new();
        let s1 = Slot::new(replica(1), 5);
        let s2 = Slot::new(replica(2), 3);
        let cp_id = CommandID::generate().unwrap();
        let cp_slot = Slot::new(replica(3), 0);
        let effects = exec.on_committed(
            cp_slot,
            10,
            BTreeSet::from([s1, s2]),
            Some(Command::checkpoint(cp_id, 1)),
        );
        assert_eq!(effects.checkpoints.len(), 1);
        let frontier = &effects.checkpoints[0].frontier;
        assert_eq!(frontier.get(&replica(1)), Some(&5));
        assert_eq!(frontier.get(&replica(2)), Some(&3));
    }

    #[test]
    fn non_interfering_independent_slots_both_execute_on_arrival() {
        let mut exec = Executor::new();
        let s1 = Slot::new(replica(1), 0);
        let s2 = Slot::new(replica(2), 0);
        assert_eq!(
            exec.on_committed(s1, 1, BTreeSet::new(), Some(mutator(&["a"])))
                .executed
                .len(),
            1
        );
        assert_eq!(
            exec.on_committed(s2, 1, BTreeSet::new(), Some(mutator(&["b"])))
                .executed
                .len(),
            1
        );
    }

    #[test]
    fn dep_on_a_pruned_slot_below_the_cut_still_executes() {
        let mut exec = Executor::new();
        let s0 = Slot::new(replica(1), 0);
        let s1 = Slot::new(replica(1), 1);

        // s0 executes on its own and advances executed_cut past it, pruning it from `executed`.
        let effects = exec.on_committed(s0, 1, BTreeSet::new(), Some(mutator(&["a"])));
        assert_eq!(effects.executed.len(), 1);
        assert_eq!(*exec.executed_cut().get(&replica(1)).unwrap(), 1);
        assert!(exec.is_executed(s0));

        // a later write to the same key depends on s0, which no longer appears in `executed`.
        let effects = exec.on_committed(s1, 2, BTreeSet::from([s0]), Some(mutator(&["a"])));
        assert_eq!(effects.executed.len(), 1);
        assert_eq!(effects.executed[0].slot, s1);
        assert!(exec.is_executed(s1));
    }

    #[test]
    fn already_executed_slot_is_a_no_op() {
        let mut exec = Executor::new();
        let slot = Slot::new(replica(1), 0);
        exec.on_committed(slot, 1, BTreeSet::new(), Some(mutator(&["a"])));
        let effects = exec.on_committed(slot, 1, BTreeSet::new(), Some(mutator(&["a"])));
        assert!(effects.executed.is_empty());
    }
}
