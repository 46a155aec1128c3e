#![doc = include_str!("../README.md")]

//! The acceptor role (`spec.md` §4.3): handles `PreAccept`/`Accept`/`Commit`/`Prepare` requests
//! against the instance store and produces the appropriate reply (if any) plus the `LeaderStop`
//! side-channel event.
//!
//! Per `spec.md` §9's design note, the source's per-slot generator coroutine is realized here as a
//! pure function of `(request, store state)`: every request this role handles is answered in a
//! single round trip, so no additional state beyond what [concord_store::InstanceStore] already
//! tracks is needed per slot.

use std::collections::BTreeSet;

use concord_pb::{
    AcceptAckBody, AcceptNackBody, AcceptRequestBody, Ballot, CommitRequestBody, DivergedBody, Error,
    PreAcceptAckBody, PreAcceptNackBody, PreAcceptRequestBody, PrepareAckBody, PrepareNackBody,
    PrepareRequestBody, Slot, Stage,
};
use concord_store::{InstanceState, InstanceStore};

///////////////////////////////////////////// biometrics ///////////////////////////////////////////

static PREACCEPT_OK: biometrics::Counter = biometrics::Counter::new("concord_acceptor.preaccept.ok");
static PREACCEPT_NACK: biometrics::Counter = biometrics::Counter::new("concord_acceptor.preaccept.nack");
static PREACCEPT_DROPPED: biometrics::Counter = biometrics::Counter::new("concord_acceptor.preaccept.dropped");
static ACCEPT_OK: biometrics::Counter = biometrics::Counter::new("concord_acceptor.accept.ok");
static ACCEPT_NACK: biometrics::Counter = biometrics::Counter::new("concord_acceptor.accept.nack");
static COMMIT_OK: biometrics::Counter = biometrics::Counter::new("concord_acceptor.commit.ok");
static COMMIT_DROPPED: biometrics::Counter = biometrics::Counter::new("concord_acceptor.commit.dropped");
static PREPARE_OK: biometrics::Counter = biometrics::Counter::new("concord_acceptor.prepare.ok");
static PREPARE_NACK: biometrics::Counter = biometrics::Counter::new("concord_acceptor.prepare.nack");
static SLOT_TOO_OLD: biometrics::Counter = biometrics::Counter::new("concord_acceptor.slot_too_old");

/// Register this crate's sensors with `collector`, mirroring `busyrpc::register_biometrics`.
pub fn register_biometrics(collector: &mut biometrics::Collector) {
    collector.register_counter(&PREACCEPT_OK);
    collector.register_counter(&PREACCEPT_NACK);
    collector.register_counter(&PREACCEPT_DROPPED);
    collector.register_counter(&ACCEPT_OK);
    collector.register_counter(&ACCEPT_NACK);
    collector.register_counter(&COMMIT_OK);
    collector.register_counter(&COMMIT_DROPPED);
    collector.register_counter(&PREPARE_OK);
    collector.register_counter(&PREPARE_NACK);
    collector.register_counter(&SLOT_TOO_OLD);
}

///////////////////////////////////////////// logging //////////////////////////////////////////////

static COLLECTOR: indicio::Collector = indicio::Collector::new();

///////////////////////////////////////////// AcceptorOutcome //////////////////////////////////////

/// What a request handler wants the router to do.
#[derive(Clone, Debug, Default)]
pub struct AcceptorOutcome {
    /// The reply packet body to send back to the requester, if any.
    pub reply: Option<concord_pb::PacketBody>,
    /// `spec.md` §4.3: whenever the acceptor commits a state change for a slot, the local leader
    /// sub-coroutine for that slot (if any) must abandon its own attempt.
    pub leader_stop: Option<Slot>,
}

impl AcceptorOutcome {
    fn reply(body: concord_pb::PacketBody) -> Self {
        Self {
            reply: Some(body),
            leader_stop: None,
        }
    }

    fn reply_and_stop(body: concord_pb::PacketBody, slot: Slot) -> Self {
        Self {
            reply: Some(body),
            leader_stop: Some(slot),
        }
    }

    fn drop() -> Self {
        Self::default()
    }
}

fn diverged(slot: Slot) -> AcceptorOutcome {
    SLOT_TOO_OLD.click();
    AcceptorOutcome::reply(concord_pb::PacketBody::Diverged(DivergedBody { slot }))
}

fn ballot_of(err: &Error, fallback: Ballot) -> Ballot {
    match err {
        Error::IncorrectBallot { old, .. } => *old,
        _ => fallback,
    }
}

///////////////////////////////////////////////// PreAccept ////////////////////////////////////////

/// `PreAccept(slot, B, cmd, seq, deps)`, per `spec.md` §4.3.
pub fn handle_pre_accept(store: &mut InstanceStore, req: PreAcceptRequestBody) -> AcceptorOutcome {
    let (_, old) = match store.load(req.slot) {
        Ok(v) => v,
        Err(_) => return diverged(req.slot),
    };
    let new = InstanceState {
        ballot: req.ballot,
        stage: Stage::PreAccepted,
        command: req.command,
        seq: req.seq,
        deps: req.deps.into_iter().collect(),
    };
    match store.update(req.slot, new) {
        Ok((_, upd)) => {
            PREACCEPT_OK.click();
            let deps_committed_mask = committed_mask(store, &upd.deps);
            AcceptorOutcome::reply_and_stop(
                concord_pb::PacketBody::PreAcceptAck(PreAcceptAckBody {
                    slot: req.slot,
                    ballot: req.ballot,
                    seq: upd.seq,
                    deps: upd.deps.into_iter().collect(),
                    deps_committed_mask,
                }),
                req.slot,
            )
        }
        Err(Error::IncorrectBallot { old: stored, .. }) => {
            PREACCEPT_NACK.click();
            AcceptorOutcome::reply(concord_pb::PacketBody::PreAcceptNack(PreAcceptNackBody {
                slot: req.slot,
                ballot: stored,
                reason: "BALLOT".to_string(),
            }))
        }
        Err(Error::IncorrectStage { .. }) => {
            PREACCEPT_DROPPED.click();
            indicio::clue!(COLLECTOR, indicio::DEBUG, {
                event: "preaccept.stage_stale",
                slot: req.slot.to_string(),
                old_stage: u32::from(old.stage),
            });
            AcceptorOutcome::drop()
        }
        Err(Error::IncorrectCommand { .. }) => {
            panic!("IncorrectCommand on {}: safety violation, committed value changed", req.slot);
        }
        Err(_) => AcceptorOutcome::drop(),
    }
}

/// `Accept(slot, B, cmd, seq, deps)`, per `spec.md` §4.3.
pub fn handle_accept(store: &mut InstanceStore, req: AcceptRequestBody) -> AcceptorOutcome {
    let (_, old) = match store.load(req.slot) {
        Ok(v) => v,
        Err(_) => return diverged(req.slot),
    };
    let new = InstanceState {
        ballot: req.ballot,
        stage: Stage::Accepted,
        command: req.command,
        seq: req.seq,
        deps: req.deps.into_iter().collect(),
    };
    match store.update(req.slot, new) {
        Ok(_) => {
            ACCEPT_OK.click();
            AcceptorOutcome::reply_and_stop(
                concord_pb::PacketBody::AcceptAck(AcceptAckBody {
                    slot: req.slot,
                    ballot: req.ballot,
                }),
                req.slot,
            )
        }
        Err(Error::IncorrectCommand { .. }) => {
            panic!("IncorrectCommand on {}: safety violation, committed value changed", req.slot);
        }
        Err(err) => {
            ACCEPT_NACK.click();
            AcceptorOutcome::reply(concord_pb::PacketBody::AcceptNack(AcceptNackBody {
                slot: req.slot,
                ballot: ballot_of(&err, old.ballot),
            }))
        }
    }
}

/// `Commit(slot, B, cmd, seq, deps)`, per `spec.md` §4.3: no reply either way.
pub fn handle_commit(store: &mut InstanceStore, req: CommitRequestBody) -> AcceptorOutcome {
    if store.load(req.slot).is_err() {
        return AcceptorOutcome::drop();
    }
    let new = InstanceState {
        ballot: req.ballot,
        stage: Stage::Committed,
        command: req.command,
        seq: req.seq,
        deps: req.deps.into_iter().collect(),
    };
    match store.update(req.slot, new) {
        Ok(_) => {
            COMMIT_OK.click();
            AcceptorOutcome {
                reply: None,
                leader_stop: Some(req.slot),
            }
        }
        Err(Error::IncorrectCommand { .. }) => {
            panic!("IncorrectCommand on {}: safety violation, committed value changed", req.slot);
        }
        Err(_) => {
            COMMIT_DROPPED.click();
            AcceptorOutcome::drop()
        }
    }
}

/// `Prepare(slot, B)`, per `spec.md` §4.3.
pub fn handle_prepare(store: &InstanceStore, req: PrepareRequestBody) -> AcceptorOutcome {
    let (_, stored) = match store.load(req.slot) {
        Ok(v) => v,
        Err(_) => return diverged(req.slot),
    };
    if req.ballot < stored.ballot {
        PREPARE_NACK.click();
        AcceptorOutcome::reply(concord_pb::PacketBody::PrepareNack(PrepareNackBody {
            slot: req.slot,
            ballot: stored.ballot,
        }))
    } else {
        PREPARE_OK.click();
        AcceptorOutcome::reply(concord_pb::PacketBody::PrepareAck(PrepareAckBody {
            slot: req.slot,
            ballot: req.ballot,
            command: stored.command,
            seq: stored.seq,
            deps: stored.deps.into_iter().collect(),
            stage: stored.stage.into(),
        }))
    }
}

/// For every dep in `deps` (in order), is its stage at this replica `>= Committed`?  Bit `i` set
/// means `deps[i]` qualifies, per `spec.md` §4.3/§6's `deps_committed_mask`.  A dep below the
/// checkpoint frontier is treated as committed: `InstanceStore::advance_checkpoint` only ever
/// purges instances that were `Committed` or later.
fn committed_mask(store: &InstanceStore, deps: &BTreeSet<Slot>) -> u64 {
    let mut mask: u64 = 0;
    for (i, dep) in deps.iter().enumerate() {
        if i >= 64 {
            break;
        }
        let committed = match store.load(*dep) {
            Ok((_, state)) => state.stage >= Stage::Committed,
            Err(Error::SlotTooOld { .. }) => true,
            Err(_) => false,
        };
        if committed {
            mask |= 1 << i;
        }
    }
    mask
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use concord_pb::{Command, CommandID, Key, PacketBody, ReplicaID};

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
    fn pre_accept_success_replies_ack_and_stops_leader() {
        let mut store = InstanceStore::new(replica(1), 0);
        let slot = Slot::new(replica(1), 0);
        let ballot = Ballot::initial(0, replica(1));
        let req = PreAcceptRequestBody {
            slot,
            ballot,
            command: Some(mutator(&["a"])),
            seq: 0,
            deps: vec![],
        };
        let outcome = handle_pre_accept(&mut store, req);
        assert_eq!(outcome.leader_stop, Some(slot));
        match outcome.reply {
            Some(PacketBody::PreAcceptAck(ack)) => {
                assert_eq!(ack.slot, slot);
                assert_eq!(ack.seq, 1);
            }
            other => panic!("expected PreAcceptAck, got {other:?}"),
        }
    }

    #[test]
    fn pre_accept_with_stale_ballot_is_nacked() {
        let mut store = InstanceStore::new(replica(1), 0);
        let slot = Slot::new(replica(1), 0);
        let ballot = Ballot::initial(0, replica(1));
        let higher = ballot.next(replica(2));
        handle_pre_accept(
            &mut store,
            PreAcceptRequestBody {
                slot,
                ballot: higher,
                command: Some(mutator(&["a"])),
                seq: 0,
                deps: vec![],
            },
        );
        let outcome = handle_pre_accept(
            &mut store,
            PreAcceptRequestBody {
                slot,
                ballot,
                command: Some(mutator(&["a"])),
                seq: 0,
                deps: vec![],
            },
        );
        match outcome.reply {
            Some(PacketBody::PreAcceptNack(nack)) => assert_eq!(nack.ballot, higher),
            other => panic!("expected PreAcceptNack, got {other:?}"),
        }
        assert!(outcome.leader_stop.is_none());
    }

    #[test]
    fn pre_accept_with_stale_stage_is_silently_dropped() {
        let mut store = InstanceStore::new(replica(1), 0);
        let slot = Slot::new(replica(1), 0);
        let ballot = Ballot::initial(0, replica(1));
        let cmd = mutator(&["a"]);
        handle_commit(
            &mut store,
            CommitRequestBody {
                slot,
                ballot,
                command: Some(cmd.clone()),
                seq: 1,
                deps: vec![],
            },
        );
        let outcome = handle_pre_accept(
            &mut store,
            PreAcceptRequestBody {
                slot,
                ballot,
                command: Some(cmd),
                seq: 1,
                deps: vec![],
            },
        );
        assert!(outcome.reply.is_none());
        assert!(outcome.leader_stop.is_none());
    }

    #[test]
    fn accept_success_replies_ack() {
        let mut store = InstanceStore::new(replica(1), 0);
        let slot = Slot::new(replica(1), 0);
        let ballot = Ballot::initial(0, replica(1));
        let outcome = handle_accept(
            &mut store,
            AcceptRequestBody {
                slot,
                ballot,
                command: Some(mutator(&["a"])),
                seq: 2,
                deps: vec![],
            },
        );
        assert_eq!(outcome.leader_stop, Some(slot));
        assert!(matches!(outcome.reply, Some(PacketBody::AcceptAck(_))));
    }

    #[test]
    fn commit_never_replies() {
        let mut store = InstanceStore::new(replica(1), 0);
        let slot = Slot::new(replica(1), 0);
        let ballot = Ballot::initial(0, replica(1));
        let outcome = handle_commit(
            &mut store,
            CommitRequestBody {
                slot,
                ballot,
                command: Some(mutator(&["a"])),
                seq: 1,
                deps: vec![],
            },
        );
        assert!(outcome.reply.is_none());
        assert_eq!(outcome.leader_stop, Some(slot));
    }

    #[test]
    fn prepare_with_lower_ballot_is_nacked() {
        let mut store = InstanceStore::new(replica(1), 0);
        let slot = Slot::new(replica(1), 0);
        let ballot = Ballot::initial(0, replica(1));
        let higher = ballot.next(replica(2));
        handle_pre_accept(
            &mut store,
            PreAcceptRequestBody {
                slot,
                ballot: higher,
                command: Some(mutator(&["a"])),
                seq: 0,
                deps: vec![],
            },
        );
        let outcome = handle_prepare(&store, PrepareRequestBody { slot, ballot });
        match outcome.reply {
            Some(PacketBody::PrepareNack(nack)) => assert_eq!(nack.ballot, higher),
            other => panic!("expected PrepareNack, got {other:?}"),
        }
    }

    #[test]
    fn prepare_on_untouched_slot_acks_with_synthetic_state() {
        let store = InstanceStore::new(replica(1), 0);
        let slot = Slot::new(replica(1), 0);
        let ballot = Ballot::initial(0, replica(1)).next(replica(2));
        let outcome = handle_prepare(&store, PrepareRequestBody { slot, ballot });
        match outcome.reply {
            Some(PacketBody::PrepareAck(ack)) => {
                assert_eq!(ack.stage, u32::from(Stage::Prepared));
                assert!(ack.command.is_none());
            }
            other => panic!("expected PrepareAck, got {other:?}"),
        }
    }
}
