#![doc = include_str!("../README.md")]

//! The client handler (`spec.md` §4.6): maps client command ids to the slot a leader is driving
//! them through, deduplicates retransmitted requests, and replies once the slot commits.

use std::collections::HashMap;

use concord_pb::{Command, ReplicaID, Slot, Stage};
use concord_store::InstanceState;

///////////////////////////////////////////// biometrics ///////////////////////////////////////////

static REQUEST_NEW: biometrics::Counter = biometrics::Counter::new("concord_client.request.new");
static REQUEST_IN_FLIGHT: biometrics::Counter = biometrics::Counter::new("concord_client.request.in_flight");
static REQUEST_DUPLICATE: biometrics::Counter = biometrics::Counter::new("concord_client.request.duplicate");
static RESPONSE_SENT: biometrics::Counter = biometrics::Counter::new("concord_client.response.sent");

/// Register this crate's sensors with `collector`, mirroring `busyrpc::register_biometrics`.
pub fn register_biometrics(collector: &mut biometrics::Collector) {
    collector.register_counter(&REQUEST_NEW);
    collector.register_counter(&REQUEST_IN_FLIGHT);
    collector.register_counter(&REQUEST_DUPLICATE);
    collector.register_counter(&RESPONSE_SENT);
}

///////////////////////////////////////////// logging //////////////////////////////////////////////

static COLLECTOR: indicio::Collector = indicio::Collector::new();

////////////////////////////////////////// ClientRequestOutcome /////////////////////////////////////

/// What the router should do in response to a `ClientRequest`, per `spec.md` §4.6.
#[derive(Clone, Debug)]
pub enum ClientRequestOutcome {
    /// `cmd.id` had already committed: reply to the requesting peer immediately, with no new
    /// consensus round.
    RespondNow(Command),
    /// `cmd.id` is unseen: the router should start a new leader sub-coroutine for it, then call
    /// [ClientHandler::remember] once the leader has allocated a slot.
    StartLeader,
    /// `cmd.id` is known but not yet committed: the requesting peer has been recorded and will be
    /// replied to on commit; no new action needed now.
    Remembered,
}

///////////////////////////////////////////// ClientHandler /////////////////////////////////////////

/// Tracks, for every slot this replica is driving on behalf of a client, which peer issued the
/// request so the reply can be routed back once the slot commits.
#[derive(Debug, Default)]
pub struct ClientHandler {
    awaiting: HashMap<Slot, ReplicaID>,
}

impl ClientHandler {
    /// Construct an empty handler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle a `ClientRequest(cmd)` received from `peer`.  `looked_up` is the result of
    /// `InstanceStore::load_by_command_id(cmd.id)`: `None` if the command has never been seen at
    /// this replica, `Some((slot, state))` if it has.
    pub fn on_client_request(
        &mut self,
        peer: ReplicaID,
        looked_up: Option<(Slot, InstanceState)>,
    ) -> ClientRequestOutcome {
        match looked_up {
            Some((_slot, state)) if state.stage >= Stage::Committed => {
                REQUEST_DUPLICATE.click();
                let command = state
                    .command
                    .expect("a committed instance always carries a command");
                ClientRequestOutcome::RespondNow(command)
            }
            Some((slot, _state)) => {
                REQUEST_IN_FLIGHT.click();
                self.awaiting.insert(slot, peer);
                ClientRequestOutcome::Remembered
            }
            None => {
                REQUEST_NEW.click();
                ClientRequestOutcome::StartLeader
            }
        }
    }

    /// Record that `slot` (just allocated by a new leader sub-coroutine) was requested by `peer`.
    pub fn remember(&mut self, slot: Slot, peer: ReplicaID) {
        self.awaiting.insert(slot, peer);
    }

    /// A slot reached `Committed`.  If a client is waiting on it, return the peer to send a
    /// `ClientResponse(command)` to and forget the mapping; otherwise `None`.
    pub fn on_committed(&mut self, slot: Slot, command: &Command) -> Option<(ReplicaID, Command)> {
        let peer = self.awaiting.remove(&slot)?;
        RESPONSE_SENT.click();
        indicio::clue!(COLLECTOR, indicio::INFO, {
            event: "response.sent",
            slot: slot.to_string(),
            peer: peer.to_string(),
        });
        Some((peer, command.clone()))
    }

    /// True iff some peer is currently awaiting a commit response for `slot`.
    pub fn is_awaiting(&self, slot: Slot) -> bool {
        self.awaiting.contains_key(&slot)
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use concord_pb::{Ballot, CommandID, Key};

    fn replica(id: u32) -> ReplicaID {
        ReplicaID::new(id)
    }

    fn mutator() -> Command {
        Command::mutator(CommandID::generate().unwrap(), "SET", vec![Key::from("a")])
    }

    #[test]
    fn unseen_command_starts_a_leader() {
        let mut handler = ClientHandler::new();
        let outcome = handler.on_client_request(replica(2), None);
        assert!(matches!(outcome, ClientRequestOutcome::StartLeader));
    }

    #[test]
    fn known_uncommitted_command_is_remembered_without_restarting_consensus() {
        let mut handler = ClientHandler::new();
        let slot = Slot::new(replica(1), 0);
        let mut state = InstanceState::prepared(Ballot::initial(0, replica(1)));
        state.stage = Stage::PreAccepted;
        state.command = Some(mutator());
        let outcome = handler.on_client_request(replica(2), Some((slot, state)));
        assert!(matches!(outcome, ClientRequestOutcome::Remembered));
        assert!(handler.is_awaiting(slot));
    }

    #[test]
    fn committed_command_replies_immediately() {
        let mut handler = ClientHandler::new();
        let slot = Slot::new(replica(1), 0);
        let cmd = mutator();
        let mut state = InstanceState::prepared(Ballot::initial(0, replica(1)));
        state.stage = Stage::Committed;
        state.command = Some(cmd.clone());
        let outcome = handler.on_client_request(replica(2), Some((slot, state)));
        match outcome {
            ClientRequestOutcome::RespondNow(got) => assert_eq!(got, cmd),
            other => panic!("expected RespondNow, got {other:?}"),
        }
    }

    #[test]
    fn commit_notifies_the_waiting_peer_once_and_forgets_it() {
        let mut handler = ClientHandler::new();
        let slot = Slot::new(replica(1), 0);
        handler.remember(slot, replica(2));
        let cmd = mutator();
        let (peer, got) = handler.on_committed(slot, &cmd).unwrap();
        assert_eq!(peer, replica(2));
        assert_eq!(got, cmd);
        assert!(handler.on_committed(slot, &cmd).is_none());
    }

    #[test]
    fn commit_with_no_waiting_client_is_a_no_op() {
        let mut handler = ClientHandler::new();
        let slot = Slot::new(replica(1), 0);
        assert!(handler.on_committed(slot, &mutator()).is_none());
    }
}
