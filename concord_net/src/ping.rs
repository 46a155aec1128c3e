//! Per-peer round-trip-time estimation from `Ping`/`Pong` traffic (`spec.md` §6, §2 component 11).

use std::collections::HashMap;

use concord_pb::{PingBody, PongBody, ReplicaID};

///////////////////////////////////////////// biometrics ///////////////////////////////////////////

static PING_SENT: biometrics::Counter = biometrics::Counter::new("concord_net.ping.sent");
static PONG_RECEIVED: biometrics::Counter = biometrics::Counter::new("concord_net.ping.pong_received");
static PONG_UNMATCHED: biometrics::Counter = biometrics::Counter::new("concord_net.ping.pong_unmatched");

/// Register this module's sensors with `collector`, mirroring `busyrpc::register_biometrics`.
pub fn register_biometrics(collector: &mut biometrics::Collector) {
    collector.register_counter(&PING_SENT);
    collector.register_counter(&PONG_RECEIVED);
    collector.register_counter(&PONG_UNMATCHED);
}

///////////////////////////////////////////// PingTracker ///////////////////////////////////////////

/// Tracks outstanding pings per peer and folds round-trip times into a [biometrics::moments::Moments]
/// per peer, the same algebraic statistics type `biometrics` ships for latency distributions.
#[derive(Debug, Default)]
pub struct PingTracker {
    next_id: u64,
    outstanding: HashMap<(ReplicaID, u64), u64>,
    rtt: HashMap<ReplicaID, biometrics::moments::Moments>,
}

impl PingTracker {
    /// Construct an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a ping to `peer` at local clock reading `now` (in jiffies, or any monotonic unit the
    /// caller's tick source uses).  Returns the `PingBody` to send.
    pub fn ping(&mut self, peer: ReplicaID, now: u64) -> PingBody {
        let id = self.next_id;
        self.next_id += 1;
        self.outstanding.insert((peer, id), now);
        PING_SENT.click();
        PingBody { id }
    }

    /// A `Pong` arrived from `peer` at local clock reading `now`.  If it matches an outstanding
    /// ping, the round trip time is folded into that peer's [biometrics::moments::Moments] and
    /// returned.
    pub fn pong(&mut self, peer: ReplicaID, pong: PongBody, now: u64) -> Option<f64> {
        let sent_at = self.outstanding.remove(&(peer, pong.id))?;
        PONG_RECEIVED.click();
        let rtt = now.saturating_sub(sent_at) as f64;
        self.rtt.entry(peer).or_default().push(rtt);
        Some(rtt)
    }

    /// Handle a pong whose id was never recorded as outstanding (duplicate delivery, or a ping
    /// issued before a restart): counted, but otherwise ignored.
    pub fn unmatched_pong(&self) {
        PONG_UNMATCHED.click();
    }

    /// The current round-trip-time distribution observed for `peer`, if any pongs have arrived.
    pub fn rtt(&self, peer: ReplicaID) -> Option<&biometrics::moments::Moments> {
        self.rtt.get(&peer)
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn replica(id: u32) -> ReplicaID {
        ReplicaID::new(id)
    }

    #[test]
    fn matched_pong_records_round_trip_time() {
        let mut tracker = PingTracker::new();
        let ping = tracker.ping(replica(2), 100);
        let rtt = tracker.pong(replica(2), PongBody { id: ping.id }, 150).unwrap();
        assert_eq!(rtt, 50.0);
        assert_eq!(tracker.rtt(replica(2)).unwrap().n, 1);
    }

    #[test]
    fn unmatched_pong_is_ignored() {
        let mut tracker = PingTracker::new();
        assert!(tracker.pong(replica(2), PongBody { id: 999 }, 100).is_none());
        assert!(tracker.rtt(replica(2)).is_none());
    }

    #[test]
    fn multiple_pings_track_independently() {
        let mut tracker = PingTracker::new();
        let a = tracker.ping(replica(2), 0);
        let b = tracker.ping(replica(2), 10);
        tracker.pong(replica(2), PongBody { id: b.id }, 30).unwrap();
        tracker.pong(replica(2), PongBody { id: a.id }, 40).unwrap();
        assert_eq!(tracker.rtt(replica(2)).unwrap().n, 2);
    }
}
