#![doc = include_str!("../README.md")]

//! The timeout wheel (`spec.md` §4.7): schedules an explicit-prepare deadline for every slot whose
//! stage is still below `Committed`, with mandatory jitter to avoid dueling leaders.

use std::collections::HashMap;

use concord_pb::{Slot, Stage};

use guacamole::{FromGuacamole, Guacamole};

///////////////////////////////////////////// biometrics ///////////////////////////////////////////

static SCHEDULE: biometrics::Counter = biometrics::Counter::new("concord_timeout.schedule");
static CANCEL: biometrics::Counter = biometrics::Counter::new("concord_timeout.cancel");
static FIRED: biometrics::Counter = biometrics::Counter::new("concord_timeout.fired");

/// Register this crate's sensors with `collector`, mirroring `busyrpc::register_biometrics`.
pub fn register_biometrics(collector: &mut biometrics::Collector) {
    collector.register_counter(&SCHEDULE);
    collector.register_counter(&CANCEL);
    collector.register_counter(&FIRED);
}

///////////////////////////////////////////// logging //////////////////////////////////////////////

static COLLECTOR: indicio::Collector = indicio::Collector::new();

////////////////////////////////////////////// TimeoutWheel ////////////////////////////////////////

/// Per-slot explicit-prepare deadlines, in ticks.  Jittered by `guacamole::Guacamole` seeded once
/// per replica, the same RNG the pack uses for its own deterministic tests.
#[derive(Debug)]
pub struct TimeoutWheel {
    timeout: u32,
    timeout_range: u32,
    deadlines: HashMap<Slot, u64>,
    guac: Guacamole,
}

impl TimeoutWheel {
    /// Construct a wheel with base `timeout` and jitter width `timeout_range`, both in ticks.
    /// `seed` should be distinct per replica so that concurrent replicas do not draw identical
    /// jitter sequences and duel forever.
    pub fn new(seed: u64, timeout: u32, timeout_range: u32) -> Self {
        Self {
            timeout,
            timeout_range,
            deadlines: HashMap::new(),
            guac: Guacamole::new(seed),
        }
    }

    /// Schedule (or clear) a slot's deadline for its new `stage`, observed at tick `now`.  Per
    /// `spec.md` §4.7: a deadline is set for every stage `< Committed`, replaced on every stage
    /// change, and removed once `Committed` is reached.
    pub fn schedule(&mut self, slot: Slot, stage: Stage, now: u64) {
        if stage >= Stage::Committed {
            if self.deadlines.remove(&slot).is_some() {
                indicio::clue!(COLLECTOR, indicio::DEBUG, {
                    event: "schedule.cleared",
                    slot: slot.to_string(),
                });
            }
            return;
        }
        SCHEDULE.click();
        let jitter = if self.timeout_range == 0 {
            0
        } else {
            u32::from_guacamole(&mut (), &mut self.guac) % self.timeout_range
        };
        let deadline = now + self.timeout as u64 + jitter as u64;
        self.deadlines.insert(slot, deadline);
    }

    /// Remove any pending deadline for `slot` unconditionally (e.g. the slot was purged by
    /// checkpoint truncation).
    pub fn cancel(&mut self, slot: Slot) {
        if self.deadlines.remove(&slot).is_some() {
            CANCEL.click();
        }
    }

    /// Every slot whose deadline is `<= now`.  Fired deadlines are removed; the caller re-arms via
    /// `schedule` if the slot is still not committed after driving its explicit-prepare round.
    pub fn poll(&mut self, now: u64) -> Vec<Slot> {
        let fired: Vec<Slot> = self
            .deadlines
            .iter()
            .filter(|&(_, &deadline)| deadline <= now)
            .map(|(&slot, _)| slot)
            .collect();
        for slot in &fired {
            self.deadlines.remove(slot);
            FIRED.click();
            indicio::clue!(COLLECTOR, indicio::INFO, {
                event: "poll.fired",
                slot: slot.to_string(),
                now: now,
            });
        }
        fired
    }

    /// True iff `slot` currently has a pending deadline.
    pub fn is_scheduled(&self, slot: Slot) -> bool {
        self.deadlines.contains_key(&slot)
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
