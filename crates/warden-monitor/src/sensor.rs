//! Local suspicion sensor.
//!
//! Compares the arrival time of every proposal and vote against the delay
//! the latency model predicts and accuses the sender when the observation
//! exceeds the prediction by more than `suspicion_delta`.
//!
//! ```text
//! Uninitialized ──set_expectation──► Armed ──► per round: Observing ──► Ok
//!       ▲                                                     └──────► Flagged
//!       └──────────────────────── clear ─────────────────────────────┘
//! ```
//!
//! A round whose proposal was flagged accuses nobody else in that round:
//! once the proposal is late every vote is late too. Likewise a flagged
//! WRITE silences ACCEPT.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};
use warden_config::SensorConfig;
use warden_types::{ConsensusId, Nanos, ProcessId, ProtocolPhase, SuspicionKind};
use warden_wire::SuspicionMeasurement;

use crate::clock::TimeSource;
use crate::engine::Publisher;
use crate::lock;

/// Expected delays, in nanoseconds, for one replica under one leader.
///
/// Values derived from a missing link are `MISSING_VALUE` and never trigger
/// a suspicion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectationModel {
    /// Expected duration between two consecutive proposals.
    pub round: Nanos,
    /// Expected delay from proposal send to proposal arrival here.
    pub propose: Nanos,
    /// Expected delay from proposal send to replica `j`'s WRITE arriving here.
    pub write_arrival: Vec<Nanos>,
    /// Expected delay from proposal send to replica `j`'s ACCEPT arriving here.
    pub accept_arrival: Vec<Nanos>,
}

/// Watches one replica's view of protocol timing.
pub struct SuspicionSensor {
    me: ProcessId,
    config: SensorConfig,
    clock: Arc<dyn TimeSource>,
    publisher: Arc<Publisher>,
    state: Mutex<SensorState>,
}

#[derive(Debug, Default)]
struct SensorState {
    /// `None` while uninitialized.
    expectation: Option<ExpectationModel>,
    /// Send time of each proposal seen, bounded by `config.history`.
    proposal_sent: BTreeMap<ConsensusId, Nanos>,
    /// Round whose votes are currently checked.
    current_round: Option<ConsensusId>,
    /// Senders flagged per (round, phase).
    flagged: BTreeMap<(ConsensusId, ProtocolPhase), BTreeSet<ProcessId>>,
    /// Last round whose proposal was flagged.
    last_delayed_round: Option<ConsensusId>,
    last_client_request: Option<Nanos>,
}

impl SuspicionSensor {
    pub fn new(
        me: ProcessId,
        config: SensorConfig,
        clock: Arc<dyn TimeSource>,
        publisher: Arc<Publisher>,
    ) -> Self {
        Self {
            me,
            config,
            clock,
            publisher,
            state: Mutex::new(SensorState::default()),
        }
    }

    /// Installs a new latency model and arms the sensor.
    pub fn set_expectation(&self, model: ExpectationModel) {
        debug!(
            replica = %self.me,
            round = model.round,
            propose = model.propose,
            "installing expectation model"
        );
        lock(&self.state).expectation = Some(model);
    }

    pub fn is_armed(&self) -> bool {
        lock(&self.state).expectation.is_some()
    }

    /// Disarms the sensor and forgets every round.
    pub fn clear(&self) {
        *lock(&self.state) = SensorState::default();
    }

    /// Records that a client request arrived at `at`.
    pub fn note_client_request(&self, at: Nanos) {
        let mut state = lock(&self.state);
        state.last_client_request = Some(state.last_client_request.map_or(at, |t| t.max(at)));
    }

    /// Checks the proposal of `consensus_id`, sent by `sender` at
    /// `sent_timestamp`. Returns true if it was not delayed.
    pub fn check_proposal(
        &self,
        consensus_id: ConsensusId,
        sender: ProcessId,
        sent_timestamp: Nanos,
    ) -> bool {
        let now = self.clock.now_nanos();
        let accusation = {
            let mut state = lock(&self.state);
            state.proposal_sent.insert(consensus_id, sent_timestamp);
            state.current_round = Some(consensus_id);
            state.prune(self.config.history);

            let Some(expectation) = state.expectation.as_ref() else {
                return true;
            };
            if consensus_id.as_i32() <= 0 || sender == self.me {
                return true;
            }
            let Some(&previous_sent) = state.proposal_sent.get(&consensus_id.previous()) else {
                return true;
            };

            let delta = self.config.suspicion_delta;
            let round_time = sent_timestamp.saturating_sub(previous_sent);
            let observation = now.saturating_sub(sent_timestamp);

            let late_arrival = exceeds(observation, expectation.propose, delta);
            let slow_round = exceeds(round_time, expectation.round, delta)
                && state
                    .last_client_request
                    .is_some_and(|t| now.saturating_sub(t) < round_time)
                && state.last_delayed_round != Some(consensus_id.previous());

            trace!(
                %consensus_id,
                %sender,
                observation,
                round_time,
                late_arrival,
                slow_round,
                "checked proposal"
            );
            if !(late_arrival || slow_round) {
                return true;
            }

            state.flag(consensus_id, ProtocolPhase::Propose, sender);
            state.last_delayed_round = Some(consensus_id);
            self.accusation(sender, ProtocolPhase::Propose, consensus_id)
        };

        if let Some(suspicion) = accusation {
            self.publisher.publish_suspicion(&suspicion);
        }
        false
    }

    /// Checks a WRITE or ACCEPT vote of the current round. Returns true if
    /// it was not delayed.
    pub fn check_vote(
        &self,
        consensus_id: ConsensusId,
        sender: ProcessId,
        phase: ProtocolPhase,
        sent_timestamp: Nanos,
    ) -> bool {
        let now = self.clock.now_nanos();
        let accusation = {
            let mut state = lock(&self.state);
            let Some(expectation) = state.expectation.as_ref() else {
                return true;
            };
            let expected = match phase {
                ProtocolPhase::Write => expectation.write_arrival.get(sender.as_usize()),
                ProtocolPhase::Accept => expectation.accept_arrival.get(sender.as_usize()),
                ProtocolPhase::Propose | ProtocolPhase::Unknown => {
                    debug!(%consensus_id, %sender, %phase, "vote phase is not checked");
                    return true;
                }
            };
            let Some(&expected) = expected else {
                return true;
            };
            if sender == self.me || state.current_round != Some(consensus_id) {
                return true;
            }
            if state.is_flagged(consensus_id, ProtocolPhase::Propose)
                || (phase == ProtocolPhase::Accept
                    && state.is_flagged(consensus_id, ProtocolPhase::Write))
            {
                return true;
            }
            let Some(&round_sent) = state.proposal_sent.get(&consensus_id) else {
                return true;
            };
            if sent_timestamp < round_sent {
                debug!(
                    %consensus_id,
                    %sender,
                    %phase,
                    sent_timestamp,
                    round_sent,
                    "vote predates its proposal, ignoring"
                );
                return true;
            }

            let observation = now.saturating_sub(round_sent);
            let delayed = exceeds(observation, expected, self.config.suspicion_delta);
            trace!(%consensus_id, %sender, %phase, observation, expected, delayed, "checked vote");
            if !delayed || !state.flag(consensus_id, phase, sender) {
                return !delayed;
            }
            self.accusation(sender, phase, consensus_id)
        };

        if let Some(suspicion) = accusation {
            self.publisher.publish_suspicion(&suspicion);
        }
        false
    }

    /// Answers a SLOW accusation against this replica that its own sensor
    /// does not corroborate.
    ///
    /// Returns a FALSE_ACCUSATION against the accuser if the sensor is armed,
    /// the local replica is the suspect and not the reporter, the report is
    /// SLOW, and this sensor flagged no phase of that round earlier than the
    /// accused one. Only an earlier delay explains our own late message; a
    /// peer flagged in the same phase does not.
    pub fn return_suspicion_if_falsely_accused(
        &self,
        incoming: &SuspicionMeasurement,
    ) -> Option<SuspicionMeasurement> {
        let state = lock(&self.state);
        if state.expectation.is_none()
            || incoming.suspect != self.me
            || incoming.reporter == self.me
            || incoming.kind != SuspicionKind::Slow
        {
            return None;
        }
        let corroborated = state
            .flagged
            .range((incoming.consensus_id, ProtocolPhase::Propose)..(incoming.consensus_id, incoming.phase))
            .next()
            .is_some();
        if corroborated {
            debug!(accusation = %incoming, "accusation matches a local delay");
            return None;
        }

        let reply = SuspicionMeasurement::new(
            incoming.reporter,
            self.me,
            SuspicionKind::FalseAccusation,
            incoming.phase,
            incoming.consensus_id,
        );
        warn!(accusation = %incoming, "rejecting false accusation");
        Some(reply)
    }

    fn accusation(
        &self,
        suspect: ProcessId,
        phase: ProtocolPhase,
        consensus_id: ConsensusId,
    ) -> Option<SuspicionMeasurement> {
        if self.is_reconfiguration_round(consensus_id) {
            debug!(%consensus_id, %suspect, %phase, "delay in reconfiguration round, not reporting");
            return None;
        }
        info!(%consensus_id, %suspect, %phase, "new suspicion");
        Some(SuspicionMeasurement::slow(suspect, self.me, phase, consensus_id))
    }

    /// Rounds right after a leader reconfiguration are expected to be slow.
    ///
    /// A non-positive `calculation_interval` means no reconfiguration rounds.
    fn is_reconfiguration_round(&self, consensus_id: ConsensusId) -> bool {
        let interval = self.config.calculation_interval;
        interval > 0 && consensus_id.as_i32().rem_euclid(interval) == self.config.calculation_delay + 1
    }
}

impl std::fmt::Debug for SuspicionSensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuspicionSensor")
            .field("me", &self.me)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SensorState {
    /// Marks `sender` as delayed in `phase`. Returns false if it already was.
    fn flag(&mut self, consensus_id: ConsensusId, phase: ProtocolPhase, sender: ProcessId) -> bool {
        self.flagged
            .entry((consensus_id, phase))
            .or_default()
            .insert(sender)
    }

    fn is_flagged(&self, consensus_id: ConsensusId, phase: ProtocolPhase) -> bool {
        self.flagged.contains_key(&(consensus_id, phase))
    }

    /// Keeps the newest `history` proposals and the flags of those rounds.
    fn prune(&mut self, history: usize) {
        while self.proposal_sent.len() > history {
            self.proposal_sent.pop_first();
        }
        if let Some((&oldest, _)) = self.proposal_sent.first_key_value() {
            self.flagged = self.flagged.split_off(&(oldest, ProtocolPhase::Propose));
        }
    }
}

/// `observation > expectation * delta`, computed without overflow.
fn exceeds(observation: Nanos, expectation: Nanos, delta: f64) -> bool {
    observation as f64 > expectation as f64 * delta
}
