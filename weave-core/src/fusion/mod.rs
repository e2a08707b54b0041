//! fusion — streaming session fusion over the time-sorted observation stream
//!
//! [`FusionPolicy`] is a pure predicate; [`SessionManager`] applies it while
//! keeping at most one session open.  Every observation pushed ends up in
//! exactly one emitted [`Session`].

use chrono::NaiveDateTime;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::FusionConfig;
use crate::observation::{Observation, ParticipantSet};

// ── Session ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Session {
    observations: Vec<Observation>,
    participants: ParticipantSet,
    start: NaiveDateTime,
    end: NaiveDateTime,
}

impl Session {
    pub fn open(seed: Observation) -> Self {
        Self {
            participants: seed.participants(),
            start: seed.start,
            end: seed.start,
            observations: vec![seed],
        }
    }

    /// Merge an observation: union participants, extend the end time.
    pub fn absorb(&mut self, observation: Observation) {
        self.participants.union_with(&observation.participants());
        self.start = self.start.min(observation.start);
        self.end = self.end.max(observation.start);
        self.observations.push(observation);
    }

    pub fn start(&self) -> NaiveDateTime {
        self.start
    }

    /// Start time of the latest contributing observation.
    pub fn end(&self) -> NaiveDateTime {
        self.end
    }

    pub fn participants(&self) -> &ParticipantSet {
        &self.participants
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn into_observations(self) -> Vec<Observation> {
        self.observations
    }

    pub(crate) fn observations_mut(&mut self) -> &mut [Observation] {
        &mut self.observations
    }

    /// Rebuild the participant set after detections were relabelled.
    pub(crate) fn recompute_participants(&mut self) {
        let mut set = ParticipantSet::default();
        for obs in &self.observations {
            set.union_with(&obs.participants());
        }
        self.participants = set;
    }
}

// ── FusionPolicy ─────────────────────────────────────────────────────────────

/// Which rule settled a merge decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeRule {
    /// Observation starts before the session's end; the stream was not sorted.
    OutOfOrder,
    GapTooLarge,
    SharedIdentity,
    StrangerContinuity,
    Interaction,
    Unrelated,
}

impl MergeRule {
    pub fn merges(self) -> bool {
        matches!(
            self,
            MergeRule::SharedIdentity | MergeRule::StrangerContinuity | MergeRule::Interaction
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct FusionPolicy {
    config: FusionConfig,
}

impl FusionPolicy {
    pub fn new(config: FusionConfig) -> Self {
        Self { config }
    }

    pub fn should_merge(&self, session: &Session, observation: &Observation) -> bool {
        self.decide(session, observation).merges()
    }

    /// Rules in order, first hit wins.
    pub fn decide(&self, session: &Session, observation: &Observation) -> MergeRule {
        let gap = (observation.start - session.end()).num_milliseconds() as f64 / 1000.0;
        if gap < 0.0 {
            warn!(
                observation = observation.id.0,
                session_end = %session.end(),
                start = %observation.start,
                "observation precedes open session, not merging"
            );
            return MergeRule::OutOfOrder;
        }
        if gap > self.config.time_threshold_secs {
            return MergeRule::GapTooLarge;
        }

        let ours = session.participants();
        let theirs = observation.participants();
        if ours.shares_known_with(&theirs) {
            return MergeRule::SharedIdentity;
        }
        if ours.is_only_unidentified()
            && theirs.is_only_unidentified()
            && gap < self.config.stranger_merge_threshold_secs
        {
            return MergeRule::StrangerContinuity;
        }
        let mixed = (ours.is_only_known() && theirs.is_only_unidentified())
            || (ours.is_only_unidentified() && theirs.is_only_known());
        if mixed && gap < self.config.interaction_threshold_secs {
            return MergeRule::Interaction;
        }
        MergeRule::Unrelated
    }
}

// ── SessionManager ───────────────────────────────────────────────────────────

#[derive(Debug, Default)]
enum State {
    #[default]
    NoOpenSession,
    SessionOpen(Session),
}

/// Consumes observations in stream order and emits closed sessions.
#[derive(Debug, Default)]
pub struct SessionManager {
    policy: FusionPolicy,
    state: State,
    closed: usize,
}

impl SessionManager {
    pub fn new(policy: FusionPolicy) -> Self {
        Self {
            policy,
            state: State::NoOpenSession,
            closed: 0,
        }
    }

    /// Feed the next observation.  Returns the session it closed, if any.
    pub fn push(&mut self, observation: Observation) -> Option<Session> {
        match std::mem::take(&mut self.state) {
            State::NoOpenSession => {
                self.state = State::SessionOpen(Session::open(observation));
                None
            }
            State::SessionOpen(mut session) => {
                let rule = self.policy.decide(&session, &observation);
                debug!(
                    observation = observation.id.0,
                    camera = %observation.camera,
                    ?rule,
                    "fusion decision"
                );
                if rule.merges() {
                    session.absorb(observation);
                    self.state = State::SessionOpen(session);
                    None
                } else {
                    self.state = State::SessionOpen(Session::open(observation));
                    self.closed += 1;
                    Some(session)
                }
            }
        }
    }

    /// Close whatever is still open at end of stream.
    pub fn finish(&mut self) -> Option<Session> {
        match std::mem::take(&mut self.state) {
            State::NoOpenSession => None,
            State::SessionOpen(session) => {
                self.closed += 1;
                Some(session)
            }
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, State::SessionOpen(_))
    }

    pub fn closed_count(&self) -> usize {
        self.closed
    }

    /// Run a whole sorted stream through a fresh manager.
    pub fn partition<I>(policy: FusionPolicy, observations: I) -> Vec<Session>
    where
        I: IntoIterator<Item = Observation>,
    {
        let mut manager = SessionManager::new(policy);
        let mut sessions: Vec<Session> = observations
            .into_iter()
            .filter_map(|obs| manager.push(obs))
            .collect();
        sessions.extend(manager.finish());
        sessions
    }
}
