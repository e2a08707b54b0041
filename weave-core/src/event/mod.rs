//! event — finalized event records built from refined sessions
//!
//! An [`Event`] is what persistence and narrative generation consume.  It is
//! never mutated once built.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::detection::Detection;
use crate::identity::{IdentityId, IdentityRef, MatchMethod, Role};
use crate::observation::{EphemeralKey, Observation, ObservationId, TrackedDetection};
use crate::refine::RefinedSession;
use crate::timeline::Timeline;

/// Event-scoped participant label.  Unidentified groups are numbered by first
/// appearance within the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ParticipantId {
    Known(IdentityId),
    Unidentified(u32),
}

/// The single detection chosen to stand for a participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Representative {
    pub observation: ObservationId,
    pub camera: String,
    pub time: NaiveDateTime,
    pub method: MatchMethod,
    pub detection: Detection,
}

impl Representative {
    /// Method rank, then detector confidence, then box area.
    fn outranks(&self, other: &Representative) -> bool {
        let key = |r: &Representative| {
            (
                r.method.rank(),
                r.detection.confidence,
                r.detection.bbox.area(),
            )
        };
        key(self)
            .partial_cmp(&key(other))
            .is_some_and(|o| o.is_gt())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub role: Role,
    /// Strongest method seen across the participant's detections.
    pub method: MatchMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspected: Option<IdentityId>,
    pub first_seen: NaiveDateTime,
    pub last_seen: NaiveDateTime,
    pub cameras: Vec<String>,
    pub detections: usize,
    pub representative: Representative,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationSummary {
    pub id: ObservationId,
    pub camera: String,
    pub start: NaiveDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub detections: usize,
}

impl From<&Observation> for ObservationSummary {
    fn from(obs: &Observation) -> Self {
        Self {
            id: obs.id,
            camera: obs.camera.clone(),
            start: obs.start,
            duration_secs: obs.duration_secs,
            source: obs.source.clone(),
            detections: obs.detection_count(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub duration_secs: f64,
    pub cameras: Vec<String>,
    pub participants: Vec<Participant>,
    /// Distinct unidentified people after deduplication.
    pub stranger_count: usize,
    pub observations: Vec<ObservationSummary>,
    pub timeline: Timeline,
}

impl Event {
    pub fn participant(&self, id: ParticipantId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == id)
    }

    pub fn known_identities(&self) -> Vec<IdentityId> {
        self.participants
            .iter()
            .filter_map(|p| match p.id {
                ParticipantId::Known(id) => Some(id),
                ParticipantId::Unidentified(_) => None,
            })
            .collect()
    }
}

// ── EventAggregator ──────────────────────────────────────────────────────────

struct Tally {
    method: MatchMethod,
    suspected: Option<IdentityId>,
    first_seen: NaiveDateTime,
    last_seen: NaiveDateTime,
    cameras: BTreeSet<String>,
    detections: usize,
    representative: Representative,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EventAggregator;

impl EventAggregator {
    pub fn new() -> Self {
        Self
    }

    pub fn aggregate(&self, refined: &RefinedSession) -> Event {
        let session = &refined.session;
        let groups: BTreeMap<EphemeralKey, u32> = refined
            .groups
            .iter()
            .enumerate()
            .flat_map(|(g, members)| members.iter().map(move |k| (*k, g as u32)))
            .collect();
        let label = |obs: &Observation, det: &TrackedDetection| match det.verdict.identity {
            IdentityRef::Known(id) => ParticipantId::Known(id),
            IdentityRef::Ephemeral | IdentityRef::Unresolved => {
                let key = EphemeralKey {
                    observation: obs.id,
                    track: det.track,
                };
                // Every unidentified key is grouped; fall back past the last
                // group rather than collapse strangers together.
                ParticipantId::Unidentified(
                    groups
                        .get(&key)
                        .copied()
                        .unwrap_or(refined.groups.len() as u32),
                )
            }
        };

        let mut tallies: BTreeMap<ParticipantId, Tally> = BTreeMap::new();
        for obs in session.observations() {
            for det in obs.detections() {
                let id = label(obs, det);
                let candidate = Representative {
                    observation: obs.id,
                    camera: obs.camera.clone(),
                    time: obs.start,
                    method: det.verdict.method,
                    detection: det.detection.clone(),
                };
                match tallies.get_mut(&id) {
                    None => {
                        tallies.insert(
                            id,
                            Tally {
                                method: det.verdict.method,
                                suspected: det.verdict.suspected,
                                first_seen: obs.start,
                                last_seen: obs.start,
                                cameras: BTreeSet::from([obs.camera.clone()]),
                                detections: 1,
                                representative: candidate,
                            },
                        );
                    }
                    Some(tally) => {
                        if det.verdict.method.rank() > tally.method.rank() {
                            tally.method = det.verdict.method;
                        }
                        tally.suspected = tally.suspected.or(det.verdict.suspected);
                        tally.first_seen = tally.first_seen.min(obs.start);
                        tally.last_seen = tally.last_seen.max(obs.start);
                        tally.cameras.insert(obs.camera.clone());
                        tally.detections += 1;
                        if candidate.outranks(&tally.representative) {
                            tally.representative = candidate;
                        }
                    }
                }
            }
        }

        let participants: Vec<Participant> = tallies
            .into_iter()
            .map(|(id, t)| Participant {
                id,
                role: match id {
                    ParticipantId::Known(_) => Role::Family,
                    ParticipantId::Unidentified(_) if t.suspected.is_some() => Role::Suspected,
                    ParticipantId::Unidentified(_) => Role::Stranger,
                },
                method: t.method,
                suspected: t.suspected,
                first_seen: t.first_seen,
                last_seen: t.last_seen,
                cameras: t.cameras.into_iter().collect(),
                detections: t.detections,
                representative: t.representative,
            })
            .collect();

        let roles: BTreeMap<ParticipantId, Role> =
            participants.iter().map(|p| (p.id, p.role)).collect();
        let timeline = Timeline::build(session.observations(), |obs, det| {
            let id = label(obs, det);
            (id, roles.get(&id).copied().unwrap_or(Role::Stranger))
        });

        let cameras: BTreeSet<String> = session
            .observations()
            .iter()
            .map(|o| o.camera.clone())
            .collect();
        let span_secs = (session.end() - session.start()).num_milliseconds() as f64 / 1000.0;
        let duration_secs = session
            .observations()
            .iter()
            .filter_map(|o| o.duration_secs)
            .fold(None, |acc: Option<f64>, d| Some(acc.map_or(d, |a| a.max(d))))
            .unwrap_or(span_secs);
        let stranger_count = participants
            .iter()
            .filter(|p| matches!(p.id, ParticipantId::Unidentified(_)))
            .count();

        let event = Event {
            start: session.start(),
            end: session.end(),
            duration_secs,
            cameras: cameras.into_iter().collect(),
            stranger_count,
            observations: session
                .observations()
                .iter()
                .map(ObservationSummary::from)
                .collect(),
            participants,
            timeline,
        };
        info!(
            start = %event.start,
            end = %event.end,
            observations = event.observations.len(),
            participants = event.participants.len(),
            strangers = event.stranger_count,
            "event finalized"
        );
        event
    }
}
