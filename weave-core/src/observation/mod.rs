//! observation — per-video records and the time-ordered stream fed to fusion
//!
//! Raw input arrives as [`ClipRecord`]s (one per video, detections grouped by
//! sampled frame).  [`ingest`] validates them into [`Clip`]s, skipping bad
//! records instead of failing the run.  Once the analyzer has attached an
//! identity verdict to every detection a clip becomes an [`Observation`].

use std::collections::BTreeSet;

use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::detection::Detection;
use crate::identity::{IdentityId, IdentityRef, IdentityVerdict};
use crate::tracking::TrackId;

/// Position of a clip in the input, stable across sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObservationId(pub u32);

/// Identifies an unidentified person within one processing run: the
/// tracklet that produced it inside one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EphemeralKey {
    pub observation: ObservationId,
    pub track: TrackId,
}

/// Who a single detection counts as, for fusion and aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParticipantKey {
    Known(IdentityId),
    Unidentified(EphemeralKey),
}

// ── Raw input ────────────────────────────────────────────────────────────────

/// One video as handed over by the detector/encoder stage.
///
/// `frames: null` marks a video that failed to decode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipRecord {
    #[serde(alias = "cam")]
    pub camera: String,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default, alias = "people_detected")]
    pub frames: Option<Vec<Vec<Detection>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// A validated clip, ready for tracking and arbitration.
#[derive(Debug, Clone)]
pub struct Clip {
    pub id: ObservationId,
    pub camera: String,
    pub start: NaiveDateTime,
    pub duration_secs: Option<f64>,
    pub source: Option<String>,
    pub frames: Vec<Vec<Detection>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    DecodeFailed,
    MissingTime,
    InvalidTime(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedClip {
    pub index: usize,
    pub camera: String,
    #[serde(flatten)]
    pub reason: SkipReason,
}

#[derive(Debug, Default)]
pub struct Ingested {
    pub clips: Vec<Clip>,
    pub skipped: Vec<SkippedClip>,
}

/// Parse `"%Y-%m-%d %H:%M:%S"`, the ISO `T` form, or RFC 3339.
pub fn parse_timestamp(raw: &str) -> Result<NaiveDateTime> {
    let raw = raw.trim();
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(ts);
        }
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.naive_local())
        .map_err(|e| anyhow!("unrecognised timestamp {raw:?}: {e}"))
}

/// Validate raw records.  Ids follow input position, so a skipped record
/// leaves a gap rather than shifting later ids.
pub fn ingest(records: Vec<ClipRecord>) -> Ingested {
    let mut out = Ingested::default();
    for (index, record) in records.into_iter().enumerate() {
        let checked = match (record.frames, record.time.as_deref()) {
            (None, _) => Err(SkipReason::DecodeFailed),
            (Some(_), None) => Err(SkipReason::MissingTime),
            (Some(frames), Some(raw)) => parse_timestamp(raw)
                .map(|start| (start, frames))
                .map_err(|e| SkipReason::InvalidTime(format!("{e:#}"))),
        };
        let (start, mut frames) = match checked {
            Ok(valid) => valid,
            Err(reason) => {
                warn!(index, camera = %record.camera, ?reason, "skipping clip");
                out.skipped.push(SkippedClip {
                    index,
                    camera: record.camera,
                    reason,
                });
                continue;
            }
        };
        index_frames(&mut frames, |det| det);
        out.clips.push(Clip {
            id: ObservationId(index as u32),
            camera: record.camera,
            start,
            duration_secs: record.duration_secs,
            source: record.source,
            frames,
        });
    }
    out
}

/// Stamp every detection with the position of its frame in the clip.
fn index_frames<T>(frames: &mut [Vec<T>], detection: impl Fn(&mut T) -> &mut Detection) {
    for (frame_index, frame) in frames.iter_mut().enumerate() {
        for item in frame.iter_mut() {
            detection(item).frame_index = frame_index as u32;
        }
    }
}

// ── Observations ─────────────────────────────────────────────────────────────

/// An already-arbitrated observation as read back from disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationRecord {
    #[serde(default)]
    pub id: Option<ObservationId>,
    #[serde(alias = "cam")]
    pub camera: String,
    #[serde(default, alias = "time")]
    pub start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default)]
    pub frames: Vec<Vec<TrackedDetection>>,
}

#[derive(Debug, Default)]
pub struct Restored {
    pub observations: Vec<Observation>,
    pub skipped: Vec<SkippedClip>,
}

/// Validate stored observations.  A bad timestamp skips that record only.
///
/// Ids from the input are kept when every record has one and none repeat;
/// otherwise all ids are reassigned by input position.
pub fn restore(records: Vec<ObservationRecord>) -> Restored {
    let mut seen = BTreeSet::new();
    let keep_ids = records
        .iter()
        .all(|r| r.id.is_some_and(|id| seen.insert(id)));
    if !keep_ids && records.iter().any(|r| r.id.is_some()) {
        warn!("observation ids missing or repeated, renumbering by position");
    }

    let mut out = Restored::default();
    for (index, record) in records.into_iter().enumerate() {
        let start = match record.start.as_deref() {
            None => Err(SkipReason::MissingTime),
            Some(raw) => {
                parse_timestamp(raw).map_err(|e| SkipReason::InvalidTime(format!("{e:#}")))
            }
        };
        let start = match start {
            Ok(start) => start,
            Err(reason) => {
                warn!(index, camera = %record.camera, ?reason, "skipping observation");
                out.skipped.push(SkippedClip {
                    index,
                    camera: record.camera,
                    reason,
                });
                continue;
            }
        };
        let id = match record.id {
            Some(id) if keep_ids => id,
            _ => ObservationId(index as u32),
        };
        let mut observation = Observation {
            id,
            camera: record.camera,
            start,
            duration_secs: record.duration_secs,
            source: record.source,
            frames: record.frames,
        };
        observation.index_frames();
        out.observations.push(observation);
    }
    out
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedDetection {
    pub detection: Detection,
    pub verdict: IdentityVerdict,
    pub track: TrackId,
}

impl TrackedDetection {
    pub fn participant(&self, observation: ObservationId) -> ParticipantKey {
        match self.verdict.identity {
            IdentityRef::Known(id) => ParticipantKey::Known(id),
            IdentityRef::Ephemeral | IdentityRef::Unresolved => {
                ParticipantKey::Unidentified(EphemeralKey {
                    observation,
                    track: self.track,
                })
            }
        }
    }
}

/// One video after identity resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    #[serde(default)]
    pub id: ObservationId,
    pub camera: String,
    pub start: NaiveDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub frames: Vec<Vec<TrackedDetection>>,
}

impl Observation {
    /// Set each detection's `frame_index` from its frame's position.
    pub fn index_frames(&mut self) {
        index_frames(&mut self.frames, |tracked| &mut tracked.detection);
    }

    pub fn detections(&self) -> impl Iterator<Item = &TrackedDetection> {
        self.frames.iter().flatten()
    }

    pub fn detection_count(&self) -> usize {
        self.frames.iter().map(Vec::len).sum()
    }

    pub fn participants(&self) -> ParticipantSet {
        let mut set = ParticipantSet::default();
        for det in self.detections() {
            set.insert(det.participant(self.id));
        }
        set
    }
}

/// Participants of an observation or session, split by resolution state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParticipantSet {
    pub known: BTreeSet<IdentityId>,
    pub unidentified: BTreeSet<EphemeralKey>,
}

impl ParticipantSet {
    pub fn insert(&mut self, key: ParticipantKey) {
        match key {
            ParticipantKey::Known(id) => {
                self.known.insert(id);
            }
            ParticipantKey::Unidentified(key) => {
                self.unidentified.insert(key);
            }
        }
    }

    pub fn union_with(&mut self, other: &ParticipantSet) {
        self.known.extend(other.known.iter().copied());
        self.unidentified.extend(other.unidentified.iter().copied());
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty() && self.unidentified.is_empty()
    }

    pub fn len(&self) -> usize {
        self.known.len() + self.unidentified.len()
    }

    pub fn shares_known_with(&self, other: &ParticipantSet) -> bool {
        !self.known.is_disjoint(&other.known)
    }

    /// Non-empty and every participant resolved to a known identity.
    pub fn is_only_known(&self) -> bool {
        !self.known.is_empty() && self.unidentified.is_empty()
    }

    /// Non-empty and nobody resolved.
    pub fn is_only_unidentified(&self) -> bool {
        self.known.is_empty() && !self.unidentified.is_empty()
    }
}

// ── Ordering ─────────────────────────────────────────────────────────────────

/// Anything that can be placed on the global timeline.
pub trait Timestamped {
    fn start(&self) -> NaiveDateTime;
    fn camera(&self) -> &str;
}

impl Timestamped for Clip {
    fn start(&self) -> NaiveDateTime {
        self.start
    }
    fn camera(&self) -> &str {
        &self.camera
    }
}

impl Timestamped for Observation {
    fn start(&self) -> NaiveDateTime {
        self.start
    }
    fn camera(&self) -> &str {
        &self.camera
    }
}

/// Puts a stream into the order session fusion requires: stable by start
/// time, then camera name.
pub struct StreamSorter;

impl StreamSorter {
    pub fn sort<T: Timestamped>(items: &mut [T]) {
        if !Self::is_sorted(items) {
            warn!(count = items.len(), "input stream out of order, sorting");
        }
        items.sort_by(|a, b| {
            a.start()
                .cmp(&b.start())
                .then_with(|| a.camera().cmp(b.camera()))
        });
        if let (Some(first), Some(last)) = (items.first(), items.last()) {
            let span = last.start() - first.start();
            info!(
                count = items.len(),
                from = %first.start(),
                to = %last.start(),
                span_secs = span.num_seconds(),
                "stream sorted"
            );
        }
    }

    pub fn is_sorted<T: Timestamped>(items: &[T]) -> bool {
        items.windows(2).all(|w| {
            (w[0].start(), w[0].camera()) <= (w[1].start(), w[1].camera())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::BBox;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 9, 1)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn observation(id: u32, camera: &str, start: NaiveDateTime) -> Observation {
        Observation {
            id: ObservationId(id),
            camera: camera.into(),
            start,
            duration_secs: None,
            source: None,
            frames: Vec::new(),
        }
    }

    #[test]
    fn parses_supported_timestamp_formats() {
        assert_eq!(parse_timestamp("2025-09-01 09:00:15").unwrap(), at(9, 0, 15));
        assert_eq!(parse_timestamp("2025-09-01T09:00:15").unwrap(), at(9, 0, 15));
        assert_eq!(
            parse_timestamp("2025-09-01T09:00:15+00:00").unwrap(),
            at(9, 0, 15)
        );
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn ingest_skips_bad_records_and_keeps_positions() {
        let raw = r#"[
            {"cam": "doorbell", "time": "2025-09-01 09:00:00",
             "people_detected": [[{"bbox": [0, 0, 10, 20], "confidence": 0.9}], []]},
            {"camera": "yard", "time": "2025-09-01 09:01:00", "frames": null},
            {"camera": "hall", "frames": [[]]},
            {"camera": "hall", "time": "noon", "frames": [[]]},
            {"camera": "hall", "time": "2025-09-01 09:02:00", "frames": [[], [{"bbox": [0, 0, 5, 5], "confidence": 0.5}]]}
        ]"#;
        let records: Vec<ClipRecord> = serde_json::from_str(raw).unwrap();
        let ingested = ingest(records);

        let ids: Vec<_> = ingested.clips.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![ObservationId(0), ObservationId(4)]);
        assert_eq!(ingested.clips[1].frames[1][0].frame_index, 1);

        let reasons: Vec<_> = ingested.skipped.iter().map(|s| &s.reason).collect();
        assert_eq!(reasons[0], &SkipReason::DecodeFailed);
        assert_eq!(reasons[1], &SkipReason::MissingTime);
        assert!(matches!(reasons[2], SkipReason::InvalidTime(_)));
        assert_eq!(ingested.skipped[2].index, 3);
    }

    const TRACKED: &str = r#"{"detection": {"bbox": [0, 0, 10, 20], "confidence": 0.9},
        "verdict": {"identity": {"kind": "ephemeral"}, "method": "new", "confidence": 0.0},
        "track": 1}"#;

    #[test]
    fn restore_skips_bad_timestamps_and_indexes_frames() {
        let raw = format!(
            r#"[
                {{"camera": "hall", "start": "2025-09-01 09:00:00", "frames": [[], [{TRACKED}]]}},
                {{"camera": "yard", "start": "noon", "frames": []}},
                {{"camera": "yard", "frames": []}}
            ]"#
        );
        let records: Vec<ObservationRecord> = serde_json::from_str(&raw).unwrap();
        let restored = restore(records);

        assert_eq!(restored.observations.len(), 1);
        let hall = &restored.observations[0];
        assert_eq!(hall.start, at(9, 0, 0));
        assert_eq!(hall.frames[1][0].detection.frame_index, 1);

        let reasons: Vec<_> = restored.skipped.iter().map(|s| &s.reason).collect();
        assert!(matches!(reasons[0], SkipReason::InvalidTime(_)));
        assert_eq!(reasons[1], &SkipReason::MissingTime);
        assert_eq!(restored.skipped[1].index, 2);
    }

    #[test]
    fn restore_keeps_unique_ids_and_renumbers_otherwise() {
        let record = |id: Option<u32>| ObservationRecord {
            id: id.map(ObservationId),
            camera: "hall".into(),
            start: Some("2025-09-01 09:00:00".into()),
            duration_secs: None,
            source: None,
            frames: Vec::new(),
        };
        let ids = |records| -> Vec<u32> {
            restore(records).observations.iter().map(|o| o.id.0).collect()
        };

        assert_eq!(ids(vec![record(Some(7)), record(Some(3))]), vec![7, 3]);
        assert_eq!(ids(vec![record(Some(7)), record(Some(7))]), vec![0, 1]);
        assert_eq!(ids(vec![record(Some(7)), record(None)]), vec![0, 1]);
    }

    #[test]
    fn sorter_is_stable_by_time_then_camera() {
        let mut stream = vec![
            observation(0, "yard", at(9, 0, 30)),
            observation(1, "hall", at(9, 0, 30)),
            observation(2, "doorbell", at(9, 0, 0)),
            observation(3, "hall", at(9, 0, 30)),
        ];
        assert!(!StreamSorter::is_sorted(&stream));
        StreamSorter::sort(&mut stream);
        let ids: Vec<u32> = stream.iter().map(|o| o.id.0).collect();
        assert_eq!(ids, vec![2, 1, 3, 0]);
        assert!(StreamSorter::is_sorted(&stream));
    }

    #[test]
    fn participants_split_known_and_unidentified() {
        let det = Detection::new(BBox::new(0.0, 0.0, 1.0, 1.0), 0.9, 0);
        let mut obs = observation(7, "hall", at(9, 0, 0));
        obs.frames = vec![vec![
            TrackedDetection {
                detection: det.clone(),
                verdict: IdentityVerdict::face(3, 0.9),
                track: 1,
            },
            TrackedDetection {
                detection: det.clone(),
                verdict: IdentityVerdict::ephemeral(),
                track: 2,
            },
            TrackedDetection {
                detection: det,
                verdict: IdentityVerdict::unresolved(),
                track: 2,
            },
        ]];
        let set = obs.participants();
        assert_eq!(set.known.iter().copied().collect::<Vec<_>>(), vec![3]);
        assert_eq!(set.unidentified.len(), 1);
        assert!(!set.is_only_known());
        assert!(!set.is_only_unidentified());
        assert_eq!(obs.detection_count(), 3);
    }

    #[test]
    fn empty_set_is_neither_only_known_nor_only_unidentified() {
        let set = ParticipantSet::default();
        assert!(set.is_empty());
        assert!(!set.is_only_known());
        assert!(!set.is_only_unidentified());
    }
}
