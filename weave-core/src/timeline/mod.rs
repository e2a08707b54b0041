//! timeline — ordered, camera-tagged appearance summary for narrative generation
//!
//! One entry per observation with at least one detection, in stream order.
//! Each entry lists who appeared, how long, and whether they moved.  Text
//! rendering is left to the consumer.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::detection::BBox;
use crate::event::ParticipantId;
use crate::identity::Role;
use crate::observation::{Observation, ObservationId, TrackedDetection};

/// Share of the first box's width/height the centre must travel to count as
/// movement.
const MOVEMENT_FRACTION: f32 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activity {
    Low,
    Medium,
    High,
}

impl Activity {
    /// `frame_span` is `last_frame - first_frame`; a zero span has no density.
    pub fn classify(detections: usize, frame_span: u32) -> Self {
        let density = if frame_span > 0 {
            detections as f64 / frame_span as f64
        } else {
            0.0
        };
        if density > 0.8 && detections > 10 {
            Activity::High
        } else if density > 0.5 && detections > 5 {
            Activity::Medium
        } else {
            Activity::Low
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraZone {
    Outdoor,
    Indoor,
}

impl CameraZone {
    /// Guess from the camera name.  Outdoor keywords are checked first.
    pub fn of(camera: &str) -> Option<Self> {
        let name = camera.to_lowercase();
        if ["outdoor", "doorbell", "gate", "yard"]
            .iter()
            .any(|k| name.contains(k))
        {
            Some(CameraZone::Outdoor)
        } else if ["indoor", "living", "room", "hall"]
            .iter()
            .any(|k| name.contains(k))
        {
            Some(CameraZone::Indoor)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpatialHint {
    OutdoorToIndoor,
    IndoorToOutdoor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Appearance {
    pub participant: ParticipantId,
    pub role: Role,
    pub detections: usize,
    pub first_frame: u32,
    pub last_frame: u32,
    pub moving: bool,
    pub activity: Activity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub observation: ObservationId,
    pub time: NaiveDateTime,
    pub camera: String,
    pub appearances: Vec<Appearance>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    pub entries: Vec<TimelineEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spatial_hint: Option<SpatialHint>,
}

impl Timeline {
    /// `label` maps each detection to its event participant and role.
    pub fn build<F>(observations: &[Observation], mut label: F) -> Self
    where
        F: FnMut(&Observation, &TrackedDetection) -> (ParticipantId, Role),
    {
        let mut entries = Vec::new();
        for obs in observations {
            let mut seen: BTreeMap<ParticipantId, (Role, Vec<(u32, BBox)>)> = BTreeMap::new();
            for det in obs.detections() {
                let (participant, role) = label(obs, det);
                seen.entry(participant)
                    .or_insert_with(|| (role, Vec::new()))
                    .1
                    .push((det.detection.frame_index, det.detection.bbox));
            }
            if seen.is_empty() {
                continue;
            }
            let appearances = seen
                .into_iter()
                .map(|(participant, (role, boxes))| appearance(participant, role, &boxes))
                .collect();
            entries.push(TimelineEntry {
                observation: obs.id,
                time: obs.start,
                camera: obs.camera.clone(),
                appearances,
            });
        }
        let spatial_hint = spatial_hint(&entries);
        Self {
            entries,
            spatial_hint,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn appearance(participant: ParticipantId, role: Role, boxes: &[(u32, BBox)]) -> Appearance {
    let first_frame = boxes.iter().map(|(f, _)| *f).min().unwrap_or(0);
    let last_frame = boxes.iter().map(|(f, _)| *f).max().unwrap_or(0);
    Appearance {
        participant,
        role,
        detections: boxes.len(),
        first_frame,
        last_frame,
        moving: is_moving(boxes),
        activity: Activity::classify(boxes.len(), last_frame - first_frame),
    }
}

fn is_moving(boxes: &[(u32, BBox)]) -> bool {
    let Some((_, first)) = boxes.first() else {
        return false;
    };
    if boxes.len() < 2 || first.width() <= 0.0 || first.height() <= 0.0 {
        return false;
    }
    let (mut min_x, mut max_x) = (f32::INFINITY, f32::NEG_INFINITY);
    let (mut min_y, mut max_y) = (f32::INFINITY, f32::NEG_INFINITY);
    for (_, b) in boxes {
        min_x = min_x.min(b.center_x());
        max_x = max_x.max(b.center_x());
        min_y = min_y.min(b.center_y());
        max_y = max_y.max(b.center_y());
    }
    max_x - min_x > first.width() * MOVEMENT_FRACTION
        || max_y - min_y > first.height() * MOVEMENT_FRACTION
}

fn spatial_hint(entries: &[TimelineEntry]) -> Option<SpatialHint> {
    let first_in = |zone| {
        entries
            .iter()
            .position(|e| CameraZone::of(&e.camera) == Some(zone))
    };
    match (first_in(CameraZone::Outdoor), first_in(CameraZone::Indoor)) {
        (Some(outdoor), Some(indoor)) if outdoor < indoor => Some(SpatialHint::OutdoorToIndoor),
        (Some(_), Some(_)) => Some(SpatialHint::IndoorToOutdoor),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::Detection;
    use crate::identity::IdentityVerdict;
    use chrono::NaiveDate;

    fn obs(id: u32, camera: &str, boxes: &[(u32, BBox)]) -> Observation {
        let max_frame = boxes.iter().map(|(f, _)| *f).max().map_or(0, |f| f as usize + 1);
        let mut frames = vec![Vec::new(); max_frame];
        for (f, bbox) in boxes {
            frames[*f as usize].push(TrackedDetection {
                detection: Detection::new(*bbox, 0.9, *f),
                verdict: IdentityVerdict::face(1, 0.9),
                track: 1,
            });
        }
        Observation {
            id: ObservationId(id),
            camera: camera.into(),
            start: NaiveDate::from_ymd_opt(2025, 9, 1)
                .unwrap()
                .and_hms_opt(9, 0, id)
                .unwrap(),
            duration_secs: None,
            source: None,
            frames,
        }
    }

    fn family(_: &Observation, _: &TrackedDetection) -> (ParticipantId, Role) {
        (ParticipantId::Known(1), Role::Family)
    }

    #[test]
    fn activity_thresholds() {
        assert_eq!(Activity::classify(11, 12), Activity::High);
        assert_eq!(Activity::classify(10, 10), Activity::Medium);
        assert_eq!(Activity::classify(6, 20), Activity::Low);
        assert_eq!(Activity::classify(1, 0), Activity::Low);
    }

    #[test]
    fn camera_zones_from_names() {
        assert_eq!(CameraZone::of("Doorbell"), Some(CameraZone::Outdoor));
        assert_eq!(CameraZone::of("backyard"), Some(CameraZone::Outdoor));
        assert_eq!(CameraZone::of("indoor_living"), Some(CameraZone::Indoor));
        assert_eq!(CameraZone::of("hallway"), Some(CameraZone::Indoor));
        assert_eq!(CameraZone::of("garage"), None);
    }

    #[test]
    fn movement_is_relative_to_first_box() {
        let still = [
            (0, BBox::new(0.0, 0.0, 100.0, 200.0)),
            (1, BBox::new(10.0, 0.0, 110.0, 200.0)),
        ];
        let walking = [
            (0, BBox::new(0.0, 0.0, 100.0, 200.0)),
            (1, BBox::new(30.0, 0.0, 130.0, 200.0)),
        ];
        let timeline = Timeline::build(&[obs(0, "hall", &still), obs(1, "hall", &walking)], family);
        assert!(!timeline.entries[0].appearances[0].moving);
        assert!(timeline.entries[1].appearances[0].moving);
        assert_eq!(timeline.entries[1].appearances[0].last_frame, 1);
    }

    #[test]
    fn empty_observations_have_no_entry() {
        let timeline = Timeline::build(&[obs(0, "hall", &[])], family);
        assert!(timeline.is_empty());
        assert_eq!(timeline.spatial_hint, None);
    }

    #[test]
    fn spatial_hint_follows_first_appearance_order() {
        let b = [(0, BBox::new(0.0, 0.0, 10.0, 10.0))];
        let inward = Timeline::build(&[obs(0, "doorbell", &b), obs(1, "indoor_living", &b)], family);
        assert_eq!(inward.spatial_hint, Some(SpatialHint::OutdoorToIndoor));
        let outward = Timeline::build(&[obs(0, "hall", &b), obs(1, "gate", &b)], family);
        assert_eq!(outward.spatial_hint, Some(SpatialHint::IndoorToOutdoor));
        let single = Timeline::build(&[obs(0, "gate", &b), obs(1, "yard", &b)], family);
        assert_eq!(single.spatial_hint, None);
    }
}
