//! tracking — IoU tracklets that let stable detections skip re-identification
//!
//! Running face + body encoders and a gallery search on every detection of
//! every frame is wasteful: a person standing in front of the doorbell does
//! not change identity between adjacent samples.  The tracker links each
//! detection to a short-lived tracklet by box overlap and decides whether the
//! tracklet's last verdict can be reused or a fresh arbitration is due.
//!
//! Matching is greedy, not globally optimal: candidate pairs are taken by
//! descending IoU, then detection order, then tracklet age.

use serde::Serialize;
use tracing::debug;

use crate::config::TrackerConfig;
use crate::detection::BBox;
use crate::identity::IdentityVerdict;

pub type TrackId = u32;

/// Per-video link between detections of the same physical person.
#[derive(Debug, Clone)]
pub struct Tracklet {
    pub id: TrackId,
    pub bbox: BBox,
    /// Consecutive frames without a matching detection.
    pub age: u32,
    /// Reuses since the last full arbitration.
    pub frames_since_revalidation: u32,
    pub verdict: Option<IdentityVerdict>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrackDecision {
    /// Inherit the tracklet's verdict; no arbitration call.
    Reuse {
        track: TrackId,
        verdict: IdentityVerdict,
    },
    /// Run the identity cascade and report back via
    /// [`FrameTracker::record_verdict`].
    Arbitrate { track: TrackId },
}

impl TrackDecision {
    pub fn track(&self) -> TrackId {
        match *self {
            TrackDecision::Reuse { track, .. } | TrackDecision::Arbitrate { track } => track,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrackerStats {
    pub detections: u64,
    pub arbitrations: u64,
    pub reuses: u64,
    pub tracklets_spawned: u64,
    pub tracklets_expired: u64,
}

impl TrackerStats {
    /// Fraction of detections that skipped arbitration.
    pub fn skip_ratio(&self) -> f64 {
        if self.detections == 0 {
            0.0
        } else {
            self.reuses as f64 / self.detections as f64
        }
    }

    pub fn merge(&mut self, other: &TrackerStats) {
        self.detections += other.detections;
        self.arbitrations += other.arbitrations;
        self.reuses += other.reuses;
        self.tracklets_spawned += other.tracklets_spawned;
        self.tracklets_expired += other.tracklets_expired;
    }
}

pub struct FrameTracker {
    config: TrackerConfig,
    tracklets: Vec<Tracklet>,
    next_id: TrackId,
    stats: TrackerStats,
}

impl FrameTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracklets: Vec::new(),
            next_id: 1,
            stats: TrackerStats::default(),
        }
    }

    /// Match one frame's boxes against the live tracklets.  Returns one
    /// decision per box, in input order.  Call once per sampled frame, even
    /// when the frame is empty, so unmatched tracklets age out.
    pub fn assign(&mut self, boxes: &[BBox]) -> Vec<TrackDecision> {
        let mut pairs: Vec<(f32, usize, usize)> = Vec::new();
        for (d, bbox) in boxes.iter().enumerate() {
            for (t, tracklet) in self.tracklets.iter().enumerate() {
                let iou = bbox.iou(&tracklet.bbox);
                if iou >= self.config.iou_threshold {
                    pairs.push((iou, d, t));
                }
            }
        }
        pairs.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.cmp(&b.1))
                .then(a.2.cmp(&b.2))
        });

        let mut detection_track: Vec<Option<usize>> = vec![None; boxes.len()];
        let mut track_taken = vec![false; self.tracklets.len()];
        for (_, d, t) in pairs {
            if detection_track[d].is_none() && !track_taken[t] {
                detection_track[d] = Some(t);
                track_taken[t] = true;
            }
        }

        // Age and expire the tracklets nobody claimed before spawning new ones.
        for (tracklet, taken) in self.tracklets.iter_mut().zip(&track_taken) {
            if !taken {
                tracklet.age += 1;
            }
        }

        let mut decisions = Vec::with_capacity(boxes.len());
        let mut spawned = Vec::new();
        for (bbox, matched) in boxes.iter().zip(&detection_track) {
            self.stats.detections += 1;
            let decision = match *matched {
                Some(t) => {
                    let tracklet = &mut self.tracklets[t];
                    tracklet.bbox = *bbox;
                    tracklet.age = 0;
                    match &tracklet.verdict {
                        Some(verdict)
                            if tracklet.frames_since_revalidation
                                < self.config.revalidate_interval =>
                        {
                            tracklet.frames_since_revalidation += 1;
                            TrackDecision::Reuse {
                                track: tracklet.id,
                                verdict: verdict.clone(),
                            }
                        }
                        _ => {
                            tracklet.frames_since_revalidation = 0;
                            TrackDecision::Arbitrate { track: tracklet.id }
                        }
                    }
                }
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    spawned.push(Tracklet {
                        id,
                        bbox: *bbox,
                        age: 0,
                        frames_since_revalidation: 0,
                        verdict: None,
                    });
                    self.stats.tracklets_spawned += 1;
                    debug!(track = id, "tracklet spawned");
                    TrackDecision::Arbitrate { track: id }
                }
            };
            match decision {
                TrackDecision::Reuse { .. } => self.stats.reuses += 1,
                TrackDecision::Arbitrate { .. } => self.stats.arbitrations += 1,
            }
            decisions.push(decision);
        }

        let max_age = self.config.max_age;
        let before = self.tracklets.len();
        self.tracklets.retain(|t| {
            let keep = t.age <= max_age;
            if !keep {
                debug!(track = t.id, age = t.age, "tracklet expired");
            }
            keep
        });
        self.stats.tracklets_expired += (before - self.tracklets.len()) as u64;
        self.tracklets.extend(spawned);

        decisions
    }

    /// Store the verdict produced for an `Arbitrate` decision.
    pub fn record_verdict(&mut self, track: TrackId, verdict: IdentityVerdict) {
        if let Some(tracklet) = self.tracklets.iter_mut().find(|t| t.id == track) {
            tracklet.verdict = Some(verdict);
        }
    }

    pub fn tracklets(&self) -> &[Tracklet] {
        &self.tracklets
    }

    pub fn stats(&self) -> TrackerStats {
        self.stats
    }

    /// Forget all tracklets (new video).
    pub fn reset(&mut self) {
        self.tracklets.clear();
        self.next_id = 1;
        self.stats = TrackerStats::default();
    }
}

impl Default for FrameTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityVerdict;

    fn person() -> BBox {
        BBox::new(100.0, 100.0, 200.0, 400.0)
    }

    /// Drive the tracker with a single stationary box, arbitrating whenever
    /// asked.  Returns `true` per frame when arbitration was requested.
    fn run_stationary(tracker: &mut FrameTracker, frames: usize) -> Vec<bool> {
        (0..frames)
            .map(|_| {
                let decisions = tracker.assign(&[person()]);
                match &decisions[0] {
                    TrackDecision::Arbitrate { track } => {
                        tracker.record_verdict(*track, IdentityVerdict::face(1, 0.9));
                        true
                    }
                    TrackDecision::Reuse { verdict, .. } => {
                        assert_eq!(verdict, &IdentityVerdict::face(1, 0.9));
                        false
                    }
                }
            })
            .collect()
    }

    #[test]
    fn reuses_within_revalidation_interval_then_rearbitrates() {
        let mut tracker = FrameTracker::default();
        let arbitrated = run_stationary(&mut tracker, 13);
        // Frame 0 spawns, frames 1..=5 reuse, frame 6 is forced, and so on.
        assert_eq!(
            arbitrated,
            vec![true, false, false, false, false, false, true, false, false, false, false, false, true]
        );
        let stats = tracker.stats();
        assert_eq!(stats.detections, 13);
        assert_eq!(stats.arbitrations, 3);
        assert_eq!(stats.reuses, 10);
        assert_eq!(stats.tracklets_spawned, 1);
    }

    #[test]
    fn low_overlap_spawns_new_tracklet() {
        let mut tracker = FrameTracker::default();
        tracker.assign(&[person()]);
        let moved = BBox::new(150.0, 100.0, 250.0, 400.0); // IoU = 1/3
        let decisions = tracker.assign(&[moved]);
        assert_eq!(decisions, vec![TrackDecision::Arbitrate { track: 2 }]);
        assert_eq!(tracker.tracklets().len(), 2);
    }

    #[test]
    fn matched_tracklet_without_verdict_still_arbitrates() {
        let mut tracker = FrameTracker::default();
        tracker.assign(&[person()]);
        let decisions = tracker.assign(&[person()]);
        assert_eq!(decisions, vec![TrackDecision::Arbitrate { track: 1 }]);
    }

    #[test]
    fn tracklets_expire_after_max_age_unmatched_frames() {
        let mut tracker = FrameTracker::default();
        tracker.assign(&[person()]);
        for _ in 0..3 {
            tracker.assign(&[]);
            assert_eq!(tracker.tracklets().len(), 1);
        }
        tracker.assign(&[]);
        assert!(tracker.tracklets().is_empty());
        assert_eq!(tracker.stats().tracklets_expired, 1);
    }

    #[test]
    fn reappearing_within_max_age_keeps_the_tracklet() {
        let mut tracker = FrameTracker::default();
        run_stationary(&mut tracker, 1);
        tracker.assign(&[]);
        tracker.assign(&[]);
        let decisions = tracker.assign(&[person()]);
        assert!(matches!(decisions[0], TrackDecision::Reuse { track: 1, .. }));
    }

    #[test]
    fn greedy_assignment_prefers_highest_iou_then_detection_order() {
        let mut tracker = FrameTracker::default();
        tracker.assign(&[person()]);
        // Both boxes overlap tracklet 1; the exact copy wins it even though it
        // comes second.
        let near = BBox::new(100.0, 100.0, 200.0, 380.0);
        let decisions = tracker.assign(&[near, person()]);
        assert_eq!(decisions[0], TrackDecision::Arbitrate { track: 2 });
        assert_eq!(decisions[1], TrackDecision::Arbitrate { track: 1 });

        // Equal IoU: the earlier detection wins.
        let mut tracker = FrameTracker::default();
        tracker.assign(&[person()]);
        let decisions = tracker.assign(&[person(), person()]);
        assert_eq!(decisions[0].track(), 1);
        assert_eq!(decisions[1].track(), 2);
    }

    #[test]
    fn reset_clears_state() {
        let mut tracker = FrameTracker::default();
        run_stationary(&mut tracker, 3);
        tracker.reset();
        assert!(tracker.tracklets().is_empty());
        assert_eq!(tracker.stats(), TrackerStats::default());
        let decisions = tracker.assign(&[person()]);
        assert_eq!(decisions[0].track(), 1);
    }

    #[test]
    fn skip_ratio_handles_empty_stats() {
        assert_eq!(TrackerStats::default().skip_ratio(), 0.0);
    }
}
