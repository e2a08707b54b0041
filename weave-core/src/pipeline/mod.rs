use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use rayon::prelude::*;
use serde::Serialize;
use tracing::info;

use crate::cache::{CacheBackend, IdentityCache, MemoryCache};
use crate::config::EngineConfig;
use crate::detection::BBox;
use crate::event::{Event, EventAggregator};
use crate::fusion::{FusionPolicy, Session, SessionManager};
use crate::identity::{FaceGallery, Gallery, IdentityArbiter};
use crate::observation::{
    ingest, Clip, ClipRecord, Observation, SkippedClip, StreamSorter, TrackedDetection,
};
use crate::refine::IdentityRefiner;
use crate::tracking::{FrameTracker, TrackDecision, TrackerStats};

// ── Per-video analysis ───────────────────────────────────────────────────────

/// Tracker + arbiter for one video at a time.  The cache is shared, so every
/// arbitration takes its lock and cache writes stay serialized.
pub struct VideoAnalyzer<'a, G: FaceGallery, B: CacheBackend> {
    arbiter: &'a IdentityArbiter<G>,
    cache: &'a Mutex<IdentityCache<B>>,
    tracker: FrameTracker,
    prof_frames: u64,
    prof_arbitrate: Duration,
}

impl<'a, G: FaceGallery, B: CacheBackend> VideoAnalyzer<'a, G, B> {
    pub fn new(
        arbiter: &'a IdentityArbiter<G>,
        cache: &'a Mutex<IdentityCache<B>>,
        tracker: FrameTracker,
    ) -> Self {
        Self {
            arbiter,
            cache,
            tracker,
            prof_frames: 0,
            prof_arbitrate: Duration::ZERO,
        }
    }

    /// Resolve every detection of `clip`.  Tracker state starts fresh.
    pub fn analyze(&mut self, clip: Clip) -> Observation {
        self.tracker.reset();
        let mut frames = Vec::with_capacity(clip.frames.len());

        for frame in clip.frames {
            let boxes: Vec<BBox> = frame.iter().map(|d| d.bbox).collect();
            let decisions = self.tracker.assign(&boxes);

            let mut tracked = Vec::with_capacity(frame.len());
            for (detection, decision) in frame.into_iter().zip(decisions) {
                let (track, verdict) = match decision {
                    TrackDecision::Reuse { track, verdict } => (track, verdict),
                    TrackDecision::Arbitrate { track } => {
                        let started = Instant::now();
                        let verdict = {
                            let mut cache =
                                self.cache.lock().unwrap_or_else(PoisonError::into_inner);
                            self.arbiter
                                .resolve(detection.evidence(), &mut *cache, clip.start)
                        };
                        self.prof_arbitrate += started.elapsed();
                        self.tracker.record_verdict(track, verdict.clone());
                        (track, verdict)
                    }
                };
                tracked.push(TrackedDetection {
                    detection,
                    verdict,
                    track,
                });
            }
            frames.push(tracked);

            self.prof_frames += 1;
            if self.prof_frames % 300 == 0 {
                info!(
                    frames = self.prof_frames,
                    arbitrate_ms_per_frame = format!(
                        "{:.2}",
                        self.prof_arbitrate.as_secs_f64() * 1000.0 / self.prof_frames as f64
                    ),
                    "analyzer timings"
                );
            }
        }

        let stats = self.tracker.stats();
        info!(
            observation = clip.id.0,
            camera = %clip.camera,
            frames = frames.len(),
            detections = stats.detections,
            arbitrations = stats.arbitrations,
            reuses = stats.reuses,
            skip_ratio = format!("{:.2}", stats.skip_ratio()),
            "video analyzed"
        );

        Observation {
            id: clip.id,
            camera: clip.camera,
            start: clip.start,
            duration_secs: clip.duration_secs,
            source: clip.source,
            frames,
        }
    }

    /// Tracker counters for the most recent video.
    pub fn stats(&self) -> TrackerStats {
        self.tracker.stats()
    }
}

// ── Fusion ───────────────────────────────────────────────────────────────────

/// Sort, fuse into sessions, refine, aggregate.
#[derive(Debug, Clone)]
pub struct EventFusionPipeline {
    policy: FusionPolicy,
    refiner: IdentityRefiner,
    aggregator: EventAggregator,
}

impl EventFusionPipeline {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            policy: FusionPolicy::new(config.fusion.clone()),
            refiner: IdentityRefiner::new(config.identity.body_threshold),
            aggregator: EventAggregator::new(),
        }
    }

    pub fn fuse(&self, mut observations: Vec<Observation>) -> Vec<Event> {
        // Co-occurrence checks key on frame position.
        for obs in &mut observations {
            obs.index_frames();
        }
        StreamSorter::sort(&mut observations);
        let total = observations.len();
        let mut manager = SessionManager::new(self.policy.clone());
        let mut events = Vec::new();
        for obs in observations {
            if let Some(session) = manager.push(obs) {
                events.push(self.finalize(session));
            }
        }
        if let Some(session) = manager.finish() {
            events.push(self.finalize(session));
        }
        info!(observations = total, events = events.len(), "fusion complete");
        events
    }

    fn finalize(&self, session: Session) -> Event {
        let refined = self.refiner.refine(session);
        self.aggregator.aggregate(&refined)
    }
}

impl Default for EventFusionPipeline {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// One video after another in stream order.  Reproducible.
    #[default]
    Sequential,
    /// Independent videos on the rayon pool.  Cache writes are still
    /// serialized, but which video refreshes the cache first may vary.
    Parallel,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub events: Vec<Event>,
    pub skipped: Vec<SkippedClip>,
    pub observations: usize,
    pub stats: TrackerStats,
}

/// End-to-end processing for one run: clips in, events out.
pub struct Engine<G: FaceGallery = Gallery, B: CacheBackend = MemoryCache> {
    config: EngineConfig,
    arbiter: IdentityArbiter<G>,
    cache: Mutex<IdentityCache<B>>,
    fusion: EventFusionPipeline,
}

impl<G: FaceGallery> Engine<G, MemoryCache> {
    pub fn in_memory(config: EngineConfig, gallery: G) -> Self {
        let cache = IdentityCache::new(
            MemoryCache::new(),
            config.identity.cache_validity(),
            config.store.retry_policy(),
        );
        Self::with_cache(config, gallery, cache)
    }
}

impl<G: FaceGallery, B: CacheBackend> Engine<G, B> {
    pub fn with_cache(config: EngineConfig, gallery: G, cache: IdentityCache<B>) -> Self {
        let arbiter = IdentityArbiter::new(
            gallery,
            config.identity.clone(),
            config.store.retry_policy(),
        );
        let fusion = EventFusionPipeline::new(&config);
        Self {
            config,
            arbiter,
            cache: Mutex::new(cache),
            fusion,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Track and arbitrate every clip.  Output order matches `clips`.
    pub fn analyze(&self, clips: Vec<Clip>, mode: ExecutionMode) -> (Vec<Observation>, TrackerStats) {
        let run = |clip: Clip| {
            let mut analyzer = VideoAnalyzer::new(
                &self.arbiter,
                &self.cache,
                FrameTracker::new(self.config.tracker.clone()),
            );
            let observation = analyzer.analyze(clip);
            (observation, analyzer.stats())
        };
        let analyzed: Vec<(Observation, TrackerStats)> = match mode {
            ExecutionMode::Sequential => clips.into_iter().map(run).collect(),
            ExecutionMode::Parallel => clips.into_par_iter().map(run).collect(),
        };

        let mut totals = TrackerStats::default();
        let observations = analyzed
            .into_iter()
            .map(|(obs, stats)| {
                totals.merge(&stats);
                obs
            })
            .collect();
        (observations, totals)
    }

    /// Ingest, analyze in stream order, fuse.  Bad clips are reported in the
    /// result, never fatal.
    pub fn run(&self, records: Vec<ClipRecord>, mode: ExecutionMode) -> RunReport {
        let mut ingested = ingest(records);
        info!(
            clips = ingested.clips.len(),
            skipped = ingested.skipped.len(),
            "clips ingested"
        );
        // Chronological analysis so face confirmations reach the cache before
        // later body-only sightings look for them.
        StreamSorter::sort(&mut ingested.clips);
        let (observations, stats) = self.analyze(ingested.clips, mode);
        let count = observations.len();
        let events = self.fusion.fuse(observations);
        info!(
            detections = stats.detections,
            arbitrations = stats.arbitrations,
            skip_ratio = format!("{:.2}", stats.skip_ratio()),
            events = events.len(),
            "run complete"
        );
        RunReport {
            events,
            skipped: ingested.skipped,
            observations: count,
            stats,
        }
    }

    pub fn arbiter(&self) -> &IdentityArbiter<G> {
        &self.arbiter
    }

    pub fn fusion(&self) -> &EventFusionPipeline {
        &self.fusion
    }

    pub fn into_cache(self) -> IdentityCache<B> {
        self.cache.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}
