//! refine — session-scoped identity reconciliation with full-session hindsight
//!
//! Two passes, both confined to one session and neither touching the
//! persistent identity cache:
//!
//! 1. **Promotion.**  An unidentified participant whose body matches a face
//!    confirmed *later* in the same session is relabelled to that identity
//!    with method `refined`.
//! 2. **Stranger dedup.**  Remaining unidentified participants whose body
//!    centroids match are unioned into one group so a person who lost their
//!    tracklet between cameras is counted once.  Two participants seen in the
//!    same frame of the same observation are never unioned, directly or
//!    transitively.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::debug;

use crate::detection::Embedding;
use crate::fusion::Session;
use crate::identity::{nearest, IdentityId, IdentityRef, IdentityVerdict, MatchMethod, SimilarityMatch};
use crate::observation::{EphemeralKey, ObservationId, ParticipantKey};

// ── DisjointSet ──────────────────────────────────────────────────────────────

/// Union-find over `0..n` with path compression and union by rank.
#[derive(Debug, Clone)]
pub struct DisjointSet {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSet {
    pub fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    pub fn len(&self) -> usize {
        self.parent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }

    pub fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut node = x;
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }
        root
    }

    /// Returns the surviving root, or `None` if already joined.
    pub fn union(&mut self, a: usize, b: usize) -> Option<usize> {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return None;
        }
        let (root, child) = match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => (rb, ra),
            std::cmp::Ordering::Greater => (ra, rb),
            std::cmp::Ordering::Equal => {
                self.rank[ra] += 1;
                (ra, rb)
            }
        };
        self.parent[child] = root;
        Some(root)
    }
}

// ── Output ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Promotion {
    pub participant: EphemeralKey,
    pub identity: IdentityId,
    pub similarity: f32,
}

/// A session after reconciliation, ready for aggregation.
#[derive(Debug, Clone)]
pub struct RefinedSession {
    pub session: Session,
    /// Unidentified participants grouped as one person each, ordered by first
    /// appearance.  Members within a group are sorted.
    pub groups: Vec<Vec<EphemeralKey>>,
    pub promotions: Vec<Promotion>,
}

impl RefinedSession {
    /// Index into `groups` for an unidentified participant.
    pub fn group_of(&self, key: &EphemeralKey) -> Option<usize> {
        self.groups.iter().position(|g| g.binary_search(key).is_ok())
    }
}

// ── IdentityRefiner ──────────────────────────────────────────────────────────

/// Where a detection sits inside a session: observation index, frame index.
type Position = (usize, u32);

#[derive(Default)]
struct Appearance {
    first: Option<Position>,
    positions: BTreeSet<(ObservationId, u32)>,
    bodies: Vec<(Position, Embedding)>,
}

#[derive(Debug, Clone)]
pub struct IdentityRefiner {
    body_threshold: f32,
}

impl IdentityRefiner {
    pub fn new(body_threshold: f32) -> Self {
        Self { body_threshold }
    }

    pub fn refine(&self, mut session: Session) -> RefinedSession {
        let promotions = self.promote(&mut session);
        session.recompute_participants();
        let groups = self.dedup_strangers(&session);
        debug!(
            observations = session.len(),
            promotions = promotions.len(),
            stranger_groups = groups.len(),
            "session refined"
        );
        RefinedSession {
            session,
            groups,
            promotions,
        }
    }

    fn unidentified(session: &Session) -> BTreeMap<EphemeralKey, Appearance> {
        let mut out: BTreeMap<EphemeralKey, Appearance> = BTreeMap::new();
        for (oi, obs) in session.observations().iter().enumerate() {
            for det in obs.detections() {
                let ParticipantKey::Unidentified(key) = det.participant(obs.id) else {
                    continue;
                };
                let pos = (oi, det.detection.frame_index);
                let entry = out.entry(key).or_default();
                entry.first = Some(entry.first.map_or(pos, |f| f.min(pos)));
                entry.positions.insert((obs.id, det.detection.frame_index));
                if let Some(body) = &det.detection.body {
                    entry.bodies.push((pos, body.clone()));
                }
            }
        }
        out
    }

    fn promote(&self, session: &mut Session) -> Vec<Promotion> {
        let mut anchors: Vec<(Position, IdentityId, &Embedding)> = Vec::new();
        // Frames each known identity already occupies.
        let mut occupied: BTreeMap<IdentityId, BTreeSet<(ObservationId, u32)>> = BTreeMap::new();
        for (oi, obs) in session.observations().iter().enumerate() {
            for det in obs.detections() {
                let IdentityRef::Known(id) = det.verdict.identity else {
                    continue;
                };
                occupied
                    .entry(id)
                    .or_default()
                    .insert((obs.id, det.detection.frame_index));
                if let (MatchMethod::Face, Some(body)) = (det.verdict.method, &det.detection.body) {
                    anchors.push(((oi, det.detection.frame_index), id, body));
                }
            }
        }
        if anchors.is_empty() {
            return Vec::new();
        }

        let mut promotions = Vec::new();
        for (key, appearance) in Self::unidentified(session) {
            // Skip identities already present in one of this track's frames.
            let free = |identity: &IdentityId| {
                occupied
                    .get(identity)
                    .map_or(true, |taken| taken.is_disjoint(&appearance.positions))
            };
            let candidates = appearance.bodies.iter().flat_map(|(pos, body)| {
                anchors
                    .iter()
                    .filter(move |(anchor_pos, identity, _)| anchor_pos > pos && free(identity))
                    .map(move |(_, identity, anchor)| SimilarityMatch {
                        identity: *identity,
                        similarity: body.cosine(anchor),
                    })
            });
            if let Some(best) = nearest(candidates) {
                if best.similarity >= self.body_threshold {
                    occupied
                        .entry(best.identity)
                        .or_default()
                        .extend(appearance.positions.iter().copied());
                    promotions.push(Promotion {
                        participant: key,
                        identity: best.identity,
                        similarity: best.similarity,
                    });
                }
            }
        }

        for promotion in &promotions {
            let key = promotion.participant;
            for obs in session.observations_mut() {
                if obs.id != key.observation {
                    continue;
                }
                for det in obs.frames.iter_mut().flatten() {
                    if det.track == key.track && !det.verdict.identity.is_known() {
                        det.verdict = IdentityVerdict {
                            identity: IdentityRef::Known(promotion.identity),
                            method: MatchMethod::Refined,
                            confidence: promotion.similarity,
                            suspected: None,
                        };
                    }
                }
            }
            debug!(
                observation = key.observation.0,
                track = key.track,
                identity = promotion.identity,
                similarity = promotion.similarity,
                "unidentified participant promoted"
            );
        }
        promotions
    }

    fn dedup_strangers(&self, session: &Session) -> Vec<Vec<EphemeralKey>> {
        let appearances = Self::unidentified(session);
        let keys: Vec<EphemeralKey> = appearances.keys().copied().collect();
        let centroids: Vec<Option<Embedding>> =
            appearances.values().map(|a| centroid(&a.bodies)).collect();
        let mut positions: Vec<BTreeSet<(ObservationId, u32)>> =
            appearances.values().map(|a| a.positions.clone()).collect();

        let mut pairs = Vec::new();
        for i in 0..keys.len() {
            for j in i + 1..keys.len() {
                if let (Some(a), Some(b)) = (&centroids[i], &centroids[j]) {
                    let similarity = a.cosine(b);
                    if similarity >= self.body_threshold {
                        pairs.push((similarity, i, j));
                    }
                }
            }
        }
        pairs.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.cmp(&b.1))
                .then(a.2.cmp(&b.2))
        });

        let mut sets = DisjointSet::new(keys.len());
        for (similarity, i, j) in pairs {
            let (ri, rj) = (sets.find(i), sets.find(j));
            if ri == rj || !positions[ri].is_disjoint(&positions[rj]) {
                continue;
            }
            if let Some(root) = sets.union(ri, rj) {
                let other = if root == ri { rj } else { ri };
                let moved = std::mem::take(&mut positions[other]);
                positions[root].extend(moved);
                debug!(
                    a = ?keys[i],
                    b = ?keys[j],
                    similarity,
                    "unidentified participants merged"
                );
            }
        }

        let mut grouped: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for i in 0..keys.len() {
            let root = sets.find(i);
            grouped.entry(root).or_default().push(i);
        }
        let firsts: Vec<Option<Position>> = appearances.values().map(|a| a.first).collect();
        let mut groups: Vec<(Option<Position>, Vec<EphemeralKey>)> = grouped
            .into_values()
            .map(|members| {
                let first = members.iter().filter_map(|&m| firsts[m]).min();
                let mut members: Vec<EphemeralKey> = members.iter().map(|&m| keys[m]).collect();
                members.sort();
                (first, members)
            })
            .collect();
        groups.sort();
        groups.into_iter().map(|(_, keys)| keys).collect()
    }
}

/// Normalised mean of the body embeddings sharing the first one's dimension.
fn centroid(bodies: &[(Position, Embedding)]) -> Option<Embedding> {
    let dim = bodies.first()?.1.dim();
    let mut sum = vec![0.0f32; dim];
    for (_, body) in bodies.iter().filter(|(_, b)| b.dim() == dim) {
        for (acc, v) in sum.iter_mut().zip(body.as_slice()) {
            *acc += v;
        }
    }
    Some(Embedding::new(sum))
}
