//! identity — cascading identity arbitration
//!
//! Strongest evidence first:
//!
//! 1. face vs. the registered gallery (the only path allowed to refresh the
//!    identity cache),
//! 2. body vs. still-valid cache entries,
//! 3. give up: an ephemeral, unidentified person.
//!
//! Similarity is cosine throughout; nearest-neighbour ties go to the higher
//! similarity, then the smaller identity id.

use std::cmp::Ordering;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::{CacheBackend, IdentityCache, RetryPolicy};
use crate::config::IdentityConfig;
use crate::detection::{Embedding, Evidence};

pub type IdentityId = u32;

// ── Verdicts ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum IdentityRef {
    Known(IdentityId),
    /// Unidentified person, local to this processing run.
    Ephemeral,
    /// A store lookup failed even after retries; treated as unidentified.
    Unresolved,
}

impl IdentityRef {
    pub fn known(&self) -> Option<IdentityId> {
        match *self {
            IdentityRef::Known(id) => Some(id),
            _ => None,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, IdentityRef::Known(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    Face,
    Body,
    New,
    /// Relabelled after the fact from later evidence in the same session.
    Refined,
}

impl MatchMethod {
    /// Evidence strength used when picking representative detections.
    pub fn rank(self) -> u8 {
        match self {
            MatchMethod::Face => 3,
            MatchMethod::Body => 2,
            MatchMethod::Refined => 1,
            MatchMethod::New => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MatchMethod::Face => "face",
            MatchMethod::Body => "body",
            MatchMethod::New => "new",
            MatchMethod::Refined => "refined",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Family,
    /// Unidentified, but the body looked close to a known identity.
    Suspected,
    Stranger,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityVerdict {
    pub identity: IdentityRef,
    pub method: MatchMethod,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspected: Option<IdentityId>,
}

impl IdentityVerdict {
    pub fn face(identity: IdentityId, similarity: f32) -> Self {
        Self {
            identity: IdentityRef::Known(identity),
            method: MatchMethod::Face,
            confidence: similarity,
            suspected: None,
        }
    }

    pub fn body(identity: IdentityId, similarity: f32) -> Self {
        Self {
            identity: IdentityRef::Known(identity),
            method: MatchMethod::Body,
            confidence: similarity,
            suspected: None,
        }
    }

    pub fn ephemeral() -> Self {
        Self {
            identity: IdentityRef::Ephemeral,
            method: MatchMethod::New,
            confidence: 0.0,
            suspected: None,
        }
    }

    pub fn unresolved() -> Self {
        Self {
            identity: IdentityRef::Unresolved,
            ..Self::ephemeral()
        }
    }

    pub fn role(&self) -> Role {
        match self.identity {
            IdentityRef::Known(_) => Role::Family,
            _ if self.suspected.is_some() => Role::Suspected,
            _ => Role::Stranger,
        }
    }
}

// ── Similarity search ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityMatch {
    pub identity: IdentityId,
    pub similarity: f32,
}

fn compare_matches(a: &SimilarityMatch, b: &SimilarityMatch) -> Ordering {
    a.similarity
        .partial_cmp(&b.similarity)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.identity.cmp(&a.identity))
}

/// Highest similarity, then smallest identity id.
pub fn nearest<I: IntoIterator<Item = SimilarityMatch>>(candidates: I) -> Option<SimilarityMatch> {
    candidates
        .into_iter()
        .filter(|m| !m.similarity.is_nan())
        .max_by(compare_matches)
}

/// Registered known-identity face gallery.
pub trait FaceGallery: Send + Sync {
    fn nearest(&self, face: &Embedding) -> Result<Option<SimilarityMatch>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub identity: IdentityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub embedding: Embedding,
}

/// In-memory gallery; an identity may register several faces.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
}

impl Gallery {
    pub fn new(entries: Vec<GalleryEntry>) -> Self {
        Self { entries }
    }

    /// Load a JSON array of [`GalleryEntry`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read gallery: {}", path.display()))?;
        let entries: Vec<GalleryEntry> = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse gallery: {}", path.display()))?;
        debug!(entries = entries.len(), "face gallery loaded");
        Ok(Self::new(entries))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn name_of(&self, identity: IdentityId) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.identity == identity)
            .and_then(|e| e.name.as_deref())
    }
}

impl FaceGallery for Gallery {
    fn nearest(&self, face: &Embedding) -> Result<Option<SimilarityMatch>> {
        Ok(nearest(self.entries.iter().map(|e| SimilarityMatch {
            identity: e.identity,
            similarity: face.cosine(&e.embedding),
        })))
    }
}

// ── IdentityArbiter ──────────────────────────────────────────────────────────

pub struct IdentityArbiter<G: FaceGallery = Gallery> {
    gallery: G,
    config: IdentityConfig,
    retry: RetryPolicy,
}

impl<G: FaceGallery> IdentityArbiter<G> {
    pub fn new(gallery: G, config: IdentityConfig, retry: RetryPolicy) -> Self {
        Self {
            gallery,
            config,
            retry,
        }
    }

    pub fn config(&self) -> &IdentityConfig {
        &self.config
    }

    pub fn gallery(&self) -> &G {
        &self.gallery
    }

    /// Decide who `evidence` belongs to.  Writes the cache at most once, and
    /// only for a face-confirmed match that carries a body embedding.
    pub fn resolve<B: CacheBackend>(
        &self,
        evidence: Evidence<'_>,
        cache: &mut IdentityCache<B>,
        now: NaiveDateTime,
    ) -> IdentityVerdict {
        let mut lookup_failed = false;

        if let Evidence::Face { face, body } = evidence {
            match self.retry.run("gallery lookup", || self.gallery.nearest(face)) {
                Ok(Some(m)) if m.similarity >= self.config.face_threshold => {
                    if let Some(body) = body {
                        if let Err(e) = cache.write(m.identity, body.clone(), now) {
                            warn!(identity = m.identity, "identity cache write failed: {e:#}");
                        }
                    }
                    debug!(identity = m.identity, similarity = m.similarity, "face match");
                    return IdentityVerdict::face(m.identity, m.similarity);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("gallery lookup failed, treating as no match: {e:#}");
                    lookup_failed = true;
                }
            }
        }

        let mut suspected = None;
        if let Some(body) = evidence.body() {
            match cache.nearest(body, now) {
                Ok(Some(m)) if m.similarity >= self.config.body_threshold => {
                    debug!(identity = m.identity, similarity = m.similarity, "body match");
                    return IdentityVerdict::body(m.identity, m.similarity);
                }
                Ok(Some(m)) => {
                    if self
                        .config
                        .soft_threshold()
                        .is_some_and(|soft| m.similarity > soft)
                    {
                        debug!(
                            identity = m.identity,
                            similarity = m.similarity,
                            "soft body match, flagging as suspected"
                        );
                        suspected = Some(m.identity);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("identity cache lookup failed, treating as no match: {e:#}");
                    lookup_failed = true;
                }
            }
        }

        let verdict = if lookup_failed {
            IdentityVerdict::unresolved()
        } else {
            IdentityVerdict::ephemeral()
        };
        IdentityVerdict {
            suspected,
            ..verdict
        }
    }
}
