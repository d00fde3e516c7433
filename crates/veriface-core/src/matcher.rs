//! Identity matching — per-identity similarity averaging and multi-image
//! voting over an injected search backend.
//!
//! The search backend is the vector-database black box: given a probe
//! embedding it returns nearest-neighbor candidates already filtered to
//! `similarity >= threshold`. The aggregator assumes nothing about the score
//! scale beyond "higher is better" and "must exceed the threshold to count",
//! and performs no I/O of its own — inject a fake backend to unit-test it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::types::Embedding;

/// Candidates requested per probe embedding.
pub const SEARCH_LIMIT: usize = 5;
/// Cap on images consulted by [`match_multiple`].
pub const DEFAULT_MAX_IMAGES: usize = 10;

/// One nearest-neighbor hit from the search backend.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub identity_key: String,
    pub similarity: f32,
}

/// Error from the search backend. Opaque by design — the backend may be a
/// remote vector database or an in-process gallery.
#[derive(Debug, thiserror::Error)]
#[error("search backend error: {0}")]
pub struct SearchError(pub String);

/// Nearest-neighbor search seam.
pub trait EmbeddingSearch {
    /// Return up to `limit` candidates with similarity at or above the
    /// backend's configured score threshold, best first.
    fn search(&self, probe: &Embedding, limit: usize) -> Result<Vec<Candidate>, SearchError>;
}

/// Structured outcome of an identity-matching pass.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub matched: bool,
    pub identity_key: Option<String>,
    /// Mean similarity backing the decision, 0 on no-match.
    pub confidence: f32,
    /// Number of images that voted for the winning identity.
    pub matched_images: usize,
    pub elapsed: Duration,
    /// Human-readable reason on no-match (a normal negative outcome, not an
    /// error).
    pub reason: Option<String>,
}

impl MatchResult {
    fn no_match(reason: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            matched: false,
            identity_key: None,
            confidence: 0.0,
            matched_images: 0,
            elapsed,
            reason: Some(reason.into()),
        }
    }
}

/// Match a single probe embedding against the stored identities.
///
/// Groups the backend's candidates by identity key, averages similarity per
/// key, and picks the best average; the average must itself exceed
/// `threshold`. Zero candidates is a no-match, not an error. Backend errors
/// propagate — that request fails, the caller decides what to do.
pub fn match_single(
    probe: &Embedding,
    search: &dyn EmbeddingSearch,
    threshold: f32,
) -> Result<MatchResult, SearchError> {
    let started = Instant::now();
    let candidates = search.search(probe, SEARCH_LIMIT)?;
    if candidates.is_empty() {
        return Ok(MatchResult::no_match(
            "no stored identity above threshold",
            started.elapsed(),
        ));
    }

    let mut per_identity: HashMap<String, (f32, usize)> = HashMap::new();
    for candidate in candidates {
        let entry = per_identity.entry(candidate.identity_key).or_insert((0.0, 0));
        entry.0 += candidate.similarity;
        entry.1 += 1;
    }

    let mut best: Option<(String, f32)> = None;
    for (identity, (total, count)) in per_identity {
        let avg = total / count as f32;
        match &best {
            Some((_, best_avg)) if avg <= *best_avg => {}
            _ => best = Some((identity, avg)),
        }
    }

    let elapsed = started.elapsed();
    match best {
        Some((identity, avg)) if avg > threshold => Ok(MatchResult {
            matched: true,
            identity_key: Some(identity),
            confidence: avg,
            matched_images: 1,
            elapsed,
            reason: None,
        }),
        _ => Ok(MatchResult::no_match(
            "best average similarity below threshold",
            elapsed,
        )),
    }
}

/// Match multiple probe embeddings and vote.
///
/// At most `max_images` embeddings are consulted (prefix, with a warning).
/// Each image matches independently; images whose search fails are skipped,
/// not fatal. The winning identity per image becomes one vote; most votes
/// wins, and a vote tie breaks toward the higher mean confidence. Zero
/// productive images is a no-match.
pub fn match_multiple(
    probes: &[Embedding],
    search: &dyn EmbeddingSearch,
    threshold: f32,
    max_images: usize,
) -> MatchResult {
    let started = Instant::now();
    if probes.is_empty() {
        return MatchResult::no_match("no images provided", started.elapsed());
    }

    let probes = if probes.len() > max_images {
        tracing::warn!(
            requested = probes.len(),
            max_images,
            "too many images; consulting the prefix only"
        );
        &probes[..max_images]
    } else {
        probes
    };

    // identity -> confidences of the images it won
    let mut votes: HashMap<String, Vec<f32>> = HashMap::new();
    for (index, probe) in probes.iter().enumerate() {
        match match_single(probe, search, threshold) {
            Ok(result) if result.matched => {
                let identity = result
                    .identity_key
                    .expect("matched result always carries an identity");
                votes.entry(identity).or_default().push(result.confidence);
            }
            Ok(_) => {
                tracing::debug!(index, "image produced no identity above threshold");
            }
            Err(err) => {
                // Partial failure is tolerated: skip this image, keep going.
                tracing::warn!(index, error = %err, "image skipped during multi-image match");
            }
        }
    }

    if votes.is_empty() {
        return MatchResult::no_match(
            "no image produced a matching identity",
            started.elapsed(),
        );
    }

    let mut best: Option<(String, usize, f32)> = None;
    for (identity, confidences) in votes {
        let count = confidences.len();
        let mean = confidences.iter().sum::<f32>() / count as f32;
        let better = match &best {
            None => true,
            Some((_, best_count, best_mean)) => {
                count > *best_count || (count == *best_count && mean > *best_mean)
            }
        };
        if better {
            best = Some((identity, count, mean));
        }
    }

    let (identity, vote_count, mean_confidence) =
        best.expect("non-empty vote map yields a winner");
    tracing::info!(
        identity = %identity,
        votes = vote_count,
        of = probes.len(),
        confidence = mean_confidence,
        "multi-image match decided"
    );

    MatchResult {
        matched: true,
        identity_key: Some(identity),
        confidence: mean_confidence,
        matched_images: vote_count,
        elapsed: started.elapsed(),
        reason: None,
    }
}

/// In-process search backend over a loaded gallery.
///
/// Stands in for the vector database: the caller fetches all stored
/// embeddings once, then probes run a full cosine scan — every entry is
/// compared, no early exit — filtered to the score threshold and truncated
/// to the limit, best first.
pub struct GallerySearch {
    entries: Vec<GalleryEntry>,
    score_threshold: f32,
}

#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub identity_key: String,
    pub embedding: Embedding,
}

impl GallerySearch {
    pub fn new(entries: Vec<GalleryEntry>, score_threshold: f32) -> Self {
        Self {
            entries,
            score_threshold,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl EmbeddingSearch for GallerySearch {
    fn search(&self, probe: &Embedding, limit: usize) -> Result<Vec<Candidate>, SearchError> {
        let mut hits: Vec<Candidate> = self
            .entries
            .iter()
            .map(|entry| Candidate {
                identity_key: entry.identity_key.clone(),
                similarity: probe.similarity(&entry.embedding),
            })
            .filter(|c| c.similarity >= self.score_threshold)
            .collect();
        hits.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        hits.truncate(limit);
        Ok(hits)
    }
}
