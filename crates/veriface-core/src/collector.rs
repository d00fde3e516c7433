//! Frame-collection sessions — bounded windows of per-frame samples.
//!
//! A verification request does not trust a single frame. The collector
//! accumulates one [`FrameSample`] per processed camera frame until either a
//! frame-count target or a wall-clock bound is hit, then aggregates once:
//! live ratio, average age, majority gender. Every offered frame counts,
//! live or not — the session reports a reliability ratio instead of only
//! ever seeing successes.
//!
//! Lifecycle is an explicit state machine (`Idle → Collecting → Finalized`)
//! rather than shared boolean flags; transitions happen only through the
//! methods here, and a second `start` while collecting is rejected instead
//! of silently merging sessions.

use std::time::{Duration, Instant};

use crate::types::FrameSample;

/// Termination policy for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectMode {
    /// Stop at a target number of frames. The duration bound still applies
    /// as a hard safety cap so a stalled detector cannot hang the request.
    Count { target_frames: usize },
    /// Stop when the window elapses.
    Time,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CollectorError {
    #[error("a collection session is already active")]
    AlreadyCollecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Collecting,
    Finalized,
}

/// Terminal aggregation of one session.
#[derive(Debug, Clone)]
pub struct CollectionResult {
    pub total_frames: usize,
    pub live_frames: usize,
    /// `live_frames / total_frames`, 0 when the session saw no frames.
    pub live_ratio: f32,
    /// Whether the session as a whole counts as live, per the configured
    /// ratio threshold.
    pub is_live_session: bool,
    /// Mean of the samples that carried an age estimate.
    pub average_age: Option<u32>,
    /// Majority gender over samples that carried one (1 = male, 0 = female).
    /// A tie resolves to 0.
    pub majority_gender: Option<u8>,
    pub elapsed: Duration,
}

impl CollectionResult {
    /// True when the session ended without a single processed face.
    pub fn no_face_detected(&self) -> bool {
        self.total_frames == 0
    }
}

/// Single-consumer session accumulator. One per camera source; the owner is
/// responsible for not sharing it across sessions (see the engine's
/// busy-flag handling).
pub struct FrameCollector {
    state: State,
    mode: CollectMode,
    max_duration: Duration,
    live_ratio_threshold: f32,
    started_at: Instant,
    samples: Vec<FrameSample>,
}

impl FrameCollector {
    /// `live_ratio_threshold` is the deployment knob deciding when a session
    /// counts as live (0.5 for permissive kiosks, 0.9 for recognize flows).
    pub fn new(live_ratio_threshold: f32) -> Self {
        Self {
            state: State::Idle,
            mode: CollectMode::Time,
            max_duration: Duration::ZERO,
            live_ratio_threshold,
            started_at: Instant::now(),
            samples: Vec::new(),
        }
    }

    pub fn is_collecting(&self) -> bool {
        self.state == State::Collecting
    }

    /// Begin a session. `max_duration` is the hard wall-clock cap enforced in
    /// both modes. Rejected while a session is already collecting — callers
    /// must check [`is_collecting`](Self::is_collecting) first.
    pub fn start(&mut self, mode: CollectMode, max_duration: Duration) -> Result<(), CollectorError> {
        if self.state == State::Collecting {
            return Err(CollectorError::AlreadyCollecting);
        }
        self.state = State::Collecting;
        self.mode = mode;
        self.max_duration = max_duration;
        self.started_at = Instant::now();
        self.samples.clear();
        tracing::debug!(?mode, max_duration_ms = max_duration.as_millis() as u64, "collection started");
        Ok(())
    }

    /// Append a sample. No-op unless collecting. Every sample counts toward
    /// a count target regardless of its liveness verdict.
    pub fn offer(&mut self, sample: FrameSample) {
        if self.state != State::Collecting {
            return;
        }
        self.samples.push(sample);
    }

    /// Whether a termination bound has been reached: the count target in
    /// count mode, or the duration cap in either mode.
    pub fn is_done(&self) -> bool {
        if self.state != State::Collecting {
            return false;
        }
        let count_done = match self.mode {
            CollectMode::Count { target_frames } => self.samples.len() >= target_frames,
            CollectMode::Time => false,
        };
        count_done || self.started_at.elapsed() >= self.max_duration
    }

    /// Close the session and compute the aggregate, exactly once.
    ///
    /// # Panics
    ///
    /// Calling before `start` or after a previous `finalize` is a programmer
    /// error. An empty sample buffer is valid and yields a "no face
    /// detected" result instead.
    pub fn finalize(&mut self) -> CollectionResult {
        assert!(
            self.state == State::Collecting,
            "finalize() outside an active collection session"
        );
        self.state = State::Finalized;

        let elapsed = self.started_at.elapsed();
        let total = self.samples.len();
        let live = self.samples.iter().filter(|s| s.is_live).count();
        let live_ratio = if total > 0 {
            live as f32 / total as f32
        } else {
            0.0
        };

        let ages: Vec<u32> = self.samples.iter().filter_map(|s| s.age).collect();
        let average_age = if ages.is_empty() {
            None
        } else {
            Some(ages.iter().sum::<u32>() / ages.len() as u32)
        };

        let genders: Vec<u8> = self.samples.iter().filter_map(|s| s.gender).collect();
        let majority_gender = if genders.is_empty() {
            None
        } else {
            let male = genders.iter().filter(|&&g| g == 1).count();
            // Strict majority for male; a tie resolves to the other bucket.
            Some(if male * 2 > genders.len() { 1 } else { 0 })
        };

        let result = CollectionResult {
            total_frames: total,
            live_frames: live,
            live_ratio,
            is_live_session: total > 0 && live_ratio >= self.live_ratio_threshold,
            average_age,
            majority_gender,
            elapsed,
        };
        tracing::debug!(
            total,
            live,
            live_ratio,
            is_live = result.is_live_session,
            "collection finalized"
        );
        result
    }

    /// Drain the accumulated samples after finalizing (e.g. to feed their
    /// embeddings into identity matching).
    pub fn take_samples(&mut self) -> Vec<FrameSample> {
        std::mem::take(&mut self.samples)
    }
}
