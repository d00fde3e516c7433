//! veriface-core — depth liveness analysis, session aggregation, and
//! identity matching for the Veriface kiosk daemon.
//!
//! Everything here is pure computation: the depth sensor, the face model and
//! the vector store are consumed through the traits in [`types`] and
//! [`matcher`], so the whole pipeline is testable with synthetic fixtures.

pub mod collector;
pub mod depth;
pub mod liveness;
pub mod matcher;
pub mod types;

pub use collector::{CollectMode, CollectionResult, FrameCollector};
pub use depth::DepthFrame;
pub use liveness::{check_liveness, LivenessScores, LivenessVerdict};
pub use matcher::{match_multiple, match_single, EmbeddingSearch, MatchResult};
pub use types::{Detection, Embedding, FaceBox, FrameSample, Landmarks};
