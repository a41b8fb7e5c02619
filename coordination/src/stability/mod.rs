//! Segment stability tracking and requirement generation
//!
//! ```text
//!  segment edit ──▶ StabilityTracker ──▶ similarity history per (question, segment)
//!                         │
//!            question_stability(q) = all segments stable
//!                         │
//!  generate(q) ──▶ RequirementGenerator ──▶ scheduler (Requirement priority)
//!                         │
//!       still current & not discarded? ──▶ publish, clear question
//! ```
//!
//! | Latest similarity        | Two-point trend | Classification      |
//! |--------------------------|-----------------|---------------------|
//! | no history               | -               | stable (no updates) |
//! | > high (0.8)             | any             | stable              |
//! | > moderate (0.7)         | non-decreasing  | stable (trend)      |
//! | otherwise                | -               | unstable            |

pub mod generation;
pub mod similarity;
pub mod tracker;

pub use generation::{
    GenerationError, GenerationOutcome, GenerationResult, Requirement, RequirementGenerator,
    SegmentText, TriggerMode,
};
pub use similarity::text_similarity;
pub use tracker::{
    QuestionStability, SegmentStability, SharedStabilityTracker, SimilarityPoint,
    SimilarityUpdate, StabilityReason, StabilityTracker,
};
