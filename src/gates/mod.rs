//! Quality gates for generated artifacts.
//!
//! - `score` - extracts the `Score: N/10` marker from artifact text
//! - `quality` - threshold evaluation, bounded regeneration and the exhausted-gate policy

pub mod quality;
pub mod score;

pub use quality::{
    ConfiguredPolicy, DEFAULT_MAX_ATTEMPTS, DEFAULT_THRESHOLD, GateDecision, GateOutcome,
    GateState, QualityDisposition, QualityGate, QualityPolicy, QualityScore, Regenerate,
    load_artifact,
};
pub use score::{MAX_SCORE, passes, score};
