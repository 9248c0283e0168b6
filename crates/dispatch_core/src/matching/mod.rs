pub mod ranker;
pub mod scoring;
pub mod types;

pub use ranker::{AreaLimit, CandidateRanker, RankRequest};
pub use scoring::{score, ScoreComponents};
pub use types::{CandidatePoolSnapshot, OverlayInfo, RankOrder, RankedCandidate};
