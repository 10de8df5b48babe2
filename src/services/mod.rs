pub mod evaluation;
pub mod recommendation;
pub mod training;

pub use evaluation::EvaluationService;
pub use recommendation::{RecommendationService, ServingState};
pub use training::{TrainingOutcome, TrainingService, TrainingStats};
