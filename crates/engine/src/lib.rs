pub mod decision;
pub mod quiet;

pub use decision::{
    evaluate, DecisionConfig, DecisionInputs, DecisionReason, RebalanceDecision,
};
pub use quiet::QuietWindow;
