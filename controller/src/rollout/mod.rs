mod engine;
pub(crate) mod stages;
pub mod supervisor;

pub use engine::{EngineCtx, RolloutConfig, RolloutEngine};
