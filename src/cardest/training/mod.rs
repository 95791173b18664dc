pub mod checkpoint;
pub mod meters;
pub mod optimizer;
pub mod schedule;
pub mod train;

pub use checkpoint::{find_checkpoint, CheckpointMeta};
pub use optimizer::{ModelOptimizer, StepOptimizer};
pub use schedule::{LrPolicy, LrPolicyChoice, SteppedScheduler};
pub use train::{EpochOutcome, Split, TrainConfig, Trainer};
