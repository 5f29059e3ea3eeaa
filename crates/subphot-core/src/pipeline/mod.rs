mod orchestrator;
mod pool;
mod processor;
mod stage;
mod types;

pub use orchestrator::{discover_frames, StageCoordinator};
pub use pool::WorkerPool;
pub use processor::{CommandProcessor, StageProcessor};
pub use stage::{Stage, StageGraph, SubtractionMethod};
pub use types::{
    BatchReport, NoOpReporter, ProgressReporter, ReferenceRequest, StageFailure, StageOutput,
    UnitOutcome, WorkUnit,
};
