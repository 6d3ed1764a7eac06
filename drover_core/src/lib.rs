pub mod config;
pub mod engine;
pub mod error;
pub mod parser;
pub mod process;
pub mod result;
pub mod service;
pub mod session;
pub mod task;
pub mod workspace;

#[cfg(test)]
mod testing;

pub use config::DroverConfig;
pub use engine::{Engine, EngineBackend, EngineIdentity, EngineKind};
pub use error::EngineError;
pub use parser::{Signal, SignalAccumulator, parse_line};
pub use process::{ProcessCommand, ProcessExit, ProcessHandle, ProcessRunner, Termination};
pub use result::{
    CoverageCounts, CoverageInfo, CrashArtifact, CrashDescriptor, EngineResult,
    ReproductionResult,
};
pub use service::{EngineService, FuzzingRun, OperationHandle};
pub use session::{SessionId, SessionRecord, SessionRegistry, SessionStatus};
pub use task::FuzzingTask;
pub use workspace::Workspace;
