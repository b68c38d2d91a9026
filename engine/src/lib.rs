pub mod orchestrator;
pub mod report;

pub use orchestrator::{BackupRequest, Orchestrator, OrchestratorSettings};
pub use report::{ReportEntry, ReportLog, ReportSink};
