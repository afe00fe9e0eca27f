//! Parameter-sweep job orchestration: run many variants of one external
//! program, each in its own working directory, on a bounded set of workers.

pub mod collab;
pub mod descriptor;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod fsutil;
pub mod inject;
pub mod isolate;
pub mod process;
pub mod summary;
pub mod sweepfile;

pub use collab::{
    setup_fn, setup_fn_no_context, CommandPostProcess, FileSetup, NoFramePlots, PlotReport,
    PostProcess, PostProcessContext, PostProcessRegistry, Setup, SetupRegistry,
};
pub use descriptor::{
    ExecutionResult, Failure, JobDescriptor, JobStatus, OverwritePolicy, Phase, SetupRef,
};
pub use dispatch::{partition, DispatchConfig, Dispatcher, Strategy, SweepReport, DEFAULT_GRACE_PERIOD};
pub use error::{FailureKind, Result, SweepError};
pub use executor::JobExecutor;
pub use inject::{ConfigObject, ParameterInjector};
pub use isolate::{JobConsole, JobScope, OutputIsolator};
pub use summary::{parse_records, ParsedSummary, SummaryLog, SummaryRecord, SummaryTally};
pub use sweepfile::{SweepFile, SweepPlan};
