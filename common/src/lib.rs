pub mod api;
pub mod batch;
pub mod filename;
pub mod grouping;
pub mod job;
pub mod job_log;
pub mod object_store;
pub mod report;
pub mod task;
pub mod timebounds;

pub use batch::{partition, Batch, BatchBudget, SkipSignal};
pub use filename::{EccoFilename, FilenameError};
pub use grouping::{
    load_grouping_dir, Dimension, Grouping, GroupingError, GroupingStore, InMemoryGroupingStore,
};
pub use job::{
    parse_job_file, parse_job_line, resolve_job_lines, Frequency, GroupingId, JobFile, JobLine,
    JobParseError, JobSpec, JobTuple, ProductType, TimeStep, TimeSteps,
};
pub use job_log::{
    BatchRef, CostTier, FailedTimeStep, InvocationId, InvocationOutcome, InvocationRecord,
    InvocationStatus, JobLog, JobLogError, RunSummary,
};
pub use object_store::{LocalStore, ObjectStore, StoreError};
pub use report::{LogLine, PerformanceReport};
pub use task::{DynamicMetadata, GranuleNaming, SourceFileRef, Task};
pub use timebounds::{ModelCalendar, TimeBounds, TimeBoundsCalculator};
