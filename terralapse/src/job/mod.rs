//! Job model and persistence.

pub mod record;
pub mod store;

pub use record::{
    ExportFormat, ExportParams, FrameParams, IngestParams, JobId, JobKind, JobParams, JobRecord,
    JobStatus, Quality, UnitKey, UnitStatus, WorkUnit,
};
pub use store::{sweep_terminal, transition, FileJobStore, JobFilter, JobStore, MemoryJobStore, StoreError};
