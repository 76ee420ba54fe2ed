//! Batch extraction of rendered designs from a pool of render host sessions.
//!
//! A caller submits a list of design references. The [`Extractor`] admits the
//! batch, splits it over up to `max_instances` render host sessions, and in
//! every session overlaps payload fetches with a strictly serial render stage.
//! Each design ends up in exactly one bucket: opened, font swap, missing or
//! unopened. A wall-clock deadline bounds the whole batch; when it expires the
//! running sessions are force-terminated and the report carries what settled.
//!
//! The render host itself is abstracted behind [`RenderHost`]: use
//! [`HttpRenderHost`] against a render service, or [`MockRenderHost`] in tests.

pub mod admission;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod error;
pub mod extractor;
pub mod host;
pub mod pipeline;
pub mod report;

// Re-export commonly used types
pub use admission::{AdmissionGate, AdmissionPolicy, ValidatedBatch};
pub use config::ExtractorConfig;
pub use coordinator::{BatchCoordinator, CancellationReason};
pub use domain::outcome::{
    FailedDesign, FontSwapDesign, Outcome, RenderReply, RenderResult, RenderedDesign,
    ShardOutcomes,
};
pub use domain::reference::{Reference, ReferenceNormalizer, RenderHint};
pub use domain::shard::{SessionId, Shard, partition};
pub use error::{BroadsideError, Result};
pub use extractor::Extractor;
pub use host::{
    HttpRenderHost, HttpRenderHostConfig, MockCall, MockCallKind, MockRenderHost, RenderHost,
    RenderSession,
};
pub use pipeline::{ItemPipeline, PipelineConfig, PipelineRun};
pub use report::{
    BatchReport, ExtractionReport, FileLog, MemoryLog, OpenedDesign, OutcomeCounts,
    ReportAggregator, SideEffectLog,
};
