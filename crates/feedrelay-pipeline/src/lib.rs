//! Item processing for feedrelay.
//!
//! Fetched items move through a [`Pipeline`] of named stages, one item at a
//! time. The [`Poller`] fetches pages from upstream under the credential
//! rotator and the `upstream-fetch` circuit, then hands each item to the
//! pipeline. A failing item never stops the poller; only running out of
//! accepted credentials does.
//!
//! # Example
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//!
//! use feedrelay_core::{MemorySeenStore, PlainRenderer, RealClock, WorkItem};
//! use feedrelay_pipeline::{
//!     standard_pipeline, Delivery, PipelineConfig, StandardStages,
//! };
//! # use feedrelay_reliability::DeliveryQueue;
//!
//! # async fn example(queue: Arc<DeliveryQueue>) -> feedrelay_pipeline::Result<()> {
//! let pipeline = standard_pipeline(
//!     PipelineConfig::default(),
//!     Arc::new(RealClock::new()),
//!     StandardStages {
//!         seen: Arc::new(MemorySeenStore::new()),
//!         renderer: Arc::new(PlainRenderer),
//!         topics: Vec::new(),
//!         max_age: Duration::from_secs(3600),
//!         send_options: Default::default(),
//!         delivery: Delivery::Queued(queue),
//!     },
//! )?;
//!
//! let result = pipeline.process(WorkItem::new("42", "rust", "chan-1", "hello")).await;
//! assert!(result.success);
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod error;
pub mod poller;
pub mod stage;
pub mod stages;

pub use engine::{Pipeline, PipelineConfig, PipelineResult};
pub use error::{PipelineError, Result, StageError};
pub use poller::{PollReport, Poller, PollerConfig};
pub use stage::{
    stage_fn, StageContext, StageExecutor, StageFn, StageOutcome, StagePolicy, StageReport,
    StageStatus,
};
pub use stages::{
    standard_pipeline, AgeWindowStage, DedupStage, Delivery, EnqueueStage, KeywordFilterStage,
    RenderStage, SendStage, StandardStages, ValidateStage,
};
