//! unitopt: adaptive optimization and caching for binary program units.
//!
//! A host loader hands every unit it is about to define to
//! [`PipelineContext::transform`]; the pipeline rewrites it with a fixed
//! sequence of structural passes, verifies the result twice, and caches it
//! across three tiers. Any failure returns the caller's bytes unchanged.
//!
//! # Architecture
//!
//! ```text
//! context - PipelineContext: the owned entry point
//!   ├── unit - unit model, binary codec, digests
//!   ├── analyzer - CFG, reachability, dominators, loops, stack depth
//!   ├── passes - the ordered pass pipeline
//!   ├── integrity - pre-validation and double verification
//!   ├── transform - one sandboxed decode/optimize/verify run
//!   ├── pool - CPU workers with watchdog, background I/O thread
//!   ├── cache - L1 hot map, L2 mmap views, L3 index + WAL + artifacts
//!   ├── governor - state machine, failure ledger, cascade, canaries, heap
//!   ├── dependency - cross-unit invalidation graph
//!   └── accelerator - load-order recording and startup prewarm
//! ```
//!
//! # Feature Flags
//!
//! - `test-utils`: counter reset, `PipelineContext::reset_for_testing` and
//!   synthetic passes for failure scenarios.

pub mod accelerator;
pub mod analyzer;
pub mod cache;
pub mod config;
pub mod context;
pub mod dependency;
pub mod error;
pub mod governor;
pub mod integrity;
pub mod loader;
pub mod metrics;
pub mod passes;
pub mod persist;
pub mod pool;
pub mod sandbox;
pub mod transform;
pub mod unit;

#[cfg(test)]
mod tests;

pub use config::PipelineConfig;
pub use context::PipelineContext;
pub use error::{OptimizerError, Rejection, TransformError};
pub use governor::OptimizerState;
pub use loader::{FactProvider, LoaderContext, StaticFacts};
pub use metrics::MetricsSnapshot;
pub use passes::{Pass, PassPipeline};
pub use unit::UnitIr;
