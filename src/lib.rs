//! alnsweep - genome alignment orchestration and filtering.
//!
//! Drives the FastGA alignment toolchain through a process boundary,
//! streams its output one complete query at a time with backpressure,
//! stores alignments in a compact binary container, and reduces raw
//! alignment sets with a plane-sweep filter engine.

pub mod catalog;
pub mod codec; // Binary alignment container (AlnReader/AlnWriter)
pub mod config;
pub mod defaults;
pub mod error;
pub mod paf; // Tabular alignment format parse/format
pub mod pipeline; // External aligner driver
pub mod record;
pub mod schema_guard;
pub mod stream; // Backpressure-safe query streaming
pub mod sweep; // Plane-sweep filter engine

pub use catalog::SequenceCatalog;
pub use codec::{AlnReader, AlnWriter};
pub use config::{FilterConfig, OutputFormat, PipelineConfig, ScorePolicy};
pub use error::{Error, Result};
pub use pipeline::{AlignmentOutput, Pipeline, Stage};
pub use record::{AlignmentRecord, Strand};
pub use stream::{QueryAlignmentSet, QueryStream};
pub use sweep::FilterStats;
