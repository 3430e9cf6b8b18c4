//! Template builds
//!
//! The coordinator owns build bookkeeping and the drain protocol; the
//! pipeline runs the stages of a single build.

pub mod coordinator;
pub mod pipeline;
pub mod record;

pub use coordinator::{BuildCoordinator, BuildHandle, HealthState};
pub use pipeline::{BuildOutput, TemplateBuilder};
pub use record::{BuildRecord, BuildSpec, BuildStatus};
