//! Core data model for ebfleet.
//!
//! Build status records are shared by every worker building the same
//! platform prefix. Package specs are derived from recipes on every pass
//! and never persisted.

mod package;
mod status;

pub use package::{Dependency, PackageSpec, ToolchainRef};
pub use status::{BuildStatus, BuildStatusRecord, MissingModule, MissingModules, StatusDocument};
