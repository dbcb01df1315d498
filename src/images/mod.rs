//! Environment images and the mapping that locates them.
//!
//! [`ImageBuilder`] runs once per split, offline, and fills the
//! [`ImageMappingStore`]; evaluation only ever reads the store.

pub mod builder;
pub mod store;

pub use builder::{
    environment_image_name, BuildFailure, BuildOptions, BuildReport, EnvironmentBuildSpec,
    ImageBuilder,
};
pub use store::{ImageMappingStore, RecordOutcome};
