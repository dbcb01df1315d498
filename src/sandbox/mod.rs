//! Sandboxes: descriptors for environment images and the containers
//! started from them.

pub mod descriptor;
pub mod executor;
pub mod provisioner;

pub use descriptor::{descriptor_file_name, load_descriptor, SandboxDescriptor};
pub use executor::Sandbox;
pub use provisioner::SandboxProvisioner;
