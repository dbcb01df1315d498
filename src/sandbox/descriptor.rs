//! Sandbox descriptor: a one-service compose file for an environment image.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::SandboxError;

/// Name of the single service in every descriptor.
pub const DEFAULT_SERVICE: &str = "default";

/// Long-lived no-op so the container stays up between execs.
pub const KEEP_ALIVE_COMMAND: &str = "tail -f /dev/null";

/// A service definition in the descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorService {
    pub image: String,
    pub command: String,
    pub working_dir: String,
    /// Marks the image as local so it is never pulled.
    #[serde(rename = "x-local", default)]
    pub x_local: bool,
}

/// Compose-format description of a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxDescriptor {
    pub services: BTreeMap<String, DescriptorService>,
}

impl SandboxDescriptor {
    pub fn for_image(image: &str, working_dir: &str) -> Self {
        let mut services = BTreeMap::new();
        services.insert(
            DEFAULT_SERVICE.to_string(),
            DescriptorService {
                image: image.to_string(),
                command: KEEP_ALIVE_COMMAND.to_string(),
                working_dir: working_dir.to_string(),
                x_local: true,
            },
        );
        Self { services }
    }

    /// The `default` service.
    pub fn service(&self) -> Result<&DescriptorService, SandboxError> {
        self.services.get(DEFAULT_SERVICE).ok_or_else(|| {
            SandboxError::InvalidDescriptor(format!("no '{DEFAULT_SERVICE}' service"))
        })
    }

    pub fn to_yaml(&self) -> Result<String, SandboxError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn from_yaml(content: &str) -> Result<Self, SandboxError> {
        Ok(serde_yaml::from_str(content)?)
    }
}

/// File name of the descriptor for `image`.
///
/// Characters outside `[A-Za-z0-9._-]` become `-`, so the tag separator
/// stays filesystem safe. Sanitizing can fold distinct names together, so
/// the stem is suffixed with a digest of the unsanitized name.
pub fn descriptor_file_name(image: &str) -> String {
    let safe: String = image
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let digest = hex::encode(Sha256::digest(image.as_bytes()));
    format!("{safe}.{}.yaml", &digest[..12])
}

/// Read a descriptor back from disk.
pub fn load_descriptor(path: &Path) -> Result<SandboxDescriptor, SandboxError> {
    if !path.exists() {
        return Err(SandboxError::DescriptorMissing(path.display().to_string()));
    }
    let content = std::fs::read_to_string(path)?;
    SandboxDescriptor::from_yaml(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_yaml_layout() {
        let descriptor = SandboxDescriptor::for_image("sweb.env.a.1.0:latest", "/testbed");
        let yaml = descriptor.to_yaml().unwrap();
        let value: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        let service = &value["services"]["default"];
        assert_eq!(service["image"].as_str(), Some("sweb.env.a.1.0:latest"));
        assert_eq!(service["command"].as_str(), Some("tail -f /dev/null"));
        assert_eq!(service["working_dir"].as_str(), Some("/testbed"));
        assert_eq!(service["x-local"].as_bool(), Some(true));

        assert_eq!(SandboxDescriptor::from_yaml(&yaml).unwrap(), descriptor);
    }

    #[test]
    fn test_descriptor_file_name_is_sanitized() {
        let name = descriptor_file_name("sweb.env.pvlib__pvlib-python.0.9.abc:latest");
        assert!(name.starts_with("sweb.env.pvlib__pvlib-python.0.9.abc-latest."));
        assert!(name.ends_with(".yaml"));
        assert!(descriptor_file_name("reg/ns/img:1").starts_with("reg-ns-img-1."));
        assert_eq!(
            descriptor_file_name("reg/ns/img:1"),
            descriptor_file_name("reg/ns/img:1")
        );
    }

    #[test]
    fn test_descriptor_file_names_do_not_collide() {
        // Both sanitize to `sweb.env.x-latest`.
        assert_ne!(
            descriptor_file_name("sweb.env.x:latest"),
            descriptor_file_name("sweb.env.x-latest")
        );
    }

    #[test]
    fn test_missing_default_service() {
        let descriptor = SandboxDescriptor::from_yaml("services: {}\n").unwrap();
        assert!(matches!(
            descriptor.service(),
            Err(SandboxError::InvalidDescriptor(_))
        ));
    }

    #[test]
    fn test_load_missing_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_descriptor(&dir.path().join("nope.yaml")),
            Err(SandboxError::DescriptorMissing(_))
        ));
    }
}
