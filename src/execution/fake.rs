//! In-memory [`ContainerRuntime`] for unit tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{ContainerRuntime, ContainerSpec, ExecResult};
use crate::error::DockerError;

type ExecHandler = Box<dyn Fn(&str) -> ExecResult + Send + Sync>;

pub(crate) struct FakeRuntime {
    pub images: Mutex<BTreeSet<String>>,
    pub builds: Mutex<Vec<String>>,
    pub containers: Mutex<BTreeMap<String, ContainerSpec>>,
    pub removed: Mutex<Vec<String>>,
    pub scripts: Mutex<Vec<String>>,
    /// Uploaded files keyed by (container id, path).
    pub files: Mutex<BTreeMap<(String, String), String>>,
    pub commands: Mutex<Vec<Vec<String>>>,
    pub failing_builds: BTreeSet<String>,
    pub silent_failures: BTreeSet<String>,
    pub exec_delay: Option<Duration>,
    handler: ExecHandler,
    next_id: AtomicUsize,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            images: Mutex::new(BTreeSet::new()),
            builds: Mutex::new(Vec::new()),
            containers: Mutex::new(BTreeMap::new()),
            removed: Mutex::new(Vec::new()),
            scripts: Mutex::new(Vec::new()),
            files: Mutex::new(BTreeMap::new()),
            commands: Mutex::new(Vec::new()),
            failing_builds: BTreeSet::new(),
            silent_failures: BTreeSet::new(),
            exec_delay: None,
            handler: Box::new(|_| ExecResult::default()),
            next_id: AtomicUsize::new(0),
        }
    }

    pub fn with_image(self, image: &str) -> Self {
        self.images.lock().unwrap().insert(image.to_string());
        self
    }

    /// Answer every exec with `handler(script)`, where `script` is the
    /// uploaded file the command names, or its last argument.
    pub fn with_handler(
        mut self,
        handler: impl Fn(&str) -> ExecResult + Send + Sync + 'static,
    ) -> Self {
        self.handler = Box::new(handler);
        self
    }

    pub fn build_count(&self) -> usize {
        self.builds.lock().unwrap().len()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn build_image(
        &self,
        tag: &str,
        context: Vec<u8>,
        _nocache: bool,
    ) -> Result<(), DockerError> {
        assert!(!context.is_empty(), "build context must not be empty");
        self.builds.lock().unwrap().push(tag.to_string());
        if self.failing_builds.contains(tag) {
            return Err(DockerError::BuildFailed(format!("{tag}: exit code 1")));
        }
        if !self.silent_failures.contains(tag) {
            self.images.lock().unwrap().insert(tag.to_string());
        }
        Ok(())
    }

    async fn list_images(&self) -> Result<BTreeSet<String>, DockerError> {
        Ok(self.images.lock().unwrap().clone())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, DockerError> {
        if !self.images.lock().unwrap().contains(&spec.image) {
            return Err(DockerError::RunFailed(format!("No such image: {}", spec.image)));
        }
        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.containers
            .lock()
            .unwrap()
            .insert(id.clone(), spec.clone());
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), DockerError> {
        if !self.containers.lock().unwrap().contains_key(id) {
            return Err(DockerError::ContainerNotFound { id: id.to_string() });
        }
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), DockerError> {
        self.containers
            .lock()
            .unwrap()
            .remove(id)
            .ok_or_else(|| DockerError::ContainerNotFound { id: id.to_string() })?;
        self.removed.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn upload_file(&self, id: &str, path: &str, contents: &[u8]) -> Result<(), DockerError> {
        if !self.containers.lock().unwrap().contains_key(id) {
            return Err(DockerError::ContainerNotFound { id: id.to_string() });
        }
        self.files.lock().unwrap().insert(
            (id.to_string(), path.to_string()),
            String::from_utf8_lossy(contents).into_owned(),
        );
        Ok(())
    }

    async fn exec(&self, id: &str, cmd: &[&str]) -> Result<ExecResult, DockerError> {
        if !self.containers.lock().unwrap().contains_key(id) {
            return Err(DockerError::ContainerNotFound { id: id.to_string() });
        }
        self.commands
            .lock()
            .unwrap()
            .push(cmd.iter().map(|s| s.to_string()).collect());
        if let Some(delay) = self.exec_delay {
            tokio::time::sleep(delay).await;
        }
        let last = cmd.last().copied().unwrap_or_default();
        let script = self
            .files
            .lock()
            .unwrap()
            .get(&(id.to_string(), last.to_string()))
            .cloned()
            .unwrap_or_else(|| last.to_string());
        self.scripts.lock().unwrap().push(script.clone());
        Ok((self.handler)(&script))
    }
}
