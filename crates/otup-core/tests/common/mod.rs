//! Shared fixtures for the orchestrator integration tests: an artifact
//! file builder and a scriptable in-memory update module.

#![allow(dead_code)]

use std::cell::RefCell;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use otup_core::artifact::{ArtifactHeader, Payload};
use otup_core::config::UpdaterConfig;
use otup_core::context::DeviceContext;
use otup_core::module::{ModuleError, RebootAction, UpdateModule};

/// Opens a device context on a real on-disk store under `dir`.
pub fn test_context(dir: &Path) -> DeviceContext {
    std::fs::write(dir.join("device_type"), "device_type=test-board\n").unwrap();
    let config = UpdaterConfig {
        data_store_dir: dir.join("data"),
        modules_dir: dir.join("modules"),
        modules_work_dir: dir.join("work"),
        artifact_scripts_dir: dir.join("scripts"),
        device_type_file: dir.join("device_type"),
    };
    DeviceContext::open(config).unwrap()
}

/// Describes the artifact fixture to build.
pub struct ArtifactSpec<'a> {
    pub artifact_name: &'a str,
    pub artifact_group: &'a str,
    pub payload_type: &'a str,
    pub payload: &'a [u8],
    pub provides: Option<&'a [(&'a str, &'a str)]>,
    pub clears_provides: Option<&'a [&'a str]>,
}

impl Default for ArtifactSpec<'_> {
    fn default() -> Self {
        Self {
            artifact_name: "release-1",
            artifact_group: "stable",
            payload_type: "stub-module",
            payload: b"payload-bytes",
            provides: None,
            clears_provides: None,
        }
    }
}

/// Writes a valid single-payload artifact file at `path`.
pub fn write_artifact(path: &Path, spec: &ArtifactSpec<'_>) {
    let header_info = serde_json::json!({
        "payloads": [{"type": spec.payload_type}],
        "artifact_provides": {
            "artifact_name": spec.artifact_name,
            "artifact_group": spec.artifact_group,
        },
    });

    let mut type_info = serde_json::json!({"type": spec.payload_type});
    if let Some(provides) = spec.provides {
        let map: serde_json::Map<String, serde_json::Value> = provides
            .iter()
            .map(|(k, v)| ((*k).to_string(), serde_json::Value::from(*v)))
            .collect();
        type_info["artifact_provides"] = serde_json::Value::Object(map);
    }
    if let Some(clears) = spec.clears_provides {
        type_info["clears_artifact_provides"] = serde_json::json!(clears);
    }

    let file = std::fs::File::create(path).unwrap();
    let mut builder = tar::Builder::new(file);
    let mut append = |entry_path: &str, data: &[u8]| {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, entry_path, data).unwrap();
    };

    append("version", br#"{"format": "otup", "version": 3}"#);
    append("header/header-info", header_info.to_string().as_bytes());
    append("header/type-info", type_info.to_string().as_bytes());
    append(
        &format!("data/0000/{}.img", spec.payload_type),
        spec.payload,
    );
    builder.finish().unwrap();
}

/// Scripted behavior of a [`StubModule`]. `None` means the verb succeeds.
#[derive(Debug, Clone)]
pub struct StubBehavior {
    pub prepare_error: Option<String>,
    pub download_error: Option<String>,
    pub install_error: Option<String>,
    pub reboot: RebootAction,
    pub reboot_query_error: Option<String>,
    pub supports_rollback: bool,
    pub rollback_query_error: Option<String>,
    pub commit_error: Option<String>,
    pub rollback_error: Option<String>,
    pub failure_error: Option<String>,
    pub cleanup_error: Option<String>,
}

impl Default for StubBehavior {
    fn default() -> Self {
        Self {
            prepare_error: None,
            download_error: None,
            install_error: None,
            reboot: RebootAction::No,
            reboot_query_error: None,
            supports_rollback: true,
            rollback_query_error: None,
            commit_error: None,
            rollback_error: None,
            failure_error: None,
            cleanup_error: None,
        }
    }
}

/// Everything the stub observed, shared between the test and the module
/// instances its factory hands out.
#[derive(Debug, Default)]
pub struct StubLog {
    pub calls: Vec<&'static str>,
    pub downloaded: Vec<u8>,
}

/// An in-memory [`UpdateModule`] driven by a [`StubBehavior`] script.
pub struct StubModule {
    behavior: StubBehavior,
    log: Rc<RefCell<StubLog>>,
    work_dir: PathBuf,
}

impl StubModule {
    pub fn new(behavior: StubBehavior, log: Rc<RefCell<StubLog>>, work_dir: PathBuf) -> Self {
        Self {
            behavior,
            log,
            work_dir,
        }
    }

    fn record(&self, verb: &'static str) {
        self.log.borrow_mut().calls.push(verb);
    }

    fn verb(&self, verb: &'static str, error: &Option<String>) -> Result<(), ModuleError> {
        self.record(verb);
        match error {
            Some(message) => Err(ModuleError::Other(message.clone())),
            None => Ok(()),
        }
    }
}

impl UpdateModule for StubModule {
    fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    fn prepare_file_tree(
        &mut self,
        _workdir: &Path,
        _header: &ArtifactHeader,
    ) -> Result<(), ModuleError> {
        self.verb("PrepareFileTree", &self.behavior.prepare_error)
    }

    fn download(&mut self, payload: &mut Payload) -> Result<(), ModuleError> {
        self.record("Download");
        let mut bytes = Vec::new();
        payload.read_to_end(&mut bytes)?;
        self.log.borrow_mut().downloaded = bytes;
        match &self.behavior.download_error {
            Some(message) => Err(ModuleError::Other(message.clone())),
            None => Ok(()),
        }
    }

    fn artifact_install(&mut self) -> Result<(), ModuleError> {
        self.verb("ArtifactInstall", &self.behavior.install_error)
    }

    fn needs_reboot(&mut self) -> Result<RebootAction, ModuleError> {
        self.record("NeedsArtifactReboot");
        match &self.behavior.reboot_query_error {
            Some(message) => Err(ModuleError::Other(message.clone())),
            None => Ok(self.behavior.reboot),
        }
    }

    fn supports_rollback(&mut self) -> Result<bool, ModuleError> {
        self.record("SupportsRollback");
        match &self.behavior.rollback_query_error {
            Some(message) => Err(ModuleError::Other(message.clone())),
            None => Ok(self.behavior.supports_rollback),
        }
    }

    fn artifact_commit(&mut self) -> Result<(), ModuleError> {
        self.verb("ArtifactCommit", &self.behavior.commit_error)
    }

    fn artifact_rollback(&mut self) -> Result<(), ModuleError> {
        self.verb("ArtifactRollback", &self.behavior.rollback_error)
    }

    fn artifact_failure(&mut self) -> Result<(), ModuleError> {
        self.verb("ArtifactFailure", &self.behavior.failure_error)
    }

    fn cleanup(&mut self) -> Result<(), ModuleError> {
        self.verb("Cleanup", &self.behavior.cleanup_error)
    }
}

/// A stub module harness: behavior script, shared log, and a factory to
/// hand to the `*_with` entry points.
pub struct StubHarness {
    pub behavior: StubBehavior,
    pub log: Rc<RefCell<StubLog>>,
    pub work_dir: PathBuf,
}

impl StubHarness {
    pub fn new(dir: &Path, behavior: StubBehavior) -> Self {
        Self {
            behavior,
            log: Rc::new(RefCell::new(StubLog::default())),
            work_dir: dir.join("stub-work"),
        }
    }

    /// A factory closure yielding stub modules scripted by this harness.
    pub fn factory(
        &self,
    ) -> impl FnMut(&DeviceContext, &str) -> Result<Box<dyn UpdateModule>, otup_core::Error> + '_
    {
        move |_ctx, _payload_type| {
            Ok(Box::new(StubModule::new(
                self.behavior.clone(),
                Rc::clone(&self.log),
                self.work_dir.clone(),
            )))
        }
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.log.borrow().calls.clone()
    }

    pub fn downloaded(&self) -> Vec<u8> {
        self.log.borrow().downloaded.clone()
    }
}
