//! External-program update module.
//!
//! Implements [`UpdateModule`] by invoking the module program installed at
//! `<modules_dir>/<payload_type>`. Each verb is one invocation:
//!
//! ```text
//! <module> <Verb> <work-tree>
//! ```
//!
//! Plain verbs succeed or fail by exit status. The two query verbs
//! (`NeedsArtifactReboot`, `SupportsRollback`) answer with a single line on
//! standard output; no output means `No`.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use super::{ModuleError, RebootAction, UpdateModule};
use crate::artifact::{ArtifactHeader, Payload};
use crate::context::{DeviceContext, ProvidesData, read_device_type};
use crate::error::Error;

/// An update module executed as an external program.
pub struct ExternalModule {
    payload_type: String,
    module_path: PathBuf,
    work_dir: PathBuf,
    device_type_file: PathBuf,
    current_provides: ProvidesData,
}

impl ExternalModule {
    /// Builds a handle for the module servicing `payload_type`.
    ///
    /// Snapshots the committed provenance so the module file tree can
    /// present the currently installed artifact to the program.
    ///
    /// # Errors
    ///
    /// Returns an error if the committed provenance cannot be loaded.
    pub fn new(ctx: &DeviceContext, payload_type: &str) -> Result<Self, Error> {
        let config = ctx.config();
        Ok(Self {
            payload_type: payload_type.to_string(),
            module_path: config.modules_dir.join(payload_type),
            work_dir: config
                .modules_work_dir
                .join("payloads")
                .join("0000")
                .join("tree"),
            device_type_file: config.device_type_file.clone(),
            current_provides: ctx.load_provides()?,
        })
    }

    /// Name of the payload type this module services.
    #[must_use]
    pub fn payload_type(&self) -> &str {
        &self.payload_type
    }

    fn files_dir(&self) -> PathBuf {
        self.work_dir.join("files")
    }

    fn run_verb(&self, verb: &str) -> Result<String, ModuleError> {
        debug!(module = %self.module_path.display(), verb, "Invoking update module");
        let output = Command::new(&self.module_path)
            .arg(verb)
            .arg(&self.work_dir)
            .current_dir(&self.work_dir)
            .output()
            .map_err(|e| ModuleError::Spawn {
                module: self.module_path.display().to_string(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(ModuleError::VerbFailed {
                verb: verb.to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn query_verb(&self, verb: &str) -> Result<String, ModuleError> {
        let stdout = self.run_verb(verb)?;
        Ok(stdout.lines().next().unwrap_or("").trim().to_string())
    }
}

fn create_data_file(dir: &Path, name: &str, data: &str) -> Result<(), ModuleError> {
    let mut file = File::create(dir.join(name))?;
    if !data.is_empty() {
        file.write_all(data.as_bytes())?;
    }
    Ok(())
}

impl UpdateModule for ExternalModule {
    fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    fn prepare_file_tree(
        &mut self,
        workdir: &Path,
        header: &ArtifactHeader,
    ) -> Result<(), ModuleError> {
        // Gather everything that can fail before touching the filesystem,
        // so a half-created tree only ever means an I/O fault.
        let device_type = read_device_type(&self.device_type_file)
            .map_err(|e| ModuleError::Other(e.to_string()))?;

        let header_subdir = workdir.join("header");
        std::fs::create_dir_all(&header_subdir)?;
        std::fs::create_dir_all(workdir.join("tmp"))?;

        create_data_file(workdir, "version", "3\n")?;

        let current = |key: &str| match self.current_provides.get(key) {
            Some(value) => format!("{value}\n"),
            None => String::new(),
        };
        create_data_file(workdir, "current_artifact_name", &current("artifact_name"))?;
        create_data_file(workdir, "current_artifact_group", &current("artifact_group"))?;
        create_data_file(workdir, "current_device_type", &format!("{device_type}\n"))?;

        create_data_file(&header_subdir, "artifact_group", &header.artifact_group)?;
        create_data_file(&header_subdir, "artifact_name", &header.artifact_name)?;
        create_data_file(&header_subdir, "payload_type", &header.payload_type)?;
        create_data_file(&header_subdir, "header_info", &header.header_info.to_string())?;
        create_data_file(&header_subdir, "type_info", &header.type_info.to_string())?;

        // The tree must survive a spontaneous reboot whole.
        File::open(workdir)?.sync_all()?;

        Ok(())
    }

    fn download(&mut self, payload: &mut Payload) -> Result<(), ModuleError> {
        let files_dir = self.files_dir();
        std::fs::create_dir_all(&files_dir)?;

        let dest = files_dir.join(payload.name());
        let mut file = File::create(&dest)?;
        std::io::copy(payload, &mut file)?;
        file.sync_all()?;
        debug!(payload = %dest.display(), size = payload.size(), "Stored payload");

        self.run_verb("Download").map(|_| ())
    }

    fn artifact_install(&mut self) -> Result<(), ModuleError> {
        self.run_verb("ArtifactInstall").map(|_| ())
    }

    fn needs_reboot(&mut self) -> Result<RebootAction, ModuleError> {
        match self.query_verb("NeedsArtifactReboot")?.as_str() {
            "" | "No" => Ok(RebootAction::No),
            "Automatic" => Ok(RebootAction::Automatic),
            "Yes" => Ok(RebootAction::Yes),
            other => Err(ModuleError::UnexpectedOutput {
                verb: "NeedsArtifactReboot".to_string(),
                output: other.to_string(),
            }),
        }
    }

    fn supports_rollback(&mut self) -> Result<bool, ModuleError> {
        match self.query_verb("SupportsRollback")?.as_str() {
            "" | "No" => Ok(false),
            "Yes" => Ok(true),
            other => Err(ModuleError::UnexpectedOutput {
                verb: "SupportsRollback".to_string(),
                output: other.to_string(),
            }),
        }
    }

    fn artifact_commit(&mut self) -> Result<(), ModuleError> {
        self.run_verb("ArtifactCommit").map(|_| ())
    }

    fn artifact_rollback(&mut self) -> Result<(), ModuleError> {
        self.run_verb("ArtifactRollback").map(|_| ())
    }

    fn artifact_failure(&mut self) -> Result<(), ModuleError> {
        self.run_verb("ArtifactFailure").map(|_| ())
    }

    fn cleanup(&mut self) -> Result<(), ModuleError> {
        if !self.work_dir.exists() {
            return Ok(());
        }

        let verb_result = self.run_verb("Cleanup").map(|_| ());

        match std::fs::remove_dir_all(&self.work_dir) {
            Ok(()) => {},
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {},
            Err(err) => return verb_result.and(Err(err.into())),
        }

        verb_result
    }
}
