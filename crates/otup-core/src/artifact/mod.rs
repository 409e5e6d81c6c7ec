//! Artifact container reading.
//!
//! An artifact is a tar archive carrying one payload plus the metadata
//! describing what it installs. Entries, in order:
//!
//! | Entry | Content |
//! |---|---|
//! | `version` | JSON `{"format": "otup", "version": 3}` |
//! | `header/header-info` | JSON: payload list and artifact identity |
//! | `header/type-info` | JSON: payload type, provides, clears-provides |
//! | `scripts/<name>` | optional state scripts, installed during parse |
//! | `data/0000/<file>` | the payload bytes |
//!
//! Parsing is a single pass: metadata is validated as it streams by and the
//! payload is spooled to an unnamed temporary file, so the artifact source
//! is read exactly once. Signature verification is the caller's concern.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use serde::Deserialize;
use tracing::debug;

/// Name of the archive format this reader accepts.
const ARTIFACT_FORMAT: &str = "otup";

/// Version of the archive format this reader accepts.
const ARTIFACT_VERSION: u64 = 3;

/// Errors from artifact reading.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    /// I/O failure while reading the archive.
    #[error("artifact read error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed metadata entry.
    #[error("invalid artifact metadata: {0}")]
    Json(#[from] serde_json::Error),

    /// The archive violates the container layout.
    #[error("invalid artifact: {0}")]
    Invalid(String),

    /// A required entry is absent.
    #[error("artifact entry missing: {0}")]
    MissingEntry(&'static str),

    /// The archive declares a format or version this client cannot read.
    #[error("unsupported artifact format: {format} version {version}")]
    UnsupportedFormat {
        /// Declared format name.
        format: String,
        /// Declared format version.
        version: u64,
    },

    /// The archive carries a payload count other than one.
    #[error("artifact carries {0} payloads; exactly one is supported")]
    UnsupportedPayloadCount(usize),

    /// The single payload was already handed out.
    #[error("artifact payload already consumed")]
    PayloadConsumed,
}

/// Configuration for the artifact reader.
#[derive(Debug, Clone)]
pub struct ParserConfig {
    /// Where state scripts carried in the artifact are installed.
    pub artifact_scripts_dir: std::path::PathBuf,
}

/// The parsed payload header: everything the orchestrator needs to know
/// about what this artifact installs.
#[derive(Debug, Clone)]
pub struct ArtifactHeader {
    /// Identifier of the artifact.
    pub artifact_name: String,
    /// Optional grouping label; empty when the artifact declares none.
    pub artifact_group: String,
    /// Name of the update module that services the payload.
    pub payload_type: String,
    /// Typed-info assertions the artifact provides.
    pub artifact_provides: Option<BTreeMap<String, String>>,
    /// Provides-keys the artifact clears on commit.
    pub clears_artifact_provides: Option<Vec<String>>,
    /// Raw `header-info` document, preserved for the module file tree.
    pub header_info: serde_json::Value,
    /// Raw `type-info` document, preserved for the module file tree.
    pub type_info: serde_json::Value,
}

/// The payload stream, spooled from the archive.
#[derive(Debug)]
pub struct Payload {
    name: String,
    size: u64,
    file: File,
}

impl Payload {
    /// File name of the payload inside the artifact.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Payload size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Read for Payload {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

/// A parsed artifact: validated header plus the single payload.
#[derive(Debug)]
pub struct Artifact {
    header: ArtifactHeader,
    payload: Option<Payload>,
}

impl Artifact {
    /// The payload header view.
    #[must_use]
    pub fn header(&self) -> &ArtifactHeader {
        &self.header
    }

    /// Hands out the payload stream. Can only succeed once.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError::PayloadConsumed`] on the second call.
    pub fn next_payload(&mut self) -> Result<Payload, ArtifactError> {
        self.payload.take().ok_or(ArtifactError::PayloadConsumed)
    }
}

#[derive(Debug, Deserialize)]
struct VersionDoc {
    format: String,
    version: u64,
}

#[derive(Debug, Deserialize)]
struct HeaderInfoDoc {
    payloads: Vec<PayloadDecl>,
    #[serde(default)]
    artifact_provides: IdentityProvides,
}

#[derive(Debug, Deserialize)]
struct PayloadDecl {
    #[serde(rename = "type")]
    payload_type: String,
}

#[derive(Debug, Default, Deserialize)]
struct IdentityProvides {
    #[serde(default)]
    artifact_name: String,
    #[serde(default)]
    artifact_group: String,
}

#[derive(Debug, Deserialize)]
struct TypeInfoDoc {
    #[serde(rename = "type")]
    payload_type: String,
    #[serde(default)]
    artifact_provides: Option<BTreeMap<String, String>>,
    #[serde(default)]
    clears_artifact_provides: Option<Vec<String>>,
}

fn read_entry_string(entry: &mut impl Read) -> Result<String, ArtifactError> {
    let mut content = String::new();
    entry.read_to_string(&mut content)?;
    Ok(content)
}

fn file_name_of(path: &Path, entry: &'static str) -> Result<String, ArtifactError> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| ArtifactError::Invalid(format!("{entry} entry has no file name")))
}

/// Parses an artifact from `reader`.
///
/// Metadata is validated, state scripts are installed into the configured
/// scripts directory, and the payload is spooled for later streaming.
///
/// # Errors
///
/// Returns an error when the archive cannot be read, a required entry is
/// missing or malformed, the format version is unsupported, or the payload
/// count differs from one.
pub fn parse<R: Read>(reader: R, config: &ParserConfig) -> Result<Artifact, ArtifactError> {
    let mut archive = tar::Archive::new(reader);

    let mut version_seen = false;
    let mut header_info: Option<(HeaderInfoDoc, serde_json::Value)> = None;
    let mut type_info: Option<(TypeInfoDoc, serde_json::Value)> = None;
    let mut payload: Option<Payload> = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path()?.into_owned();
        let name = path.to_string_lossy().into_owned();

        match name.as_str() {
            "version" => {
                let content = read_entry_string(&mut entry)?;
                let doc: VersionDoc = serde_json::from_str(&content)?;
                if doc.format != ARTIFACT_FORMAT || doc.version != ARTIFACT_VERSION {
                    return Err(ArtifactError::UnsupportedFormat {
                        format: doc.format,
                        version: doc.version,
                    });
                }
                version_seen = true;
            },
            "header/header-info" => {
                let content = read_entry_string(&mut entry)?;
                let raw: serde_json::Value = serde_json::from_str(&content)?;
                let doc: HeaderInfoDoc = serde_json::from_value(raw.clone())?;
                if doc.payloads.len() != 1 {
                    return Err(ArtifactError::UnsupportedPayloadCount(doc.payloads.len()));
                }
                if doc.artifact_provides.artifact_name.is_empty() {
                    return Err(ArtifactError::Invalid(
                        "header-info declares no artifact_name".to_string(),
                    ));
                }
                header_info = Some((doc, raw));
            },
            "header/type-info" => {
                let content = read_entry_string(&mut entry)?;
                let raw: serde_json::Value = serde_json::from_str(&content)?;
                let doc: TypeInfoDoc = serde_json::from_value(raw.clone())?;
                type_info = Some((doc, raw));
            },
            _ if name.starts_with("scripts/") => {
                let file_name = file_name_of(&path, "script")?;
                std::fs::create_dir_all(&config.artifact_scripts_dir)?;
                let dest = config.artifact_scripts_dir.join(&file_name);
                let mut out = File::create(&dest)?;
                std::io::copy(&mut entry, &mut out)?;
                debug!(script = %dest.display(), "Installed artifact state script");
            },
            _ if name.starts_with("data/") => {
                if payload.is_some() {
                    return Err(ArtifactError::UnsupportedPayloadCount(2));
                }
                let file_name = file_name_of(&path, "payload")?;
                let mut spool = tempfile::tempfile()?;
                let size = std::io::copy(&mut entry, &mut spool)?;
                spool.flush()?;
                spool.seek(SeekFrom::Start(0))?;
                payload = Some(Payload {
                    name: file_name,
                    size,
                    file: spool,
                });
            },
            other => {
                debug!(entry = other, "Skipping unrecognized artifact entry");
            },
        }
    }

    if !version_seen {
        return Err(ArtifactError::MissingEntry("version"));
    }
    let (header_doc, header_raw) =
        header_info.ok_or(ArtifactError::MissingEntry("header/header-info"))?;
    let (type_doc, type_raw) = type_info.ok_or(ArtifactError::MissingEntry("header/type-info"))?;
    let payload = payload.ok_or(ArtifactError::MissingEntry("data/0000"))?;

    let declared_type = &header_doc.payloads[0].payload_type;
    if *declared_type != type_doc.payload_type {
        return Err(ArtifactError::Invalid(format!(
            "header-info payload type `{declared_type}` does not match type-info `{}`",
            type_doc.payload_type
        )));
    }

    Ok(Artifact {
        header: ArtifactHeader {
            artifact_name: header_doc.artifact_provides.artifact_name,
            artifact_group: header_doc.artifact_provides.artifact_group,
            payload_type: type_doc.payload_type,
            artifact_provides: type_doc.artifact_provides,
            clears_artifact_provides: type_doc.clears_artifact_provides,
            header_info: header_raw,
            type_info: type_raw,
        },
        payload: Some(payload),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn append(builder: &mut tar::Builder<&mut Vec<u8>>, path: &str, data: &[u8]) {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, data).unwrap();
    }

    fn build_artifact(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut builder = tar::Builder::new(&mut buf);
        for (path, data) in entries {
            append(&mut builder, path, data);
        }
        builder.finish().unwrap();
        drop(builder);
        buf
    }

    fn valid_entries() -> Vec<(&'static str, &'static [u8])> {
        vec![
            ("version", br#"{"format": "otup", "version": 3}"#),
            (
                "header/header-info",
                br#"{"payloads": [{"type": "rootfs-image"}],
                     "artifact_provides": {"artifact_name": "release-1",
                                           "artifact_group": "stable"}}"#,
            ),
            (
                "header/type-info",
                br#"{"type": "rootfs-image",
                     "artifact_provides": {"rootfs-image.checksum": "abc123"},
                     "clears_artifact_provides": ["rootfs-image.*"]}"#,
            ),
            ("data/0000/rootfs.img", b"payload-bytes"),
        ]
    }

    fn scripts_config(dir: &Path) -> ParserConfig {
        ParserConfig {
            artifact_scripts_dir: dir.join("scripts"),
        }
    }

    #[test]
    fn test_parse_valid_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let buf = build_artifact(&valid_entries());

        let mut artifact = parse(buf.as_slice(), &scripts_config(dir.path())).unwrap();

        let header = artifact.header();
        assert_eq!(header.artifact_name, "release-1");
        assert_eq!(header.artifact_group, "stable");
        assert_eq!(header.payload_type, "rootfs-image");
        assert_eq!(
            header
                .artifact_provides
                .as_ref()
                .unwrap()
                .get("rootfs-image.checksum")
                .unwrap(),
            "abc123"
        );
        assert_eq!(
            header.clears_artifact_provides.as_deref().unwrap(),
            ["rootfs-image.*".to_string()]
        );

        let mut payload = artifact.next_payload().unwrap();
        assert_eq!(payload.name(), "rootfs.img");
        assert_eq!(payload.size(), 13);
        let mut content = Vec::new();
        payload.read_to_end(&mut content).unwrap();
        assert_eq!(content, b"payload-bytes");
    }

    #[test]
    fn test_payload_consumed_once() {
        let dir = tempfile::tempdir().unwrap();
        let buf = build_artifact(&valid_entries());

        let mut artifact = parse(buf.as_slice(), &scripts_config(dir.path())).unwrap();
        artifact.next_payload().unwrap();
        assert!(matches!(
            artifact.next_payload(),
            Err(ArtifactError::PayloadConsumed)
        ));
    }

    #[test]
    fn test_unsupported_format_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut entries = valid_entries();
        entries[0] = ("version", br#"{"format": "otup", "version": 9}"#);
        let buf = build_artifact(&entries);

        assert!(matches!(
            parse(buf.as_slice(), &scripts_config(dir.path())),
            Err(ArtifactError::UnsupportedFormat { version: 9, .. })
        ));
    }

    #[test]
    fn test_multiple_declared_payloads_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut entries = valid_entries();
        entries[1] = (
            "header/header-info",
            br#"{"payloads": [{"type": "a"}, {"type": "b"}],
                 "artifact_provides": {"artifact_name": "x"}}"#,
        );
        let buf = build_artifact(&entries);

        assert!(matches!(
            parse(buf.as_slice(), &scripts_config(dir.path())),
            Err(ArtifactError::UnsupportedPayloadCount(2))
        ));
    }

    #[test]
    fn test_second_data_entry_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut entries = valid_entries();
        entries.push(("data/0001/extra.img", b"more"));
        let buf = build_artifact(&entries);

        assert!(matches!(
            parse(buf.as_slice(), &scripts_config(dir.path())),
            Err(ArtifactError::UnsupportedPayloadCount(2))
        ));
    }

    #[test]
    fn test_missing_type_info_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let entries: Vec<_> = valid_entries()
            .into_iter()
            .filter(|(path, _)| *path != "header/type-info")
            .collect();
        let buf = build_artifact(&entries);

        assert!(matches!(
            parse(buf.as_slice(), &scripts_config(dir.path())),
            Err(ArtifactError::MissingEntry("header/type-info"))
        ));
    }

    #[test]
    fn test_missing_artifact_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut entries = valid_entries();
        entries[1] = (
            "header/header-info",
            br#"{"payloads": [{"type": "rootfs-image"}], "artifact_provides": {}}"#,
        );
        let buf = build_artifact(&entries);

        assert!(matches!(
            parse(buf.as_slice(), &scripts_config(dir.path())),
            Err(ArtifactError::Invalid(_))
        ));
    }

    #[test]
    fn test_payload_type_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut entries = valid_entries();
        entries[2] = ("header/type-info", br#"{"type": "other-module"}"#);
        let buf = build_artifact(&entries);

        assert!(matches!(
            parse(buf.as_slice(), &scripts_config(dir.path())),
            Err(ArtifactError::Invalid(_))
        ));
    }

    #[test]
    fn test_non_string_provides_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut entries = valid_entries();
        entries[2] = (
            "header/type-info",
            br#"{"type": "rootfs-image", "artifact_provides": {"key": 42}}"#,
        );
        let buf = build_artifact(&entries);

        assert!(matches!(
            parse(buf.as_slice(), &scripts_config(dir.path())),
            Err(ArtifactError::Json(_))
        ));
    }

    #[test]
    fn test_scripts_installed_during_parse() {
        let dir = tempfile::tempdir().unwrap();
        let mut entries = valid_entries();
        entries.insert(3, ("scripts/ArtifactInstall_Enter_00", b"#!/bin/sh\n"));
        let buf = build_artifact(&entries);

        parse(buf.as_slice(), &scripts_config(dir.path())).unwrap();

        let installed = dir.path().join("scripts").join("ArtifactInstall_Enter_00");
        assert_eq!(std::fs::read(installed).unwrap(), b"#!/bin/sh\n");
    }
}
