use std::env;
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::{SipError, ToolFailure};
use crate::events::ProvenanceEvent;
use crate::store::io_error;

/// Identifier scheme passed with every imported file.
pub const IDENTIFIER_TYPE: &str = "museumplus";
/// METS catalogue profile used by the preservation service.
pub const METS_PROFILE: &str = "ch";

/// Working directories of one package build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildLayout {
    pub root: Utf8PathBuf,
    /// Package content; becomes the root of the TAR archive.
    pub sip_dir: Utf8PathBuf,
    /// Intermediate metadata written by the builder tools.
    pub workspace_dir: Utf8PathBuf,
    pub log_dir: Utf8PathBuf,
    pub archive_path: Utf8PathBuf,
}

impl BuildLayout {
    pub fn new(root: &Utf8Path, package_name: &str) -> Self {
        Self {
            root: root.to_path_buf(),
            sip_dir: root.join("sip"),
            workspace_dir: root.join("workspace"),
            log_dir: root.join("logs"),
            archive_path: root.join(package_name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    Submission,
    Update,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Submission => "submission",
            RecordStatus::Update => "update",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetsHeader {
    pub objid: String,
    pub contentid: String,
    pub record_status: RecordStatus,
    pub create_date: DateTime<Utc>,
    pub last_moddate: Option<DateTime<Utc>>,
    pub organization_name: String,
    pub contract_id: String,
}

/// One invocation of the container builder. Paths are relative to the
/// package content directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildStep {
    ImportObject { path: String, identifier: String },
    CreateMix { path: String },
    PremisEvent(ProvenanceEvent),
    ImportDescription { path: String },
    CompileStructmap,
    CompileMets(MetsHeader),
    SignMets { key_path: Utf8PathBuf },
}

impl BuildStep {
    pub fn tool(&self) -> &'static str {
        match self {
            BuildStep::ImportObject { .. } => "import-object",
            BuildStep::CreateMix { .. } => "create-mix",
            BuildStep::PremisEvent(_) => "premis-event",
            BuildStep::ImportDescription { .. } => "import-description",
            BuildStep::CompileStructmap => "compile-structmap",
            BuildStep::CompileMets(_) => "compile-mets",
            BuildStep::SignMets { .. } => "sign-mets",
        }
    }

    /// Full command line, program name first.
    pub fn command(&self, layout: &BuildLayout) -> Vec<String> {
        let base = layout.sip_dir.to_string();
        let workspace = layout.workspace_dir.to_string();
        let mut args = vec![self.tool().to_string()];
        match self {
            BuildStep::ImportObject { path, identifier } => {
                push_args(&mut args, &["--base_path", &base, "--workspace", &workspace]);
                push_args(&mut args, &["--identifier", IDENTIFIER_TYPE, identifier, path]);
            }
            BuildStep::CreateMix { path } => {
                push_args(&mut args, &["--base_path", &base, "--workspace", &workspace, path]);
            }
            BuildStep::PremisEvent(event) => {
                push_args(
                    &mut args,
                    &[
                        "--base_path",
                        &base,
                        "--workspace",
                        &workspace,
                        "--event_detail",
                        &event.detail,
                        "--event_outcome",
                        &event.outcome,
                        "--agent_name",
                        &event.agent.name,
                        "--agent_type",
                        &event.agent.agent_type,
                    ],
                );
                if let Some(target) = &event.target {
                    push_args(&mut args, &["--event_target", target]);
                }
                if !event.outcome_detail.is_empty() {
                    push_args(&mut args, &["--event_outcome_detail", &event.outcome_detail]);
                }
                push_args(&mut args, &[&event.event_type, &event.timestamp.to_rfc3339()]);
            }
            BuildStep::ImportDescription { path } => {
                push_args(&mut args, &["--workspace", &workspace, path]);
            }
            BuildStep::CompileStructmap => {
                push_args(&mut args, &["--workspace", &workspace]);
            }
            BuildStep::CompileMets(header) => {
                push_args(
                    &mut args,
                    &[
                        "--workspace",
                        &workspace,
                        "--base_path",
                        &base,
                        "--objid",
                        &header.objid,
                        "--contentid",
                        &header.contentid,
                        "--record_status",
                        header.record_status.as_str(),
                        "--create_date",
                        &header.create_date.to_rfc3339(),
                        "--clean",
                    ],
                );
                if let Some(modified) = header.last_moddate {
                    push_args(&mut args, &["--last_moddate", &modified.to_rfc3339()]);
                }
                push_args(
                    &mut args,
                    &[METS_PROFILE, &header.organization_name, &header.contract_id],
                );
            }
            BuildStep::SignMets { key_path } => {
                push_args(&mut args, &["--workspace", &workspace, key_path.as_str()]);
            }
        }
        args
    }
}

fn push_args(args: &mut Vec<String>, values: &[&str]) {
    args.extend(values.iter().map(|value| value.to_string()));
}

/// External container builder.
pub trait PackageBuilder: Send + Sync {
    fn run(&self, step: &BuildStep, layout: &BuildLayout) -> Result<(), SipError>;
}

/// Drives the command-line SIP tools as subprocesses.
#[derive(Debug, Clone, Default)]
pub struct SiptoolsBuilder {
    tool_dir: Option<Utf8PathBuf>,
}

impl SiptoolsBuilder {
    pub fn new(tool_dir: Option<Utf8PathBuf>) -> Self {
        Self { tool_dir }
    }

    fn locate(&self, tool: &str) -> Result<PathBuf, SipError> {
        if let Some(dir) = &self.tool_dir {
            let candidate = dir.join(tool);
            if candidate.as_std_path().is_file() {
                return Ok(candidate.into_std_path_buf());
            }
        }
        find_in_path(tool).ok_or_else(|| SipError::MissingTool(tool.to_string()))
    }

    fn search_path(&self) -> Option<OsString> {
        let dir = self.tool_dir.as_ref()?;
        let mut paths = vec![dir.as_std_path().to_path_buf()];
        if let Some(existing) = env::var_os("PATH") {
            paths.extend(env::split_paths(&existing));
        }
        env::join_paths(paths).ok()
    }
}

impl PackageBuilder for SiptoolsBuilder {
    fn run(&self, step: &BuildStep, layout: &BuildLayout) -> Result<(), SipError> {
        let command = step.command(layout);
        let program = self.locate(step.tool())?;
        debug!(tool = step.tool(), "running builder command");

        let mut cmd = Command::new(&program);
        cmd.args(&command[1..]).current_dir(layout.sip_dir.as_std_path());
        if let Some(path) = self.search_path() {
            cmd.env("PATH", path);
        }
        let output = cmd
            .output()
            .map_err(|err| SipError::MissingTool(format!("{}: {err}", program.display())))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let log_path = layout.log_dir.join(format!("{}.log", step.tool()));
        append_transcript(&log_path, &command, &stdout, &stderr, Utc::now())?;

        if output.status.success() {
            return Ok(());
        }
        warn!(tool = step.tool(), status = ?output.status.code(), "builder command failed");
        Err(SipError::Tool(ToolFailure {
            command,
            status: output.status.code(),
            stdout,
            stderr,
        }))
    }
}

/// Appends one command transcript to a tool log.
pub fn append_transcript(
    log_path: &Utf8Path,
    command: &[String],
    stdout: &str,
    stderr: &str,
    at: DateTime<Utc>,
) -> Result<(), SipError> {
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent.as_std_path()).map_err(|err| io_error(parent, err))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path.as_std_path())
        .map_err(|err| io_error(log_path, err))?;
    let entry = format!(
        "\n===COMMAND===\n{}\n{}\n===STDOUT===\n{stdout}\n===STDERR===\n{stderr}",
        at.to_rfc3339(),
        command.join(" ")
    );
    file.write_all(entry.as_bytes())
        .map_err(|err| io_error(log_path, err))
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = env::var_os("PATH")?;
    env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}
