use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::builder::{BuildLayout, BuildStep, MetsHeader, PackageBuilder, RecordStatus};
use crate::catalogue::{CatalogueObject, file_extension};
use crate::config::PackagingSettings;
use crate::domain::PackageKey;
use crate::download::DOWNLOAD_SUFFIX;
use crate::error::{PreservationCategory, PreservationError, SipError};
use crate::events::{DESCRIPTION_PATH, ProvenanceEvent, derive_events};
use crate::fs_util;
use crate::store::{Store, atomic_rename_dir, io_error, walk_dir};

pub const IMAGE_FORMATS: &[&str] = &["gif", "tif", "tiff", "jpg", "jpeg"];
/// File suffixes the preservation service accepts. `attachment` is the
/// placeholder suffix of attachments without an original filename.
pub const SUPPORTED_FORMATS: &[&str] = &[
    "gif",
    "tif",
    "tiff",
    "jpg",
    "jpeg",
    "pdf",
    "odf",
    "xml",
    "attachment",
];

const RESERVED_FILENAMES: &[&str] = &["Multimedia.xml", "mets.xml", "signature.sig"];
const METS_FILE: &str = "mets.xml";
const SIGNATURE_FILE: &str = "signature.sig";

/// Cooperative stop signal shared by a stage and whoever may interrupt it.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fails with `Cancelled` once a stop was requested.
    pub fn check(&self, step: &str) -> Result<(), SipError> {
        if self.is_cancelled() {
            return Err(SipError::Cancelled(format!("stopped before {step}")));
        }
        Ok(())
    }
}

/// Rejects attachment filenames the package cannot hold.
pub fn validate_filename(filename: &str) -> Result<(), SipError> {
    if RESERVED_FILENAMES
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(filename))
    {
        return Err(SipError::ReservedFilename(filename.to_string()));
    }
    if !filename.is_ascii() {
        return Err(SipError::UnsupportedFilename(format!(
            "{filename}: Filename contains non-ASCII characters"
        )));
    }
    if filename.is_empty()
        || filename == "."
        || filename == ".."
        || filename.contains(['/', '\\'])
    {
        return Err(SipError::UnsupportedFilename(format!(
            "{filename}: not a plain file name"
        )));
    }
    Ok(())
}

/// `<lastModified:%Y%m%d>_Object_<id>[-<package id>].tar`
pub fn sip_filename(object: &CatalogueObject, key: &PackageKey) -> String {
    let suffix = if key.has_custom_package_id() {
        format!("-{}", key.package_id)
    } else {
        String::new()
    };
    format!(
        "{}_Object_{}{suffix}.tar",
        object.modified.format("%Y%m%d"),
        object.id
    )
}

/// Creation and modification dates of a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackageDates {
    pub create_date: DateTime<Utc>,
    pub modify_date: Option<DateTime<Utc>>,
    pub update: bool,
}

impl PackageDates {
    pub fn new(
        create_date: DateTime<Utc>,
        modify_date: Option<DateTime<Utc>>,
        update: bool,
    ) -> Result<Self, SipError> {
        match (update, modify_date) {
            (true, None) => Err(SipError::Precondition(
                "an update package requires a modify date".to_string(),
            )),
            (true, Some(modified)) if modified <= create_date => {
                Err(SipError::Precondition(format!(
                    "modify date {modified} must be later than create date {create_date}"
                )))
            }
            (false, Some(_)) => Err(SipError::Precondition(
                "a modify date is only allowed for update packages".to_string(),
            )),
            _ => Ok(Self {
                create_date,
                modify_date,
                update,
            }),
        }
    }

    pub fn record_status(&self) -> RecordStatus {
        if self.update {
            RecordStatus::Update
        } else {
            RecordStatus::Submission
        }
    }
}

/// A file imported into the package, with its catalogue identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageFile {
    pub identifier: String,
    /// Path relative to the package content root.
    pub path: String,
}

impl PackageFile {
    pub fn is_image(&self) -> bool {
        IMAGE_FORMATS.contains(&file_extension(&self.path).as_str())
    }
}

/// A finished package ready for submission.
#[derive(Debug, Clone)]
pub struct Package {
    pub key: PackageKey,
    pub name: String,
    pub create_date: DateTime<Utc>,
    pub modify_date: Option<DateTime<Utc>>,
    pub update: bool,
    pub object_modified: DateTime<Utc>,
    pub events: Vec<ProvenanceEvent>,
    pub files: Vec<PackageFile>,
    pub archive_path: Utf8PathBuf,
}

/// Builds a package from a downloaded snapshot.
///
/// The build runs in a staging directory next to the package directory
/// and replaces it only when the archive is complete, so an interrupted
/// build never leaves a half-written package behind.
pub struct Assembler<'a, B: PackageBuilder> {
    builder: &'a B,
    packaging: &'a PackagingSettings,
    cancel: &'a CancelFlag,
}

impl<'a, B: PackageBuilder> Assembler<'a, B> {
    pub fn new(builder: &'a B, packaging: &'a PackagingSettings, cancel: &'a CancelFlag) -> Self {
        Self {
            builder,
            packaging,
            cancel,
        }
    }

    pub fn assemble(
        &self,
        object: &CatalogueObject,
        key: &PackageKey,
        dates: &PackageDates,
        content_dir: &Utf8Path,
        package_dir: &Utf8Path,
    ) -> Result<Package, SipError> {
        for attachment in &object.attachments {
            validate_filename(&attachment.filename)?;
        }
        let name = sip_filename(object, key);

        let staging = staging_dir(package_dir)?;
        Store::remove_dir(&staging)?;
        let layout = BuildLayout::new(&staging, &name);
        for dir in [&layout.workspace_dir, &layout.log_dir] {
            fs::create_dir_all(dir.as_std_path()).map_err(|err| io_error(dir, err))?;
        }
        Store::copy_dir_recursive(content_dir, &layout.sip_dir)?;
        remove_interrupted_downloads(&layout.sip_dir, object)?;

        let mut extracted = 0;
        for attachment in &object.attachments {
            let Some(local_path) = &attachment.local_path else {
                continue;
            };
            if !attachment.is_archive() {
                continue;
            }
            self.cancel.check("archive extraction")?;
            extract_in_place(&layout.sip_dir.join(local_path))?;
            extracted += 1;
        }

        let files = collect_files(&layout.sip_dir, object)?;
        check_files(&files, &name)?;
        let events = derive_events(object);
        info!(
            package = %name,
            files = files.len(),
            events = events.len(),
            archives = extracted,
            "package content validated"
        );

        let steps = self.plan(object, dates, &files, &events, &layout);
        for step in &steps {
            self.cancel.check(step.tool())?;
            debug!(tool = step.tool(), "build step");
            self.builder.run(step, &layout)?;
        }

        self.cancel.check("archive compression")?;
        for file in [METS_FILE, SIGNATURE_FILE] {
            let from = layout.workspace_dir.join(file);
            let to = layout.sip_dir.join(file);
            fs::rename(from.as_std_path(), to.as_std_path()).map_err(|err| io_error(&from, err))?;
        }
        fs_util::tar_directory(layout.sip_dir.as_std_path(), layout.archive_path.as_std_path())?;
        Store::remove_dir(&layout.sip_dir)?;
        Store::remove_dir(&layout.workspace_dir)?;

        atomic_rename_dir(staging.as_std_path(), package_dir.as_std_path())
            .map_err(|err| io_error(package_dir, err))?;
        info!(package = %name, "package assembled");

        Ok(Package {
            key: key.clone(),
            archive_path: package_dir.join(&name),
            name,
            create_date: dates.create_date,
            modify_date: dates.modify_date,
            update: dates.update,
            object_modified: object.modified,
            events,
            files,
        })
    }

    /// Builder invocations in execution order.
    pub fn plan(
        &self,
        object: &CatalogueObject,
        dates: &PackageDates,
        files: &[PackageFile],
        events: &[ProvenanceEvent],
        layout: &BuildLayout,
    ) -> Vec<BuildStep> {
        let mut steps: Vec<BuildStep> = files
            .iter()
            .map(|file| BuildStep::ImportObject {
                path: file.path.clone(),
                identifier: file.identifier.clone(),
            })
            .collect();
        steps.extend(
            files
                .iter()
                .filter(|file| file.is_image())
                .map(|file| BuildStep::CreateMix {
                    path: file.path.clone(),
                }),
        );
        steps.extend(events.iter().cloned().map(BuildStep::PremisEvent));
        if layout.sip_dir.join(DESCRIPTION_PATH).as_std_path().is_file() {
            steps.push(BuildStep::ImportDescription {
                path: DESCRIPTION_PATH.to_string(),
            });
        }
        steps.push(BuildStep::CompileStructmap);
        steps.push(BuildStep::CompileMets(MetsHeader {
            objid: format!("Passari_Object_{}", object.id),
            contentid: format!("Object_{}", object.id),
            record_status: dates.record_status(),
            create_date: dates.create_date,
            last_moddate: dates.modify_date,
            organization_name: self.packaging.organization_name.clone(),
            contract_id: self.packaging.contract_id.clone(),
        }));
        steps.push(BuildStep::SignMets {
            key_path: self.packaging.sign_key_path.clone(),
        });
        steps
    }
}

fn staging_dir(package_dir: &Utf8Path) -> Result<Utf8PathBuf, SipError> {
    let name = package_dir
        .file_name()
        .ok_or_else(|| SipError::Filesystem(format!("invalid package directory {package_dir}")))?;
    Ok(package_dir.with_file_name(format!(".{name}.partial")))
}

/// Replaces an archive file with a directory of the same name holding its
/// contents.
fn extract_in_place(archive: &Utf8Path) -> Result<(), SipError> {
    let file_name = archive.file_name().unwrap_or_default();
    let extract_dir = archive.with_file_name(format!("{file_name}.extract"));
    Store::remove_dir(&extract_dir)?;
    let entries = fs_util::extract_zip(archive.as_std_path(), extract_dir.as_std_path())?;
    debug!(archive = %archive, entries = entries.len(), "extracted archive");
    fs::remove_file(archive.as_std_path()).map_err(|err| io_error(archive, err))?;
    fs::rename(extract_dir.as_std_path(), archive.as_std_path())
        .map_err(|err| io_error(archive, err))
}

/// Files to import: attachments first, then collection activities, then
/// the object reports.
/// Deletes binaries an interrupted download left behind. They are not part
/// of the snapshot; a linked attachment that happens to carry the same
/// suffix is kept.
fn remove_interrupted_downloads(
    sip_dir: &Utf8Path,
    object: &CatalogueObject,
) -> Result<(), SipError> {
    let linked: Vec<&str> = object
        .attachments
        .iter()
        .filter_map(|attachment| attachment.local_path.as_deref())
        .collect();
    for path in walk_dir(sip_dir.as_std_path())? {
        if !path.is_file() || file_extension(&path.to_string_lossy()) != DOWNLOAD_SUFFIX {
            continue;
        }
        let within = relative(&path, sip_dir.as_std_path())?;
        if linked.contains(&within.as_str()) {
            continue;
        }
        warn!(path = %within, "discarding interrupted download");
        fs::remove_file(&path)
            .map_err(|err| SipError::Filesystem(format!("{}: {err}", path.display())))?;
    }
    Ok(())
}

fn collect_files(sip_dir: &Utf8Path, object: &CatalogueObject) -> Result<Vec<PackageFile>, SipError> {
    let mut files = Vec::new();
    for (section, kind) in [
        ("attachments", "Multimedia"),
        ("collection_activities", "CollectionActivity"),
    ] {
        let section_dir = sip_dir.join(section);
        if !section_dir.as_std_path().is_dir() {
            continue;
        }
        for record_dir in child_dirs(&section_dir)? {
            let record_id = record_dir.file_name().unwrap_or_default().to_string();
            for path in walk_dir(record_dir.as_std_path())? {
                if !path.is_file() {
                    continue;
                }
                let within = relative(&path, record_dir.as_std_path())?;
                files.push(PackageFile {
                    identifier: format!("{kind}:{record_id}:{within}"),
                    path: relative(&path, sip_dir.as_std_path())?,
                });
            }
        }
    }

    let report_dir = sip_dir.join("reports");
    if report_dir.as_std_path().is_dir() {
        for path in walk_dir(report_dir.as_std_path())? {
            if !path.is_file() {
                continue;
            }
            let within = relative(&path, sip_dir.as_std_path())?;
            files.push(PackageFile {
                identifier: format!("Object:{}:{within}", object.id),
                path: within,
            });
        }
    }
    Ok(files)
}

fn check_files(files: &[PackageFile], package_name: &str) -> Result<(), SipError> {
    for file in files {
        if !file.path.is_ascii() {
            return Err(SipError::UnsupportedFilename(format!(
                "{}: Filename contains non-ASCII characters",
                file.path
            )));
        }
        let suffix = file_extension(&file.path);
        if !SUPPORTED_FORMATS.contains(&suffix.as_str()) {
            return Err(PreservationError::new(
                PreservationCategory::UnsupportedFileType,
                format!("Unsupported file format: {suffix}"),
                format!(
                    "File format {suffix} in SIP {package_name} not supported for preservation."
                ),
            )
            .into());
        }
    }
    Ok(())
}

fn child_dirs(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, SipError> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir.as_std_path()).map_err(|err| io_error(dir, err))? {
        let entry = entry.map_err(|err| io_error(dir, err))?;
        if entry.path().is_dir() {
            let path = Utf8PathBuf::from_path_buf(entry.path())
                .map_err(|path| SipError::UnsupportedFilename(path.display().to_string()))?;
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn relative(path: &std::path::Path, base: &std::path::Path) -> Result<String, SipError> {
    let relative = path
        .strip_prefix(base)
        .map_err(|err| SipError::Filesystem(err.to_string()))?;
    Ok(relative.to_string_lossy().replace('\\', "/"))
}
