use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::catalogue::CatalogueObject;
use crate::config::PathSettings;
use crate::domain::{ObjectId, PackageId, PackageKey, Stage};
use crate::error::SipError;
use crate::events::ProvenanceEvent;
use crate::transfer::TransferReceipt;

const ARCHIVE_PART_LENGTH: usize = 3;

/// Result of the last `download` of an object, shared by all of its
/// packages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub object_id: ObjectId,
    pub downloaded_at: DateTime<Utc>,
    pub snapshot: CatalogueObject,
}

/// Persisted pipeline state of one (object id, package id) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub object_id: ObjectId,
    pub package_id: PackageId,
    pub stage: Stage,
    pub create_date: Option<DateTime<Utc>>,
    pub modify_date: Option<DateTime<Utc>>,
    pub update: bool,
    pub package_name: Option<String>,
    /// Modification time of the object snapshot the package was built from.
    pub object_modified: Option<DateTime<Utc>>,
    pub events: Vec<ProvenanceEvent>,
    pub receipt: Option<TransferReceipt>,
    pub last_failure: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl StageRecord {
    pub fn new(key: &PackageKey) -> Self {
        Self {
            object_id: key.object_id.clone(),
            package_id: key.package_id.clone(),
            stage: Stage::NotStarted,
            create_date: None,
            modify_date: None,
            update: false,
            package_name: None,
            object_modified: None,
            events: Vec::new(),
            receipt: None,
            last_failure: None,
            updated_at: Utc::now(),
        }
    }

    pub fn key(&self) -> PackageKey {
        PackageKey {
            object_id: self.object_id.clone(),
            package_id: self.package_id.clone(),
        }
    }
}

/// Local working area. One directory per object:
///
/// ```text
/// <root>/<object>/download.json
/// <root>/<object>/sip/{reports,attachments,collection_activities}/...
/// <root>/<object>/records/<package>.json
/// <root>/<object>/packages/<package>/{<name>.tar,logs/}
/// ```
#[derive(Debug, Clone)]
pub struct Store {
    package_root: Utf8PathBuf,
    archive_root: Utf8PathBuf,
}

impl Store {
    pub fn new(paths: &PathSettings) -> Self {
        Self::new_with_paths(paths.package_dir.clone(), paths.archive_dir.clone())
    }

    pub fn new_with_paths(package_root: Utf8PathBuf, archive_root: Utf8PathBuf) -> Self {
        Self {
            package_root,
            archive_root,
        }
    }

    pub fn package_root(&self) -> &Utf8Path {
        &self.package_root
    }

    pub fn archive_root(&self) -> &Utf8Path {
        &self.archive_root
    }

    pub fn object_dir(&self, id: &ObjectId) -> Utf8PathBuf {
        self.package_root.join(id.as_str())
    }

    /// Downloaded metadata and attachments, laid out as inside the package.
    pub fn content_dir(&self, id: &ObjectId) -> Utf8PathBuf {
        self.object_dir(id).join("sip")
    }

    /// Where a download is assembled before it replaces `content_dir`.
    pub fn content_staging_dir(&self, id: &ObjectId) -> Utf8PathBuf {
        self.object_dir(id).join(".sip.partial")
    }

    pub fn packages_dir(&self, id: &ObjectId) -> Utf8PathBuf {
        self.object_dir(id).join("packages")
    }

    pub fn package_dir(&self, key: &PackageKey) -> Utf8PathBuf {
        self.packages_dir(&key.object_id)
            .join(key.package_id.as_str())
    }

    pub fn download_record_path(&self, id: &ObjectId) -> Utf8PathBuf {
        self.object_dir(id).join("download.json")
    }

    pub fn record_path(&self, key: &PackageKey) -> Utf8PathBuf {
        self.object_dir(&key.object_id)
            .join("records")
            .join(format!("{}.json", key.package_id))
    }

    /// Archive directory for a finished package, sharded by object id so
    /// no single directory grows unbounded.
    pub fn archive_dir_for(
        root: &Utf8Path,
        object_id: &ObjectId,
        package_name: &str,
    ) -> Utf8PathBuf {
        let mut path = root.to_path_buf();
        for part in archive_path_parts(object_id) {
            path.push(part);
        }
        path.push(format!("Object_{object_id}"));
        path.push(package_name);
        path
    }

    pub fn load_download(&self, id: &ObjectId) -> Result<Option<DownloadRecord>, SipError> {
        read_json(&self.download_record_path(id))
    }

    pub fn save_download(&self, record: &DownloadRecord) -> Result<(), SipError> {
        Self::write_json_atomic(&self.download_record_path(&record.object_id), record)
    }

    /// Forgets the recorded download; `create` refuses until the next one
    /// completes.
    pub fn discard_download(&self, id: &ObjectId) -> Result<(), SipError> {
        let path = self.download_record_path(id);
        match fs::remove_file(path.as_std_path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error(&path, err)),
        }
    }

    pub fn load_record(&self, key: &PackageKey) -> Result<Option<StageRecord>, SipError> {
        read_json(&self.record_path(key))
    }

    pub fn save_record(&self, record: &StageRecord) -> Result<(), SipError> {
        Self::write_json_atomic(&self.record_path(&record.key()), record)
    }

    /// Every package record of an object, ordered by package id.
    pub fn list_records(&self, id: &ObjectId) -> Result<Vec<StageRecord>, SipError> {
        let dir = self.object_dir(id).join("records");
        let entries = match fs::read_dir(dir.as_std_path()) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(SipError::Filesystem(format!("read {dir}: {err}"))),
        };
        let mut records = Vec::new();
        for entry in entries {
            let path = entry.map_err(|err| SipError::Filesystem(err.to_string()))?.path();
            if path.extension().map(|ext| ext == "json").unwrap_or(false) {
                let path = Utf8PathBuf::from_path_buf(path)
                    .map_err(|_| SipError::Filesystem("invalid record path".to_string()))?;
                if let Some(record) = read_json::<StageRecord>(&path)? {
                    records.push(record);
                }
            }
        }
        records.sort_by(|a, b| a.package_id.cmp(&b.package_id));
        Ok(records)
    }

    pub fn write_json_atomic<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), SipError> {
        let content = serde_json::to_vec_pretty(value)
            .map_err(|err| SipError::Filesystem(err.to_string()))?;
        Self::write_bytes_atomic(path, &content)
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), SipError> {
        let parent = path
            .parent()
            .ok_or_else(|| SipError::Filesystem(format!("invalid destination path {path}")))?;
        fs::create_dir_all(parent.as_std_path()).map_err(|err| io_error(parent, err))?;
        let mut temp = tempfile::Builder::new()
            .prefix(".museum-sip")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| io_error(parent, err))?;
        io::Write::write_all(&mut temp, content).map_err(|err| io_error(path, err))?;
        temp.as_file()
            .sync_all()
            .map_err(|err| io_error(path, err))?;
        temp.persist(path.as_std_path())
            .map_err(|err| io_error(path, err.error))?;
        Ok(())
    }

    pub fn copy_dir_recursive(source: &Utf8Path, dest: &Utf8Path) -> Result<(), SipError> {
        fs::create_dir_all(dest.as_std_path()).map_err(|err| io_error(dest, err))?;
        for entry in walk_dir(source.as_std_path())? {
            let relative = entry
                .strip_prefix(source.as_std_path())
                .map_err(|err| SipError::Filesystem(err.to_string()))?;
            let target = dest.as_std_path().join(relative);
            if entry.is_dir() {
                fs::create_dir_all(&target).map_err(|err| io_error(dest, err))?;
            } else {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).map_err(|err| io_error(dest, err))?;
                }
                fs::copy(&entry, &target).map_err(|err| io_error(dest, err))?;
            }
        }
        Ok(())
    }

    /// Removes a directory tree, treating an already missing one as done.
    pub fn remove_dir(path: &Utf8Path) -> Result<(), SipError> {
        match fs::remove_dir_all(path.as_std_path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error(path, err)),
        }
    }
}

/// Files under `root`, depth-first, directories included.
pub fn walk_dir(root: &Path) -> Result<Vec<PathBuf>, SipError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries = fs::read_dir(&path)
            .map_err(|err| SipError::Filesystem(format!("read {}: {err}", path.display())))?;
        for entry in entries {
            let entry = entry.map_err(|err| SipError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path.clone());
            }
            items.push(path);
        }
    }
    items.sort();
    Ok(items)
}

pub fn atomic_rename_dir(from: &Path, to: &Path) -> io::Result<()> {
    if to.exists() {
        fs::remove_dir_all(to)?;
    }
    fs::rename(from, to)
}

/// Maps an I/O failure, keeping a full disk distinguishable.
pub fn io_error(path: impl AsRef<Utf8Path>, err: io::Error) -> SipError {
    let path = path.as_ref();
    if err.kind() == io::ErrorKind::StorageFull {
        SipError::StorageExhausted(format!("{path}: {err}"))
    } else {
        SipError::Filesystem(format!("{path}: {err}"))
    }
}

fn archive_path_parts(object_id: &ObjectId) -> Vec<String> {
    let chars: Vec<char> = object_id.as_str().chars().collect();
    chars
        .chunks(ARCHIVE_PART_LENGTH)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

fn read_json<T: DeserializeOwned>(path: &Utf8Path) -> Result<Option<T>, SipError> {
    let content = match fs::read(path.as_std_path()) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(io_error(path, err)),
    };
    serde_json::from_slice(&content)
        .map(Some)
        .map_err(|err| SipError::Filesystem(format!("corrupt state file {path}: {err}")))
}
