use std::fs;
use std::time::{Duration, Instant};

use camino::Utf8Path;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::builder::PackageBuilder;
use crate::catalogue::{
    CatalogueClient, MetadataFetcher, Module, PreservationLogEntry,
    append_log_entry, field_value,
};
use crate::classify::Classifier;
use crate::config::{PackagingSettings, PreservationLogField, ResolvedConfig};
use crate::domain::{ObjectId, PackageKey, ServiceOutcome, Stage};
use crate::download::{AttachmentDownloader, reuse_completed};
use crate::error::{PreservationOutcome, SipError};
use crate::events::{
    DESCRIPTION_PATH, OBJECT_DOCUMENT_PATH, collection_activity_document_path,
    multimedia_document_path,
};
use crate::fs_util;
use crate::package::{Assembler, CancelFlag, PackageDates};
use crate::store::{DownloadRecord, StageRecord, Store, atomic_rename_dir, io_error};
use crate::transfer::{TransferChannel, TransferClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Download,
    Create,
    Submit,
    Confirm,
    Status,
}

#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub create_date: DateTime<Utc>,
    pub modify_date: Option<DateTime<Utc>>,
    pub update: bool,
}

/// Short reason and detail of a classified preservation failure, used by
/// the scheduler to freeze the object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FreezeReason {
    pub error: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum StageDetails {
    Download {
        title: Option<String>,
        modified: DateTime<Utc>,
        attachments: usize,
        downloaded_bytes: u64,
        collection_activities: usize,
    },
    Create {
        package_name: String,
        archive_path: String,
        files: usize,
        events: usize,
    },
    Submit {
        package_name: String,
        transfer_id: String,
        submitted_at: DateTime<Utc>,
    },
    Confirm {
        package_name: String,
        result_path: Option<String>,
        archive_dir: String,
        reports: usize,
        log_entry_added: bool,
    },
    Status {
        download: Option<DateTime<Utc>>,
        record: Option<StageRecord>,
    },
}

/// Outcome of one stage invocation, printed for the scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: StageName,
    pub object_id: ObjectId,
    pub package_id: Option<String>,
    #[serde(flatten)]
    pub outcome: PreservationOutcome,
    pub category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preservation_error: Option<FreezeReason>,
    pub state: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<StageDetails>,
}

impl StageReport {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, PreservationOutcome::Success)
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Settings the controller needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub packaging: PackagingSettings,
    pub preservation_log: Option<PreservationLogField>,
}

impl From<&ResolvedConfig> for ControllerSettings {
    fn from(config: &ResolvedConfig) -> Self {
        Self {
            packaging: config.packaging.clone(),
            preservation_log: config.catalogue.preservation_log.clone(),
        }
    }
}

/// Runs the four pipeline stages for one (object id, package id) pair.
///
/// Every stage returns a [`StageReport`]; failures are classified and
/// reported, never retried here.
pub struct Controller<C: CatalogueClient, B: PackageBuilder, T: TransferChannel> {
    store: Store,
    catalogue: C,
    builder: B,
    transfer: TransferClient<T>,
    classifier: Classifier,
    settings: ControllerSettings,
    cancel: CancelFlag,
}

impl<C: CatalogueClient, B: PackageBuilder, T: TransferChannel> Controller<C, B, T> {
    pub fn new(
        store: Store,
        catalogue: C,
        builder: B,
        channel: T,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            store,
            catalogue,
            builder,
            transfer: TransferClient::new(channel),
            classifier: Classifier::default(),
            settings,
            cancel: CancelFlag::default(),
        }
    }

    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Handle that stops the running stage at its next step boundary.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn download(&self, object_id: &ObjectId, sink: &dyn ProgressSink) -> StageReport {
        let started = Instant::now();
        let result = self.run_download(object_id, sink, started);
        self.finish(StageName::Download, object_id, None, result)
    }

    pub fn create(
        &self,
        key: &PackageKey,
        options: &CreateOptions,
        sink: &dyn ProgressSink,
    ) -> StageReport {
        let started = Instant::now();
        let result = self.run_create(key, options, sink, started);
        self.finish(StageName::Create, &key.object_id, Some(key), result)
    }

    pub fn submit(&self, key: &PackageKey, sink: &dyn ProgressSink) -> StageReport {
        let started = Instant::now();
        let result = self.run_submit(key, sink, started);
        self.finish(StageName::Submit, &key.object_id, Some(key), result)
    }

    /// Reads the service's verdict. `archive_dir` overrides the configured
    /// archive location for reports and logs.
    pub fn confirm(
        &self,
        key: &PackageKey,
        expected: ServiceOutcome,
        archive_dir: Option<&Utf8Path>,
        sink: &dyn ProgressSink,
    ) -> StageReport {
        let started = Instant::now();
        let archive_root = archive_dir.unwrap_or(self.store.archive_root());
        let result = self.run_confirm(key, expected, archive_root, sink, started);
        self.finish(StageName::Confirm, &key.object_id, Some(key), result)
    }

    pub fn status(&self, key: &PackageKey) -> StageReport {
        let result = self.run_status(key);
        self.finish(StageName::Status, &key.object_id, Some(key), result)
    }

    /// Current stage of a package, derived from the persisted records.
    pub fn current_stage(&self, key: &PackageKey) -> Result<Stage, SipError> {
        if let Some(record) = self.store.load_record(key)? {
            return Ok(record.stage);
        }
        if self.store.load_download(&key.object_id)?.is_some() {
            return Ok(Stage::Downloaded);
        }
        Ok(Stage::NotStarted)
    }

    fn run_status(&self, key: &PackageKey) -> Result<StageDetails, SipError> {
        let download = self.store.load_download(&key.object_id)?;
        let record = self.store.load_record(key)?;
        Ok(StageDetails::Status {
            download: download.map(|record| record.downloaded_at),
            record,
        })
    }

    fn run_download(
        &self,
        object_id: &ObjectId,
        sink: &dyn ProgressSink,
        started: Instant,
    ) -> Result<StageDetails, SipError> {
        progress(sink, started, format!("phase=Fetch; object={object_id}"));
        let mut object = MetadataFetcher::new(&self.catalogue).fetch(object_id)?;
        self.cancel.check("description download")?;

        // Everything is assembled in a staging directory and replaces the
        // previous content only once complete. The old download record is
        // dropped first, so a crash during the swap leaves no record rather
        // than a record describing other content.
        let content_dir = self.store.content_dir(object_id);
        let staging = self.store.content_staging_dir(object_id);
        Store::remove_dir(&staging)?;
        Store::write_bytes_atomic(
            &staging.join(OBJECT_DOCUMENT_PATH),
            object.document.as_bytes(),
        )?;
        let description = self.catalogue.description_report(object_id)?;
        Store::write_bytes_atomic(&staging.join(DESCRIPTION_PATH), &description)?;
        object.description_retrieved_at = Some(Utc::now());

        for attachment in &object.attachments {
            Store::write_bytes_atomic(
                &staging.join(multimedia_document_path(&attachment.id)),
                attachment.document.as_bytes(),
            )?;
        }
        for activity in &object.collection_activities {
            Store::write_bytes_atomic(
                &staging.join(collection_activity_document_path(&activity.id)),
                activity.document.as_bytes(),
            )?;
        }
        let reused = reuse_completed(&content_dir, &staging, &object.attachments)?;

        progress(
            sink,
            started,
            format!(
                "phase=Download; object={object_id}; attachments={}; reused={reused}",
                object.attachments.len()
            ),
        );
        let downloader = AttachmentDownloader::new(
            &self.catalogue,
            self.settings.packaging.download_concurrency,
            self.settings.packaging.min_free_space_bytes,
            &self.cancel,
        );
        object.attachments = downloader.download_all(&object.attachments, &staging)?;
        self.cancel.check("publishing download")?;

        self.store.discard_download(object_id)?;
        atomic_rename_dir(staging.as_std_path(), content_dir.as_std_path())
            .map_err(|err| io_error(&content_dir, err))?;

        let record = DownloadRecord {
            object_id: object_id.clone(),
            downloaded_at: Utc::now(),
            snapshot: object,
        };
        self.store.save_download(&record)?;
        info!(object_id = %object_id, "object downloaded");

        let snapshot = &record.snapshot;
        Ok(StageDetails::Download {
            title: snapshot.title.clone(),
            modified: snapshot.modified,
            attachments: snapshot.attachments.len(),
            downloaded_bytes: snapshot.attachments.iter().filter_map(|a| a.size).sum(),
            collection_activities: snapshot.collection_activities.len(),
        })
    }

    fn run_create(
        &self,
        key: &PackageKey,
        options: &CreateOptions,
        sink: &dyn ProgressSink,
        started: Instant,
    ) -> Result<StageDetails, SipError> {
        let download = self.store.load_download(&key.object_id)?.ok_or_else(|| {
            SipError::Precondition(format!(
                "object {} has not been downloaded",
                key.object_id
            ))
        })?;
        let dates = PackageDates::new(options.create_date, options.modify_date, options.update)?;

        let mut record = self
            .store
            .load_record(key)?
            .unwrap_or_else(|| StageRecord::new(key));
        if record.stage == Stage::Submitted {
            return Err(SipError::Precondition(format!(
                "package {key} is awaiting confirmation"
            )));
        }
        if dates.update {
            self.check_update(key, &dates)?;
        }

        progress(sink, started, format!("phase=Assemble; package={key}"));
        let assembler = Assembler::new(&self.builder, &self.settings.packaging, &self.cancel);
        let package = assembler.assemble(
            &download.snapshot,
            key,
            &dates,
            &self.store.content_dir(&key.object_id),
            &self.store.package_dir(key),
        )?;

        record.stage = Stage::Packaged;
        record.create_date = Some(package.create_date);
        record.modify_date = package.modify_date;
        record.update = package.update;
        record.package_name = Some(package.name.clone());
        record.object_modified = Some(package.object_modified);
        record.events = package.events.clone();
        record.receipt = None;
        record.last_failure = None;
        record.updated_at = Utc::now();
        self.store.save_record(&record)?;
        info!(object_id = %key.object_id, package_id = %key.package_id, package = %package.name, "package created");

        Ok(StageDetails::Create {
            package_name: package.name,
            archive_path: package.archive_path.to_string(),
            files: package.files.len(),
            events: package.events.len(),
        })
    }

    /// An update package needs an earlier package of the object with the
    /// same create date, and a modify date later than any before it.
    fn check_update(&self, key: &PackageKey, dates: &PackageDates) -> Result<(), SipError> {
        let previous: Vec<StageRecord> = self
            .store
            .list_records(&key.object_id)?
            .into_iter()
            .filter(|record| {
                record.stage >= Stage::Packaged && record.create_date == Some(dates.create_date)
            })
            .collect();
        if previous.is_empty() {
            return Err(SipError::Precondition(format!(
                "no earlier package of object {} was created on {}",
                key.object_id,
                dates.create_date.to_rfc3339()
            )));
        }
        if let (Some(latest), Some(modified)) = (
            previous.iter().filter_map(|record| record.modify_date).max(),
            dates.modify_date,
        ) {
            if modified <= latest {
                return Err(SipError::Precondition(format!(
                    "modify date {} is not later than the previous {}",
                    modified.to_rfc3339(),
                    latest.to_rfc3339()
                )));
            }
        }
        Ok(())
    }

    fn run_submit(
        &self,
        key: &PackageKey,
        sink: &dyn ProgressSink,
        started: Instant,
    ) -> Result<StageDetails, SipError> {
        let mut record = self.require_stage(key, Stage::Packaged)?;
        let name = package_name(&record)?;
        let archive = self.store.package_dir(key).join(&name);
        if !archive.as_std_path().is_file() {
            return Err(SipError::Precondition(format!(
                "package archive {archive} is missing"
            )));
        }
        self.cancel.check("upload")?;

        progress(sink, started, format!("phase=Submit; package={name}"));
        let receipt = self.transfer.submit(&archive, &name)?;

        record.stage = Stage::Submitted;
        record.receipt = Some(receipt.clone());
        record.last_failure = None;
        record.updated_at = Utc::now();
        self.store.save_record(&record)?;
        info!(object_id = %key.object_id, package_id = %key.package_id, transfer_id = %receipt.transfer_id, "package submitted");

        Ok(StageDetails::Submit {
            package_name: name,
            transfer_id: receipt.transfer_id,
            submitted_at: receipt.submitted_at,
        })
    }

    fn run_confirm(
        &self,
        key: &PackageKey,
        expected: ServiceOutcome,
        archive_root: &Utf8Path,
        sink: &dyn ProgressSink,
        started: Instant,
    ) -> Result<StageDetails, SipError> {
        let mut record = self
            .store
            .load_record(key)?
            .ok_or_else(|| SipError::Precondition(format!("package {key} was never created")))?;
        let name = package_name(&record)?;
        let archive_dir = Store::archive_dir_for(archive_root, &key.object_id, &name);

        if record.stage == expected.stage() {
            info!(package = %name, outcome = %expected, "package already confirmed");
            return Ok(StageDetails::Confirm {
                package_name: name,
                result_path: None,
                archive_dir: archive_dir.to_string(),
                reports: 0,
                log_entry_added: false,
            });
        }
        if record.stage != Stage::Submitted {
            return Err(SipError::Precondition(format!(
                "package {key} is {}, expected submitted",
                record.stage
            )));
        }
        let receipt = record.receipt.clone().ok_or_else(|| {
            SipError::Precondition(format!("package {key} has no transfer receipt"))
        })?;

        progress(sink, started, format!("phase=Confirm; package={name}"));
        let report = self.transfer.confirm(&receipt, expected)?;
        self.cancel.check("archiving")?;

        let fetched = self
            .transfer
            .fetch_reports(&report, &archive_dir.join("reports"))?;
        self.archive_logs(key, &archive_dir)?;

        let log_entry_added = match &self.settings.preservation_log {
            Some(field) => {
                self.add_log_entry(key, field, &record, &name, expected)?;
                true
            }
            None => false,
        };

        record.stage = expected.stage();
        record.last_failure = None;
        record.updated_at = Utc::now();
        self.store.save_record(&record)?;
        Store::remove_dir(&self.store.package_dir(key))?;
        info!(object_id = %key.object_id, package_id = %key.package_id, outcome = %expected, "package confirmed");

        Ok(StageDetails::Confirm {
            package_name: name,
            result_path: Some(report.result_path),
            archive_dir: archive_dir.to_string(),
            reports: fetched.len(),
            log_entry_added,
        })
    }

    fn archive_logs(&self, key: &PackageKey, archive_dir: &Utf8Path) -> Result<(), SipError> {
        let log_dir = self.store.package_dir(key).join("logs");
        if !log_dir.as_std_path().is_dir() {
            return Ok(());
        }
        let target = archive_dir.join("logs");
        fs::create_dir_all(target.as_std_path()).map_err(|err| io_error(&target, err))?;
        for entry in fs::read_dir(log_dir.as_std_path()).map_err(|err| io_error(&log_dir, err))? {
            let path = entry.map_err(|err| io_error(&log_dir, err))?.path();
            if !path.is_file() {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let destination = target.join(format!("{file_name}.gz"));
            fs_util::gzip_file(&path, destination.as_std_path())?;
        }
        Ok(())
    }

    fn add_log_entry(
        &self,
        key: &PackageKey,
        field: &PreservationLogField,
        record: &StageRecord,
        package_name: &str,
        outcome: ServiceOutcome,
    ) -> Result<(), SipError> {
        let document = self
            .catalogue
            .module_item(Module::Object, key.object_id.as_str())?;
        let existing = field_value(&document, &field.name)?;
        let entry = PreservationLogEntry {
            filename: package_name.to_string(),
            status: outcome.as_str().to_string(),
            object_modify_date: record
                .object_modified
                .map(|date| date.to_rfc3339_opts(SecondsFormat::Secs, true))
                .unwrap_or_default(),
            date: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        };
        let value = append_log_entry(existing.as_deref(), entry)?;
        self.catalogue
            .update_object_field(&key.object_id, field, &value)
    }

    fn require_stage(&self, key: &PackageKey, stage: Stage) -> Result<StageRecord, SipError> {
        match self.store.load_record(key)? {
            Some(record) if record.stage == stage => Ok(record),
            Some(record) => Err(SipError::Precondition(format!(
                "package {key} is {}, expected {stage}",
                record.stage
            ))),
            None => Err(SipError::Precondition(format!(
                "package {key} has not been created"
            ))),
        }
    }

    fn finish(
        &self,
        stage: StageName,
        object_id: &ObjectId,
        key: Option<&PackageKey>,
        result: Result<StageDetails, SipError>,
    ) -> StageReport {
        let (outcome, category, preservation_error, details) = match result {
            Ok(details) => (
                PreservationOutcome::Success,
                "Success".to_string(),
                None,
                Some(details),
            ),
            Err(err) => {
                let err = self.classifier.classify(err);
                let category = err.category();
                warn!(object_id = %object_id, ?stage, %category, error = %err, "stage failed");
                if let Some(key) = key {
                    self.remember_failure(key, &category);
                }
                let freeze = match &err {
                    SipError::Preservation(preservation) => Some(FreezeReason {
                        error: preservation.error.clone(),
                        detail: preservation.detail.clone(),
                    }),
                    _ => None,
                };
                (err.outcome(), category, freeze, None)
            }
        };
        let state = key
            .map(|key| self.current_stage(key))
            .unwrap_or_else(|| self.current_stage(&PackageKey::new(object_id.clone(), None)))
            .unwrap_or(Stage::NotStarted);
        StageReport {
            stage,
            object_id: object_id.clone(),
            package_id: key.map(|key| key.package_id.to_string()),
            outcome,
            category,
            preservation_error,
            state,
            details,
        }
    }

    fn remember_failure(&self, key: &PackageKey, category: &str) {
        let Ok(Some(mut record)) = self.store.load_record(key) else {
            return;
        };
        record.last_failure = Some(category.to_string());
        record.updated_at = Utc::now();
        if let Err(err) = self.store.save_record(&record) {
            warn!(package = %key, error = %err, "failed to record stage failure");
        }
    }
}

fn progress(sink: &dyn ProgressSink, started: Instant, message: String) {
    sink.event(ProgressEvent {
        message,
        elapsed: Some(started.elapsed()),
    });
}

fn package_name(record: &StageRecord) -> Result<String, SipError> {
    record.package_name.clone().ok_or_else(|| {
        SipError::Precondition(format!("package {} has no archive name", record.key()))
    })
}
