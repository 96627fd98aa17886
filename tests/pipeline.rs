use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use chrono::{DateTime, TimeZone, Utc};

use museum_sip::app::{Controller, ControllerSettings, CreateOptions, StageReport};
use museum_sip::builder::{BuildLayout, BuildStep, PackageBuilder, append_transcript};
use museum_sip::catalogue::{CatalogueClient, Module};
use museum_sip::config::{PackagingSettings, PreservationLogField};
use museum_sip::domain::{ObjectId, PackageKey, ServiceOutcome, Stage};
use museum_sip::error::{PreservationOutcome, RetryReason, SipError, ToolFailure};
use museum_sip::output::JsonOutput;
use museum_sip::store::Store;
use museum_sip::transfer::DirectoryChannel;

const OBJECT_ID: &str = "1234567";

fn object_xml(with_content: bool) -> String {
    if with_content {
        linked_object_xml("Teapot", "20")
    } else {
        object_document("")
    }
}

fn linked_object_xml(title: &str, attachment_id: &str) -> String {
    object_document(&format!(
        r#"<dataField name="ObjObjectTitleTxt"><value>{title}</value></dataField>
        <moduleReference name="ObjMultimediaRef">
          <moduleReferenceItem moduleItemId="{attachment_id}"/>
        </moduleReference>"#
    ))
}

fn object_document(content: &str) -> String {
    format!(
        r#"<application xmlns="http://www.zetcom.com/ria/ws/module">
  <modules><module name="Object"><moduleItem id="{OBJECT_ID}">
    <systemField name="__lastModified"><value>2019-01-02 10:00:00.000</value></systemField>
    <systemField name="__created"><value>2018-11-21 09:00:00.000</value></systemField>
    <systemField name="__createdUser"><value>ZET_DÜ</value></systemField>
    {content}
  </moduleItem></module></modules></application>"#
    )
}

fn multimedia_xml(id: &str) -> String {
    format!(
        r#"<application xmlns="http://www.zetcom.com/ria/ws/module">
  <modules><module name="Multimedia"><moduleItem id="{id}">
    <systemField name="__created"><value>2019-03-01 10:00:00.000</value></systemField>
    <dataField name="MulOriginalFileTxt"><value>front.tif</value></dataField>
  </moduleItem></module></modules></application>"#
    )
}

struct MockCatalogue {
    object: Arc<Mutex<String>>,
    failure: Option<fn() -> SipError>,
    unavailable_attachment: Option<&'static str>,
    updates: Arc<Mutex<Vec<String>>>,
}

impl MockCatalogue {
    fn new() -> Self {
        Self {
            object: Arc::new(Mutex::new(object_xml(true))),
            failure: None,
            unavailable_attachment: None,
            updates: Arc::default(),
        }
    }
}

impl CatalogueClient for MockCatalogue {
    fn module_item(&self, module: Module, id: &str) -> Result<String, SipError> {
        if let Some(failure) = self.failure {
            return Err(failure());
        }
        match module {
            Module::Object => Ok(self.object.lock().unwrap().clone()),
            Module::Multimedia => Ok(multimedia_xml(id)),
            Module::CollectionActivity => Err(SipError::NotFound(id.to_string())),
        }
    }

    fn description_report(&self, _object_id: &ObjectId) -> Result<Vec<u8>, SipError> {
        Ok(b"<lido:lidoWrap/>".to_vec())
    }

    fn download_attachment(
        &self,
        multimedia_id: &str,
        destination: &Path,
    ) -> Result<Option<u64>, SipError> {
        if self.unavailable_attachment == Some(multimedia_id) {
            return Err(SipError::Timeout(format!("Multimedia/{multimedia_id}/attachment")));
        }
        fs::write(destination, b"II*\0image").unwrap();
        Ok(Some(9))
    }

    fn update_object_field(
        &self,
        _object_id: &ObjectId,
        _field: &PreservationLogField,
        value: &str,
    ) -> Result<(), SipError> {
        self.updates.lock().unwrap().push(value.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct MockBuilder {
    import_stderr: Option<String>,
}

impl PackageBuilder for MockBuilder {
    fn run(&self, step: &BuildStep, layout: &BuildLayout) -> Result<(), SipError> {
        let command = step.command(layout);
        let log = layout.log_dir.join(format!("{}.log", step.tool()));
        append_transcript(&log, &command, "", "", Utc::now()).unwrap();
        match step {
            BuildStep::ImportObject { path, .. } if path.ends_with(".tif") => {
                if let Some(stderr) = &self.import_stderr {
                    return Err(SipError::Tool(ToolFailure {
                        command,
                        status: Some(1),
                        stdout: String::new(),
                        stderr: stderr.clone(),
                    }));
                }
            }
            BuildStep::CompileMets(_) => {
                fs::write(layout.workspace_dir.join("mets.xml"), b"<mets/>").unwrap();
            }
            BuildStep::SignMets { .. } => {
                fs::write(layout.workspace_dir.join("signature.sig"), b"sig").unwrap();
            }
            _ => {}
        }
        Ok(())
    }
}

struct Fixture {
    _temp: tempfile::TempDir,
    root: Utf8PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        Self { _temp: temp, root }
    }

    fn controller(
        &self,
        catalogue: MockCatalogue,
        builder: MockBuilder,
    ) -> Controller<MockCatalogue, MockBuilder, DirectoryChannel> {
        let settings = ControllerSettings {
            packaging: PackagingSettings {
                organization_name: "Test Museum".to_string(),
                contract_id: "urn:uuid:contract".to_string(),
                sign_key_path: self.root.join("sign.pem"),
                tool_dir: None,
                download_concurrency: 2,
                min_free_space_bytes: 0,
            },
            preservation_log: Some(PreservationLogField {
                name: "ObjPreservationLogClb".to_string(),
                field_type: "dataField".to_string(),
            }),
        };
        Controller::new(
            Store::new_with_paths(self.root.join("objects"), self.root.join("archive")),
            catalogue,
            builder,
            DirectoryChannel::new(self.root.join("service")),
            settings,
        )
    }

    fn publish(&self, outcome: &str, package_name: &str) {
        let dir = self
            .root
            .join("service")
            .join(outcome)
            .join("2019-02-01")
            .join(package_name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("ingest-report.xml"), b"<report/>").unwrap();
    }
}

fn key() -> PackageKey {
    PackageKey::new(OBJECT_ID.parse().unwrap(), None)
}

fn date(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

fn options(create: DateTime<Utc>, modify: Option<DateTime<Utc>>, update: bool) -> CreateOptions {
    CreateOptions {
        create_date: create,
        modify_date: modify,
        update,
    }
}

fn assert_success(report: &StageReport) {
    assert!(report.is_success(), "stage failed: {report:?}");
}

const PACKAGE_NAME: &str = "20190102_Object_1234567.tar";

#[test]
fn create_requires_download() {
    let fixture = Fixture::new();
    let controller = fixture.controller(MockCatalogue::new(), MockBuilder::default());

    let report = controller.create(&key(), &options(date(2020, 1, 1), None, false), &JsonOutput);
    assert_eq!(report.category, "PreconditionError");
    assert!(report.outcome.is_terminal());
    assert_eq!(report.state, Stage::NotStarted);
}

#[test]
fn full_cycle_archives_and_logs() {
    let fixture = Fixture::new();
    let controller = fixture.controller(MockCatalogue::new(), MockBuilder::default());
    let id: ObjectId = OBJECT_ID.parse().unwrap();

    assert_success(&controller.download(&id, &JsonOutput));
    assert!(
        fixture
            .root
            .join("objects/1234567/sip/attachments/20/front.tif")
            .exists()
    );

    let created = controller.create(&key(), &options(date(2020, 1, 1), None, false), &JsonOutput);
    assert_success(&created);
    assert_eq!(created.state, Stage::Packaged);

    let submitted = controller.submit(&key(), &JsonOutput);
    assert_success(&submitted);
    assert!(
        fixture
            .root
            .join("service/transfer")
            .join(PACKAGE_NAME)
            .exists()
    );

    fixture.publish("accepted", PACKAGE_NAME);
    let confirmed = controller.confirm(&key(), ServiceOutcome::Accepted, None, &JsonOutput);
    assert_success(&confirmed);
    assert_eq!(confirmed.state, Stage::Accepted);

    let archive = Store::archive_dir_for(
        &fixture.root.join("archive"),
        &OBJECT_ID.parse().unwrap(),
        PACKAGE_NAME,
    );
    assert!(archive.join("reports/ingest-report.xml").exists());
    assert!(archive.join("logs/import-object.log.gz").exists());
    assert!(!fixture.root.join("objects/1234567/packages/1234567").exists());

    let again = controller.confirm(&key(), ServiceOutcome::Accepted, None, &JsonOutput);
    assert_success(&again);
}

#[test]
fn confirm_records_log_entry() {
    let fixture = Fixture::new();
    let catalogue = MockCatalogue::new();
    let updates = Arc::clone(&catalogue.updates);
    let controller = fixture.controller(catalogue, MockBuilder::default());
    let id: ObjectId = OBJECT_ID.parse().unwrap();
    assert_success(&controller.download(&id, &JsonOutput));
    assert_success(&controller.create(&key(), &options(date(2020, 1, 1), None, false), &JsonOutput));
    assert_success(&controller.submit(&key(), &JsonOutput));
    fixture.publish("rejected", PACKAGE_NAME);

    let report = controller.confirm(&key(), ServiceOutcome::Rejected, None, &JsonOutput);
    assert_success(&report);
    assert_eq!(report.state, Stage::Rejected);

    let updates = updates.lock().unwrap().clone();
    assert_eq!(updates.len(), 1);
    let entries: serde_json::Value = serde_json::from_str(&updates[0]).unwrap();
    assert_eq!(entries[0]["filename"], PACKAGE_NAME);
    assert_eq!(entries[0]["status"], "rejected");

    let status = controller.status(&key());
    assert_eq!(status.state, Stage::Rejected);
}

#[test]
fn contradicting_verdict_is_not_accepted() {
    let fixture = Fixture::new();
    let controller = fixture.controller(MockCatalogue::new(), MockBuilder::default());
    let id: ObjectId = OBJECT_ID.parse().unwrap();
    assert_success(&controller.download(&id, &JsonOutput));
    assert_success(&controller.create(&key(), &options(date(2020, 1, 1), None, false), &JsonOutput));
    assert_success(&controller.submit(&key(), &JsonOutput));
    fixture.publish("rejected", PACKAGE_NAME);

    let report = controller.confirm(&key(), ServiceOutcome::Accepted, None, &JsonOutput);
    assert_eq!(report.category, "UnexpectedOutcomeError");
    assert!(report.outcome.is_terminal());
    assert_eq!(report.state, Stage::Submitted);

    let record = controller.store().load_record(&key()).unwrap().unwrap();
    assert_eq!(record.last_failure.as_deref(), Some("UnexpectedOutcomeError"));
}

#[test]
fn unpublished_result_is_retryable() {
    let fixture = Fixture::new();
    let controller = fixture.controller(MockCatalogue::new(), MockBuilder::default());
    let id: ObjectId = OBJECT_ID.parse().unwrap();
    assert_success(&controller.download(&id, &JsonOutput));
    assert_success(&controller.create(&key(), &options(date(2020, 1, 1), None, false), &JsonOutput));
    assert_success(&controller.submit(&key(), &JsonOutput));

    let report = controller.confirm(&key(), ServiceOutcome::Accepted, None, &JsonOutput);
    assert_matches!(
        report.outcome,
        PreservationOutcome::RetryableFailure {
            reason: RetryReason::ResultPending,
            ..
        }
    );
}

#[test]
fn update_requires_matching_earlier_package() {
    let fixture = Fixture::new();
    let controller = fixture.controller(MockCatalogue::new(), MockBuilder::default());
    let id: ObjectId = OBJECT_ID.parse().unwrap();
    assert_success(&controller.download(&id, &JsonOutput));

    let no_prior = controller.create(
        &key(),
        &options(date(2020, 1, 1), Some(date(2020, 6, 1)), true),
        &JsonOutput,
    );
    assert_eq!(no_prior.category, "PreconditionError");

    assert_success(&controller.create(&key(), &options(date(2020, 1, 1), None, false), &JsonOutput));

    let not_later = controller.create(
        &key(),
        &options(date(2020, 1, 1), Some(date(2020, 1, 1)), true),
        &JsonOutput,
    );
    assert_eq!(not_later.category, "PreconditionError");

    let other_date = controller.create(
        &key(),
        &options(date(2020, 2, 2), Some(date(2020, 6, 1)), true),
        &JsonOutput,
    );
    assert_eq!(other_date.category, "PreconditionError");

    let update_key = PackageKey::new(id, Some("update1".parse().unwrap()));
    let update = controller.create(
        &update_key,
        &options(date(2020, 1, 1), Some(date(2020, 6, 1)), true),
        &JsonOutput,
    );
    assert_success(&update);
    let record = controller.store().load_record(&update_key).unwrap().unwrap();
    assert!(record.update);
    assert_eq!(
        record.package_name.as_deref(),
        Some("20190102_Object_1234567-update1.tar")
    );
}

#[test]
fn builder_failure_is_classified() {
    let fixture = Fixture::new();
    let builder = MockBuilder {
        import_stderr: Some(
            "ValueError: The file contains multiple streams which is supported only for video containers."
                .to_string(),
        ),
    };
    let controller = fixture.controller(MockCatalogue::new(), builder);
    let id: ObjectId = OBJECT_ID.parse().unwrap();
    assert_success(&controller.download(&id, &JsonOutput));

    let report = controller.create(&key(), &options(date(2020, 1, 1), None, false), &JsonOutput);
    assert_eq!(report.category, "PreservationError:multi-page-image");
    let reason = report.preservation_error.clone().unwrap();
    assert_eq!(reason.error, "Multi-page TIFF not allowed");
    assert!(reason.detail.contains("attachments/20/front.tif"));
    assert_eq!(report.state, Stage::Downloaded);
}

#[test]
fn unmatched_builder_failure_is_unclassified() {
    let fixture = Fixture::new();
    let builder = MockBuilder {
        import_stderr: Some("Segmentation fault".to_string()),
    };
    let controller = fixture.controller(MockCatalogue::new(), builder);
    let id: ObjectId = OBJECT_ID.parse().unwrap();
    assert_success(&controller.download(&id, &JsonOutput));

    let report = controller.create(&key(), &options(date(2020, 1, 1), None, false), &JsonOutput);
    assert_eq!(report.category, "PreservationError:unclassified");
    assert!(report.preservation_error.is_none());
}

#[test]
fn system_fields_only_document_is_incomplete() {
    let fixture = Fixture::new();
    let catalogue = MockCatalogue {
        object: Arc::new(Mutex::new(object_xml(false))),
        ..MockCatalogue::new()
    };
    let controller = fixture.controller(catalogue, MockBuilder::default());

    let report = controller.download(&OBJECT_ID.parse().unwrap(), &JsonOutput);
    assert_eq!(report.category, "IncompleteDocumentError");
    assert!(report.outcome.is_terminal());
    assert!(controller.store().load_download(&OBJECT_ID.parse().unwrap()).unwrap().is_none());
}

fn timeout() -> SipError {
    SipError::Timeout("module/Object/1234567".to_string())
}

#[test]
fn catalogue_timeout_is_retryable() {
    let fixture = Fixture::new();
    let catalogue = MockCatalogue {
        failure: Some(timeout),
        ..MockCatalogue::new()
    };
    let controller = fixture.controller(catalogue, MockBuilder::default());

    let report = controller.download(&OBJECT_ID.parse().unwrap(), &JsonOutput);
    assert_eq!(report.category, "TimeoutError");
    assert!(!report.outcome.is_terminal());
}

#[test]
fn cancelled_create_leaves_no_package() {
    let fixture = Fixture::new();
    let controller = fixture.controller(MockCatalogue::new(), MockBuilder::default());
    let id: ObjectId = OBJECT_ID.parse().unwrap();
    assert_success(&controller.download(&id, &JsonOutput));

    controller.cancel_flag().cancel();
    let report = controller.create(&key(), &options(date(2020, 1, 1), None, false), &JsonOutput);
    assert_eq!(report.category, "Cancelled");
    assert!(!report.outcome.is_terminal());
    assert!(!fixture.root.join("objects/1234567/packages/1234567").exists());
}

#[test]
fn failed_redownload_keeps_previous_snapshot() {
    let fixture = Fixture::new();
    let catalogue = MockCatalogue {
        unavailable_attachment: Some("21"),
        ..MockCatalogue::new()
    };
    let document = Arc::clone(&catalogue.object);
    let controller = fixture.controller(catalogue, MockBuilder::default());
    let id: ObjectId = OBJECT_ID.parse().unwrap();
    assert_success(&controller.download(&id, &JsonOutput));

    *document.lock().unwrap() = linked_object_xml("Kettle", "21");
    let report = controller.download(&id, &JsonOutput);
    assert_eq!(report.category, "TimeoutError");
    assert_eq!(report.state, Stage::Downloaded);

    let content = fixture.root.join("objects/1234567/sip");
    let object = fs::read_to_string(content.join("reports/Object.xml")).unwrap();
    assert!(object.contains("Teapot"));
    assert!(content.join("attachments/20/front.tif").exists());
    assert!(!content.join("attachments/21").exists());
    let record = controller.store().load_download(&id).unwrap().unwrap();
    assert_eq!(record.snapshot.title.as_deref(), Some("Teapot"));

    let created = controller.create(&key(), &options(date(2020, 1, 1), None, false), &JsonOutput);
    assert_success(&created);
    let record = controller.store().load_record(&key()).unwrap().unwrap();
    assert!(
        record
            .events
            .iter()
            .all(|event| event.target.as_deref().is_none_or(|t| !t.contains("attachments/21")))
    );
}

#[test]
fn redownload_replaces_unlinked_attachments() {
    let fixture = Fixture::new();
    let catalogue = MockCatalogue::new();
    let document = Arc::clone(&catalogue.object);
    let controller = fixture.controller(catalogue, MockBuilder::default());
    let id: ObjectId = OBJECT_ID.parse().unwrap();
    assert_success(&controller.download(&id, &JsonOutput));

    *document.lock().unwrap() = linked_object_xml("Kettle", "22");
    assert_success(&controller.download(&id, &JsonOutput));

    let object_dir = fixture.root.join("objects/1234567");
    assert!(!object_dir.join("sip/attachments/20").exists());
    assert!(object_dir.join("sip/attachments/22/front.tif").exists());
    assert!(!object_dir.join(".sip.partial").exists());
    let record = controller.store().load_download(&id).unwrap().unwrap();
    assert_eq!(record.snapshot.title.as_deref(), Some("Kettle"));
}

#[test]
fn leftover_partial_binary_does_not_freeze_object() {
    let fixture = Fixture::new();
    let controller = fixture.controller(MockCatalogue::new(), MockBuilder::default());
    let id: ObjectId = OBJECT_ID.parse().unwrap();
    assert_success(&controller.download(&id, &JsonOutput));
    fs::write(
        fixture
            .root
            .join("objects/1234567/sip/attachments/20/back.tif.download"),
        b"II",
    )
    .unwrap();

    let report = controller.create(&key(), &options(date(2020, 1, 1), None, false), &JsonOutput);
    assert_success(&report);
    assert!(report.preservation_error.is_none());
}
