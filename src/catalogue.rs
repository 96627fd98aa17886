use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io;
use std::path::Path;

use chrono::{DateTime, Datelike, Utc};
use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use roxmltree::{Document, Node};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{CatalogueSettings, PreservationLogField};
use crate::domain::{ObjectId, parse_timestamp};
use crate::error::SipError;
use crate::session::{SessionAuthority, SessionManager, SessionPolicy, SessionToken};

pub const MODULE_NS: &str = "http://www.zetcom.com/ria/ws/module";
pub const SESSION_NS: &str = "http://www.zetcom.com/ria/ws/session";

/// Account that imported legacy records during the November 2018 migration.
const MIGRATION_USER: &str = "ZET_DÜ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Module {
    Object,
    Multimedia,
    CollectionActivity,
}

impl Module {
    pub fn as_str(&self) -> &'static str {
        match self {
            Module::Object => "Object",
            Module::Multimedia => "Multimedia",
            Module::CollectionActivity => "CollectionActivity",
        }
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable snapshot of one catalogue object and its linked records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogueObject {
    pub id: ObjectId,
    pub title: Option<String>,
    pub created: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
    pub modified: DateTime<Utc>,
    pub migrated: bool,
    pub attachments: Vec<Attachment>,
    pub collection_activities: Vec<CollectionActivity>,
    /// When the descriptive report was exported by the catalogue.
    pub description_retrieved_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub document: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub filename: String,
    pub declared_media_type: Option<String>,
    pub detected_media_type: Option<String>,
    pub size: Option<u64>,
    /// Path of the binary relative to the package content directory.
    pub local_path: Option<String>,
    pub created: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
    pub migrated: bool,
    pub downloaded_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub document: String,
}

impl Attachment {
    pub fn extension(&self) -> String {
        file_extension(&self.filename)
    }

    pub fn is_archive(&self) -> bool {
        self.detected_media_type.as_deref() == Some(ZIP_MEDIA_TYPE) || self.extension() == "zip"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionActivity {
    pub id: String,
    pub created: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub document: String,
}

pub const ZIP_MEDIA_TYPE: &str = "application/zip";

pub fn file_extension(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default()
}

/// Media type implied by a file extension.
pub fn media_type_for_extension(extension: &str) -> Option<&'static str> {
    let media = match extension {
        "gif" => "image/gif",
        "tif" | "tiff" => "image/tiff",
        "jpg" | "jpeg" => "image/jpeg",
        "pdf" => "application/pdf",
        "odf" => "application/vnd.oasis.opendocument.formula",
        "xml" => "text/xml",
        "zip" => ZIP_MEDIA_TYPE,
        _ => return None,
    };
    Some(media)
}

/// Media type detected from the leading bytes of a file.
pub fn sniff_media_type(head: &[u8]) -> Option<&'static str> {
    let media = if head.starts_with(b"PK\x03\x04") {
        ZIP_MEDIA_TYPE
    } else if head.starts_with(b"II*\0") || head.starts_with(b"MM\0*") {
        "image/tiff"
    } else if head.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "image/jpeg"
    } else if head.starts_with(b"GIF87a") || head.starts_with(b"GIF89a") {
        "image/gif"
    } else if head.starts_with(b"%PDF-") {
        "application/pdf"
    } else if head.starts_with(b"<?xml") {
        "text/xml"
    } else {
        return None;
    };
    Some(media)
}

pub fn is_migration_record(created: Option<DateTime<Utc>>, created_by: Option<&str>) -> bool {
    match created {
        Some(date) => date.year() == 2018 && date.month() == 11 && created_by == Some(MIGRATION_USER),
        None => false,
    }
}

/// Transport to the catalogue web service.
pub trait CatalogueClient: Send + Sync {
    /// Raw XML document of one module item.
    fn module_item(&self, module: Module, id: &str) -> Result<String, SipError>;

    /// The object's descriptive (LIDO) export.
    fn description_report(&self, object_id: &ObjectId) -> Result<Vec<u8>, SipError>;

    /// Streams an attachment binary into `destination`.
    ///
    /// Returns `None` when the multimedia record carries no binary.
    fn download_attachment(
        &self,
        multimedia_id: &str,
        destination: &Path,
    ) -> Result<Option<u64>, SipError>;

    fn update_object_field(
        &self,
        object_id: &ObjectId,
        field: &PreservationLogField,
        value: &str,
    ) -> Result<(), SipError>;
}

/// Retrieves an object together with its multimedia and collection
/// activity records.
pub struct MetadataFetcher<'a, C: CatalogueClient> {
    client: &'a C,
}

impl<'a, C: CatalogueClient> MetadataFetcher<'a, C> {
    pub fn new(client: &'a C) -> Self {
        Self { client }
    }

    pub fn fetch(&self, object_id: &ObjectId) -> Result<CatalogueObject, SipError> {
        let document = self.client.module_item(Module::Object, object_id.as_str())?;
        let parsed = ParsedItem::parse(&document, Module::Object, object_id.as_str())?;
        if !parsed.has_content {
            return Err(SipError::IncompleteDocument(format!(
                "Object {object_id} contains only system fields; check the account's permissions"
            )));
        }
        let attachment_ids = parsed.reference_ids("ObjMultimediaRef");
        let activity_ids = parsed.reference_ids("ObjCollectionActivityRef");
        let mut object = parsed.into_object(document)?;
        if object.id != *object_id {
            return Err(SipError::MalformedDocument(format!(
                "requested Object {object_id} but received Object {}",
                object.id
            )));
        }

        for attachment_id in attachment_ids {
            let document = self.client.module_item(Module::Multimedia, &attachment_id)?;
            let attachment = parse_attachment(&document, &attachment_id)?;
            debug!(object_id = %object_id, attachment_id = %attachment.id, "fetched multimedia record");
            object.attachments.push(attachment);
        }
        for activity_id in activity_ids {
            let document = self
                .client
                .module_item(Module::CollectionActivity, &activity_id)?;
            object
                .collection_activities
                .push(parse_collection_activity(&document, &activity_id)?);
        }
        Ok(object)
    }
}

/// Parses an Object document without its linked records.
pub fn parse_object(document: &str) -> Result<CatalogueObject, SipError> {
    ParsedItem::parse(document, Module::Object, "")?.into_object(document.to_string())
}

pub fn parse_attachment(document: &str, requested_id: &str) -> Result<Attachment, SipError> {
    let parsed = ParsedItem::parse(document, Module::Multimedia, requested_id)?;
    let created = parsed.system_date("__created")?;
    let created_by = parsed.system.get("__createdUser").cloned();
    let filename = parsed
        .data
        .get("MulOriginalFileTxt")
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| format!("Multimedia_{}.attachment", parsed.id));
    let declared_media_type =
        media_type_for_extension(&file_extension(&filename)).map(str::to_string);

    Ok(Attachment {
        migrated: is_migration_record(created, created_by.as_deref()),
        id: parsed.id,
        filename,
        declared_media_type,
        detected_media_type: None,
        size: None,
        local_path: None,
        created,
        created_by,
        downloaded_at: None,
        document: document.to_string(),
    })
}

pub fn parse_collection_activity(
    document: &str,
    requested_id: &str,
) -> Result<CollectionActivity, SipError> {
    let parsed = ParsedItem::parse(document, Module::CollectionActivity, requested_id)?;
    Ok(CollectionActivity {
        created: parsed.system_date("__created")?,
        id: parsed.id,
        document: document.to_string(),
    })
}

/// Value of a named field of the first module item, if present.
pub fn field_value(document: &str, name: &str) -> Result<Option<String>, SipError> {
    let doc = parse_xml(document)?;
    let Some(item) = doc.descendants().find(|node| is_module(node, "moduleItem")) else {
        return Ok(None);
    };
    Ok(item
        .children()
        .filter(|node| node.is_element() && node.attribute("name") == Some(name))
        .find_map(|node| value_text(&node)))
}

struct ParsedItem {
    id: String,
    system: HashMap<String, String>,
    data: HashMap<String, String>,
    references: HashMap<String, Vec<String>>,
    has_content: bool,
}

impl ParsedItem {
    fn parse(document: &str, module: Module, requested_id: &str) -> Result<Self, SipError> {
        let doc = parse_xml(document)?;
        let Some(item) = doc.descendants().find(|node| is_module(node, "moduleItem")) else {
            return Err(SipError::NotFound(format!("{module} {requested_id}")));
        };
        let id = item
            .attribute("id")
            .map(str::to_string)
            .ok_or_else(|| SipError::MalformedDocument(format!("{module} item without id")))?;

        let mut parsed = ParsedItem {
            id,
            system: HashMap::new(),
            data: HashMap::new(),
            references: HashMap::new(),
            has_content: false,
        };
        for field in item.children().filter(Node::is_element) {
            let kind = field.tag_name().name();
            let name = field.attribute("name").unwrap_or_default().to_string();
            match kind {
                "systemField" => {
                    if let Some(value) = value_text(&field) {
                        parsed.system.insert(name, value);
                    }
                }
                "moduleReference" => {
                    parsed.has_content = true;
                    let ids = field
                        .children()
                        .filter(|node| is_module(node, "moduleReferenceItem"))
                        .filter_map(|node| node.attribute("moduleItemId").map(str::to_string))
                        .collect();
                    parsed.references.insert(name, ids);
                }
                _ => {
                    parsed.has_content = true;
                    if kind == "dataField" {
                        if let Some(value) = value_text(&field) {
                            parsed.data.insert(name, value);
                        }
                    }
                }
            }
        }
        Ok(parsed)
    }

    fn reference_ids(&self, name: &str) -> Vec<String> {
        self.references.get(name).cloned().unwrap_or_default()
    }

    fn system_date(&self, name: &str) -> Result<Option<DateTime<Utc>>, SipError> {
        self.system
            .get(name)
            .map(|value| parse_timestamp(value))
            .transpose()
    }

    fn into_object(self, document: String) -> Result<CatalogueObject, SipError> {
        let id: ObjectId = self
            .id
            .parse()
            .map_err(|_| SipError::MalformedDocument(format!("invalid object id {}", self.id)))?;
        let created = self.system_date("__created")?;
        let modified = self.system_date("__lastModified")?.ok_or_else(|| {
            SipError::MalformedDocument(format!("Object {id} has no __lastModified field"))
        })?;
        let created_by = self.system.get("__createdUser").cloned();

        Ok(CatalogueObject {
            migrated: is_migration_record(created, created_by.as_deref()),
            title: self.data.get("ObjObjectTitleTxt").cloned(),
            id,
            created,
            created_by,
            modified,
            attachments: Vec::new(),
            collection_activities: Vec::new(),
            description_retrieved_at: None,
            document,
        })
    }
}

fn parse_xml(document: &str) -> Result<Document<'_>, SipError> {
    Document::parse(document).map_err(|err| SipError::MalformedDocument(err.to_string()))
}

fn is_module(node: &Node, name: &str) -> bool {
    node.is_element()
        && node.tag_name().name() == name
        && node.tag_name().namespace() == Some(MODULE_NS)
}

fn value_text(field: &Node) -> Option<String> {
    field
        .children()
        .find(|node| node.is_element() && node.tag_name().name() == "value")
        .and_then(|node| node.text())
        .map(str::to_string)
}

/// One line of the object's preservation history kept in the catalogue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreservationLogEntry {
    pub filename: String,
    pub status: String,
    pub object_modify_date: String,
    pub date: String,
}

/// Appends `entry` to the JSON list stored in the preservation field.
pub fn append_log_entry(
    existing: Option<&str>,
    entry: PreservationLogEntry,
) -> Result<String, SipError> {
    let mut entries: Vec<serde_json::Value> = match existing.map(str::trim) {
        None | Some("") => Vec::new(),
        Some(value) => serde_json::from_str(value).map_err(|err| {
            SipError::MalformedDocument(format!(
                "preservation log field is not a JSON list: {err}"
            ))
        })?,
    };
    let entry =
        serde_json::to_value(entry).map_err(|err| SipError::MalformedDocument(err.to_string()))?;
    entries.push(entry);
    serde_json::to_string(&entries).map_err(|err| SipError::MalformedDocument(err.to_string()))
}

/// XML body that replaces a single Object field.
pub fn field_update_document(
    object_id: &ObjectId,
    field: &PreservationLogField,
    value: &str,
) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <application xmlns=\"{MODULE_NS}\">\n  <modules>\n    <module name=\"Object\">\n      \
         <moduleItem id=\"{id}\">\n        <{kind} name=\"{name}\"><value>{value}</value></{kind}>\n      \
         </moduleItem>\n    </module>\n  </modules>\n</application>\n",
        id = escape_xml(object_id.as_str()),
        kind = field.field_type,
        name = escape_xml(&field.name),
        value = escape_xml(value),
    )
}

fn escape_xml(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            other => escaped.push(other),
        }
    }
    escaped
}

fn client_headers() -> Result<HeaderMap, SipError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&format!("museum-sip/{}", env!("CARGO_PKG_VERSION")))
            .map_err(|err| SipError::InvalidConfig(err.to_string()))?,
    );
    Ok(headers)
}

fn transport_error(path: &str, err: reqwest::Error) -> SipError {
    if err.is_timeout() {
        SipError::Timeout(format!("{path}: {err}"))
    } else {
        SipError::CatalogueHttp(format!("{path}: {err}"))
    }
}

fn handle_status(path: &str, response: Response) -> Result<Response, SipError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(SipError::SessionExpired(format!(
            "{path} answered {status}"
        ))),
        StatusCode::NOT_FOUND => Err(SipError::NotFound(path.to_string())),
        _ => {
            let message = response
                .text()
                .unwrap_or_else(|_| "catalogue request failed".to_string());
            Err(SipError::CatalogueStatus {
                status: status.as_u16(),
                message,
            })
        }
    }
}

/// Logs in with the account credentials to obtain a session key.
pub struct MuseumPlusLogin {
    client: Client,
    session_url: String,
    username: String,
    password: String,
}

impl SessionAuthority for MuseumPlusLogin {
    fn login(&self) -> Result<String, SipError> {
        let response = self
            .client
            .get(&self.session_url)
            .basic_auth(
                format!("user[{}]", self.username),
                Some(format!("password[{}]", self.password)),
            )
            .send()
            .map_err(|err| transport_error("session", err))?;
        let status = response.status();
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(SipError::Authentication(format!(
                "login as {} answered {status}",
                self.username
            )));
        }
        let body = handle_status("session", response)?
            .text()
            .map_err(|err| transport_error("session", err))?;
        let doc = parse_xml(&body)?;
        doc.descendants()
            .find(|node| {
                node.is_element()
                    && node.tag_name().name() == "key"
                    && node.tag_name().namespace() == Some(SESSION_NS)
            })
            .and_then(|node| node.text())
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
            .ok_or_else(|| SipError::MalformedDocument("session response has no key".to_string()))
    }
}

/// HTTP client for the MuseumPlus web service.
pub struct MuseumPlusClient {
    client: Client,
    base_url: String,
    username: String,
    lido_report_id: String,
    session: SessionManager<MuseumPlusLogin>,
}

impl MuseumPlusClient {
    pub fn new(settings: &CatalogueSettings) -> Result<Self, SipError> {
        let client = Client::builder()
            .default_headers(client_headers()?)
            .timeout(settings.timeout)
            .build()
            .map_err(|err| SipError::CatalogueHttp(err.to_string()))?;
        let login = MuseumPlusLogin {
            client: client.clone(),
            session_url: format!("{}/session", settings.url),
            username: settings.username.clone(),
            password: settings.password.clone(),
        };
        Ok(Self {
            client,
            base_url: settings.url.clone(),
            username: settings.username.clone(),
            lido_report_id: settings.lido_report_id.clone(),
            session: SessionManager::new(login, SessionPolicy::from_settings(settings)),
        })
    }

    pub fn session(&self) -> &SessionManager<MuseumPlusLogin> {
        &self.session
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    fn authorized(
        &self,
        request: reqwest::blocking::RequestBuilder,
        token: &SessionToken,
    ) -> reqwest::blocking::RequestBuilder {
        request.basic_auth(
            format!("user[{}]", self.username),
            Some(format!("session[{}]", token.key())),
        )
    }

    fn get_bytes(&self, path: &str) -> Result<Vec<u8>, SipError> {
        self.session.execute(|token| {
            let response = self
                .authorized(self.client.get(self.url(path)), token)
                .send()
                .map_err(|err| transport_error(path, err))?;
            let response = handle_status(path, response)?;
            response
                .bytes()
                .map(|bytes| bytes.to_vec())
                .map_err(|err| transport_error(path, err))
        })
    }
}

impl CatalogueClient for MuseumPlusClient {
    fn module_item(&self, module: Module, id: &str) -> Result<String, SipError> {
        let path = format!("module/{module}/{id}");
        let bytes = self.get_bytes(&path)?;
        String::from_utf8(bytes)
            .map_err(|err| SipError::MalformedDocument(format!("{path}: {err}")))
    }

    fn description_report(&self, object_id: &ObjectId) -> Result<Vec<u8>, SipError> {
        self.get_bytes(&format!(
            "module/Object/{object_id}/export/{}",
            self.lido_report_id
        ))
    }

    fn download_attachment(
        &self,
        multimedia_id: &str,
        destination: &Path,
    ) -> Result<Option<u64>, SipError> {
        let path = format!("module/Multimedia/{multimedia_id}/attachment");
        self.session.execute(|token| {
            let response = self
                .authorized(self.client.get(self.url(&path)), token)
                .header(ACCEPT, "application/octet-stream")
                .send()
                .map_err(|err| transport_error(&path, err))?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            let mut response = handle_status(&path, response)?;
            let mut file = File::create(destination).map_err(|err| {
                SipError::Filesystem(format!("create {}: {err}", destination.display()))
            })?;
            let written = io::copy(&mut response, &mut file).map_err(|err| match err.kind() {
                io::ErrorKind::StorageFull => {
                    SipError::StorageExhausted(format!("{}: {err}", destination.display()))
                }
                io::ErrorKind::TimedOut => SipError::Timeout(format!("{path}: {err}")),
                _ => SipError::CatalogueHttp(format!("{path}: {err}")),
            })?;
            file.sync_all()
                .map_err(|err| SipError::Filesystem(err.to_string()))?;
            Ok(Some(written))
        })
    }

    fn update_object_field(
        &self,
        object_id: &ObjectId,
        field: &PreservationLogField,
        value: &str,
    ) -> Result<(), SipError> {
        let path = format!("module/Object/{object_id}/{}", field.name);
        let body = field_update_document(object_id, field, value);
        self.session.execute(|token| {
            let response = self
                .authorized(self.client.put(self.url(&path)), token)
                .header(CONTENT_TYPE, "application/xml")
                .body(body.clone())
                .send()
                .map_err(|err| transport_error(&path, err))?;
            handle_status(&path, response).map(|_| ())
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    const OBJECT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<application xmlns="http://www.zetcom.com/ria/ws/module">
  <modules>
    <module name="Object" totalSize="1">
      <moduleItem hasAttachments="false" id="1234567">
        <systemField dataType="Timestamp" name="__lastModified"><value>2019-01-02 12:00:00.0</value></systemField>
        <systemField dataType="Timestamp" name="__created"><value>2018-11-21 10:44:19.6</value></systemField>
        <systemField dataType="Varchar" name="__createdUser"><value>ZET_DÜ</value></systemField>
        <dataField dataType="Clob" name="ObjObjectTitleTxt"><value>Teapot</value></dataField>
        <moduleReference name="ObjMultimediaRef" targetModule="Multimedia">
          <moduleReferenceItem moduleItemId="20" seqNo="0"/>
          <moduleReferenceItem moduleItemId="21" seqNo="1"/>
        </moduleReference>
      </moduleItem>
    </module>
  </modules>
</application>"#;

    const SYSTEM_ONLY: &str = r#"<application xmlns="http://www.zetcom.com/ria/ws/module">
  <modules><module name="Object"><moduleItem id="1">
    <systemField name="__lastModified"><value>2019-01-02 12:00:00.0</value></systemField>
  </moduleItem></module></modules>
</application>"#;

    #[test]
    fn parses_object_fields() {
        let object = parse_object(OBJECT).unwrap();
        assert_eq!(object.id.as_str(), "1234567");
        assert_eq!(object.title.as_deref(), Some("Teapot"));
        assert!(object.migrated);
        let parsed = ParsedItem::parse(OBJECT, Module::Object, "1234567").unwrap();
        assert!(parsed.has_content);
        assert_eq!(
            parsed.reference_ids("ObjMultimediaRef"),
            vec!["20".to_string(), "21".to_string()]
        );
    }

    #[test]
    fn attachment_without_filename_gets_placeholder() {
        let doc = r#"<application xmlns="http://www.zetcom.com/ria/ws/module"><modules>
          <module name="Multimedia"><moduleItem id="20">
            <systemField name="__created"><value>2020-03-01 08:00:00.0</value></systemField>
          </moduleItem></module></modules></application>"#;
        let attachment = parse_attachment(doc, "20").unwrap();
        assert_eq!(attachment.filename, "Multimedia_20.attachment");
        assert!(!attachment.migrated);
    }

    #[test]
    fn missing_item_is_not_found() {
        let doc = r#"<application xmlns="http://www.zetcom.com/ria/ws/module"><modules>
          <module name="Object" totalSize="0"/></modules></application>"#;
        assert_matches!(parse_object(doc), Err(SipError::NotFound(_)));
    }

    #[test]
    fn system_fields_only_is_detected() {
        let parsed = ParsedItem::parse(SYSTEM_ONLY, Module::Object, "1").unwrap();
        assert!(!parsed.has_content);
    }

    #[test]
    fn log_entry_appends_to_existing_list() {
        let entry = PreservationLogEntry {
            filename: "20190102_Object_1.tar".to_string(),
            status: "accepted".to_string(),
            object_modify_date: "2019-01-02T12:00:00+00:00".to_string(),
            date: "2019-02-01T00:00:00+00:00".to_string(),
        };
        let value = append_log_entry(Some(r#"[{"status":"rejected"}]"#), entry.clone()).unwrap();
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&value).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1]["status"], "accepted");

        assert_matches!(
            append_log_entry(Some("not json"), entry),
            Err(SipError::MalformedDocument(_))
        );
    }

    #[test]
    fn field_update_escapes_value() {
        let field = PreservationLogField {
            name: "ObjPreservationClb".to_string(),
            field_type: "dataField".to_string(),
        };
        let id: ObjectId = "1".parse().unwrap();
        let body = field_update_document(&id, &field, r#"[{"a":"<b>"}]"#);
        assert_eq!(
            field_value(&body, "ObjPreservationClb").unwrap().as_deref(),
            Some(r#"[{"a":"<b>"}]"#)
        );
    }

    #[test]
    fn sniffs_zip_signature() {
        assert_eq!(sniff_media_type(b"PK\x03\x04rest"), Some(ZIP_MEDIA_TYPE));
        assert_eq!(sniff_media_type(b"II*\0"), Some("image/tiff"));
        assert_eq!(sniff_media_type(b"plain"), None);
    }
}
