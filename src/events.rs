use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalogue::CatalogueObject;

pub const AGENT_NAME: &str = "museum-sip";
pub const AGENT_TYPE: &str = "software";

const MUSEUM_SYSTEM: &str =
    "the MuseumPlus collection management system administrated by Finnish Museums Association";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ObjectCreation,
    MultimediaCreation,
    ObjectMigration,
    MultimediaMigration,
    CollectionActivityCreation,
    DescriptionCreation,
    Decompression,
}

impl EventKind {
    /// PREMIS event type passed to the container builder.
    pub fn event_type(&self) -> &'static str {
        match self {
            EventKind::ObjectMigration | EventKind::MultimediaMigration => "transfer",
            EventKind::Decompression => "decompression",
            _ => "creation",
        }
    }

    fn detail(&self) -> &'static str {
        match self {
            EventKind::ObjectCreation => "Object database entry creation",
            EventKind::MultimediaCreation => "Multimedia creation",
            EventKind::ObjectMigration => "Object Musketti migration",
            EventKind::MultimediaMigration => "Multimedia Musketti migration",
            EventKind::CollectionActivityCreation => "CollectionActivity creation",
            EventKind::DescriptionCreation => "LIDO document creation",
            EventKind::Decompression => "Archive extraction",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub name: String,
    pub agent_type: String,
}

impl Default for Agent {
    fn default() -> Self {
        Self {
            name: AGENT_NAME.to_string(),
            agent_type: AGENT_TYPE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceEvent {
    pub kind: EventKind,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub detail: String,
    pub outcome: String,
    pub outcome_detail: String,
    pub agent: Agent,
    /// Package-relative path the event applies to. `None` targets the
    /// whole package.
    pub target: Option<String>,
    /// Snapshot field the event was derived from.
    pub source_field: String,
}

impl ProvenanceEvent {
    fn new(
        kind: EventKind,
        timestamp: DateTime<Utc>,
        outcome_detail: String,
        target: Option<String>,
        source_field: String,
    ) -> Self {
        Self {
            kind,
            event_type: kind.event_type().to_string(),
            timestamp,
            detail: kind.detail().to_string(),
            outcome: "success".to_string(),
            outcome_detail,
            agent: Agent::default(),
            target,
            source_field,
        }
    }

    fn key(&self) -> (EventKind, Option<String>) {
        (self.kind, self.target.clone())
    }
}

pub fn multimedia_document_path(attachment_id: &str) -> String {
    format!("attachments/{attachment_id}/Multimedia.xml")
}

pub fn attachment_path(attachment_id: &str, filename: &str) -> String {
    format!("attachments/{attachment_id}/{filename}")
}

pub fn collection_activity_document_path(activity_id: &str) -> String {
    format!("collection_activities/{activity_id}/CollectionActivity.xml")
}

pub const DESCRIPTION_PATH: &str = "reports/lido.xml";
pub const OBJECT_DOCUMENT_PATH: &str = "reports/Object.xml";

/// Derives the provenance events recorded by a snapshot.
///
/// Pure and order-stable: the same snapshot always yields the same list,
/// and each (kind, target) pair appears at most once.
pub fn derive_events(object: &CatalogueObject) -> Vec<ProvenanceEvent> {
    let mut events = Vec::new();

    if let Some(created) = object.created {
        events.push(ProvenanceEvent::new(
            EventKind::ObjectCreation,
            created,
            format!("Object creation date in {MUSEUM_SYSTEM}"),
            None,
            format!("Object[{}].__created", object.id),
        ));
    }

    for attachment in &object.attachments {
        if let Some(created) = attachment.created {
            events.push(ProvenanceEvent::new(
                EventKind::MultimediaCreation,
                created,
                format!("Multimedia creation date in {MUSEUM_SYSTEM}"),
                Some(multimedia_document_path(&attachment.id)),
                format!("Multimedia[{}].__created", attachment.id),
            ));
        }
    }

    if let (true, Some(created)) = (object.migrated, object.created) {
        events.push(ProvenanceEvent::new(
            EventKind::ObjectMigration,
            created,
            "Object migrated to MuseumPlus collection management system from Musketti".to_string(),
            None,
            format!("Object[{}].__createdUser", object.id),
        ));
    }

    for attachment in &object.attachments {
        if let (true, Some(created)) = (attachment.migrated, attachment.created) {
            events.push(ProvenanceEvent::new(
                EventKind::MultimediaMigration,
                created,
                "Multimedia migrated to MuseumPlus collection management system from Musketti"
                    .to_string(),
                Some(multimedia_document_path(&attachment.id)),
                format!("Multimedia[{}].__createdUser", attachment.id),
            ));
        }
    }

    for activity in &object.collection_activities {
        if let Some(created) = activity.created {
            events.push(ProvenanceEvent::new(
                EventKind::CollectionActivityCreation,
                created,
                format!("CollectionActivity creation date in {MUSEUM_SYSTEM}"),
                Some(collection_activity_document_path(&activity.id)),
                format!("CollectionActivity[{}].__created", activity.id),
            ));
        }
    }

    if let Some(retrieved) = object.description_retrieved_at {
        events.push(ProvenanceEvent::new(
            EventKind::DescriptionCreation,
            retrieved,
            "LIDO document generated in the MuseumPlus service from the Object using a MuseumPlus Template."
                .to_string(),
            Some(DESCRIPTION_PATH.to_string()),
            format!("Object[{}].description_retrieved_at", object.id),
        ));
    }

    for attachment in &object.attachments {
        let Some(downloaded) = attachment.downloaded_at else {
            continue;
        };
        if attachment.local_path.is_none() || !attachment.is_archive() {
            continue;
        }
        events.push(ProvenanceEvent::new(
            EventKind::Decompression,
            downloaded,
            format!(
                "Extracted from original archive {} downloaded from MuseumPlus",
                attachment.filename
            ),
            Some(attachment_path(&attachment.id, &attachment.filename)),
            format!("Multimedia[{}].MulOriginalFileTxt", attachment.id),
        ));
    }

    let mut seen = HashSet::new();
    events.retain(|event| seen.insert(event.key()));
    events
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::catalogue::{Attachment, CollectionActivity};

    fn date(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 10, 0, 0).unwrap()
    }

    fn attachment(id: &str, filename: &str, migrated: bool) -> Attachment {
        Attachment {
            id: id.to_string(),
            filename: filename.to_string(),
            declared_media_type: None,
            detected_media_type: None,
            size: Some(10),
            local_path: Some(attachment_path(id, filename)),
            created: Some(date(2018, 11, 21)),
            created_by: Some("ZET_DÜ".to_string()),
            migrated,
            downloaded_at: Some(date(2020, 1, 1)),
            document: String::new(),
        }
    }

    fn snapshot() -> CatalogueObject {
        CatalogueObject {
            id: "1234567".parse().unwrap(),
            title: Some("Teapot".to_string()),
            created: Some(date(2018, 11, 21)),
            created_by: Some("ZET_DÜ".to_string()),
            modified: date(2019, 1, 2),
            migrated: true,
            attachments: vec![
                attachment("20", "front.tif", true),
                attachment("21", "scans.zip", false),
                attachment("21", "scans.zip", false),
            ],
            collection_activities: vec![CollectionActivity {
                id: "5".to_string(),
                created: Some(date(2019, 5, 5)),
                document: String::new(),
            }],
            description_retrieved_at: Some(date(2020, 1, 1)),
            document: String::new(),
        }
    }

    #[test]
    fn derivation_is_deterministic() {
        let object = snapshot();
        let first = derive_events(&object);
        let second = derive_events(&object);
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }

    #[test]
    fn no_event_emitted_twice() {
        let events = derive_events(&snapshot());
        let mut keys: Vec<_> = events.iter().map(ProvenanceEvent::key).collect();
        let total = keys.len();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), total);
    }

    #[test]
    fn migration_follows_flag() {
        let events = derive_events(&snapshot());
        let migrations: Vec<_> = events
            .iter()
            .filter(|event| event.event_type == "transfer")
            .map(|event| event.target.clone())
            .collect();
        assert_eq!(
            migrations,
            vec![None, Some("attachments/20/Multimedia.xml".to_string())]
        );
    }

    #[test]
    fn creation_requires_timestamp() {
        let mut object = snapshot();
        object.created = None;
        object.migrated = false;
        let events = derive_events(&object);
        assert!(
            !events
                .iter()
                .any(|event| event.kind == EventKind::ObjectCreation)
        );
    }

    #[test]
    fn archives_yield_decompression() {
        let events = derive_events(&snapshot());
        let decompressions: Vec<_> = events
            .iter()
            .filter(|event| event.kind == EventKind::Decompression)
            .collect();
        assert_eq!(decompressions.len(), 1);
        assert_eq!(
            decompressions[0].target.as_deref(),
            Some("attachments/21/scans.zip")
        );
    }

    #[test]
    fn every_event_names_its_source() {
        for event in derive_events(&snapshot()) {
            assert!(!event.source_field.is_empty());
            assert_eq!(event.agent.name, AGENT_NAME);
        }
    }
}
