use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info};

use crate::error::{PreservationCategory, PreservationError, SipError, ToolFailure};

const IMPORT_OBJECT: &str = "import-object";

static UNSUPPORTED_MIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"MIME type (\S+) with version (\S+) is not supported").expect("valid regex")
});

type Check = dyn Fn(&ToolFailure) -> Option<PreservationError> + Send + Sync;

/// One known failure signature of the container builder.
pub struct Detector {
    name: &'static str,
    check: Box<Check>,
}

impl Detector {
    pub fn new<F>(name: &'static str, check: F) -> Self
    where
        F: Fn(&ToolFailure) -> Option<PreservationError> + Send + Sync + 'static,
    {
        Self {
            name,
            check: Box::new(check),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn check(&self, failure: &ToolFailure) -> Option<PreservationError> {
        (self.check)(failure)
    }
}

impl fmt::Debug for Detector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Detector").field("name", &self.name).finish()
    }
}

/// Ordered detector chain. The first detector that recognises a failure
/// decides its category; later detectors are not consulted.
#[derive(Debug)]
pub struct Classifier {
    detectors: Vec<Detector>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::with_detectors(default_detectors())
    }
}

impl Classifier {
    pub fn with_detectors(detectors: Vec<Detector>) -> Self {
        Self { detectors }
    }

    pub fn detectors(&self) -> &[Detector] {
        &self.detectors
    }

    /// Turns a recognised builder failure into a `Preservation` error.
    /// Everything else is returned unchanged.
    pub fn classify(&self, error: SipError) -> SipError {
        match error {
            SipError::Tool(failure) => match self.classify_failure(&failure) {
                Some(preservation) => SipError::Preservation(preservation),
                None => SipError::Tool(failure),
            },
            other => other,
        }
    }

    pub fn classify_failure(&self, failure: &ToolFailure) -> Option<PreservationError> {
        for detector in &self.detectors {
            if let Some(found) = detector.check(failure) {
                info!(
                    detector = detector.name,
                    category = %found.category,
                    target = failure.target(),
                    "classified builder failure"
                );
                return Some(found);
            }
        }
        debug!(program = failure.program(), "builder failure matched no detector");
        None
    }
}

/// The known failure signatures, most specific first.
pub fn default_detectors() -> Vec<Detector> {
    vec![
        Detector::new("jhove-invalid-tiff", |failure| {
            if failure.program() != IMPORT_OBJECT
                || !failure.stderr.contains("Validator returned error")
                || !failure.stderr.contains(">TIFF-hul</reportingModule>")
            {
                return None;
            }
            Some(PreservationError::new(
                PreservationCategory::ValidatorRejected,
                "TIFF file failed JHOVE validation",
                format!(
                    "TIFF file {} failed JHOVE validation, and is likely invalid.",
                    failure.target()
                ),
            ))
        }),
        Detector::new("multi-page-tiff", |failure| {
            if !is_import_of(failure, &["tif", "tiff"])
                || !failure.stderr.contains(
                    "The file contains multiple streams which is supported only for video containers.",
                )
            {
                return None;
            }
            Some(PreservationError::new(
                PreservationCategory::MultiPageImage,
                "Multi-page TIFF not allowed",
                format!(
                    "TIFF file {} contains multiple pages and is not currently allowed for preservation.",
                    failure.target()
                ),
            ))
        }),
        Detector::new("jpeg-mime-detection", |failure| {
            if !is_import_of(failure, &["jpg", "jpeg"])
                || !failure
                    .stderr
                    .contains("MIME type not supported by this scraper.")
            {
                return None;
            }
            Some(PreservationError::new(
                PreservationCategory::ImageSubformatUnsupported,
                "JPEG MIME type detection failed",
                format!("JPEG file {} didn't pass MIME type detection", failure.target()),
            ))
        }),
        Detector::new("jpeg-mpo", |failure| {
            if !is_import_of(failure, &["jpg", "jpeg"])
                || !failure
                    .stderr
                    .contains("Conflict with existing value 'image/jpeg' and new value 'image/mpo'")
            {
                return None;
            }
            Some(PreservationError::new(
                PreservationCategory::ImageSubformatUnsupported,
                "MPO JPEG files not supported",
                format!("MPO image file {} is not supported", failure.target()),
            ))
        }),
        Detector::new("jpeg-version", |failure| {
            if !is_import_of(failure, &["jpg", "jpeg"])
                || !failure
                    .stderr
                    .contains("File format version is not supported.")
            {
                return None;
            }
            Some(PreservationError::new(
                PreservationCategory::ImageSubformatUnsupported,
                "JPEG version not supported",
                format!("JPEG file {} has an unsupported format version", failure.target()),
            ))
        }),
        Detector::new("unsupported-file-type", |failure| {
            if failure.program() != IMPORT_OBJECT {
                return None;
            }
            let captures = UNSUPPORTED_MIME.captures(&failure.stderr)?;
            Some(PreservationError::new(
                PreservationCategory::UnsupportedFileType,
                format!(
                    "Unsupported file type: {} {}",
                    &captures[1], &captures[2]
                ),
                format!(
                    "File {} has MIME type {} with version {}, which is not supported",
                    failure.target(),
                    &captures[1],
                    &captures[2]
                ),
            ))
        }),
    ]
}

fn is_import_of(failure: &ToolFailure, extensions: &[&str]) -> bool {
    failure.program() == IMPORT_OBJECT && extensions.contains(&failure.target_extension().as_str())
}
