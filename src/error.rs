use std::fmt;
use std::path::PathBuf;

use miette::Diagnostic;
use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::domain::ServiceOutcome;

/// Closed set of known preservation failure modes.
///
/// `Unclassified` is the sentinel used when a builder failure reached no
/// detector and needs human triage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PreservationCategory {
    UnsupportedFileType,
    MultiPageImage,
    ImageSubformatUnsupported,
    ValidatorRejected,
    Unclassified,
}

impl PreservationCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            PreservationCategory::UnsupportedFileType => "unsupported-file-type",
            PreservationCategory::MultiPageImage => "multi-page-image",
            PreservationCategory::ImageSubformatUnsupported => "image-subformat-unsupported",
            PreservationCategory::ValidatorRejected => "validator-rejected",
            PreservationCategory::Unclassified => "unclassified",
        }
    }
}

impl fmt::Display for PreservationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A known failure that prevents an object from being preserved.
///
/// `error` is a short reason that stays identical between occurrences so a
/// scheduler can use it as the freeze reason; `detail` names the offending
/// file.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{error}: {detail}")]
pub struct PreservationError {
    pub category: PreservationCategory,
    pub error: String,
    pub detail: String,
}

impl PreservationError {
    pub fn new(
        category: PreservationCategory,
        error: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            category,
            error: error.into(),
            detail: detail.into(),
        }
    }
}

/// Failed invocation of an external packaging tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolFailure {
    pub command: Vec<String>,
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolFailure {
    pub fn program(&self) -> &str {
        self.command.first().map(String::as_str).unwrap_or("")
    }

    /// Last argument of the command, which is the processed file for the
    /// per-file tools.
    pub fn target(&self) -> &str {
        self.command.last().map(String::as_str).unwrap_or("")
    }

    pub fn target_extension(&self) -> String {
        self.target()
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default()
    }
}

impl fmt::Display for ToolFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self
            .status
            .map(|code| code.to_string())
            .unwrap_or_else(|| "signal".to_string());
        write!(f, "`{}` exited with {status}", self.command.join(" "))?;
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            write!(f, ": {}", stderr.lines().last().unwrap_or(stderr))?;
        }
        Ok(())
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum SipError {
    #[error("invalid object id: {0}")]
    InvalidObjectId(String),

    #[error("invalid package id: {0}")]
    InvalidPackageId(String),

    #[error("invalid timestamp: {0}")]
    InvalidDate(String),

    #[error("missing config file museum-sip.json")]
    #[diagnostic(help("pass --config or set MUSEUM_SIP_CONFIG"))]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("catalogue rejected the credentials: {0}")]
    Authentication(String),

    #[error("catalogue session expired: {0}")]
    SessionExpired(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("catalogue request failed: {0}")]
    CatalogueHttp(String),

    #[error("catalogue returned status {status}: {message}")]
    CatalogueStatus { status: u16, message: String },

    #[error("not found in catalogue: {0}")]
    NotFound(String),

    #[error("incomplete catalogue document: {0}")]
    IncompleteDocument(String),

    #[error("malformed document: {0}")]
    MalformedDocument(String),

    #[error("storage exhausted: {0}")]
    StorageExhausted(String),

    #[error("attachment filename collides with a reserved package name: {0}")]
    ReservedFilename(String),

    #[error("attachment filename is not supported by the preservation service: {0}")]
    UnsupportedFilename(String),

    #[error("preservation error: {0}")]
    Preservation(#[from] PreservationError),

    #[error("external tool failed: {0}")]
    Tool(ToolFailure),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("stage precondition not met: {0}")]
    Precondition(String),

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("preservation result not available yet: {0}")]
    ResultPending(String),

    #[error("expected the package to be {expected} but the service reported {actual}")]
    UnexpectedOutcome {
        expected: ServiceOutcome,
        actual: ServiceOutcome,
    },

    #[error("stage stopped before completion: {0}")]
    Cancelled(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("internal state error: {0}")]
    Internal(String),
}

impl SipError {
    /// Verbatim category name printed for automation.
    pub fn category(&self) -> String {
        match self.outcome() {
            PreservationOutcome::Success => "Success".to_string(),
            PreservationOutcome::RetryableFailure { reason, .. } => reason.to_string(),
            PreservationOutcome::TerminalFailure { category, .. } => category.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.outcome(), PreservationOutcome::RetryableFailure { .. })
    }

    pub fn outcome(&self) -> PreservationOutcome {
        let detail = self.to_string();
        let retry = |reason| PreservationOutcome::RetryableFailure {
            reason,
            detail: detail.clone(),
        };
        let terminal = |category| PreservationOutcome::TerminalFailure {
            category,
            detail: detail.clone(),
        };
        match self {
            SipError::Timeout(_) => retry(RetryReason::Timeout),
            SipError::SessionExpired(_) => retry(RetryReason::SessionExpired),
            SipError::StorageExhausted(_) => retry(RetryReason::StorageExhausted),
            SipError::CatalogueHttp(_) => retry(RetryReason::Network),
            SipError::CatalogueStatus { status, .. } if is_transient_status(*status) => {
                retry(RetryReason::ServiceUnavailable)
            }
            SipError::CatalogueStatus { .. } => terminal(FailureCategory::CatalogueRejected),
            SipError::Transfer(_) => retry(RetryReason::Transfer),
            SipError::ResultPending(_) => retry(RetryReason::ResultPending),
            SipError::Cancelled(_) => retry(RetryReason::Cancelled),
            SipError::Authentication(_) => terminal(FailureCategory::Authentication),
            SipError::NotFound(_) => terminal(FailureCategory::NotFound),
            SipError::IncompleteDocument(_) => terminal(FailureCategory::IncompleteDocument),
            SipError::MalformedDocument(_) => terminal(FailureCategory::MalformedDocument),
            SipError::ReservedFilename(_) => terminal(FailureCategory::ReservedFilename),
            SipError::UnsupportedFilename(_) => terminal(FailureCategory::UnsupportedFilename),
            SipError::UnexpectedOutcome { .. } => terminal(FailureCategory::UnexpectedOutcome),
            SipError::Precondition(_) => terminal(FailureCategory::Precondition),
            SipError::Preservation(err) => terminal(FailureCategory::Preservation(err.category)),
            SipError::Tool(_) => terminal(FailureCategory::Preservation(
                PreservationCategory::Unclassified,
            )),
            SipError::MissingTool(_) => terminal(FailureCategory::MissingTool),
            SipError::Filesystem(_) => terminal(FailureCategory::Filesystem),
            SipError::Internal(_) => terminal(FailureCategory::Internal),
            SipError::MissingConfig
            | SipError::ConfigRead(_)
            | SipError::ConfigParse(_)
            | SipError::InvalidConfig(_) => terminal(FailureCategory::Configuration),
            SipError::InvalidObjectId(_)
            | SipError::InvalidPackageId(_)
            | SipError::InvalidDate(_) => terminal(FailureCategory::InvalidInput),
        }
    }
}

fn is_transient_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

/// Result of running one stage, consumed by the external scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PreservationOutcome {
    Success,
    RetryableFailure { reason: RetryReason, detail: String },
    TerminalFailure {
        /// Reports carry the category as their own field.
        #[serde(skip_serializing)]
        category: FailureCategory,
        detail: String,
    },
}

impl PreservationOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PreservationOutcome::TerminalFailure { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    Timeout,
    SessionExpired,
    StorageExhausted,
    Network,
    ServiceUnavailable,
    Transfer,
    ResultPending,
    Cancelled,
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RetryReason::Timeout => "TimeoutError",
            RetryReason::SessionExpired => "SessionExpiredError",
            RetryReason::StorageExhausted => "StorageExhaustedError",
            RetryReason::Network => "NetworkError",
            RetryReason::ServiceUnavailable => "ServiceUnavailableError",
            RetryReason::Transfer => "TransferError",
            RetryReason::ResultPending => "ResultPending",
            RetryReason::Cancelled => "Cancelled",
        };
        f.write_str(name)
    }
}

impl Serialize for RetryReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    Authentication,
    NotFound,
    IncompleteDocument,
    MalformedDocument,
    ReservedFilename,
    UnsupportedFilename,
    UnexpectedOutcome,
    Precondition,
    Preservation(PreservationCategory),
    CatalogueRejected,
    MissingTool,
    Filesystem,
    Configuration,
    InvalidInput,
    Internal,
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCategory::Authentication => f.write_str("AuthenticationError"),
            FailureCategory::NotFound => f.write_str("NotFoundError"),
            FailureCategory::IncompleteDocument => f.write_str("IncompleteDocumentError"),
            FailureCategory::MalformedDocument => f.write_str("MalformedDocumentError"),
            FailureCategory::ReservedFilename => f.write_str("ReservedFilenameError"),
            FailureCategory::UnsupportedFilename => f.write_str("UnsupportedFilenameError"),
            FailureCategory::UnexpectedOutcome => f.write_str("UnexpectedOutcomeError"),
            FailureCategory::Precondition => f.write_str("PreconditionError"),
            FailureCategory::Preservation(category) => write!(f, "PreservationError:{category}"),
            FailureCategory::CatalogueRejected => f.write_str("CatalogueRequestError"),
            FailureCategory::MissingTool => f.write_str("MissingToolError"),
            FailureCategory::Filesystem => f.write_str("FilesystemError"),
            FailureCategory::Configuration => f.write_str("ConfigurationError"),
            FailureCategory::InvalidInput => f.write_str("InvalidInputError"),
            FailureCategory::Internal => f.write_str("InternalError"),
        }
    }
}

impl Serialize for FailureCategory {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}
