use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::{BaseDirs, ProjectDirs};
use serde::{Deserialize, Serialize};

use crate::error::SipError;

pub const CONFIG_FILE_NAME: &str = "museum-sip.json";
pub const CONFIG_ENV_VAR: &str = "MUSEUM_SIP_CONFIG";
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    pub catalogue: CatalogueSection,
    #[serde(default)]
    pub packaging: PackagingSection,
    pub transfer: TransferSection,
    #[serde(default)]
    pub paths: PathsSection,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct CatalogueSection {
    pub url: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub lido_report_id: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub session_idle_timeout_secs: Option<u64>,
    #[serde(default)]
    pub renewal_margin_secs: Option<u64>,
    #[serde(default)]
    pub add_log_entries: Option<bool>,
    #[serde(default)]
    pub preservation_field_name: Option<String>,
    #[serde(default)]
    pub preservation_field_type: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct PackagingSection {
    #[serde(default)]
    pub organization_name: Option<String>,
    #[serde(default)]
    pub contract_id: Option<String>,
    #[serde(default)]
    pub sign_key_path: Option<String>,
    #[serde(default)]
    pub tool_dir: Option<String>,
    #[serde(default)]
    pub download_concurrency: Option<usize>,
    #[serde(default)]
    pub min_free_space_bytes: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransferSection {
    Directory {
        root: String,
    },
    Sftp {
        host: String,
        #[serde(default)]
        port: Option<u16>,
        username: String,
        private_key: String,
        home_path: String,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct PathsSection {
    #[serde(default)]
    pub package_dir: Option<String>,
    #[serde(default)]
    pub archive_dir: Option<String>,
}

#[derive(Clone)]
pub struct CatalogueSettings {
    pub url: String,
    pub username: String,
    pub password: String,
    pub lido_report_id: String,
    pub timeout: Duration,
    pub session_idle_timeout: Duration,
    pub renewal_margin: Duration,
    pub preservation_log: Option<PreservationLogField>,
}

impl fmt::Debug for CatalogueSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogueSettings")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("lido_report_id", &self.lido_report_id)
            .field("timeout", &self.timeout)
            .field("session_idle_timeout", &self.session_idle_timeout)
            .field("renewal_margin", &self.renewal_margin)
            .field("preservation_log", &self.preservation_log)
            .finish()
    }
}

/// Catalogue field that collects the object's preservation history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreservationLogField {
    pub name: String,
    pub field_type: String,
}

#[derive(Debug, Clone)]
pub struct PackagingSettings {
    pub organization_name: String,
    pub contract_id: String,
    pub sign_key_path: Utf8PathBuf,
    pub tool_dir: Option<Utf8PathBuf>,
    pub download_concurrency: usize,
    pub min_free_space_bytes: u64,
}

#[derive(Debug, Clone)]
pub enum TransferSettings {
    Directory {
        root: Utf8PathBuf,
    },
    Sftp {
        host: String,
        port: u16,
        username: String,
        private_key: Utf8PathBuf,
        home_path: String,
        timeout: Duration,
    },
}

#[derive(Debug, Clone)]
pub struct PathSettings {
    pub package_dir: Utf8PathBuf,
    pub archive_dir: Utf8PathBuf,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub catalogue: CatalogueSettings,
    pub packaging: PackagingSettings,
    pub transfer: TransferSettings,
    pub paths: PathSettings,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, SipError> {
        let config_path = Self::locate(path)?;
        let content = fs::read_to_string(&config_path)
            .map_err(|_| SipError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| SipError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    fn locate(path: Option<&str>) -> Result<PathBuf, SipError> {
        if let Some(path) = path {
            return Ok(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            if !path.trim().is_empty() {
                return Ok(PathBuf::from(path.trim()));
            }
        }
        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.exists() {
            return Ok(local);
        }
        ProjectDirs::from("", "", "museum-sip")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
            .filter(|path| path.exists())
            .ok_or(SipError::MissingConfig)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, SipError> {
        let schema_version = config.schema_version.unwrap_or(SCHEMA_VERSION);
        if schema_version != SCHEMA_VERSION {
            return Err(SipError::InvalidConfig(format!(
                "unsupported schema_version {schema_version}, expected {SCHEMA_VERSION}"
            )));
        }
        let catalogue = resolve_catalogue(config.catalogue)?;
        let packaging = resolve_packaging(config.packaging)?;
        let transfer = resolve_transfer(config.transfer)?;
        let paths = resolve_paths(config.paths)?;

        Ok(ResolvedConfig {
            schema_version,
            catalogue,
            packaging,
            transfer,
            paths,
        })
    }
}

fn resolve_catalogue(section: CatalogueSection) -> Result<CatalogueSettings, SipError> {
    let url = section.url.trim().trim_end_matches('/').to_string();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(SipError::InvalidConfig(format!(
            "catalogue.url must be an http(s) URL, got {:?}",
            section.url
        )));
    }
    if section.username.trim().is_empty() {
        return Err(SipError::InvalidConfig(
            "catalogue.username is required".to_string(),
        ));
    }

    let session_idle_timeout = Duration::from_secs(section.session_idle_timeout_secs.unwrap_or(600));
    let renewal_margin = Duration::from_secs(section.renewal_margin_secs.unwrap_or(60));
    if renewal_margin >= session_idle_timeout {
        return Err(SipError::InvalidConfig(
            "catalogue.renewal_margin_secs must be shorter than the session idle timeout"
                .to_string(),
        ));
    }

    let preservation_log = if section.add_log_entries.unwrap_or(true) {
        let name = section
            .preservation_field_name
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| {
                SipError::InvalidConfig(
                    "catalogue.preservation_field_name is required when add_log_entries is enabled"
                        .to_string(),
                )
            })?;
        Some(PreservationLogField {
            name,
            field_type: section
                .preservation_field_type
                .unwrap_or_else(|| "dataField".to_string()),
        })
    } else {
        None
    };

    Ok(CatalogueSettings {
        url,
        username: section.username,
        password: section.password,
        lido_report_id: section
            .lido_report_id
            .unwrap_or_else(|| "45005".to_string()),
        timeout: Duration::from_secs(section.timeout_secs.unwrap_or(600)),
        session_idle_timeout,
        renewal_margin,
        preservation_log,
    })
}

fn resolve_packaging(section: PackagingSection) -> Result<PackagingSettings, SipError> {
    let download_concurrency = section.download_concurrency.unwrap_or(3);
    if download_concurrency == 0 {
        return Err(SipError::InvalidConfig(
            "packaging.download_concurrency must be at least 1".to_string(),
        ));
    }
    Ok(PackagingSettings {
        organization_name: section.organization_name.unwrap_or_default(),
        contract_id: section.contract_id.unwrap_or_default(),
        sign_key_path: Utf8PathBuf::from(section.sign_key_path.unwrap_or_default()),
        tool_dir: section.tool_dir.map(Utf8PathBuf::from),
        download_concurrency,
        min_free_space_bytes: section.min_free_space_bytes.unwrap_or(0),
    })
}

fn resolve_transfer(section: TransferSection) -> Result<TransferSettings, SipError> {
    match section {
        TransferSection::Directory { root } => {
            if root.trim().is_empty() {
                return Err(SipError::InvalidConfig(
                    "transfer.root is required".to_string(),
                ));
            }
            Ok(TransferSettings::Directory {
                root: Utf8PathBuf::from(root),
            })
        }
        TransferSection::Sftp {
            host,
            port,
            username,
            private_key,
            home_path,
            timeout_secs,
        } => {
            if host.trim().is_empty() || username.trim().is_empty() {
                return Err(SipError::InvalidConfig(
                    "transfer.host and transfer.username are required".to_string(),
                ));
            }
            if timeout_secs == Some(0) {
                return Err(SipError::InvalidConfig(
                    "transfer.timeout_secs must be at least 1".to_string(),
                ));
            }
            Ok(TransferSettings::Sftp {
                host,
                port: port.unwrap_or(22),
                username,
                private_key: Utf8PathBuf::from(private_key),
                home_path,
                timeout: Duration::from_secs(timeout_secs.unwrap_or(600)),
            })
        }
    }
}

fn resolve_paths(section: PathsSection) -> Result<PathSettings, SipError> {
    let home = || -> Result<Utf8PathBuf, SipError> {
        BaseDirs::new()
            .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.home_dir().to_path_buf()).ok())
            .ok_or_else(|| SipError::Filesystem("unable to resolve home directory".to_string()))
    };
    let package_dir = match section.package_dir {
        Some(path) => Utf8PathBuf::from(path),
        None => home()?.join("MuseumObjects"),
    };
    let archive_dir = match section.archive_dir {
        Some(path) => Utf8PathBuf::from(path),
        None => home()?.join("MuseumObjectArchive"),
    };
    Ok(PathSettings {
        package_dir,
        archive_dir,
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn minimal() -> Config {
        Config {
            schema_version: None,
            catalogue: CatalogueSection {
                url: "https://museum.example/ria-ws/application/".to_string(),
                username: "preserver".to_string(),
                password: "secret".to_string(),
                add_log_entries: Some(false),
                ..CatalogueSection::default()
            },
            packaging: PackagingSection::default(),
            transfer: TransferSection::Directory {
                root: "/srv/dpres".to_string(),
            },
            paths: PathsSection {
                package_dir: Some("/tmp/objects".to_string()),
                archive_dir: Some("/tmp/archive".to_string()),
            },
        }
    }

    #[test]
    fn defaults_applied() {
        let resolved = ConfigLoader::resolve_config(minimal()).unwrap();
        assert_eq!(resolved.schema_version, 1);
        assert_eq!(resolved.catalogue.url, "https://museum.example/ria-ws/application");
        assert_eq!(resolved.catalogue.lido_report_id, "45005");
        assert_eq!(resolved.catalogue.session_idle_timeout, Duration::from_secs(600));
        assert_eq!(resolved.packaging.download_concurrency, 3);
        assert!(resolved.catalogue.preservation_log.is_none());
    }

    #[test]
    fn log_entries_need_field_name() {
        let mut config = minimal();
        config.catalogue.add_log_entries = None;
        let err = ConfigLoader::resolve_config(config).unwrap_err();
        assert_matches!(err, SipError::InvalidConfig(_));
    }

    #[test]
    fn unknown_schema_version_rejected() {
        let mut config = minimal();
        config.schema_version = Some(2);
        let err = ConfigLoader::resolve_config(config).unwrap_err();
        assert_matches!(err, SipError::InvalidConfig(message) if message.contains("schema_version"));
    }

    #[test]
    fn sftp_timeout_resolved() {
        let mut config = minimal();
        config.transfer = TransferSection::Sftp {
            host: "dpres.example.org".to_string(),
            port: None,
            username: "museum".to_string(),
            private_key: "/etc/museum-sip/id_ed25519".to_string(),
            home_path: "/home/museum".to_string(),
            timeout_secs: Some(30),
        };
        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_matches!(
            resolved.transfer,
            TransferSettings::Sftp { timeout, .. } if timeout == Duration::from_secs(30)
        );

        let mut config = minimal();
        config.transfer = TransferSection::Sftp {
            host: "dpres.example.org".to_string(),
            port: None,
            username: "museum".to_string(),
            private_key: "/etc/museum-sip/id_ed25519".to_string(),
            home_path: "/home/museum".to_string(),
            timeout_secs: Some(0),
        };
        let err = ConfigLoader::resolve_config(config).unwrap_err();
        assert_matches!(err, SipError::InvalidConfig(message) if message.contains("timeout_secs"));
    }

    #[test]
    fn password_is_redacted() {
        let resolved = ConfigLoader::resolve_config(minimal()).unwrap();
        let rendered = format!("{:?}", resolved.catalogue);
        assert!(!rendered.contains("secret"));
    }
}
