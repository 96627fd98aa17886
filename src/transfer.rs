use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::TransferSettings;
use crate::domain::ServiceOutcome;
use crate::error::SipError;
use crate::store::{Store, io_error};

const TRANSFER_DIR: &str = "transfer";
const INCOMPLETE_SUFFIX: &str = "incomplete";

/// Proof of submission. The transfer id is the package filename, which is
/// also the name the service publishes its verdict under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub transfer_id: String,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfirmationReport {
    pub transfer_id: String,
    pub outcome: ServiceOutcome,
    /// Remote directory holding the service's reports for the package.
    pub result_path: String,
    pub reports: Vec<String>,
}

/// File transfer channel to the preservation service. Remote paths are
/// `/`-separated and relative to the account's home directory.
pub trait TransferChannel: Send + Sync {
    fn upload(&self, local: &Utf8Path, remote: &str) -> Result<(), SipError>;
    fn rename(&self, from: &str, to: &str) -> Result<(), SipError>;
    /// Entry names of a remote directory, `None` when it does not exist.
    fn list_dir(&self, remote: &str) -> Result<Option<Vec<String>>, SipError>;
    fn fetch(&self, remote: &str, local: &Utf8Path) -> Result<(), SipError>;
}

/// Service mounted as a local directory.
#[derive(Debug, Clone)]
pub struct DirectoryChannel {
    root: Utf8PathBuf,
}

impl DirectoryChannel {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    fn resolve(&self, remote: &str) -> Utf8PathBuf {
        self.root.join(remote)
    }
}

impl TransferChannel for DirectoryChannel {
    fn upload(&self, local: &Utf8Path, remote: &str) -> Result<(), SipError> {
        let target = self.resolve(remote);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent.as_std_path()).map_err(|err| transfer_io(parent, err))?;
        }
        fs::copy(local.as_std_path(), target.as_std_path())
            .map_err(|err| transfer_io(&target, err))?;
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), SipError> {
        let source = self.resolve(from);
        fs::rename(source.as_std_path(), self.resolve(to).as_std_path())
            .map_err(|err| transfer_io(&source, err))
    }

    fn list_dir(&self, remote: &str) -> Result<Option<Vec<String>>, SipError> {
        let dir = self.resolve(remote);
        let entries = match fs::read_dir(dir.as_std_path()) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(transfer_io(&dir, err)),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| transfer_io(&dir, err))?;
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(Some(names))
    }

    fn fetch(&self, remote: &str, local: &Utf8Path) -> Result<(), SipError> {
        let source = self.resolve(remote);
        if source.as_std_path().is_dir() {
            return Store::copy_dir_recursive(&source, local);
        }
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent.as_std_path()).map_err(|err| io_error(parent, err))?;
        }
        fs::copy(source.as_std_path(), local.as_std_path())
            .map_err(|err| transfer_io(&source, err))?;
        Ok(())
    }
}

/// Service reached over SFTP, driving the OpenSSH `sftp` client in batch
/// mode.
#[derive(Debug, Clone)]
pub struct SftpChannel {
    host: String,
    port: u16,
    username: String,
    private_key: Utf8PathBuf,
    home_path: String,
    timeout: Duration,
    program: PathBuf,
    program_args: Vec<String>,
}

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const SERVER_ALIVE_INTERVAL_SECS: u64 = 15;
const SERVER_ALIVE_COUNT_MAX: u32 = 4;

impl SftpChannel {
    pub fn new(
        host: String,
        port: u16,
        username: String,
        private_key: Utf8PathBuf,
        home_path: String,
        timeout: Duration,
    ) -> Self {
        Self {
            host,
            port,
            username,
            private_key,
            home_path,
            timeout,
            program: PathBuf::from("sftp"),
            program_args: Vec::new(),
        }
    }

    /// Runs `program args...` in place of `sftp`. The usual sftp arguments
    /// follow `args`.
    pub fn with_program(mut self, program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        self.program = program.into();
        self.program_args = args;
        self
    }

    fn remote(&self, path: &str) -> String {
        format!("{}/{}", self.home_path.trim_end_matches('/'), path)
    }

    fn batch(&self, commands: &[String]) -> Result<String, SipError> {
        let connect_timeout = self.timeout.as_secs().max(1);
        let mut child = Command::new(&self.program)
            .args(&self.program_args)
            .args(["-b", "-", "-q", "-i", self.private_key.as_str()])
            .args(["-P", &self.port.to_string()])
            .args(["-o", &format!("ConnectTimeout={connect_timeout}")])
            .args(["-o", &format!("ServerAliveInterval={SERVER_ALIVE_INTERVAL_SECS}")])
            .args(["-o", &format!("ServerAliveCountMax={SERVER_ALIVE_COUNT_MAX}")])
            .arg(format!("{}@{}", self.username, self.host))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| SipError::MissingTool(format!("{}: {err}", self.program.display())))?;
        if let Some(mut stdin) = child.stdin.take() {
            let script = commands.join("\n") + "\n";
            match stdin.write_all(script.as_bytes()) {
                // The client already exited; its status says why.
                Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {}
                Err(err) => return Err(SipError::Transfer(err.to_string())),
                Ok(()) => {}
            }
        }
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    warn!(host = %self.host, timeout = ?self.timeout, "sftp session killed");
                    return Err(SipError::Timeout(format!(
                        "sftp to {} exceeded {}s",
                        self.host,
                        self.timeout.as_secs_f32()
                    )));
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(err) => return Err(SipError::Transfer(err.to_string())),
            }
        };
        let stdout = stdout.map(collect).unwrap_or_default();
        let stderr = stderr.map(collect).unwrap_or_default();
        debug!(host = %self.host, status = ?status.code(), "sftp batch finished");
        if !status.success() {
            return Err(SipError::Transfer(format!(
                "sftp to {} failed: {}",
                self.host,
                stderr.trim()
            )));
        }
        Ok(stdout)
    }
}

fn drain(mut pipe: impl Read + Send + 'static) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn collect(handle: JoinHandle<Vec<u8>>) -> String {
    let bytes = handle.join().unwrap_or_default();
    String::from_utf8_lossy(&bytes).to_string()
}

impl TransferChannel for SftpChannel {
    fn upload(&self, local: &Utf8Path, remote: &str) -> Result<(), SipError> {
        self.batch(&[format!("put {} {}", quote(local.as_str()), quote(&self.remote(remote)))])
            .map(|_| ())
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), SipError> {
        self.batch(&[format!(
            "rename {} {}",
            quote(&self.remote(from)),
            quote(&self.remote(to))
        )])
        .map(|_| ())
    }

    fn list_dir(&self, remote: &str) -> Result<Option<Vec<String>>, SipError> {
        // A leading '-' keeps a missing directory from aborting the batch.
        let stdout = self.batch(&[format!("-ls -1 {}", quote(&self.remote(remote)))])?;
        let mut names: Vec<String> = stdout
            .lines()
            .filter(|line| !line.starts_with("sftp>") && !line.trim().is_empty())
            .map(|line| {
                let line = line.trim().trim_end_matches('/');
                line.rsplit('/').next().unwrap_or(line).to_string()
            })
            .collect();
        names.sort();
        Ok(if names.is_empty() { None } else { Some(names) })
    }

    fn fetch(&self, remote: &str, local: &Utf8Path) -> Result<(), SipError> {
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent.as_std_path()).map_err(|err| io_error(parent, err))?;
        }
        self.batch(&[format!(
            "get -r {} {}",
            quote(&self.remote(remote)),
            quote(local.as_str())
        )])
        .map(|_| ())
    }
}

fn quote(path: &str) -> String {
    format!("\"{}\"", path.replace('"', "\\\""))
}

fn transfer_io(path: impl AsRef<Utf8Path>, err: io::Error) -> SipError {
    SipError::Transfer(format!("{}: {err}", path.as_ref()))
}

/// Either channel, as selected by the configuration.
#[derive(Debug, Clone)]
pub enum ConfiguredChannel {
    Directory(DirectoryChannel),
    Sftp(SftpChannel),
}

impl ConfiguredChannel {
    pub fn from_settings(settings: &TransferSettings) -> Self {
        match settings {
            TransferSettings::Directory { root } => {
                ConfiguredChannel::Directory(DirectoryChannel::new(root.clone()))
            }
            TransferSettings::Sftp {
                host,
                port,
                username,
                private_key,
                home_path,
                timeout,
            } => ConfiguredChannel::Sftp(SftpChannel::new(
                host.clone(),
                *port,
                username.clone(),
                private_key.clone(),
                home_path.clone(),
                *timeout,
            )),
        }
    }

    fn inner(&self) -> &dyn TransferChannel {
        match self {
            ConfiguredChannel::Directory(channel) => channel,
            ConfiguredChannel::Sftp(channel) => channel,
        }
    }
}

impl TransferChannel for ConfiguredChannel {
    fn upload(&self, local: &Utf8Path, remote: &str) -> Result<(), SipError> {
        self.inner().upload(local, remote)
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), SipError> {
        self.inner().rename(from, to)
    }

    fn list_dir(&self, remote: &str) -> Result<Option<Vec<String>>, SipError> {
        self.inner().list_dir(remote)
    }

    fn fetch(&self, remote: &str, local: &Utf8Path) -> Result<(), SipError> {
        self.inner().fetch(remote, local)
    }
}

/// Submits packages and reads back the service's verdict.
pub struct TransferClient<T: TransferChannel> {
    channel: T,
}

impl<T: TransferChannel> TransferClient<T> {
    pub fn new(channel: T) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &T {
        &self.channel
    }

    /// Uploads under a temporary name the service ignores, then renames
    /// it so the service only ever sees a complete file.
    pub fn submit(&self, archive: &Utf8Path, package_name: &str) -> Result<TransferReceipt, SipError> {
        let incomplete = format!("{TRANSFER_DIR}/{package_name}.{INCOMPLETE_SUFFIX}");
        let complete = format!("{TRANSFER_DIR}/{package_name}");
        info!(package = %package_name, "uploading package");
        self.channel.upload(archive, &incomplete)?;
        self.channel.rename(&incomplete, &complete)?;
        Ok(TransferReceipt {
            transfer_id: package_name.to_string(),
            submitted_at: Utc::now(),
        })
    }

    /// Looks the package up in the service's result directories and
    /// checks the verdict against the caller's expectation.
    pub fn confirm(
        &self,
        receipt: &TransferReceipt,
        expected: ServiceOutcome,
    ) -> Result<ConfirmationReport, SipError> {
        for outcome in [ServiceOutcome::Accepted, ServiceOutcome::Rejected] {
            let Some(result_path) = self.find_result(outcome, &receipt.transfer_id)? else {
                continue;
            };
            debug!(transfer_id = %receipt.transfer_id, %outcome, path = %result_path, "found result");
            if outcome != expected {
                return Err(SipError::UnexpectedOutcome {
                    expected,
                    actual: outcome,
                });
            }
            let reports = self.channel.list_dir(&result_path)?.unwrap_or_default();
            return Ok(ConfirmationReport {
                transfer_id: receipt.transfer_id.clone(),
                outcome,
                result_path,
                reports,
            });
        }
        Err(SipError::ResultPending(format!(
            "no result published for {} yet",
            receipt.transfer_id
        )))
    }

    /// Copies the reports of a confirmed package into `destination`.
    pub fn fetch_reports(
        &self,
        report: &ConfirmationReport,
        destination: &Utf8Path,
    ) -> Result<Vec<Utf8PathBuf>, SipError> {
        let mut fetched = Vec::with_capacity(report.reports.len());
        for name in &report.reports {
            let local = destination.join(name);
            self.channel
                .fetch(&format!("{}/{name}", report.result_path), &local)?;
            fetched.push(local);
        }
        Ok(fetched)
    }

    fn find_result(
        &self,
        outcome: ServiceOutcome,
        transfer_id: &str,
    ) -> Result<Option<String>, SipError> {
        let Some(mut dates) = self.channel.list_dir(outcome.as_str())? else {
            return Ok(None);
        };
        dates.sort_by(|a, b| b.cmp(a));
        for date in dates {
            let date_dir = format!("{}/{date}", outcome.as_str());
            let entries = self.channel.list_dir(&date_dir)?.unwrap_or_default();
            if entries.iter().any(|entry| entry == transfer_id) {
                return Ok(Some(format!("{date_dir}/{transfer_id}")));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn setup() -> (tempfile::TempDir, Utf8PathBuf, TransferClient<DirectoryChannel>) {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let client = TransferClient::new(DirectoryChannel::new(root.join("service")));
        (temp, root, client)
    }

    fn receipt(name: &str) -> TransferReceipt {
        TransferReceipt {
            transfer_id: name.to_string(),
            submitted_at: Utc::now(),
        }
    }

    #[test]
    fn submit_leaves_only_complete_file() {
        let (_temp, root, client) = setup();
        let archive = root.join("20190102_Object_1.tar");
        fs::write(&archive, b"tar").unwrap();

        let receipt = client.submit(&archive, "20190102_Object_1.tar").unwrap();
        assert_eq!(receipt.transfer_id, "20190102_Object_1.tar");
        let listed = client.channel().list_dir("transfer").unwrap().unwrap();
        assert_eq!(listed, vec!["20190102_Object_1.tar".to_string()]);
    }

    #[test]
    fn missing_result_is_pending() {
        let (_temp, _root, client) = setup();
        let err = client
            .confirm(&receipt("a.tar"), ServiceOutcome::Accepted)
            .unwrap_err();
        assert_matches!(err, SipError::ResultPending(_));
        assert!(err.is_retryable());
    }

    #[test]
    fn rejection_contradicts_expected_acceptance() {
        let (_temp, root, client) = setup();
        let result = root.join("service/rejected/2020-01-02/a.tar");
        fs::create_dir_all(&result).unwrap();
        fs::write(result.join("ingest-report.xml"), b"<report/>").unwrap();

        let err = client
            .confirm(&receipt("a.tar"), ServiceOutcome::Accepted)
            .unwrap_err();
        assert_matches!(
            err,
            SipError::UnexpectedOutcome {
                expected: ServiceOutcome::Accepted,
                actual: ServiceOutcome::Rejected,
            }
        );

        let report = client
            .confirm(&receipt("a.tar"), ServiceOutcome::Rejected)
            .unwrap();
        assert_eq!(report.result_path, "rejected/2020-01-02/a.tar");
        assert_eq!(report.reports, vec!["ingest-report.xml".to_string()]);

        let fetched = client.fetch_reports(&report, &root.join("archive")).unwrap();
        assert_eq!(fs::read_to_string(&fetched[0]).unwrap(), "<report/>");
    }

    #[cfg(unix)]
    fn scripted_channel(root: &Utf8Path, script: &str, timeout: Duration) -> SftpChannel {
        let path = root.join("sftp-stub.sh");
        fs::write(&path, script).unwrap();
        SftpChannel::new(
            "dpres.example.org".to_string(),
            22,
            "museum".to_string(),
            root.join("id_ed25519"),
            "/home/museum".to_string(),
            timeout,
        )
        .with_program("sh", vec![path.to_string()])
    }

    #[cfg(unix)]
    #[test]
    fn sftp_listing_skips_echo_and_keeps_last_segment() {
        let (_temp, root, _) = setup();
        let channel = scripted_channel(
            &root,
            r#"cat > /dev/null
echo 'sftp> -ls -1 "/home/museum/accepted"'
echo '/home/museum/accepted/2020-01-02/'
echo '/home/museum/accepted/2020-01-01'
echo ''
"#,
            Duration::from_secs(10),
        );

        let names = channel.list_dir("accepted").unwrap();
        assert_eq!(
            names,
            Some(vec!["2020-01-01".to_string(), "2020-01-02".to_string()])
        );
    }

    #[cfg(unix)]
    #[test]
    fn sftp_missing_directory_lists_as_none() {
        let (_temp, root, _) = setup();
        let channel = scripted_channel(
            &root,
            r#"cat > /dev/null
echo 'sftp> -ls -1 "/home/museum/rejected"'
echo 'Can'"'"'t ls: "/home/museum/rejected" not found' >&2
"#,
            Duration::from_secs(10),
        );

        assert_eq!(channel.list_dir("rejected").unwrap(), None);
    }

    #[cfg(unix)]
    #[test]
    fn sftp_failure_reports_stderr() {
        let (_temp, root, _) = setup();
        let channel = scripted_channel(
            &root,
            "cat > /dev/null\necho 'Permission denied (publickey).' >&2\nexit 255\n",
            Duration::from_secs(10),
        );

        let err = channel.rename("a.incomplete", "a").unwrap_err();
        assert_matches!(&err, SipError::Transfer(message) if message.contains("Permission denied"));
    }

    #[cfg(unix)]
    #[test]
    fn stalled_sftp_session_times_out() {
        let (_temp, root, _) = setup();
        let channel = scripted_channel(&root, "exec sleep 5\n", Duration::from_millis(200));

        let started = Instant::now();
        let err = channel.list_dir("accepted").unwrap_err();
        assert_matches!(err, SipError::Timeout(_));
        assert!(err.is_retryable());
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
