use std::fs;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::catalogue::{Attachment, CatalogueClient, sniff_media_type};
use crate::error::SipError;
use crate::events::attachment_path;
use crate::fs_util;
use crate::package::{CancelFlag, validate_filename};
use crate::store::io_error;

/// Extension of a binary still being written.
pub const DOWNLOAD_SUFFIX: &str = "download";

/// Streams attachment binaries into the package content directory.
///
/// A binary only ever appears under its final name once it is complete.
/// Up to `concurrency` downloads run at once and `download_all` returns
/// only after every one of them has finished.
pub struct AttachmentDownloader<'a, C: CatalogueClient> {
    client: &'a C,
    concurrency: usize,
    min_free_space: u64,
    cancel: &'a CancelFlag,
}

impl<'a, C: CatalogueClient> AttachmentDownloader<'a, C> {
    pub fn new(client: &'a C, concurrency: usize, min_free_space: u64, cancel: &'a CancelFlag) -> Self {
        Self {
            client,
            concurrency: concurrency.max(1),
            min_free_space,
            cancel,
        }
    }

    /// Downloads one attachment into `content_dir`, returning it with its
    /// local path, size and detected media type filled in.
    pub fn download(
        &self,
        attachment: &Attachment,
        content_dir: &Utf8Path,
    ) -> Result<Attachment, SipError> {
        validate_filename(&attachment.filename)?;
        let relative = attachment_path(&attachment.id, &attachment.filename);
        let final_path = content_dir.join(&relative);
        let dir = final_path
            .parent()
            .ok_or_else(|| SipError::Filesystem(format!("invalid attachment path {final_path}")))?;
        fs::create_dir_all(dir.as_std_path()).map_err(|err| io_error(dir, err))?;

        let mut result = attachment.clone();
        if final_path.as_std_path().is_file() {
            debug!(attachment_id = %attachment.id, filename = %attachment.filename, "skipping existing attachment");
            let metadata = fs::metadata(final_path.as_std_path()).map_err(|err| io_error(&final_path, err))?;
            result.size = Some(metadata.len());
            result.downloaded_at = metadata.modified().ok().map(DateTime::<Utc>::from);
            result.local_path = Some(relative);
            result.detected_media_type = detect(&final_path)?;
            return Ok(result);
        }

        self.cancel.check("attachment download")?;
        self.ensure_space(dir)?;

        let temp_path = final_path.with_extension(match final_path.extension() {
            Some(ext) => format!("{ext}.{DOWNLOAD_SUFFIX}"),
            None => DOWNLOAD_SUFFIX.to_string(),
        });
        remove_if_exists(&temp_path)?;

        info!(attachment_id = %attachment.id, filename = %attachment.filename, "downloading attachment");
        let written = match self
            .client
            .download_attachment(&attachment.id, temp_path.as_std_path())
        {
            Ok(written) => written,
            Err(err) => {
                remove_if_exists(&temp_path)?;
                return Err(err);
            }
        };

        match written {
            None | Some(0) => {
                debug!(attachment_id = %attachment.id, "attachment has no binary; keeping metadata only");
                remove_if_exists(&temp_path)?;
                result.size = None;
                result.local_path = None;
                result.downloaded_at = None;
                Ok(result)
            }
            Some(size) => {
                fs::rename(temp_path.as_std_path(), final_path.as_std_path())
                    .map_err(|err| io_error(&final_path, err))?;
                result.size = Some(size);
                result.downloaded_at = Some(Utc::now());
                result.local_path = Some(relative);
                result.detected_media_type = detect(&final_path)?;
                Ok(result)
            }
        }
    }

    /// Downloads every attachment with bounded parallelism.
    ///
    /// Results keep the input order. After the first failure no new
    /// downloads start, and the first failure in input order is returned.
    pub fn download_all(
        &self,
        attachments: &[Attachment],
        content_dir: &Utf8Path,
    ) -> Result<Vec<Attachment>, SipError> {
        let next = AtomicUsize::new(0);
        let failed = AtomicBool::new(false);
        let results: Mutex<Vec<Option<Result<Attachment, SipError>>>> =
            Mutex::new((0..attachments.len()).map(|_| None).collect());
        let workers = self.concurrency.min(attachments.len());

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        if failed.load(Ordering::SeqCst) {
                            break;
                        }
                        let index = next.fetch_add(1, Ordering::SeqCst);
                        let Some(attachment) = attachments.get(index) else {
                            break;
                        };
                        let outcome = self.download(attachment, content_dir);
                        if outcome.is_err() {
                            failed.store(true, Ordering::SeqCst);
                        }
                        if let Ok(mut slots) = results.lock() {
                            slots[index] = Some(outcome);
                        }
                    }
                });
            }
        });

        let slots = results
            .into_inner()
            .map_err(|_| SipError::Internal("download results lock poisoned".to_string()))?;
        let mut downloaded = Vec::with_capacity(slots.len());
        for (slot, attachment) in slots.into_iter().zip(attachments) {
            match slot {
                Some(Ok(done)) => downloaded.push(done),
                Some(Err(err)) => return Err(err),
                None => {
                    return Err(SipError::Cancelled(format!(
                        "download of attachment {} was not started",
                        attachment.id
                    )));
                }
            }
        }
        Ok(downloaded)
    }

    fn ensure_space(&self, dir: &Utf8Path) -> Result<(), SipError> {
        if self.min_free_space == 0 {
            return Ok(());
        }
        let available = fs_util::available_space(dir.as_std_path())?;
        if available < self.min_free_space {
            return Err(SipError::StorageExhausted(format!(
                "{available} bytes free in {dir}, {} required",
                self.min_free_space
            )));
        }
        Ok(())
    }
}

/// Links binaries completed by an earlier download into `staging`, so a
/// fresh download only fetches what is missing. Falls back to copying
/// where hard links are not possible. Returns how many were reused.
pub fn reuse_completed(
    previous: &Utf8Path,
    staging: &Utf8Path,
    attachments: &[Attachment],
) -> Result<usize, SipError> {
    let mut reused = 0;
    for attachment in attachments {
        validate_filename(&attachment.filename)?;
        let relative = attachment_path(&attachment.id, &attachment.filename);
        let source = previous.join(&relative);
        if !source.as_std_path().is_file() {
            continue;
        }
        let target = staging.join(&relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent.as_std_path()).map_err(|err| io_error(parent, err))?;
        }
        if fs::hard_link(source.as_std_path(), target.as_std_path()).is_err() {
            fs::copy(source.as_std_path(), target.as_std_path())
                .map_err(|err| io_error(&target, err))?;
        }
        debug!(attachment_id = %attachment.id, "reusing completed attachment");
        reused += 1;
    }
    Ok(reused)
}

fn detect(path: &Utf8Path) -> Result<Option<String>, SipError> {
    let head = fs_util::read_head(path.as_std_path(), 8)?;
    Ok(sniff_media_type(&head).map(str::to_string))
}

fn remove_if_exists(path: &Utf8Path) -> Result<(), SipError> {
    match fs::remove_file(path.as_std_path()) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_error(path, err)),
    }
}
