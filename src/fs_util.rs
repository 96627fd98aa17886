use std::fs;
use std::io::{self, Read};
use std::path::Path;

use flate2::Compression;
use flate2::write::GzEncoder;
use zip::ZipArchive;

use crate::error::SipError;

pub fn extract_zip(zip_path: &Path, target_dir: &Path) -> Result<Vec<String>, SipError> {
    let file = fs::File::open(zip_path)
        .map_err(|err| SipError::Filesystem(format!("open zip {}: {err}", zip_path.display())))?;
    let mut archive = ZipArchive::new(file).map_err(|err| {
        SipError::MalformedDocument(format!("{}: {err}", zip_path.display()))
    })?;

    let mut extracted = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| SipError::MalformedDocument(err.to_string()))?;
        let relative = match entry.enclosed_name() {
            Some(path) => path,
            None => {
                return Err(SipError::MalformedDocument(format!(
                    "zip entry path traversal detected in {}",
                    zip_path.display()
                )));
            }
        };
        let entry_path = target_dir.join(&relative);

        if entry.is_dir() {
            fs::create_dir_all(&entry_path).map_err(|err| io_failure(&entry_path, err))?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent).map_err(|err| io_failure(parent, err))?;
        }
        let mut outfile =
            fs::File::create(&entry_path).map_err(|err| io_failure(&entry_path, err))?;
        io::copy(&mut entry, &mut outfile).map_err(|err| io_failure(&entry_path, err))?;
        extracted.push(relative.to_string_lossy().replace('\\', "/"));
    }
    Ok(extracted)
}

/// Packs the contents of `source_dir` into an uncompressed TAR archive
/// with paths relative to the directory.
pub fn tar_directory(source_dir: &Path, destination: &Path) -> Result<(), SipError> {
    let file = fs::File::create(destination).map_err(|err| io_failure(destination, err))?;
    let mut builder = tar::Builder::new(file);
    builder.follow_symlinks(false);
    builder
        .append_dir_all(".", source_dir)
        .map_err(|err| io_failure(source_dir, err))?;
    let file = builder
        .into_inner()
        .map_err(|err| io_failure(destination, err))?;
    file.sync_all().map_err(|err| io_failure(destination, err))
}

/// Writes a gzip-compressed copy of `source` to `destination`.
pub fn gzip_file(source: &Path, destination: &Path) -> Result<(), SipError> {
    let mut input = fs::File::open(source).map_err(|err| io_failure(source, err))?;
    let output = fs::File::create(destination).map_err(|err| io_failure(destination, err))?;
    let mut encoder = GzEncoder::new(output, Compression::default());
    io::copy(&mut input, &mut encoder).map_err(|err| io_failure(destination, err))?;
    encoder
        .finish()
        .map_err(|err| io_failure(destination, err))?;
    Ok(())
}

/// Bytes available to unprivileged users on the filesystem holding `path`.
pub fn available_space(path: &Path) -> Result<u64, SipError> {
    fs2::available_space(path).map_err(|err| io_failure(path, err))
}

/// First bytes of a file, used for signature sniffing.
pub fn read_head(path: &Path, len: usize) -> Result<Vec<u8>, SipError> {
    let file = fs::File::open(path).map_err(|err| io_failure(path, err))?;
    let mut head = Vec::with_capacity(len);
    file.take(len as u64)
        .read_to_end(&mut head)
        .map_err(|err| io_failure(path, err))?;
    Ok(head)
}

fn io_failure(path: &Path, err: io::Error) -> SipError {
    if err.kind() == io::ErrorKind::StorageFull {
        SipError::StorageExhausted(format!("{}: {err}", path.display()))
    } else {
        SipError::Filesystem(format!("{}: {err}", path.display()))
    }
}
