use std::ffi::OsString;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use jwalk::WalkDir;
use tempfile::NamedTempFile;
use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

use crate::error::ArchiveError;

/// `<dir>.zip`, next to the directory.
pub fn archive_path_for(dir: &Path) -> PathBuf {
    let mut name = OsString::from(dir.as_os_str());
    name.push(".zip");
    PathBuf::from(name)
}

/// Packs every file below `dir` into `<dir>.zip` with paths relative to `dir`.
///
/// Entries are added in sorted order with a fixed timestamp, so archiving an
/// unchanged tree twice yields the same bytes.
pub fn zip_directory(dir: &Path) -> Result<PathBuf, ArchiveError> {
    let target = archive_path_for(dir);
    let parent = target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));

    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(DateTime::default())
        .unix_permissions(0o644);

    let mut tmp = NamedTempFile::new_in(parent)?;
    let mut zip = ZipWriter::new(tmp.as_file_mut());
    let mut entries = 0usize;

    for entry in WalkDir::new(dir).sort(true) {
        let entry = entry.map_err(|source| ArchiveError::Walk {
            path: dir.to_path_buf(),
            source,
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let Some(name) = entry_name(dir, &path) else {
            continue;
        };
        debug!(entry = %name, "adding to archive");
        zip.start_file(name, options)?;
        io::copy(&mut File::open(&path)?, &mut zip)?;
        entries += 1;
    }

    zip.finish()?;
    tmp.persist(&target)?;
    info!(archive = %target.display(), entries, "archive written");
    Ok(target)
}

/// Archive entry name: relative to `root`, `/`-separated.
fn entry_name(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    (!parts.is_empty()).then(|| parts.join("/"))
}
