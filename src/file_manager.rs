use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::error::WriteError;
use crate::url_mapper::{LocalPath, DEFAULT_FILENAME};

/// Persists mirror files below one output root.
///
/// Every write lands in a temporary file next to its target and is renamed
/// into place, so readers and interrupted runs never observe a partial file.
#[derive(Clone, Debug)]
pub struct FileManager {
    base_dir: PathBuf,
}

impl FileManager {
    pub fn new(base_dir: &Path) -> io::Result<Self> {
        let base_dir = base_dir.to_path_buf();
        fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn resolve(&self, local: &LocalPath) -> PathBuf {
        self.base_dir.join(local.to_path_buf())
    }

    /// `<base_dir>/index.html`.
    pub fn root_document_path(&self) -> PathBuf {
        self.base_dir.join(DEFAULT_FILENAME)
    }

    /// Writes an asset, creating parent directories. Overwrites what was there.
    pub fn save_file(&self, local: &LocalPath, content: &[u8]) -> Result<PathBuf, WriteError> {
        let path = self.resolve(local);
        write_atomic(&path, content)?;
        Ok(path)
    }

    pub fn save_root_document(&self, content: &[u8]) -> Result<PathBuf, WriteError> {
        let path = self.root_document_path();
        write_atomic(&path, content)?;
        Ok(path)
    }
}

pub(crate) fn write_atomic(path: &Path, content: &[u8]) -> Result<(), WriteError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    // create_dir_all treats a concurrently created directory as success.
    fs::create_dir_all(parent).map_err(|e| WriteError::new(parent, e))?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(|e| WriteError::new(path, e))?;
    tmp.write_all(content).map_err(|e| WriteError::new(path, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o644))
            .map_err(|e| WriteError::new(path, e))?;
    }

    tmp.persist(path).map_err(|e| WriteError::new(path, e.error))?;
    Ok(())
}
