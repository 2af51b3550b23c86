use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File};

use crate::EditionId;

/// Username used for the storage root when none has been recorded.
pub const DEFAULT_USERNAME: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Pdf,
}

impl FileType {
    pub fn extension(&self) -> &'static str {
        match self {
            FileType::Pdf => ".pdf",
        }
    }
}

/// Per-user directory tree holding downloaded files.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(base_dir: impl AsRef<Path>, username: Option<&str>) -> Self {
        let username = username
            .map(sanitize_path_segment)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| DEFAULT_USERNAME.to_string());
        Self {
            root: base_dir.as_ref().join(username),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<prefix>/<id><ext>`; the prefix is split on `/` and every
    /// segment sanitized so it cannot escape the root.
    pub fn resolve(&self, prefix: &str, id: EditionId, file_type: FileType) -> PathBuf {
        self.dir_for(prefix)
            .join(format!("{}{}", id, file_type.extension()))
    }

    pub fn reader_path(&self, edition_id: EditionId, publication_id: &str) -> PathBuf {
        self.resolve(publication_id, edition_id, FileType::Pdf)
    }

    pub async fn create(&self, prefix: &str, id: EditionId, file_type: FileType) -> io::Result<(PathBuf, File)> {
        let dir = self.dir_for(prefix);
        fs::create_dir_all(&dir).await?;
        let path = self.resolve(prefix, id, file_type);
        let file = File::create(&path).await?;
        Ok((path, file))
    }

    /// Removes the file. A file that is already absent counts as removed.
    pub async fn delete(&self, prefix: &str, id: EditionId, file_type: FileType) -> io::Result<()> {
        remove_if_present(&self.resolve(prefix, id, file_type)).await
    }

    fn dir_for(&self, prefix: &str) -> PathBuf {
        prefix
            .split('/')
            .map(sanitize_path_segment)
            .filter(|segment| !segment.is_empty() && segment != "." && segment != "..")
            .fold(self.root.clone(), |dir, segment| dir.join(segment))
    }
}

pub(crate) async fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

pub fn sanitize_path_segment(segment: &str) -> String {
    segment
        .trim()
        .replace(|c: char| !c.is_alphanumeric() && c != '.' && c != '-' && c != '_', "_")
}
