use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::EntityKind;
use crate::error::PopulateError;

/// Request bodies of successful creations, one JSON file per server ID under
/// a subdirectory per entity kind. Entries are never overwritten.
#[derive(Debug, Clone)]
pub struct Cache {
    root: Utf8PathBuf,
}

impl Cache {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn default_root() -> Result<Utf8PathBuf, PopulateError> {
        BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(
                    dirs.home_dir().join(".cache").join("populate-scamplers"),
                )
                .ok()
            })
            .ok_or_else(|| {
                PopulateError::Filesystem("unable to resolve cache directory".to_string())
            })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn subdir(&self, kind: EntityKind) -> Utf8PathBuf {
        self.root.join(kind.as_str())
    }

    pub fn entry_path(&self, kind: EntityKind, id: &str) -> Utf8PathBuf {
        self.subdir(kind).join(format!("{id}.json"))
    }

    pub fn contains(&self, kind: EntityKind, id: &str) -> bool {
        self.entry_path(kind, id).as_std_path().exists()
    }

    pub fn write<T: Serialize>(
        &self,
        kind: EntityKind,
        id: &str,
        data: &T,
    ) -> Result<Utf8PathBuf, PopulateError> {
        let path = self.entry_path(kind, id);
        if path.as_std_path().exists() {
            return Err(PopulateError::CacheEntryExists(path.to_string()));
        }
        let content = serde_json::to_vec_pretty(data)
            .map_err(|err| PopulateError::Filesystem(err.to_string()))?;
        write_new_file(&path, &content)?;
        Ok(path)
    }

    /// Decodes every entry of one kind, ordered by file name.
    pub fn read_all<T: DeserializeOwned>(&self, kind: EntityKind) -> Result<Vec<T>, PopulateError> {
        let subdir = self.subdir(kind);
        if !subdir.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        let entries = fs::read_dir(subdir.as_std_path())
            .map_err(|err| PopulateError::Filesystem(err.to_string()))?;
        for entry in entries {
            let path = entry
                .map_err(|err| PopulateError::Filesystem(err.to_string()))?
                .path();
            if path.is_file() && path.extension().map(|ext| ext == "json").unwrap_or(false) {
                paths.push(path);
            }
        }
        paths.sort();

        paths
            .into_iter()
            .map(|path| {
                let content = fs::read_to_string(&path)
                    .map_err(|err| PopulateError::Filesystem(err.to_string()))?;
                serde_json::from_str(&content).map_err(|err| {
                    PopulateError::Filesystem(format!("{}: {err}", path.display()))
                })
            })
            .collect()
    }
}

/// Writes through a temporary sibling and renames it into place, refusing to
/// replace a file that appeared in the meantime.
pub fn write_new_file(path: &Utf8Path, content: &[u8]) -> Result<(), PopulateError> {
    let parent = path
        .parent()
        .ok_or_else(|| PopulateError::Filesystem(format!("invalid path {path}")))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| PopulateError::Filesystem(err.to_string()))?;
    let temp = tempfile::Builder::new()
        .prefix(".populate-scamplers")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| PopulateError::Filesystem(err.to_string()))?;
    fs::write(temp.path(), content).map_err(|err| PopulateError::Filesystem(err.to_string()))?;
    temp.persist_noclobber(path.as_std_path())
        .map_err(|err| match err.error.kind() {
            std::io::ErrorKind::AlreadyExists => PopulateError::CacheEntryExists(path.to_string()),
            _ => PopulateError::Filesystem(err.error.to_string()),
        })?;
    Ok(())
}
