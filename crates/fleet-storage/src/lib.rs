//! Fleet Storage -- template storages.
//!
//! A template is a directory of files that services are created from,
//! addressed as `prefix/name` inside a named storage. Templates arrive as tar
//! streams (usually over a chunked transfer) and are unpacked in place.
//!
//! Only the local-directory storage lives here; remote backends plug in
//! through `TemplateStorage`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, RwLock};

/// Name of the storage every node has.
pub const LOCAL_STORAGE: &str = "local";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid template path {0:?}")]
    InvalidTemplate(String),
    #[error("unknown storage {0}")]
    UnknownStorage(String),
    #[error("lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceTemplate {
    pub prefix: String,
    pub name: String,
    #[serde(default = "default_storage")]
    pub storage: String,
}

fn default_storage() -> String {
    LOCAL_STORAGE.into()
}

impl ServiceTemplate {
    pub fn new(prefix: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            name: name.into(),
            storage: default_storage(),
        }
    }

    pub fn with_storage(mut self, storage: impl Into<String>) -> Self {
        self.storage = storage.into();
        self
    }

    /// `prefix/name`
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.prefix, self.name)
    }

    /// Relative directory of the template. Both parts must be a single
    /// plain path segment.
    pub fn relative_path(&self) -> Result<PathBuf> {
        for part in [&self.prefix, &self.name] {
            let mut components = Path::new(part).components();
            match (components.next(), components.next()) {
                (Some(Component::Normal(_)), None) => {}
                _ => return Err(StorageError::InvalidTemplate(self.full_name())),
            }
        }
        Ok(Path::new(&self.prefix).join(&self.name))
    }
}

impl std::fmt::Display for ServiceTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.storage, self.full_name())
    }
}

/// Storage for templates. Calls block; run them off async tasks.
pub trait TemplateStorage: Send + Sync {
    fn name(&self) -> &str;

    fn has(&self, template: &ServiceTemplate) -> Result<bool>;

    /// Remove the template. Returns whether it existed.
    fn delete(&self, template: &ServiceTemplate) -> Result<bool>;

    /// Unpack a tar stream into the template, creating it if needed.
    /// Existing files are overwritten, others are kept.
    fn deploy(&self, template: &ServiceTemplate, source: &mut dyn Read) -> Result<()>;

    /// Relative paths of all regular files, sorted.
    fn list_files(&self, template: &ServiceTemplate) -> Result<Vec<String>>;
}

/// Templates in a directory tree: `<root>/<prefix>/<name>/...`.
pub struct LocalTemplateStorage {
    root: PathBuf,
}

impl LocalTemplateStorage {
    pub fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir(&self, template: &ServiceTemplate) -> Result<PathBuf> {
        Ok(self.root.join(template.relative_path()?))
    }
}

impl TemplateStorage for LocalTemplateStorage {
    fn name(&self) -> &str {
        LOCAL_STORAGE
    }

    fn has(&self, template: &ServiceTemplate) -> Result<bool> {
        Ok(self.dir(template)?.is_dir())
    }

    fn delete(&self, template: &ServiceTemplate) -> Result<bool> {
        let dir = self.dir(template)?;
        if !dir.exists() {
            return Ok(false);
        }
        std::fs::remove_dir_all(&dir)?;
        tracing::info!(template = %template, "template deleted");
        Ok(true)
    }

    fn deploy(&self, template: &ServiceTemplate, source: &mut dyn Read) -> Result<()> {
        let dir = self.dir(template)?;
        std::fs::create_dir_all(&dir)?;
        let mut archive = tar::Archive::new(source);
        archive.set_overwrite(true);
        archive.unpack(&dir)?;
        tracing::info!(template = %template, dir = %dir.display(), "template deployed");
        Ok(())
    }

    fn list_files(&self, template: &ServiceTemplate) -> Result<Vec<String>> {
        let dir = self.dir(template)?;
        let mut files = Vec::new();
        if dir.is_dir() {
            collect_files(&dir, &dir, &mut files)?;
        }
        files.sort();
        Ok(files)
    }
}

fn collect_files(base: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(base, &path, out)?;
        } else if file_type.is_file() {
            if let Ok(relative) = path.strip_prefix(base) {
                out.push(relative.to_string_lossy().replace('\\', "/"));
            }
        }
    }
    Ok(())
}

/// Storages by name.
#[derive(Default)]
pub struct TemplateStorageProvider {
    storages: RwLock<HashMap<String, Arc<dyn TemplateStorage>>>,
}

impl TemplateStorageProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider holding only the local storage rooted at `root`.
    pub fn with_local(root: &Path) -> Result<Self> {
        let provider = Self::new();
        provider.register(Arc::new(LocalTemplateStorage::open(root)?))?;
        Ok(provider)
    }

    pub fn register(&self, storage: Arc<dyn TemplateStorage>) -> Result<()> {
        let mut storages = self
            .storages
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        storages.insert(storage.name().to_string(), storage);
        Ok(())
    }

    pub fn storage(&self, name: &str) -> Result<Arc<dyn TemplateStorage>> {
        let storages = self
            .storages
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        storages
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::UnknownStorage(name.to_string()))
    }

    pub fn local(&self) -> Result<Arc<dyn TemplateStorage>> {
        self.storage(LOCAL_STORAGE)
    }

    pub fn names(&self) -> Result<Vec<String>> {
        let storages = self
            .storages
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        let mut names: Vec<String> = storages.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tar_of(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn storage() -> (tempfile::TempDir, LocalTemplateStorage) {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = LocalTemplateStorage::open(&dir.path().join("templates")).unwrap();
        (dir, storage)
    }

    #[test]
    fn test_deploy_and_list() {
        let (_dir, storage) = storage();
        let template = ServiceTemplate::new("lobby", "default");
        assert!(!storage.has(&template).unwrap());

        let archive = tar_of(&[("server.properties", b"port=25565"), ("plugins/a.jar", b"jar")]);
        storage.deploy(&template, &mut &archive[..]).unwrap();

        assert!(storage.has(&template).unwrap());
        assert_eq!(
            storage.list_files(&template).unwrap(),
            vec!["plugins/a.jar", "server.properties"]
        );
        let content =
            std::fs::read(storage.root().join("lobby/default/server.properties")).unwrap();
        assert_eq!(content, b"port=25565");
    }

    #[test]
    fn test_deploy_merges_existing_files() {
        let (_dir, storage) = storage();
        let template = ServiceTemplate::new("lobby", "default");
        storage
            .deploy(&template, &mut &tar_of(&[("a.txt", b"old"), ("b.txt", b"keep")])[..])
            .unwrap();
        storage
            .deploy(&template, &mut &tar_of(&[("a.txt", b"new")])[..])
            .unwrap();

        let root = storage.root().join("lobby/default");
        assert_eq!(std::fs::read(root.join("a.txt")).unwrap(), b"new");
        assert_eq!(std::fs::read(root.join("b.txt")).unwrap(), b"keep");
    }

    #[test]
    fn test_delete() {
        let (_dir, storage) = storage();
        let template = ServiceTemplate::new("lobby", "default");
        assert!(!storage.delete(&template).unwrap());
        storage
            .deploy(&template, &mut &tar_of(&[("a.txt", b"x")])[..])
            .unwrap();
        assert!(storage.delete(&template).unwrap());
        assert!(!storage.has(&template).unwrap());
        assert!(storage.list_files(&template).unwrap().is_empty());
    }

    #[test]
    fn test_rejects_path_escape() {
        let (_dir, storage) = storage();
        for (prefix, name) in [("..", "x"), ("lobby", "../../etc"), ("a/b", "c"), ("", "x")] {
            let template = ServiceTemplate::new(prefix, name);
            assert!(matches!(
                storage.has(&template),
                Err(StorageError::InvalidTemplate(_))
            ));
        }
    }

    #[test]
    fn test_provider_lookup() {
        let dir = tempfile::TempDir::new().unwrap();
        let provider = TemplateStorageProvider::with_local(dir.path()).unwrap();
        assert_eq!(provider.names().unwrap(), vec!["local"]);
        assert_eq!(provider.local().unwrap().name(), "local");
        assert!(matches!(
            provider.storage("s3"),
            Err(StorageError::UnknownStorage(_))
        ));
    }

    #[test]
    fn test_template_serde_defaults_storage() {
        let template: ServiceTemplate =
            serde_json::from_str(r#"{"prefix":"lobby","name":"default"}"#).unwrap();
        assert_eq!(template.storage, LOCAL_STORAGE);
        assert_eq!(template.to_string(), "local:lobby/default");
    }
}
