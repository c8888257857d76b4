//! On-disk copy of every unit the agent has loaded.
//!
//! One file per unit name under the spool directory, written on load and
//! removed on unload. After a restart the agent uses it to find units it
//! left behind.

use std::io;
use std::path::{Path, PathBuf};

use armada_core::UnitFile;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct UnitSpool {
    dir: PathBuf,
}

impl UnitSpool {
    pub async fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> io::Result<PathBuf> {
        if name.is_empty() || name.contains('/') || name.starts_with('.') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("bad unit name for spool: {name:?}"),
            ));
        }
        Ok(self.dir.join(name))
    }

    pub async fn write(&self, name: &str, unit: &UnitFile) -> io::Result<()> {
        tokio::fs::write(self.path(name)?, unit.serialize()).await
    }

    pub async fn remove(&self, name: &str) -> io::Result<()> {
        match tokio::fs::remove_file(self.path(name)?).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// `None` when the file is missing or no longer parses.
    pub async fn read(&self, name: &str) -> io::Result<Option<UnitFile>> {
        let raw = match tokio::fs::read_to_string(self.path(name)?).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        match UnitFile::parse(&raw) {
            Ok(unit) => Ok(Some(unit)),
            Err(e) => {
                warn!(unit = %name, error = %e, "ignoring unparseable spool file");
                Ok(None)
            }
        }
    }

    /// Spooled unit names, sorted.
    pub async fn list(&self) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_list_read_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let spool = UnitSpool::open(tmp.path().join("units")).await.unwrap();
        let unit = UnitFile::parse("[Service]\nExecStart=/bin/sleep 3000\n").unwrap();

        spool.write("b.service", &unit).await.unwrap();
        spool.write("a.service", &unit).await.unwrap();
        assert_eq!(spool.list().await.unwrap(), ["a.service", "b.service"]);
        assert_eq!(spool.read("a.service").await.unwrap().unwrap().hash(), unit.hash());

        spool.remove("a.service").await.unwrap();
        spool.remove("a.service").await.unwrap();
        assert_eq!(spool.list().await.unwrap(), ["b.service"]);
        assert!(spool.read("a.service").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_path_like_names() {
        let tmp = tempfile::tempdir().unwrap();
        let spool = UnitSpool::open(tmp.path()).await.unwrap();
        let unit = UnitFile::parse("[Service]\nExecStart=/bin/true\n").unwrap();
        assert!(spool.write("../evil.service", &unit).await.is_err());
    }
}
