use crate::error::{Error, Result};
use crate::types::StatsMap;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use std::{
    ffi::OsString,
    io,
    path::{Path, PathBuf},
};
use tokio::fs;

/// Where usage stats go after every change. The accountant hands over the whole map each time.
#[async_trait]
pub trait StatsStore: Send + Sync + 'static {
    async fn save(&self, stats: &StatsMap) -> Result<()>;
}

/// Keeps the stats in a single human readable JSON document, rewritten in full on every save.
#[derive(Clone, Debug)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the document back. A missing file is an empty map.
    pub async fn load(&self) -> Result<StatsMap> {
        match fs::read(&self.path).await {
            Ok(document) => Ok(serde_json::from_slice(&document)?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(StatsMap::new()),
            Err(err) => Err(Error::Persist(err)),
        }
    }

    fn scratch_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(OsString::from)
            .unwrap_or_else(|| OsString::from("stats"));
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl StatsStore for JsonFileStore {
    async fn save(&self, stats: &StatsMap) -> Result<()> {
        let document = to_document(stats)?;
        // write then rename so readers never see a half written document
        let scratch = self.scratch_path();
        fs::write(&scratch, &document)
            .await
            .map_err(Error::Persist)?;
        fs::rename(&scratch, &self.path)
            .await
            .map_err(Error::Persist)
    }
}

fn to_document(stats: &StatsMap) -> Result<Vec<u8>> {
    let mut document = Vec::new();
    let mut serializer =
        serde_json::Serializer::with_formatter(&mut document, PrettyFormatter::with_indent(b"    "));
    stats.serialize(&mut serializer)?;
    document.push(b'\n');
    Ok(document)
}
