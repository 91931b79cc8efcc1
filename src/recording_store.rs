use crate::db_types::CallId;
use crate::error::AppError;

use std::path::{Component, Path, PathBuf};
use time::OffsetDateTime;
use tokio::fs;
use tracing::debug;

/// Recording files on local disk. Callers only ever see paths relative to `root`.
#[derive(Clone, Debug)]
pub struct RecordingStore {
    root: PathBuf,
}

impl RecordingStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Writes the audio and returns its storage path. Names embed the call id, so two calls
    /// never share a file.
    pub async fn save(&self, call_id: CallId, bytes: &[u8]) -> Result<String, AppError> {
        fs::create_dir_all(&self.root).await?;
        let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
        let name = format!("{call_id}_{millis}.mp3");
        let tmp = self.root.join(format!(".{name}.part"));
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, self.root.join(&name)).await?;
        debug!(call_id, path=%name, bytes=bytes.len(), "stored recording");
        Ok(name)
    }

    pub async fn open(&self, storage_path: &str) -> Result<fs::File, AppError> {
        let full = self.resolve(storage_path)?;
        fs::File::open(&full).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                AppError::NotFound("Recording file not found on server".to_string())
            }
            _ => AppError::Io(e),
        })
    }

    pub async fn read(&self, storage_path: &str) -> Result<Vec<u8>, AppError> {
        use tokio::io::AsyncReadExt;

        let mut file = self.open(storage_path).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;
        Ok(buf)
    }

    fn resolve(&self, storage_path: &str) -> Result<PathBuf, AppError> {
        let relative = Path::new(storage_path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if storage_path.is_empty() || escapes {
            return Err(AppError::Validation(format!(
                "invalid recording path '{storage_path}'"
            )));
        }
        Ok(self.root.join(relative))
    }
}
