use super::RollbackPoint;
use crate::security::error::{Result, SecurityError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Where rollback points are kept between runs.
pub trait RollbackStore: Send + Sync {
    fn save(&self, point: &RollbackPoint) -> Result<()>;
    /// Deleting a missing point is not an error.
    fn delete(&self, id: &str) -> Result<()>;
    fn load_all(&self) -> Result<Vec<RollbackPoint>>;
    fn clear(&self) -> Result<()>;
}

/// Keeps nothing across restarts.
#[derive(Debug, Default)]
pub struct MemoryStore {
    points: Mutex<HashMap<String, RollbackPoint>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RollbackStore for MemoryStore {
    fn save(&self, point: &RollbackPoint) -> Result<()> {
        self.points.lock().insert(point.id.clone(), point.clone());
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<()> {
        self.points.lock().remove(id);
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<RollbackPoint>> {
        Ok(self.points.lock().values().cloned().collect())
    }

    fn clear(&self) -> Result<()> {
        self.points.lock().clear();
        Ok(())
    }
}

/// One pretty-printed `<id>.json` per point.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn json_files(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        Ok(files)
    }
}

impl RollbackStore for JsonFileStore {
    fn save(&self, point: &RollbackPoint) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&point.id);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(point)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<()> {
        match std::fs::remove_file(self.path_for(id)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn load_all(&self) -> Result<Vec<RollbackPoint>> {
        let mut points = Vec::new();
        for path in self.json_files()? {
            let parsed = std::fs::read_to_string(&path)
                .map_err(SecurityError::from)
                .and_then(|raw| {
                    serde_json::from_str::<RollbackPoint>(&raw).map_err(SecurityError::from)
                });
            match parsed {
                Ok(point) => points.push(point),
                Err(e) => {
                    tracing::warn!(path = %path.display(), "Skipping unreadable rollback point: {e}");
                }
            }
        }
        Ok(points)
    }

    fn clear(&self) -> Result<()> {
        for path in self.json_files()? {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}
