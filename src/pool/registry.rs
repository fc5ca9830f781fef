//! The user-level project registry file (`projects.yaml`).
//!
//! A versioned list of known projects plus an optional default. The pool
//! reads it once at construction and mutates it only through pool APIs;
//! writes go through a temp file and rename.

use crate::errors::{QuorumError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const REGISTRY_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    #[default]
    Active,
    Archived,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectEntry {
    pub id: String,
    pub path: PathBuf,
    pub name: String,
    #[serde(default)]
    pub last_accessed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: ProjectStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRegistry {
    pub version: u32,
    #[serde(default)]
    pub default_project: Option<String>,
    #[serde(default)]
    pub projects: Vec<ProjectEntry>,
}

impl Default for ProjectRegistry {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION,
            default_project: None,
            projects: Vec::new(),
        }
    }
}

impl ProjectRegistry {
    /// Load the registry, or start empty when the file does not exist yet.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| QuorumError::Io(format!("read {}: {e}", path.display())))?;
        let registry: Self = serde_yaml::from_str(&text)?;
        if registry.version > REGISTRY_VERSION {
            return Err(QuorumError::Incompatible {
                found: registry.version as i64,
                supported: REGISTRY_VERSION as i64,
            });
        }
        Ok(registry)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| QuorumError::Io(format!("create {}: {e}", parent.display())))?;
        }
        let yaml = serde_yaml::to_string(self)?;
        let tmp = path.with_extension("yaml.tmp");
        std::fs::write(&tmp, yaml)
            .map_err(|e| QuorumError::Io(format!("write {}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| QuorumError::Io(format!("rename {}: {e}", path.display())))?;
        Ok(())
    }

    pub fn find(&self, id: &str) -> Option<&ProjectEntry> {
        self.projects.iter().find(|p| p.id == id)
    }

    pub fn touch(&mut self, id: &str) {
        if let Some(entry) = self.projects.iter_mut().find(|p| p.id == id) {
            entry.last_accessed = Some(Utc::now());
        }
    }

    pub fn upsert(&mut self, entry: ProjectEntry) {
        match self.projects.iter_mut().find(|p| p.id == entry.id) {
            Some(existing) => *existing = entry,
            None => self.projects.push(entry),
        }
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.projects.len();
        self.projects.retain(|p| p.id != id);
        if self.default_project.as_deref() == Some(id) {
            self.default_project = None;
        }
        self.projects.len() != before
    }

    /// Default location: `<user_config>/quorum/projects.yaml`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("quorum")
            .join("projects.yaml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_missing_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let registry = ProjectRegistry::load(&dir.path().join("projects.yaml")).unwrap();
        assert_eq!(registry.version, REGISTRY_VERSION);
        assert!(registry.projects.is_empty());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("projects.yaml");
        let mut registry = ProjectRegistry::default();
        registry.upsert(ProjectEntry {
            id: "alpha".into(),
            path: PathBuf::from("/work/alpha"),
            name: "Alpha".into(),
            last_accessed: None,
            status: ProjectStatus::Active,
        });
        registry.default_project = Some("alpha".into());
        registry.save(&path).unwrap();

        let loaded = ProjectRegistry::load(&path).unwrap();
        assert_eq!(loaded.projects.len(), 1);
        assert_eq!(loaded.default_project.as_deref(), Some("alpha"));
        assert_eq!(loaded.find("alpha").unwrap().name, "Alpha");
    }

    #[test]
    fn test_newer_version_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("projects.yaml");
        std::fs::write(&path, "version: 99\nprojects: []\n").unwrap();
        let err = ProjectRegistry::load(&path).unwrap_err();
        assert_eq!(err.kind(), "incompatible");
    }

    #[test]
    fn test_remove_clears_default() {
        let mut registry = ProjectRegistry::default();
        registry.upsert(ProjectEntry {
            id: "a".into(),
            path: PathBuf::from("/a"),
            name: "a".into(),
            last_accessed: None,
            status: ProjectStatus::Active,
        });
        registry.default_project = Some("a".into());
        assert!(registry.remove("a"));
        assert!(registry.default_project.is_none());
        assert!(!registry.remove("a"));
    }
}
