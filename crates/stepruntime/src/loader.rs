use crate::error::RegistryError;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub const MANIFEST_SUFFIX: &str = ".step.json";

/// One discovered step unit, not yet parsed.
#[derive(Debug, Clone)]
pub struct RawStepDescriptor {
    /// Derived from the manifest's path relative to its root.
    pub id: String,
    pub manifest_path: PathBuf,
    /// Directory handler paths are resolved against.
    pub base_dir: PathBuf,
    pub contents: String,
}

/// Pluggable discovery of step units.
pub trait StepSource: Send + Sync {
    /// Find every step unit below `roots`. Units that cannot be read are
    /// reported individually; discovery itself never fails as a whole.
    fn discover(&self, roots: &[PathBuf]) -> Vec<Result<RawStepDescriptor, RegistryError>>;
}

/// Walks directories for `<name>.step.json` manifests.
#[derive(Debug, Clone, Default)]
pub struct FsStepSource;

impl FsStepSource {
    pub fn new() -> Self {
        Self
    }

    fn walk(
        &self,
        root: &Path,
        dir: &Path,
        visited: &mut HashSet<PathBuf>,
        found: &mut Vec<Result<RawStepDescriptor, RegistryError>>,
    ) {
        // symlinked directories are followed, each real directory at most once
        match std::fs::canonicalize(dir) {
            Ok(real) if !visited.insert(real.clone()) => {
                tracing::debug!(dir = %dir.display(), "Directory already visited, skipping");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                found.push(Err(RegistryError::Unreadable {
                    path: dir.to_path_buf(),
                    message: e.to_string(),
                }));
                return;
            }
        }

        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                found.push(Err(RegistryError::Unreadable {
                    path: dir.to_path_buf(),
                    message: e.to_string(),
                }));
                return;
            }
        };

        let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
        paths.sort();

        for path in paths {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();

            if path.is_dir() {
                if name.starts_with('.') || name == "node_modules" || name == "__pycache__" {
                    continue;
                }
                self.walk(root, &path, visited, found);
            } else if name.ends_with(MANIFEST_SUFFIX) {
                found.push(self.read_unit(root, &path));
            }
        }
    }

    fn read_unit(&self, root: &Path, path: &Path) -> Result<RawStepDescriptor, RegistryError> {
        let contents = std::fs::read_to_string(path).map_err(|e| RegistryError::Unreadable {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        Ok(RawStepDescriptor {
            id: step_id_for(root, path),
            manifest_path: path.to_path_buf(),
            base_dir: path.parent().map(Path::to_path_buf).unwrap_or_default(),
            contents,
        })
    }
}

impl StepSource for FsStepSource {
    fn discover(&self, roots: &[PathBuf]) -> Vec<Result<RawStepDescriptor, RegistryError>> {
        let mut found = Vec::new();
        for root in roots {
            if !root.is_dir() {
                tracing::warn!(root = %root.display(), "Step root is not a directory, skipping");
                continue;
            }
            tracing::debug!(root = %root.display(), "Discovering steps");
            self.walk(root, root, &mut HashSet::new(), &mut found);
        }
        found
    }
}

/// Fixed set of descriptors, for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticStepSource {
    units: Vec<RawStepDescriptor>,
}

impl StaticStepSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a unit whose manifest is given inline; handler paths resolve against `base_dir`.
    pub fn with_unit(mut self, id: impl Into<String>, base_dir: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        let id = id.into();
        let base_dir = base_dir.into();
        self.units.push(RawStepDescriptor {
            manifest_path: base_dir.join(format!("{}{}", id, MANIFEST_SUFFIX)),
            id,
            base_dir,
            contents: contents.into(),
        });
        self
    }
}

impl StepSource for StaticStepSource {
    fn discover(&self, _roots: &[PathBuf]) -> Vec<Result<RawStepDescriptor, RegistryError>> {
        self.units.iter().cloned().map(Ok).collect()
    }
}

/// `root/orders/create.step.json` -> `orders/create`
pub fn step_id_for(root: &Path, manifest: &Path) -> String {
    let relative = manifest.strip_prefix(root).unwrap_or(manifest);
    let joined = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/");
    joined
        .strip_suffix(MANIFEST_SUFFIX)
        .map(str::to_string)
        .unwrap_or(joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_id_is_relative_path_without_suffix() {
        let root = Path::new("/srv/steps");
        assert_eq!(
            step_id_for(root, Path::new("/srv/steps/orders/create.step.json")),
            "orders/create"
        );
        assert_eq!(step_id_for(root, Path::new("/srv/steps/ping.step.json")), "ping");
    }

    #[test]
    fn walk_finds_nested_manifests_and_skips_hidden_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("orders")).unwrap();
        std::fs::create_dir_all(root.join(".cache")).unwrap();
        std::fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
        std::fs::write(root.join("orders/create.step.json"), "{}").unwrap();
        std::fs::write(root.join("orders/handler.py"), "").unwrap();
        std::fs::write(root.join("ping.step.json"), "{}").unwrap();
        std::fs::write(root.join(".cache/ghost.step.json"), "{}").unwrap();
        std::fs::write(root.join("node_modules/pkg/dep.step.json"), "{}").unwrap();

        let found = FsStepSource::new().discover(&[root.to_path_buf()]);
        let ids: Vec<String> = found.into_iter().map(|r| r.unwrap().id).collect();

        assert_eq!(ids, vec!["orders/create".to_string(), "ping".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_loops_do_not_recurse_forever() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("orders")).unwrap();
        std::fs::write(root.join("orders/create.step.json"), "{}").unwrap();
        std::os::unix::fs::symlink(root, root.join("orders/loop")).unwrap();

        let found = FsStepSource::new().discover(&[root.to_path_buf()]);
        let ids: Vec<String> = found.into_iter().map(|r| r.unwrap().id).collect();

        assert_eq!(ids, vec!["orders/create".to_string()]);
    }
}
