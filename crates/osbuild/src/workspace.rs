use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::variant::BuildVariant;

fn default_root_dir() -> String {
    ".".into()
}

fn default_target_dir() -> String {
    "target".into()
}

fn default_arch() -> String {
    "x86_64".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    #[serde(default = "default_root_dir")]
    pub root_dir: String,
    #[serde(default = "default_target_dir")]
    pub target_dir: String,
    #[serde(default = "default_arch")]
    pub arch: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            target_dir: default_target_dir(),
            arch: default_arch(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanScope {
    /// Only the assembled images (all variants).
    Images,
    /// The whole target directory, compiled artifacts included.
    All,
}

#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub root: PathBuf,
    pub target_dir: PathBuf,
    pub arch: String,
}

impl WorkspacePaths {
    /// Root of every assembled image, across variants.
    pub fn images_root(&self) -> PathBuf {
        self.target_dir.join("image")
    }

    /// `<target>/image/<arch>/<tag>`: the only directory a variant's image stages write to.
    pub fn image_dir(&self, variant: BuildVariant) -> PathBuf {
        self.images_root().join(&self.arch).join(variant.tag())
    }

    pub fn resolve_under_root(&self, rel: &str) -> Result<PathBuf> {
        resolve_under(&self.root, &self.root, rel)
    }

    pub fn resolve_under_target(&self, rel: &str) -> Result<PathBuf> {
        resolve_under(&self.root, &self.target_dir, rel)
    }

    pub fn error_logs_dir(&self) -> PathBuf {
        self.target_dir.join("error-logs")
    }
}

pub fn load_paths(cfg: &WorkspaceConfig, cwd: &Path) -> Result<WorkspacePaths> {
    let root = resolve_user_path(cwd, &cfg.root_dir)?;
    let target_dir = resolve_user_dir(&root, &cfg.target_dir)?;
    let arch = cfg.arch.trim();
    if arch.is_empty() {
        return Err(Error::config("workspace.arch is empty"));
    }
    Ok(WorkspacePaths {
        root,
        target_dir,
        arch: arch.to_string(),
    })
}

pub fn clean(paths: &WorkspacePaths, scope: CleanScope) -> Result<Vec<PathBuf>> {
    let dirs = match scope {
        CleanScope::Images => vec![paths.images_root()],
        CleanScope::All => vec![paths.target_dir.clone()],
    };
    let mut removed = Vec::new();
    for dir in dirs {
        if safe_remove_dir_all(&paths.root, &dir)? {
            removed.push(dir);
        }
    }
    Ok(removed)
}

fn resolve_user_dir(root: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::config("empty workspace dir"));
    }
    if Path::new(p)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::config(format!(
            "invalid workspace dir '{}' (contains '..')",
            p
        )));
    }
    let pb = PathBuf::from(p);
    Ok(if pb.is_absolute() { pb } else { root.join(pb) })
}

fn resolve_user_path(base: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::config("empty workspace path"));
    }
    if p == "." {
        return Ok(base.to_path_buf());
    }
    let pb = PathBuf::from(p);
    Ok(if pb.is_absolute() { pb } else { base.join(pb) })
}

fn safe_remove_dir_all(root: &Path, dir: &Path) -> Result<bool> {
    if !dir.exists() {
        return Ok(false);
    }
    let root_can = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let dir_can = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    if !dir_can.starts_with(&root_can) || dir_can == root_can {
        return Err(Error::config(format!(
            "refusing to remove '{}' (not inside workspace root '{}')",
            dir_can.display(),
            root_can.display()
        )));
    }
    fs::remove_dir_all(&dir_can)
        .map_err(|e| Error::msg(format!("failed to remove dir {}: {e}", dir_can.display())))?;
    Ok(true)
}

fn resolve_under(root: &Path, base: &Path, rel: &str) -> Result<PathBuf> {
    let rel = rel.trim();
    if rel.is_empty() {
        return Err(Error::config("empty relative path"));
    }
    if Path::new(rel)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::config(format!(
            "invalid relative path '{}' (contains '..')",
            rel
        )));
    }
    let pb = PathBuf::from(rel);
    let out = if pb.is_absolute() { pb } else { base.join(pb) };
    // Absolute paths must still land inside the workspace.
    let root_can = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let out_can = out.canonicalize().unwrap_or_else(|_| out.clone());
    if !out_can.starts_with(&root_can) {
        return Err(Error::config(format!(
            "refusing path '{}' (outside workspace root '{}')",
            out.display(),
            root.display()
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(root: &Path) -> WorkspacePaths {
        load_paths(&WorkspaceConfig::default(), root).expect("paths")
    }

    #[test]
    fn image_dirs_are_namespaced_per_variant() {
        let ws = paths(Path::new("/tmp/osbuild-root"));
        let debug = ws.image_dir(BuildVariant::Debug);
        let release = ws.image_dir(BuildVariant::Optimized);
        assert_eq!(debug, PathBuf::from("/tmp/osbuild-root/target/image/x86_64/debug"));
        assert_ne!(debug, release);
        assert!(!debug.starts_with(&release) && !release.starts_with(&debug));
    }

    #[test]
    fn rejects_parent_components() {
        let ws = paths(Path::new("/tmp/osbuild-root"));
        assert!(ws.resolve_under_root("../outside").is_err());
        let cfg = WorkspaceConfig {
            target_dir: "../target".into(),
            ..WorkspaceConfig::default()
        };
        assert!(load_paths(&cfg, Path::new("/tmp/osbuild-root")).is_err());
    }

    #[test]
    fn clean_images_keeps_compiled_artifacts() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cfg = WorkspaceConfig {
            root_dir: tmp.path().display().to_string(),
            ..WorkspaceConfig::default()
        };
        let ws = load_paths(&cfg, tmp.path()).expect("paths");
        for v in BuildVariant::ALL {
            fs::create_dir_all(ws.image_dir(v)).expect("mkdir image");
        }
        let kernel_dir = ws.target_dir.join("kernel-x86_64").join("debug");
        fs::create_dir_all(&kernel_dir).expect("mkdir kernel");

        let removed = clean(&ws, CleanScope::Images).expect("clean");
        assert_eq!(removed, vec![ws.images_root()]);
        assert!(!ws.images_root().exists());
        assert!(kernel_dir.exists());

        clean(&ws, CleanScope::All).expect("clean all");
        assert!(!ws.target_dir.exists());
        assert!(clean(&ws, CleanScope::All).expect("idempotent").is_empty());
    }
}
