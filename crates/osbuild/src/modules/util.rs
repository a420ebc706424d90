use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{Error, Result};

pub fn ensure_dir(p: &Path) -> Result<()> {
    fs::create_dir_all(p)
        .map_err(|e| Error::msg(format!("failed to create dir {}: {e}", p.display())))
}

pub fn ensure_parent(p: &Path) -> Result<()> {
    match p.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => ensure_dir(parent),
        _ => Ok(()),
    }
}

/// Remove `p` if it exists.
pub fn remove_file_if_exists(p: &Path) -> Result<()> {
    match fs::remove_file(p) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::msg(format!("failed to remove {}: {e}", p.display()))),
    }
}

/// Replace `{name}` placeholders. Unknown placeholders (and shell `${VAR}`) are left alone.
pub fn expand_template(raw: &str, vars: &[(&str, &str)]) -> String {
    let mut out = raw.to_string();
    for (name, value) in vars {
        out = out.replace(&format!("{{{name}}}"), value);
    }
    out
}

/// Every regular file under `roots`, sorted. Directories named in `skip_dirs` and any path
/// under `exclude` are not entered; roots that do not exist are ignored.
pub fn collect_files(roots: &[PathBuf], skip_dirs: &[&str], exclude: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for root in roots {
        if !root.exists() {
            tracing::debug!(path = %root.display(), "source path does not exist; skipping");
            continue;
        }
        if root.is_file() {
            out.push(root.clone());
            continue;
        }
        let walker = WalkDir::new(root).follow_links(false).into_iter();
        for entry in walker.filter_entry(|e| {
            if e.path().starts_with(exclude) {
                return false;
            }
            if e.depth() > 0 && e.file_type().is_dir() {
                let name = e.file_name().to_string_lossy();
                return !skip_dirs.iter().any(|s| *s == name) && !name.starts_with('.');
            }
            true
        }) {
            let entry = entry.map_err(|e| {
                Error::msg(format!("failed to walk {}: {e}", root.display()))
            })?;
            if entry.file_type().is_file() {
                out.push(entry.into_path());
            }
        }
    }
    out.sort();
    out.dedup();
    Ok(out)
}
