use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use toml::Value;

use crate::error::{Error, Result};

/// Build definition looked up in the working directory when `--config` is not given.
pub const DEFAULT_FILE: &str = "osbuild.toml";

/// A resolved build definition. `path` is `None` when running on built-in defaults.
#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: Option<PathBuf>,
    pub value: Value,
    /// Every file read to produce `value`: the root file, its `extends` chain and imports.
    pub sources: Vec<PathBuf>,
}

impl Default for ConfigDoc {
    fn default() -> Self {
        Self {
            path: None,
            value: Value::Table(Default::default()),
            sources: Vec::new(),
        }
    }
}

impl ConfigDoc {
    pub fn parse(raw: &str) -> Result<Self> {
        let value: Value = toml::from_str(raw)?;
        Ok(Self {
            path: None,
            value,
            sources: Vec::new(),
        })
    }

    pub fn value_path(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path.is_empty() {
            return Some(&self.value);
        }

        let mut cur = &self.value;
        for seg in path.split('.') {
            cur = cur.as_table()?.get(seg)?;
        }
        Some(cur)
    }

    pub fn deserialize_path<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let Some(v) = self.value_path(path) else {
            return Ok(None);
        };
        let parsed = v
            .clone()
            .try_into()
            .map_err(|e| Error::config(format!("failed to deserialize config at '{}': {e}", path)))?;
        Ok(Some(parsed))
    }

    /// Section `path` deserialized, or its `Default` when the section is absent.
    pub fn section<T: DeserializeOwned + Default>(&self, path: &str) -> Result<T> {
        Ok(self.deserialize_path(path)?.unwrap_or_default())
    }
}

pub fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_tbl), Value::Table(overlay_tbl)) => {
            for (k, v) in overlay_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (base_slot, overlay_val) => {
            *base_slot = overlay_val;
        }
    }
}

fn resolve_ref_path(from_file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference);
    if p.is_absolute() {
        p
    } else {
        from_file.parent().unwrap_or_else(|| Path::new(".")).join(p)
    }
}

fn take_imports(path: &Path, table: &mut toml::value::Table) -> Result<Vec<String>> {
    let Some(raw) = table.remove("imports") else {
        return Ok(Vec::new());
    };
    let Some(arr) = raw.as_array() else {
        return Err(Error::config(format!(
            "invalid imports in {} (expected array of strings)",
            path.display()
        )));
    };
    let mut out = Vec::new();
    for v in arr {
        let Some(s) = v.as_str() else {
            return Err(Error::config(format!(
                "invalid imports entry in {} (expected string)",
                path.display()
            )));
        };
        let s = s.trim();
        if !s.is_empty() {
            out.push(s.to_string());
        }
    }
    Ok(out)
}

fn load_value_inner(
    path: &Path,
    stack: &mut HashSet<PathBuf>,
    sources: &mut Vec<PathBuf>,
) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !stack.insert(canonical.clone()) {
        return Err(Error::config(format!(
            "config import cycle detected at {}",
            canonical.display()
        )));
    }
    if !sources.contains(&canonical) {
        sources.push(canonical.clone());
    }

    let data = fs::read_to_string(path)
        .map_err(|e| Error::config(format!("failed to read config {}: {e}", path.display())))?;
    let mut value: Value = toml::from_str(&data)
        .map_err(|e| Error::config(format!("TOML parse error in {}: {e}", path.display())))?;

    let mut out = Value::Table(Default::default());
    let Some(tbl) = value.as_table_mut() else {
        return Err(Error::config(format!("{} is not a TOML table", path.display())));
    };

    // Single parent first, then root-level imports, then the file itself.
    if let Some(ext) = tbl.remove("extends") {
        let Some(ext) = ext.as_str() else {
            return Err(Error::config(format!(
                "invalid extends in {} (expected string)",
                path.display()
            )));
        };
        out = load_value_inner(&resolve_ref_path(path, ext), stack, sources)?;
    }
    for imp in take_imports(path, tbl)? {
        let loaded = load_value_inner(&resolve_ref_path(path, &imp), stack, sources)?;
        merge(&mut out, loaded);
    }
    merge(&mut out, value);

    stack.remove(&canonical);
    Ok(out)
}

pub fn load(path: &Path) -> Result<ConfigDoc> {
    let mut stack = HashSet::<PathBuf>::new();
    let mut sources = Vec::new();
    let value = load_value_inner(path, &mut stack, &mut sources)?;
    Ok(ConfigDoc {
        path: Some(path.to_path_buf()),
        value,
        sources,
    })
}

/// Load `explicit` if given, else `osbuild.toml` in `cwd` if present, else defaults.
pub fn load_or_default(explicit: Option<&Path>, cwd: &Path) -> Result<ConfigDoc> {
    if let Some(p) = explicit {
        return load(p);
    }
    let candidate = cwd.join(DEFAULT_FILE);
    if candidate.is_file() {
        return load(&candidate);
    }
    Ok(ConfigDoc::default())
}
