//! Saving and restoring the root's parameters.
//!
//! # Layout
//!
//! ```text
//! <models_dir>/
//! └── models-<step>/            (written as models-<step>.tmp, then renamed;
//!                                a replaced snapshot waits as models-<step>.old)
//!     ├── policy/
//!     │   ├── model-<id>.bin
//!     │   └── model-<id>.bin.meta     (ParamMeta as JSON)
//!     └── hrl/
//!         └── worker-0/
//!             ├── model-<id>.bin
//!             └── model-<id>.bin.meta
//! ```
//!
//! Tags containing `/` map to nested directories. Loading walks the tree and
//! pushes every stored value back with its id, time and count preserved.

use super::meta::{Overrides, ParamMeta};
use super::root::ParamRoot;
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

const PARAM_EXTENSION: &str = "bin";
const META_SUFFIX: &str = ".meta";

/// Directory a snapshot of `step` ends up in.
pub fn snapshot_dir(models_dir: &Path, step: u64) -> PathBuf {
    models_dir.join(format!("models-{}", step))
}

impl ParamRoot {
    /// Write every tag under `models_dir/models-<step>`.
    ///
    /// The snapshot becomes visible atomically via a rename. Returns `None`
    /// when there is nothing to save.
    pub fn snapshot(&self, step: u64) -> Result<Option<PathBuf>> {
        let entries = self.entries();
        if entries.is_empty() {
            return Ok(None);
        }
        let target = snapshot_dir(&self.config().models_dir, step);
        let tmp = target.with_extension("tmp");
        if tmp.exists() {
            fs::remove_dir_all(&tmp)?;
        }
        for (tag, meta, bytes) in &entries {
            write_param(&tmp.join(tag_path(tag)?), meta, bytes)?;
        }
        replace_dir(&tmp, &target)?;
        log::info!("saved {} tags to {}", entries.len(), target.display());
        Ok(Some(target))
    }

    /// Save one tag into `dir`; returns the parameter file's path.
    pub fn save_tag(&self, tag: &str, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let (bytes, meta) = self.get(tag)?;
        let path = write_param(dir.as_ref(), &meta, &bytes)?;
        log::debug!("saved '{}' to {}", tag, path.display());
        Ok(path)
    }

    /// Push every parameter stored under `path`, waiting for propagation.
    ///
    /// Returns the loaded tags with their restored metadata.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<BTreeMap<String, ParamMeta>> {
        let root = path.as_ref();
        let mut files = Vec::new();
        collect_params(root, &mut files)?;

        let mut loaded = BTreeMap::new();
        for file in files {
            let tag = tag_of(root, &file)?;
            let meta: ParamMeta = serde_json::from_str(&fs::read_to_string(meta_path(&file))?)?;
            let bytes = fs::read(&file)?;
            self.push(&tag, bytes, meta.info.clone(), true, Overrides::from_meta(&meta))?;
            loaded.insert(tag, meta);
        }
        log::info!("loaded {} tags from {}", loaded.len(), root.display());
        Ok(loaded)
    }
}

/// Move `staged` to `target`. A previous `target` is set aside and only
/// deleted once the new one is in place.
fn replace_dir(staged: &Path, target: &Path) -> Result<()> {
    let previous = target.with_extension("old");
    if previous.exists() {
        if target.exists() {
            fs::remove_dir_all(&previous)?;
        } else {
            log::warn!("restoring {} left by an interrupted snapshot", previous.display());
            fs::rename(&previous, target)?;
        }
    }
    let replacing = target.exists();
    if replacing {
        fs::rename(target, &previous)?;
    }
    fs::rename(staged, target)?;
    if replacing {
        fs::remove_dir_all(&previous)?;
    }
    Ok(())
}

fn write_param(dir: &Path, meta: &ParamMeta, bytes: &[u8]) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("model-{}.{}", meta.id, PARAM_EXTENSION));
    fs::write(&path, bytes)?;
    fs::write(meta_path(&path), serde_json::to_vec_pretty(meta)?)?;
    Ok(path)
}

fn meta_path(param: &Path) -> PathBuf {
    let mut path = param.as_os_str().to_owned();
    path.push(META_SUFFIX);
    PathBuf::from(path)
}

/// Relative directory for `tag`; rejects tags that would escape the snapshot.
fn tag_path(tag: &str) -> Result<PathBuf> {
    let path = PathBuf::from(tag);
    let valid = !tag.is_empty() && path.components().all(|c| matches!(c, Component::Normal(_)));
    if valid {
        Ok(path)
    } else {
        Err(Error::InvalidConfig(format!("tag '{}' cannot be stored as a path", tag)))
    }
}

fn tag_of(root: &Path, file: &Path) -> Result<String> {
    let dir = file
        .parent()
        .and_then(|p| p.strip_prefix(root).ok())
        .ok_or_else(|| Error::InvalidConfig(format!("{} is outside {}", file.display(), root.display())))?;
    let parts: Vec<String> = dir
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        return Err(Error::InvalidConfig(format!("{} is not inside a tag directory", file.display())));
    }
    Ok(parts.join("/"))
}

fn collect_params(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<_>>()?;
    entries.sort();
    for path in entries {
        if path.is_dir() {
            collect_params(&path, out)?;
        } else if path.extension().map_or(false, |ext| ext == PARAM_EXTENSION) {
            out.push(path);
        }
    }
    Ok(())
}
