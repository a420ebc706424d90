use std::fs::{self, File};
use std::io::{self, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use osbuild_macros::Task;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::layout::{self, DiskGeometry};
use crate::modules::{BuildEnv, Module, util};
use crate::planner::Plan;

pub const FILE_NAME: &str = "image.img";

fn io_err(what: impl std::fmt::Display) -> impl FnOnce(io::Error) -> Error {
    move |e| Error::msg(format!("{what}: {e}"))
}

/// Hex SHA-256 of the file at `path`.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut f = File::open(path).map_err(io_err(format!("cannot open {}", path.display())))?;
    let mut hasher = Sha256::new();
    io::copy(&mut f, &mut hasher).map_err(io_err(format!("cannot read {}", path.display())))?;
    Ok(hex::encode(hasher.finalize()))
}

/// Lay out `geom` in a fresh raw image at `out` and copy the filesystem image into the
/// partition. The geometry is checked against the filesystem image before anything is
/// written.
pub fn compose(partition_image: &Path, geom: &DiskGeometry, out: &Path) -> Result<PathBuf> {
    let fs_len = fs::metadata(partition_image)
        .map_err(io_err(format!("cannot read {}", partition_image.display())))?
        .len();
    geom.validate(fs_len)?;

    let dir = match out.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    util::ensure_dir(&dir)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".image-")
        .suffix(".img.tmp")
        .tempfile_in(&dir)
        .map_err(io_err(format!("cannot create temp file in {}", dir.display())))?;

    let disk = tmp.as_file_mut();
    disk.set_len(geom.total_bytes())
        .map_err(io_err("cannot size disk image"))?;
    layout::write_tables(disk, geom)?;

    disk.seek(SeekFrom::Start(geom.partition_offset()))?;
    let mut src = File::open(partition_image)
        .map_err(io_err(format!("cannot open {}", partition_image.display())))?;
    let copied = io::copy(&mut src, disk).map_err(io_err("cannot copy filesystem image"))?;
    if copied != fs_len {
        return Err(Error::msg(format!(
            "copied {copied} of {fs_len} bytes from {}",
            partition_image.display()
        )));
    }
    disk.sync_all().map_err(io_err("sync failed"))?;

    tmp.persist(out)
        .map_err(|e| io_err(format!("cannot move image to {}", out.display()))(e.error))?;

    let digest = sha256_file(out)?;
    tracing::info!(
        image = %out.display(),
        bytes = geom.total_bytes(),
        partition_start = geom.partition_start,
        partition_end = geom.partition_end(),
        sha256 = %digest,
        "disk image composed"
    );
    Ok(out.to_path_buf())
}

#[Task(id = "disk.image", phase = "compose", default_label = "Compose GPT disk image")]
pub struct DiskImageTask;

pub struct DiskImageModule;

impl Module for DiskImageModule {
    fn id(&self) -> &'static str {
        "disk_image"
    }

    fn plan(&self, env: &BuildEnv, plan: &mut Plan) -> Result<()> {
        let geom = env.image_config()?.geometry()?;
        // The packed filesystem is always `fs_sectors` long, so a layout that cannot hold
        // it is rejected here, before anything compiles.
        geom.validate(geom.partition_bytes())?;
        let partition = env.partition_image();
        let out = env.disk_image();

        let mut inputs = vec![partition.clone()];
        inputs.extend(env.config_inputs());

        plan.add(DiskImageTask::target(
            inputs,
            vec![out.clone()],
            move |ctx: &mut ExecCtx| {
                ctx.log(&format!(
                    "composing {} ({} sectors, ESP at LBA {}..={})",
                    out.display(),
                    geom.total_sectors,
                    geom.partition_start,
                    geom.partition_end()
                ));
                compose(&partition, &geom, &out).map(|_| ())
            },
        ))
    }
}
