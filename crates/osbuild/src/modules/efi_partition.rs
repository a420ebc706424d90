use std::fs::{self, File};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use osbuild_macros::Task;

use crate::error::{Error, ErrorKind, Result};
use crate::executor::ExecCtx;
use crate::layout::{SECTOR_SIZE, sector_bytes};
use crate::modules::{BuildEnv, Module, artifacts, util};
use crate::planner::Plan;

pub const FILE_NAME: &str = "partition.img";

/// Directory UEFI firmware searches for the default boot application.
pub const BOOT_DIR: &str = "EFI/BOOT";

pub const VOLUME_LABEL: [u8; 11] = *b"OSBUILD ESP";
pub const VOLUME_ID: u32 = 0x0EF1_B007;

/// Reserved sectors fatfs lays down for FAT32, plus slack for the root and `EFI` trees.
const FIXED_OVERHEAD_SECTORS: u64 = 32 + 8;

/// A host file and the path it gets inside the filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackagedFile {
    pub source: PathBuf,
    pub dest: String,
}

impl PackagedFile {
    pub fn boot(source: impl Into<PathBuf>, name: &str) -> Self {
        Self {
            source: source.into(),
            dest: format!("{BOOT_DIR}/{name}"),
        }
    }
}

fn packaging(what: impl std::fmt::Display) -> impl FnOnce(io::Error) -> Error {
    move |e| Error::new(ErrorKind::PackagingFailed, format!("{what}: {e}"))
}

/// Upper bound on the space FAT32 metadata takes in a volume of `sectors` sectors, with
/// one sector per cluster.
fn overhead_bytes(sectors: u64, file_count: u64) -> u64 {
    let fat_bytes = sectors.saturating_mul(4);
    let fats = fat_bytes
        .div_ceil(SECTOR_SIZE)
        .saturating_mul(2 * SECTOR_SIZE);
    (FIXED_OVERHEAD_SECTORS + file_count)
        .saturating_mul(SECTOR_SIZE)
        .saturating_add(fats)
}

fn preflight(files: &[PackagedFile], sectors: u64) -> Result<u64> {
    let capacity = sector_bytes(sectors)?;
    let mut payload = 0u64;
    for f in files {
        let meta = fs::metadata(&f.source)
            .map_err(packaging(format!("cannot read {}", f.source.display())))?;
        if !meta.is_file() {
            return Err(Error::new(
                ErrorKind::PackagingFailed,
                format!("{} is not a regular file", f.source.display()),
            ));
        }
        payload = payload.saturating_add(meta.len());
    }
    let needed = payload.saturating_add(overhead_bytes(sectors, files.len() as u64));
    if needed > capacity {
        return Err(Error::new(
            ErrorKind::PackagingFailed,
            format!(
                "{payload} bytes of artifacts need about {needed} bytes, filesystem capacity is {capacity} bytes ({sectors} sectors)"
            ),
        ));
    }
    Ok(payload)
}

fn parent_dirs(dest: &str) -> Vec<String> {
    let parts: Vec<&str> = dest.split('/').filter(|s| !s.is_empty()).collect();
    (1..parts.len()).map(|i| parts[..i].join("/")).collect()
}

fn format_and_fill(file: &mut File, files: &[PackagedFile]) -> Result<()> {
    let opts = fatfs::FormatVolumeOptions::new()
        .fat_type(fatfs::FatType::Fat32)
        .bytes_per_cluster(SECTOR_SIZE as u32)
        .volume_label(VOLUME_LABEL)
        .volume_id(VOLUME_ID);
    fatfs::format_volume(&mut *file, opts).map_err(packaging("FAT32 format failed"))?;
    file.seek(SeekFrom::Start(0))
        .map_err(packaging("seek failed"))?;

    let volume = fatfs::FileSystem::new(&mut *file, fatfs::FsOptions::new())
        .map_err(packaging("cannot open formatted volume"))?;
    {
        let root = volume.root_dir();
        let mut dirs: Vec<String> = parent_dirs(&format!("{BOOT_DIR}/x"));
        for f in files {
            for d in parent_dirs(&f.dest) {
                if !dirs.contains(&d) {
                    dirs.push(d);
                }
            }
        }
        for d in &dirs {
            root.create_dir(d)
                .map_err(packaging(format!("cannot create directory {d}")))?;
        }
        for f in files {
            let mut src = File::open(&f.source)
                .map_err(packaging(format!("cannot open {}", f.source.display())))?;
            let mut dst = root
                .create_file(&f.dest)
                .map_err(packaging(format!("cannot create {}", f.dest)))?;
            dst.truncate()
                .map_err(packaging(format!("cannot truncate {}", f.dest)))?;
            io::copy(&mut src, &mut dst)
                .map_err(packaging(format!("cannot copy {} to {}", f.source.display(), f.dest)))?;
            dst.flush()
                .map_err(packaging(format!("cannot flush {}", f.dest)))?;
        }
    }
    volume.unmount().map_err(packaging("unmount failed"))?;
    Ok(())
}

/// Build a FAT32 image of exactly `sectors` sectors holding `files`, and move it to `out`.
///
/// The image is assembled in a temporary file beside `out`; on any failure nothing is left
/// at `out`.
pub fn pack(files: &[PackagedFile], sectors: u64, out: &Path) -> Result<PathBuf> {
    for f in files {
        if f.dest.trim().is_empty() || f.dest.split('/').any(|s| s == "..") {
            return Err(Error::new(
                ErrorKind::PackagingFailed,
                format!("invalid destination '{}'", f.dest),
            ));
        }
    }
    let payload = preflight(files, sectors)?;
    let image_bytes = sector_bytes(sectors)?;

    let dir = match out.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    util::ensure_dir(&dir)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".partition-")
        .suffix(".img.tmp")
        .tempfile_in(&dir)
        .map_err(packaging(format!("cannot create temp file in {}", dir.display())))?;

    tmp.as_file()
        .set_len(image_bytes)
        .map_err(packaging("cannot size image"))?;
    format_and_fill(tmp.as_file_mut(), files)?;
    tmp.as_file()
        .sync_all()
        .map_err(packaging("sync failed"))?;

    tmp.persist(out)
        .map_err(|e| packaging(format!("cannot move image to {}", out.display()))(e.error))?;
    tracing::info!(
        image = %out.display(),
        files = files.len(),
        payload_bytes = payload,
        "EFI system partition packed"
    );
    Ok(out.to_path_buf())
}

#[Task(id = "efi.partition", phase = "package", default_label = "Pack EFI system partition")]
pub struct EfiPartitionTask;

pub struct EfiPartitionModule;

impl Module for EfiPartitionModule {
    fn id(&self) -> &'static str {
        "efi_partition"
    }

    fn plan(&self, env: &BuildEnv, plan: &mut Plan) -> Result<()> {
        let image = env.image_config()?;
        let files: Vec<PackagedFile> = artifacts::packaged_files(env)?
            .into_iter()
            .map(|(src, name)| PackagedFile::boot(src, &name))
            .collect();

        let mut inputs: Vec<PathBuf> = files.iter().map(|f| f.source.clone()).collect();
        inputs.extend(env.config_inputs());
        let out = env.partition_image();
        let sectors = image.fs_sectors;

        plan.add(EfiPartitionTask::target(
            inputs,
            vec![out.clone()],
            move |ctx: &mut ExecCtx| {
                ctx.log(&format!("packing {} files into {}", files.len(), out.display()));
                pack(&files, sectors, &out).map(|_| ())
            },
        ))
    }
}
