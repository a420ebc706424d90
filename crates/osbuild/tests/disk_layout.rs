use std::fs::{self, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use osbuild::ErrorKind;
use osbuild::executor::{ExecCtx, LogSink};
use osbuild::modules::BuildEnv;
use osbuild::modules::disk_image;
use osbuild::pipeline::{self, Goal};

const SECTOR: usize = 512;
const ESP_TYPE_ON_DISK: [u8; 16] = [
    0x28, 0x73, 0x2A, 0xC1, 0x1F, 0xF8, 0xD2, 0x11, 0xBA, 0x4B, 0x00, 0xA0, 0xC9, 0x3E, 0xC9, 0x3B,
];

fn workspace(extra: &str) -> tempfile::TempDir {
    let tmp = tempfile::tempdir().expect("tempdir");
    for dir in ["bootloader", "kernel"] {
        let src = tmp.path().join(dir).join("src");
        fs::create_dir_all(&src).expect("mkdir src");
        fs::write(src.join("main.rs"), format!("// {dir}\n")).expect("write source");
    }
    let config = format!(
        r#"
[artifacts.bootloader]
sources = ["bootloader"]
command = ["sh", "-c", 'printf "MZ bootloader payload" > "{{out}}"']

[artifacts.kernel]
sources = ["kernel"]
command = ["sh", "-c", 'head -c 300000 /dev/zero > "{{out}}"']
{extra}
"#
    );
    fs::write(tmp.path().join("osbuild.toml"), config).expect("write config");
    tmp
}

fn build_disk(root: &Path) -> osbuild::Result<BuildEnv> {
    let env = pipeline::prepare("debug", None, root)?;
    let mut ctx = ExecCtx::new(false, Arc::new(LogSink::new(env.paths.error_logs_dir())));
    pipeline::build(&env, Goal::Disk, &mut ctx)?;
    Ok(env)
}

fn u32_at(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().expect("4 bytes"))
}

fn u64_at(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().expect("8 bytes"))
}

fn sector(img: &[u8], lba: u64) -> &[u8] {
    let start = lba as usize * SECTOR;
    &img[start..start + SECTOR]
}

fn utf16_name(raw: &[u8]) -> String {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    String::from_utf16(&units).expect("utf16 name")
}

fn artifact(root: &Path, rel: &str) -> Vec<u8> {
    fs::read(root.join("target").join(rel)).expect("read artifact")
}

#[test]
fn disk_image_has_expected_gpt_layout() {
    let ws = workspace("");
    let env = build_disk(ws.path()).expect("build");
    let img = fs::read(env.disk_image()).expect("read image");
    assert_eq!(img.len(), 110_000 * SECTOR);

    let mbr = sector(&img, 0);
    assert_eq!(&mbr[510..512], &[0x55, 0xAA]);
    assert_eq!(mbr[446 + 4], 0xEE);

    let header = sector(&img, 1);
    assert_eq!(&header[0..8], b"EFI PART");
    assert_eq!(u32_at(header, 12), 92);
    assert_eq!(u64_at(header, 24), 1);
    assert_eq!(u64_at(header, 32), 109_999);
    assert_eq!(u64_at(header, 40), 34);
    assert_eq!(u64_at(header, 48), 109_966);
    assert_eq!(u64_at(header, 72), 2);
    assert_eq!(u32_at(header, 80), 128);
    assert_eq!(u32_at(header, 84), 128);

    let entry = &sector(&img, 2)[..128];
    assert_eq!(&entry[0..16], &ESP_TYPE_ON_DISK);
    assert_eq!(u64_at(entry, 32), 2048);
    assert_eq!(u64_at(entry, 40), 104_447);
    assert_eq!(utf16_name(&entry[56..128]), "boot");

    let backup = sector(&img, 109_999);
    assert_eq!(&backup[0..8], b"EFI PART");
    assert_eq!(u64_at(backup, 24), 109_999);
    assert_eq!(u64_at(backup, 32), 1);
    assert_eq!(u64_at(backup, 72), 109_967);
    assert_eq!(&sector(&img, 109_967)[..128], entry);
}

#[test]
fn partition_region_is_the_fat32_image_with_both_binaries() {
    let ws = workspace("");
    let env = build_disk(ws.path()).expect("build");
    let img = fs::read(env.disk_image()).expect("read image");
    let part = fs::read(env.partition_image()).expect("read partition");
    assert_eq!(part.len(), 102_400 * SECTOR);
    let start = 2048 * SECTOR;
    assert!(img[start..start + part.len()] == part[..]);

    let volume = fatfs::FileSystem::new(
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(env.partition_image())
            .expect("open partition"),
        fatfs::FsOptions::new(),
    )
    .expect("mount fat");
    assert_eq!(volume.fat_type(), fatfs::FatType::Fat32);

    let boot_dir = volume.root_dir().open_dir("EFI/BOOT").expect("EFI/BOOT");
    let mut names: Vec<String> = boot_dir
        .iter()
        .map(|e| e.expect("dir entry").file_name())
        .filter(|n| n != "." && n != "..")
        .collect();
    names.sort();
    assert_eq!(names, vec!["BOOTX64.EFI".to_string(), "kernel.sys".to_string()]);

    let read = |name: &str| {
        let mut buf = Vec::new();
        boot_dir
            .open_file(name)
            .expect("open file")
            .read_to_end(&mut buf)
            .expect("read file");
        buf
    };
    assert_eq!(
        read("BOOTX64.EFI"),
        artifact(ws.path(), "x86_64-unknown-uefi/debug/bootloader.efi")
    );
    let kernel = read("kernel.sys");
    assert_eq!(kernel.len(), 300_000);
    assert_eq!(kernel, artifact(ws.path(), "kernel-x86_64/debug/kernel"));
}

#[test]
fn composing_twice_gives_identical_images() {
    let ws = workspace("");
    let env = build_disk(ws.path()).expect("build");
    let geom = env.image_config().expect("image config").geometry().expect("geometry");

    let again: PathBuf = ws.path().join("again.img");
    disk_image::compose(&env.partition_image(), &geom, &again).expect("compose");
    assert_eq!(
        disk_image::sha256_file(&again).expect("hash again"),
        disk_image::sha256_file(&env.disk_image()).expect("hash image")
    );
}

#[test]
fn disk_too_small_for_partition_fails_before_anything_builds() {
    let ws = workspace("[image]\ndisk_sectors = 100000\n");
    let err = build_disk(ws.path()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ImageTooSmall);
    assert_eq!(err.exit_code(), 2);
    assert!(err.to_string().contains("disk_image"), "unexpected err: {err}");
    assert!(err.to_string().contains("disk has 51200000"), "unexpected err: {err}");

    let target = ws.path().join("target");
    assert!(!target.join("kernel-x86_64/debug/kernel").exists());
    assert!(!target.join("image/x86_64/debug/partition.img").exists());
    assert!(!target.exists(), "nothing should be built");
}
