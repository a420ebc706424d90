use std::path::{Path, PathBuf};
use std::process::Command;

use osbuild_macros::Task;
use serde::Deserialize;

use crate::error::{ErrorKind, Result};
use crate::executor::{ExecCtx, require_tool};
use crate::modules::{BuildEnv, Module, util};
use crate::planner::Plan;

pub const FILE_NAME: &str = "image.vdi";

/// The VM definition refers to its disk by this UUID, so every conversion reuses it.
pub const DISK_UUID: &str = "430eee2a-0fdf-4d2a-88f0-5b99ea8cffcb";

fn default_vm_name() -> String {
    "osbuild".into()
}

fn default_vboxmanage() -> String {
    "VBoxManage".into()
}

fn default_uuid() -> String {
    DISK_UUID.into()
}

/// `[vm]`: VirtualBox conversion and launch.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    #[serde(default = "default_vm_name")]
    pub name: String,
    #[serde(default = "default_vboxmanage")]
    pub vboxmanage: String,
    #[serde(default = "default_uuid")]
    pub disk_uuid: String,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            name: default_vm_name(),
            vboxmanage: default_vboxmanage(),
            disk_uuid: default_uuid(),
        }
    }
}

pub fn convert_command(cfg: &VmConfig, raw: &Path, vdi: &Path) -> Command {
    let mut cmd = Command::new(&cfg.vboxmanage);
    cmd.arg("convertfromraw")
        .arg(raw)
        .arg(vdi)
        .args(["--format", "VDI", "--uuid"])
        .arg(&cfg.disk_uuid);
    cmd
}

/// Convert the raw disk at `raw` into a VDI at `vdi`, replacing any previous one.
pub fn convert(cfg: &VmConfig, raw: &Path, vdi: &Path, ctx: &mut ExecCtx) -> Result<PathBuf> {
    require_tool(&cfg.vboxmanage)?;
    util::remove_file_if_exists(vdi)?;
    util::ensure_parent(vdi)?;
    ctx.run_cmd(convert_command(cfg, raw, vdi), ErrorKind::ExternalToolFailed)?;
    Ok(vdi.to_path_buf())
}

/// `VBoxManage startvm <name>`.
pub fn start_vm(cfg: &VmConfig, ctx: &mut ExecCtx) -> Result<()> {
    require_tool(&cfg.vboxmanage)?;
    let mut cmd = Command::new(&cfg.vboxmanage);
    cmd.arg("startvm").arg(&cfg.name);
    ctx.run_cmd(cmd, ErrorKind::ExternalToolFailed)
        .map_err(|e| e.context(format!("starting VM '{}'", cfg.name)))
}

#[Task(id = "vm.vdi", phase = "convert", default_label = "Convert disk image to VDI")]
pub struct VdiTask;

pub struct VdiModule;

impl Module for VdiModule {
    fn id(&self) -> &'static str {
        "vdi"
    }

    fn plan(&self, env: &BuildEnv, plan: &mut Plan) -> Result<()> {
        let cfg: VmConfig = env.doc.section("vm")?;
        let raw = env.disk_image();
        let out = env.vdi_image();
        plan.add(VdiTask::target(
            vec![raw.clone()],
            vec![out.clone()],
            move |ctx: &mut ExecCtx| convert(&cfg, &raw, &out, ctx).map(|_| ()),
        ))
    }
}
