use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::config::ConfigDoc;
use crate::error::Result;
use crate::layout::{self, DiskGeometry, PartitionFlags};
use crate::planner::Plan;
use crate::variant::BuildVariant;
use crate::workspace::{self, WorkspaceConfig, WorkspacePaths};

pub mod artifacts;
pub mod disk_image;
pub mod efi_partition;
pub mod util;
pub mod vdi;

/// Everything a module needs to lay out its targets for one invocation.
#[derive(Debug, Clone)]
pub struct BuildEnv {
    pub variant: BuildVariant,
    pub paths: WorkspacePaths,
    pub doc: ConfigDoc,
}

impl BuildEnv {
    pub fn load(doc: ConfigDoc, variant: BuildVariant, cwd: &Path) -> Result<Self> {
        let ws: WorkspaceConfig = doc.section("workspace")?;
        let paths = workspace::load_paths(&ws, cwd)?;
        Ok(Self {
            variant,
            paths,
            doc,
        })
    }

    pub fn image_dir(&self) -> PathBuf {
        self.paths.image_dir(self.variant)
    }

    /// Every config file behind `doc`, so image stages rebuild on geometry edits wherever
    /// they were made.
    pub fn config_inputs(&self) -> Vec<PathBuf> {
        self.doc
            .sources
            .iter()
            .filter(|p| p.is_file())
            .cloned()
            .collect()
    }

    pub fn image_config(&self) -> Result<ImageConfig> {
        self.doc.section("image")
    }

    pub fn partition_image(&self) -> PathBuf {
        self.image_dir().join(efi_partition::FILE_NAME)
    }

    pub fn disk_image(&self) -> PathBuf {
        self.image_dir().join(disk_image::FILE_NAME)
    }

    pub fn vdi_image(&self) -> PathBuf {
        self.image_dir().join(vdi::FILE_NAME)
    }
}

fn default_fs_sectors() -> u64 {
    102_400
}

fn default_disk_sectors() -> u64 {
    110_000
}

fn default_partition_start() -> u64 {
    2048
}

fn default_partition_name() -> String {
    "boot".into()
}

fn default_guid_seed() -> String {
    "osbuild".into()
}

/// `[image]`: filesystem capacity and disk layout.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    #[serde(default = "default_fs_sectors")]
    pub fs_sectors: u64,
    #[serde(default = "default_disk_sectors")]
    pub disk_sectors: u64,
    #[serde(default = "default_partition_start")]
    pub partition_start: u64,
    #[serde(default = "default_partition_name")]
    pub partition_name: String,
    pub legacy_bios_bootable: bool,
    pub disk_guid: Option<String>,
    pub partition_guid: Option<String>,
    #[serde(default = "default_guid_seed")]
    pub guid_seed: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            fs_sectors: default_fs_sectors(),
            disk_sectors: default_disk_sectors(),
            partition_start: default_partition_start(),
            partition_name: default_partition_name(),
            legacy_bios_bootable: false,
            disk_guid: None,
            partition_guid: None,
            guid_seed: default_guid_seed(),
        }
    }
}

impl ImageConfig {
    /// The partition spans exactly the filesystem image.
    pub fn geometry(&self) -> Result<DiskGeometry> {
        let disk_guid = match self.disk_guid.as_deref() {
            Some(s) => layout::parse_guid(s)?,
            None => layout::derive_guid(&format!("{}:disk", self.guid_seed)),
        };
        let partition_guid = match self.partition_guid.as_deref() {
            Some(s) => layout::parse_guid(s)?,
            None => layout::derive_guid(&format!(
                "{}:partition:{}",
                self.guid_seed, self.partition_name
            )),
        };
        Ok(DiskGeometry {
            total_sectors: self.disk_sectors,
            partition_start: self.partition_start,
            partition_sectors: self.fs_sectors,
            partition_flags: PartitionFlags {
                required: false,
                legacy_bios_bootable: self.legacy_bios_bootable,
            },
            partition_name: self.partition_name.clone(),
            disk_guid,
            partition_guid,
        })
    }
}

pub trait Module {
    fn id(&self) -> &'static str;
    fn plan(&self, env: &BuildEnv, plan: &mut Plan) -> Result<()>;
}

pub fn builtin_modules() -> Vec<Box<dyn Module>> {
    vec![
        Box::new(artifacts::ArtifactsModule),
        Box::new(efi_partition::EfiPartitionModule),
        Box::new(disk_image::DiskImageModule),
        Box::new(vdi::VdiModule),
    ]
}

/// The full target graph for `env.variant`.
pub fn plan_for(env: &BuildEnv) -> Result<Plan> {
    let mut plan = Plan::default();
    for m in builtin_modules() {
        m.plan(env, &mut plan)
            .map_err(|e| e.context(format!("module '{}'", m.id())))?;
    }
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_geometry_matches_reference_layout() {
        let g = ImageConfig::default().geometry().unwrap();
        assert_eq!(g.total_bytes(), 56_320_000);
        assert_eq!(g.partition_start, 2048);
        assert_eq!(g.partition_end(), 104_447);
        assert_eq!(g.partition_bytes(), 52_428_800);
        assert_eq!(g.partition_flags.bits(), 0);
        assert_eq!(g, ImageConfig::default().geometry().unwrap());
    }

    #[test]
    fn explicit_guids_override_derived_ones() {
        let cfg = ImageConfig {
            disk_guid: Some("11111111-2222-3333-4444-555555555555".into()),
            ..ImageConfig::default()
        };
        let g = cfg.geometry().unwrap();
        assert_eq!(g.disk_guid.to_string(), "11111111-2222-3333-4444-555555555555");
        assert!(
            ImageConfig {
                partition_guid: Some("bogus".into()),
                ..ImageConfig::default()
            }
            .geometry()
            .is_err()
        );
    }
}
