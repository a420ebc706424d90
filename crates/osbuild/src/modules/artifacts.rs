use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use filetime::FileTime;
use osbuild_macros::Task;
use serde::Deserialize;

use crate::error::{Error, ErrorKind, Result};
use crate::executor::{self, ExecCtx};
use crate::modules::{BuildEnv, Module, util};
use crate::planner::Plan;
use crate::variant::BuildVariant;
use crate::workspace::WorkspacePaths;

/// The two externally compiled binaries the image is made of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Artifact {
    BootloaderBinary,
    KernelBinary,
}

impl Artifact {
    pub const ALL: [Artifact; 2] = [Artifact::BootloaderBinary, Artifact::KernelBinary];

    pub fn name(self) -> &'static str {
        match self {
            Artifact::BootloaderBinary => "bootloader",
            Artifact::KernelBinary => "kernel",
        }
    }

    fn config_path(self) -> String {
        format!("artifacts.{}", self.name())
    }

    fn default_cargo_target(self) -> &'static str {
        match self {
            Artifact::BootloaderBinary => "{arch}-unknown-uefi",
            Artifact::KernelBinary => "kernel-{arch}.json",
        }
    }

    fn default_output(self) -> &'static str {
        match self {
            Artifact::BootloaderBinary => "{arch}-unknown-uefi/{tag}/bootloader.efi",
            Artifact::KernelBinary => "kernel-{arch}/{tag}/kernel",
        }
    }

    /// Name the binary gets inside `EFI/BOOT`.
    fn default_install_name(self) -> &'static str {
        match self {
            Artifact::BootloaderBinary => "BOOTX64.EFI",
            Artifact::KernelBinary => "kernel.sys",
        }
    }

    fn default_sources(self) -> Vec<String> {
        let mut out = vec![
            self.name().to_string(),
            "Cargo.toml".to_string(),
            "Cargo.lock".to_string(),
        ];
        if self == Artifact::KernelBinary {
            out.push("kernel-{arch}.json".to_string());
        }
        out
    }
}

/// `[artifacts.bootloader]` / `[artifacts.kernel]`. Unset fields take the per-artifact
/// defaults.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ArtifactConfig {
    pub package: Option<String>,
    /// `--target` value for cargo; a `.json` value is a target spec file under the root.
    pub target: Option<String>,
    /// Output path template relative to the target dir.
    pub output: Option<String>,
    pub install_as: Option<String>,
    /// Files or directories whose changes make the binary stale, relative to the root.
    pub sources: Option<Vec<String>>,
    /// Replaces the cargo invocation when non-empty.
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// An artifact's configuration resolved against the workspace and variant.
#[derive(Debug, Clone)]
pub struct ArtifactSpec {
    pub artifact: Artifact,
    pub variant: BuildVariant,
    pub root: PathBuf,
    pub target_dir: PathBuf,
    pub arch: String,
    pub package: String,
    pub cargo_target: String,
    pub output: PathBuf,
    pub install_as: String,
    pub sources: Vec<PathBuf>,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl ArtifactSpec {
    pub fn resolve(
        artifact: Artifact,
        cfg: &ArtifactConfig,
        paths: &WorkspacePaths,
        variant: BuildVariant,
    ) -> Result<Self> {
        let vars = [("arch", paths.arch.as_str()), ("tag", variant.tag())];
        let expand = |raw: &str| util::expand_template(raw, &vars);

        let package = cfg
            .package
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(artifact.name())
            .to_string();
        let cargo_target = expand(
            cfg.target
                .as_deref()
                .unwrap_or(artifact.default_cargo_target()),
        );
        let output = paths.resolve_under_target(&expand(
            cfg.output.as_deref().unwrap_or(artifact.default_output()),
        ))?;
        let install_as = cfg
            .install_as
            .clone()
            .unwrap_or_else(|| artifact.default_install_name().to_string());
        if install_as.trim().is_empty() || install_as.contains('/') {
            return Err(Error::config(format!(
                "[{}].install_as must be a plain file name, got '{}'",
                artifact.config_path(),
                install_as
            )));
        }

        let mut roots = Vec::new();
        for raw in cfg.sources.clone().unwrap_or_else(|| artifact.default_sources()) {
            roots.push(paths.resolve_under_root(&expand(&raw))?);
        }
        let sources = util::collect_files(&roots, &["target"], &paths.target_dir)?;

        Ok(Self {
            artifact,
            variant,
            root: paths.root.clone(),
            target_dir: paths.target_dir.clone(),
            arch: paths.arch.clone(),
            package,
            cargo_target,
            output,
            install_as,
            sources,
            command: cfg.command.clone(),
            env: cfg.env.clone(),
        })
    }

    pub fn load(env: &BuildEnv, artifact: Artifact) -> Result<Self> {
        let cfg: ArtifactConfig = env.doc.section(&artifact.config_path())?;
        Self::resolve(artifact, &cfg, &env.paths, env.variant)
    }

    /// The invocation that produces [`Self::output`].
    pub fn command(&self) -> Result<Command> {
        if !self.command.is_empty() {
            let out = self.output.display().to_string();
            let root = self.root.display().to_string();
            let vars = [
                ("arch", self.arch.as_str()),
                ("tag", self.variant.tag()),
                ("out", out.as_str()),
                ("root", root.as_str()),
            ];
            let argv: Vec<String> = self
                .command
                .iter()
                .map(|a| util::expand_template(a, &vars))
                .collect();
            let mut cmd = Command::new(&argv[0]);
            cmd.args(&argv[1..]);
            cmd.current_dir(&self.root);
            cmd.env("OSBUILD_VARIANT", self.variant.selector());
            cmd.envs(&self.env);
            return Ok(cmd);
        }

        if is_json_target(&self.cargo_target) && !self.root.join(&self.cargo_target).is_file() {
            return Err(Error::config(format!(
                "target spec {} not found under {}",
                self.cargo_target,
                self.root.display()
            )));
        }
        let cargo = std::env::var("CARGO").unwrap_or_else(|_| "cargo".into());
        let mut cmd = Command::new(cargo);
        cmd.current_dir(&self.root)
            .arg("build")
            .arg("-p")
            .arg(&self.package)
            .arg("-Zbuild-std=core,compiler_builtins")
            .arg("-Zbuild-std-features=compiler-builtins-mem")
            .arg(format!("--target={}", self.cargo_target))
            .arg("--target-dir")
            .arg(&self.target_dir)
            .args(self.variant.cargo_flags())
            .env("OSBUILD_VARIANT", self.variant.selector())
            .envs(&self.env);
        Ok(cmd)
    }
}

/// Where `artifact` lands for `env.variant`.
pub fn locate(env: &BuildEnv, artifact: Artifact) -> Result<PathBuf> {
    let cfg: ArtifactConfig = env.doc.section(&artifact.config_path())?;
    let vars = [("arch", env.paths.arch.as_str()), ("tag", env.variant.tag())];
    env.paths.resolve_under_target(&util::expand_template(
        cfg.output.as_deref().unwrap_or(artifact.default_output()),
        &vars,
    ))
}

/// Run the external build for `spec` and confirm the binary is where it should be.
///
/// A compiler that finds nothing to do leaves the binary untouched even when a file it
/// ignores changed under the sources; such a binary is stamped with the newest source time.
pub fn ensure_built(spec: &ArtifactSpec, ctx: &mut ExecCtx) -> Result<()> {
    util::ensure_parent(&spec.output)?;
    ctx.run_cmd(spec.command()?, ErrorKind::ExternalBuildFailed)?;

    if !spec.output.is_file() {
        return Err(Error::new(
            ErrorKind::ExternalBuildFailed,
            format!(
                "{} build finished but {} does not exist",
                spec.artifact.name(),
                spec.output.display()
            ),
        ));
    }
    let mut newest_source: Option<FileTime> = None;
    for src in &spec.sources {
        if let Some(t) = executor::mtime(src)? {
            newest_source = newest_source.max(Some(t));
        }
    }
    if let (Some(src_t), Some(out_t)) = (newest_source, executor::mtime(&spec.output)?)
        && out_t < src_t
    {
        filetime::set_file_mtime(&spec.output, src_t).map_err(|e| {
            Error::msg(format!("failed to update mtime of {}: {e}", spec.output.display()))
        })?;
    }
    ctx.log(&format!(
        "{} ({}) -> {}",
        spec.artifact.name(),
        spec.variant,
        spec.output.display()
    ));
    Ok(())
}

#[Task(id = "bootloader.build", phase = "compile", default_label = "Build UEFI bootloader")]
pub struct BootloaderBuildTask;

#[Task(id = "kernel.build", phase = "compile", default_label = "Build kernel")]
pub struct KernelBuildTask;

pub struct ArtifactsModule;

impl Module for ArtifactsModule {
    fn id(&self) -> &'static str {
        "artifacts"
    }

    fn plan(&self, env: &BuildEnv, plan: &mut Plan) -> Result<()> {
        for artifact in Artifact::ALL {
            let spec = ArtifactSpec::load(env, artifact)?;
            let inputs = spec.sources.clone();
            let outputs = vec![spec.output.clone()];
            let action = move |ctx: &mut ExecCtx| ensure_built(&spec, ctx);
            let target = match artifact {
                Artifact::BootloaderBinary => BootloaderBuildTask::target(inputs, outputs, action),
                Artifact::KernelBinary => KernelBuildTask::target(inputs, outputs, action),
            };
            plan.add(target)?;
        }
        Ok(())
    }
}

/// The binaries to place on the ESP, in packing order.
pub fn packaged_files(env: &BuildEnv) -> Result<Vec<(PathBuf, String)>> {
    let mut out = Vec::new();
    for artifact in Artifact::ALL {
        let spec = ArtifactSpec::load(env, artifact)?;
        out.push((spec.output, spec.install_as));
    }
    Ok(out)
}

pub fn is_json_target(target: &str) -> bool {
    Path::new(target)
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("json"))
}
