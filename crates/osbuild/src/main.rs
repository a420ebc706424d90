use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use osbuild::Result;
use osbuild::config;
use osbuild::executor::{ExecCtx, LogSink};
use osbuild::launch::{self, DebugConfig, LaunchTarget};
use osbuild::modules::artifacts::{self, Artifact};
use osbuild::modules::vdi::VmConfig;
use osbuild::modules::BuildEnv;
use osbuild::pipeline::{self, Goal};
use osbuild::workspace::{self, CleanScope, WorkspaceConfig};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PlanTarget {
    Disk,
    Vdi,
}

impl From<PlanTarget> for Goal {
    fn from(t: PlanTarget) -> Self {
        match t {
            PlanTarget::Disk => Goal::Disk,
            PlanTarget::Vdi => Goal::Vdi,
        }
    }
}

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Build definition TOML (default: ./osbuild.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build the bootable disk image, rebuilding only what is stale
    Build {
        /// debug | optimized
        #[arg(long, default_value = "debug")]
        variant: String,
        /// Report what would run without running it
        #[arg(long)]
        dry_run: bool,
    },
    /// Build, convert to VDI and start the VirtualBox VM
    Run {
        #[arg(long, default_value = "debug")]
        variant: String,
    },
    /// Build, then start the emulator halted with a debugger attached
    Debug {
        #[arg(long, default_value = "debug")]
        variant: String,
        /// Return once both processes are started instead of waiting for the debugger
        #[arg(long)]
        detach: bool,
    },
    /// Print the target graph and what a build would do
    Plan {
        #[arg(long, default_value = "debug")]
        variant: String,
        /// Print GraphViz dot instead of a linear plan
        #[arg(long, conflicts_with = "json")]
        dot: bool,
        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
        #[arg(long, value_enum, default_value_t = PlanTarget::Disk)]
        target: PlanTarget,
    },
    /// Remove build outputs for every variant
    Clean {
        /// Keep compiled binaries; remove only assembled images
        #[arg(long)]
        images_only: bool,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    dotenv::dotenv().ok();
    init_tracing(args.log_format);

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error ({}): {e}", e.kind().as_str());
            ExitCode::from(e.exit_code())
        }
    }
}

fn run(args: Args) -> Result<()> {
    let cwd = std::env::current_dir()?;
    let cfg_path = args.config.as_deref();
    match args.cmd {
        Command::Build { variant, dry_run } => cmd_build(cfg_path, &cwd, &variant, dry_run),
        Command::Run { variant } => cmd_run(cfg_path, &cwd, &variant),
        Command::Debug { variant, detach } => cmd_debug(cfg_path, &cwd, &variant, detach),
        Command::Plan {
            variant,
            dot,
            json,
            target,
        } => cmd_plan(cfg_path, &cwd, &variant, dot, json, target.into()),
        Command::Clean { images_only } => cmd_clean(cfg_path, &cwd, images_only),
    }
}

fn exec_ctx(env: &BuildEnv, dry_run: bool) -> ExecCtx {
    let sink = Arc::new(LogSink::new(env.paths.error_logs_dir()));
    ExecCtx::new(dry_run, sink)
}

fn cmd_build(cfg_path: Option<&Path>, cwd: &Path, selector: &str, dry_run: bool) -> Result<()> {
    let env = pipeline::prepare(selector, cfg_path, cwd)?;
    let mut ctx = exec_ctx(&env, dry_run);
    let rebuilt = pipeline::build(&env, Goal::Disk, &mut ctx)?;
    if dry_run {
        for id in &rebuilt {
            println!("would run: {id}");
        }
        return Ok(());
    }
    println!("{}", env.disk_image().display());
    Ok(())
}

fn cmd_run(cfg_path: Option<&Path>, cwd: &Path, selector: &str) -> Result<()> {
    let env = pipeline::prepare(selector, cfg_path, cwd)?;
    let vm: VmConfig = env.doc.section("vm")?;
    let mut ctx = exec_ctx(&env, false);
    pipeline::build(&env, Goal::Vdi, &mut ctx)?;
    osbuild::modules::vdi::start_vm(&vm, &mut ctx)
}

fn cmd_debug(cfg_path: Option<&Path>, cwd: &Path, selector: &str, detach: bool) -> Result<()> {
    let env = pipeline::prepare(selector, cfg_path, cwd)?;
    let dbg = DebugConfig::load(&env.doc)?;
    let firmware_dir = launch::firmware_dir(&dbg, std::env::var(launch::FIRMWARE_ENV).ok())?;

    let mut ctx = exec_ctx(&env, false);
    pipeline::build(&env, Goal::Disk, &mut ctx)?;

    let kernel = artifacts::locate(&env, Artifact::KernelBinary)?;
    let raw = env.disk_image();
    let work_dir = env.image_dir().join("debug");
    let mut session = launch::debug_launch(
        &dbg,
        &LaunchTarget {
            raw_image: &raw,
            kernel: &kernel,
            arch: &env.paths.arch,
            firmware_dir: &firmware_dir,
            work_dir: &work_dir,
        },
    )?;

    if detach {
        println!(
            "emulator pid {} (gdb stub on :{}), debugger pid {}",
            session.emulator.id(),
            session.port,
            session.debugger.id()
        );
        return Ok(());
    }

    let status = session.debugger.wait()?;
    tracing::info!(%status, "debugger exited; stopping emulator");
    let _ = session.emulator.kill();
    let _ = session.emulator.wait();
    Ok(())
}

fn cmd_plan(
    cfg_path: Option<&Path>,
    cwd: &Path,
    selector: &str,
    dot: bool,
    json: bool,
    goal: Goal,
) -> Result<()> {
    let env = pipeline::prepare(selector, cfg_path, cwd)?;
    if dot {
        let plan = osbuild::modules::plan_for(&env)?;
        plan.ordered()?;
        print!("{}", plan.to_dot());
        return Ok(());
    }

    let entries = pipeline::preview(&env, goal)?;
    if json {
        let s = serde_json::to_string_pretty(&entries)
            .map_err(|e| osbuild::Error::msg(format!("json encode error: {e}")))?;
        println!("{s}");
        return Ok(());
    }

    for (i, e) in entries.iter().enumerate() {
        println!(
            "{:>2}. {:<18} {:<9} {:<6} {}",
            i + 1,
            e.id,
            e.phase,
            if e.stale { "run" } else { "skip" },
            e.reason
        );
    }
    Ok(())
}

fn cmd_clean(cfg_path: Option<&Path>, cwd: &Path, images_only: bool) -> Result<()> {
    let doc = config::load_or_default(cfg_path, cwd)?;
    let ws: WorkspaceConfig = doc.section("workspace")?;
    let paths = workspace::load_paths(&ws, cwd)?;
    let scope = if images_only {
        CleanScope::Images
    } else {
        CleanScope::All
    };
    let removed = workspace::clean(&paths, scope)?;
    if removed.is_empty() {
        println!("nothing to clean");
    }
    for dir in removed {
        println!("removed {}", dir.display());
    }
    Ok(())
}
