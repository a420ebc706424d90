use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, mpsc};

use serde::Serialize;

use crate::config;
use crate::error::Result;
use crate::executor::{self, ChannelSink, ExecCtx, ExecEvent};
use crate::modules::{self, BuildEnv};
use crate::planner::TargetId;
use crate::variant;

/// How far down the pipeline to go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Goal {
    /// Raw GPT disk image.
    Disk,
    /// VirtualBox disk converted from the raw image.
    Vdi,
}

impl Goal {
    pub fn outputs(self, env: &BuildEnv) -> Vec<PathBuf> {
        match self {
            Goal::Disk => vec![env.disk_image()],
            Goal::Vdi => vec![env.vdi_image()],
        }
    }
}

/// Resolve `selector` before touching the filesystem, then load the build definition
/// (`config`, or `osbuild.toml` under `cwd`) and set up the build environment.
pub fn prepare(selector: &str, config: Option<&Path>, cwd: &Path) -> Result<BuildEnv> {
    let variant = variant::resolve(selector)?;
    let doc = config::load_or_default(config, cwd)?;
    BuildEnv::load(doc, variant, cwd)
}

/// Bring `goal` up to date for `env.variant`. Returns the targets that ran.
pub fn build(env: &BuildEnv, goal: Goal, ctx: &mut ExecCtx) -> Result<BTreeSet<TargetId>> {
    let plan = modules::plan_for(env)?;
    tracing::debug!(variant = %env.variant, image_dir = %env.image_dir().display(), "plan ready");
    executor::build(&plan, &goal.outputs(env), ctx)
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanEntry {
    pub id: String,
    pub label: String,
    pub phase: String,
    pub stale: bool,
    pub reason: String,
    pub outputs: Vec<PathBuf>,
}

/// Ordered targets for `goal` with what a build would do to each.
pub fn preview(env: &BuildEnv, goal: Goal) -> Result<Vec<PlanEntry>> {
    let plan = modules::plan_for(env)?;
    let requested = goal.outputs(env);

    let (tx, rx) = mpsc::channel();
    let mut ctx = ExecCtx::new(true, Arc::new(ChannelSink::new(tx)));
    executor::build(&plan, &requested, &mut ctx)?;
    drop(ctx);

    let mut reasons = BTreeMap::<String, String>::new();
    for ev in rx {
        if let ExecEvent::TargetStarted { id, reason, .. } = ev {
            reasons.insert(id, reason);
        }
    }

    Ok(plan
        .ordered_for(&requested)?
        .into_iter()
        .map(|t| PlanEntry {
            id: t.id.clone(),
            label: t.label.clone(),
            phase: t.phase.clone(),
            stale: reasons.contains_key(&t.id),
            reason: reasons
                .get(&t.id)
                .cloned()
                .unwrap_or_else(|| "up to date".into()),
            outputs: t.outputs.clone(),
        })
        .collect())
}
