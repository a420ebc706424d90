use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::executor::ExecCtx;

pub type TargetId = String;

/// Produces a target's outputs from its inputs. Called only when the target is stale.
pub type Action = Box<dyn Fn(&mut ExecCtx) -> Result<()>>;

pub struct Target {
    pub id: TargetId,
    pub label: String,
    pub phase: String,
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
    action: Action,
}

impl Target {
    pub fn new<F>(
        id: impl Into<String>,
        label: impl Into<String>,
        phase: impl Into<String>,
        inputs: Vec<PathBuf>,
        outputs: Vec<PathBuf>,
        action: F,
    ) -> Self
    where
        F: Fn(&mut ExecCtx) -> Result<()> + 'static,
    {
        Self {
            id: id.into(),
            label: label.into(),
            phase: phase.into(),
            inputs,
            outputs,
            action: Box::new(action),
        }
    }

    pub fn run(&self, ctx: &mut ExecCtx) -> Result<()> {
        (self.action)(ctx)
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("id", &self.id)
            .field("phase", &self.phase)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

/// The build graph. Edges are implicit: a target depends on whichever target declares
/// one of its inputs as an output.
#[derive(Debug, Default)]
pub struct Plan {
    targets: BTreeMap<TargetId, Target>,
    producers: BTreeMap<PathBuf, TargetId>,
}

impl Plan {
    pub fn add(&mut self, target: Target) -> Result<()> {
        if self.targets.contains_key(&target.id) {
            return Err(Error::config(format!("duplicate target id '{}'", target.id)));
        }
        if target.outputs.is_empty() {
            return Err(Error::config(format!(
                "target '{}' declares no outputs",
                target.id
            )));
        }
        for out in &target.outputs {
            if let Some(existing) = self.producers.get(out) {
                return Err(Error::config(format!(
                    "output '{}' is produced by both '{}' and '{}'",
                    out.display(),
                    existing,
                    target.id
                )));
            }
        }
        for out in &target.outputs {
            self.producers.insert(out.clone(), target.id.clone());
        }
        self.targets.insert(target.id.clone(), target);
        Ok(())
    }

    pub fn producer_of(&self, path: &Path) -> Option<&Target> {
        self.producers
            .get(path)
            .and_then(|id| self.targets.get(id))
    }

    fn deps_of<'a>(&'a self, target: &'a Target) -> BTreeSet<&'a str> {
        target
            .inputs
            .iter()
            .filter_map(|i| self.producers.get(i))
            .map(String::as_str)
            .collect()
    }

    /// Ids of every target needed to produce `requested`.
    pub fn reachable(&self, requested: &[PathBuf]) -> Result<BTreeSet<&str>> {
        let mut seen = BTreeSet::<&str>::new();
        let mut stack = Vec::<&str>::new();
        for out in requested {
            let Some(id) = self.producers.get(out) else {
                return Err(Error::config(format!(
                    "no target produces requested output '{}'",
                    out.display()
                )));
            };
            stack.push(id.as_str());
        }
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(target) = self.targets.get(id) {
                stack.extend(self.deps_of(target));
            }
        }
        Ok(seen)
    }

    /// Topological order of the targets needed for `requested`.
    pub fn ordered_for(&self, requested: &[PathBuf]) -> Result<Vec<&Target>> {
        let wanted = self.reachable(requested)?;
        self.topo(&wanted)
    }

    /// Topological order of the whole graph.
    pub fn ordered(&self) -> Result<Vec<&Target>> {
        let all: BTreeSet<&str> = self.targets.keys().map(String::as_str).collect();
        self.topo(&all)
    }

    fn topo(&self, wanted: &BTreeSet<&str>) -> Result<Vec<&Target>> {
        let mut incoming: BTreeMap<&str, usize> = BTreeMap::new();
        let mut outgoing: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();

        for &id in wanted {
            incoming.entry(id).or_insert(0);
            outgoing.entry(id).or_default();
            let Some(target) = self.targets.get(id) else {
                continue;
            };
            for dep in self.deps_of(target) {
                if !wanted.contains(dep) {
                    continue;
                }
                if outgoing.entry(dep).or_default().insert(id) {
                    *incoming.entry(id).or_insert(0) += 1;
                }
            }
        }

        let mut q: VecDeque<&str> = incoming
            .iter()
            .filter_map(|(k, v)| (*v == 0).then_some(*k))
            .collect();
        let mut out: Vec<&Target> = Vec::with_capacity(wanted.len());

        while let Some(n) = q.pop_front() {
            if let Some(target) = self.targets.get(n) {
                out.push(target);
            }
            if let Some(children) = outgoing.get(n) {
                for &m in children {
                    if let Some(slot) = incoming.get_mut(m) {
                        *slot -= 1;
                        if *slot == 0 {
                            q.push_back(m);
                        }
                    }
                }
            }
        }

        if out.len() != wanted.len() {
            let remaining: Vec<&str> = incoming
                .iter()
                .filter_map(|(k, v)| (*v > 0).then_some(*k))
                .collect();
            return Err(Error::config(format!(
                "target graph contains a cycle; remaining nodes: {}",
                remaining.join(", ")
            )));
        }
        Ok(out)
    }

    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph build {\n  rankdir=LR;\n");
        for target in self.targets.values() {
            out.push_str(&format!(
                "  \"{}\" [label=\"{}\\n{}\"];\n",
                target.id, target.label, target.phase
            ));
        }
        for target in self.targets.values() {
            for dep in self.deps_of(target) {
                out.push_str(&format!("  \"{}\" -> \"{}\";\n", dep, target.id));
            }
        }
        out.push_str("}\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn noop(id: &str, inputs: &[&str], outputs: &[&str]) -> Target {
        Target::new(
            id,
            id,
            "test",
            inputs.iter().map(PathBuf::from).collect(),
            outputs.iter().map(PathBuf::from).collect(),
            |_| Ok(()),
        )
    }

    fn ids(targets: &[&Target]) -> Vec<String> {
        targets.iter().map(|t| t.id.clone()).collect()
    }

    #[test]
    fn orders_by_path_edges() {
        let mut plan = Plan::default();
        plan.add(noop("disk", &["/o/fs.img"], &["/o/disk.img"])).unwrap();
        plan.add(noop("fs", &["/o/boot.efi", "/o/kernel"], &["/o/fs.img"])).unwrap();
        plan.add(noop("kernel", &["/src/k.rs"], &["/o/kernel"])).unwrap();
        plan.add(noop("boot", &["/src/b.rs"], &["/o/boot.efi"])).unwrap();

        let ordered = plan.ordered_for(&[PathBuf::from("/o/disk.img")]).unwrap();
        assert_eq!(ids(&ordered), vec!["boot", "kernel", "fs", "disk"]);
    }

    #[test]
    fn only_reachable_targets_are_ordered() {
        let mut plan = Plan::default();
        plan.add(noop("disk", &["/o/fs.img"], &["/o/disk.img"])).unwrap();
        plan.add(noop("fs", &[], &["/o/fs.img"])).unwrap();
        plan.add(noop("vdi", &["/o/disk.img"], &["/o/disk.vdi"])).unwrap();

        let ordered = plan.ordered_for(&[PathBuf::from("/o/disk.img")]).unwrap();
        assert_eq!(ids(&ordered), vec!["fs", "disk"]);
    }

    #[test]
    fn rejects_duplicate_outputs() {
        let mut plan = Plan::default();
        plan.add(noop("a", &[], &["/o/same"])).unwrap();
        let err = plan.add(noop("b", &[], &["/o/same"])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(err.to_string().contains("'a' and 'b'"), "unexpected err: {err}");
    }

    #[test]
    fn detects_cycles() {
        let mut plan = Plan::default();
        plan.add(noop("a", &["/o/b"], &["/o/a"])).unwrap();
        plan.add(noop("b", &["/o/a"], &["/o/b"])).unwrap();
        let err = plan.ordered().unwrap_err();
        assert!(err.to_string().contains("cycle"), "unexpected err: {err}");
    }

    #[test]
    fn unknown_requested_output_is_an_error() {
        let plan = Plan::default();
        assert!(plan.ordered_for(&[PathBuf::from("/nowhere")]).is_err());
    }

    #[test]
    fn dot_lists_edges() {
        let mut plan = Plan::default();
        plan.add(noop("fs", &[], &["/o/fs.img"])).unwrap();
        plan.add(noop("disk", &["/o/fs.img"], &["/o/disk.img"])).unwrap();
        assert!(plan.to_dot().contains("\"fs\" -> \"disk\";"));
    }
}
