use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Instant;

use filetime::FileTime;

use crate::error::{Error, ErrorKind, Result};
use crate::planner::{Plan, Target, TargetId};

#[derive(Debug, Clone)]
pub enum ExecEvent {
    TargetStarted {
        id: String,
        label: String,
        reason: String,
    },
    TargetSkipped {
        id: String,
    },
    TargetLog {
        id: String,
        line: String,
    },
    TargetFinished {
        id: String,
        ok: bool,
        error: Option<String>,
        elapsed_ms: u128,
    },
    ExecutorDone {
        ok: bool,
        error: Option<String>,
        rebuilt: Vec<String>,
    },
}

pub trait ExecSink: Send + Sync {
    fn emit(&self, ev: ExecEvent);
}

/// CLI sink: forwards events to `tracing` and writes a log file for each failed target.
pub struct LogSink {
    error_logs_root: PathBuf,
    state: Mutex<LogSinkState>,
}

#[derive(Default)]
struct LogSinkState {
    started_at: Option<Instant>,
    targets_run: usize,
    targets_skipped: usize,
    target_logs: BTreeMap<String, VecDeque<String>>,
    error_logs_dir: Option<PathBuf>,
}

impl LogSink {
    pub fn new(error_logs_root: impl Into<PathBuf>) -> Self {
        Self {
            error_logs_root: error_logs_root.into(),
            state: Mutex::new(LogSinkState::default()),
        }
    }

    fn write_error_log(
        &self,
        state: &mut LogSinkState,
        id: &str,
        error: Option<&str>,
        elapsed_ms: u128,
    ) -> Result<PathBuf> {
        let dir = match state.error_logs_dir.as_ref() {
            Some(d) => d.clone(),
            None => {
                let d = self
                    .error_logs_root
                    .join(chrono::Local::now().format("%Y%m%d-%H%M%S").to_string());
                fs::create_dir_all(&d).map_err(|e| {
                    Error::msg(format!("failed to create error logs dir {}: {e}", d.display()))
                })?;
                state.error_logs_dir = Some(d.clone());
                d
            }
        };
        let path = dir.join(format!("{}.log", sanitize_filename_component(id)));

        let mut body = String::new();
        body.push_str(&format!("target: {id}\n"));
        body.push_str("status: failed\n");
        body.push_str(&format!("elapsed_ms: {elapsed_ms}\n"));
        if let Some(e) = error.filter(|e| !e.trim().is_empty()) {
            body.push_str(&format!("error: {e}\n"));
        }
        body.push_str("\nlogs:\n");
        if let Some(lines) = state.target_logs.get(id) {
            for line in lines {
                body.push_str(line);
                body.push('\n');
            }
        }
        fs::write(&path, body).map_err(|e| {
            Error::msg(format!("failed to write error log {}: {e}", path.display()))
        })?;
        Ok(path)
    }
}

impl ExecSink for LogSink {
    fn emit(&self, ev: ExecEvent) {
        let Ok(mut s) = self.state.lock() else {
            return;
        };
        match ev {
            ExecEvent::TargetStarted { id, label, reason } => {
                s.targets_run += 1;
                s.started_at.get_or_insert_with(Instant::now);
                tracing::info!(target_id = %id, %reason, "{label}");
            }
            ExecEvent::TargetSkipped { id } => {
                s.targets_skipped += 1;
                tracing::info!(target_id = %id, "up to date");
            }
            ExecEvent::TargetLog { id, line } => {
                const MAX_LINES: usize = 4000;
                tracing::debug!(target_id = %id, "{line}");
                let q = s.target_logs.entry(id).or_default();
                while q.len() >= MAX_LINES {
                    q.pop_front();
                }
                q.push_back(line);
            }
            ExecEvent::TargetFinished {
                id,
                ok,
                error,
                elapsed_ms,
            } => {
                if ok {
                    s.target_logs.remove(&id);
                    tracing::info!(target_id = %id, elapsed_ms = elapsed_ms as u64, "done");
                    return;
                }
                let err_text = error.clone().unwrap_or_default();
                tracing::error!(target_id = %id, elapsed_ms = elapsed_ms as u64, "failed: {err_text}");
                match self.write_error_log(&mut s, &id, error.as_deref(), elapsed_ms) {
                    Ok(path) => tracing::error!(target_id = %id, "error log: {}", path.display()),
                    Err(e) => tracing::warn!(target_id = %id, "could not write error log: {e}"),
                }
            }
            ExecEvent::ExecutorDone { ok, error, rebuilt } => {
                let wall_ms = s
                    .started_at
                    .map(|t| t.elapsed().as_millis() as u64)
                    .unwrap_or_default();
                if ok {
                    tracing::info!(
                        run = s.targets_run,
                        skipped = s.targets_skipped,
                        wall_ms,
                        "build finished; rebuilt: [{}]",
                        rebuilt.join(", ")
                    );
                } else {
                    tracing::error!(
                        run = s.targets_run,
                        skipped = s.targets_skipped,
                        wall_ms,
                        "build failed: {}",
                        error.unwrap_or_default()
                    );
                }
                let logs_root = s.error_logs_dir.take();
                *s = LogSinkState {
                    error_logs_dir: logs_root,
                    ..LogSinkState::default()
                };
            }
        }
    }
}

#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<ExecEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<ExecEvent>) -> Self {
        Self { tx }
    }
}

impl ExecSink for ChannelSink {
    fn emit(&self, ev: ExecEvent) {
        let _ = self.tx.send(ev);
    }
}

#[derive(Clone)]
pub struct ExecCtx {
    pub dry_run: bool,
    pub sink: Arc<dyn ExecSink>,
    pub current_target: Option<String>,
}

impl ExecCtx {
    pub fn new(dry_run: bool, sink: Arc<dyn ExecSink>) -> Self {
        Self {
            dry_run,
            sink,
            current_target: None,
        }
    }

    pub fn set_target(&mut self, id: impl Into<String>) {
        self.current_target = Some(id.into());
    }

    pub fn log(&self, msg: &str) {
        let id = self
            .current_target
            .clone()
            .unwrap_or_else(|| "<none>".into());
        self.sink.emit(ExecEvent::TargetLog {
            id,
            line: msg.to_string(),
        });
    }

    /// Run `cmd` to completion, streaming its output into the sink line by line.
    ///
    /// A non-zero exit becomes an error of kind `fail_kind` whose message carries the
    /// command's combined output unmodified. A program that cannot be found is
    /// `ToolNotFound`.
    pub fn run_cmd(&self, mut cmd: Command, fail_kind: ErrorKind) -> Result<()> {
        let program = cmd.get_program().to_string_lossy().into_owned();
        self.log(&format!("$ {:?}", cmd));

        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(&program, e))?;

        let (tx, rx) = mpsc::channel::<String>();
        if let Some(out) = child.stdout.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(out, tx));
        }
        if let Some(err) = child.stderr.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(err, tx));
        }
        drop(tx);

        let mut captured = Vec::<String>::new();
        for line in rx {
            self.log(&line);
            captured.push(line);
        }

        let status = child
            .wait()
            .map_err(|e| Error::msg(format!("wait for {program} failed: {e}")))?;
        if !status.success() {
            let mut msg = format!("{program} exited with {status}");
            if !captured.is_empty() {
                msg.push('\n');
                msg.push_str(&captured.join("\n"));
            }
            return Err(Error::new(fail_kind, msg));
        }
        Ok(())
    }
}

/// Map a spawn failure to `ToolNotFound` or `ExternalToolFailed`.
pub fn spawn_error(program: &str, err: io::Error) -> Error {
    if err.kind() == io::ErrorKind::NotFound {
        Error::new(
            ErrorKind::ToolNotFound,
            format!("'{program}' not found; is it installed and on PATH?"),
        )
    } else {
        Error::new(
            ErrorKind::ExternalToolFailed,
            format!("failed to start '{program}': {err}"),
        )
    }
}

/// Resolve `program` on `PATH`, or fail with `ToolNotFound`.
pub fn require_tool(program: &str) -> Result<PathBuf> {
    which::which(program).map_err(|e| {
        Error::new(
            ErrorKind::ToolNotFound,
            format!("'{program}' not found on PATH ({e})"),
        )
    })
}

/// Start the child in its own process group so terminal signals aimed at a
/// foreground debugger do not reach it.
pub fn detach_process_group(cmd: &mut Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            cmd.pre_exec(|| {
                if libc::setpgid(0, 0) != 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }
    #[cfg(not(unix))]
    {
        let _ = cmd;
    }
}

/// Modification time, or `None` when the path does not exist.
pub fn mtime(path: &Path) -> Result<Option<FileTime>> {
    match fs::metadata(path) {
        Ok(meta) => Ok(Some(FileTime::from_last_modification_time(&meta))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::msg(format!("failed to stat {}: {e}", path.display()))),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Staleness {
    Fresh,
    MissingOutput(PathBuf),
    NewerInput { input: PathBuf, output: PathBuf },
    /// An input is produced upstream and does not exist yet (dry run).
    PendingInput(PathBuf),
    /// An upstream target ran in this invocation.
    UpstreamRebuilt(TargetId),
}

impl Staleness {
    pub fn is_stale(&self) -> bool {
        !matches!(self, Staleness::Fresh)
    }

    pub fn reason(&self) -> String {
        match self {
            Staleness::Fresh => "up to date".into(),
            Staleness::MissingOutput(p) => format!("missing output {}", p.display()),
            Staleness::NewerInput { input, output } => format!(
                "{} is newer than {}",
                input.display(),
                output.display()
            ),
            Staleness::PendingInput(p) => format!("input {} not built yet", p.display()),
            Staleness::UpstreamRebuilt(id) => format!("upstream '{id}' rebuilt"),
        }
    }
}

fn newest_input<'a>(target: &'a Target) -> Result<Option<(FileTime, &'a Path)>> {
    let mut newest: Option<(FileTime, &Path)> = None;
    for input in &target.inputs {
        if let Some(t) = mtime(input)?
            && newest.is_none_or(|(n, _)| t > n)
        {
            newest = Some((t, input.as_path()));
        }
    }
    Ok(newest)
}

/// Oldest output against newest input; missing outputs force a rebuild and equal
/// timestamps count as fresh.
pub fn check_staleness(
    plan: &Plan,
    target: &Target,
    rebuilt: &BTreeSet<TargetId>,
) -> Result<Staleness> {
    for input in &target.inputs {
        if let Some(producer) = plan.producer_of(input)
            && rebuilt.contains(&producer.id)
        {
            return Ok(Staleness::UpstreamRebuilt(producer.id.clone()));
        }
        if mtime(input)?.is_none() {
            if plan.producer_of(input).is_some() {
                return Ok(Staleness::PendingInput(input.clone()));
            }
            return Err(Error::config(format!(
                "input '{}' does not exist and no target produces it",
                input.display()
            )));
        }
    }

    let mut oldest_output: Option<(FileTime, &Path)> = None;
    for out in &target.outputs {
        match mtime(out)? {
            None => return Ok(Staleness::MissingOutput(out.clone())),
            Some(t) => {
                if oldest_output.is_none_or(|(o, _)| t < o) {
                    oldest_output = Some((t, out.as_path()));
                }
            }
        }
    }

    if let (Some((in_t, input)), Some((out_t, output))) = (newest_input(target)?, oldest_output)
        && in_t > out_t
    {
        return Ok(Staleness::NewerInput {
            input: input.to_path_buf(),
            output: output.to_path_buf(),
        });
    }
    Ok(Staleness::Fresh)
}

fn verify_outputs(target: &Target) -> Result<()> {
    let newest = newest_input(target)?;
    for out in &target.outputs {
        let Some(out_t) = mtime(out)? else {
            return Err(Error::new(
                ErrorKind::BuildActionInconsistency,
                format!("reported success but did not produce {}", out.display()),
            ));
        };
        if let Some((in_t, input)) = newest
            && out_t < in_t
        {
            return Err(Error::new(
                ErrorKind::BuildActionInconsistency,
                format!(
                    "reported success but {} is still older than {}",
                    out.display(),
                    input.display()
                ),
            ));
        }
    }
    Ok(())
}

/// Bring `requested` up to date. Returns the ids of the targets that ran (or, in a dry
/// run, would have run).
pub fn build(plan: &Plan, requested: &[PathBuf], ctx: &mut ExecCtx) -> Result<BTreeSet<TargetId>> {
    let ordered = plan.ordered_for(requested)?;
    let mut rebuilt = BTreeSet::<TargetId>::new();

    for target in ordered {
        ctx.set_target(target.id.clone());
        if let Err(e) = run_target(plan, target, ctx, &mut rebuilt) {
            let e = e.context(format!("target '{}' failed", target.id));
            ctx.sink.emit(ExecEvent::ExecutorDone {
                ok: false,
                error: Some(e.to_string()),
                rebuilt: rebuilt.iter().cloned().collect(),
            });
            return Err(e);
        }
    }

    ctx.current_target = None;
    ctx.sink.emit(ExecEvent::ExecutorDone {
        ok: true,
        error: None,
        rebuilt: rebuilt.iter().cloned().collect(),
    });
    Ok(rebuilt)
}

fn run_target(
    plan: &Plan,
    target: &Target,
    ctx: &mut ExecCtx,
    rebuilt: &mut BTreeSet<TargetId>,
) -> Result<()> {
    let staleness = check_staleness(plan, target, rebuilt)?;
    if !staleness.is_stale() {
        ctx.sink.emit(ExecEvent::TargetSkipped {
            id: target.id.clone(),
        });
        return Ok(());
    }

    ctx.sink.emit(ExecEvent::TargetStarted {
        id: target.id.clone(),
        label: target.label.clone(),
        reason: staleness.reason(),
    });
    let start = Instant::now();
    let res = if ctx.dry_run {
        ctx.log(&format!("DRY-RUN: {} ({})", target.id, target.phase));
        Ok(())
    } else {
        target.run(ctx).and_then(|()| verify_outputs(target))
    };
    let elapsed_ms = start.elapsed().as_millis();
    ctx.sink.emit(ExecEvent::TargetFinished {
        id: target.id.clone(),
        ok: res.is_ok(),
        error: res.as_ref().err().map(ToString::to_string),
        elapsed_ms,
    });
    res?;
    rebuilt.insert(target.id.clone());
    Ok(())
}

fn read_output_stream<R: Read>(reader: R, tx: mpsc::Sender<String>) {
    const MAX_PENDING_BYTES: usize = 16 * 1024;
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(1024);

    loop {
        let n = match r.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for b in &buf[..n] {
            if *b == b'\n' {
                let line = String::from_utf8_lossy(&pending).into_owned();
                pending.clear();
                let _ = tx.send(line);
            } else {
                pending.push(*b);
                if pending.len() >= MAX_PENDING_BYTES {
                    let line = String::from_utf8_lossy(&pending).into_owned();
                    pending.clear();
                    let _ = tx.send(line);
                }
            }
        }
    }

    if !pending.is_empty() {
        let _ = tx.send(String::from_utf8_lossy(&pending).into_owned());
    }
}

fn sanitize_filename_component(raw: &str) -> String {
    let out: String = raw
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '.' || ch == '_' || ch == '-' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() { "target".into() } else { out }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::set_file_mtime;

    fn target(inputs: Vec<PathBuf>, outputs: Vec<PathBuf>) -> Target {
        Target::new("t", "t", "test", inputs, outputs, |_| Ok(()))
    }

    #[test]
    fn missing_output_is_stale() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let input = tmp.path().join("in");
        fs::write(&input, "x").expect("write");
        let plan = Plan::default();
        let t = target(vec![input], vec![tmp.path().join("out")]);
        assert!(matches!(
            check_staleness(&plan, &t, &BTreeSet::new()).unwrap(),
            Staleness::MissingOutput(_)
        ));
    }

    #[test]
    fn newer_input_is_stale_and_equal_times_are_fresh() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let input = tmp.path().join("in");
        let output = tmp.path().join("out");
        fs::write(&input, "x").expect("write in");
        fs::write(&output, "y").expect("write out");
        let plan = Plan::default();
        let t = target(vec![input.clone()], vec![output.clone()]);

        set_file_mtime(&input, FileTime::from_unix_time(1_000, 0)).expect("mtime");
        set_file_mtime(&output, FileTime::from_unix_time(1_000, 0)).expect("mtime");
        assert_eq!(
            check_staleness(&plan, &t, &BTreeSet::new()).unwrap(),
            Staleness::Fresh
        );

        set_file_mtime(&input, FileTime::from_unix_time(2_000, 0)).expect("mtime");
        assert!(matches!(
            check_staleness(&plan, &t, &BTreeSet::new()).unwrap(),
            Staleness::NewerInput { .. }
        ));
    }

    #[test]
    fn unproduced_missing_input_is_an_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let plan = Plan::default();
        let t = target(vec![tmp.path().join("ghost")], vec![tmp.path().join("out")]);
        let err = check_staleness(&plan, &t, &BTreeSet::new()).unwrap_err();
        assert!(err.to_string().contains("ghost"), "unexpected err: {err}");
    }

    #[test]
    fn missing_program_is_tool_not_found() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let ctx = ExecCtx::new(false, Arc::new(LogSink::new(tmp.path())));
        let err = ctx
            .run_cmd(
                Command::new("osbuild-definitely-missing-tool"),
                ErrorKind::ExternalBuildFailed,
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ToolNotFound);
        assert_eq!(
            require_tool("osbuild-definitely-missing-tool").unwrap_err().kind(),
            ErrorKind::ToolNotFound
        );
    }

    #[test]
    fn failing_command_output_is_kept_verbatim() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let ctx = ExecCtx::new(false, Arc::new(LogSink::new(tmp.path())));
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo 'error[E0308]: mismatched types' >&2; exit 101"]);
        let err = ctx.run_cmd(cmd, ErrorKind::ExternalBuildFailed).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExternalBuildFailed);
        assert!(
            err.to_string().contains("error[E0308]: mismatched types"),
            "unexpected err: {err}"
        );
    }

    #[test]
    fn sanitizes_target_ids_for_log_names() {
        assert_eq!(sanitize_filename_component("efi.partition"), "efi.partition");
        assert_eq!(sanitize_filename_component("a/b c"), "a_b_c");
        assert_eq!(sanitize_filename_component(""), "target");
    }
}
