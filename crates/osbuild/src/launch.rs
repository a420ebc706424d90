//! Emulator + debugger launch for kernel debugging.
//!
//! The emulator starts halted with a GDB stub; the debugger is started against the kernel
//! binary and told to attach. Neither is waited on here.

use std::fs::{self, File};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use serde::Deserialize;

use crate::config::ConfigDoc;
use crate::error::{Error, ErrorKind, Result};
use crate::executor::{detach_process_group, require_tool, spawn_error};
use crate::modules::util;

pub const FIRMWARE_ENV: &str = "OVMF_DIR";
pub const FIRMWARE_CODE: &str = "OVMF_CODE.fd";
pub const FIRMWARE_VARS: &str = "OVMF_VARS.fd";

fn default_gdb_port() -> u16 {
    1234
}

fn default_emulator() -> String {
    "qemu-system-{arch}".into()
}

fn default_debugger() -> String {
    "gdb".into()
}

fn default_memory() -> String {
    "256M".into()
}

/// `[debug]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Directory with `OVMF_CODE.fd` and `OVMF_VARS.fd`; `OVMF_DIR` takes precedence.
    pub firmware_dir: Option<String>,
    #[serde(default = "default_gdb_port")]
    pub gdb_port: u16,
    #[serde(default = "default_emulator")]
    pub emulator: String,
    #[serde(default = "default_debugger")]
    pub debugger: String,
    #[serde(default = "default_memory")]
    pub memory: String,
    pub emulator_args: Vec<String>,
    pub debugger_args: Vec<String>,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            firmware_dir: None,
            gdb_port: default_gdb_port(),
            emulator: default_emulator(),
            debugger: default_debugger(),
            memory: default_memory(),
            emulator_args: Vec::new(),
            debugger_args: Vec::new(),
        }
    }
}

impl DebugConfig {
    pub fn load(doc: &ConfigDoc) -> Result<Self> {
        doc.section("debug")
    }

    pub fn emulator_program(&self, arch: &str) -> String {
        util::expand_template(&self.emulator, &[("arch", arch)])
    }
}

/// Firmware directory from `OVMF_DIR`, falling back to `debug.firmware_dir`.
pub fn firmware_dir(cfg: &DebugConfig, env_value: Option<String>) -> Result<PathBuf> {
    env_value
        .filter(|v| !v.trim().is_empty())
        .or_else(|| cfg.firmware_dir.clone())
        .map(PathBuf::from)
        .ok_or_else(|| {
            Error::config(format!(
                "{FIRMWARE_ENV} is not set; point it (or debug.firmware_dir) at the directory holding {FIRMWARE_CODE} and {FIRMWARE_VARS}"
            ))
        })
}

/// UEFI firmware volumes as the emulator sees them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Firmware {
    pub code: PathBuf,
    pub vars: PathBuf,
}

/// Check the firmware directory and give the emulator a private, writable copy of the
/// variable store in `work_dir`.
pub fn prepare_firmware(dir: &Path, work_dir: &Path) -> Result<Firmware> {
    let code = dir.join(FIRMWARE_CODE);
    let vars_src = dir.join(FIRMWARE_VARS);
    for p in [&code, &vars_src] {
        if !p.is_file() {
            return Err(Error::config(format!(
                "{} not found (check {FIRMWARE_ENV})",
                p.display()
            )));
        }
    }
    util::ensure_dir(work_dir)?;
    let vars = work_dir.join(FIRMWARE_VARS);
    fs::copy(&vars_src, &vars).map_err(|e| {
        Error::msg(format!(
            "failed to copy {} to {}: {e}",
            vars_src.display(),
            vars.display()
        ))
    })?;
    Ok(Firmware { code, vars })
}

/// Emulator command builder.
#[derive(Debug, Clone)]
pub struct QemuBuilder {
    program: String,
    memory: String,
    firmware: Option<Firmware>,
    drive: Option<PathBuf>,
    gdb_port: Option<u16>,
    halted: bool,
    serial_log: Option<PathBuf>,
    extra: Vec<String>,
}

impl QemuBuilder {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            memory: default_memory(),
            firmware: None,
            drive: None,
            gdb_port: None,
            halted: false,
            serial_log: None,
            extra: Vec::new(),
        }
    }

    pub fn memory(mut self, memory: &str) -> Self {
        self.memory = memory.to_string();
        self
    }

    pub fn firmware(mut self, firmware: Firmware) -> Self {
        self.firmware = Some(firmware);
        self
    }

    /// Raw disk image attached as the boot drive.
    pub fn drive(mut self, path: &Path) -> Self {
        self.drive = Some(path.to_path_buf());
        self
    }

    /// GDB stub on `port`, optionally halting the CPU until a debugger continues it.
    pub fn gdb(mut self, port: u16, halted: bool) -> Self {
        self.gdb_port = Some(port);
        self.halted = halted;
        self
    }

    pub fn serial_log(mut self, path: &Path) -> Self {
        self.serial_log = Some(path.to_path_buf());
        self
    }

    pub fn extra_args(mut self, args: &[String]) -> Self {
        self.extra.extend(args.iter().cloned());
        self
    }

    pub fn args(&self) -> Vec<String> {
        let mut out: Vec<String> = vec!["-m".into(), self.memory.clone()];
        if let Some(fw) = &self.firmware {
            out.push("-drive".into());
            out.push(format!(
                "if=pflash,format=raw,readonly=on,file={}",
                fw.code.display()
            ));
            out.push("-drive".into());
            out.push(format!("if=pflash,format=raw,file={}", fw.vars.display()));
        }
        if let Some(drive) = &self.drive {
            out.push("-drive".into());
            out.push(format!("format=raw,file={}", drive.display()));
        }
        if let Some(log) = &self.serial_log {
            out.push("-serial".into());
            out.push(format!("file:{}", log.display()));
        }
        if let Some(port) = self.gdb_port {
            out.push("-gdb".into());
            out.push(format!("tcp::{port}"));
            if self.halted {
                out.push("-S".into());
            }
        }
        out.extend(self.extra.iter().cloned());
        out
    }

    pub fn build(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args());
        cmd
    }
}

pub fn debugger_command(cfg: &DebugConfig, kernel: &Path, port: u16) -> Command {
    let mut cmd = Command::new(&cfg.debugger);
    cmd.arg(kernel)
        .arg("-ex")
        .arg(format!("target remote localhost:{port}"))
        .args(&cfg.debugger_args);
    cmd
}

/// Fail if something already listens on the rendezvous port.
pub fn ensure_port_free(port: u16) -> Result<()> {
    TcpListener::bind(("127.0.0.1", port)).map(drop).map_err(|e| {
        Error::new(
            ErrorKind::ExternalToolFailed,
            format!("debugger port {port} is not available: {e}"),
        )
    })
}

/// The two launched processes. Dropping this does not stop them.
#[derive(Debug)]
pub struct DebugSession {
    pub emulator: Child,
    pub debugger: Child,
    pub port: u16,
}

/// Everything `debug_launch` needs besides the config.
#[derive(Debug, Clone)]
pub struct LaunchTarget<'a> {
    pub raw_image: &'a Path,
    pub kernel: &'a Path,
    pub arch: &'a str,
    pub firmware_dir: &'a Path,
    /// Holds the writable firmware variables and the emulator's logs.
    pub work_dir: &'a Path,
}

/// Start the halted emulator, then the debugger attached to it. Returns without waiting.
pub fn debug_launch(cfg: &DebugConfig, target: &LaunchTarget<'_>) -> Result<DebugSession> {
    let emulator = cfg.emulator_program(target.arch);
    require_tool(&emulator)?;
    require_tool(&cfg.debugger)?;
    ensure_port_free(cfg.gdb_port)?;

    let firmware = prepare_firmware(target.firmware_dir, target.work_dir)?;
    let log_path = target.work_dir.join("emulator.log");
    let log = File::create(&log_path)
        .map_err(|e| Error::msg(format!("failed to create {}: {e}", log_path.display())))?;
    let log_err = log
        .try_clone()
        .map_err(|e| Error::msg(format!("failed to reopen {}: {e}", log_path.display())))?;

    let mut emu_cmd = QemuBuilder::new(&emulator)
        .memory(&cfg.memory)
        .firmware(firmware)
        .drive(target.raw_image)
        .serial_log(&target.work_dir.join("serial.log"))
        .gdb(cfg.gdb_port, true)
        .extra_args(&cfg.emulator_args)
        .build();
    emu_cmd
        .stdin(Stdio::null())
        .stdout(log)
        .stderr(log_err);
    detach_process_group(&mut emu_cmd);
    tracing::info!(program = %emulator, port = cfg.gdb_port, "starting emulator (halted)");
    let mut emulator_child = emu_cmd.spawn().map_err(|e| spawn_error(&emulator, e))?;

    let mut dbg_cmd = debugger_command(cfg, target.kernel, cfg.gdb_port);
    tracing::info!(program = %cfg.debugger, kernel = %target.kernel.display(), "starting debugger");
    let debugger = match dbg_cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            let _ = emulator_child.kill();
            let _ = emulator_child.wait();
            return Err(spawn_error(&cfg.debugger, e));
        }
    };

    Ok(DebugSession {
        emulator: emulator_child,
        debugger,
        port: cfg.gdb_port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emulator_args_halt_and_expose_gdb_stub() {
        let fw = Firmware {
            code: PathBuf::from("/fw/OVMF_CODE.fd"),
            vars: PathBuf::from("/work/OVMF_VARS.fd"),
        };
        let args = QemuBuilder::new("qemu-system-x86_64")
            .firmware(fw)
            .drive(Path::new("/o/image.img"))
            .gdb(1234, true)
            .args();
        let joined = args.join(" ");
        assert!(joined.contains("if=pflash,format=raw,readonly=on,file=/fw/OVMF_CODE.fd"));
        assert!(joined.contains("if=pflash,format=raw,file=/work/OVMF_VARS.fd"));
        assert!(joined.contains("format=raw,file=/o/image.img"));
        assert!(joined.contains("-gdb tcp::1234 -S"));
    }

    #[test]
    fn debugger_attaches_to_configured_port() {
        let cfg = DebugConfig {
            gdb_port: 4321,
            ..DebugConfig::default()
        };
        let cmd = debugger_command(&cfg, Path::new("/o/kernel"), cfg.gdb_port);
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(cmd.get_program(), "gdb");
        assert_eq!(args, vec!["/o/kernel", "-ex", "target remote localhost:4321"]);
        assert_eq!(cfg.emulator_program("x86_64"), "qemu-system-x86_64");
    }

    #[test]
    fn missing_firmware_setting_names_the_variable() {
        let err = firmware_dir(&DebugConfig::default(), None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(err.to_string().contains(FIRMWARE_ENV), "unexpected err: {err}");

        let cfg = DebugConfig {
            firmware_dir: Some("/from/config".into()),
            ..DebugConfig::default()
        };
        assert_eq!(
            firmware_dir(&cfg, Some("/from/env".into())).unwrap(),
            PathBuf::from("/from/env")
        );
        assert_eq!(firmware_dir(&cfg, None).unwrap(), PathBuf::from("/from/config"));
    }

    #[test]
    fn firmware_vars_are_copied_into_work_dir() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let fw_dir = tmp.path().join("ovmf");
        fs::create_dir_all(&fw_dir).expect("mkdir");
        fs::write(fw_dir.join(FIRMWARE_CODE), "code").expect("write code");
        fs::write(fw_dir.join(FIRMWARE_VARS), "vars").expect("write vars");

        let work = tmp.path().join("work");
        let fw = prepare_firmware(&fw_dir, &work).expect("prepare");
        assert_eq!(fw.code, fw_dir.join(FIRMWARE_CODE));
        assert_eq!(fw.vars, work.join(FIRMWARE_VARS));
        assert_eq!(fs::read_to_string(&fw.vars).expect("read"), "vars");

        fs::remove_file(fw_dir.join(FIRMWARE_CODE)).expect("rm");
        assert_eq!(
            prepare_firmware(&fw_dir, &work).unwrap_err().kind(),
            ErrorKind::Config
        );
    }

    fn free_port() -> u16 {
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind");
        listener.local_addr().expect("addr").port()
    }

    fn firmware_fixture(root: &Path) -> PathBuf {
        let fw_dir = root.join("ovmf");
        fs::create_dir_all(&fw_dir).expect("mkdir");
        fs::write(fw_dir.join(FIRMWARE_CODE), "code").expect("write code");
        fs::write(fw_dir.join(FIRMWARE_VARS), "vars").expect("write vars");
        fw_dir
    }

    #[cfg(unix)]
    fn script(path: &Path, body: &str) {
        use std::os::unix::fs::PermissionsExt;
        fs::write(path, body).expect("write script");
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).expect("chmod");
    }

    #[test]
    fn launch_starts_emulator_then_debugger() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let fw_dir = firmware_fixture(tmp.path());
        let image = tmp.path().join("image.img");
        fs::write(&image, vec![0u8; 4096]).expect("write image");
        let work = tmp.path().join("work");
        let cfg = DebugConfig {
            emulator: "true".into(),
            debugger: "true".into(),
            gdb_port: free_port(),
            ..DebugConfig::default()
        };

        let mut session = debug_launch(
            &cfg,
            &LaunchTarget {
                raw_image: &image,
                kernel: Path::new("/o/kernel"),
                arch: "x86_64",
                firmware_dir: &fw_dir,
                work_dir: &work,
            },
        )
        .expect("launch");
        assert_eq!(session.port, cfg.gdb_port);
        assert!(session.emulator.wait().expect("wait emulator").success());
        assert!(session.debugger.wait().expect("wait debugger").success());
        assert_eq!(fs::read_to_string(work.join(FIRMWARE_VARS)).expect("vars"), "vars");
        assert!(work.join("emulator.log").is_file());
    }

    #[test]
    fn missing_debugger_fails_before_the_emulator_starts() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let fw_dir = firmware_fixture(tmp.path());
        let work = tmp.path().join("work");
        let cfg = DebugConfig {
            emulator: "true".into(),
            debugger: "osbuild-no-such-debugger".into(),
            gdb_port: free_port(),
            ..DebugConfig::default()
        };

        let err = debug_launch(
            &cfg,
            &LaunchTarget {
                raw_image: &tmp.path().join("image.img"),
                kernel: Path::new("/o/kernel"),
                arch: "x86_64",
                firmware_dir: &fw_dir,
                work_dir: &work,
            },
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ToolNotFound);
        assert_eq!(err.exit_code(), 3);
        assert!(!work.exists());
    }

    #[cfg(unix)]
    #[test]
    fn emulator_is_stopped_when_the_debugger_cannot_start() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let fw_dir = firmware_fixture(tmp.path());
        let pid_file = tmp.path().join("emulator.pid");
        let emulator = tmp.path().join("fake-emulator");
        script(
            &emulator,
            &format!("#!/bin/sh\necho $$ > '{}'\nexec sleep 30\n", pid_file.display()),
        );
        // Executable, so it resolves, but its interpreter does not exist.
        let debugger = tmp.path().join("fake-debugger");
        script(&debugger, "#!/nonexistent/interpreter\n");

        let cfg = DebugConfig {
            emulator: emulator.display().to_string(),
            debugger: debugger.display().to_string(),
            gdb_port: free_port(),
            ..DebugConfig::default()
        };
        let err = debug_launch(
            &cfg,
            &LaunchTarget {
                raw_image: &tmp.path().join("image.img"),
                kernel: Path::new("/o/kernel"),
                arch: "x86_64",
                firmware_dir: &fw_dir,
                work_dir: &tmp.path().join("work"),
            },
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ToolNotFound);

        // The emulator was killed and reaped before the error came back.
        if let Ok(pid) = fs::read_to_string(&pid_file) {
            let alive = Command::new("kill")
                .arg("-0")
                .arg(pid.trim())
                .stderr(Stdio::null())
                .status()
                .expect("run kill");
            assert!(!alive.success(), "emulator {} still running", pid.trim());
        }
    }

    #[test]
    fn occupied_port_is_reported() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind");
        let port = listener.local_addr().expect("addr").port();
        assert_eq!(
            ensure_port_free(port).unwrap_err().kind(),
            ErrorKind::ExternalToolFailed
        );
        drop(listener);
    }
}
