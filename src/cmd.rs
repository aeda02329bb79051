//! Process execution primitive backing the `shell` step kind: spawn,
//! threaded stdout/stderr readers feeding a single `mpsc` channel so lines
//! interleave in real arrival order, and a `RUNNING_PIDS` registry so
//! `kill_all` can signal every in-flight child at once on cancellation.
//!
//! `execute()` never inspects the exit status itself — the step executor
//! decides what a non-zero exit means (job failure vs. cancellation), so
//! this module only ever reports `Err` for conditions that prevented the
//! command from running or completing at all (spawn failure). `raw()` mode
//! is kept for internal housekeeping invocations that do want a hard error
//! on non-zero exit.

use std::collections::HashSet;
use std::ffi::OsStr;
use std::fmt::{Debug, Display, Formatter};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::channel;
use std::sync::{Arc, LazyLock, Mutex};
use std::thread;

use crate::Error::ScriptFailed;
use crate::Result;

static RUNNING_PIDS: LazyLock<Mutex<HashSet<u32>>> = LazyLock::new(Default::default);

/// Signals every currently-running child process spawned through
/// [`CmdLineRunner`]. Used by the scheduler on cancellation.
#[cfg(unix)]
pub fn kill_all(signal: nix::sys::signal::Signal) {
    let pids = RUNNING_PIDS.lock().unwrap();
    for pid in pids.iter() {
        let pid = *pid as i32;
        let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), signal);
    }
}

pub struct CmdLineRunner<'a> {
    cmd: Command,
    stdin: Option<String>,
    raw: bool,
    on_stdout: Option<Box<dyn Fn(&str) + 'a>>,
    on_stderr: Option<Box<dyn Fn(&str) + 'a>>,
}

impl<'a> CmdLineRunner<'a> {
    pub fn new<P: AsRef<OsStr>>(program: P) -> Self {
        let mut cmd = if cfg!(windows) {
            let mut cmd = Command::new("cmd.exe");
            cmd.arg("/c").arg(program);
            cmd
        } else {
            Command::new(program)
        };
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        Self { cmd, stdin: None, raw: false, on_stdout: None, on_stderr: None }
    }

    pub fn current_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.cmd.current_dir(dir);
        self
    }

    pub fn env<K, V>(mut self, key: K, val: V) -> Self
    where
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.cmd.env(key, val);
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.cmd.envs(vars);
        self
    }

    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.cmd.arg(arg.as_ref());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.cmd.args(args);
        self
    }

    pub fn with_on_stdout<F: Fn(&str) + 'a>(mut self, f: F) -> Self {
        self.on_stdout = Some(Box::new(f));
        self
    }

    pub fn with_on_stderr<F: Fn(&str) + 'a>(mut self, f: F) -> Self {
        self.on_stderr = Some(Box::new(f));
        self
    }

    pub fn raw(mut self, raw: bool) -> Self {
        self.raw = raw;
        self
    }

    pub fn stdin_string(mut self, input: impl Into<String>) -> Self {
        self.cmd.stdin(Stdio::piped());
        self.stdin = Some(input.into());
        self
    }

    pub fn execute(mut self) -> Result<CmdResult> {
        if self.raw {
            return self.execute_raw();
        }
        let mut cp = self.cmd.spawn()?;
        let id = cp.id();
        RUNNING_PIDS.lock().unwrap().insert(id);

        let (tx, rx) = channel();
        if let Some(stdout) = cp.stdout.take() {
            let tx = tx.clone();
            thread::spawn(move || {
                for line in BufReader::new(stdout).lines().map_while(|l| l.ok()) {
                    let _ = tx.send(ChildProcessOutput::Stdout(line));
                }
            });
        }
        if let Some(stderr) = cp.stderr.take() {
            let tx = tx.clone();
            thread::spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                    let _ = tx.send(ChildProcessOutput::Stderr(line));
                }
            });
        }
        if let Some(text) = self.stdin.take() {
            let mut stdin = cp.stdin.take().unwrap();
            thread::spawn(move || {
                let _ = stdin.write_all(text.as_bytes());
            });
        }

        thread::spawn(move || {
            let status = cp.wait();
            if let Ok(status) = status {
                let _ = tx.send(ChildProcessOutput::ExitStatus(status));
            }
        });

        let mut result = CmdResult::default();
        for event in rx {
            match event {
                ChildProcessOutput::Stdout(line) => {
                    if let Some(f) = &self.on_stdout {
                        f(&line);
                    }
                    result.stdout += &line;
                    result.stdout += "\n";
                }
                ChildProcessOutput::Stderr(line) => {
                    if let Some(f) = &self.on_stderr {
                        f(&line);
                    }
                    result.stderr += &line;
                    result.stderr += "\n";
                }
                ChildProcessOutput::ExitStatus(s) => {
                    result.status = s;
                }
            }
        }
        RUNNING_PIDS.lock().unwrap().remove(&id);

        Ok(result)
    }

    fn execute_raw(mut self) -> Result<CmdResult> {
        let program = self.get_program();
        let args = self.get_args();
        let status = self.cmd.spawn()?.wait()?;
        if !status.success() {
            return Err(ScriptFailed(program, args, String::new(), CmdResult { status, ..Default::default() }));
        }
        Ok(CmdResult { status, ..Default::default() })
    }

    fn get_program(&self) -> String {
        self.cmd.get_program().to_string_lossy().to_string()
    }

    fn get_args(&self) -> Vec<String> {
        self.cmd.get_args().map(|s| s.to_string_lossy().to_string()).collect()
    }
}

impl Display for CmdLineRunner<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.get_program(), self.get_args().join(" "))
    }
}

impl Debug for CmdLineRunner<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.get_program(), self.get_args().join(" "))
    }
}

enum ChildProcessOutput {
    Stdout(String),
    Stderr(String),
    ExitStatus(ExitStatus),
}

#[derive(Debug, Default, Clone)]
pub struct CmdResult {
    pub stdout: String,
    pub stderr: String,
    pub status: ExitStatus,
}

impl CmdResult {
    /// A normal exit keeps its code; a signal-terminated process maps to
    /// `128 + signum`, the shell convention.
    pub fn exit_code(&self) -> i32 {
        if let Some(code) = self.status.code() {
            return code;
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = self.status.signal() {
                return 128 + signal;
            }
        }
        1
    }
}
