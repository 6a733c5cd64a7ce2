//! Launches the instrumented target, wires the shared coverage bitmap into
//! its environment, enforces timeout and memory limits, and classifies the
//! exit as normal, crash, or hang.
//!
//! Each call to [`Executor::execute`] is a fresh `fork`+`exec`: forkserver
//! mode is deliberately out of scope (see the design notes on throughput vs.
//! implementation simplicity), so `AFL_NO_FORKSRV=1` is always set.

use std::ffi::OsString;
use std::io::{Read, Write};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;

use crate::error::{Error, Result};
use crate::shmem::SharedMap;

const SIGNALS_THAT_CRASH: [Signal; 5] = [
    Signal::SIGSEGV,
    Signal::SIGABRT,
    Signal::SIGBUS,
    Signal::SIGILL,
    Signal::SIGFPE,
];
const ASAN_EXIT_CODE: i32 = 77;

/// How the target consumes the input: via a `@@`-substituted temp file, or
/// on stdin.
#[derive(Debug, Clone)]
enum InputMode {
    File,
    Stdin,
}

/// The result of a single execution. Owns its own data independent of the
/// live shared-memory region.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub signal: Option<i32>,
    pub crashed: bool,
    pub hanged: bool,
    pub exec_time_us: u64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub coverage: Option<Vec<u8>>,
}

/// Configuration for constructing an [`Executor`].
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub target: PathBuf,
    pub args: Vec<OsString>,
    pub bitmap_size: usize,
    pub timeout: Duration,
    pub mem_limit_mb: Option<u64>,
    pub stderr_max_len: usize,
    pub use_sandbox: bool,
}

pub struct Executor {
    config: ExecutorConfig,
    shmem: SharedMap,
    input_mode: InputMode,
    sandbox_warned: bool,
}

impl Executor {
    pub fn new(config: ExecutorConfig) -> Result<Self> {
        let shmem = SharedMap::new(config.bitmap_size)?;
        let input_mode = if config.args.iter().any(|a| a == "@@") {
            InputMode::File
        } else {
            InputMode::Stdin
        };
        Ok(Self {
            config,
            shmem,
            input_mode,
            sandbox_warned: false,
        })
    }

    pub fn coverage_map_size(&self) -> usize {
        self.shmem.size()
    }

    /// Runs the target once against `input` and returns its classification.
    pub fn execute(&mut self, input: &[u8]) -> Result<ExecutionResult> {
        self.shmem.clear();

        let mut file_guard = None;
        let mut command = self.build_command(input, &mut file_guard)?;

        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        if matches!(self.input_mode, InputMode::Stdin) {
            command.stdin(Stdio::piped());
        } else {
            command.stdin(Stdio::null());
        }

        // New process group so a timeout can be killed with one signal to
        // the whole group rather than racing a single pid; memory limit is
        // applied in the child, after fork but before exec.
        let mem_limit_mb = self.config.mem_limit_mb;
        unsafe {
            command.pre_exec(move || {
                let _ = nix::unistd::setsid();
                if let Some(mb) = mem_limit_mb {
                    let _ = apply_mem_limit(mb);
                }
                Ok(())
            });
        }

        let start = Instant::now();
        let mut child = command
            .spawn()
            .map_err(|source| Error::Spawn {
                target: self.config.target.clone(),
                source,
            })?;

        if matches!(self.input_mode, InputMode::Stdin) {
            if let Some(mut stdin) = child.stdin.take() {
                let _ = stdin.write_all(input);
            }
        }

        let (status, hanged) = self.wait_with_timeout(&mut child)?;
        let exec_time_us = start.elapsed().as_micros() as u64;

        let mut stdout = Vec::new();
        if let Some(mut out) = child.stdout.take() {
            let _ = out.read_to_end(&mut stdout);
        }
        let mut stderr = Vec::new();
        if let Some(mut err) = child.stderr.take() {
            let _ = err.read_to_end(&mut stderr);
        }
        stderr.truncate(self.config.stderr_max_len);

        // `file_guard` (if any) is dropped at the end of this function,
        // which removes the staged temp input file.
        drop(file_guard);

        let coverage = Some(self.shmem.read_snapshot());

        let (exit_code, signal) = match status {
            Some(s) => Self::decode_status(s),
            None => (0, None),
        };

        let crashed = !hanged
            && (exit_code == ASAN_EXIT_CODE
                || signal
                    .map(|s| SIGNALS_THAT_CRASH.contains(&Signal::try_from(s).unwrap_or(Signal::SIGCONT)))
                    .unwrap_or(false)
                || exit_code >= 128);

        Ok(ExecutionResult {
            exit_code,
            signal,
            crashed,
            hanged,
            exec_time_us,
            stdout,
            stderr,
            coverage,
        })
    }

    fn build_command(
        &mut self,
        input: &[u8],
        file_guard: &mut Option<tempfile::NamedTempFile>,
    ) -> Result<Command> {
        let mut args: Vec<OsString> = self.config.args.clone();

        if matches!(self.input_mode, InputMode::File) {
            let mut tmp = tempfile::NamedTempFile::new()?;
            tmp.write_all(input)?;
            tmp.flush()?;
            let path = tmp.path().to_owned();
            for a in args.iter_mut() {
                if a == "@@" {
                    *a = path.clone().into_os_string();
                }
            }
            *file_guard = Some(tmp);
        }

        let (program, mut prefix_args, needs_warning) = self.sandbox_prefix();
        if needs_warning && !self.sandbox_warned {
            log::warn!("bwrap not available, running target without sandbox");
            self.sandbox_warned = true;
        }
        prefix_args.extend(args);

        let mut command = Command::new(program);
        command.args(prefix_args);
        command.env("__AFL_SHM_ID", self.shmem.id().to_string());
        command.env("AFL_NO_FORKSRV", "1");
        let asan_opts = std::env::var("ASAN_OPTIONS").unwrap_or_default();
        command.env(
            "ASAN_OPTIONS",
            merge_asan_options(&asan_opts),
        );
        Ok(command)
    }

    /// Returns `(program, prefix_args, warned)`. When sandboxing is
    /// requested and `bwrap` is on PATH, wraps the target in a bubblewrap
    /// invocation binding the target read-only and a scratch dir read-write.
    /// Otherwise runs the target directly.
    fn sandbox_prefix(&self) -> (OsString, Vec<OsString>, bool) {
        if !self.config.use_sandbox {
            return (self.config.target.clone().into_os_string(), vec![], false);
        }
        match which_bwrap() {
            Some(bwrap) => {
                let target_dir = self
                    .config
                    .target
                    .parent()
                    .unwrap_or_else(|| std::path::Path::new("/"))
                    .to_owned();
                let scratch = std::env::temp_dir();
                let args: Vec<OsString> = vec![
                    "--ro-bind".into(),
                    target_dir.clone().into_os_string(),
                    target_dir.into_os_string(),
                    "--ro-bind".into(),
                    "/lib".into(),
                    "/lib".into(),
                    "--ro-bind".into(),
                    "/usr/lib".into(),
                    "/usr/lib".into(),
                    "--bind".into(),
                    scratch.clone().into_os_string(),
                    scratch.into_os_string(),
                    "--".into(),
                    self.config.target.clone().into_os_string(),
                ];
                (bwrap.into(), args, false)
            }
            None => (self.config.target.clone().into_os_string(), vec![], true),
        }
    }

    fn wait_with_timeout(&self, child: &mut Child) -> Result<(Option<std::process::ExitStatus>, bool)> {
        let pid = Pid::from_raw(child.id() as i32);
        let deadline = Instant::now() + self.config.timeout;
        loop {
            match child.try_wait()? {
                Some(status) => return Ok((Some(status), false)),
                None => {
                    if Instant::now() >= deadline {
                        let _ = killpg(pid, Signal::SIGKILL);
                        let _ = child.wait();
                        let _ = waitpid(pid, Some(WaitPidFlag::WNOHANG));
                        return Ok((None, true));
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }

    fn decode_status(status: std::process::ExitStatus) -> (i32, Option<i32>) {
        if let Some(sig) = status.signal() {
            (128 + sig, Some(sig))
        } else {
            (status.code().unwrap_or(0), None)
        }
    }

    /// Destroys the shared segment. The staged temp input file (if any) is
    /// already removed at the end of every `execute` call. Idempotent: safe
    /// to call more than once, and runs again (as a no-op) on drop.
    pub fn cleanup(&mut self) {
        self.shmem.destroy();
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn merge_asan_options(existing: &str) -> String {
    const REQUIRED: &str = "exitcode=77:abort_on_error=1:symbolize=0:detect_leaks=0";
    if existing.is_empty() {
        REQUIRED.to_string()
    } else {
        format!("{existing}:{REQUIRED}")
    }
}

fn which_bwrap() -> Option<OsString> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join("bwrap");
        if candidate.is_file() {
            return Some(candidate.into_os_string());
        }
    }
    None
}

/// Applies the per-process address-space limit via `setrlimit(RLIMIT_AS)`.
/// Silently skipped (returns `Ok`) on platforms where this is unsupported.
pub fn apply_mem_limit(mb: u64) -> Result<()> {
    use nix::sys::resource::{setrlimit, Resource};
    let bytes = mb.saturating_mul(1024 * 1024);
    let _ = setrlimit(Resource::RLIMIT_AS, bytes, bytes);
    Ok(())
}

// Re-export for callers that build `CommandExt::pre_exec` closures.
use std::os::unix::process::CommandExt;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn cfg(target: &str, args: Vec<&str>, timeout_secs: u64) -> ExecutorConfig {
        ExecutorConfig {
            target: PathBuf::from(target),
            args: args.into_iter().map(OsString::from).collect(),
            bitmap_size: 4096,
            timeout: StdDuration::from_secs(timeout_secs),
            mem_limit_mb: None,
            stderr_max_len: 4096,
            use_sandbox: false,
        }
    }

    #[test]
    fn stdin_mode_detected_without_at_token() {
        let config = cfg("/bin/cat", vec![], 5);
        let exec = Executor::new(config).expect("shmem alloc should succeed");
        assert!(matches!(exec.input_mode, InputMode::Stdin));
    }

    #[test]
    fn file_mode_detected_with_at_token() {
        let config = cfg("/bin/cat", vec!["@@"], 5);
        let exec = Executor::new(config).expect("shmem alloc should succeed");
        assert!(matches!(exec.input_mode, InputMode::File));
    }

    #[test]
    fn normal_exit_is_neither_crash_nor_hang() {
        let config = cfg("/bin/true", vec![], 5);
        let mut exec = Executor::new(config).unwrap();
        let result = exec.execute(b"anything").unwrap();
        assert!(!result.crashed);
        assert!(!result.hanged);
    }

    #[test]
    fn crash_and_hang_are_mutually_exclusive() {
        // /bin/false exits 1: neither crash nor hang.
        let config = cfg("/bin/false", vec![], 5);
        let mut exec = Executor::new(config).unwrap();
        let result = exec.execute(b"x").unwrap();
        assert!(!(result.crashed && result.hanged));
    }

    #[test]
    fn hang_is_classified_on_timeout() {
        let config = cfg("/bin/sleep", vec!["5"], 1);
        let mut exec = Executor::new(config).unwrap();
        let result = exec.execute(b"x").unwrap();
        assert!(result.hanged);
        assert!(!result.crashed);
    }

    #[test]
    fn merge_asan_options_appends_required_keys() {
        assert_eq!(
            merge_asan_options(""),
            "exitcode=77:abort_on_error=1:symbolize=0:detect_leaks=0"
        );
        assert_eq!(
            merge_asan_options("detect_leaks=1"),
            "detect_leaks=1:exitcode=77:abort_on_error=1:symbolize=0:detect_leaks=0"
        );
    }
}
