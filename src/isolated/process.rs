//! Starting and reaping worker processes.

use crate::error::{Error, Result};
use crate::registry::Registry;
use std::fmt;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Environment variable carrying the slot index into a spawned worker.
pub const WORKER_SLOT_ENV: &str = "TASKFORGE_WORKER_SLOT";

/// How worker processes come to life.
#[derive(Debug, Clone)]
pub enum StartMethod {
    /// Launch a fresh program that serves the worker protocol on its
    /// stdin/stdout, typically through [`serve_stdio`](super::serve_stdio).
    Spawn(WorkerCommand),
    /// Clone the host with `fork(2)`. The child sees the registry as it was
    /// at fork time; only the forking thread survives in it, and every
    /// descriptor except stdio and its own channel is closed.
    #[cfg(unix)]
    Fork,
}

impl Default for StartMethod {
    fn default() -> Self {
        StartMethod::Spawn(WorkerCommand::default())
    }
}

/// Program and arguments for [`StartMethod::Spawn`].
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    program: Option<PathBuf>,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl Default for WorkerCommand {
    /// Re-run the current executable as `<exe> worker`.
    fn default() -> Self {
        Self {
            program: None,
            args: vec!["worker".to_string()],
            envs: Vec::new(),
        }
    }
}

impl WorkerCommand {
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: Some(program.into()),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    fn program(&self) -> Result<PathBuf> {
        match &self.program {
            Some(p) => Ok(p.clone()),
            None => std::env::current_exe()
                .map_err(|e| Error::launch(format!("cannot locate current executable: {}", e))),
        }
    }
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl WorkerExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "killed by signal {}", signal),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

impl From<std::process::ExitStatus> for WorkerExit {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

enum Handle {
    Child(Child),
    #[cfg(unix)]
    Forked,
}

/// A live (or recently dead) worker process.
pub struct WorkerProcess {
    pid: u32,
    handle: Handle,
    exit: Option<WorkerExit>,
}

pub(crate) type Channel = (WorkerProcess, Box<dyn Read + Send>, Box<dyn Write + Send>);

impl WorkerProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_alive(&mut self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }

    /// Reap without blocking. `Ok(None)` while still running.
    pub fn try_wait(&mut self) -> Result<Option<WorkerExit>> {
        if self.exit.is_some() {
            return Ok(self.exit);
        }
        let exit = match &mut self.handle {
            Handle::Child(child) => child.try_wait()?.map(WorkerExit::from),
            #[cfg(unix)]
            Handle::Forked => sys::waitpid(self.pid, libc::WNOHANG)?,
        };
        self.exit = exit;
        Ok(exit)
    }

    pub fn wait(&mut self) -> Result<WorkerExit> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        let exit = match &mut self.handle {
            Handle::Child(child) => WorkerExit::from(child.wait()?),
            #[cfg(unix)]
            Handle::Forked => sys::waitpid(self.pid, 0)?
                .ok_or_else(|| Error::Io("waitpid returned without a status".into()))?,
        };
        self.exit = Some(exit);
        Ok(exit)
    }

    /// Poll for exit until `timeout` runs out.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<WorkerExit>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(exit) = self.try_wait()? {
                return Ok(Some(exit));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Kill the process. A process that already exited is left alone.
    pub fn kill(&mut self) -> Result<()> {
        if self.try_wait()?.is_some() {
            return Ok(());
        }
        match &mut self.handle {
            Handle::Child(child) => match child.kill() {
                Ok(()) => Ok(()),
                // lost the race with its own exit
                Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
                Err(e) => Err(e.into()),
            },
            #[cfg(unix)]
            Handle::Forked => sys::kill(self.pid),
        }
    }

    /// Kill and reap, returning how it ended.
    pub fn terminate(&mut self) -> Result<WorkerExit> {
        self.kill()?;
        self.wait()
    }
}

impl fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("pid", &self.pid)
            .field("exit", &self.exit)
            .finish()
    }
}

/// Start one worker for `slot` and return it with its channel ends.
pub(crate) fn launch(start: &StartMethod, registry: &Arc<Registry>, slot: usize) -> Result<Channel> {
    #[cfg(not(unix))]
    let _ = registry;
    match start {
        StartMethod::Spawn(command) => spawn(command, slot),
        #[cfg(unix)]
        StartMethod::Fork => sys::fork(registry, slot),
    }
}

fn spawn(command: &WorkerCommand, slot: usize) -> Result<Channel> {
    let program = command.program()?;
    let mut child = Command::new(&program)
        .args(&command.args)
        .envs(command.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .env(WORKER_SLOT_ENV, slot.to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| Error::launch(format!("{}: {}", program.display(), e)))?;

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let (stdin, stdout) = match (stdin, stdout) {
        (Some(stdin), Some(stdout)) => (stdin, stdout),
        _ => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::launch("worker started without piped stdio"));
        }
    };

    let process = WorkerProcess {
        pid: child.id(),
        handle: Handle::Child(child),
        exit: None,
    };
    Ok((process, Box::new(stdout), Box::new(stdin)))
}

#[cfg(unix)]
mod sys {
    use super::{Channel, Handle, WorkerExit, WorkerProcess};
    use crate::error::{Error, Result};
    use crate::isolated::serve::{mark_worker_process, serve};
    use crate::registry::Registry;
    use parking_lot::{const_mutex, Mutex};
    use std::fs::File;
    use std::io;
    use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::Arc;

    // Held from pipe(2) until the parent has closed the child's ends, so a
    // fork on another driver thread never copies them.
    static FORK_LOCK: Mutex<()> = const_mutex(());

    /// A pipe whose ends are closed in any program this process execs.
    fn pipe() -> Result<(File, File)> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: `fds` has room for the two descriptors pipe(2) writes.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error().into());
        }
        for fd in fds {
            // SAFETY: `fd` was just returned by pipe(2) and is owned here.
            unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
        }
        // SAFETY: each descriptor is open and handed to exactly one File.
        Ok(unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) })
    }

    /// Close every descriptor above stderr except `keep`. The child never
    /// execs, so close-on-exec does not help here.
    fn close_inherited(keep: &[RawFd]) {
        let listed = ["/proc/self/fd", "/dev/fd"].iter().find_map(|dir| {
            let entries = std::fs::read_dir(dir).ok()?;
            let fds: Vec<RawFd> = entries
                .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
                .collect();
            Some(fds)
        });
        let fds = listed.unwrap_or_else(|| {
            // SAFETY: sysconf has no preconditions.
            let max = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
            let max = if max > 0 { max.min(65_536) as RawFd } else { 1024 };
            (0..max).collect()
        });
        for fd in fds {
            if fd > libc::STDERR_FILENO && !keep.contains(&fd) {
                // SAFETY: only this thread survives the fork and nothing it
                // runs from here on owns these descriptors. EBADF is fine.
                unsafe { libc::close(fd) };
            }
        }
    }

    pub(super) fn fork(registry: &Arc<Registry>, slot: usize) -> Result<Channel> {
        let guard = FORK_LOCK.lock();
        let (to_worker_rx, to_worker_tx) = pipe()?;
        let (to_host_rx, to_host_tx) = pipe()?;

        // SAFETY: the child only touches its own pipe ends and the
        // registry, then leaves through _exit without running destructors.
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(Error::launch(format!(
                "fork failed: {}",
                io::Error::last_os_error()
            )));
        }

        if pid == 0 {
            // the siblings' channels and anything else the host had open
            close_inherited(&[to_worker_rx.as_raw_fd(), to_host_tx.as_raw_fd()]);
            std::mem::forget((to_worker_tx, to_host_rx, guard));
            mark_worker_process();
            let served = catch_unwind(AssertUnwindSafe(|| {
                serve(registry, Some(slot), to_worker_rx, to_host_tx)
            }));
            let code = match served {
                Ok(Ok(())) => 0,
                Ok(Err(_)) => 1,
                Err(_) => 101,
            };
            // SAFETY: terminates the child immediately; nothing after runs.
            unsafe { libc::_exit(code) }
        }

        drop(to_worker_rx);
        drop(to_host_tx);
        drop(guard);
        let process = WorkerProcess {
            pid: pid as u32,
            handle: Handle::Forked,
            exit: None,
        };
        Ok((process, Box::new(to_host_rx), Box::new(to_worker_tx)))
    }

    pub(super) fn waitpid(pid: u32, flags: libc::c_int) -> Result<Option<WorkerExit>> {
        let mut status: libc::c_int = 0;
        // SAFETY: `status` is a valid out-pointer; the pid is our child.
        let ret = unsafe { libc::waitpid(pid as libc::pid_t, &mut status, flags) };
        if ret < 0 {
            return Err(io::Error::last_os_error().into());
        }
        if ret == 0 {
            return Ok(None);
        }
        let exit = if libc::WIFEXITED(status) {
            WorkerExit {
                code: Some(libc::WEXITSTATUS(status)),
                signal: None,
            }
        } else if libc::WIFSIGNALED(status) {
            WorkerExit {
                code: None,
                signal: Some(libc::WTERMSIG(status)),
            }
        } else {
            WorkerExit {
                code: None,
                signal: None,
            }
        };
        Ok(Some(exit))
    }

    pub(super) fn kill(pid: u32) -> Result<()> {
        // SAFETY: plain signal delivery to a child we have not reaped yet.
        if unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) } < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(err.into());
            }
        }
        Ok(())
    }
}
