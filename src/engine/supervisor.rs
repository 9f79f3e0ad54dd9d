//! Engine process supervision
//!
//! Spawns the install engine in its own process group, decodes its output
//! stream into typed events on a bounded channel, and guarantees the whole
//! group is dead (and scratch space removed) on cancellation, crash, or
//! handle drop. The bounded channel applies backpressure: a slow consumer
//! stalls the engine's stdout pipe instead of buffering without limit.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io::{BufRead, BufReader};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use wait_timeout::ChildExt;

use crate::engine::events::{EngineEvent, EventAssembler};
use crate::error::SupervisorError;
use crate::logging::{log_engine, log_error, log_info, log_warning};

/// Bounded event queue depth. Small on purpose.
const EVENT_QUEUE_DEPTH: usize = 64;

/// Lines of recent engine output kept for crash reports.
const LOG_TAIL_LINES: usize = 50;

// ============================================================================
// Command builder
// ============================================================================

/// Describes one engine invocation. Built up, then `spawn()`ed.
pub struct EngineCommand {
    program: PathBuf,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: BTreeMap<String, String>,
    scratch_dir: Option<PathBuf>,
    kill_grace: Duration,
}

impl EngineCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            scratch_dir: None,
            kill_grace: Duration::from_secs(5),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Directory of engine temporaries, removed when the run ends however
    /// it ends.
    #[must_use]
    pub fn scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    /// How long a cancelled engine gets to exit after SIGTERM before the
    /// group is SIGKILLed.
    #[must_use]
    pub fn kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Spawn the engine in a new process group and start the reader
    /// threads. The returned handle is the only way to observe the run.
    pub fn spawn(self) -> Result<EngineHandle, SupervisorError> {
        raise_fd_limit();

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Own process group, so one signal reaches the engine and
            // every helper it forks.
            .process_group(0);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        for (k, v) in &self.env {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            program: self.program.display().to_string(),
            source,
        })?;

        let pid = child.id() as i32;
        log_info(&format!(
            "Spawned engine {} (pid {}, pgid {})",
            self.program.display(),
            pid,
            pid
        ));

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (tx, rx) = sync_channel(EVENT_QUEUE_DEPTH);
        let cancel = Arc::new(AtomicBool::new(false));
        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(LOG_TAIL_LINES)));
        let child = Arc::new(Mutex::new(child));

        // stderr carries diagnostics only; record it in the tail and pass
        // it through as log events on a side thread.
        let stderr_thread = stderr.map(|stream| {
            let tx = tx.clone();
            let tail = Arc::clone(&tail);
            let cancel = Arc::clone(&cancel);
            thread::spawn(move || {
                for line in BufReader::new(stream).lines() {
                    let Ok(line) = line else { break };
                    if cancel.load(Ordering::SeqCst) {
                        break;
                    }
                    push_tail(&tail, &line);
                    if tx.send(EngineEvent::Log(line)).is_err() {
                        break;
                    }
                }
            })
        });

        let reader = {
            let tx = tx.clone();
            let tail = Arc::clone(&tail);
            let cancel = Arc::clone(&cancel);
            let child = Arc::clone(&child);
            let scratch = self.scratch_dir.clone();
            thread::spawn(move || {
                let exit_code = run_reader(stdout, &tx, &tail, &cancel, &child);
                if let Some(t) = stderr_thread {
                    let _ = t.join();
                }
                if let Some(dir) = &scratch {
                    remove_scratch(dir);
                }
                if !cancel.load(Ordering::SeqCst) {
                    // Exactly one terminal event per run.
                    let _ = tx.send(EngineEvent::Exit(exit_code));
                }
            })
        };

        Ok(EngineHandle {
            events: rx,
            cancel,
            pgid: pid,
            child,
            reader: Some(reader),
            scratch_dir: self.scratch_dir,
            kill_grace: self.kill_grace,
            log_tail: tail,
        })
    }
}

/// Decode stdout into events until EOF, then reap the child. Returns the
/// exit code (-1 when killed by a signal).
fn run_reader(
    stdout: Option<std::process::ChildStdout>,
    tx: &SyncSender<EngineEvent>,
    tail: &Arc<Mutex<VecDeque<String>>>,
    cancel: &Arc<AtomicBool>,
    child: &Arc<Mutex<Child>>,
) -> i32 {
    let mut assembler = EventAssembler::new();

    if let Some(stream) = stdout {
        for line in BufReader::new(stream).lines() {
            let Ok(line) = line else { break };
            if cancel.load(Ordering::SeqCst) {
                break;
            }
            push_tail(tail, &line);
            log_engine(&line);
            for event in assembler.push_line(&line) {
                if tx.send(event).is_err() {
                    return -1;
                }
            }
        }
    }

    // Anything still batched when the stream closes must not be lost.
    if !cancel.load(Ordering::SeqCst) {
        for event in assembler.flush_manual() {
            let _ = tx.send(event);
        }
    }

    let status = match child.lock() {
        Ok(mut guard) => guard.wait().ok(),
        Err(_) => None,
    };
    status.and_then(|s| s.code()).unwrap_or(-1)
}

fn push_tail(tail: &Arc<Mutex<VecDeque<String>>>, line: &str) {
    if let Ok(mut buf) = tail.lock() {
        if buf.len() == LOG_TAIL_LINES {
            buf.pop_front();
        }
        buf.push_back(line.to_string());
    }
}

fn remove_scratch(dir: &Path) {
    if dir.exists() {
        match fs::remove_dir_all(dir) {
            Ok(()) => log_info(&format!("Removed engine scratch dir {}", dir.display())),
            Err(e) => log_warning(&format!(
                "Could not remove engine scratch dir {}: {}",
                dir.display(),
                e
            )),
        }
    }
}

/// Raise the soft open-file limit to the hard limit. The engine opens one
/// descriptor per concurrent download and trips the default soft limit on
/// large modlists.
fn raise_fd_limit() {
    unsafe {
        let mut lim = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut lim) != 0 {
            return;
        }
        if lim.rlim_cur < lim.rlim_max {
            let old = lim.rlim_cur;
            lim.rlim_cur = lim.rlim_max;
            if libc::setrlimit(libc::RLIMIT_NOFILE, &lim) == 0 {
                log_info(&format!("Raised fd limit {} -> {}", old, lim.rlim_max));
            }
        }
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Live engine run. Dropping the handle kills the process group.
pub struct EngineHandle {
    events: Receiver<EngineEvent>,
    cancel: Arc<AtomicBool>,
    pgid: i32,
    child: Arc<Mutex<Child>>,
    reader: Option<JoinHandle<()>>,
    scratch_dir: Option<PathBuf>,
    kill_grace: Duration,
    log_tail: Arc<Mutex<VecDeque<String>>>,
}

impl EngineHandle {
    /// The event stream for this run. Ends with `EngineEvent::Exit` unless
    /// the run was cancelled.
    pub fn events(&self) -> &Receiver<EngineEvent> {
        &self.events
    }

    /// Recent engine output, newest last. Attached to crash errors so the
    /// failure is diagnosable without digging up the engine log.
    pub fn log_tail(&self) -> Vec<String> {
        self.log_tail
            .lock()
            .map(|buf| buf.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Stop the run: SIGTERM to the group, a grace period, then SIGKILL to
    /// whatever survived. No further events are emitted after the line in
    /// flight. Idempotent.
    pub fn cancel(&mut self) {
        if self.cancel.swap(true, Ordering::SeqCst) {
            return;
        }
        log_info(&format!(
            "Cancelling engine run (pgid {}), grace {:?}",
            self.pgid, self.kill_grace
        ));

        unsafe {
            libc::killpg(self.pgid, libc::SIGTERM);
        }

        let exited = match self.child.lock() {
            Ok(mut guard) => match guard.try_wait() {
                Ok(Some(_)) => true,
                _ => matches!(guard.wait_timeout(self.kill_grace), Ok(Some(_))),
            },
            Err(_) => false,
        };
        if !exited {
            log_warning(&format!(
                "Engine ignored SIGTERM, killing group {}",
                self.pgid
            ));
            unsafe {
                libc::killpg(self.pgid, libc::SIGKILL);
            }
            if let Ok(mut guard) = self.child.lock() {
                let _ = guard.wait();
            }
        }

        if let Some(reader) = self.reader.take() {
            // The reader may be parked in a send on the full channel;
            // keep draining until it gets to its cancellation check.
            while !reader.is_finished() {
                for _ in self.events.try_iter() {}
                thread::sleep(Duration::from_millis(10));
            }
            let _ = reader.join();
        }
        if let Some(dir) = &self.scratch_dir {
            remove_scratch(dir);
        }
    }

    /// Block until the run produces its exit event, mapping a nonzero exit
    /// into `EngineCrash` with the retained log tail.
    pub fn wait(&mut self) -> Result<i32, SupervisorError> {
        loop {
            match self.events.recv() {
                Ok(EngineEvent::Exit(0)) => return Ok(0),
                Ok(EngineEvent::Exit(code)) => {
                    return Err(SupervisorError::EngineCrash {
                        code,
                        log_tail: self.log_tail(),
                    })
                }
                Ok(_) => continue,
                Err(_) => {
                    log_error("Engine event stream closed without an exit event");
                    return Err(SupervisorError::EngineCrash {
                        code: -1,
                        log_tail: self.log_tail(),
                    });
                }
            }
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str) -> EngineCommand {
        EngineCommand::new("/bin/sh").arg("-c").arg(script)
    }

    #[test]
    fn stream_ends_with_single_exit_event() {
        let handle = sh("echo 'Installing: [1/2] a.7z'; echo 'Installing complete'")
            .spawn()
            .unwrap();

        let events: Vec<EngineEvent> = handle.events().iter().collect();
        assert_eq!(
            events.iter().filter(|e| matches!(e, EngineEvent::Exit(_))).count(),
            1
        );
        assert_eq!(events.last(), Some(&EngineEvent::Exit(0)));
        assert!(events.contains(&EngineEvent::PhaseComplete("Installing".to_string())));
    }

    #[test]
    fn nonzero_exit_becomes_crash_with_log_tail() {
        let mut handle = sh("echo 'something went sideways' >&2; exit 3")
            .spawn()
            .unwrap();

        match handle.wait() {
            Err(SupervisorError::EngineCrash { code: 3, log_tail }) => {
                assert!(log_tail.iter().any(|l| l.contains("sideways")));
            }
            other => panic!("expected crash, got {:?}", other),
        }
    }

    #[test]
    fn cancel_kills_the_whole_group_promptly() {
        let mut handle = sh("sleep 300 & sleep 300")
            .kill_grace(Duration::from_millis(200))
            .spawn()
            .unwrap();

        thread::sleep(Duration::from_millis(100));
        let started = Instant::now();
        handle.cancel();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(handle.is_cancelled());

        // Idempotent.
        handle.cancel();
    }

    #[test]
    fn scratch_dir_is_removed_after_normal_exit() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("scratch");
        fs::create_dir_all(scratch.join("partial")).unwrap();

        let mut handle = sh("true").scratch_dir(&scratch).spawn().unwrap();
        handle.wait().unwrap();
        assert!(!scratch.exists());
    }

    #[test]
    fn scratch_dir_is_removed_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("scratch");
        fs::create_dir_all(&scratch).unwrap();

        let mut handle = sh("sleep 300")
            .kill_grace(Duration::from_millis(200))
            .scratch_dir(&scratch)
            .spawn()
            .unwrap();
        thread::sleep(Duration::from_millis(100));
        handle.cancel();
        assert!(!scratch.exists());
    }

    #[test]
    fn spawn_failure_names_the_program() {
        let Err(err) = EngineCommand::new("/nonexistent/engine-binary").spawn() else {
            panic!("spawn of a missing binary succeeded");
        };
        match err {
            SupervisorError::Spawn { program, .. } => {
                assert!(program.contains("engine-binary"));
            }
            other => panic!("expected spawn error, got {:?}", other),
        }
    }
}
