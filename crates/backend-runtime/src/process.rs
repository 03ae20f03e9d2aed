//! Child process supervision
//!
//! Starts backend server executables with extra environment and working
//! directory, relays their output into the log, and stops them with a
//! graceful-then-forceful sequence.

use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::constants::{probes, timeouts};
use crate::error::{BackendError, Result};

/// How a backend process is launched
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub working_dir: Option<PathBuf>,
    /// Pass stdout/stderr straight through instead of relaying into the log
    pub inherit_output: bool,
    /// Drop readiness-probe request lines from relayed output
    pub filter_health_logs: bool,
    /// Extra environment variables, applied on top of the parent's
    pub env: Vec<(String, String)>,
}

impl LaunchOptions {
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Handle to a running child process; clones share the same process
#[derive(Clone)]
pub struct ProcessHandle {
    name: String,
    pid: u32,
    child: Arc<Mutex<Option<Child>>>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("name", &self.name)
            .field("pid", &self.pid)
            .finish()
    }
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        match self.child.lock().as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Exit code, once the process has exited
    pub fn exit_code(&self) -> Option<i32> {
        self.child
            .lock()
            .as_mut()
            .and_then(|child| child.try_wait().ok().flatten())
            .and_then(|status| status.code())
    }

    /// Terminate the process and reap it. Safe to call repeatedly.
    pub fn stop(&self) {
        let Some(mut child) = self.child.lock().take() else {
            return;
        };

        if let Ok(Some(status)) = child.try_wait() {
            log::debug!("{} (PID: {}) already exited: {}", self.name, self.pid, status);
            return;
        }

        log::debug!("Stopping {} (PID: {})", self.name, self.pid);

        #[cfg(unix)]
        {
            let _ = Command::new("kill")
                .arg("-TERM")
                .arg(self.pid.to_string())
                .status();

            let deadline = Instant::now() + Duration::from_millis(timeouts::STOP_GRACE_MS);
            while Instant::now() < deadline {
                if let Ok(Some(_)) = child.try_wait() {
                    log::debug!("{} stopped", self.name);
                    return;
                }
                std::thread::sleep(Duration::from_millis(25));
            }
            log::warn!("{} didn't exit gracefully, forcing kill", self.name);
        }

        if let Err(e) = child.kill() {
            log::warn!("Failed to kill {}: {}", self.name, e);
        }
        let _ = child.wait();
        log::debug!("{} stopped", self.name);
    }
}

/// Starts backend processes
pub struct ProcessSupervisor;

impl ProcessSupervisor {
    pub fn start(
        name: &str,
        executable: &Path,
        args: &[String],
        options: &LaunchOptions,
    ) -> Result<ProcessHandle> {
        log::info!("Starting {}: {:?} {}", name, executable, args.join(" "));

        let mut cmd = Command::new(executable);
        cmd.args(args).stdin(Stdio::null());
        if let Some(dir) = &options.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &options.env {
            log::debug!("{}: {}={}", name, key, value);
            cmd.env(key, value);
        }

        if options.inherit_output {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| BackendError::ProcessSpawn(format!("{}: {}", name, e)))?;
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            relay_output(name, stdout, options.filter_health_logs);
        }
        if let Some(stderr) = child.stderr.take() {
            relay_output(name, stderr, options.filter_health_logs);
        }

        log::info!("{} started (PID: {})", name, pid);
        Ok(ProcessHandle {
            name: name.to_string(),
            pid,
            child: Arc::new(Mutex::new(Some(child))),
        })
    }
}

fn relay_output<R: Read + Send + 'static>(name: &str, stream: R, filter_health_logs: bool) {
    let name = name.to_string();
    std::thread::spawn(move || {
        for line in BufReader::new(stream).lines() {
            let Ok(line) = line else { break };
            if filter_health_logs && is_probe_line(&line) {
                continue;
            }
            log::debug!("[{}] {}", name, line);
        }
    });
}

fn is_probe_line(line: &str) -> bool {
    line.contains(&format!("GET {}", probes::HEALTH))
        || line.contains(&format!("GET {}", probes::MODEL_TAGS))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    fn wait_until_exit(handle: &ProcessHandle) {
        for _ in 0..200 {
            if !handle.is_running() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("{} never exited", handle.name());
    }

    #[test]
    fn test_start_and_stop() {
        let handle = ProcessSupervisor::start(
            "sleeper",
            Path::new("/bin/sh"),
            &sh("exec sleep 30"),
            &LaunchOptions::default(),
        )
        .unwrap();
        assert!(handle.is_running());
        assert!(handle.pid() > 0);

        let started = Instant::now();
        handle.stop();
        assert!(!handle.is_running());
        assert!(started.elapsed() < Duration::from_secs(5));

        // Idempotent
        handle.stop();
        handle.clone().stop();
    }

    #[test]
    fn test_missing_executable() {
        let err = ProcessSupervisor::start(
            "ghost",
            Path::new("/nonexistent/server"),
            &[],
            &LaunchOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, BackendError::ProcessSpawn(_)));
    }

    #[test]
    fn test_env_and_working_dir_are_applied() {
        let tmp = tempfile::tempdir().unwrap();
        let options = LaunchOptions {
            working_dir: Some(tmp.path().to_path_buf()),
            ..Default::default()
        }
        .with_env("LD_LIBRARY_PATH", "/opt/backend/lib");

        let handle = ProcessSupervisor::start(
            "env-check",
            Path::new("/bin/sh"),
            &sh("echo \"$LD_LIBRARY_PATH\" > seen.txt"),
            &options,
        )
        .unwrap();
        wait_until_exit(&handle);

        assert_eq!(handle.exit_code(), Some(0));
        let seen = std::fs::read_to_string(tmp.path().join("seen.txt")).unwrap();
        assert_eq!(seen.trim(), "/opt/backend/lib");
    }

    #[test]
    fn test_exit_code_is_reported() {
        let handle = ProcessSupervisor::start(
            "crasher",
            Path::new("/bin/sh"),
            &sh("echo 'GET /health 200'; exit 3"),
            &LaunchOptions {
                filter_health_logs: true,
                ..Default::default()
            },
        )
        .unwrap();
        wait_until_exit(&handle);
        assert_eq!(handle.exit_code(), Some(3));
        handle.stop();
    }

    #[test]
    fn test_probe_lines_are_recognized() {
        assert!(is_probe_line("srv  log_server_r: request: GET /health 127.0.0.1 200"));
        assert!(is_probe_line("[GIN] GET /api/tags"));
        assert!(!is_probe_line("POST /v1/chat/completions"));
    }
}
