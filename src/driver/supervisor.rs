//! Browser worker supervision.
//!
//! Launches the browser child process in its own process group, probes the
//! debugging port for readiness, and recycles the process on an interval.
//! In-flight transactions hold the read lock; recycles take the write lock,
//! so a recycle waits for running transactions and blocks new ones.

use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{RwLock, RwLockReadGuard};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::DriverError;

const READY_PROBE_ATTEMPTS: u32 = 5;
const READY_PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// Supervisor configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the browser binary.
    pub binary_path: String,
    /// Arguments for launching the browser.
    pub binary_args: Vec<String>,
    /// `host:port` of the remote debugging endpoint, probed for readiness.
    pub debug_address: String,
    /// How often the child process is killed and relaunched.
    pub recycle_interval: Duration,
}

/// Keeps one browser worker process alive and periodically recycled.
pub struct Supervisor {
    config: Config,
    lock: RwLock<()>,
    child: Mutex<Option<tokio::process::Child>>,
    shutdown: CancellationToken,
}

impl Supervisor {
    /// Launch the worker and start the recycle loop.
    pub async fn start(config: Config) -> Result<std::sync::Arc<Self>, DriverError> {
        let supervisor = std::sync::Arc::new(Self {
            config,
            lock: RwLock::new(()),
            child: Mutex::new(None),
            shutdown: CancellationToken::new(),
        });

        supervisor.launch().await?;

        let recycler = supervisor.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = recycler.shutdown.cancelled() => {
                        recycler.kill_current().await;
                        break;
                    }
                    _ = tokio::time::sleep(recycler.config.recycle_interval) => {}
                }

                let _exclusive = recycler.lock.write().await;
                info!(binary = %recycler.config.binary_path, "recycling browser worker");
                recycler.kill_current().await;
                if let Err(e) = recycler.launch().await {
                    error!("failed to relaunch browser worker: {e}");
                }
            }
        });

        Ok(supervisor)
    }

    /// Take the read lock for the duration of a transaction run.
    pub async fn acquire(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read().await
    }

    /// Kill the worker and stop the recycle loop.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    async fn launch(&self) -> Result<(), DriverError> {
        let mut command = std::process::Command::new(&self.config.binary_path);
        command
            .args(&self.config.binary_args)
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // Own process group, so the whole subtree can be reaped at once.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let child = tokio::process::Command::from(command)
            .spawn()
            .map_err(|e| DriverError::WorkerNotReady(format!("spawn failed: {e}")))?;

        info!(
            binary = %self.config.binary_path,
            pid = child.id(),
            "launched browser worker"
        );
        *self.child.lock().expect("supervisor lock poisoned") = Some(child);

        self.await_ready().await
    }

    /// Probe the debugging port until it accepts connections.
    async fn await_ready(&self) -> Result<(), DriverError> {
        for attempt in 1..=READY_PROBE_ATTEMPTS {
            match TcpStream::connect(&self.config.debug_address).await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    warn!(
                        address = %self.config.debug_address,
                        attempt,
                        "browser worker not reachable yet: {e}"
                    );
                }
            }
            tokio::time::sleep(READY_PROBE_INTERVAL).await;
        }

        Err(DriverError::WorkerNotReady(format!(
            "no listener on {} after {} attempts",
            self.config.debug_address, READY_PROBE_ATTEMPTS
        )))
    }

    async fn kill_current(&self) {
        let child = self
            .child
            .lock()
            .expect("supervisor lock poisoned")
            .take();

        if let Some(mut child) = child {
            if let Some(pid) = child.id() {
                #[cfg(unix)]
                // The child leads its own process group.
                unsafe {
                    libc::killpg(pid as i32, libc::SIGKILL);
                }
                #[cfg(not(unix))]
                let _ = child.start_kill();
            }
            let _ = child.wait().await;
        }
    }
}
