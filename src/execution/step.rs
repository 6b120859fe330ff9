//! Node Execution
//!
//! Runs a single rendered node:
//! - Output and log directory creation
//! - Script generation under `<workdir>/.daijin/scripts`
//! - `bash` launch in the node's working directory, stdout and stderr
//!   appended to the node log
//! - Cancellation through a watch channel
//!
//! On unix each node runs as the leader of its own process group, so a
//! cancelled node takes every tool its script started down with it.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use log::{debug, error};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::watch;

use crate::error::{EngineError, Result};
use crate::workflow::graph::NodeIndex;

use super::template::RenderedCommand;

/// Environment variable carrying the node's thread allocation.
pub const THREADS_ENV: &str = "DAIJIN_THREADS";

/// How long a cancelled process group gets between SIGTERM and SIGKILL.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Everything a spawned task needs to run one node.
#[derive(Debug, Clone)]
pub struct NodeJob {
    pub index: NodeIndex,
    /// Display name, e.g. `align[chunk=002]`
    pub name: String,
    /// File-name friendly name, e.g. `align_002`
    pub stem: String,
    pub command: RenderedCommand,
    pub outputs: Vec<PathBuf>,
    pub script_dir: PathBuf,
}

/// How a launched process ended.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeOutcome {
    pub exit_code: Option<i32>,
    pub success: bool,
    pub cancelled: bool,
    pub elapsed: Duration,
}

/// Runs a node to completion or until `cancel` flips to true.
///
/// Errors cover launch problems only (unwritable script, missing bash);
/// a non-zero exit is reported through [`NodeOutcome::success`].
pub async fn execute_node(job: &NodeJob, mut cancel: watch::Receiver<bool>) -> Result<NodeOutcome> {
    let started = Instant::now();
    let launch_error = |reason: String| EngineError::NodeExecution {
        node: job.name.clone(),
        reason,
    };

    ensure_output_directories(&job.outputs).await?;
    fs::create_dir_all(&job.command.working_dir).await.map_err(|e| {
        launch_error(format!(
            "cannot create working directory {}: {}",
            job.command.working_dir.display(),
            e
        ))
    })?;

    let script_path = create_execution_script(&job.script_dir, &job.stem, &job.command.script)
        .await
        .map_err(|e| launch_error(format!("cannot write script: {}", e)))?;
    let log = open_log(&job.command.log_path, &job.name)
        .await
        .map_err(|e| launch_error(format!("cannot open log {}: {}", job.command.log_path.display(), e)))?;
    let log_err = log.try_clone()?;

    let mut cmd = Command::new("bash");
    cmd.arg(&script_path)
        .current_dir(&job.command.working_dir)
        .env(THREADS_ENV, job.command.threads.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    debug!(
        "Executing '{}' in {} (script {})",
        job.name,
        job.command.working_dir.display(),
        script_path.display()
    );

    let mut child = cmd
        .spawn()
        .map_err(|e| launch_error(format!("failed to launch bash: {}", e)))?;

    tokio::select! {
        status = child.wait() => {
            let status = status.map_err(|e| launch_error(format!("failed waiting for process: {}", e)))?;
            let outcome = NodeOutcome {
                exit_code: status.code(),
                success: status.success(),
                cancelled: false,
                elapsed: started.elapsed(),
            };
            if !outcome.success {
                error!(
                    "'{}' failed with exit code {:?}; see {}",
                    job.name,
                    outcome.exit_code,
                    job.command.log_path.display()
                );
            }
            Ok(outcome)
        }
        _ = wait_for_cancel(&mut cancel) => {
            debug!("Cancelling '{}'", job.name);
            terminate(&mut child, &job.name).await;
            Ok(NodeOutcome {
                exit_code: None,
                success: false,
                cancelled: true,
                elapsed: started.elapsed(),
            })
        }
    }
}

async fn wait_for_cancel(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            // Sender gone: no cancellation can arrive any more
            std::future::pending::<()>().await;
        }
    }
}

/// Stops a node's whole process tree and reaps the child.
///
/// The group gets SIGTERM first, then SIGKILL once the grace period ends or
/// the leader exits, whichever is first. Leftover group members are killed
/// either way.
async fn terminate(child: &mut Child, name: &str) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        signal_group(pid, libc::SIGTERM);
        let exited = tokio::time::timeout(TERMINATE_GRACE, child.wait()).await.is_ok();
        signal_group(pid, libc::SIGKILL);
        if exited {
            return;
        }
    }

    if let Err(e) = child.kill().await {
        error!("Failed to kill '{}': {}", name, e);
    }
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: libc::c_int) {
    // SAFETY: killpg only delivers a signal. The group id is the pid of a
    // child spawned with process_group(0), so it names that child's group.
    let rc = unsafe { libc::killpg(pgid as libc::pid_t, signal) };
    if rc != 0 {
        debug!(
            "killpg({}, {}) failed: {}",
            pgid,
            signal,
            std::io::Error::last_os_error()
        );
    }
}

/// Creates parent directories for output files.
async fn ensure_output_directories(outputs: &[PathBuf]) -> Result<()> {
    for output in outputs {
        if let Some(parent) = output.parent() {
            if fs::metadata(parent).await.is_err() {
                fs::create_dir_all(parent).await?;
                debug!("Created directory: {}", parent.display());
            }
        }
    }
    Ok(())
}

/// Writes the bash script for a node.
async fn create_execution_script(script_dir: &Path, stem: &str, command_text: &str) -> std::io::Result<PathBuf> {
    fs::create_dir_all(script_dir).await?;

    let script_path = script_dir.join(format!("{}.sh", stem));
    let content = format!("#!/bin/bash\nset -e\n{}\n", command_text);
    fs::write(&script_path, content).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755)).await?;
    }

    Ok(script_path)
}

async fn open_log(path: &Path, name: &str) -> std::io::Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path).await?;
    let header = format!("# {} started {}\n", name, chrono::Local::now().to_rfc3339());
    file.write_all(header.as_bytes()).await?;
    file.flush().await?;
    Ok(file.into_std().await)
}
