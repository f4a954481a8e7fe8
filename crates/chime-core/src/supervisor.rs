//! Core process supervision.
//!
//! Finds Core executables in the data directory, asks each one who it is,
//! launches them with bus connection details, distributes their config
//! sections as retained messages, and shuts everything down cleanly on exit.

use crate::bus::BusHandle;
use crate::config::HubConfig;
use crate::error::{HubError, HubResult};
use crate::topics::CORE_MARKER;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{info, warn};
use walkdir::WalkDir;

/// How long a Core gets to answer `--identify true` before it is skipped.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);
/// How long a Core gets to exit after the interrupt before it is killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// What a Core reports about itself when probed.
#[derive(Debug, Clone, Deserialize)]
pub struct CoreIdentity {
    pub id: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// One Core under supervision. External Cores have no process handle; the
/// hub only distributes their config and lists them in the roster.
pub struct ManagedCore {
    pub identity: CoreIdentity,
    pub path: Option<PathBuf>,
    child: Option<Child>,
}

pub struct Supervisor {
    bus: BusHandle,
    config: HubConfig,
    cores: Vec<ManagedCore>,
}

impl Supervisor {
    pub fn new(bus: BusHandle, config: HubConfig) -> Self {
        Self {
            bus,
            config,
            cores: Vec::new(),
        }
    }

    /// Discover, identify, launch, and register every Core.
    ///
    /// A single broken executable is logged and skipped rather than failing
    /// the whole startup; one misbehaving Core must not take the device
    /// offline.
    pub async fn start(&mut self, core_dir: &Path) -> HubResult<()> {
        let paths = discover_cores(core_dir);
        info!(count = paths.len(), dir = %core_dir.display(), "discovered core executables");

        for identity_result in identify_all(paths).await {
            match identity_result {
                Ok((identity, path)) => {
                    info!(core = %identity.id, roles = ?identity.roles, "identified core");
                    self.cores.push(ManagedCore {
                        identity,
                        path: Some(path),
                        child: None,
                    });
                }
                Err(e) => warn!(error = %e, "skipping core"),
            }
        }

        for external in &self.config.orchestrator.external_cores {
            info!(core = %external.id, "registering external core");
            self.cores.push(ManagedCore {
                identity: CoreIdentity {
                    id: external.id.clone(),
                    roles: Vec::new(),
                },
                path: None,
                child: None,
            });
        }

        // Config goes out before anything launches, so a Core's read of its
        // retained central config always succeeds.
        for core in &self.cores {
            self.bus
                .publish_central_config(&core.identity.id, &self.config.core_section(&core.identity.id))
                .await?;
        }

        for core in &mut self.cores {
            let Some(path) = &core.path else { continue };
            match launch(path, &self.config) {
                Ok(child) => {
                    info!(core = %core.identity.id, path = %path.display(), "launched core");
                    core.child = Some(child);
                }
                Err(e) => warn!(core = %core.identity.id, error = %e, "core failed to launch"),
            }
        }

        let roster: Vec<String> = self.cores.iter().map(|c| c.identity.id.clone()).collect();
        self.bus.publish_core_list(roster).await?;
        Ok(())
    }

    /// Interrupt every launched Core, wait for it to exit, and tombstone the
    /// retained topics this device owns. Shutdown failures are logged, never
    /// propagated; one stuck Core must not block the rest from stopping.
    pub async fn shutdown(&mut self) {
        for core in &mut self.cores {
            let Some(mut child) = core.child.take() else { continue };
            let id = core.identity.id.clone();
            info!(core = %id, "stopping core");

            if let Err(e) = interrupt(&child) {
                warn!(core = %id, error = %e, "interrupt failed, killing");
                let _ = child.start_kill();
            }
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(Ok(status)) => info!(core = %id, %status, "core exited"),
                Ok(Err(e)) => warn!(core = %id, error = %e, "failed to reap core"),
                Err(_) => {
                    warn!(core = %id, "core ignored the interrupt, killing");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }

        if let Err(e) = self.bus.clear_retained().await {
            warn!(error = %e, "failed to clear retained topics");
        }
    }

    /// Ids of every supervised Core, locally launched and external alike.
    pub fn roster(&self) -> Vec<String> {
        self.cores.iter().map(|c| c.identity.id.clone()).collect()
    }
}

/// Walk `dir` for files carrying the Core marker in their name.
fn discover_cores(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(error = %e, "unreadable entry while scanning for cores");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.contains(CORE_MARKER))
        })
        .map(|entry| entry.into_path())
        .collect()
}

/// Probe every discovered path concurrently, fanning results back in.
async fn identify_all(paths: Vec<PathBuf>) -> Vec<HubResult<(CoreIdentity, PathBuf)>> {
    let expected = paths.len();
    let (tx, mut rx) = mpsc::unbounded_channel();
    for path in paths {
        let tx = tx.clone();
        tokio::spawn(async move {
            let result = identify(&path).await.map(|identity| (identity, path));
            let _ = tx.send(result);
        });
    }
    drop(tx);

    let mut results = Vec::with_capacity(expected);
    while let Some(result) = rx.recv().await {
        results.push(result);
    }
    results
}

/// Ask a Core who it is.
///
/// The canonical protocol is `--identify true` printing a JSON object with
/// `id` and `roles`. Older Cores predate the probe and encode both in their
/// file name instead; when the probe fails, the name is tried before giving
/// up on the path.
pub async fn identify(path: &Path) -> HubResult<CoreIdentity> {
    if !is_executable(path) {
        if let Some(identity) = parse_core_filename(path) {
            return Err(HubError::CoreNotExecutable {
                path: format!("{} ({})", path.display(), identity.id),
            });
        }
        return Err(HubError::CoreNotExecutable {
            path: path.display().to_string(),
        });
    }

    let probe = tokio::time::timeout(
        IDENTIFY_TIMEOUT,
        Command::new(path)
            .arg("--identify")
            .arg("true")
            .kill_on_drop(true)
            .output(),
    )
    .await;

    let probe_failure = match probe {
        Ok(Ok(output)) if output.status.success() => {
            match serde_json::from_slice::<CoreIdentity>(&output.stdout) {
                Ok(identity) => return Ok(identity),
                Err(e) => format!("unparseable identify output: {e}"),
            }
        }
        Ok(Ok(output)) => format!("identify exited with {}", output.status),
        Ok(Err(e)) => format!("failed to spawn: {e}"),
        Err(_) => "identify timed out".to_string(),
    };

    if let Some(identity) = parse_core_filename(path) {
        info!(path = %path.display(), core = %identity.id, "identify probe failed, using filename convention");
        return Ok(identity);
    }

    Err(HubError::CoreIdentify {
        path: path.display().to_string(),
        reason: probe_failure,
    })
}

/// Legacy naming convention: `{id}_bb_core_{role}[_{role}...]{ext}`.
fn parse_core_filename(path: &Path) -> Option<CoreIdentity> {
    let stem = path.file_stem()?.to_str()?;
    let marker = format!("_{CORE_MARKER}_");
    let (id, roles) = stem.split_once(&marker)?;
    if id.is_empty() || roles.is_empty() {
        return None;
    }
    Some(CoreIdentity {
        id: id.to_string(),
        roles: roles.split('_').map(str::to_string).collect(),
    })
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.permissions().mode() & 0o100 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    true
}

/// Launch a Core with the bus connection details on its command line.
fn launch(path: &Path, config: &HubConfig) -> HubResult<Child> {
    let mut command = Command::new(path);
    command
        .arg("--device-id")
        .arg(&config.device_id)
        .arg("--host")
        .arg(&config.bus.host)
        .arg("--port")
        .arg(config.bus.port.to_string());
    if config.bus.authenticated() {
        command
            .arg("--user")
            .arg(&config.bus.user)
            .arg("--pass")
            .arg(&config.bus.password);
    }
    command.kill_on_drop(true).spawn().map_err(|e| HubError::CoreLaunch {
        id: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// Ask a Core to stop. Unix Cores get SIGINT so their own cleanup handlers
/// run; elsewhere the process is simply killed.
#[cfg(unix)]
fn interrupt(child: &Child) -> HubResult<()> {
    let Some(pid) = child.id() else {
        return Ok(());
    };
    // Safety: sends a signal to a pid we own; no memory is touched.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) };
    if rc == 0 {
        Ok(())
    } else {
        Err(HubError::CoreLaunch {
            id: pid.to_string(),
            reason: std::io::Error::last_os_error().to_string(),
        })
    }
}

#[cfg(not(unix))]
fn interrupt(_child: &Child) -> HubResult<()> {
    Err(HubError::CoreLaunch {
        id: String::new(),
        reason: "no interrupt mechanism on this platform".to_string(),
    })
}
