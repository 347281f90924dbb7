//! Validated, atomic configuration reloads
//!
//! A candidate configuration is staged next to the active file, checked with
//! the engine's own validator, renamed over the active file, and only then is
//! the engine told to reload. A rejected candidate never touches the active
//! file.

use crate::config::EngineConfig;
use crate::error::ReloadError;
use crate::reconciler::TriggerSource;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Number of reload records kept for inspection
const HISTORY_LIMIT: usize = 32;

/// Placeholder replaced by a configuration path in engine commands
const CONFIG_PLACEHOLDER: &str = "{config}";

/// The external serving engine's validate and reload hooks
#[async_trait]
pub trait ServingEngine: Send + Sync {
    /// Check a candidate configuration file without applying it
    async fn validate(&self, candidate: &Path) -> Result<(), ReloadError>;

    /// Make the engine pick up the active configuration file
    async fn reload(&self, active: &Path) -> Result<(), ReloadError>;
}

/// Drives the engine through shell commands such as `nginx -t` and `nginx -s reload`
pub struct CommandEngine {
    validate_command: String,
    reload_command: String,
    timeout: Duration,
}

impl CommandEngine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            validate_command: config.validate_command.clone(),
            reload_command: config.reload_command.clone(),
            timeout: config.command_timeout(),
        }
    }

    /// Run a command template; `Ok(Err(output))` means the command ran and failed
    async fn run(&self, template: &str, path: &Path) -> Result<Result<(), String>, ReloadError> {
        let path = path.to_string_lossy();
        let words: Vec<String> = shell_words::split(template)
            .map_err(|e| ReloadError::Engine {
                command: template.to_string(),
                reason: e.to_string(),
            })?
            .into_iter()
            .map(|word| word.replace(CONFIG_PLACEHOLDER, &path))
            .collect();

        let Some((program, args)) = words.split_first() else {
            return Err(ReloadError::Engine {
                command: template.to_string(),
                reason: "empty command".to_string(),
            });
        };

        debug!(program, ?args, "Running engine command");

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, output).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ReloadError::Engine {
                    command: program.clone(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(ReloadError::Engine {
                    command: program.clone(),
                    reason: format!("timed out after {:?}", self.timeout),
                })
            }
        };

        if output.status.success() {
            return Ok(Ok(()));
        }

        let mut message = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if message.is_empty() {
            message = String::from_utf8_lossy(&output.stdout).trim().to_string();
        }
        if message.is_empty() {
            message = format!("exited with {}", output.status);
        }
        Ok(Err(message))
    }
}

#[async_trait]
impl ServingEngine for CommandEngine {
    async fn validate(&self, candidate: &Path) -> Result<(), ReloadError> {
        self.run(&self.validate_command, candidate)
            .await?
            .map_err(ReloadError::Validation)
    }

    async fn reload(&self, active: &Path) -> Result<(), ReloadError> {
        self.run(&self.reload_command, active)
            .await?
            .map_err(ReloadError::Reload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadOutcome {
    Applied,
    Rejected,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReloadRecord {
    pub generation: u64,
    pub trigger: TriggerSource,
    pub at: DateTime<Utc>,
    pub outcome: ReloadOutcome,
    /// Why the configuration was rejected
    pub reason: Option<String>,
}

struct PendingApply {
    generation: u64,
    trigger: TriggerSource,
    text: String,
}

#[derive(Default)]
struct AppliedState {
    /// Last generation the engine is known to run, `None` before the first apply
    generation: Option<u64>,
    /// Digest of the active configuration file
    digest: Option<String>,
}

/// Owns the active configuration file and the applied generation
pub struct ReloadCoordinator {
    engine: Arc<dyn ServingEngine>,
    config_path: PathBuf,
    pending: Mutex<Option<PendingApply>>,
    applied: tokio::sync::Mutex<AppliedState>,
    /// Copy of the applied generation for readers that must not wait on a reload
    applied_generation: AtomicU64,
    history: Mutex<VecDeque<ReloadRecord>>,
}

impl ReloadCoordinator {
    pub fn new(engine: Arc<dyn ServingEngine>, config_path: impl Into<PathBuf>) -> Self {
        let config_path = config_path.into();
        // An identical file left by a previous run does not need a reload
        let digest = std::fs::read(&config_path).ok().map(|data| digest(&data));

        Self {
            engine,
            config_path,
            pending: Mutex::new(None),
            applied: tokio::sync::Mutex::new(AppliedState {
                generation: None,
                digest,
            }),
            applied_generation: AtomicU64::new(0),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_LIMIT)),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Highest generation the engine is running (0 until the first apply)
    pub fn applied_generation(&self) -> u64 {
        self.applied_generation.load(Ordering::Acquire)
    }

    /// Recent reload attempts, oldest first
    pub fn history(&self) -> Vec<ReloadRecord> {
        self.history.lock().iter().cloned().collect()
    }

    /// Validate and apply `text` as `generation`
    ///
    /// Returns `Ok(true)` when this call swapped in a new configuration and
    /// reloaded the engine, `Ok(false)` when there was nothing to do (the
    /// generation is already applied, the content is unchanged, or a
    /// concurrent caller applied a newer request), and an error when the
    /// candidate was rejected or the engine could not be reloaded. Requests
    /// that queue up behind a running apply collapse into the newest one.
    pub async fn apply(
        &self,
        text: String,
        generation: u64,
        trigger: TriggerSource,
    ) -> Result<bool, ReloadError> {
        {
            let mut pending = self.pending.lock();
            let superseded = pending
                .as_ref()
                .map_or(false, |queued| queued.generation >= generation);
            if !superseded {
                *pending = Some(PendingApply {
                    generation,
                    trigger,
                    text,
                });
            }
        }

        let mut applied = self.applied.lock().await;

        let Some(request) = self.pending.lock().take() else {
            debug!(generation, "Reload request was handled by a concurrent apply");
            return Ok(false);
        };

        let already_applied = applied
            .generation
            .map_or(false, |current| request.generation <= current);
        if already_applied {
            debug!(
                generation = request.generation,
                applied = ?applied.generation,
                "Generation already applied, skipping reload"
            );
            return Ok(false);
        }

        let new_digest = digest(request.text.as_bytes());
        if applied.digest.as_deref() == Some(new_digest.as_str()) {
            debug!(generation = request.generation, "Configuration unchanged, skipping reload");
            self.mark_applied(&mut applied, request.generation);
            return Ok(false);
        }

        match self.swap_in(&request).await {
            Ok(()) => {}
            Err(e @ ReloadError::Reload(_)) | Err(e @ ReloadError::Engine { .. })
                if self.is_active(&new_digest) =>
            {
                // The file is in place but the engine did not pick it up
                applied.digest = None;
                error!(generation = request.generation, error = %e, "Serving engine reload failed");
                self.record(&request, ReloadOutcome::Rejected, Some(e.to_string()));
                return Err(e);
            }
            Err(e) => {
                warn!(
                    generation = request.generation,
                    error = %e,
                    "Configuration rejected, previous configuration stays active"
                );
                self.record(&request, ReloadOutcome::Rejected, Some(e.to_string()));
                return Err(e);
            }
        }

        self.mark_applied(&mut applied, request.generation);
        applied.digest = Some(new_digest);
        self.record(&request, ReloadOutcome::Applied, None);
        info!(
            generation = request.generation,
            trigger = ?request.trigger,
            path = %self.config_path.display(),
            "Configuration applied and engine reloaded"
        );
        Ok(true)
    }

    fn mark_applied(&self, applied: &mut AppliedState, generation: u64) {
        applied.generation = Some(generation);
        self.applied_generation.store(generation, Ordering::Release);
    }

    /// Stage, validate, rename over the active file, reload
    async fn swap_in(&self, request: &PendingApply) -> Result<(), ReloadError> {
        let dir = match self.config_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let mut staged = tempfile::Builder::new()
            .prefix(".dockgate-")
            .suffix(".conf")
            .tempfile_in(&dir)?;
        staged.write_all(request.text.as_bytes())?;
        staged.as_file().sync_all()?;

        self.engine.validate(staged.path()).await?;

        staged
            .persist(&self.config_path)
            .map_err(|e| ReloadError::Stage(e.error))?;

        self.engine.reload(&self.config_path).await
    }

    fn is_active(&self, expected: &str) -> bool {
        std::fs::read(&self.config_path)
            .map(|data| digest(&data) == expected)
            .unwrap_or(false)
    }

    fn record(&self, request: &PendingApply, outcome: ReloadOutcome, reason: Option<String>) {
        let mut history = self.history.lock();
        if history.len() == HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(ReloadRecord {
            generation: request.generation,
            trigger: request.trigger,
            at: Utc::now(),
            outcome,
            reason,
        });
    }
}

fn digest(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
