//! Object auditor
//!
//! Runs audit passes over all devices: one blocking worker per device
//! group, up to the configured concurrency, plus an optional zero-byte-file
//! worker alongside them.

use crate::worker::{AuditReport, AuditType, AuditorWorker};
use anyhow::Result;
use objectio_common::AuditorConfig;
use objectio_diskfile::DiskFileManager;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Shared stop signal for the auditor and its workers
#[derive(Debug, Default)]
pub struct Shutdown {
    requested: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn trigger(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Resolve once [`Self::trigger`] has been called
    pub async fn wait(&self) {
        let notified = self.notify.notified();
        if self.is_triggered() {
            return;
        }
        notified.await;
    }
}

/// Object auditor daemon
#[derive(Debug)]
pub struct ObjectAuditor {
    manager: DiskFileManager,
    config: AuditorConfig,
    shutdown: Arc<Shutdown>,
}

impl ObjectAuditor {
    #[must_use]
    pub fn new(manager: DiskFileManager, config: AuditorConfig) -> Self {
        Self {
            manager,
            config,
            shutdown: Arc::new(Shutdown::default()),
        }
    }

    /// Handle used to stop the auditor from outside
    #[must_use]
    pub fn shutdown(&self) -> Arc<Shutdown> {
        Arc::clone(&self.shutdown)
    }

    /// Split the devices to audit into at most `concurrency` groups
    #[must_use]
    pub fn device_groups(&self, device_dirs: Option<&[String]>) -> Vec<Vec<String>> {
        let mut devices: Vec<String> = match device_dirs {
            Some(dirs) if !dirs.is_empty() => dirs.to_vec(),
            _ => std::fs::read_dir(&self.manager.config().devices)
                .map(|entries| {
                    entries
                        .filter_map(|e| e.ok())
                        .filter(|e| e.path().is_dir())
                        .map(|e| e.file_name().to_string_lossy().into_owned())
                        .collect()
                })
                .unwrap_or_default(),
        };
        devices.sort_unstable();

        let groups = self.config.concurrency.clamp(1, devices.len().max(1));
        let mut split = vec![Vec::new(); groups];
        for (i, device) in devices.into_iter().enumerate() {
            split[i % groups].push(device);
        }
        split.retain(|g| !g.is_empty());
        split
    }

    /// One audit pass.
    ///
    /// With `zero_byte_fps` only a zero-byte pass at that rate runs.
    /// Otherwise full-read workers run, joined by a zero-byte worker when
    /// `zero_byte_files_per_second` is set.
    pub async fn run_once(
        &self,
        zero_byte_fps: Option<f64>,
        device_dirs: Option<Vec<String>>,
    ) -> Result<Vec<AuditReport>> {
        self.run_audit("once", zero_byte_fps, device_dirs).await
    }

    async fn run_audit(
        &self,
        mode: &'static str,
        zero_byte_fps: Option<f64>,
        device_dirs: Option<Vec<String>>,
    ) -> Result<Vec<AuditReport>> {
        let mut tasks = JoinSet::new();
        let device_dirs = device_dirs.or_else(|| {
            (!self.config.device_dirs.is_empty()).then(|| self.config.device_dirs.clone())
        });

        if let Some(fps) = zero_byte_fps {
            let config = AuditorConfig {
                zero_byte_files_per_second: fps,
                ..self.config.clone()
            };
            self.spawn_worker(&mut tasks, &config, AuditType::ZeroByteFile, device_dirs, mode);
        } else {
            let groups = self.device_groups(device_dirs.as_deref());
            if groups.is_empty() {
                warn!(
                    "No devices to audit under {}",
                    self.manager.config().devices.display()
                );
            }
            let parallel = groups.len() > 1 || device_dirs.is_some();
            for group in groups {
                let dirs = parallel.then_some(group);
                self.spawn_worker(&mut tasks, &self.config, AuditType::All, dirs, mode);
            }
            if self.config.zero_byte_files_per_second > 0.0 {
                self.spawn_worker(
                    &mut tasks,
                    &self.config,
                    AuditType::ZeroByteFile,
                    device_dirs,
                    mode,
                );
            }
        }

        let mut reports = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            reports.push(joined?);
        }
        Ok(reports)
    }

    fn spawn_worker(
        &self,
        tasks: &mut JoinSet<AuditReport>,
        config: &AuditorConfig,
        audit_type: AuditType,
        device_dirs: Option<Vec<String>>,
        mode: &'static str,
    ) {
        let mut worker = AuditorWorker::new(
            self.manager.clone(),
            config,
            audit_type,
            device_dirs,
            Arc::clone(&self.shutdown),
        );
        tasks.spawn_blocking(move || worker.audit_all_objects(mode));
    }

    /// Audit continuously, `interval` apart, until shutdown
    pub async fn run_forever(&self) {
        let interval = Duration::from_secs(self.config.interval);
        while !self.shutdown.is_triggered() {
            let begin = Instant::now();
            if let Err(e) = self.run_audit("forever", None, None).await {
                error!("Audit pass failed: {}", e);
            }
            let rest = interval.saturating_sub(begin.elapsed());
            tokio::select! {
                () = tokio::time::sleep(rest) => {}
                () = self.shutdown.wait() => {}
            }
        }
        info!("Object auditor stopped");
    }
}
