// SPDX-FileCopyrightText: 2026 Plugdesk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cron-scheduled background jobs declared by plugins.
//!
//! Every enabled job of every enabled plugin runs in its own tokio task that
//! sleeps until the next cron occurrence and then invokes the job handler
//! through the registry. Tasks are grouped per plugin, so a registry event
//! only reschedules the plugin it names. Rescheduling stops future runs; a
//! run already in progress finishes and is logged. Only shutdown aborts it.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use croner::Cron;
use plugdesk_core::{LogLevel, PlugdeskError};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatcher::LoadedPlugin;
use crate::manifest::JobSpec;
use crate::registry::{PluginManager, RegistryEventKind};

/// Deadline for a job run when the job does not set one.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(300);

/// A job currently scheduled.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledJob {
    pub plugin: String,
    pub id: String,
    pub schedule: String,
}

/// Job tasks of one plugin.
struct PluginJobs {
    /// Stops scheduling. In-flight runs observe only the scheduler root.
    schedule: CancellationToken,
    jobs: Vec<ScheduledJob>,
    tasks: Vec<JoinHandle<()>>,
}

/// Runs plugin jobs on their cron schedules.
pub struct JobScheduler {
    manager: Arc<PluginManager>,
    root: CancellationToken,
    groups: Mutex<HashMap<String, PluginJobs>>,
    /// Tasks of replaced groups, awaited at shutdown.
    retired: Mutex<Vec<JoinHandle<()>>>,
}

impl JobScheduler {
    /// `shutdown` cancels every job task when triggered.
    pub fn new(manager: Arc<PluginManager>, shutdown: &CancellationToken) -> Self {
        Self {
            manager,
            root: shutdown.child_token(),
            groups: Mutex::new(HashMap::new()),
            retired: Mutex::new(Vec::new()),
        }
    }

    /// Schedule jobs for enabled plugins. Returns the number scheduled.
    pub fn start(&self) -> usize {
        self.resync()
    }

    /// Reschedule every plugin from current registry state.
    pub fn resync(&self) -> usize {
        let mut names: Vec<String> = self.lock_groups().keys().cloned().collect();
        for plugin in self.manager.enabled_plugins() {
            if !names.iter().any(|n| n == plugin.name()) {
                names.push(plugin.name().to_string());
            }
        }
        for name in &names {
            self.resync_plugin(name);
        }
        let count = self.lock_groups().values().map(|g| g.jobs.len()).sum();
        info!(jobs = count, "plugin jobs scheduled");
        count
    }

    /// Reschedule the jobs of one plugin, leaving every other plugin alone.
    /// Returns the number of jobs now scheduled for it.
    pub fn resync_plugin(&self, name: &str) -> usize {
        let plugin = self
            .manager
            .enabled_plugins()
            .into_iter()
            .find(|p| p.name() == name);
        let group = match plugin {
            Some(plugin) if !self.root.is_cancelled() => Some(self.schedule(&plugin)),
            _ => None,
        };
        let count = group.as_ref().map_or(0, |g| g.jobs.len());

        let previous = {
            let mut groups = self.lock_groups();
            match group {
                Some(group) => groups.insert(name.to_string(), group),
                None => groups.remove(name),
            }
        };
        if let Some(previous) = previous {
            previous.schedule.cancel();
            let mut retired = self.lock_retired();
            retired.retain(|task| !task.is_finished());
            retired.extend(previous.tasks);
        }
        debug!(plugin = %name, jobs = count, "plugin jobs rescheduled");
        count
    }

    fn schedule(&self, plugin: &LoadedPlugin) -> PluginJobs {
        let schedule = self.root.child_token();
        let mut jobs = Vec::new();
        let mut tasks = Vec::new();
        for job in plugin.manifest().jobs.iter().filter(|j| j.enabled) {
            let cron = match Cron::from_str(&job.schedule) {
                Ok(cron) => cron,
                Err(e) => {
                    warn!(plugin = %plugin.name(), job = %job.id, error = %e, "skipping job with invalid schedule");
                    continue;
                }
            };
            jobs.push(ScheduledJob {
                plugin: plugin.name().to_string(),
                id: job.id.clone(),
                schedule: job.schedule.clone(),
            });
            tasks.push(tokio::spawn(run_job(
                self.manager.clone(),
                plugin.name().to_string(),
                job.clone(),
                cron,
                schedule.clone(),
                self.root.clone(),
            )));
        }
        PluginJobs {
            schedule,
            jobs,
            tasks,
        }
    }

    /// Currently scheduled jobs, ordered by plugin then job id.
    pub fn jobs(&self) -> Vec<ScheduledJob> {
        let mut jobs: Vec<ScheduledJob> = self
            .lock_groups()
            .values()
            .flat_map(|g| g.jobs.iter().cloned())
            .collect();
        jobs.sort_by(|a, b| a.plugin.cmp(&b.plugin).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    /// Cancel every job task and wait for them to finish.
    pub async fn shutdown(&self) {
        self.root.cancel();
        let mut tasks: Vec<JoinHandle<()>> = self
            .lock_groups()
            .drain()
            .flat_map(|(_, g)| g.tasks)
            .collect();
        tasks.append(&mut *self.lock_retired());
        for task in tasks {
            let _ = task.await;
        }
        debug!("job scheduler stopped");
    }

    /// Reschedule the affected plugin whenever the registry reports a change.
    pub fn spawn_resync_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        let mut events = self.manager.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = scheduler.root.cancelled() => return,
                    event = events.recv() => match event {
                        Ok(event) if event.kind == RegistryEventKind::Failed => {}
                        Ok(event) => {
                            scheduler.resync_plugin(&event.plugin);
                        }
                        Err(RecvError::Lagged(_)) => {
                            scheduler.resync();
                        }
                        Err(RecvError::Closed) => return,
                    },
                }
            }
        })
    }

    fn lock_groups(&self) -> std::sync::MutexGuard<'_, HashMap<String, PluginJobs>> {
        self.groups.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_retired(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.retired.lock().unwrap_or_else(|p| p.into_inner())
    }
}

async fn run_job(
    manager: Arc<PluginManager>,
    plugin: String,
    job: JobSpec,
    cron: Cron,
    schedule: CancellationToken,
    shutdown: CancellationToken,
) {
    let timeout = job
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_JOB_TIMEOUT);
    let mut last_fire: Option<DateTime<Utc>> = None;

    loop {
        let now = Utc::now();
        // Never fire twice for the same occurrence, even if the clock lags.
        let from = last_fire.map_or(now, |last| last.max(now));
        let next = match cron.find_next_occurrence(&from, false) {
            Ok(next) => next,
            Err(e) => {
                warn!(plugin = %plugin, job = %job.id, error = %e, "no next occurrence, job stopped");
                return;
            }
        };
        let wait = (next - now).to_std().unwrap_or_default();

        tokio::select! {
            _ = schedule.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }
        last_fire = Some(next);

        let started = std::time::Instant::now();
        let elapsed = || serde_json::json!({ "elapsed_ms": started.elapsed().as_millis() as u64 });
        match manager
            .call_with_timeout(&shutdown, &plugin, &job.handler, b"{}", timeout)
            .await
        {
            Ok(_) => manager.logs().log(
                &plugin,
                LogLevel::Debug,
                format!("job {} completed", job.id),
                Some(elapsed()),
            ),
            Err(PlugdeskError::Cancelled) => {
                manager.logs().log(
                    &plugin,
                    LogLevel::Warn,
                    format!("job {} cancelled by shutdown", job.id),
                    Some(elapsed()),
                );
                return;
            }
            Err(e) => manager.logs().log(
                &plugin,
                LogLevel::Error,
                format!("job {} failed: {e}", job.id),
                Some(elapsed()),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ManagerSettings;
    use plugdesk_core::{PluginSource, RuntimeKind};
    use plugdesk_test_utils::{MockGuest, MockLoader};

    const WITH_JOBS: &str = r#"{
        "name":"cleanup","version":"1",
        "jobs":[
            {"id":"sweep","handler":"sweep","schedule":"* * * * *"},
            {"id":"off","handler":"sweep","schedule":"* * * * *","enabled":false}
        ]
    }"#;

    async fn setup() -> (Arc<PluginManager>, MockGuest) {
        let dir = tempfile::tempdir().unwrap();
        let guest = MockGuest::new(WITH_JOBS).with_echo("sweep");
        let loader = MockLoader::new().with_instance("cleanup", guest.clone());
        let manager = Arc::new(PluginManager::new(
            Arc::new(loader),
            ManagerSettings::new(dir.path()),
        ));
        manager.register_source(PluginSource {
            name: "cleanup".into(),
            runtime: RuntimeKind::Wasm,
            binary_path: dir.path().join("cleanup.wasm"),
            root: dir.path().to_path_buf(),
        });
        manager.get("cleanup").await.unwrap();
        (manager, guest)
    }

    #[tokio::test(start_paused = true)]
    async fn schedules_enabled_jobs_and_runs_them() {
        let (manager, guest) = setup().await;
        let scheduler = JobScheduler::new(manager, &CancellationToken::new());
        assert_eq!(scheduler.start(), 1);
        assert_eq!(scheduler.jobs()[0].id, "sweep");

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(guest.call_count("sweep") >= 1);
        scheduler.shutdown().await;
        assert!(scheduler.jobs().is_empty());
    }

    #[tokio::test]
    async fn resync_drops_jobs_of_disabled_plugins() {
        let (manager, _guest) = setup().await;
        let scheduler = JobScheduler::new(manager.clone(), &CancellationToken::new());
        assert_eq!(scheduler.start(), 1);

        manager.disable("cleanup").unwrap();
        assert_eq!(scheduler.resync(), 0);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unrelated_event_lets_a_running_job_finish() {
        let dir = tempfile::tempdir().unwrap();
        let cleanup = MockGuest::new(WITH_JOBS)
            .with_echo("sweep")
            .with_delay("sweep", Duration::from_secs(20));
        let loader = MockLoader::new()
            .with_instance("cleanup", cleanup.clone())
            .with_instance("other", MockGuest::new(r#"{"name":"other","version":"1"}"#));
        let manager = Arc::new(PluginManager::new(
            Arc::new(loader),
            ManagerSettings::new(dir.path()),
        ));
        for name in ["cleanup", "other"] {
            manager.register_source(PluginSource {
                name: name.into(),
                runtime: RuntimeKind::Wasm,
                binary_path: dir.path().join(format!("{name}.wasm")),
                root: dir.path().to_path_buf(),
            });
            manager.get(name).await.unwrap();
        }

        let scheduler = Arc::new(JobScheduler::new(manager.clone(), &CancellationToken::new()));
        scheduler.start();
        let listener = scheduler.spawn_resync_listener();

        while cleanup.call_count("sweep") == 0 {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        manager.disable("other").unwrap();
        tokio::time::sleep(Duration::from_secs(25)).await;

        let completed = manager
            .logs()
            .by_plugin("cleanup")
            .into_iter()
            .filter(|e| e.message == "job sweep completed")
            .count();
        assert!(completed >= 1, "running job was dropped by an unrelated event");
        assert_eq!(scheduler.jobs().len(), 1);

        scheduler.shutdown().await;
        let _ = listener.await;
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_a_plugin_leaves_others_untouched() {
        let (manager, _guest) = setup().await;
        let scheduler = JobScheduler::new(manager.clone(), &CancellationToken::new());
        assert_eq!(scheduler.start(), 1);

        assert_eq!(scheduler.resync_plugin("ghost"), 0);
        assert_eq!(scheduler.jobs().len(), 1);

        manager.disable("cleanup").unwrap();
        assert_eq!(scheduler.resync_plugin("cleanup"), 0);
        assert!(scheduler.jobs().is_empty());
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_logs_an_interrupted_run() {
        let dir = tempfile::tempdir().unwrap();
        let guest = MockGuest::new(WITH_JOBS)
            .with_echo("sweep")
            .with_delay("sweep", Duration::from_secs(120));
        let loader = MockLoader::new().with_instance("cleanup", guest.clone());
        let manager = Arc::new(PluginManager::new(
            Arc::new(loader),
            ManagerSettings::new(dir.path()),
        ));
        manager.register_source(PluginSource {
            name: "cleanup".into(),
            runtime: RuntimeKind::Wasm,
            binary_path: dir.path().join("cleanup.wasm"),
            root: dir.path().to_path_buf(),
        });
        manager.get("cleanup").await.unwrap();

        let scheduler = JobScheduler::new(manager.clone(), &CancellationToken::new());
        scheduler.start();
        while guest.call_count("sweep") == 0 {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        scheduler.shutdown().await;

        let entries = manager.logs().by_plugin("cleanup");
        assert!(entries
            .iter()
            .any(|e| e.level == LogLevel::Warn && e.message.contains("cancelled")));
    }

    #[tokio::test]
    async fn cancelled_root_schedules_nothing() {
        let (manager, _guest) = setup().await;
        let shutdown = CancellationToken::new();
        let scheduler = JobScheduler::new(manager, &shutdown);
        shutdown.cancel();
        assert_eq!(scheduler.start(), 0);
    }
}
