use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use super::cron::CronSchedule;
use super::lock::{Acquisition, JobLocks};
use crate::dispatch::{DispatchError, Dispatcher, InvocationContext, Payload};
use crate::event::{Event, EventType};
use crate::principal::Principal;
use crate::registry::{Discriminant, HandlerKind, Registration, RegistryTable};

/// Result of one scheduled firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobFiring {
    /// No registration handles the job.
    Missing,
    /// A previous run still holds the lock.
    Skipped,
    Started(Uuid),
    /// Started after cancelling the previous run.
    Superseded(Uuid),
}

/// Fires jobs by name under the overlap lock.
#[derive(Debug, Clone)]
pub struct JobRunner {
    dispatcher: Dispatcher,
    locks: JobLocks,
    refresh_interval: Duration,
}

impl JobRunner {
    pub fn new(dispatcher: Dispatcher, locks: JobLocks, refresh_interval: Duration) -> Self {
        Self {
            dispatcher,
            locks,
            refresh_interval,
        }
    }

    pub fn locks(&self) -> &JobLocks {
        &self.locks
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn fire(&self, name: &str) -> Result<JobFiring, DispatchError> {
        let context = InvocationContext::root(
            Discriminant::job(name),
            Payload::new().with_principal(Principal::system()),
        );
        let Some(candidate) = self.dispatcher.resolve(&context).await?.into_iter().next() else {
            self.notify(EventType::JobMissing {
                name: name.to_string(),
            });
            return Ok(JobFiring::Missing);
        };
        let registration = candidate.registration;
        let (lease, superseded) = match self.locks.try_acquire(
            name,
            registration.restart,
            context.cancellation.clone(),
        ) {
            Acquisition::Busy => {
                debug!(job = name, "job still running, skipping");
                self.notify(EventType::JobSkipped {
                    name: name.to_string(),
                });
                return Ok(JobFiring::Skipped);
            }
            Acquisition::Acquired(lease) => (lease, false),
            Acquisition::Superseded(lease) => {
                info!(job = name, "restarting job, previous run cancelled");
                self.notify(EventType::JobSuperseded {
                    name: name.to_string(),
                });
                (lease, true)
            }
        };
        let lease = lease.keep_alive(self.refresh_interval);
        let uuid = self
            .dispatcher
            .submit_job(registration, context, lease)
            .await;
        Ok(if superseded {
            JobFiring::Superseded(uuid)
        } else {
            JobFiring::Started(uuid)
        })
    }

    fn notify(&self, event_type: EventType) {
        if let Err(e) = self.dispatcher.event_bus().publish(Event::new(event_type)) {
            debug!(error = %e, "job event dropped");
        }
    }
}

/// The cron of each job name's winning registration: highest weight, first
/// registered on ties.
pub fn job_schedules(table: &RegistryTable) -> Vec<(String, CronSchedule)> {
    let mut winners: HashMap<&str, &Registration> = HashMap::new();
    for registration in table.get(HandlerKind::Job) {
        if registration.cron.is_none() {
            continue;
        }
        winners
            .entry(registration.name.as_str())
            .and_modify(|current| {
                let better = registration.weight > current.weight
                    || (registration.weight == current.weight
                        && registration.sequence < current.sequence);
                if better {
                    *current = registration.as_ref();
                }
            })
            .or_insert(registration.as_ref());
    }
    let mut schedules: Vec<(String, CronSchedule)> = winners
        .into_iter()
        .filter_map(|(name, r)| r.cron.clone().map(|cron| (name.to_string(), cron)))
        .collect();
    schedules.sort_by(|a, b| a.0.cmp(&b.0));
    schedules
}

struct Generation {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Turns job registrations into periodic firings, one task per job name.
pub struct Scheduler {
    runner: JobRunner,
    running: Arc<AtomicBool>,
    generation: Mutex<Option<Generation>>,
}

impl Scheduler {
    pub fn new(runner: JobRunner) -> Self {
        Self {
            runner,
            running: Arc::new(AtomicBool::new(false)),
            generation: Mutex::new(None),
        }
    }

    pub fn runner(&self) -> &JobRunner {
        &self.runner
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.spawn().await;
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.halt().await;
        debug!("scheduler stopped");
    }

    /// Re-reads job registrations, typically after a registry reload.
    pub async fn refresh(&self) {
        if self.is_running() {
            self.halt().await;
            self.spawn().await;
        }
    }

    async fn halt(&self) {
        if let Some(generation) = self.generation.lock().await.take() {
            generation.token.cancel();
            for task in generation.tasks {
                task.abort();
            }
        }
    }

    async fn spawn(&self) {
        let table = self.runner.dispatcher.registry().snapshot();
        let token = CancellationToken::new();
        let mut tasks = Vec::new();
        for (name, cron) in job_schedules(&table) {
            debug!(job = %name, cron = %cron, "scheduling job");
            tasks.push(tokio::spawn(run_schedule(
                self.runner.clone(),
                self.running.clone(),
                token.clone(),
                name,
                cron,
            )));
        }
        *self.generation.lock().await = Some(Generation { token, tasks });
    }
}

async fn run_schedule(
    runner: JobRunner,
    running: Arc<AtomicBool>,
    token: CancellationToken,
    name: String,
    cron: CronSchedule,
) {
    while running.load(Ordering::SeqCst) {
        let Some(next) = cron.next_after(Utc::now()) else {
            debug!(job = %name, "cron never fires again");
            return;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }
        if !running.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = runner.fire(&name).await {
            error!(job = %name, error = %e, "scheduled firing failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{HandlerRef, handler_fn};
    use crate::eval::Value;
    use crate::registry::ModuleLoader;
    use serde_json::json;

    fn noop() -> HandlerRef {
        HandlerRef::Direct(handler_fn(|_| async { Ok(Value::Null) }))
    }

    #[test]
    fn test_job_schedules_follow_override() {
        let mut loader = ModuleLoader::new("production");
        loader
            .module("a")
            .register_handler(
                HandlerKind::Job,
                "base",
                json!({ "name": "sweep", "cron": "@daily" }),
                noop(),
            )
            .unwrap()
            .register_handler(
                HandlerKind::Job,
                "override",
                json!({ "name": "sweep", "cron": "@hourly", "weight": 1 }),
                noop(),
            )
            .unwrap()
            .register_handler(
                HandlerKind::Job,
                "report",
                json!({ "cron": "0 6 * * MON" }),
                noop(),
            )
            .unwrap();
        let schedules = job_schedules(&loader.finish());
        let names: Vec<_> = schedules
            .iter()
            .map(|(n, c)| (n.as_str(), c.source()))
            .collect();
        assert_eq!(names, vec![("report", "0 6 * * MON"), ("sweep", "@hourly")]);
    }
}
