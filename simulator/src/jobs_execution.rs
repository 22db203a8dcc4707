//! Per-running-job execution actors.
//!
//! The server spawns one coroutine per EXECUTE_JOB through this component.
//! An actor transitions its job to RUNNING, walks the task tree leaf by
//! leaf on the virtual clock, and races execution against wall-time expiry
//! and kill signals. Whatever the outcome, the progress snapshot is taken
//! before the executor is torn down and a completion event is posted to
//! the server.

use std::cell::RefCell;
use std::rc::Rc;

use futures::{select, FutureExt};
use rustc_hash::FxHashMap;

use dslab_core::{cast, log_debug, log_error, log_warn, Event, EventHandler, Id, SimulationContext};

use crate::events::{JobCompletedEvent, KillAckEvent, KillJobSignal, ScheduleJobExecution};
use crate::executor::{executor_hosts, leaf_duration};
use crate::jobs::{JobIdentifier, JobState};
use crate::machines::Machines;
use crate::profiles::{merge_leaf, Profile, ProfileData};
use crate::storage::{ExecutionRequest, SharedExecutionStorage};
use crate::workload::Workloads;

/// One leaf to execute: the indices to follow in the task tree, the leaf
/// profile, and its IO counterpart if an additional IO job was merged in.
struct LeafPlan {
    path: Vec<usize>,
    profile: Profile,
    io_profile: Option<Profile>,
}

enum Outcome {
    Success,
    WalltimeReached,
    Killed { group: u64, for_what: u8 },
}

#[derive(Clone)]
pub struct JobExecutor {
    workloads: Rc<RefCell<Workloads>>,
    machines: Rc<RefCell<Machines>>,
    storage: Rc<RefCell<SharedExecutionStorage>>,
    server_id: Id,
    reference_bandwidth: f64,
    ctx: SimulationContext,
}

impl JobExecutor {
    pub fn new(
        ctx: SimulationContext,
        workloads: Rc<RefCell<Workloads>>,
        machines: Rc<RefCell<Machines>>,
        storage: Rc<RefCell<SharedExecutionStorage>>,
        reference_bandwidth: f64,
    ) -> JobExecutor {
        JobExecutor {
            workloads,
            machines,
            storage,
            server_id: u32::MAX, // set by the simulation builder
            reference_bandwidth,
            ctx,
        }
    }

    pub fn id(&self) -> Id {
        self.ctx.id()
    }

    pub fn set_server(&mut self, server_id: Id) {
        self.server_id = server_id;
    }

    async fn run_job(self, execution_id: u64) {
        let request = match self
            .storage
            .borrow()
            .get_execution_request(execution_id)
            .cloned()
        {
            Some(request) => request,
            None => {
                log_error!(self.ctx, "unknown execution request: {}", execution_id);
                return;
            }
        };
        let job_id = request.job_id.clone();

        let (walltime, plan) = match self.setup_job(&request) {
            Ok(setup) => setup,
            Err(message) => {
                log_error!(self.ctx, "cannot start job {}: {}", job_id, message);
                return;
            }
        };
        log_debug!(
            self.ctx,
            "start job: {}, allocation: {}",
            job_id,
            request.machine_ids
        );

        let hosts = executor_hosts(&request.machine_ids, &request.mapping);
        let work = self.execute_plan(&job_id, &hosts, plan).fuse();
        let kill = self
            .ctx
            .recv_event_by_key::<KillJobSignal>(execution_id)
            .fuse();
        let wall = async {
            if walltime > 0.0 {
                self.ctx.sleep(walltime).await;
            } else {
                futures::future::pending::<()>().await;
            }
        }
        .fuse();
        futures::pin_mut!(work, kill, wall);

        let outcome = select! {
            _ = work => Outcome::Success,
            killed = kill => Outcome::Killed {
                group: killed.data.group,
                for_what: killed.data.for_what,
            },
            _ = wall => Outcome::WalltimeReached,
        };

        self.finalize_job(execution_id, &job_id, &request, outcome);
    }

    /// Transitions the job to RUNNING, instantiates its task tree and
    /// flattens the profile into the ordered list of leaves to execute.
    fn setup_job(&self, request: &ExecutionRequest) -> Result<(f64, Vec<LeafPlan>), String> {
        let now = self.ctx.time();
        let mut workloads = self.workloads.borrow_mut();
        let workload = workloads
            .at_mut(request.job_id.workload_name())
            .ok_or_else(|| "unknown workload".to_string())?;

        let profiles: FxHashMap<String, Profile> = workload
            .profiles
            .profiles()
            .map(|p| (p.name.clone(), p.clone()))
            .collect();

        let job = workload
            .jobs
            .get_mut(&request.job_id)
            .ok_or_else(|| "unknown job".to_string())?;
        job.state = JobState::Running;
        job.starting_time = now;
        job.allocation = request.machine_ids.clone();
        job.create_task(&workload.profiles);

        let root = profiles
            .get(&job.profile_name)
            .ok_or_else(|| format!("profile '{}' vanished", job.profile_name))?;
        let io_root = match &request.io_profile {
            Some(name) => Some(
                profiles
                    .get(name)
                    .ok_or_else(|| format!("IO profile '{}' vanished", name))?
                    .clone(),
            ),
            None => None,
        };

        let mut plan = Vec::new();
        flatten_profile(&profiles, root, io_root.as_ref(), &mut Vec::new(), &mut plan);
        let walltime = job.walltime;

        self.machines
            .borrow_mut()
            .update_machines_on_job_start(&request.machine_ids);
        Ok((walltime, plan))
    }

    /// Runs the leaves in order, keeping the task tree's progress fields
    /// current between suspension points.
    async fn execute_plan(&self, job_id: &JobIdentifier, hosts: &[u32], plan: Vec<LeafPlan>) {
        for leaf in plan {
            let exec_profile = match &leaf.io_profile {
                Some(io) => match merge_leaf(&leaf.profile, io) {
                    Ok(merged) => merged,
                    Err(e) => {
                        log_error!(self.ctx, "IO merge failed for {}: {}", job_id, e);
                        leaf.profile.clone()
                    }
                },
                None => leaf.profile.clone(),
            };
            if matches!(exec_profile.data, ProfileData::Smpi { .. }) {
                log_warn!(
                    self.ctx,
                    "job {}: SMPI replay is not simulated, leaf is skipped",
                    job_id
                );
            }
            let duration = leaf_duration(
                &exec_profile,
                hosts,
                &self.machines.borrow(),
                self.reference_bandwidth,
            );

            {
                let mut workloads = self.workloads.borrow_mut();
                if let Some(job) = workloads.job_at_mut(job_id) {
                    if let Some(task) = job.task.as_mut() {
                        let mut node = task;
                        for &index in &leaf.path {
                            node.set_current(index);
                            node = node.child_mut(index);
                        }
                        node.start_leaf(self.ctx.time(), duration);
                    }
                }
            }
            self.ctx.sleep(duration).await;
        }
    }

    /// Captures progress, transitions the job to its terminal state,
    /// releases machines and reports to the server.
    fn finalize_job(
        &self,
        execution_id: u64,
        job_id: &JobIdentifier,
        request: &ExecutionRequest,
        outcome: Outcome,
    ) {
        let now = self.ctx.time();
        let (progress, progress_json, runtime) = {
            let mut workloads = self.workloads.borrow_mut();
            let job = workloads
                .job_at_mut(job_id)
                .expect("running jobs stay registered");
            let (progress, progress_json) = job
                .compute_job_progress(now)
                .unwrap_or((0.0, serde_json::Value::Null));
            job.runtime = now - job.starting_time;
            job.progress = progress;
            job.state = match outcome {
                Outcome::Success => JobState::CompletedSuccessfully,
                Outcome::WalltimeReached => JobState::CompletedWalltimeReached,
                Outcome::Killed { .. } => JobState::CompletedKilled,
            };
            job.return_code = match outcome {
                Outcome::Success => 0,
                _ => -1,
            };
            let machines = self.machines.borrow();
            job.consumed_energy = machines.job_energy_estimate(&job.allocation, job.runtime);
            (progress, progress_json, job.runtime)
        };

        self.machines
            .borrow_mut()
            .update_machines_on_job_end(&request.machine_ids, runtime);
        self.storage.borrow_mut().remove_execution_request(execution_id);

        if let Outcome::Killed { group, for_what } = outcome {
            self.ctx.emit_now(
                KillAckEvent {
                    group,
                    job_id: job_id.to_string(),
                    for_what,
                    progress: Some(progress_json),
                    progress_value: progress,
                },
                self.server_id,
            );
        }
        log_debug!(self.ctx, "finish job: {}", job_id);
        self.ctx.emit_now(
            JobCompletedEvent {
                job_id: job_id.to_string(),
            },
            self.server_id,
        );
    }
}

impl JobExecutor {
    fn ack_stale_kill(&self, job_id: &str, group: u64, for_what: u8) {
        let now = self.ctx.time();
        let (progress_value, progress) = {
            let workloads = self.workloads.borrow();
            JobIdentifier::from_string(job_id)
                .ok()
                .and_then(|id| workloads.job_at(&id))
                .and_then(|job| job.compute_job_progress(now))
                .unwrap_or((0.0, serde_json::Value::Null))
        };
        self.ctx.emit_now(
            KillAckEvent {
                group,
                job_id: job_id.to_string(),
                for_what,
                progress: Some(progress),
                progress_value,
            },
            self.server_id,
        );
    }
}

/// Expands a (possibly composed) profile into its ordered leaves, pairing
/// each with the matching child of the IO profile when one is present.
fn flatten_profile(
    profiles: &FxHashMap<String, Profile>,
    profile: &Profile,
    io: Option<&Profile>,
    path: &mut Vec<usize>,
    out: &mut Vec<LeafPlan>,
) {
    match &profile.data {
        ProfileData::Sequence { seq, repeat } => {
            let io_children: Option<&Vec<String>> = match io.map(|p| &p.data) {
                Some(ProfileData::Sequence { seq: io_seq, .. }) => Some(io_seq),
                _ => None,
            };
            for r in 0..*repeat as usize {
                for (i, child_name) in seq.iter().enumerate() {
                    let child = match profiles.get(child_name) {
                        Some(child) => child,
                        None => continue,
                    };
                    let io_child = io_children
                        .and_then(|children| children.get(i))
                        .and_then(|name| profiles.get(name));
                    path.push(r * seq.len() + i);
                    flatten_profile(profiles, child, io_child, path, out);
                    path.pop();
                }
            }
        }
        _ => out.push(LeafPlan {
            path: path.clone(),
            profile: profile.clone(),
            io_profile: io.cloned(),
        }),
    }
}

impl EventHandler for JobExecutor {
    fn on(&mut self, event: Event) {
        cast!(match event.data {
            ScheduleJobExecution { execution_id } => {
                self.ctx.spawn(self.clone().run_job(execution_id));
            }
            // The targeted actor finished in the same instant; ack with the
            // progress recorded on the job so the kill group still closes.
            KillJobSignal {
                execution_id,
                job_id,
                group,
                for_what,
            } => {
                log_debug!(
                    self.ctx,
                    "stale kill signal for finished execution {}",
                    execution_id
                );
                self.ack_stale_kill(&job_id, group, for_what);
            }
        });
    }
}
