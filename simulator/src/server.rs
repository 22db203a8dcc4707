//! The event server: a single-threaded loop on the master host that
//! serializes every decision at each scheduler round trip.
//!
//! Inbound simulation events (submissions, completions, kill acks, timer
//! fires) are accumulated into a pending outbound buffer. A flush marker
//! emitted at the current instant drains everything queued at that time
//! into one protocol message; the reply is parsed, validated and
//! dispatched before the next flush. Exactly one message is in flight at
//! any moment, and within one message timestamps are non-decreasing with
//! JOB_SUBMITTED preceding JOB_COMPLETED preceding scheduler-initiated
//! events at equal timestamps.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use log::warn;
use rustc_hash::FxHashMap;
use serde_json::Value;

use dslab_core::{cast, log_debug, log_error, log_info, Event, EventHandler, Id, SimulationContext};

use crate::batsim_checkpoint::CheckpointManager;
use crate::config::sim_config::{CheckpointClock, SimulationConfig};
use crate::events::{
    FlushReady, JobCompletedEvent, JobSubmittedEvent, KillAckEvent, KillJobSignal, KillReason,
    ScheduleJobExecution, SimulationStart, SubmitterDone, TimerFired, TimerPurpose,
};
use crate::failures::FailureInjector;
use crate::interval_set::IntervalSet;
use crate::jobs::{JobIdentifier, JobPurpose, JobState};
use crate::machines::Machines;
use crate::profiles::{validate_io_merge, Profile};
use crate::protocol::{
    parse_message, IoJobDescription, JsonProtocolWriter, KillMsgOut, NotifyEvent, ProtocolError,
    SchedulerClient, SchedulerEvent,
};
use crate::storage::{ExecutionRequest, SharedExecutionStorage};
use crate::workload::{Workload, Workloads};

/// One armed call-me-later; kept for the batsim-level checkpoint.
#[derive(Clone)]
pub struct ArmedTimer {
    pub target_time: f64,
    pub id: i64,
    pub purpose: TimerPurpose,
    pub from_scheduler: bool,
}

/// Scalar telemetry the scheduler pushes through NOTIFY events.
#[derive(Default)]
pub struct SchedulerTelemetry {
    pub queue_size: Option<i64>,
    pub schedule_size: Option<i64>,
    pub nb_running_jobs: Option<i64>,
    pub utilization: Option<f64>,
    pub utilization_no_resv: Option<f64>,
    pub batsched_pid: Option<i64>,
}

enum PendingOutbound {
    SimulationBegins,
    JobSubmitted {
        job_id: String,
        job_json: Value,
        profile_json: Option<Value>,
    },
    JobCompleted {
        job_id: String,
        job_state: &'static str,
        alloc: String,
        return_code: i32,
    },
    JobKilled {
        msgs: Vec<KillMsgOut>,
    },
    ResourceStateChanged {
        resources: IntervalSet,
        state: String,
    },
    RequestedCall {
        id: i64,
        for_what: u8,
    },
    AnswerEnergy {
        consumed_energy: f64,
    },
    Notify {
        notify_type: &'static str,
    },
    NotifyResources {
        notify_type: &'static str,
        resources: IntervalSet,
    },
    NotifyJobFault {
        job_id: String,
    },
    SimulationEnds,
}

impl PendingOutbound {
    /// Ordering class within one timestamp.
    fn rank(&self) -> u8 {
        match self {
            PendingOutbound::SimulationBegins => 0,
            PendingOutbound::JobSubmitted { .. } => 1,
            PendingOutbound::JobCompleted { .. } => 2,
            PendingOutbound::SimulationEnds => 4,
            _ => 3,
        }
    }
}

struct Pending {
    time: f64,
    rank: u8,
    payload: PendingOutbound,
}

struct KillGroup {
    remaining: usize,
    msgs: Vec<KillMsgOut>,
    /// Failure-killed workload jobs to resubmit once the group completes.
    resubmit: Vec<(JobIdentifier, f64)>,
}

pub struct Server {
    ctx: SimulationContext,
    config: Rc<SimulationConfig>,
    config_json: Value,

    workloads: Rc<RefCell<Workloads>>,
    machines: Rc<RefCell<Machines>>,
    storage: Rc<RefCell<SharedExecutionStorage>>,
    executor_id: Id,

    client: Box<dyn SchedulerClient>,
    writer: JsonProtocolWriter,
    pending: Vec<Pending>,

    sched_ready: bool,
    flush_armed: bool,
    ending: bool,
    ended: bool,
    fatal_error: Option<ProtocolError>,

    running_jobs: Vec<(JobIdentifier, u64)>,
    kill_groups: FxHashMap<u64, KillGroup>,
    next_kill_group: u64,

    armed_timers: Vec<ArmedTimer>,
    next_timer_id: i64,
    reservation_timers: FxHashMap<i64, JobIdentifier>,
    repair_timers: FxHashMap<i64, u32>,

    registration_finished: bool,
    pub telemetry: SchedulerTelemetry,

    submitters_remaining: usize,
    nb_submitted_jobs: u64,
    nb_terminal_jobs: u64,

    failure: FailureInjector,
    checkpoint: CheckpointManager,
    last_real_checkpoint: Instant,
}

impl Server {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: SimulationContext,
        config: Rc<SimulationConfig>,
        config_json: Value,
        workloads: Rc<RefCell<Workloads>>,
        machines: Rc<RefCell<Machines>>,
        storage: Rc<RefCell<SharedExecutionStorage>>,
        client: Box<dyn SchedulerClient>,
        checkpoint: CheckpointManager,
        nb_submitters: usize,
    ) -> Server {
        let failure = FailureInjector::new(&config.failures);
        Server {
            ctx,
            config,
            config_json,
            workloads,
            machines,
            storage,
            executor_id: u32::MAX, // set by the simulation builder
            client,
            writer: JsonProtocolWriter::new(),
            pending: Vec::new(),
            sched_ready: true,
            flush_armed: false,
            ending: false,
            ended: false,
            fatal_error: None,
            running_jobs: Vec::new(),
            kill_groups: FxHashMap::default(),
            next_kill_group: 0,
            armed_timers: Vec::new(),
            next_timer_id: 1,
            reservation_timers: FxHashMap::default(),
            repair_timers: FxHashMap::default(),
            registration_finished: false,
            telemetry: SchedulerTelemetry::default(),
            submitters_remaining: nb_submitters,
            nb_submitted_jobs: 0,
            nb_terminal_jobs: 0,
            failure,
            checkpoint,
            last_real_checkpoint: Instant::now(),
        }
    }

    pub fn id(&self) -> Id {
        self.ctx.id()
    }

    pub fn set_executor(&mut self, executor_id: Id) {
        self.executor_id = executor_id;
    }

    pub fn fatal_error(&self) -> Option<&ProtocolError> {
        self.fatal_error.as_ref()
    }

    pub fn has_ended(&self) -> bool {
        self.ended
    }

    pub fn nb_completed_jobs(&self) -> u64 {
        self.nb_terminal_jobs
    }

    // ------------------------------------------------------------------
    // Outbound plumbing
    // ------------------------------------------------------------------

    fn push_pending(&mut self, payload: PendingOutbound) {
        self.pending.push(Pending {
            time: self.ctx.time(),
            rank: payload.rank(),
            payload,
        });
    }

    fn request_flush(&mut self) {
        if !self.flush_armed && !self.ended && self.fatal_error.is_none() {
            self.flush_armed = true;
            self.ctx.emit_self_now(FlushReady {});
        }
    }

    fn on_flush_ready(&mut self) {
        self.flush_armed = false;
        if self.ended || self.fatal_error.is_some() || !self.sched_ready {
            return;
        }
        self.maybe_end();
        if self.pending.is_empty() {
            return;
        }
        self.send_round_trip();
    }

    /// When no more work can ever arrive, queue SIMULATION_ENDS.
    fn maybe_end(&mut self) {
        if self.ending || self.ended {
            return;
        }
        let registration_open =
            self.config.dynamic_registration.enabled && !self.registration_finished;
        if self.submitters_remaining == 0
            && !registration_open
            && self.running_jobs.is_empty()
            && self.kill_groups.is_empty()
            && self.nb_terminal_jobs == self.nb_submitted_jobs
        {
            self.ending = true;
            self.push_pending(PendingOutbound::SimulationEnds);
        }
    }

    fn send_round_trip(&mut self) {
        let now = self.ctx.time();
        self.maybe_real_clock_checkpoint();

        // Stable sort: production order survives within one (time, rank).
        self.pending
            .sort_by(|a, b| a.time.total_cmp(&b.time).then(a.rank.cmp(&b.rank)));
        let drained: Vec<Pending> = self.pending.drain(..).collect();
        for entry in &drained {
            self.append_to_writer(entry);
        }

        let message = self.writer.generate_current_message(now);
        self.writer.clear();
        self.sched_ready = false;
        log_debug!(self.ctx, "sending: {}", message);

        let reply = match self.client.send_recv(&message) {
            Ok(reply) => reply,
            Err(e) => {
                self.fail(e);
                return;
            }
        };
        log_debug!(self.ctx, "received: {}", reply);

        let parsed = match parse_message(&reply) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.fail(e);
                return;
            }
        };

        for timestamped in parsed.events {
            if let Err(e) = self.handle_scheduler_event(timestamped.event) {
                self.fail(e);
                return;
            }
        }
        self.sched_ready = true;

        if self.ending {
            self.ended = true;
            log_info!(self.ctx, "simulation finished at {}", self.ctx.time());
            return;
        }
        self.maybe_end();
        if !self.pending.is_empty() {
            self.request_flush();
        }
    }

    fn append_to_writer(&mut self, entry: &Pending) {
        let date = entry.time;
        match &entry.payload {
            PendingOutbound::SimulationBegins => {
                self.writer.append_simulation_begins(
                    &self.machines.borrow(),
                    &self.workloads.borrow(),
                    &self.config_json,
                    self.config.allow_compute_sharing,
                    self.config.allow_storage_sharing,
                    date,
                );
            }
            PendingOutbound::JobSubmitted {
                job_id,
                job_json,
                profile_json,
            } => self
                .writer
                .append_job_submitted(job_id, job_json, profile_json.as_ref(), date),
            PendingOutbound::JobCompleted {
                job_id,
                job_state,
                alloc,
                return_code,
            } => self
                .writer
                .append_job_completed(job_id, job_state, alloc, *return_code, date),
            PendingOutbound::JobKilled { msgs } => self.writer.append_job_killed(msgs, date),
            PendingOutbound::ResourceStateChanged { resources, state } => self
                .writer
                .append_resource_state_changed(resources, state, date),
            PendingOutbound::RequestedCall { id, for_what } => {
                self.writer.append_requested_call(date, *id, *for_what)
            }
            PendingOutbound::AnswerEnergy { consumed_energy } => {
                self.writer.append_answer_energy(*consumed_energy, date)
            }
            PendingOutbound::Notify { notify_type } => self.writer.append_notify(notify_type, date),
            PendingOutbound::NotifyResources {
                notify_type,
                resources,
            } => self
                .writer
                .append_notify_resource_event(notify_type, resources, date),
            PendingOutbound::NotifyJobFault { job_id } => {
                self.writer.append_notify_job_fault_event(job_id, date)
            }
            PendingOutbound::SimulationEnds => self.writer.append_simulation_ends(date),
        }
    }

    fn fail(&mut self, error: ProtocolError) {
        log_error!(self.ctx, "{}", error);
        self.fatal_error = Some(error);
        self.ended = true;
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn arm_internal_timer(&mut self, purpose: TimerPurpose, delay: f64) -> i64 {
        let id = self.next_timer_id;
        self.next_timer_id += 1;
        self.armed_timers.push(ArmedTimer {
            target_time: self.ctx.time() + delay.max(0.0),
            id,
            purpose,
            from_scheduler: false,
        });
        self.ctx.emit_self(
            TimerFired {
                id,
                purpose: purpose.as_u8(),
                from_scheduler: false,
            },
            delay.max(0.0),
        );
        id
    }

    fn arm_failure_timers(&mut self) {
        if self.failure.mtbf_enabled() {
            let delay = self.failure.next_mtbf_delay();
            self.arm_internal_timer(TimerPurpose::Mtbf, delay);
        }
        if self.failure.smtbf_enabled() {
            let delay = self.failure.next_smtbf_delay();
            self.arm_internal_timer(TimerPurpose::Smtbf, delay);
        }
        if self.failure.fixed_enabled() {
            let delay = self.failure.next_fixed_delay();
            self.arm_internal_timer(TimerPurpose::FixedFailure, delay);
        }
    }

    fn on_timer_fired(&mut self, id: i64, purpose: u8, from_scheduler: bool) {
        if self.ended {
            return;
        }
        self.armed_timers.retain(|t| t.id != id || t.from_scheduler != from_scheduler);
        let purpose = match TimerPurpose::from_u8(purpose) {
            Some(purpose) => purpose,
            None => return,
        };

        if from_scheduler {
            self.push_pending(PendingOutbound::RequestedCall {
                id,
                for_what: purpose.as_u8(),
            });
            self.request_flush();
            return;
        }

        match purpose {
            TimerPurpose::Mtbf => {
                self.fire_mtbf_failure();
                let delay = self.failure.next_mtbf_delay();
                self.arm_internal_timer(TimerPurpose::Mtbf, delay);
            }
            TimerPurpose::Smtbf => {
                self.fire_machine_failure(KillReason::Smtbf);
                let delay = self.failure.next_smtbf_delay();
                self.arm_internal_timer(TimerPurpose::Smtbf, delay);
            }
            TimerPurpose::FixedFailure => {
                self.fire_machine_failure(KillReason::FixedFailures);
                let delay = self.failure.next_fixed_delay();
                self.arm_internal_timer(TimerPurpose::FixedFailure, delay);
            }
            TimerPurpose::RepairDone => {
                if let Some(machine) = self.repair_timers.remove(&id) {
                    self.machines.borrow_mut().set_available(machine);
                    let mut resources = IntervalSet::new();
                    resources.insert(machine);
                    self.push_pending(PendingOutbound::NotifyResources {
                        notify_type: "event_resource_available",
                        resources,
                    });
                }
            }
            TimerPurpose::ReservationStart => {
                if let Some(job_id) = self.reservation_timers.remove(&id) {
                    self.start_reservation(job_id);
                }
            }
            TimerPurpose::CheckpointBatsim => {
                self.do_snapshot();
                let period = self
                    .config
                    .batsim_checkpoint
                    .as_ref()
                    .filter(|c| c.clock == CheckpointClock::Simulated)
                    .map(|c| c.period_seconds);
                if let Some(period) = period {
                    self.arm_internal_timer(TimerPurpose::CheckpointBatsim, period);
                }
            }
            // Only armed on behalf of the scheduler.
            TimerPurpose::CheckpointScheduler | TimerPurpose::Recover => {}
        }
        self.request_flush();
    }

    // ------------------------------------------------------------------
    // Failure injection
    // ------------------------------------------------------------------

    fn fire_mtbf_failure(&mut self) {
        if let Some((job_id, _)) = self.running_jobs.first().cloned() {
            log_info!(self.ctx, "MTBF failure kills job {}", job_id);
            self.push_pending(PendingOutbound::NotifyJobFault {
                job_id: job_id.to_string(),
            });
            self.kill_jobs(vec![(job_id, KillReason::Mtbf.as_u8())]);
        }
    }

    fn fire_machine_failure(&mut self, reason: KillReason) {
        let nb_compute = self.machines.borrow().nb_compute_machines();
        if nb_compute == 0 {
            return;
        }
        let machine = self.failure.pick_machine(nb_compute);
        log_info!(
            self.ctx,
            "machine failure ({:?}) hits machine {}",
            reason,
            machine
        );

        let mut resources = IntervalSet::new();
        resources.insert(machine);
        self.machines.borrow_mut().set_unavailable(machine);
        self.push_pending(PendingOutbound::NotifyResources {
            notify_type: "event_resource_unavailable",
            resources: resources.clone(),
        });
        let repair_delay = self.failure.repair_delay();
        let timer = self.arm_internal_timer(TimerPurpose::RepairDone, repair_delay);
        self.repair_timers.insert(timer, machine);

        let victims: Vec<(JobIdentifier, u8)> = {
            let workloads = self.workloads.borrow();
            self.running_jobs
                .iter()
                .filter(|(job_id, _)| {
                    workloads
                        .job_at(job_id)
                        .map(|job| job.allocation.contains(machine))
                        .unwrap_or(false)
                })
                .map(|(job_id, _)| (job_id.clone(), reason.as_u8()))
                .collect()
        };
        for (job_id, _) in &victims {
            self.push_pending(PendingOutbound::NotifyJobFault {
                job_id: job_id.to_string(),
            });
        }
        if !victims.is_empty() {
            self.kill_jobs(victims);
        }
    }

    // ------------------------------------------------------------------
    // Kills and resubmission
    // ------------------------------------------------------------------

    fn kill_jobs(&mut self, requests: Vec<(JobIdentifier, u8)>) {
        let group_id = self.next_kill_group;
        self.next_kill_group += 1;
        let mut group = KillGroup {
            remaining: 0,
            msgs: Vec::new(),
            resubmit: Vec::new(),
        };

        for (job_id, for_what) in requests {
            let running = self
                .running_jobs
                .iter()
                .find(|(id, _)| *id == job_id)
                .map(|(_, execution_id)| *execution_id);
            match running {
                Some(execution_id) => {
                    {
                        let mut workloads = self.workloads.borrow_mut();
                        if let Some(job) = workloads.job_at_mut(&job_id) {
                            job.kill_requested = true;
                        }
                    }
                    self.ctx.emit_now(
                        KillJobSignal {
                            execution_id,
                            job_id: job_id.to_string(),
                            group: group_id,
                            for_what,
                        },
                        self.executor_id,
                    );
                    group.remaining += 1;
                }
                None => {
                    // Not running: kill it in place (or just echo it back if
                    // it already reached a terminal state).
                    let mut workloads = self.workloads.borrow_mut();
                    if let Some(job) = workloads.job_at_mut(&job_id) {
                        if !job.state.is_terminal() {
                            job.state = JobState::CompletedKilled;
                            job.return_code = -1;
                            let (job_id_str, alloc) =
                                (job.id.to_string(), job.allocation.to_string_hyphen(" ", "-"));
                            drop(workloads);
                            self.nb_terminal_jobs += 1;
                            self.push_pending(PendingOutbound::JobCompleted {
                                job_id: job_id_str,
                                job_state: JobState::CompletedKilled.as_str(),
                                alloc,
                                return_code: -1,
                            });
                        }
                    }
                    group.msgs.push(KillMsgOut {
                        job_id: job_id.to_string(),
                        for_what,
                        progress: None,
                    });
                }
            }
        }

        if group.remaining == 0 {
            self.push_pending(PendingOutbound::JobKilled { msgs: group.msgs });
            self.request_flush();
        } else {
            self.kill_groups.insert(group_id, group);
        }
    }

    fn on_kill_ack(
        &mut self,
        group_id: u64,
        job_id: String,
        for_what: u8,
        progress: Option<Value>,
        progress_value: f64,
    ) {
        let finished = {
            let group = match self.kill_groups.get_mut(&group_id) {
                Some(group) => group,
                None => return,
            };
            group.msgs.push(KillMsgOut {
                job_id: job_id.clone(),
                for_what,
                progress,
            });
            if KillReason::from_u8(for_what).is_failure() && self.config.checkpointing.enabled {
                if let Ok(id) = JobIdentifier::from_string(&job_id) {
                    group.resubmit.push((id, progress_value));
                }
            }
            group.remaining -= 1;
            group.remaining == 0
        };
        if finished {
            let group = self.kill_groups.remove(&group_id).unwrap();
            self.push_pending(PendingOutbound::JobKilled { msgs: group.msgs });
            for (job_id, progress) in group.resubmit {
                self.resubmit_job(&job_id, progress);
            }
            self.request_flush();
        }
    }

    /// Rebuilds a failure-killed job as `id#k+1` whose profile holds the
    /// remaining work, and submits it at the current time.
    fn resubmit_job(&mut self, job_id: &JobIdentifier, progress: f64) {
        let now = self.ctx.time();
        let mut workloads = self.workloads.borrow_mut();
        let workload = match workloads.at_mut(job_id.workload_name()) {
            Some(workload) => workload,
            None => return,
        };
        let template = match workload.jobs.get(job_id) {
            Some(job) if job.from_workload && job.state == JobState::CompletedKilled => job.clone(),
            _ => return,
        };

        let new_id = template.id.next_resubmit();
        let new_profile_name = new_id.job_name();
        let old_profile = match workload.profiles.get(&template.profile_name) {
            Some(profile) => profile.clone(),
            None => return,
        };
        let mut new_profile = old_profile.rewrite_remaining(&new_profile_name, progress);
        if template.checkpoint_interval > 0.0 && template.dump_time > 0.0 {
            new_profile.rewrite_for_checkpointing(
                template.checkpoint_interval,
                template.dump_time,
                workload.speed,
            );
        }
        if workload.profiles.add(new_profile).is_err() {
            return;
        }
        let _ = workload.profiles.acquire(&new_profile_name);

        let mut job = template;
        job.id = new_id.clone();
        job.profile_name = new_profile_name.clone();
        job.state = JobState::Submitted;
        job.starting_time = -1.0;
        job.runtime = -1.0;
        job.progress = -1.0;
        job.return_code = -1;
        job.kill_requested = false;
        job.consumed_energy = -1.0;
        job.allocation = IntervalSet::new();
        job.task = None;
        job.submission_time = now;
        job.submission_times.push(now);
        job.json_description["profile"] = serde_json::json!(new_profile_name);
        job.json_description["submission_times"] = serde_json::json!(job.submission_times);
        job.sync_json_description();

        let job_json = job.json_description.clone();
        let profile_json = self
            .config
            .forward_profiles_on_submission
            .then(|| workload.profiles.get(&new_profile_name).unwrap().json.clone());
        if workload.jobs.add_job(job).is_err() {
            return;
        }
        drop(workloads);

        log_info!(self.ctx, "resubmitting killed job as {}", new_id);
        self.nb_submitted_jobs += 1;
        self.push_pending(PendingOutbound::JobSubmitted {
            job_id: new_id.to_string(),
            job_json,
            profile_json,
        });
    }

    // ------------------------------------------------------------------
    // Submission and completion
    // ------------------------------------------------------------------

    fn on_job_submitted(&mut self, job_id: String) {
        let job_id = match JobIdentifier::from_string(&job_id) {
            Ok(job_id) => job_id,
            Err(e) => {
                log_error!(self.ctx, "bad submission event: {}", e);
                return;
            }
        };
        let (job_json, profile_name, purpose, start, walltime) = {
            let mut workloads = self.workloads.borrow_mut();
            let job = match workloads.job_at_mut(&job_id) {
                Some(job) => job,
                None => {
                    log_error!(self.ctx, "submission of unknown job {}", job_id);
                    return;
                }
            };
            job.state = JobState::Submitted;
            (
                job.json_description.clone(),
                job.profile_name.clone(),
                job.purpose,
                job.start,
                job.walltime,
            )
        };
        let profile_json = if self.config.forward_profiles_on_submission {
            let workloads = self.workloads.borrow();
            workloads
                .at(job_id.workload_name())
                .and_then(|w| w.profiles.get(&profile_name))
                .map(|p| p.json.clone())
        } else {
            None
        };

        self.nb_submitted_jobs += 1;
        self.push_pending(PendingOutbound::JobSubmitted {
            job_id: job_id.to_string(),
            job_json,
            profile_json,
        });

        if purpose == JobPurpose::Reservation {
            if walltime <= 0.0 {
                self.reject_job_in_place(&job_id, JobState::RejectedNoWalltime);
            } else {
                let delay = (start - self.ctx.time()).max(0.0);
                let timer = self.arm_internal_timer(TimerPurpose::ReservationStart, delay);
                self.reservation_timers.insert(timer, job_id.clone());
            }
        }
        self.request_flush();
    }

    fn on_job_completed(&mut self, job_id: String) {
        let job_id = match JobIdentifier::from_string(&job_id) {
            Ok(job_id) => job_id,
            Err(_) => return,
        };
        self.running_jobs.retain(|(id, _)| *id != job_id);

        let workloads = self.workloads.borrow();
        let job = match workloads.job_at(&job_id) {
            Some(job) => job,
            None => return,
        };
        let state = job.state;
        let alloc = job.allocation.to_string_hyphen(" ", "-");
        let return_code = job.return_code;
        self.checkpoint.tracer_record(job);
        drop(workloads);

        self.nb_terminal_jobs += 1;
        self.push_pending(PendingOutbound::JobCompleted {
            job_id: job_id.to_string(),
            job_state: state.as_str(),
            alloc,
            return_code,
        });
        self.request_flush();
    }

    fn on_submitter_done(&mut self) {
        self.submitters_remaining = self.submitters_remaining.saturating_sub(1);
        if self.submitters_remaining == 0 {
            self.push_pending(PendingOutbound::Notify {
                notify_type: "no_more_static_job_to_submit",
            });
        }
        self.request_flush();
    }

    /// Rejects a job that never reaches an actor, surfacing the REJECTED_*
    /// state through a JOB_COMPLETED event.
    fn reject_job_in_place(&mut self, job_id: &JobIdentifier, state: JobState) {
        let mut workloads = self.workloads.borrow_mut();
        if let Some(job) = workloads.job_at_mut(job_id) {
            job.state = state;
            job.return_code = -1;
        }
        drop(workloads);
        self.nb_terminal_jobs += 1;
        self.push_pending(PendingOutbound::JobCompleted {
            job_id: job_id.to_string(),
            job_state: state.as_str(),
            alloc: String::new(),
            return_code: -1,
        });
        self.request_flush();
    }

    // ------------------------------------------------------------------
    // Reservations
    // ------------------------------------------------------------------

    fn start_reservation(&mut self, job_id: JobIdentifier) {
        let (state, future_allocation) = {
            let workloads = self.workloads.borrow();
            match workloads.job_at(&job_id) {
                Some(job) => (job.state, job.future_allocation.clone()),
                None => return,
            }
        };
        if state != JobState::Submitted {
            return;
        }
        if future_allocation.is_empty() {
            self.reject_job_in_place(&job_id, JobState::RejectedNoReservationAllocation);
            return;
        }
        if !self.machines.borrow().allocation_available(&future_allocation) {
            self.reject_job_in_place(&job_id, JobState::RejectedNotEnoughAvailableResources);
            return;
        }
        self.spawn_execution(job_id, future_allocation, Vec::new(), FxHashMap::default(), None);
    }

    fn spawn_execution(
        &mut self,
        job_id: JobIdentifier,
        machine_ids: IntervalSet,
        mapping: Vec<u32>,
        storage_mapping: FxHashMap<String, u32>,
        io_profile: Option<String>,
    ) {
        let execution_id = self.storage.borrow_mut().allocate_execution_id();
        self.storage.borrow_mut().set_execution_request(ExecutionRequest {
            execution_id,
            job_id: job_id.clone(),
            machine_ids,
            mapping,
            storage_mapping,
            io_profile,
        });
        self.running_jobs.push((job_id, execution_id));
        self.ctx
            .emit_now(ScheduleJobExecution { execution_id }, self.executor_id);
    }

    // ------------------------------------------------------------------
    // Scheduler reply dispatch
    // ------------------------------------------------------------------

    fn handle_scheduler_event(&mut self, event: SchedulerEvent) -> Result<(), ProtocolError> {
        match event {
            SchedulerEvent::QueryConsumedEnergy => {
                let consumed_energy = self.machines.borrow().total_consumed_energy();
                self.push_pending(PendingOutbound::AnswerEnergy { consumed_energy });
                Ok(())
            }
            SchedulerEvent::AnswerEstimateWaitingTime {
                job_id,
                estimated_waiting_time,
            } => {
                warn!(
                    "received an ANSWER of type 'estimate_waiting_time' with job_id='{}' \
                     and 'estimated_waiting_time'={}, which nothing consumes",
                    job_id, estimated_waiting_time
                );
                Ok(())
            }
            SchedulerEvent::RejectJob { job_id } => self.handle_reject_job(&job_id),
            SchedulerEvent::ExecuteJob {
                job_id,
                alloc,
                mapping,
                storage_mapping,
                additional_io_job,
            } => self.handle_execute_job(&job_id, alloc, mapping, storage_mapping, additional_io_job),
            SchedulerEvent::ChangeJobState { job_id, job_state } => {
                self.handle_change_job_state(&job_id, &job_state)
            }
            SchedulerEvent::CallMeLater {
                target_time,
                id,
                for_what,
            } => {
                let now = self.ctx.time();
                if target_time < now {
                    warn!(
                        "CALL_ME_LATER asks to be called at time {} but it is already reached",
                        target_time
                    );
                }
                let purpose =
                    TimerPurpose::from_u8(for_what).unwrap_or(TimerPurpose::CheckpointScheduler);
                self.armed_timers.push(ArmedTimer {
                    target_time: target_time.max(now),
                    id,
                    purpose,
                    from_scheduler: true,
                });
                self.ctx.emit_self(
                    TimerFired {
                        id,
                        purpose: purpose.as_u8(),
                        from_scheduler: true,
                    },
                    (target_time - now).max(0.0),
                );
                Ok(())
            }
            SchedulerEvent::KillJob { job_msgs } => {
                let mut requests = Vec::with_capacity(job_msgs.len());
                for msg in job_msgs {
                    let job_id = JobIdentifier::from_string(&msg.job_id)
                        .map_err(|e| ProtocolError::Violation(e.to_string()))?;
                    if !self.workloads.borrow().job_is_registered(&job_id) {
                        return Err(ProtocolError::Violation(format!(
                            "KILL_JOB references the non-existent job '{}'",
                            job_id
                        )));
                    }
                    requests.push((job_id, msg.for_what));
                }
                self.kill_jobs(requests);
                Ok(())
            }
            SchedulerEvent::RegisterJob { job_id, job } => self.handle_register_job(&job_id, job),
            SchedulerEvent::RegisterProfile {
                workload_name,
                profile_name,
                profile,
            } => self.handle_register_profile(&workload_name, &profile_name, profile),
            SchedulerEvent::SetResourceState { resources, state } => {
                if !self.machines.borrow().allocation_within_range(&resources) {
                    return Err(ProtocolError::Violation(format!(
                        "SET_RESOURCE_STATE references machines outside the platform: {}",
                        resources
                    )));
                }
                self.machines.borrow_mut().set_pstate(&resources, state);
                self.push_pending(PendingOutbound::ResourceStateChanged {
                    resources,
                    state: state.to_string(),
                });
                Ok(())
            }
            SchedulerEvent::SetJobMetadata { job_id, metadata } => {
                let job_id = JobIdentifier::from_string(&job_id)
                    .map_err(|e| ProtocolError::Violation(e.to_string()))?;
                let mut workloads = self.workloads.borrow_mut();
                match workloads.job_at_mut(&job_id) {
                    Some(job) => {
                        job.metadata = metadata;
                        Ok(())
                    }
                    None => Err(ProtocolError::Violation(format!(
                        "SET_JOB_METADATA references the non-existent job '{}'",
                        job_id
                    ))),
                }
            }
            SchedulerEvent::Notify(notify) => self.handle_notify(notify),
            SchedulerEvent::ToJobMsg { job_id, msg } => {
                let job_id = JobIdentifier::from_string(&job_id)
                    .map_err(|e| ProtocolError::Violation(e.to_string()))?;
                let mut workloads = self.workloads.borrow_mut();
                match workloads.job_at_mut(&job_id) {
                    Some(job) => {
                        job.incoming_messages.push(msg);
                        Ok(())
                    }
                    None => Err(ProtocolError::Violation(format!(
                        "TO_JOB_MSG references the non-existent job '{}'",
                        job_id
                    ))),
                }
            }
        }
    }

    fn handle_reject_job(&mut self, job_id: &str) -> Result<(), ProtocolError> {
        let job_id =
            JobIdentifier::from_string(job_id).map_err(|e| ProtocolError::Violation(e.to_string()))?;
        let mut workloads = self.workloads.borrow_mut();
        let job = workloads.job_at_mut(&job_id).ok_or_else(|| {
            ProtocolError::Violation(format!("REJECT_JOB references the non-existent job '{}'", job_id))
        })?;
        if job.state != JobState::Submitted {
            return Err(ProtocolError::Violation(format!(
                "REJECT_JOB on job '{}' which is in state {}",
                job_id,
                job.state.as_str()
            )));
        }
        job.state = JobState::RejectedNotEnoughResources;
        drop(workloads);
        self.nb_terminal_jobs += 1;
        Ok(())
    }

    fn handle_execute_job(
        &mut self,
        job_id: &str,
        alloc: IntervalSet,
        mapping: Vec<u32>,
        storage_mapping: FxHashMap<String, u32>,
        additional_io_job: Option<IoJobDescription>,
    ) -> Result<(), ProtocolError> {
        let job_id =
            JobIdentifier::from_string(job_id).map_err(|e| ProtocolError::Violation(e.to_string()))?;

        let (state, requested_nb_res) = {
            let workloads = self.workloads.borrow();
            let job = workloads.job_at(&job_id).ok_or_else(|| {
                ProtocolError::Violation(format!(
                    "EXECUTE_JOB references the non-existent job '{}'",
                    job_id
                ))
            })?;
            (job.state, job.requested_nb_res)
        };
        if state != JobState::Submitted {
            return Err(ProtocolError::Violation(format!(
                "EXECUTE_JOB on job '{}' which is in state {}",
                job_id,
                state.as_str()
            )));
        }
        if !self.machines.borrow().allocation_within_range(&alloc) {
            return Err(ProtocolError::Violation(format!(
                "EXECUTE_JOB allocates machines outside the platform: {}",
                alloc
            )));
        }

        // Resource shortfalls are modeled outcomes, not protocol errors.
        if alloc.size() < requested_nb_res {
            self.reject_job_in_place(&job_id, JobState::RejectedNotEnoughResources);
            return Ok(());
        }
        let sharing_ok = self.config.allow_compute_sharing
            || self.machines.borrow().allocation_free_of_jobs(&alloc);
        if !self.machines.borrow().allocation_available(&alloc) || !sharing_ok {
            self.reject_job_in_place(&job_id, JobState::RejectedNotEnoughAvailableResources);
            return Ok(());
        }

        let io_profile = match additional_io_job {
            None => None,
            Some(io) => Some(self.register_io_profile(&job_id, io)?),
        };

        self.spawn_execution(job_id, alloc, mapping, storage_mapping, io_profile);
        Ok(())
    }

    /// Registers the EXECUTE_JOB additional IO profile (if carried inline)
    /// and checks it can be merged with the job profile.
    fn register_io_profile(
        &mut self,
        job_id: &JobIdentifier,
        io: IoJobDescription,
    ) -> Result<String, ProtocolError> {
        let mut workloads = self.workloads.borrow_mut();
        let workload = workloads
            .at_mut(job_id.workload_name())
            .expect("the job's workload exists");
        if let Some(profile_json) = io.profile {
            if workload.profiles.exists(&io.profile_name) {
                return Err(ProtocolError::Violation(format!(
                    "the given profile name '{}' already exists",
                    io.profile_name
                )));
            }
            let profile = Profile::from_json(&io.profile_name, profile_json)
                .map_err(|e| ProtocolError::Violation(e.to_string()))?;
            workload
                .profiles
                .add(profile)
                .map_err(|e| ProtocolError::Violation(e.to_string()))?;
        }
        if !workload.profiles.exists(&io.profile_name) {
            return Err(ProtocolError::Violation(format!(
                "the given profile name '{}' does not exist",
                io.profile_name
            )));
        }
        let job_profile_name = workload
            .jobs
            .get(job_id)
            .map(|job| job.profile_name.clone())
            .expect("the job exists");
        let job_profile = workload.profiles.get(&job_profile_name).unwrap();
        let io_profile = workload.profiles.get(&io.profile_name).unwrap();
        validate_io_merge(job_profile, io_profile)
            .map_err(|e| ProtocolError::Violation(e.to_string()))?;
        Ok(io.profile_name)
    }

    fn handle_change_job_state(&mut self, job_id: &str, job_state: &str) -> Result<(), ProtocolError> {
        let job_id =
            JobIdentifier::from_string(job_id).map_err(|e| ProtocolError::Violation(e.to_string()))?;
        let new_state = JobState::from_str(job_state).ok_or_else(|| {
            ProtocolError::Violation(format!("CHANGE_JOB_STATE to unknown state '{}'", job_state))
        })?;
        let mut workloads = self.workloads.borrow_mut();
        let job = workloads.job_at_mut(&job_id).ok_or_else(|| {
            ProtocolError::Violation(format!(
                "CHANGE_JOB_STATE references the non-existent job '{}'",
                job_id
            ))
        })?;
        let was_terminal = job.state.is_terminal();
        job.state = new_state;
        drop(workloads);
        if !was_terminal && new_state.is_terminal() {
            self.nb_terminal_jobs += 1;
        }
        Ok(())
    }

    fn handle_register_job(&mut self, job_id: &str, job: Value) -> Result<(), ProtocolError> {
        if !self.config.dynamic_registration.enabled {
            return Err(ProtocolError::Violation(
                "dynamic job registration received but the option is disabled".to_string(),
            ));
        }
        if self.registration_finished {
            return Err(ProtocolError::Violation(
                "dynamic job registration received after registration_finished".to_string(),
            ));
        }
        let job_id =
            JobIdentifier::from_string(job_id).map_err(|e| ProtocolError::Violation(e.to_string()))?;
        let registered = {
            let mut workloads = self.workloads.borrow_mut();
            let workload = workloads.at_mut(job_id.workload_name()).ok_or_else(|| {
                ProtocolError::Violation(format!(
                    "REGISTER_JOB for the non-existent workload '{}'",
                    job_id.workload_name()
                ))
            })?;
            if workload.jobs.exists(&job_id) {
                return Err(ProtocolError::Violation(format!(
                    "cannot register job '{}', it already exists in the workload",
                    job_id
                )));
            }
            let registered = workload
                .register_job(&job)
                .map_err(|e| ProtocolError::Violation(e.to_string()))?;
            let job = workload.jobs.get_mut(&registered).unwrap();
            job.state = JobState::Submitted;
            job.from_workload = false;
            registered
        };
        log_debug!(self.ctx, "dynamically registered job {}", registered);

        self.nb_submitted_jobs += 1;
        if self.config.dynamic_registration.ack {
            let workloads = self.workloads.borrow();
            let job = workloads.job_at(&registered).unwrap();
            let job_json = job.json_description.clone();
            drop(workloads);
            self.push_pending(PendingOutbound::JobSubmitted {
                job_id: registered.to_string(),
                job_json,
                profile_json: None,
            });
        }
        Ok(())
    }

    fn handle_register_profile(
        &mut self,
        workload_name: &str,
        profile_name: &str,
        profile: Value,
    ) -> Result<(), ProtocolError> {
        if !self.config.dynamic_registration.enabled {
            return Err(ProtocolError::Violation(
                "dynamic profile registration received but the option is disabled".to_string(),
            ));
        }
        if self.registration_finished {
            return Err(ProtocolError::Violation(
                "dynamic profile registration received after registration_finished".to_string(),
            ));
        }
        let mut workloads = self.workloads.borrow_mut();
        if !workloads.exists(workload_name) {
            let workload = Workload::new_dynamic(workload_name, &self.config);
            workloads
                .insert_workload(workload)
                .map_err(|e| ProtocolError::Violation(e.to_string()))?;
        }
        let workload = workloads.at_mut(workload_name).unwrap();
        if workload.profiles.exists(profile_name) {
            return Err(ProtocolError::Violation(format!(
                "profile '{}' already existed in workload '{}'",
                profile_name, workload_name
            )));
        }
        let profile = Profile::from_json(profile_name, profile)
            .map_err(|e| ProtocolError::Violation(e.to_string()))?;
        workload
            .profiles
            .add(profile)
            .map_err(|e| ProtocolError::Violation(e.to_string()))?;
        Ok(())
    }

    fn handle_notify(&mut self, notify: NotifyEvent) -> Result<(), ProtocolError> {
        match notify {
            NotifyEvent::RegistrationFinished => {
                self.registration_finished = true;
            }
            NotifyEvent::ContinueRegistration => {
                self.registration_finished = false;
            }
            NotifyEvent::Checkpoint => {
                self.do_snapshot();
                // Ask the scheduler to write its own state alongside ours.
                self.armed_timers.push(ArmedTimer {
                    target_time: self.ctx.time(),
                    id: 1,
                    purpose: TimerPurpose::CheckpointScheduler,
                    from_scheduler: true,
                });
                self.ctx.emit_self_now(TimerFired {
                    id: 1,
                    purpose: TimerPurpose::CheckpointScheduler.as_u8(),
                    from_scheduler: true,
                });
            }
            NotifyEvent::RecoverFromCheckpoint => {
                self.armed_timers.push(ArmedTimer {
                    target_time: self.ctx.time(),
                    id: 1,
                    purpose: TimerPurpose::Recover,
                    from_scheduler: true,
                });
                self.ctx.emit_self_now(TimerFired {
                    id: 1,
                    purpose: TimerPurpose::Recover.as_u8(),
                    from_scheduler: true,
                });
            }
            NotifyEvent::Scalar { kind, value } => {
                let t = &mut self.telemetry;
                match kind.as_str() {
                    "queue_size" => t.queue_size = value.parse().ok(),
                    "schedule_size" => t.schedule_size = value.parse().ok(),
                    "number_running_jobs" => t.nb_running_jobs = value.parse().ok(),
                    "utilization" => t.utilization = value.parse().ok(),
                    "utilization_no_resv" => t.utilization_no_resv = value.parse().ok(),
                    "PID" => t.batsched_pid = value.parse().ok(),
                    _ => {}
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Batsim-level checkpointing
    // ------------------------------------------------------------------

    fn do_snapshot(&mut self) {
        let now = self.ctx.time();
        let pending_timers: Vec<ArmedTimer> = self
            .armed_timers
            .iter()
            .filter(|t| t.target_time >= now)
            .cloned()
            .collect();
        let result = self.checkpoint.snapshot(
            &self.workloads.borrow(),
            &self.machines.borrow(),
            &pending_timers,
            now,
            self.nb_terminal_jobs as u32,
        );
        match result {
            Ok(dir) => log_info!(self.ctx, "wrote checkpoint {}", dir.display()),
            Err(e) => log_error!(self.ctx, "checkpoint failed: {}", e),
        }
    }

    fn maybe_real_clock_checkpoint(&mut self) {
        let due = self
            .config
            .batsim_checkpoint
            .as_ref()
            .filter(|c| c.clock == CheckpointClock::Real)
            .is_some_and(|c| self.last_real_checkpoint.elapsed().as_secs_f64() >= c.period_seconds);
        if due {
            self.last_real_checkpoint = Instant::now();
            self.do_snapshot();
        }
    }

    // ------------------------------------------------------------------
    // Startup
    // ------------------------------------------------------------------

    fn on_simulation_start(&mut self) {
        log_info!(self.ctx, "simulation starts");
        self.push_pending(PendingOutbound::SimulationBegins);
        self.arm_failure_timers();
        // Re-arm the scheduler call-me-laters carried over by a restore.
        let restored = self.config.restored_call_me_laters.clone();
        for timer in restored {
            let purpose =
                TimerPurpose::from_u8(timer.for_what).unwrap_or(TimerPurpose::CheckpointScheduler);
            self.armed_timers.push(ArmedTimer {
                target_time: self.ctx.time() + timer.delay.max(0.0),
                id: timer.id,
                purpose,
                from_scheduler: true,
            });
            self.ctx.emit_self(
                TimerFired {
                    id: timer.id,
                    purpose: purpose.as_u8(),
                    from_scheduler: true,
                },
                timer.delay.max(0.0),
            );
        }
        let period = self
            .config
            .batsim_checkpoint
            .as_ref()
            .filter(|c| c.clock == CheckpointClock::Simulated)
            .map(|c| c.period_seconds);
        if let Some(period) = period {
            self.arm_internal_timer(TimerPurpose::CheckpointBatsim, period);
        }
        self.request_flush();
    }
}

impl EventHandler for Server {
    fn on(&mut self, event: Event) {
        if self.fatal_error.is_some() {
            return;
        }
        cast!(match event.data {
            SimulationStart {} => {
                self.on_simulation_start();
            }
            FlushReady {} => {
                self.on_flush_ready();
            }
            JobSubmittedEvent { job_id } => {
                self.on_job_submitted(job_id);
            }
            JobCompletedEvent { job_id } => {
                self.on_job_completed(job_id);
            }
            KillAckEvent {
                group,
                job_id,
                for_what,
                progress,
                progress_value,
            } => {
                self.on_kill_ack(group, job_id, for_what, progress, progress_value);
            }
            TimerFired {
                id,
                purpose,
                from_scheduler,
            } => {
                self.on_timer_fired(id, purpose, from_scheduler);
            }
            SubmitterDone {} => {
                self.on_submitter_done();
            }
        });
    }
}
