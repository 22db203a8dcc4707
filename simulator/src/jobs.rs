use std::fmt;

use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::{json, Value};
use thiserror::Error;

use crate::interval_set::IntervalSet;
use crate::profiles::{Profile, ProfileData, ProfileStore};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid job identifier '{0}': {1}")]
    InvalidIdentifier(String, String),
    #[error("job '{0}': missing or invalid field '{1}'")]
    InvalidField(String, String),
    #[error("job '{0}': the associated profile '{1}' does not exist")]
    UnknownProfile(String, String),
    #[error("job '{0}': {1}")]
    Invalid(String, String),
}

/// Identifies one job: `workload!name[#resubmit][$checkpoint]`.
///
/// Neither the workload name nor the job name may contain `'!'`; equality
/// and hashing go through the canonical string representation.
#[derive(Clone, Debug)]
pub struct JobIdentifier {
    workload: String,
    name: String,
    number: i64,
    resubmit: Option<u32>,
    checkpoint: Option<u32>,
    repr: String,
}

impl JobIdentifier {
    pub fn new(workload: &str, job_name: &str) -> Result<Self, JobError> {
        if workload.contains('!') {
            return Err(JobError::InvalidIdentifier(
                format!("{}!{}", workload, job_name),
                format!("workload name '{}' contains a '!'", workload),
            ));
        }
        if job_name.contains('!') {
            return Err(JobError::InvalidIdentifier(
                format!("{}!{}", workload, job_name),
                format!("job name '{}' contains a '!'", job_name),
            ));
        }

        let (rest, checkpoint) = match job_name.rsplit_once('$') {
            Some((rest, n)) => {
                let n = n.parse().map_err(|_| {
                    JobError::InvalidIdentifier(
                        format!("{}!{}", workload, job_name),
                        format!("bad checkpoint counter '{}'", n),
                    )
                })?;
                (rest, Some(n))
            }
            None => (job_name, None),
        };
        let (base, resubmit) = match rest.rsplit_once('#') {
            Some((base, k)) => {
                let k = k.parse().map_err(|_| {
                    JobError::InvalidIdentifier(
                        format!("{}!{}", workload, job_name),
                        format!("bad resubmit counter '{}'", k),
                    )
                })?;
                (base, Some(k))
            }
            None => (rest, None),
        };

        let number = base.parse::<i64>().unwrap_or(-1);
        let mut id = JobIdentifier {
            workload: workload.to_string(),
            name: base.to_string(),
            number,
            resubmit,
            checkpoint,
            repr: String::new(),
        };
        id.repr = id.representation();
        Ok(id)
    }

    pub fn from_string(id_str: &str) -> Result<Self, JobError> {
        match id_str.split_once('!') {
            Some((workload, job_name)) => Self::new(workload, job_name),
            None => Err(JobError::InvalidIdentifier(
                id_str.to_string(),
                "expected two '!'-separated parts, e.g. 'some_workload!42'".to_string(),
            )),
        }
    }

    fn representation(&self) -> String {
        let mut repr = format!("{}!{}", self.workload, self.name);
        if let Some(k) = self.resubmit {
            repr.push('#');
            repr.push_str(&k.to_string());
        }
        if let Some(n) = self.checkpoint {
            repr.push('$');
            repr.push_str(&n.to_string());
        }
        repr
    }

    pub fn workload_name(&self) -> &str {
        &self.workload
    }

    /// The job name within its workload, counters included.
    pub fn job_name(&self) -> String {
        self.repr[self.workload.len() + 1..].to_string()
    }

    pub fn base_name(&self) -> &str {
        &self.name
    }

    pub fn job_number(&self) -> i64 {
        self.number
    }

    pub fn resubmit_count(&self) -> u32 {
        self.resubmit.unwrap_or(0)
    }

    pub fn checkpoint_count(&self) -> Option<u32> {
        self.checkpoint
    }

    /// The identifier of the next resubmission of this job.
    pub fn next_resubmit(&self) -> JobIdentifier {
        let mut id = self.clone();
        id.resubmit = Some(self.resubmit.map_or(1, |k| k + 1));
        id.repr = id.representation();
        id
    }

    pub fn with_checkpoint(&self, n: u32) -> JobIdentifier {
        let mut id = self.clone();
        id.checkpoint = Some(n);
        id.repr = id.representation();
        id
    }
}

impl fmt::Display for JobIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr)
    }
}

impl PartialEq for JobIdentifier {
    fn eq(&self, other: &Self) -> bool {
        self.repr == other.repr
    }
}

impl Eq for JobIdentifier {}

impl std::hash::Hash for JobIdentifier {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.repr.hash(state);
    }
}

impl PartialOrd for JobIdentifier {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for JobIdentifier {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.repr.cmp(&other.repr)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    NotSubmitted,
    Submitted,
    Running,
    CompletedSuccessfully,
    CompletedFailed,
    CompletedWalltimeReached,
    CompletedKilled,
    RejectedNotEnoughResources,
    RejectedNotEnoughAvailableResources,
    RejectedNoWalltime,
    RejectedNoReservationAllocation,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            JobState::NotSubmitted | JobState::Submitted | JobState::Running
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::NotSubmitted => "NOT_SUBMITTED",
            JobState::Submitted => "SUBMITTED",
            JobState::Running => "RUNNING",
            JobState::CompletedSuccessfully => "COMPLETED_SUCCESSFULLY",
            JobState::CompletedFailed => "COMPLETED_FAILED",
            JobState::CompletedWalltimeReached => "COMPLETED_WALLTIME_REACHED",
            JobState::CompletedKilled => "COMPLETED_KILLED",
            JobState::RejectedNotEnoughResources => "REJECTED_NOT_ENOUGH_RESOURCES",
            JobState::RejectedNotEnoughAvailableResources => {
                "REJECTED_NOT_ENOUGH_AVAILABLE_RESOURCES"
            }
            JobState::RejectedNoWalltime => "REJECTED_NO_WALLTIME",
            JobState::RejectedNoReservationAllocation => "REJECTED_NO_RESERVATION_ALLOCATION",
        }
    }

    pub fn from_str(state: &str) -> Option<JobState> {
        Some(match state {
            "NOT_SUBMITTED" => JobState::NotSubmitted,
            "SUBMITTED" => JobState::Submitted,
            "RUNNING" => JobState::Running,
            "COMPLETED_SUCCESSFULLY" => JobState::CompletedSuccessfully,
            "COMPLETED_FAILED" => JobState::CompletedFailed,
            "COMPLETED_WALLTIME_REACHED" => JobState::CompletedWalltimeReached,
            "COMPLETED_KILLED" => JobState::CompletedKilled,
            "REJECTED_NOT_ENOUGH_RESOURCES" => JobState::RejectedNotEnoughResources,
            "REJECTED_NOT_ENOUGH_AVAILABLE_RESOURCES" => {
                JobState::RejectedNotEnoughAvailableResources
            }
            "REJECTED_NO_WALLTIME" => JobState::RejectedNoWalltime,
            "REJECTED_NO_RESERVATION_ALLOCATION" => JobState::RejectedNoReservationAllocation,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobPurpose {
    Job,
    Reservation,
}

const NO_TASK: usize = usize::MAX;

/// The live instantiation of a job's profile.
///
/// The tree shape is fixed when the job starts; only progress fields
/// (leaf start times, sequence indices) mutate afterwards.
#[derive(Clone, Debug)]
pub struct BatTask {
    pub profile_name: String,
    pub kind: BatTaskKind,
}

#[derive(Clone, Debug)]
pub enum BatTaskKind {
    /// A parallel leaf; `start`/`duration` are set once execution begins.
    Parallel { start: f64, duration: f64, started: bool },
    /// A delay leaf.
    Delay { start: f64, required: f64, started: bool },
    /// A sequence node; `current` is `NO_TASK` until the first child runs.
    Sequence {
        children: Vec<BatTask>,
        current: usize,
    },
}

impl BatTask {
    /// Mirrors the profile structure, expanding sequence repeats.
    pub fn from_profile(profile: &Profile, store: &ProfileStore) -> BatTask {
        match &profile.data {
            ProfileData::Sequence { seq, repeat } => {
                let mut children = Vec::with_capacity(seq.len() * *repeat as usize);
                for _ in 0..*repeat {
                    for child_name in seq {
                        let child = store
                            .get(child_name)
                            .expect("sequence children are resolved at workload validation");
                        children.push(BatTask::from_profile(child, store));
                    }
                }
                BatTask {
                    profile_name: profile.name.clone(),
                    kind: BatTaskKind::Sequence {
                        children,
                        current: NO_TASK,
                    },
                }
            }
            ProfileData::Delay { delay, .. } => BatTask {
                profile_name: profile.name.clone(),
                kind: BatTaskKind::Delay {
                    start: -1.0,
                    required: *delay,
                    started: false,
                },
            },
            _ => BatTask {
                profile_name: profile.name.clone(),
                kind: BatTaskKind::Parallel {
                    start: -1.0,
                    duration: 0.0,
                    started: false,
                },
            },
        }
    }

    pub fn start_leaf(&mut self, now: f64, required: f64) {
        match &mut self.kind {
            BatTaskKind::Parallel {
                start,
                duration,
                started,
            } => {
                *start = now;
                *duration = required;
                *started = true;
            }
            BatTaskKind::Delay {
                start,
                required: req,
                started,
            } => {
                *start = now;
                *req = required;
                *started = true;
            }
            BatTaskKind::Sequence { .. } => panic!("start_leaf called on a sequence node"),
        }
    }

    pub fn set_current(&mut self, index: usize) {
        match &mut self.kind {
            BatTaskKind::Sequence { children, current } => {
                assert!(index < children.len(), "task tree shape mismatch");
                *current = index;
            }
            _ => panic!("set_current called on a leaf"),
        }
    }

    pub fn child_mut(&mut self, index: usize) -> &mut BatTask {
        match &mut self.kind {
            BatTaskKind::Sequence { children, .. } => &mut children[index],
            _ => panic!("child_mut called on a leaf"),
        }
    }

    /// Progress in [0, 1]: leaves report elapsed over required, a sequence
    /// node reports its current child's progress.
    pub fn compute_progress(&self, now: f64) -> f64 {
        match &self.kind {
            BatTaskKind::Parallel {
                start,
                duration,
                started,
            } => {
                if !started {
                    0.0
                } else if *duration == 0.0 {
                    1.0
                } else {
                    ((now - start) / duration).clamp(0.0, 1.0)
                }
            }
            BatTaskKind::Delay {
                start,
                required,
                started,
            } => {
                if !started {
                    0.0
                } else if *required == 0.0 {
                    1.0
                } else {
                    ((now - start) / required).clamp(0.0, 1.0)
                }
            }
            BatTaskKind::Sequence { children, current } => {
                if *current == NO_TASK {
                    0.0
                } else {
                    children[*current].compute_progress(now)
                }
            }
        }
    }

    /// Serializable progress snapshot, in the shape the scheduler receives
    /// within JOB_KILLED messages.
    pub fn progress_json(&self, now: f64) -> Value {
        match &self.kind {
            BatTaskKind::Parallel { .. } | BatTaskKind::Delay { .. } => json!({
                "profile_name": self.profile_name,
                "progress": self.compute_progress(now),
            }),
            BatTaskKind::Sequence { children, current } => {
                if *current == NO_TASK {
                    json!({
                        "profile_name": self.profile_name,
                        "current_task_index": -1,
                    })
                } else {
                    json!({
                        "profile_name": self.profile_name,
                        "current_task_index": *current,
                        "current_task": children[*current].progress_json(now),
                    })
                }
            }
        }
    }
}

/// Workload knobs a job needs while being parsed.
pub struct JobParseContext {
    pub workload_name: String,
    pub checkpointing_on: bool,
    pub compute_checkpointing: bool,
    pub compute_checkpointing_error: f64,
    pub mtbf: Option<f64>,
    pub smtbf: Option<f64>,
    pub num_machines: u32,
    pub global_checkpointing_interval: Option<f64>,
    pub performance_factor: f64,
    pub speed: f64,
    /// Set when loading a batsim-level checkpoint; requires runtime fields.
    pub nb_checkpoint: Option<u32>,
}

#[derive(Clone)]
pub struct Job {
    pub id: JobIdentifier,
    pub profile_name: String,
    pub json_description: Value,

    // User inputs
    pub submission_time: f64,
    pub walltime: f64,
    pub original_walltime: f64,
    pub requested_nb_res: u32,
    pub cores: u32,
    pub purpose: JobPurpose,
    pub start: f64,
    pub future_allocation: IntervalSet,
    pub smpi_ranks_to_hosts_mapping: Vec<u32>,

    // Checkpoint attributes (-1 means unset)
    pub checkpoint_interval: f64,
    pub dump_time: f64,
    pub read_time: f64,

    // Mutable runtime state
    pub state: JobState,
    pub starting_time: f64,
    pub runtime: f64,
    pub consumed_energy: f64,
    pub kill_requested: bool,
    pub return_code: i32,
    pub progress: f64,
    pub allocation: IntervalSet,
    pub metadata: String,
    pub batsim_metadata: String,
    pub incoming_messages: Vec<String>,
    pub submission_times: Vec<f64>,
    pub jitter: String,
    pub from_workload: bool,
    pub original_submit: f64,
    pub original_start: f64,
    pub progress_time_cpu: f64,

    pub task: Option<BatTask>,
}

impl Job {
    /// Parses a job from its JSON description, validating every field and
    /// applying the workload-level profile rewrites (performance factor,
    /// checkpoint expansion) for first-submission jobs.
    pub fn from_json(
        json_desc: &Value,
        ctx: &JobParseContext,
        profiles: &mut ProfileStore,
    ) -> Result<Job, JobError> {
        let err_id = json_desc
            .get("id")
            .map(|v| v.to_string())
            .unwrap_or_else(|| "<no id>".to_string());

        if !json_desc.is_object() {
            return Err(JobError::Invalid(err_id, "not a JSON object".to_string()));
        }

        // Identifier: a string or an integer, canonicalized to
        // workload!name at parse time.
        let id_value = json_desc
            .get("id")
            .ok_or_else(|| JobError::InvalidField(err_id.clone(), "id".to_string()))?;
        let id_str = match id_value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return Err(JobError::InvalidField(err_id, "id".to_string())),
        };
        let id = if id_str.contains('!') {
            JobIdentifier::from_string(&id_str)?
        } else {
            JobIdentifier::new(&ctx.workload_name, &id_str)?
        };
        let id_repr = id.to_string();

        let submission_time = json_desc
            .get("subtime")
            .and_then(Value::as_f64)
            .ok_or_else(|| JobError::InvalidField(id_repr.clone(), "subtime".to_string()))?;

        let walltime = match json_desc.get("walltime") {
            None => -1.0,
            Some(v) => v
                .as_f64()
                .ok_or_else(|| JobError::InvalidField(id_repr.clone(), "walltime".to_string()))?,
        };
        if walltime != -1.0 && walltime <= 0.0 {
            return Err(JobError::Invalid(
                id_repr,
                format!(
                    "invalid walltime ({}): expected -1 (unbounded) or a strictly positive number",
                    walltime
                ),
            ));
        }

        let res = json_desc
            .get("res")
            .and_then(Value::as_i64)
            .ok_or_else(|| JobError::InvalidField(id_repr.clone(), "res".to_string()))?;
        if res < 0 {
            return Err(JobError::Invalid(
                id_repr,
                format!("negative 'res' field ({})", res),
            ));
        }

        let profile_name = json_desc
            .get("profile")
            .and_then(Value::as_str)
            .ok_or_else(|| JobError::InvalidField(id_repr.clone(), "profile".to_string()))?
            .to_string();
        if !profiles.exists(&profile_name) {
            return Err(JobError::UnknownProfile(id_repr, profile_name));
        }

        let purpose = match json_desc.get("purpose") {
            None => JobPurpose::Job,
            Some(Value::String(s)) if s == "job" => JobPurpose::Job,
            Some(Value::String(s)) if s == "reservation" => JobPurpose::Reservation,
            Some(_) => return Err(JobError::InvalidField(id_repr, "purpose".to_string())),
        };

        let start = match json_desc.get("start") {
            None => -1.0,
            Some(v) => v
                .as_f64()
                .ok_or_else(|| JobError::InvalidField(id_repr.clone(), "start".to_string()))?,
        };

        let future_allocation = match json_desc.get("alloc") {
            None => IntervalSet::new(),
            Some(Value::String(s)) => IntervalSet::from_string_hyphen(s, " ", "-")
                .map_err(|e| JobError::Invalid(id_repr.clone(), e.to_string()))?,
            Some(_) => return Err(JobError::InvalidField(id_repr, "alloc".to_string())),
        };

        let cores = json_desc.get("cores").and_then(Value::as_u64).unwrap_or(1) as u32;

        let smpi_mapping = match json_desc.get("smpi_ranks_to_hosts_mapping") {
            None => Vec::new(),
            Some(Value::Array(ranks)) => {
                let mut mapping = Vec::with_capacity(ranks.len());
                for rank in ranks {
                    let host = rank.as_i64().ok_or_else(|| {
                        JobError::InvalidField(
                            id_repr.clone(),
                            "smpi_ranks_to_hosts_mapping".to_string(),
                        )
                    })?;
                    if host < 0 || host >= res {
                        return Err(JobError::Invalid(
                            id_repr,
                            format!(
                                "smpi rank maps to host {} outside [0,{})",
                                host, res
                            ),
                        ));
                    }
                    mapping.push(host as u32);
                }
                mapping
            }
            Some(_) => {
                return Err(JobError::InvalidField(
                    id_repr,
                    "smpi_ranks_to_hosts_mapping".to_string(),
                ))
            }
        };

        let mut job = Job {
            id: id.clone(),
            profile_name: profile_name.clone(),
            json_description: json_desc.clone(),
            submission_time,
            walltime,
            original_walltime: json_desc
                .get("original_walltime")
                .and_then(Value::as_f64)
                .unwrap_or(walltime),
            requested_nb_res: res as u32,
            cores,
            purpose,
            start,
            future_allocation,
            smpi_ranks_to_hosts_mapping: smpi_mapping,
            checkpoint_interval: -1.0,
            dump_time: -1.0,
            read_time: -1.0,
            state: JobState::NotSubmitted,
            starting_time: -1.0,
            runtime: -1.0,
            consumed_energy: -1.0,
            kill_requested: false,
            return_code: -1,
            progress: -1.0,
            allocation: IntervalSet::new(),
            metadata: String::new(),
            batsim_metadata: String::new(),
            incoming_messages: Vec::new(),
            submission_times: Vec::new(),
            jitter: String::new(),
            from_workload: true,
            original_submit: -1.0,
            original_start: -1.0,
            progress_time_cpu: -1.0,
            task: None,
        };

        match json_desc.get("submission_times").and_then(Value::as_array) {
            Some(times) => {
                job.submission_times = times.iter().filter_map(Value::as_f64).collect();
            }
            None => job.submission_times.push(submission_time),
        }

        if ctx.checkpointing_on {
            job.apply_checkpointing(json_desc, ctx, profiles)?;
        } else if ctx.performance_factor != 1.0 && id.resubmit_count() == 0 {
            if let Some(profile) = profiles.get_mut(&profile_name) {
                profile.apply_performance_factor(ctx.performance_factor);
            }
        }

        if let Some(n) = ctx.nb_checkpoint {
            job.restore_runtime_fields(json_desc, n)?;
        }

        job.sync_json_description();
        Ok(job)
    }

    /// Reads per-job checkpoint knobs, computes the checkpoint interval
    /// (global override, or Young's formula when requested) and expands the
    /// profile work by its dump overhead. Resubmitted jobs keep their
    /// already-expanded profile.
    fn apply_checkpointing(
        &mut self,
        json_desc: &Value,
        ctx: &JobParseContext,
        profiles: &mut ProfileStore,
    ) -> Result<(), JobError> {
        if let Some(v) = json_desc.get("checkpoint_interval").and_then(Value::as_f64) {
            self.checkpoint_interval = v;
        }
        if let Some(v) = json_desc.get("dumptime").and_then(Value::as_f64) {
            self.dump_time = v;
        }
        if let Some(v) = json_desc.get("readtime").and_then(Value::as_f64) {
            self.read_time = v;
        }

        let profile = profiles
            .get_mut(&self.profile_name)
            .expect("profile existence is checked before");
        if !profile.supports_checkpointing() {
            return Ok(());
        }

        if self.id.resubmit_count() > 0 {
            return Ok(());
        }

        if ctx.performance_factor != 1.0 {
            profile.apply_performance_factor(ctx.performance_factor);
            self.dump_time *= ctx.performance_factor;
            self.read_time *= ctx.performance_factor;
        }

        if ctx.compute_checkpointing {
            if ctx.mtbf.is_none() && ctx.smtbf.is_none() {
                return Err(JobError::Invalid(
                    self.id.to_string(),
                    "checkpoint interval computation requested but no MTBF/SMTBF is set"
                        .to_string(),
                ));
            }
            if self.dump_time <= 0.0 {
                return Err(JobError::Invalid(
                    self.id.to_string(),
                    "checkpoint interval computation requires a positive dump time".to_string(),
                ));
            }
            // SMTBF is scaled to the job's share of the cluster; MTBF applies as-is.
            let m = match ctx.smtbf {
                Some(smtbf) => {
                    smtbf * f64::from(ctx.num_machines) / f64::from(self.requested_nb_res.max(1))
                }
                None => ctx.mtbf.unwrap(),
            };
            self.checkpoint_interval = ctx.compute_checkpointing_error
                * (2.0 * self.dump_time * m).sqrt()
                - self.dump_time;
            if self.checkpoint_interval <= 0.0 {
                return Err(JobError::Invalid(
                    self.id.to_string(),
                    format!(
                        "computed checkpoint interval is not positive ({}); \
                         the dump time is too large for the configured (S)MTBF",
                        self.checkpoint_interval
                    ),
                ));
            }
        }
        if let Some(global) = ctx.global_checkpointing_interval {
            self.checkpoint_interval = global - self.dump_time;
        }

        if self.checkpoint_interval > 0.0 && self.dump_time > 0.0 {
            profile.rewrite_for_checkpointing(self.checkpoint_interval, self.dump_time, ctx.speed);
        }
        Ok(())
    }

    /// Restores the runtime attribute group required by checkpoint loads.
    fn restore_runtime_fields(&mut self, json_desc: &Value, n: u32) -> Result<(), JobError> {
        let id_repr = self.id.to_string();
        let required = |field: &str| -> Result<&Value, JobError> {
            json_desc
                .get(field)
                .ok_or_else(|| JobError::InvalidField(id_repr.clone(), field.to_string()))
        };

        let allocation = required("allocation")?
            .as_str()
            .ok_or_else(|| JobError::InvalidField(id_repr.clone(), "allocation".to_string()))?;
        if !allocation.is_empty() {
            self.allocation = IntervalSet::from_string_hyphen(allocation, " ", "-")
                .map_err(|e| JobError::Invalid(id_repr.clone(), e.to_string()))?;
        }
        self.progress = required("progress")?
            .as_f64()
            .ok_or_else(|| JobError::InvalidField(id_repr.clone(), "progress".to_string()))?;
        let state_str = required("state")?
            .as_str()
            .ok_or_else(|| JobError::InvalidField(id_repr.clone(), "state".to_string()))?;
        self.state = JobState::from_str(state_str)
            .ok_or_else(|| JobError::InvalidField(id_repr.clone(), "state".to_string()))?;
        self.metadata = required("metadata")?.as_str().unwrap_or("").to_string();
        self.batsim_metadata = required("batsim_metadata")?
            .as_str()
            .unwrap_or("")
            .to_string();
        self.jitter = required("jitter")?.as_str().unwrap_or("").to_string();
        self.original_start = required("original_start")?
            .as_f64()
            .ok_or_else(|| JobError::InvalidField(id_repr.clone(), "original_start".to_string()))?;
        self.original_submit = required("original_submit")?
            .as_f64()
            .ok_or_else(|| JobError::InvalidField(id_repr.clone(), "original_submit".to_string()))?;
        self.runtime = required("runtime")?
            .as_f64()
            .ok_or_else(|| JobError::InvalidField(id_repr.clone(), "runtime".to_string()))?;
        self.progress_time_cpu = required("progressTimeCpu")?.as_f64().ok_or_else(|| {
            JobError::InvalidField(id_repr.clone(), "progressTimeCpu".to_string())
        })?;

        self.id = self.id.with_checkpoint(n);
        Ok(())
    }

    /// Brings the retained JSON description in line with the parsed job:
    /// canonical id, submission-time history and checkpoint knobs.
    pub fn sync_json_description(&mut self) {
        let desc = &mut self.json_description;
        desc["id"] = json!(self.id.to_string());
        desc["subtime"] = json!(self.submission_time);
        if desc.get("submission_times").is_none() {
            desc["submission_times"] = json!(self.submission_times);
        }
        if self.checkpoint_interval >= 0.0 {
            desc["checkpoint_interval"] = json!(self.checkpoint_interval);
        }
        if desc.get("dumptime").is_some() {
            desc["dumptime"] = json!(self.dump_time);
        }
        if desc.get("readtime").is_some() {
            desc["readtime"] = json!(self.read_time);
        }
        if self.purpose == JobPurpose::Reservation {
            desc["purpose"] = json!("reservation");
            desc["start"] = json!(self.start);
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state.is_terminal()
    }

    /// Instantiates the task tree; the shape is stable afterwards.
    pub fn create_task(&mut self, profiles: &ProfileStore) {
        let profile = profiles
            .get(&self.profile_name)
            .expect("profile existence is checked at load");
        self.task = Some(BatTask::from_profile(profile, profiles));
    }

    pub fn compute_job_progress(&self, now: f64) -> Option<(f64, Value)> {
        self.task
            .as_ref()
            .map(|task| (task.compute_progress(now), task.progress_json(now)))
    }
}

/// Compares jobs by submission time, ties broken by job number.
pub fn job_comparator_subtime_number(a: &Job, b: &Job) -> std::cmp::Ordering {
    a.submission_time
        .total_cmp(&b.submission_time)
        .then_with(|| a.id.job_number().cmp(&b.id.job_number()))
        .then_with(|| a.id.cmp(&b.id))
}

/// All jobs of one workload.
#[derive(Default)]
pub struct Jobs {
    jobs: FxHashMap<JobIdentifier, Job>,
    jobs_met: FxHashSet<JobIdentifier>,
}

impl Jobs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_job(&mut self, job: Job) -> Result<(), JobError> {
        if self.exists(&job.id) {
            return Err(JobError::Invalid(
                job.id.to_string(),
                "duplication of job id".to_string(),
            ));
        }
        self.jobs_met.insert(job.id.clone());
        self.jobs.insert(job.id.clone(), job);
        Ok(())
    }

    /// Removes a job, optionally releasing its profile reference so that the
    /// store can garbage collect it.
    pub fn delete_job(
        &mut self,
        job_id: &JobIdentifier,
        garbage_collect_profiles: bool,
        profiles: &mut ProfileStore,
    ) {
        if let Some(job) = self.jobs.remove(job_id) {
            if garbage_collect_profiles {
                profiles.release(&job.profile_name);
            }
        }
    }

    pub fn get(&self, job_id: &JobIdentifier) -> Option<&Job> {
        self.jobs.get(job_id)
    }

    pub fn get_mut(&mut self, job_id: &JobIdentifier) -> Option<&mut Job> {
        self.jobs.get_mut(job_id)
    }

    /// Whether this job id has ever been seen, even if since deleted.
    pub fn exists(&self, job_id: &JobIdentifier) -> bool {
        self.jobs_met.contains(job_id)
    }

    pub fn contains(&self, job_id: &JobIdentifier) -> bool {
        self.jobs.contains_key(job_id)
    }

    pub fn nb_jobs(&self) -> usize {
        self.jobs.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Job> {
        self.jobs.values_mut()
    }

    /// Job ids sorted by (submission time, job number); the order used by
    /// the transformation pipeline and the submitter.
    pub fn ids_sorted_by_submission(&self) -> Vec<JobIdentifier> {
        let mut jobs: Vec<&Job> = self.jobs.values().collect();
        jobs.sort_by(|a, b| job_comparator_subtime_number(a, b));
        jobs.into_iter().map(|j| j.id.clone()).collect()
    }

    pub fn largest_job_number(&self) -> i64 {
        self.jobs
            .values()
            .map(|j| j.id.job_number())
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse_ctx(name: &str) -> JobParseContext {
        JobParseContext {
            workload_name: name.to_string(),
            checkpointing_on: false,
            compute_checkpointing: false,
            compute_checkpointing_error: 1.0,
            mtbf: None,
            smtbf: None,
            num_machines: 4,
            global_checkpointing_interval: None,
            performance_factor: 1.0,
            speed: 1.0,
            nb_checkpoint: None,
        }
    }

    fn store_with_delay(delay: f64) -> ProfileStore {
        let mut store = ProfileStore::new(false);
        store
            .add(crate::profiles::Profile::from_json("d", json!({"type": "delay", "delay": delay})).unwrap())
            .unwrap();
        store
    }

    #[test]
    fn identifier_round_trips_counters() {
        let id = JobIdentifier::from_string("w0!3#1$2").unwrap();
        assert_eq!(id.workload_name(), "w0");
        assert_eq!(id.base_name(), "3");
        assert_eq!(id.job_number(), 3);
        assert_eq!(id.resubmit_count(), 1);
        assert_eq!(id.checkpoint_count(), Some(2));
        assert_eq!(id.to_string(), "w0!3#1$2");
    }

    #[test]
    fn identifier_rejects_bangs_in_names() {
        assert!(JobIdentifier::new("w!0", "1").is_err());
        assert!(JobIdentifier::from_string("no_separator").is_err());
    }

    #[test]
    fn next_resubmit_increments_counter() {
        let id = JobIdentifier::from_string("w0!3").unwrap();
        assert_eq!(id.next_resubmit().to_string(), "w0!3#1");
        assert_eq!(id.next_resubmit().next_resubmit().to_string(), "w0!3#2");
    }

    #[test]
    fn job_parses_and_canonicalizes_id() {
        let mut store = store_with_delay(3.0);
        let desc = json!({"id": 1, "subtime": 0.0, "res": 2, "walltime": 10.0, "profile": "d"});
        let job = Job::from_json(&desc, &parse_ctx("w0"), &mut store).unwrap();
        assert_eq!(job.id.to_string(), "w0!1");
        assert_eq!(job.json_description["id"], json!("w0!1"));
        assert_eq!(job.submission_times, vec![0.0]);
        assert_eq!(job.state, JobState::NotSubmitted);
    }

    #[test]
    fn job_rejects_bad_walltime_and_res() {
        let mut store = store_with_delay(3.0);
        let desc = json!({"id": "1", "subtime": 0.0, "res": 2, "walltime": 0.0, "profile": "d"});
        assert!(Job::from_json(&desc, &parse_ctx("w0"), &mut store).is_err());
        let desc = json!({"id": "1", "subtime": 0.0, "res": -1, "profile": "d"});
        assert!(Job::from_json(&desc, &parse_ctx("w0"), &mut store).is_err());
    }

    #[test]
    fn job_rejects_unknown_profile() {
        let mut store = store_with_delay(3.0);
        let desc = json!({"id": "1", "subtime": 0.0, "res": 1, "profile": "nope"});
        assert!(matches!(
            Job::from_json(&desc, &parse_ctx("w0"), &mut store),
            Err(JobError::UnknownProfile(_, _))
        ));
    }

    #[test]
    fn checkpointing_uses_youngs_formula() {
        let mut store = store_with_delay(100.0);
        let mut ctx = parse_ctx("w0");
        ctx.checkpointing_on = true;
        ctx.compute_checkpointing = true;
        ctx.smtbf = Some(50.0);
        ctx.num_machines = 4;
        let desc = json!({"id": "1", "subtime": 0.0, "res": 2, "profile": "d", "dumptime": 2.0, "readtime": 1.0});
        let job = Job::from_json(&desc, &ctx, &mut store).unwrap();
        // M = 50 * 4 / 2 = 100; interval = sqrt(2*2*100) - 2 = 18
        assert!((job.checkpoint_interval - 18.0).abs() < 1e-9);
    }

    #[test]
    fn global_interval_overrides_computed_one() {
        let mut store = store_with_delay(10.0);
        let mut ctx = parse_ctx("w0");
        ctx.checkpointing_on = true;
        ctx.global_checkpointing_interval = Some(4.0);
        let desc = json!({"id": "1", "subtime": 0.0, "res": 1, "profile": "d", "dumptime": 1.0});
        let job = Job::from_json(&desc, &ctx, &mut store).unwrap();
        assert_eq!(job.checkpoint_interval, 3.0);
        // delay 10, interval 3, dump 1 -> ceil(10/3)*1 + 10 = 14
        match store.get("d").unwrap().data {
            ProfileData::Delay { delay, .. } => assert_eq!(delay, 14.0),
            _ => unreachable!(),
        }
    }

    #[test]
    fn delay_task_progress() {
        let store = store_with_delay(4.0);
        let profile = store.get("d").unwrap();
        let mut task = BatTask::from_profile(profile, &store);
        assert_eq!(task.compute_progress(10.0), 0.0);
        task.start_leaf(10.0, 4.0);
        assert_eq!(task.compute_progress(11.0), 0.25);
        assert_eq!(task.compute_progress(20.0), 1.0);
    }

    #[test]
    fn zero_delay_leaf_is_immediately_complete() {
        let store = store_with_delay(0.0);
        let mut task = BatTask::from_profile(store.get("d").unwrap(), &store);
        task.start_leaf(5.0, 0.0);
        assert_eq!(task.compute_progress(5.0), 1.0);
    }

    #[test]
    fn sequence_progress_follows_current_child() {
        let mut store = store_with_delay(4.0);
        store
            .add(
                crate::profiles::Profile::from_json(
                    "s",
                    json!({"type": "composed", "repeat": 2, "seq": ["d"]}),
                )
                .unwrap(),
            )
            .unwrap();
        let mut task = BatTask::from_profile(store.get("s").unwrap(), &store);
        assert_eq!(task.compute_progress(0.0), 0.0);
        task.set_current(1);
        task.child_mut(1).start_leaf(0.0, 4.0);
        assert_eq!(task.compute_progress(1.0), 0.25);
        let snapshot = task.progress_json(1.0);
        assert_eq!(snapshot["current_task_index"], json!(1));
        assert_eq!(snapshot["current_task"]["progress"], json!(0.25));
    }
}
