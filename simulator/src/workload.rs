use std::collections::BTreeMap;

use log::info;
use rand::prelude::*;
use rand_distr::{Distribution, Exp};
use rand_pcg::Pcg64;
use rustc_hash::FxHashSet;
use serde_json::Value;
use thiserror::Error;

use crate::config::sim_config::{
    CopyOptions, CopyRandom, DrawScope, SimulationConfig, SubmissionRandom, SubmissionTimes,
};
use crate::jobs::{Job, JobError, JobIdentifier, JobParseContext, Jobs};
use crate::profiles::{Profile, ProfileData, ProfileError, ProfileStore};

#[derive(Debug, Error)]
pub enum WorkloadError {
    #[error("invalid workload '{0}': could not be parsed: {1}")]
    Parse(String, serde_json::Error),
    #[error("invalid workload '{0}': not a JSON object")]
    NotAnObject(String),
    #[error("invalid workload '{0}': the '{1}' field is missing or invalid")]
    MissingField(String, String),
    #[error("invalid workload '{0}': the value of the 'nb_res' field is invalid ({1})")]
    InvalidNbRes(String, i64),
    #[error("invalid workload '{0}': duplication of job id '{1}'")]
    DuplicateJob(String, String),
    #[error("invalid composed profile '{0}': the used profile '{1}' does not exist")]
    SequenceChildMissing(String, String),
    #[error("invalid composed profile '{0}': profile sequence contains a cycle")]
    ProfileCycle(String),
    #[error(
        "invalid job {0}: the requested number of resources ({1}) does not match \
         the number of resources of the associated profile '{2}' ({3})"
    )]
    NbResMismatch(String, u32, String, u32),
    #[error("workload '{0}' already exists")]
    AlreadyExists(String),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Profile(#[from] ProfileError),
}

/// A named collection of jobs and their profiles, plus the per-workload
/// knobs that drive profile rewriting and failure injection.
pub struct Workload {
    pub name: String,
    pub file: String,
    pub jobs: Jobs,
    pub profiles: ProfileStore,
    is_static: bool,

    pub num_machines: u32,
    pub speed: f64,

    pub checkpointing_on: bool,
    pub compute_checkpointing: bool,
    pub compute_checkpointing_error: f64,
    pub global_checkpointing_interval: Option<f64>,
    pub mtbf: Option<f64>,
    pub smtbf: Option<f64>,
    pub performance_factor: f64,

    // Counters carried through batsim-level checkpoints.
    pub nb_checkpoint: Option<u32>,
    pub nb_original_jobs: u32,
    pub nb_actually_completed: u32,
}

impl Workload {
    /// Static workloads originate from input files.
    pub fn new_static(
        name: &str,
        file: &str,
        config: &SimulationConfig,
        speed: f64,
    ) -> Workload {
        Workload {
            name: name.to_string(),
            file: file.to_string(),
            jobs: Jobs::new(),
            profiles: ProfileStore::new(!config.dynamic_registration.profile_reuse),
            is_static: true,
            num_machines: 0,
            speed,
            checkpointing_on: config.checkpointing.enabled,
            compute_checkpointing: config.checkpointing.compute_interval,
            compute_checkpointing_error: config.checkpointing.compute_error,
            global_checkpointing_interval: config.checkpointing.global_interval,
            mtbf: config.failures.mtbf,
            smtbf: config.failures.smtbf,
            performance_factor: config.performance_factor,
            nb_checkpoint: None,
            nb_original_jobs: 0,
            nb_actually_completed: 0,
        }
    }

    /// Dynamic workloads are created by the scheduler at runtime.
    pub fn new_dynamic(name: &str, config: &SimulationConfig) -> Workload {
        let mut workload = Workload::new_static(name, "dynamic", config, 1.0);
        workload.is_static = false;
        workload
    }

    pub fn is_static(&self) -> bool {
        self.is_static
    }

    fn parse_context(&self) -> JobParseContext {
        JobParseContext {
            workload_name: self.name.clone(),
            checkpointing_on: self.checkpointing_on,
            compute_checkpointing: self.compute_checkpointing,
            compute_checkpointing_error: self.compute_checkpointing_error,
            mtbf: self.mtbf,
            smtbf: self.smtbf,
            num_machines: self.num_machines,
            global_checkpointing_interval: self.global_checkpointing_interval,
            performance_factor: self.performance_factor,
            speed: self.speed,
            nb_checkpoint: self.nb_checkpoint,
        }
    }

    /// Loads a static workload from a JSON document, applies the
    /// transformation pipeline and validates the result.
    ///
    /// Returns the number of machines the workload asks for (`nb_res`).
    pub fn load_from_json(
        &mut self,
        content: &str,
        copy: Option<&CopyOptions>,
        submission_time_before: Option<&SubmissionTimes>,
        submission_time_after: Option<&SubmissionTimes>,
    ) -> Result<u32, WorkloadError> {
        info!("Loading JSON workload '{}'...", self.file);
        let doc = self.parse_document(content)?;
        let nb_machines = self.read_nb_res(&doc)?;

        self.load_profiles(&doc)?;
        self.load_jobs(&doc)?;

        if copy.is_some() || submission_time_before.is_some() || submission_time_after.is_some() {
            self.alter_workload(copy, submission_time_before, submission_time_after)?;
        }
        self.nb_original_jobs = self.jobs.nb_jobs() as u32;

        info!(
            "JSON workload parsed successfully. Read {} jobs and {} profiles.",
            self.jobs.nb_jobs(),
            self.profiles.nb_profiles()
        );
        self.check_validity()?;
        self.profiles.gc_unreferenced();
        Ok(nb_machines)
    }

    /// Loads a workload written by the batsim-level checkpoint manager.
    ///
    /// The transformation pipeline is skipped; every job must carry the full
    /// runtime attribute set and the checkpoint counters must be present.
    pub fn load_from_json_chkpt(&mut self, content: &str) -> Result<u32, WorkloadError> {
        info!("Loading checkpointed JSON workload '{}'...", self.file);
        let doc = self.parse_document(content)?;
        let nb_machines = self.read_nb_res(&doc)?;

        let nb_checkpoint = doc
            .get("nb_checkpoint")
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                WorkloadError::MissingField(self.file.clone(), "nb_checkpoint".to_string())
            })? as u32;
        self.nb_original_jobs = doc
            .get("nb_original_jobs")
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                WorkloadError::MissingField(self.file.clone(), "nb_original_jobs".to_string())
            })? as u32;
        self.nb_actually_completed = doc
            .get("nb_actually_completed")
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                WorkloadError::MissingField(self.file.clone(), "nb_actually_completed".to_string())
            })? as u32;
        self.nb_checkpoint = Some(nb_checkpoint);

        self.load_profiles(&doc)?;
        self.load_jobs(&doc)?;

        self.check_validity()?;
        self.profiles.gc_unreferenced();
        Ok(nb_machines)
    }

    fn parse_document(&self, content: &str) -> Result<Value, WorkloadError> {
        let doc: Value = serde_json::from_str(content)
            .map_err(|e| WorkloadError::Parse(self.file.clone(), e))?;
        if !doc.is_object() {
            return Err(WorkloadError::NotAnObject(self.file.clone()));
        }
        Ok(doc)
    }

    fn read_nb_res(&mut self, doc: &Value) -> Result<u32, WorkloadError> {
        let nb_res = doc
            .get("nb_res")
            .and_then(Value::as_i64)
            .ok_or_else(|| WorkloadError::MissingField(self.file.clone(), "nb_res".to_string()))?;
        if nb_res <= 0 {
            return Err(WorkloadError::InvalidNbRes(self.file.clone(), nb_res));
        }
        self.num_machines = nb_res as u32;
        Ok(nb_res as u32)
    }

    fn load_profiles(&mut self, doc: &Value) -> Result<(), WorkloadError> {
        let profiles = doc
            .get("profiles")
            .and_then(Value::as_object)
            .ok_or_else(|| {
                WorkloadError::MissingField(self.file.clone(), "profiles".to_string())
            })?;
        for (name, desc) in profiles {
            self.profiles.add(Profile::from_json(name, desc.clone())?)?;
        }
        Ok(())
    }

    fn load_jobs(&mut self, doc: &Value) -> Result<(), WorkloadError> {
        let jobs = doc.get("jobs").and_then(Value::as_array).ok_or_else(|| {
            WorkloadError::MissingField(self.file.clone(), "jobs".to_string())
        })?;
        let ctx = self.parse_context();
        for desc in jobs {
            let job = Job::from_json(desc, &ctx, &mut self.profiles)?;
            if self.jobs.exists(&job.id) {
                return Err(WorkloadError::DuplicateJob(
                    self.file.clone(),
                    job.id.to_string(),
                ));
            }
            self.profiles.acquire(&job.profile_name)?;
            self.jobs.add_job(job)?;
        }
        Ok(())
    }

    /// Registers a single job submitted dynamically by the scheduler.
    pub fn register_job(&mut self, desc: &Value) -> Result<JobIdentifier, WorkloadError> {
        let ctx = self.parse_context();
        let job = Job::from_json(desc, &ctx, &mut self.profiles)?;
        if self.jobs.exists(&job.id) {
            return Err(WorkloadError::DuplicateJob(
                self.name.clone(),
                job.id.to_string(),
            ));
        }
        self.check_single_job_validity(&job)?;
        self.profiles.acquire(&job.profile_name)?;
        let id = job.id.clone();
        self.jobs.add_job(job)?;
        Ok(id)
    }

    /// Resolves sequence children (updating their reference counts), rejects
    /// cyclic sequences, and checks per-job profile constraints.
    pub fn check_validity(&mut self) -> Result<(), WorkloadError> {
        let sequences: Vec<(String, Vec<String>)> = self
            .profiles
            .profiles()
            .filter_map(|p| match &p.data {
                ProfileData::Sequence { seq, .. } => Some((p.name.clone(), seq.clone())),
                _ => None,
            })
            .collect();

        for (name, children) in &sequences {
            for child in children {
                if !self.profiles.exists(child) {
                    return Err(WorkloadError::SequenceChildMissing(
                        name.clone(),
                        child.clone(),
                    ));
                }
                self.profiles.acquire(child)?;
            }
        }

        // Reject cycles between composed profiles.
        for (name, _) in &sequences {
            let mut visiting = FxHashSet::default();
            if self.sequence_has_cycle(name, &mut visiting) {
                return Err(WorkloadError::ProfileCycle(name.clone()));
            }
        }

        let jobs: Vec<JobIdentifier> = self.jobs.iter().map(|j| j.id.clone()).collect();
        for id in jobs {
            let job = self.jobs.get(&id).unwrap();
            self.check_single_job_validity(job)?;
        }
        Ok(())
    }

    fn sequence_has_cycle(&self, name: &str, visiting: &mut FxHashSet<String>) -> bool {
        if !visiting.insert(name.to_string()) {
            return true;
        }
        if let Some(profile) = self.profiles.get(name) {
            if let ProfileData::Sequence { seq, .. } = &profile.data {
                for child in seq {
                    if self.sequence_has_cycle(child, visiting) {
                        return true;
                    }
                }
            }
        }
        visiting.remove(name);
        false
    }

    pub fn check_single_job_validity(&self, job: &Job) -> Result<(), WorkloadError> {
        let profile = self.profiles.get(&job.profile_name).ok_or_else(|| {
            WorkloadError::SequenceChildMissing(job.id.to_string(), job.profile_name.clone())
        })?;
        match &profile.data {
            ProfileData::ParallelHomogeneous {
                nb_res: Some(nb_res),
                ..
            } if *nb_res != job.requested_nb_res => Err(WorkloadError::NbResMismatch(
                job.id.to_string(),
                job.requested_nb_res,
                profile.name.clone(),
                *nb_res,
            )),
            ProfileData::Parallel { nb_res, .. } if *nb_res != job.requested_nb_res => {
                Err(WorkloadError::NbResMismatch(
                    job.id.to_string(),
                    job.requested_nb_res,
                    profile.name.clone(),
                    *nb_res,
                ))
            }
            _ => Ok(()),
        }
    }

    /// The copy/jitter/rewrite pass, applied once after loading.
    ///
    /// The order is fixed: `--submission-time-before`, then `--copy`, then
    /// `--submission-time-after`.
    pub fn alter_workload(
        &mut self,
        copy: Option<&CopyOptions>,
        before: Option<&SubmissionTimes>,
        after: Option<&SubmissionTimes>,
    ) -> Result<(), WorkloadError> {
        if let Some(before) = before {
            self.change_submits(before);
        }
        if let Some(copy) = copy {
            self.copy_components(copy)?;
        }
        if let Some(after) = after {
            self.change_submits(after);
        }
        Ok(())
    }

    /// Rewrites submission times in ascending original-submission order.
    pub fn change_submits(&mut self, submission_time: &SubmissionTimes) {
        let mut rng = match submission_time.seed {
            Some(seed) => Pcg64::seed_from_u64(seed),
            None => Pcg64::from_entropy(),
        };

        if let (Some(value1), Some(random)) = (submission_time.value1, submission_time.random) {
            let order = self.jobs.ids_sorted_by_submission();
            let exp = Exp::new(1.0 / value1).ok();
            let mut previous: Option<f64> = None;
            for id in &order {
                let new_subtime = match random {
                    SubmissionRandom::Fixed => {
                        let t = previous.map_or(value1, |p| p + value1);
                        if value1 != 0.0 {
                            previous = Some(t);
                        }
                        t
                    }
                    SubmissionRandom::Exp => {
                        let draw = exp.as_ref().map_or(0.0, |d| d.sample(&mut rng));
                        let t = previous.map_or(draw, |p| p + draw);
                        previous = Some(t);
                        t
                    }
                    SubmissionRandom::Unif => {
                        let hi = submission_time.value2.unwrap_or(value1);
                        let draw = rng.gen_range(value1..hi.max(value1 + f64::EPSILON));
                        let t = previous.map_or(draw, |p| p + draw);
                        previous = Some(t);
                        t
                    }
                };
                self.set_submission_time(id, new_subtime);
            }
        }

        if submission_time.shuffle {
            // The permutation uses its own generator, independent from the
            // value generator.
            let mut shuffle_rng = match submission_time.seed {
                Some(seed) => Pcg64::seed_from_u64(seed.wrapping_add(1)),
                None => Pcg64::from_entropy(),
            };
            let order = self.jobs.ids_sorted_by_submission();
            let times: Vec<f64> = order
                .iter()
                .map(|id| self.jobs.get(id).unwrap().submission_time)
                .collect();
            let mut indices: Vec<usize> = (0..order.len()).collect();
            indices.shuffle(&mut shuffle_rng);
            for (i, id) in order.iter().enumerate() {
                self.set_submission_time(id, times[indices[i]]);
            }
        }
    }

    fn set_submission_time(&mut self, id: &JobIdentifier, subtime: f64) {
        let job = self.jobs.get_mut(id).unwrap();
        job.submission_time = subtime;
        job.json_description["subtime"] = serde_json::json!(subtime);
    }

    /// Produces `copies - 1` additional copies of the current job set, each
    /// under fresh numeric ids with its profiles cloned under the new names.
    fn copy_components(&mut self, copy: &CopyOptions) -> Result<(), WorkloadError> {
        let mut rng = match copy.seed {
            Some(seed) => Pcg64::seed_from_u64(seed),
            None => Pcg64::from_entropy(),
        };
        let base_order = self.jobs.ids_sorted_by_submission();
        let mut start_id = self.jobs.largest_job_number() + 1;
        // Draw shared by 'single' scope (and per-copy for 'each-copy').
        let mut random_number: Option<f64> = None;

        for _ in 0..copy.copies.saturating_sub(1) {
            let mut previous: Option<f64> = None;
            for id in &base_order {
                let template = self.jobs.get(id).unwrap().clone();
                let new_id = JobIdentifier::new(&self.name, &start_id.to_string())?;
                let new_profile_name = start_id.to_string();

                let old_profile = self
                    .profiles
                    .get(&template.profile_name)
                    .expect("job profiles are resolved at load")
                    .json
                    .clone();
                self.profiles
                    .add(Profile::from_json(&new_profile_name, old_profile)?)?;
                self.profiles.acquire(&new_profile_name)?;

                let mut job = template;
                job.id = new_id;
                job.profile_name = new_profile_name.clone();
                job.json_description["profile"] = serde_json::json!(new_profile_name);

                let old_subtime = job.submission_time;
                match copy.random {
                    CopyRandom::None => {}
                    CopyRandom::Fixed => {
                        let value1 = copy.value1.unwrap_or(0.0);
                        match copy.symbol {
                            Some('=') => {
                                let t = previous.map_or(value1, |p| p + value1);
                                if value1 != 0.0 {
                                    previous = Some(t);
                                }
                                job.submission_time = t;
                            }
                            Some('+') => {
                                job.submission_time = old_subtime + value1;
                                job.jitter = format!("+{}", value1);
                            }
                            Some('-') => {
                                job.submission_time = old_subtime - value1;
                                job.jitter = format!("-{}", value1);
                            }
                            _ => {}
                        }
                    }
                    CopyRandom::Exp => {
                        let value1 = copy.value1.unwrap_or(1.0);
                        let exp = Exp::new(1.0 / value1).ok();
                        let draw = exp.as_ref().map_or(0.0, |d| d.sample(&mut rng));
                        let t = previous.map_or(draw, |p| p + draw);
                        previous = Some(t);
                        job.submission_time = t;
                    }
                    CopyRandom::Unif => {
                        let lo = copy.value1.unwrap_or(0.0) as i64;
                        let hi = copy.value2.unwrap_or(0.0) as i64;
                        if copy.symbol == Some('=') {
                            let draw = rng.gen_range(lo..=hi) as f64;
                            let t = previous.map_or(draw, |p| p + draw);
                            previous = Some(t);
                            job.submission_time = t;
                        } else {
                            let draw = *random_number
                                .get_or_insert_with(|| rng.gen_range(lo..=hi) as f64);
                            match copy.symbol {
                                Some('+') => {
                                    job.submission_time = old_subtime + draw;
                                    job.jitter = format!("+{}", draw);
                                }
                                Some('-') => {
                                    job.submission_time = old_subtime - draw;
                                    job.jitter = format!("-{}", draw);
                                }
                                _ => {}
                            }
                            // One draw per job under the 'all' scope.
                            if copy.how_many == Some(DrawScope::All) {
                                random_number = None;
                            }
                        }
                    }
                }

                job.submission_times = vec![job.submission_time];
                job.json_description["submission_times"] =
                    serde_json::json!(job.submission_times);
                job.sync_json_description();
                self.jobs.add_job(job)?;
                start_id += 1;
            }
            // And one draw per copy under 'each-copy'.
            if copy.random == CopyRandom::Unif && copy.how_many == Some(DrawScope::EachCopy) {
                random_number = None;
            }
            // Leave a one-id gap between copies, like the original numbering.
            start_id += 1;
        }
        Ok(())
    }
}

/// Handles the set of workloads, identified by their names.
#[derive(Default)]
pub struct Workloads {
    workloads: BTreeMap<String, Workload>,
}

impl Workloads {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_workload(&mut self, workload: Workload) -> Result<(), WorkloadError> {
        if self.workloads.contains_key(&workload.name) {
            return Err(WorkloadError::AlreadyExists(workload.name));
        }
        self.workloads.insert(workload.name.clone(), workload);
        Ok(())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.workloads.contains_key(name)
    }

    pub fn at(&self, name: &str) -> Option<&Workload> {
        self.workloads.get(name)
    }

    pub fn at_mut(&mut self, name: &str) -> Option<&mut Workload> {
        self.workloads.get_mut(name)
    }

    pub fn nb_workloads(&self) -> usize {
        self.workloads.len()
    }

    pub fn nb_static_workloads(&self) -> usize {
        self.workloads.values().filter(|w| w.is_static()).count()
    }

    pub fn job_at(&self, job_id: &JobIdentifier) -> Option<&Job> {
        self.workloads
            .get(job_id.workload_name())
            .and_then(|w| w.jobs.get(job_id))
    }

    pub fn job_at_mut(&mut self, job_id: &JobIdentifier) -> Option<&mut Job> {
        self.workloads
            .get_mut(job_id.workload_name())
            .and_then(|w| w.jobs.get_mut(job_id))
    }

    pub fn job_is_registered(&self, job_id: &JobIdentifier) -> bool {
        self.workloads
            .get(job_id.workload_name())
            .map(|w| w.jobs.exists(job_id))
            .unwrap_or(false)
    }

    pub fn delete_jobs(&mut self, job_ids: &[JobIdentifier], garbage_collect_profiles: bool) {
        for job_id in job_ids {
            if let Some(workload) = self.workloads.get_mut(job_id.workload_name()) {
                let profiles = &mut workload.profiles;
                workload.jobs.delete_job(job_id, garbage_collect_profiles, profiles);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Workload> {
        self.workloads.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Workload> {
        self.workloads.values_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobState;
    use serde_json::json;

    fn config() -> SimulationConfig {
        SimulationConfig::default()
    }

    fn simple_doc() -> String {
        json!({
            "nb_res": 4,
            "jobs": [
                {"id": "1", "subtime": 0.0, "res": 2, "walltime": 10.0, "profile": "d"},
                {"id": "2", "subtime": 10.0, "res": 1, "profile": "d"}
            ],
            "profiles": {
                "d": {"type": "delay", "delay": 3.0}
            }
        })
        .to_string()
    }

    #[test]
    fn loads_a_simple_workload() {
        let cfg = config();
        let mut w = Workload::new_static("w0", "test.json", &cfg, 1.0);
        let nb_res = w.load_from_json(&simple_doc(), None, None, None).unwrap();
        assert_eq!(nb_res, 4);
        assert_eq!(w.jobs.nb_jobs(), 2);
        let id = JobIdentifier::from_string("w0!1").unwrap();
        let job = w.jobs.get(&id).unwrap();
        assert_eq!(job.walltime, 10.0);
        assert_eq!(job.state, JobState::NotSubmitted);
    }

    #[test]
    fn rejects_missing_or_bad_nb_res() {
        let cfg = config();
        let mut w = Workload::new_static("w0", "test.json", &cfg, 1.0);
        let doc = json!({"jobs": [], "profiles": {}}).to_string();
        assert!(matches!(
            w.load_from_json(&doc, None, None, None),
            Err(WorkloadError::MissingField(_, _))
        ));
        let mut w = Workload::new_static("w0", "test.json", &cfg, 1.0);
        let doc = json!({"nb_res": 0, "jobs": [], "profiles": {}}).to_string();
        assert!(matches!(
            w.load_from_json(&doc, None, None, None),
            Err(WorkloadError::InvalidNbRes(_, 0))
        ));
    }

    #[test]
    fn rejects_duplicate_job_ids() {
        let cfg = config();
        let mut w = Workload::new_static("w0", "test.json", &cfg, 1.0);
        let doc = json!({
            "nb_res": 1,
            "jobs": [
                {"id": "1", "subtime": 0.0, "res": 1, "profile": "d"},
                {"id": "1", "subtime": 1.0, "res": 1, "profile": "d"}
            ],
            "profiles": {"d": {"type": "delay", "delay": 1.0}}
        })
        .to_string();
        assert!(matches!(
            w.load_from_json(&doc, None, None, None),
            Err(WorkloadError::DuplicateJob(_, _))
        ));
    }

    #[test]
    fn rejects_sequence_referencing_unknown_profile() {
        let cfg = config();
        let mut w = Workload::new_static("w0", "test.json", &cfg, 1.0);
        let doc = json!({
            "nb_res": 1,
            "jobs": [{"id": "1", "subtime": 0.0, "res": 1, "profile": "s"}],
            "profiles": {"s": {"type": "composed", "seq": ["ghost"]}}
        })
        .to_string();
        assert!(matches!(
            w.load_from_json(&doc, None, None, None),
            Err(WorkloadError::SequenceChildMissing(_, _))
        ));
    }

    #[test]
    fn rejects_cyclic_sequences() {
        let cfg = config();
        let mut w = Workload::new_static("w0", "test.json", &cfg, 1.0);
        let doc = json!({
            "nb_res": 1,
            "jobs": [{"id": "1", "subtime": 0.0, "res": 1, "profile": "a"}],
            "profiles": {
                "a": {"type": "composed", "seq": ["b"]},
                "b": {"type": "composed", "seq": ["a"]}
            }
        })
        .to_string();
        assert!(matches!(
            w.load_from_json(&doc, None, None, None),
            Err(WorkloadError::ProfileCycle(_))
        ));
    }

    #[test]
    fn rejects_nb_res_mismatch() {
        let cfg = config();
        let mut w = Workload::new_static("w0", "test.json", &cfg, 1.0);
        let doc = json!({
            "nb_res": 4,
            "jobs": [{"id": "1", "subtime": 0.0, "res": 3, "profile": "p"}],
            "profiles": {
                "p": {"type": "parallel_homogeneous", "cpu": 1e9, "com": 0.0, "nb_res": 2}
            }
        })
        .to_string();
        assert!(matches!(
            w.load_from_json(&doc, None, None, None),
            Err(WorkloadError::NbResMismatch(_, 3, _, 2))
        ));
    }

    #[test]
    fn gc_drops_unreferenced_profiles_after_load() {
        let cfg = config();
        let mut w = Workload::new_static("w0", "test.json", &cfg, 1.0);
        let doc = json!({
            "nb_res": 1,
            "jobs": [{"id": "1", "subtime": 0.0, "res": 1, "profile": "d"}],
            "profiles": {
                "d": {"type": "delay", "delay": 1.0},
                "unused": {"type": "delay", "delay": 2.0}
            }
        })
        .to_string();
        w.load_from_json(&doc, None, None, None).unwrap();
        assert!(w.profiles.exists("d"));
        assert!(!w.profiles.exists("unused"));
    }

    #[test]
    fn fixed_submission_rewrite_chains_times() {
        let cfg = config();
        let mut w = Workload::new_static("w0", "test.json", &cfg, 1.0);
        let st = SubmissionTimes::parse("5:fixed").unwrap();
        w.load_from_json(&simple_doc(), None, Some(&st), None).unwrap();
        let t1 = w
            .jobs
            .get(&JobIdentifier::from_string("w0!1").unwrap())
            .unwrap();
        let t2 = w
            .jobs
            .get(&JobIdentifier::from_string("w0!2").unwrap())
            .unwrap();
        assert_eq!(t1.submission_time, 5.0);
        assert_eq!(t2.submission_time, 10.0);
        assert_eq!(t1.json_description["subtime"], json!(5.0));
    }

    #[test]
    fn zero_fixed_rewrite_collapses_all_times() {
        let cfg = config();
        let mut w = Workload::new_static("w0", "test.json", &cfg, 1.0);
        let st = SubmissionTimes::parse("0:fixed").unwrap();
        w.load_from_json(&simple_doc(), None, Some(&st), None).unwrap();
        for job in w.jobs.iter() {
            assert_eq!(job.submission_time, 0.0);
        }
    }

    #[test]
    fn shuffle_keeps_the_multiset_of_times() {
        let cfg = config();
        let mut w = Workload::new_static("w0", "test.json", &cfg, 1.0);
        let st = SubmissionTimes::parse("shuffle:7").unwrap();
        w.load_from_json(&simple_doc(), None, None, Some(&st)).unwrap();
        let mut times: Vec<f64> = w.jobs.iter().map(|j| j.submission_time).collect();
        times.sort_by(f64::total_cmp);
        assert_eq!(times, vec![0.0, 10.0]);
    }

    #[test]
    fn copy_with_uniform_jitter_per_copy() {
        // Two jobs with subtimes {0, 10}; 3 copies with one Uniform(5,10)
        // draw per copy added to every job of that copy.
        let cfg = config();
        let mut w = Workload::new_static("w0", "test.json", &cfg, 1.0);
        let copy = CopyOptions::parse("3:+:5:10:unif:each-copy:42").unwrap();
        w.load_from_json(&simple_doc(), Some(&copy), None, None).unwrap();
        assert_eq!(w.jobs.nb_jobs(), 6);

        let order = w.jobs.ids_sorted_by_submission();
        let originals: Vec<f64> = order
            .iter()
            .filter(|id| id.job_number() <= 2)
            .map(|id| w.jobs.get(id).unwrap().submission_time)
            .collect();
        assert_eq!(originals, vec![0.0, 10.0]);

        // Copies are numbered 3,4 and (after a one-id gap) 6,7.
        for copy_numbers in [[3, 4], [6, 7]] {
            let jobs: Vec<&Job> = w
                .jobs
                .iter()
                .filter(|j| copy_numbers.contains(&j.id.job_number()))
                .collect();
            assert_eq!(jobs.len(), 2);
            // Every job of one copy shares the same jitter draw.
            let tags: FxHashSet<String> = jobs.iter().map(|j| j.jitter.clone()).collect();
            assert_eq!(tags.len(), 1, "copy {:?} mixes jitters: {:?}", copy_numbers, tags);
            let mut deltas: Vec<f64> = jobs
                .iter()
                .map(|j| {
                    // The first id of each pair copies the subtime-0 job.
                    let base = if j.id.job_number() == copy_numbers[0] { 0.0 } else { 10.0 };
                    j.submission_time - base
                })
                .collect();
            deltas.sort_by(f64::total_cmp);
            assert!(deltas.iter().all(|d| (5.0..=10.0).contains(d)));
            assert_eq!(deltas[0], deltas[1]);
        }
    }

    #[test]
    fn load_preserves_unknown_fields_byte_for_byte() {
        // A round-trip must preserve every field the simulator does not
        // interpret; only the id is canonicalized and submission_times added.
        let cfg = config();
        let mut w = Workload::new_static("w0", "test.json", &cfg, 1.0);
        let doc = json!({
            "nb_res": 1,
            "jobs": [{
                "id": "1", "subtime": 2.5, "res": 1, "profile": "d",
                "user": "alice", "extra": {"nested": [1, 2, 3]}
            }],
            "profiles": {"d": {"type": "delay", "delay": 1.0, "comment": "kept"}}
        })
        .to_string();
        w.load_from_json(&doc, None, None, None).unwrap();
        let job = w
            .jobs
            .get(&JobIdentifier::from_string("w0!1").unwrap())
            .unwrap();
        assert_eq!(job.json_description["user"], json!("alice"));
        assert_eq!(job.json_description["extra"], json!({"nested": [1, 2, 3]}));
        assert_eq!(job.json_description["subtime"], json!(2.5));
        assert_eq!(job.json_description["id"], json!("w0!1"));
        assert_eq!(job.json_description["submission_times"], json!([2.5]));
        assert_eq!(w.profiles.get("d").unwrap().json["comment"], json!("kept"));
    }

    #[test]
    fn copy_is_deterministic_with_a_seed() {
        let cfg = config();
        let copy = CopyOptions::parse("2:+:5:10:unif:single:42").unwrap();
        let mut a = Workload::new_static("w0", "test.json", &cfg, 1.0);
        a.load_from_json(&simple_doc(), Some(&copy), None, None).unwrap();
        let mut b = Workload::new_static("w0", "test.json", &cfg, 1.0);
        b.load_from_json(&simple_doc(), Some(&copy), None, None).unwrap();
        let times = |w: &Workload| {
            let mut t: Vec<f64> = w.jobs.iter().map(|j| j.submission_time).collect();
            t.sort_by(f64::total_cmp);
            t
        };
        assert_eq!(times(&a), times(&b));
    }
}
