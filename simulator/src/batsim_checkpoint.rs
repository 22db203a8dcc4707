//! Simulator-level checkpointing: snapshots of the live simulation state
//! to a rotated directory family, plus the cold-start restore path.
//!
//! Snapshot layout:
//! - `workload.json`: cluster size, counters, the currently-live jobs with
//!   their runtime attributes and progress-rewritten profiles, profiles.
//! - `batsim_variables.chkpt`: pending call-me-laters with target >= now.
//! - `out_jobs.csv`: a flushed copy of the running CSV export.
//!
//! The newest snapshot is always `checkpoint_1`; older ones are shifted to
//! `checkpoint_2..checkpoint_keep` and the `checkpoint_latest` symlink
//! points at `checkpoint_1`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use csv::Writer;
use serde_json::{json, Map, Value};

use crate::jobs::Job;
use crate::machines::Machines;
use crate::server::ArmedTimer;
use crate::workload::Workloads;

/// Maintains the `out_jobs.csv` export that the checkpoint copies.
pub struct JobsTracer {
    path: PathBuf,
    writer: Option<Writer<fs::File>>,
}

impl JobsTracer {
    pub fn new(path: PathBuf) -> JobsTracer {
        JobsTracer { path, writer: None }
    }

    fn writer(&mut self) -> io::Result<&mut Writer<fs::File>> {
        if self.writer.is_none() {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = fs::File::create(&self.path)?;
            let mut writer = Writer::from_writer(file);
            writer.write_record([
                "job_id",
                "workload_name",
                "submission_time",
                "requested_number_of_resources",
                "starting_time",
                "execution_time",
                "finish_time",
                "state",
                "return_code",
                "consumed_energy",
                "allocated_resources",
                "metadata",
            ])?;
            self.writer = Some(writer);
        }
        Ok(self.writer.as_mut().unwrap())
    }

    pub fn record(&mut self, job: &Job) -> io::Result<()> {
        let row = [
            job.id.to_string(),
            job.id.workload_name().to_string(),
            job.submission_time.to_string(),
            job.requested_nb_res.to_string(),
            job.starting_time.to_string(),
            job.runtime.to_string(),
            (job.starting_time + job.runtime).to_string(),
            job.state.as_str().to_string(),
            job.return_code.to_string(),
            job.consumed_energy.to_string(),
            job.allocation.to_string_hyphen(" ", "-"),
            job.metadata.clone(),
        ];
        self.writer()?.write_record(row)?;
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub struct CheckpointManager {
    base: PathBuf,
    keep: u32,
    nb_checkpoints: u32,
    tracer: JobsTracer,
}

impl CheckpointManager {
    /// `export_prefix` is the simulation output directory; snapshots land in
    /// `<export_prefix>/checkpoint_<k>`.
    pub fn new(export_prefix: &str, keep: u32) -> CheckpointManager {
        let prefix = PathBuf::from(export_prefix);
        CheckpointManager {
            base: prefix.join("checkpoint"),
            keep: keep.max(1),
            nb_checkpoints: 0,
            tracer: JobsTracer::new(prefix.join("out_jobs.csv")),
        }
    }

    pub fn tracer_record(&mut self, job: &Job) {
        if let Err(e) = self.tracer.record(job) {
            log::error!("cannot write out_jobs.csv: {}", e);
        }
    }

    fn dir_name(&self, index: u32) -> PathBuf {
        PathBuf::from(format!("{}_{}", self.base.display(), index))
    }

    /// Writes a new snapshot, rotating the previous ones.
    pub fn snapshot(
        &mut self,
        workloads: &Workloads,
        machines: &Machines,
        pending_timers: &[ArmedTimer],
        now: f64,
        nb_completed_this_run: u32,
    ) -> io::Result<PathBuf> {
        self.rotate()?;
        self.nb_checkpoints += 1;
        let dir = self.dir_name(1);
        fs::create_dir_all(&dir)?;
        self.ensure_latest_symlink()?;

        let workload_doc = build_checkpoint_workload(
            workloads,
            machines,
            now,
            self.nb_checkpoints,
            nb_completed_this_run,
        );
        fs::write(
            dir.join("workload.json"),
            serde_json::to_string_pretty(&workload_doc)?,
        )?;

        let timers: Vec<Value> = pending_timers
            .iter()
            .map(|t| {
                json!({
                    "target_time": t.target_time,
                    "id": t.id,
                    "forWhat": t.purpose.as_u8(),
                    "from_scheduler": t.from_scheduler,
                })
            })
            .collect();
        let variables = json!({"now": now, "call_me_laters": timers});
        fs::write(
            dir.join("batsim_variables.chkpt"),
            serde_json::to_string_pretty(&variables)?,
        )?;

        self.tracer.flush()?;
        if self.tracer.path().exists() {
            fs::copy(self.tracer.path(), dir.join("out_jobs.csv"))?;
        }
        Ok(dir)
    }

    /// Shifts `_k` to `_{k+1}` (dropping `_keep`) so `_1` can be rewritten.
    fn rotate(&mut self) -> io::Result<()> {
        if self.keep <= 1 {
            let dir = self.dir_name(1);
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
            }
            return Ok(());
        }
        let mut start = self.nb_checkpoints;
        if start >= self.keep {
            start = self.keep - 1;
        }
        for i in (1..=start).rev() {
            let to = self.dir_name(i + 1);
            if to.exists() {
                fs::remove_dir_all(&to)?;
            }
            let from = self.dir_name(i);
            if from.exists() {
                fs::rename(&from, &to)?;
            }
        }
        Ok(())
    }

    fn ensure_latest_symlink(&self) -> io::Result<()> {
        let link = PathBuf::from(format!("{}_latest", self.base.display()));
        if fs::symlink_metadata(&link).is_err() {
            let target = format!(
                "{}_1",
                self.base
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "checkpoint".to_string())
            );
            #[cfg(unix)]
            std::os::unix::fs::symlink(target, &link)?;
        }
        Ok(())
    }

    /// The directory of snapshot `n` (1 being the most recent), used by the
    /// cold-start restore path.
    pub fn snapshot_dir(export_prefix: &str, n: u32) -> PathBuf {
        PathBuf::from(export_prefix).join(format!("checkpoint_{}", n))
    }
}

/// The `workload.json` document of one snapshot: counters plus every
/// currently-live job augmented with its runtime attributes and a profile
/// whose remaining work reflects the job's progress.
fn build_checkpoint_workload(
    workloads: &Workloads,
    machines: &Machines,
    now: f64,
    nb_checkpoint: u32,
    nb_completed_this_run: u32,
) -> Value {
    let mut jobs = Vec::new();
    let mut profiles = Map::new();
    let mut nb_original_jobs = 0u32;
    let mut nb_previously_completed = 0u32;

    for workload in workloads.iter() {
        nb_original_jobs += workload.nb_original_jobs;
        nb_previously_completed += workload.nb_actually_completed;
        for id in workload.jobs.ids_sorted_by_submission() {
            let job = workload.jobs.get(&id).unwrap();
            if job.state.is_terminal() {
                continue;
            }
            let progress = job
                .compute_job_progress(now)
                .map(|(p, _)| p)
                .unwrap_or(job.progress.max(0.0));

            let mut desc = job.json_description.clone();
            desc["state"] = json!(job.state.as_str());
            desc["progress"] = json!(progress);
            desc["allocation"] = json!(job.allocation.to_string_hyphen(" ", "-"));
            desc["runtime"] = json!(job.runtime);
            desc["starting_time"] = json!(job.starting_time);
            desc["consumed_energy"] = json!(job.consumed_energy);
            desc["jitter"] = json!(job.jitter);
            desc["metadata"] = json!(job.metadata);
            desc["batsim_metadata"] = json!(job.batsim_metadata);
            desc["submission_times"] = json!(job.submission_times);
            desc["original_walltime"] = json!(job.original_walltime);
            desc["original_submit"] = json!(job.submission_times.first().copied().unwrap_or(job.submission_time));
            desc["original_start"] = json!(if job.original_start >= 0.0 {
                job.original_start
            } else {
                job.starting_time
            });
            desc["progressTimeCpu"] = json!(job.progress_time_cpu);
            if !job.future_allocation.is_empty() {
                desc["alloc"] = json!(job.future_allocation.to_string_hyphen(" ", "-"));
            }
            jobs.push(desc);

            if let Some(profile) = workload.profiles.get(&job.profile_name) {
                let remaining = profile.rewrite_remaining(&profile.name, progress);
                profiles.insert(profile.name.clone(), remaining.json);
            }
        }
        // Sequence children must survive alongside their parents.
        for profile in workload.profiles.profiles() {
            profiles
                .entry(profile.name.clone())
                .or_insert_with(|| profile.json.clone());
        }
    }

    json!({
        "nb_res": machines.nb_machines(),
        "nb_checkpoint": nb_checkpoint,
        "nb_original_jobs": nb_original_jobs,
        "nb_actually_completed": nb_previously_completed + nb_completed_this_run,
        "jobs": jobs,
        "profiles": profiles,
    })
}
