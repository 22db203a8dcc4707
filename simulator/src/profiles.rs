use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("profile '{0}': missing or invalid field '{1}'")]
    InvalidField(String, String),
    #[error("profile '{0}': unknown profile type '{1}'")]
    UnknownType(String, String),
    #[error("profile '{0}' already exists")]
    AlreadyExists(String),
    #[error("profile '{0}' does not exist")]
    NotFound(String),
    #[error("profile '{0}' is still referenced and cannot be removed")]
    StillReferenced(String),
    #[error("profiles '{0}' and '{1}' cannot be merged: {2}")]
    MergeMismatch(String, String, String),
}

/// The different kinds of computational work a job can describe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProfileType {
    Delay,
    ParallelHomogeneous,
    Parallel,
    Sequence,
    Smpi,
}

impl ProfileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileType::Delay => "delay",
            ProfileType::ParallelHomogeneous => "parallel_homogeneous",
            ProfileType::Parallel => "parallel",
            ProfileType::Sequence => "composed",
            ProfileType::Smpi => "smpi",
        }
    }
}

#[derive(Clone, Debug)]
pub enum ProfileData {
    Delay {
        delay: f64,
        /// The actual amount of work once checkpoint dumps are interleaved.
        real_delay: f64,
        original_delay: f64,
    },
    ParallelHomogeneous {
        cpu: f64,
        real_cpu: f64,
        original_cpu: f64,
        com: f64,
        nb_res: Option<u32>,
    },
    Parallel {
        cpu: Vec<f64>,
        com: Vec<f64>,
        nb_res: u32,
    },
    Sequence {
        seq: Vec<String>,
        repeat: u32,
    },
    Smpi {
        trace_filenames: Vec<String>,
    },
}

/// An immutable-once-published description of a job's work.
///
/// The raw JSON description is retained verbatim so it can be forwarded to
/// the scheduler unchanged.
#[derive(Clone, Debug)]
pub struct Profile {
    pub name: String,
    pub data: ProfileData,
    pub json: Value,
}

fn get_f64(name: &str, json: &Value, field: &str) -> Result<f64, ProfileError> {
    json.get(field)
        .and_then(Value::as_f64)
        .ok_or_else(|| ProfileError::InvalidField(name.to_string(), field.to_string()))
}

impl Profile {
    pub fn from_json(name: &str, json: Value) -> Result<Profile, ProfileError> {
        let type_str = json
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProfileError::InvalidField(name.to_string(), "type".to_string()))?;

        let data = match type_str {
            "delay" => {
                let delay = get_f64(name, &json, "delay")?;
                ProfileData::Delay {
                    delay,
                    real_delay: json.get("real_delay").and_then(Value::as_f64).unwrap_or(delay),
                    original_delay: json
                        .get("original_delay")
                        .and_then(Value::as_f64)
                        .unwrap_or(delay),
                }
            }
            "parallel_homogeneous" => {
                let cpu = get_f64(name, &json, "cpu")?;
                ProfileData::ParallelHomogeneous {
                    cpu,
                    real_cpu: json.get("real_cpu").and_then(Value::as_f64).unwrap_or(cpu),
                    original_cpu: json.get("original_cpu").and_then(Value::as_f64).unwrap_or(cpu),
                    com: get_f64(name, &json, "com")?,
                    nb_res: json.get("nb_res").and_then(Value::as_u64).map(|v| v as u32),
                }
            }
            "parallel" => {
                let cpu: Vec<f64> = json
                    .get("cpu")
                    .and_then(Value::as_array)
                    .map(|a| a.iter().filter_map(Value::as_f64).collect())
                    .ok_or_else(|| {
                        ProfileError::InvalidField(name.to_string(), "cpu".to_string())
                    })?;
                let com: Vec<f64> = json
                    .get("com")
                    .and_then(Value::as_array)
                    .map(|a| a.iter().filter_map(Value::as_f64).collect())
                    .ok_or_else(|| {
                        ProfileError::InvalidField(name.to_string(), "com".to_string())
                    })?;
                let nb_res = cpu.len() as u32;
                if com.len() != cpu.len() * cpu.len() {
                    return Err(ProfileError::InvalidField(
                        name.to_string(),
                        "com".to_string(),
                    ));
                }
                ProfileData::Parallel { cpu, com, nb_res }
            }
            "composed" | "sequence" => {
                let seq: Vec<String> = json
                    .get("seq")
                    .and_then(Value::as_array)
                    .map(|a| {
                        a.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .ok_or_else(|| {
                        ProfileError::InvalidField(name.to_string(), "seq".to_string())
                    })?;
                if seq.is_empty() {
                    return Err(ProfileError::InvalidField(
                        name.to_string(),
                        "seq".to_string(),
                    ));
                }
                let repeat = json.get("repeat").and_then(Value::as_u64).unwrap_or(1) as u32;
                ProfileData::Sequence { seq, repeat }
            }
            "smpi" => {
                let trace_filenames: Vec<String> = json
                    .get("trace")
                    .and_then(Value::as_array)
                    .map(|a| {
                        a.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .ok_or_else(|| {
                        ProfileError::InvalidField(name.to_string(), "trace".to_string())
                    })?;
                ProfileData::Smpi { trace_filenames }
            }
            other => {
                return Err(ProfileError::UnknownType(
                    name.to_string(),
                    other.to_string(),
                ))
            }
        };

        Ok(Profile {
            name: name.to_string(),
            data,
            json,
        })
    }

    pub fn profile_type(&self) -> ProfileType {
        match self.data {
            ProfileData::Delay { .. } => ProfileType::Delay,
            ProfileData::ParallelHomogeneous { .. } => ProfileType::ParallelHomogeneous,
            ProfileData::Parallel { .. } => ProfileType::Parallel,
            ProfileData::Sequence { .. } => ProfileType::Sequence,
            ProfileData::Smpi { .. } => ProfileType::Smpi,
        }
    }

    pub fn is_parallel_task(&self) -> bool {
        matches!(
            self.data,
            ProfileData::ParallelHomogeneous { .. } | ProfileData::Parallel { .. }
        )
    }

    /// Whether per-job checkpoint dumps can be interleaved with this work.
    pub fn supports_checkpointing(&self) -> bool {
        matches!(
            self.data,
            ProfileData::Delay { .. } | ProfileData::ParallelHomogeneous { .. }
        )
    }

    /// Scales the amount of work by the workload performance factor.
    pub fn apply_performance_factor(&mut self, factor: f64) {
        if factor == 1.0 {
            return;
        }
        match &mut self.data {
            ProfileData::Delay {
                delay, real_delay, ..
            } => {
                *delay *= factor;
                *real_delay = *delay;
                self.json["delay"] = json!(*delay);
            }
            ProfileData::ParallelHomogeneous { cpu, real_cpu, .. } => {
                *cpu *= factor;
                *real_cpu = *cpu;
                self.json["cpu"] = json!(*cpu);
            }
            _ => {}
        }
    }

    /// Expands the work so that it accounts for periodic checkpoint dumps.
    ///
    /// The effective work is `ceil(real / interval) * dump_time + real`, with
    /// one dump elided when the interval divides the work exactly.
    /// `node_speed` converts between flops and seconds for parallel profiles.
    pub fn rewrite_for_checkpointing(&mut self, interval: f64, dump_time: f64, node_speed: f64) {
        match &mut self.data {
            ProfileData::Delay {
                delay,
                real_delay,
                original_delay,
            } => {
                let real = *delay;
                *real_delay = real;
                *original_delay = real;
                let effective = effective_work(real, interval, dump_time);
                *delay = effective;
                self.json["delay"] = json!(effective);
                self.json["original_delay"] = json!(real);
            }
            ProfileData::ParallelHomogeneous {
                cpu,
                real_cpu,
                original_cpu,
                ..
            } => {
                let real = *cpu;
                *real_cpu = real;
                *original_cpu = real;
                let seconds = real / node_speed;
                let effective = effective_work(seconds, interval, dump_time) * node_speed;
                *cpu = effective;
                self.json["cpu"] = json!(effective);
                self.json["original_cpu"] = json!(real);
            }
            _ => {}
        }
    }

    /// Builds the profile of a resubmitted or restored job: the remaining
    /// real work is `(1 - progress) * original work`.
    pub fn rewrite_remaining(&self, new_name: &str, progress: f64) -> Profile {
        let p = progress.clamp(0.0, 1.0);
        match &self.data {
            ProfileData::Delay { original_delay, .. } => {
                let remaining = (1.0 - p) * original_delay;
                Profile {
                    name: new_name.to_string(),
                    data: ProfileData::Delay {
                        delay: remaining,
                        real_delay: remaining,
                        original_delay: *original_delay,
                    },
                    json: json!({"type": "delay", "delay": remaining, "original_delay": original_delay}),
                }
            }
            ProfileData::ParallelHomogeneous {
                original_cpu,
                com,
                nb_res,
                ..
            } => {
                let remaining = (1.0 - p) * original_cpu;
                Profile {
                    name: new_name.to_string(),
                    data: ProfileData::ParallelHomogeneous {
                        cpu: remaining,
                        real_cpu: remaining,
                        original_cpu: *original_cpu,
                        com: *com,
                        nb_res: *nb_res,
                    },
                    json: json!({"type": "parallel_homogeneous", "cpu": remaining,
                                 "com": com, "original_cpu": original_cpu}),
                }
            }
            _ => {
                let mut clone = self.clone();
                clone.name = new_name.to_string();
                clone
            }
        }
    }
}

/// Young's expansion of the real work by its checkpoint dumps.
pub fn effective_work(real: f64, interval: f64, dump_time: f64) -> f64 {
    if real <= 0.0 || interval <= 0.0 {
        return real;
    }
    let mut dumps = (real / interval).ceil();
    if (real / interval).fract() == 0.0 {
        dumps -= 1.0;
    }
    if dumps <= 0.0 {
        return real;
    }
    dumps * dump_time + real
}

/// Merges a leaf job profile with its additional IO profile: compute is the
/// element-wise max, communication the element-wise sum.
pub fn merge_leaf(job: &Profile, io: &Profile) -> Result<Profile, ProfileError> {
    let mismatch = |reason: &str| {
        ProfileError::MergeMismatch(job.name.clone(), io.name.clone(), reason.to_string())
    };
    let merged_name = format!("{}+{}", job.name, io.name);
    match (&job.data, &io.data) {
        (
            ProfileData::ParallelHomogeneous {
                cpu: jc, com: jm, nb_res, ..
            },
            ProfileData::ParallelHomogeneous { cpu: ic, com: im, .. },
        ) => {
            let cpu = jc.max(*ic);
            let com = jm + im;
            Ok(Profile {
                name: merged_name,
                data: ProfileData::ParallelHomogeneous {
                    cpu,
                    real_cpu: cpu,
                    original_cpu: cpu,
                    com,
                    nb_res: *nb_res,
                },
                json: json!({"type": "parallel_homogeneous", "cpu": cpu, "com": com}),
            })
        }
        (
            ProfileData::Parallel { cpu: jc, com: jm, nb_res },
            ProfileData::Parallel { cpu: ic, com: im, .. },
        ) => {
            if jc.len() != ic.len() || jm.len() != im.len() {
                return Err(mismatch("matrix sizes differ"));
            }
            let cpu: Vec<f64> = jc.iter().zip(ic).map(|(a, b)| a.max(*b)).collect();
            let com: Vec<f64> = jm.iter().zip(im).map(|(a, b)| a + b).collect();
            Ok(Profile {
                name: merged_name,
                data: ProfileData::Parallel {
                    cpu: cpu.clone(),
                    com: com.clone(),
                    nb_res: *nb_res,
                },
                json: json!({"type": "parallel", "cpu": cpu, "com": com}),
            })
        }
        _ => Err(mismatch("profile types are not mergeable")),
    }
}

/// Checks that an IO profile is structurally compatible with a job profile
/// before execution: same type, and for sequences the same child count.
pub fn validate_io_merge(job: &Profile, io: &Profile) -> Result<(), ProfileError> {
    if job.profile_type() != io.profile_type() {
        return Err(ProfileError::MergeMismatch(
            job.name.clone(),
            io.name.clone(),
            "profile types differ".to_string(),
        ));
    }
    if let (
        ProfileData::Sequence { seq: js, .. },
        ProfileData::Sequence { seq: is_, .. },
    ) = (&job.data, &io.data)
    {
        if js.len() != is_.len() {
            return Err(ProfileError::MergeMismatch(
                job.name.clone(),
                io.name.clone(),
                format!("sequence sizes differ ({} vs {})", js.len(), is_.len()),
            ));
        }
    }
    Ok(())
}

/// Per-workload profile store with reference counting.
///
/// Jobs and sequence parents acquire references; a profile can only be
/// removed once its count drops to zero. With garbage collection enabled,
/// releasing the last reference removes the profile eagerly.
pub struct ProfileStore {
    profiles: FxHashMap<String, Profile>,
    refcounts: FxHashMap<String, u32>,
    gc_enabled: bool,
}

impl ProfileStore {
    pub fn new(gc_enabled: bool) -> Self {
        Self {
            profiles: FxHashMap::default(),
            refcounts: FxHashMap::default(),
            gc_enabled,
        }
    }

    pub fn add(&mut self, profile: Profile) -> Result<(), ProfileError> {
        if self.profiles.contains_key(&profile.name) {
            return Err(ProfileError::AlreadyExists(profile.name));
        }
        self.refcounts.insert(profile.name.clone(), 0);
        self.profiles.insert(profile.name.clone(), profile);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Profile> {
        self.profiles.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Profile> {
        self.profiles.get_mut(name)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.profiles.contains_key(name)
    }

    pub fn nb_profiles(&self) -> usize {
        self.profiles.len()
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.profiles.keys()
    }

    pub fn profiles(&self) -> impl Iterator<Item = &Profile> {
        self.profiles.values()
    }

    pub fn refcount(&self, name: &str) -> u32 {
        self.refcounts.get(name).copied().unwrap_or(0)
    }

    pub fn acquire(&mut self, name: &str) -> Result<(), ProfileError> {
        match self.refcounts.get_mut(name) {
            Some(count) => {
                *count += 1;
                Ok(())
            }
            None => Err(ProfileError::NotFound(name.to_string())),
        }
    }

    /// Drops one reference. With garbage collection enabled, the profile is
    /// removed as soon as it becomes unreferenced.
    pub fn release(&mut self, name: &str) {
        if let Some(count) = self.refcounts.get_mut(name) {
            *count = count.saturating_sub(1);
            if *count == 0 && self.gc_enabled {
                self.refcounts.remove(name);
                self.profiles.remove(name);
            }
        }
    }

    pub fn remove(&mut self, name: &str) -> Result<(), ProfileError> {
        match self.refcounts.get(name) {
            None => Err(ProfileError::NotFound(name.to_string())),
            Some(&count) if count > 0 => Err(ProfileError::StillReferenced(name.to_string())),
            Some(_) => {
                self.refcounts.remove(name);
                self.profiles.remove(name);
                Ok(())
            }
        }
    }

    /// Removes every profile that is no longer reachable from a job or from
    /// a sequence parent's child list.
    pub fn gc_unreferenced(&mut self) -> usize {
        let dead: Vec<String> = self
            .refcounts
            .iter()
            .filter(|(_, &count)| count == 0)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &dead {
            self.refcounts.remove(name);
            self.profiles.remove(name);
        }
        dead.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delay_profile(name: &str, delay: f64) -> Profile {
        Profile::from_json(name, json!({"type": "delay", "delay": delay})).unwrap()
    }

    #[test]
    fn parses_all_core_profile_types() {
        assert_eq!(delay_profile("d", 3.0).profile_type(), ProfileType::Delay);
        let ph = Profile::from_json(
            "ph",
            json!({"type": "parallel_homogeneous", "cpu": 1e9, "com": 0.0}),
        )
        .unwrap();
        assert_eq!(ph.profile_type(), ProfileType::ParallelHomogeneous);
        let par = Profile::from_json(
            "p",
            json!({"type": "parallel", "cpu": [1e9, 1e9], "com": [0.0, 1.0, 1.0, 0.0]}),
        )
        .unwrap();
        assert_eq!(par.profile_type(), ProfileType::Parallel);
        let seq = Profile::from_json(
            "s",
            json!({"type": "composed", "repeat": 2, "seq": ["d", "ph"]}),
        )
        .unwrap();
        assert_eq!(seq.profile_type(), ProfileType::Sequence);
    }

    #[test]
    fn rejects_malformed_profiles() {
        assert!(Profile::from_json("x", json!({"type": "delay"})).is_err());
        assert!(Profile::from_json("x", json!({"delay": 3.0})).is_err());
        assert!(Profile::from_json("x", json!({"type": "wat"})).is_err());
        // com matrix must be nb_res^2
        assert!(Profile::from_json(
            "x",
            json!({"type": "parallel", "cpu": [1.0, 2.0], "com": [0.0]})
        )
        .is_err());
    }

    #[test]
    fn effective_work_applies_youngs_correction() {
        // 10 units of work, dumps every 3 units, 1 unit per dump.
        assert_eq!(effective_work(10.0, 3.0, 1.0), 14.0);
        // Exact division skips the trailing dump.
        assert_eq!(effective_work(9.0, 3.0, 1.0), 11.0);
        // Work shorter than the interval needs no dump.
        assert_eq!(effective_work(2.0, 3.0, 1.0), 2.0);
    }

    #[test]
    fn checkpoint_rewrite_updates_json_description() {
        let mut p = delay_profile("d", 10.0);
        p.rewrite_for_checkpointing(3.0, 1.0, 1.0);
        match p.data {
            ProfileData::Delay {
                delay,
                real_delay,
                original_delay,
            } => {
                assert_eq!(delay, 14.0);
                assert_eq!(real_delay, 10.0);
                assert_eq!(original_delay, 10.0);
            }
            _ => unreachable!(),
        }
        assert_eq!(p.json["delay"], json!(14.0));
        assert_eq!(p.json["original_delay"], json!(10.0));
    }

    #[test]
    fn remaining_work_scales_with_progress() {
        let mut p = delay_profile("d", 10.0);
        p.rewrite_for_checkpointing(3.0, 1.0, 1.0);
        let rest = p.rewrite_remaining("d#1", 0.5);
        match rest.data {
            ProfileData::Delay { delay, .. } => assert_eq!(delay, 5.0),
            _ => unreachable!(),
        }
    }

    #[test]
    fn merge_takes_max_compute_and_summed_com() {
        let job = Profile::from_json(
            "job",
            json!({"type": "parallel_homogeneous", "cpu": 4e9, "com": 1e6}),
        )
        .unwrap();
        let io = Profile::from_json(
            "io",
            json!({"type": "parallel_homogeneous", "cpu": 1e9, "com": 5e6}),
        )
        .unwrap();
        let merged = merge_leaf(&job, &io).unwrap();
        match merged.data {
            ProfileData::ParallelHomogeneous { cpu, com, .. } => {
                assert_eq!(cpu, 4e9);
                assert_eq!(com, 6e6);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn store_refuses_to_remove_referenced_profiles() {
        let mut store = ProfileStore::new(false);
        store.add(delay_profile("d", 1.0)).unwrap();
        store.acquire("d").unwrap();
        assert!(matches!(
            store.remove("d"),
            Err(ProfileError::StillReferenced(_))
        ));
        store.release("d");
        store.remove("d").unwrap();
        assert!(!store.exists("d"));
    }

    #[test]
    fn gc_keeps_exactly_the_referenced_profiles() {
        let mut store = ProfileStore::new(false);
        store.add(delay_profile("used", 1.0)).unwrap();
        store.add(delay_profile("dead", 1.0)).unwrap();
        store.acquire("used").unwrap();
        let removed = store.gc_unreferenced();
        assert_eq!(removed, 1);
        assert!(store.exists("used"));
        assert!(!store.exists("dead"));
    }
}
