use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("'--copy {0}' is in the wrong format")]
    BadCopy(String),
    #[error("'--submission-time {0}' is in the wrong format")]
    BadSubmissionTimes(String),
    #[error("'--checkpoint-batsim-interval {0}' is not a valid time string")]
    BadCheckpointInterval(String),
}

#[derive(Clone, Debug, Deserialize)]
pub struct WorkloadDescription {
    pub filename: String,
    pub name: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmissionRandom {
    Fixed,
    Exp,
    Unif,
}

/// Parsed `--submission-time-before/after` option.
#[derive(Clone, Debug)]
pub struct SubmissionTimes {
    pub value1: Option<f64>,
    pub value2: Option<f64>,
    pub random: Option<SubmissionRandom>,
    pub shuffle: bool,
    pub seed: Option<u64>,
}

impl SubmissionTimes {
    /// Accepted forms: `<v>:fixed`, `<v>:exp[:s][:seed]`, `<v>:exp:<seed>`,
    /// `<a>:<b>:unif[:s][:seed]`, `shuffle[:seed]`.
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let bad = || ConfigError::BadSubmissionTimes(input.to_string());
        let parts: Vec<&str> = input.split(':').collect();

        if parts[0] == "shuffle" || parts[0] == "s" {
            let seed = match parts.len() {
                1 => None,
                2 => Some(parts[1].parse().map_err(|_| bad())?),
                _ => return Err(bad()),
            };
            return Ok(SubmissionTimes {
                value1: None,
                value2: None,
                random: None,
                shuffle: true,
                seed,
            });
        }

        let value1: f64 = parts[0].parse().map_err(|_| bad())?;
        match parts.get(1) {
            Some(&"fixed") if parts.len() == 2 => Ok(SubmissionTimes {
                value1: Some(value1),
                value2: None,
                random: Some(SubmissionRandom::Fixed),
                shuffle: false,
                seed: None,
            }),
            Some(&"exp") => {
                let (shuffle, seed) = parse_shuffle_seed(&parts[2..], bad)?;
                Ok(SubmissionTimes {
                    value1: Some(value1),
                    value2: None,
                    random: Some(SubmissionRandom::Exp),
                    shuffle,
                    seed,
                })
            }
            Some(_) => {
                let value2: f64 = parts[1].parse().map_err(|_| bad())?;
                if parts.get(2) != Some(&"unif") {
                    return Err(bad());
                }
                let (shuffle, seed) = parse_shuffle_seed(&parts[3..], bad)?;
                Ok(SubmissionTimes {
                    value1: Some(value1),
                    value2: Some(value2),
                    random: Some(SubmissionRandom::Unif),
                    shuffle,
                    seed,
                })
            }
            None => Err(bad()),
        }
    }
}

fn parse_shuffle_seed(
    rest: &[&str],
    bad: impl Fn() -> ConfigError,
) -> Result<(bool, Option<u64>), ConfigError> {
    match rest {
        [] => Ok((false, None)),
        ["s"] | ["shuffle"] => Ok((true, None)),
        ["s", seed] | ["shuffle", seed] => {
            Ok((true, Some(seed.parse().map_err(|_| bad())?)))
        }
        [seed] => Ok((false, Some(seed.parse().map_err(|_| bad())?))),
        _ => Err(bad()),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopyRandom {
    /// Plain copies, submission times unchanged.
    None,
    /// Fixed offset (or fixed spacing with '=').
    Fixed,
    /// Exponential inter-arrival spacing.
    Exp,
    /// Uniform integer jitter within [value1, value2].
    Unif,
}

/// How many uniform draws the copy pass performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrawScope {
    /// One draw shared by every copy.
    Single,
    /// One draw per copy.
    EachCopy,
    /// One draw per job.
    All,
}

/// Parsed `--copy` option.
#[derive(Clone, Debug)]
pub struct CopyOptions {
    pub copies: u32,
    pub symbol: Option<char>,
    pub value1: Option<f64>,
    pub value2: Option<f64>,
    pub random: CopyRandom,
    pub how_many: Option<DrawScope>,
    pub seed: Option<u64>,
}

impl CopyOptions {
    /// Accepted forms: `<n>`, `<n>:(+|-|=):<v>:fixed`, `<n>:=:<v>:exp[:seed]`,
    /// `<n>:(+|-|=):<a>:<b>:unif:(single|each-copy|all)[:seed]`.
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let bad = || ConfigError::BadCopy(input.to_string());
        let parts: Vec<&str> = input.split(':').collect();

        let copies: u32 = parts[0].parse().map_err(|_| bad())?;
        if copies == 0 {
            return Err(bad());
        }
        if parts.len() == 1 {
            return Ok(CopyOptions {
                copies,
                symbol: None,
                value1: None,
                value2: None,
                random: CopyRandom::None,
                how_many: None,
                seed: None,
            });
        }

        let symbol = match parts[1] {
            "+" => '+',
            "-" => '-',
            "=" => '=',
            _ => return Err(bad()),
        };
        let value1: f64 = parts.get(2).ok_or_else(bad)?.parse().map_err(|_| bad())?;

        match parts.get(3) {
            Some(&"fixed") if parts.len() == 4 => Ok(CopyOptions {
                copies,
                symbol: Some(symbol),
                value1: Some(value1),
                value2: None,
                random: CopyRandom::Fixed,
                how_many: None,
                seed: None,
            }),
            Some(&"exp") => {
                if symbol != '=' {
                    return Err(bad());
                }
                let seed = match parts.get(4) {
                    None => None,
                    Some(seed) => Some(seed.parse().map_err(|_| bad())?),
                };
                if parts.len() > 5 {
                    return Err(bad());
                }
                Ok(CopyOptions {
                    copies,
                    symbol: Some(symbol),
                    value1: Some(value1),
                    value2: None,
                    random: CopyRandom::Exp,
                    how_many: None,
                    seed,
                })
            }
            Some(_) => {
                let value2: f64 = parts[3].parse().map_err(|_| bad())?;
                if parts.get(4) != Some(&"unif") {
                    return Err(bad());
                }
                let how_many = match parts.get(5) {
                    Some(&"single") => DrawScope::Single,
                    Some(&"each-copy") => DrawScope::EachCopy,
                    Some(&"all") => DrawScope::All,
                    _ => return Err(bad()),
                };
                let seed = match parts.get(6) {
                    None => None,
                    Some(seed) => Some(seed.parse().map_err(|_| bad())?),
                };
                if parts.len() > 7 {
                    return Err(bad());
                }
                Ok(CopyOptions {
                    copies,
                    symbol: Some(symbol),
                    value1: Some(value1),
                    value2: Some(value2),
                    random: CopyRandom::Unif,
                    how_many: Some(how_many),
                    seed,
                })
            }
            None => Err(bad()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckpointClock {
    Real,
    Simulated,
}

/// Parsed `--checkpoint-batsim-interval` option.
#[derive(Clone, Debug)]
pub struct BatsimCheckpointConfig {
    pub clock: CheckpointClock,
    pub period_seconds: f64,
    pub keep: u32,
}

impl BatsimCheckpointConfig {
    /// Accepted form: `<real|simulated>:DAYS-HH:MM:SS[:keep]`.
    pub fn parse(input: &str, keep_override: Option<u32>) -> Result<Self, ConfigError> {
        let bad = || ConfigError::BadCheckpointInterval(input.to_string());
        let (clock_str, rest) = input.split_once(':').ok_or_else(bad)?;
        let clock = match clock_str {
            "real" => CheckpointClock::Real,
            "simulated" => CheckpointClock::Simulated,
            _ => return Err(bad()),
        };
        let (days_str, hms) = rest.split_once('-').ok_or_else(bad)?;
        let days: u64 = days_str.parse().map_err(|_| bad())?;
        let parts: Vec<&str> = hms.split(':').collect();
        if parts.len() != 3 && parts.len() != 4 {
            return Err(bad());
        }
        let hours: u64 = parts[0].parse().map_err(|_| bad())?;
        let minutes: u64 = parts[1].parse().map_err(|_| bad())?;
        let seconds: u64 = parts[2].parse().map_err(|_| bad())?;
        let mut keep = match parts.get(3) {
            Some(k) => k.parse().map_err(|_| bad())?,
            None => 1,
        };
        // An explicit --checkpoint-batsim-keep wins over the inline value.
        if let Some(k) = keep_override {
            keep = k;
        }
        if keep == 0 {
            return Err(bad());
        }
        let period_seconds =
            (seconds + minutes * 60 + hours * 3600 + days * 24 * 3600) as f64;
        Ok(BatsimCheckpointConfig {
            clock,
            period_seconds,
            keep,
        })
    }
}

/// A scheduler call-me-later carried over from a batsim-level checkpoint,
/// re-armed relative to the restarted clock.
#[derive(Clone, Debug)]
pub struct RestoredCallMeLater {
    pub delay: f64,
    pub id: i64,
    pub for_what: u8,
}

/// Failure-injection knobs.
#[derive(Clone, Debug, Default)]
pub struct FailureConfig {
    pub mtbf: Option<f64>,
    pub smtbf: Option<f64>,
    pub fixed_failures: Option<f64>,
    pub repair_time: f64,
    pub mttr: Option<f64>,
    pub seed_failures: Option<u64>,
}

/// Application-level (per-job) checkpointing knobs.
#[derive(Clone, Debug, Default)]
pub struct CheckpointingConfig {
    pub enabled: bool,
    pub compute_interval: bool,
    pub compute_error: f64,
    pub global_interval: Option<f64>,
}

#[derive(Clone, Debug)]
pub struct DynamicRegistrationConfig {
    pub enabled: bool,
    pub ack: bool,
    pub profile_reuse: bool,
}

impl Default for DynamicRegistrationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ack: false,
            profile_reuse: false,
        }
    }
}

/// The fully-resolved simulation configuration, built from the CLI.
pub struct SimulationConfig {
    pub platform_file: String,
    pub workloads: Vec<WorkloadDescription>,
    pub socket_endpoint: String,
    pub master_host_name: String,

    pub limit_machines_count: Option<u32>,
    pub limit_machines_count_by_workload: bool,

    pub allow_compute_sharing: bool,
    pub allow_storage_sharing: bool,
    pub forward_profiles_on_submission: bool,
    pub dynamic_registration: DynamicRegistrationConfig,

    pub failures: FailureConfig,
    pub checkpointing: CheckpointingConfig,
    pub batsim_checkpoint: Option<BatsimCheckpointConfig>,
    pub start_from_checkpoint: Option<u32>,
    pub restored_call_me_laters: Vec<RestoredCallMeLater>,

    pub copy: Option<CopyOptions>,
    pub submission_time_before: Option<SubmissionTimes>,
    pub submission_time_after: Option<SubmissionTimes>,
    pub performance_factor: f64,

    pub export_prefix: String,
    pub enable_schedule_tracing: bool,

    /// Reference bandwidth (bytes/s) used to turn communication volumes into
    /// simulated durations.
    pub reference_bandwidth: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            platform_file: String::new(),
            workloads: Vec::new(),
            socket_endpoint: "tcp://localhost:28000".to_string(),
            master_host_name: "master_host".to_string(),
            limit_machines_count: None,
            limit_machines_count_by_workload: false,
            allow_compute_sharing: false,
            allow_storage_sharing: true,
            forward_profiles_on_submission: false,
            dynamic_registration: DynamicRegistrationConfig::default(),
            failures: FailureConfig::default(),
            checkpointing: CheckpointingConfig {
                enabled: false,
                compute_interval: false,
                compute_error: 1.0,
                global_interval: None,
            },
            batsim_checkpoint: None,
            start_from_checkpoint: None,
            restored_call_me_laters: Vec::new(),
            copy: None,
            submission_time_before: None,
            submission_time_after: None,
            performance_factor: 1.0,
            export_prefix: "out".to_string(),
            enable_schedule_tracing: false,
            reference_bandwidth: 1e9,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_submission_time_forms() {
        let st = SubmissionTimes::parse("100.0:fixed").unwrap();
        assert_eq!(st.value1, Some(100.0));
        assert_eq!(st.random, Some(SubmissionRandom::Fixed));
        assert!(!st.shuffle);

        let st = SubmissionTimes::parse("200.0:exp:10").unwrap();
        assert_eq!(st.random, Some(SubmissionRandom::Exp));
        assert_eq!(st.seed, Some(10));

        let st = SubmissionTimes::parse("0:200.0:unif:20").unwrap();
        assert_eq!(st.random, Some(SubmissionRandom::Unif));
        assert_eq!(st.value2, Some(200.0));
        assert_eq!(st.seed, Some(20));

        let st = SubmissionTimes::parse("shuffle:20").unwrap();
        assert!(st.shuffle);
        assert_eq!(st.seed, Some(20));

        assert!(SubmissionTimes::parse("garbage:x").is_err());
    }

    #[test]
    fn parses_copy_forms() {
        let c = CopyOptions::parse("3").unwrap();
        assert_eq!(c.copies, 3);
        assert_eq!(c.random, CopyRandom::None);

        let c = CopyOptions::parse("3:+:5:fixed").unwrap();
        assert_eq!(c.symbol, Some('+'));
        assert_eq!(c.value1, Some(5.0));
        assert_eq!(c.random, CopyRandom::Fixed);

        let c = CopyOptions::parse("3:+:5:10:unif:each-copy:42").unwrap();
        assert_eq!(c.random, CopyRandom::Unif);
        assert_eq!(c.value2, Some(10.0));
        assert_eq!(c.how_many, Some(DrawScope::EachCopy));
        assert_eq!(c.seed, Some(42));

        let c = CopyOptions::parse("2:=:200:exp").unwrap();
        assert_eq!(c.random, CopyRandom::Exp);

        // exp requires '='
        assert!(CopyOptions::parse("2:+:200:exp").is_err());
        assert!(CopyOptions::parse("0").is_err());
    }

    #[test]
    fn parses_checkpoint_interval() {
        let c = BatsimCheckpointConfig::parse("simulated:0-00:10:00:3", None).unwrap();
        assert_eq!(c.clock, CheckpointClock::Simulated);
        assert_eq!(c.period_seconds, 600.0);
        assert_eq!(c.keep, 3);

        let c = BatsimCheckpointConfig::parse("real:1-02:00:30", Some(5)).unwrap();
        assert_eq!(c.clock, CheckpointClock::Real);
        assert_eq!(c.period_seconds, (24 * 3600 + 2 * 3600 + 30) as f64);
        assert_eq!(c.keep, 5);

        assert!(BatsimCheckpointConfig::parse("sometimes:0-00:10:00", None).is_err());
    }
}
