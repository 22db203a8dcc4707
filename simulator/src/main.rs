use std::fs;
use std::io::Write;
use std::rc::Rc;

use clap::Parser;
use env_logger::Builder;
use log::{error, warn};
use serde_json::json;

use dslab_core::Simulation;

use dslab_batsim::batsim_checkpoint::CheckpointManager;
use dslab_batsim::config::sim_config::{
    BatsimCheckpointConfig, CheckpointingConfig, CopyOptions, DynamicRegistrationConfig,
    FailureConfig, RestoredCallMeLater, SimulationConfig, SubmissionTimes, WorkloadDescription,
};
use dslab_batsim::machines::Machines;
use dslab_batsim::protocol::ZmqSchedulerClient;
use dslab_batsim::simulation::BatsimSimulation;
use dslab_batsim::workload::{Workload, Workloads};

// Input-validation failures are reported through a bit-mapped exit code.
const EXIT_BAD_PLATFORM: i32 = 0x01;
const EXIT_BAD_WORKLOAD: i32 = 0x02;
const EXIT_BAD_WORKFLOW: i32 = 0x04;
const EXIT_BAD_OPTION: i32 = 0x40;

#[derive(Parser)]
#[command(
    name = "batsim",
    about = "Discrete-event simulator of a parallel cluster driven by an \
             external scheduler over a JSON request/reply socket.",
    long_about = None
)]
struct Args {
    /// Platform description file (host list consumed by the roster).
    #[arg(short = 'p', long = "platform")]
    platform: String,

    /// Workload JSON file; can be given several times (w0, w1, ...).
    #[arg(short = 'w', long = "workload")]
    workloads: Vec<String>,

    /// Workflow description file (not simulated by this build).
    #[arg(long = "workflow")]
    workflows: Vec<String>,

    /// External event list file (not simulated by this build).
    #[arg(long = "events")]
    events: Vec<String>,

    /// Scheduler request/reply socket endpoint.
    #[arg(short = 's', long = "socket-endpoint", default_value = "tcp://localhost:28000")]
    socket_endpoint: String,

    /// Name of the host running the server (excluded from compute).
    #[arg(long = "master-host", default_value = "master_host")]
    master_host: String,

    /// Maximum number of compute machines (0 means no limit).
    #[arg(long = "mmax", default_value_t = 0)]
    mmax: u32,

    /// Cap the number of compute machines by the workloads' nb_res.
    #[arg(long = "mmax-workload")]
    mmax_workload: bool,

    /// Mean time between job failures, in seconds (exponential).
    #[arg(long = "MTBF")]
    mtbf: Option<f64>,

    /// System mean time between machine failures, in seconds (exponential).
    #[arg(long = "SMTBF")]
    smtbf: Option<f64>,

    /// Machine failures at a constant period, in seconds.
    #[arg(long = "fixed-failures")]
    fixed_failures: Option<f64>,

    /// Time for a failed machine to come back on-line, in seconds.
    #[arg(long = "repair-time", default_value_t = 0.0)]
    repair_time: f64,

    /// Mean time to repair, in seconds (exponential; overrides repair-time).
    #[arg(long = "MTTR")]
    mttr: Option<f64>,

    /// Seed for the failure random generators; deterministic when set.
    #[arg(long = "seed-failures")]
    seed_failures: Option<u64>,

    /// Enable application-level (per-job) checkpointing.
    #[arg(long = "checkpointing-on")]
    checkpointing_on: bool,

    /// Compute each job's checkpoint interval with Young's formula.
    #[arg(long = "compute-checkpointing")]
    compute_checkpointing: bool,

    /// Global checkpoint interval overriding computed/per-job values.
    #[arg(long = "checkpointing-interval")]
    checkpointing_interval: Option<f64>,

    /// Error factor applied to the computed optimal checkpoint interval.
    #[arg(long = "compute-checkpointing-error", default_value_t = 1.0)]
    compute_checkpointing_error: f64,

    /// Simulator-level snapshots: <real|simulated>:DAYS-HH:MM:SS[:keep].
    #[arg(long = "checkpoint-batsim-interval")]
    checkpoint_batsim_interval: Option<String>,

    /// How many simulator-level snapshots to keep.
    #[arg(long = "checkpoint-batsim-keep")]
    checkpoint_batsim_keep: Option<u32>,

    /// Cold-start from snapshot number N (1 is the most recent).
    #[arg(long = "start-from-checkpoint")]
    start_from_checkpoint: Option<u32>,

    /// Workload amplification:
    /// <n>[:(+|-|=):<v>:(fixed|exp|<v2>:unif:(single|each-copy|all))[:seed]].
    /// Applied between --submission-time-before and --submission-time-after.
    #[arg(long = "copy")]
    copy: Option<String>,

    /// Submission-time rewrite applied before --copy:
    /// <v>:fixed | <v>:exp[:s][:seed] | <a>:<b>:unif[:s][:seed] | shuffle[:seed].
    #[arg(long = "submission-time-before")]
    submission_time_before: Option<String>,

    /// Submission-time rewrite applied after --copy (same grammar).
    #[arg(long = "submission-time-after")]
    submission_time_after: Option<String>,

    /// Multiplies the duration of every job's work.
    #[arg(long = "performance-factor", default_value_t = 1.0)]
    performance_factor: f64,

    /// Output directory prefix for exports and snapshots.
    #[arg(short = 'e', long = "export-prefix", default_value = "out")]
    export_prefix: String,

    /// Export the schedule as a trace (toggles the CSV jobs tracer).
    #[arg(long = "enable-schedule-tracing")]
    enable_schedule_tracing: bool,

    /// Allow the scheduler to register jobs and profiles at runtime.
    #[arg(long = "enable-dynamic-jobs")]
    enable_dynamic_jobs: bool,

    /// Acknowledge dynamic registrations with JOB_SUBMITTED events.
    #[arg(long = "ack-dynamic-jobs")]
    ack_dynamic_jobs: bool,

    /// Keep profiles of deleted jobs so dynamic jobs can reuse them.
    #[arg(long = "enable-profile-reuse")]
    enable_profile_reuse: bool,

    /// Forward profile descriptions inside JOB_SUBMITTED events.
    #[arg(long = "forward-profiles-on-submission")]
    forward_profiles_on_submission: bool,

    /// Allow several jobs to share a compute machine.
    #[arg(long = "enable-compute-sharing")]
    enable_compute_sharing: bool,

    /// Forbid several jobs to share a storage machine.
    #[arg(long = "disable-storage-sharing")]
    disable_storage_sharing: bool,

    /// Seed of the simulation-wide random generator.
    #[arg(long = "simulation-seed", default_value_t = 42)]
    simulation_seed: u64,
}

fn build_config(args: &Args) -> Result<SimulationConfig, i32> {
    let mut config = SimulationConfig {
        platform_file: args.platform.clone(),
        socket_endpoint: args.socket_endpoint.clone(),
        master_host_name: args.master_host.clone(),
        limit_machines_count: (args.mmax > 0).then_some(args.mmax),
        limit_machines_count_by_workload: args.mmax_workload,
        allow_compute_sharing: args.enable_compute_sharing,
        allow_storage_sharing: !args.disable_storage_sharing,
        forward_profiles_on_submission: args.forward_profiles_on_submission,
        dynamic_registration: DynamicRegistrationConfig {
            enabled: args.enable_dynamic_jobs,
            ack: args.ack_dynamic_jobs,
            profile_reuse: args.enable_profile_reuse,
        },
        failures: FailureConfig {
            mtbf: args.mtbf,
            smtbf: args.smtbf,
            fixed_failures: args.fixed_failures,
            repair_time: args.repair_time,
            mttr: args.mttr,
            seed_failures: args.seed_failures,
        },
        checkpointing: CheckpointingConfig {
            enabled: args.checkpointing_on,
            compute_interval: args.compute_checkpointing,
            compute_error: args.compute_checkpointing_error,
            global_interval: args.checkpointing_interval,
        },
        start_from_checkpoint: args.start_from_checkpoint,
        performance_factor: args.performance_factor,
        export_prefix: args.export_prefix.clone(),
        enable_schedule_tracing: args.enable_schedule_tracing,
        ..SimulationConfig::default()
    };

    for (name, filename) in args.workloads.iter().enumerate() {
        config.workloads.push(WorkloadDescription {
            filename: filename.clone(),
            name: format!("w{}", name),
        });
    }

    let bad_option = |e: &dyn std::fmt::Display| {
        error!("{}", e);
        EXIT_BAD_OPTION
    };
    if let Some(copy) = &args.copy {
        config.copy = Some(CopyOptions::parse(copy).map_err(|e| bad_option(&e))?);
    }
    if let Some(before) = &args.submission_time_before {
        config.submission_time_before =
            Some(SubmissionTimes::parse(before).map_err(|e| bad_option(&e))?);
    }
    if let Some(after) = &args.submission_time_after {
        config.submission_time_after =
            Some(SubmissionTimes::parse(after).map_err(|e| bad_option(&e))?);
    }
    if let Some(interval) = &args.checkpoint_batsim_interval {
        config.batsim_checkpoint = Some(
            BatsimCheckpointConfig::parse(interval, args.checkpoint_batsim_keep)
                .map_err(|e| bad_option(&e))?,
        );
    }
    Ok(config)
}

/// Reads `batsim_variables.chkpt` of snapshot `n` and rebases the pending
/// call-me-laters onto the restarted clock.
fn read_restored_call_me_laters(
    export_prefix: &str,
    n: u32,
) -> Result<Vec<RestoredCallMeLater>, String> {
    let path = CheckpointManager::snapshot_dir(export_prefix, n).join("batsim_variables.chkpt");
    let content = fs::read_to_string(&path).map_err(|e| format!("{}: {}", path.display(), e))?;
    let doc: serde_json::Value =
        serde_json::from_str(&content).map_err(|e| format!("{}: {}", path.display(), e))?;
    let snapshot_now = doc.get("now").and_then(serde_json::Value::as_f64).unwrap_or(0.0);
    let timers = doc
        .get("call_me_laters")
        .and_then(serde_json::Value::as_array)
        .map(|timers| {
            timers
                .iter()
                // Internal timers (failure injection, periodic snapshots)
                // are re-armed from the configuration, not restored.
                .filter(|t| {
                    t.get("from_scheduler")
                        .and_then(serde_json::Value::as_bool)
                        .unwrap_or(true)
                })
                .filter_map(|t| {
                    Some(RestoredCallMeLater {
                        delay: (t.get("target_time")?.as_f64()? - snapshot_now).max(0.0),
                        id: t.get("id")?.as_i64()?,
                        for_what: t.get("forWhat")?.as_i64()? as u8,
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    Ok(timers)
}

fn validate_inputs(args: &Args) -> i32 {
    let mut code = 0;
    if fs::metadata(&args.platform).is_err() {
        error!("cannot read platform file '{}'", args.platform);
        code |= EXIT_BAD_PLATFORM;
    }
    if args.workloads.is_empty() && args.start_from_checkpoint.is_none() {
        error!("no workload given");
        code |= EXIT_BAD_WORKLOAD;
    }
    for workload in &args.workloads {
        if fs::metadata(workload).is_err() {
            error!("cannot read workload file '{}'", workload);
            code |= EXIT_BAD_WORKLOAD;
        }
    }
    for workflow in &args.workflows {
        if fs::metadata(workflow).is_err() {
            error!("cannot read workflow file '{}'", workflow);
            code |= EXIT_BAD_WORKFLOW;
        }
    }
    code
}

fn load_workloads(config: &SimulationConfig) -> Result<(Workloads, u32), i32> {
    let mut workloads = Workloads::new();
    let mut max_nb_res = 0;

    if let Some(n) = config.start_from_checkpoint {
        let dir = CheckpointManager::snapshot_dir(&config.export_prefix, n);
        let file = dir.join("workload.json");
        let content = fs::read_to_string(&file).map_err(|e| {
            error!("cannot read checkpointed workload '{}': {}", file.display(), e);
            EXIT_BAD_WORKLOAD
        })?;
        let mut workload =
            Workload::new_static("w0", &file.to_string_lossy(), config, 1.0);
        let nb_res = workload.load_from_json_chkpt(&content).map_err(|e| {
            error!("{}", e);
            EXIT_BAD_WORKLOAD
        })?;
        max_nb_res = nb_res;
        workloads.insert_workload(workload).map_err(|e| {
            error!("{}", e);
            EXIT_BAD_WORKLOAD
        })?;
        return Ok((workloads, max_nb_res));
    }

    for description in &config.workloads {
        let content = fs::read_to_string(&description.filename).map_err(|e| {
            error!("cannot read workload '{}': {}", description.filename, e);
            EXIT_BAD_WORKLOAD
        })?;
        let mut workload =
            Workload::new_static(&description.name, &description.filename, config, 1.0);
        let nb_res = workload
            .load_from_json(
                &content,
                config.copy.as_ref(),
                config.submission_time_before.as_ref(),
                config.submission_time_after.as_ref(),
            )
            .map_err(|e| {
                error!("{}", e);
                EXIT_BAD_WORKLOAD
            })?;
        max_nb_res = max_nb_res.max(nb_res);
        workloads.insert_workload(workload).map_err(|e| {
            error!("{}", e);
            EXIT_BAD_WORKLOAD
        })?;
    }
    Ok((workloads, max_nb_res))
}

fn run(args: Args) -> i32 {
    if !args.workflows.is_empty() {
        warn!("workflows are not simulated by this build; files are only checked");
    }
    if !args.events.is_empty() {
        warn!("external event lists are not simulated by this build");
    }

    let code = validate_inputs(&args);
    if code != 0 {
        return code;
    }
    let mut config = match build_config(&args) {
        Ok(config) => config,
        Err(code) => return code,
    };
    if let Some(n) = config.start_from_checkpoint {
        match read_restored_call_me_laters(&config.export_prefix, n) {
            Ok(timers) => config.restored_call_me_laters = timers,
            Err(e) => {
                error!("cannot restore call-me-laters: {}", e);
                return EXIT_BAD_WORKLOAD;
            }
        }
    }
    let config = Rc::new(config);

    let (workloads, max_nb_res) = match load_workloads(&config) {
        Ok(loaded) => loaded,
        Err(code) => return code,
    };

    let platform_doc: serde_json::Value = match fs::read_to_string(&config.platform_file)
        .map_err(|e| e.to_string())
        .and_then(|content| serde_json::from_str(&content).map_err(|e| e.to_string()))
    {
        Ok(doc) => doc,
        Err(e) => {
            error!("invalid platform file '{}': {}", config.platform_file, e);
            return EXIT_BAD_PLATFORM;
        }
    };
    let mut limit = config.limit_machines_count;
    if config.limit_machines_count_by_workload {
        limit = Some(limit.map_or(max_nb_res, |l| l.min(max_nb_res)));
    }
    let machines = match Machines::from_platform_json(
        &config.platform_file,
        &platform_doc,
        &config.master_host_name,
        limit,
    ) {
        Ok(machines) => machines,
        Err(e) => {
            error!("{}", e);
            return EXIT_BAD_PLATFORM;
        }
    };

    let client = match ZmqSchedulerClient::connect(&config.socket_endpoint) {
        Ok(client) => Box::new(client),
        Err(e) => {
            error!("cannot reach the scheduler at {}: {}", config.socket_endpoint, e);
            return 1;
        }
    };

    let keep = config.batsim_checkpoint.as_ref().map(|c| c.keep).unwrap_or(1);
    let checkpoint = CheckpointManager::new(&config.export_prefix, keep);

    let config_json = json!({
        "allow_compute_sharing": config.allow_compute_sharing,
        "allow_storage_sharing": config.allow_storage_sharing,
        "dynamic-jobs-enabled": config.dynamic_registration.enabled,
        "dynamic-jobs-acknowledged": config.dynamic_registration.ack,
        "profile-reuse-enabled": config.dynamic_registration.profile_reuse,
        "forward-profiles-on-submission": config.forward_profiles_on_submission,
        "checkpointing-on": config.checkpointing.enabled,
        "compute-checkpointing": config.checkpointing.compute_interval,
        "MTBF": config.failures.mtbf,
        "SMTBF": config.failures.smtbf,
        "fixed-failures": config.failures.fixed_failures,
        "repair-time": config.failures.repair_time,
        "performance-factor": config.performance_factor,
        "start-from-checkpoint": config.start_from_checkpoint,
    });

    let sim = Simulation::new(args.simulation_seed);
    let mut batsim = BatsimSimulation::new(
        sim,
        config,
        config_json,
        workloads,
        machines,
        client,
        checkpoint,
    );
    match batsim.run() {
        Ok(()) => 0,
        Err(e) => {
            error!("{}", e);
            1
        }
    }
}

fn main() {
    Builder::from_default_env()
        .format(|buf, record| writeln!(buf, "{}", record.args()))
        .init();
    let args = Args::parse();
    std::process::exit(run(args));
}
