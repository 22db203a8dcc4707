//! Batsim-level checkpoint snapshots: directory rotation, snapshot
//! content, and the save-then-restore path.

use std::rc::Rc;

use serde_json::{json, Value};

use dslab_batsim::batsim_checkpoint::CheckpointManager;
use dslab_batsim::config::sim_config::SimulationConfig;
use dslab_batsim::events::TimerPurpose;
use dslab_batsim::jobs::JobState;
use dslab_batsim::machines::Machines;
use dslab_batsim::server::ArmedTimer;
use dslab_batsim::workload::{Workload, Workloads};

fn platform(nb_hosts: usize) -> Machines {
    let hosts: Vec<Value> = (0..nb_hosts)
        .map(|i| json!({"name": format!("host{}", i), "speed": 1e9}))
        .collect();
    Machines::from_platform_json("platform.json", &json!({"hosts": hosts}), "master_host", None)
        .unwrap()
}

fn workloads_with_one_live_job(config: &Rc<SimulationConfig>) -> Workloads {
    let doc = json!({
        "nb_res": 4,
        "jobs": [
            {"id": "1", "subtime": 0.0, "res": 2, "walltime": 10.0, "profile": "d",
             "color": "blue"},
            {"id": "2", "subtime": 1.0, "res": 1, "profile": "d"}
        ],
        "profiles": {"d": {"type": "delay", "delay": 10.0}}
    });
    let mut workload = Workload::new_static("w0", "test.json", config, 1.0);
    workload
        .load_from_json(&doc.to_string(), None, None, None)
        .unwrap();
    // Job 2 already finished; only job 1 is live.
    let id2 = dslab_batsim::jobs::JobIdentifier::from_string("w0!2").unwrap();
    workload.jobs.get_mut(&id2).unwrap().state = JobState::CompletedSuccessfully;
    let mut workloads = Workloads::new();
    workloads.insert_workload(workload).unwrap();
    workloads
}

fn timers() -> Vec<ArmedTimer> {
    vec![ArmedTimer {
        target_time: 25.5,
        id: 2,
        purpose: TimerPurpose::Smtbf,
        from_scheduler: false,
    }]
}

#[test]
fn rotation_keeps_the_n_most_recent_snapshots() {
    let out = tempfile::tempdir().unwrap();
    let prefix = out.path().to_string_lossy().into_owned();
    let config = Rc::new(SimulationConfig::default());
    let workloads = workloads_with_one_live_job(&config);
    let machines = platform(4);

    let mut manager = CheckpointManager::new(&prefix, 3);
    for _ in 0..3 {
        manager
            .snapshot(&workloads, &machines, &timers(), 5.0, 1)
            .unwrap();
    }
    for i in 1..=3 {
        assert!(out.path().join(format!("checkpoint_{}", i)).is_dir());
    }

    // A fourth snapshot discards the oldest and rewrites checkpoint_1.
    manager
        .snapshot(&workloads, &machines, &timers(), 6.0, 1)
        .unwrap();
    for i in 1..=3 {
        assert!(out.path().join(format!("checkpoint_{}", i)).is_dir());
    }
    assert!(!out.path().join("checkpoint_4").exists());

    let latest = out.path().join("checkpoint_latest");
    let target = std::fs::read_link(&latest).unwrap();
    assert_eq!(target.to_string_lossy(), "checkpoint_1");

    let doc: Value = serde_json::from_str(
        &std::fs::read_to_string(out.path().join("checkpoint_1/workload.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(doc["nb_checkpoint"], json!(4));
}

#[test]
fn snapshot_records_live_jobs_counters_and_timers() {
    let out = tempfile::tempdir().unwrap();
    let prefix = out.path().to_string_lossy().into_owned();
    let config = Rc::new(SimulationConfig::default());
    let workloads = workloads_with_one_live_job(&config);
    let machines = platform(4);

    let mut manager = CheckpointManager::new(&prefix, 1);
    let dir = manager
        .snapshot(&workloads, &machines, &timers(), 5.0, 1)
        .unwrap();

    let doc: Value =
        serde_json::from_str(&std::fs::read_to_string(dir.join("workload.json")).unwrap()).unwrap();
    assert_eq!(doc["nb_res"], json!(4));
    assert_eq!(doc["nb_original_jobs"], json!(2));
    assert_eq!(doc["nb_actually_completed"], json!(1));

    // Completed jobs are not written out; the live job carries its full
    // runtime attribute set.
    let jobs = doc["jobs"].as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    let job = &jobs[0];
    assert_eq!(job["id"], json!("w0!1"));
    for field in [
        "state",
        "progress",
        "allocation",
        "runtime",
        "metadata",
        "batsim_metadata",
        "jitter",
        "original_start",
        "original_submit",
        "progressTimeCpu",
        "submission_times",
    ] {
        assert!(job.get(field).is_some(), "missing runtime field {}", field);
    }
    // Fields the simulator does not know are carried through untouched.
    assert_eq!(job["color"], json!("blue"));

    let variables: Value = serde_json::from_str(
        &std::fs::read_to_string(dir.join("batsim_variables.chkpt")).unwrap(),
    )
    .unwrap();
    assert_eq!(variables["now"], json!(5.0));
    assert_eq!(variables["call_me_laters"][0]["id"], json!(2));
    assert_eq!(variables["call_me_laters"][0]["forWhat"], json!(1));
}

#[test]
fn snapshot_can_be_loaded_back() {
    let out = tempfile::tempdir().unwrap();
    let prefix = out.path().to_string_lossy().into_owned();
    let config = Rc::new(SimulationConfig::default());
    let workloads = workloads_with_one_live_job(&config);
    let machines = platform(4);

    let mut manager = CheckpointManager::new(&prefix, 1);
    let dir = manager
        .snapshot(&workloads, &machines, &timers(), 5.0, 1)
        .unwrap();

    let content = std::fs::read_to_string(dir.join("workload.json")).unwrap();
    let mut restored = Workload::new_static("w0", "restored.json", &config, 1.0);
    let nb_res = restored.load_from_json_chkpt(&content).unwrap();
    assert_eq!(nb_res, 4);
    assert_eq!(restored.nb_original_jobs, 2);
    assert_eq!(restored.nb_actually_completed, 1);
    assert_eq!(restored.jobs.nb_jobs(), 1);

    // Restored jobs are tagged with the checkpoint counter.
    let id = dslab_batsim::jobs::JobIdentifier::from_string("w0!1$1").unwrap();
    let job = restored.jobs.get(&id).expect("restored job is renamed to $1");
    assert_eq!(job.walltime, 10.0);
}
