//! Simulation core of a batch-scheduling evaluation platform.
//!
//! Drives a discrete-event simulation of a parallel computing cluster on
//! the dslab simulation framework: a fixed set of machines executes a
//! workload of jobs whose placement, ordering, preemption and reservation
//! are decided by an external scheduler over a JSON request/reply socket.
//! Synthetic node failures and checkpoint/restart behavior can be injected
//! to study fault-tolerant scheduling policies.

pub mod batsim_checkpoint;
pub mod config;
pub mod events;
pub mod executor;
pub mod failures;
pub mod interval_set;
pub mod jobs;
pub mod jobs_execution;
pub mod machines;
pub mod profiles;
pub mod protocol;
pub mod server;
pub mod simulation;
pub mod storage;
pub mod submitter;
pub mod workload;

pub use interval_set::IntervalSet;
pub use jobs::{Job, JobIdentifier, JobState};
pub use machines::{Machine, MachineState, Machines};
pub use profiles::{Profile, ProfileStore};
pub use protocol::{JsonProtocolWriter, SchedulerClient};
pub use simulation::BatsimSimulation;
pub use workload::{Workload, Workloads};
