use serde::Serialize;
use serde_json::Value;

/// Why a call-me-later timer was armed. The numeric values travel on the
/// wire in REQUESTED_CALL / CALL_ME_LATER messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerPurpose {
    FixedFailure,
    Smtbf,
    Mtbf,
    RepairDone,
    ReservationStart,
    CheckpointBatsim,
    CheckpointScheduler,
    Recover,
}

impl TimerPurpose {
    pub fn from_u8(value: u8) -> Option<TimerPurpose> {
        Some(match value {
            0 => TimerPurpose::FixedFailure,
            1 => TimerPurpose::Smtbf,
            2 => TimerPurpose::Mtbf,
            3 => TimerPurpose::RepairDone,
            4 => TimerPurpose::ReservationStart,
            5 => TimerPurpose::CheckpointBatsim,
            6 => TimerPurpose::CheckpointScheduler,
            7 => TimerPurpose::Recover,
            _ => return None,
        })
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            TimerPurpose::FixedFailure => 0,
            TimerPurpose::Smtbf => 1,
            TimerPurpose::Mtbf => 2,
            TimerPurpose::RepairDone => 3,
            TimerPurpose::ReservationStart => 4,
            TimerPurpose::CheckpointBatsim => 5,
            TimerPurpose::CheckpointScheduler => 6,
            TimerPurpose::Recover => 7,
        }
    }
}

/// Why a job is being killed; travels as `forWhat` in KILL_JOB/JOB_KILLED.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KillReason {
    None,
    FixedFailures,
    Smtbf,
    Mtbf,
    Reservation,
}

impl KillReason {
    pub fn from_u8(value: u8) -> KillReason {
        match value {
            1 => KillReason::FixedFailures,
            2 => KillReason::Smtbf,
            3 => KillReason::Mtbf,
            4 => KillReason::Reservation,
            _ => KillReason::None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            KillReason::None => 0,
            KillReason::FixedFailures => 1,
            KillReason::Smtbf => 2,
            KillReason::Mtbf => 3,
            KillReason::Reservation => 4,
        }
    }

    /// Whether this kill comes from the failure injector, which makes the
    /// job eligible for resubmission.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            KillReason::FixedFailures | KillReason::Smtbf | KillReason::Mtbf
        )
    }
}

/// Kicks the server into its initial SIMULATION_BEGINS round trip.
#[derive(Clone, Serialize)]
pub struct SimulationStart {}

/// Self-event marking that every inbound event at the current instant has
/// been queued, so the server can flush one message to the scheduler.
#[derive(Clone, Serialize)]
pub struct FlushReady {}

/// A job has reached its submission time.
#[derive(Clone, Serialize)]
pub struct JobSubmittedEvent {
    pub job_id: String,
}

/// The static submitter has emitted its whole workload.
#[derive(Clone, Serialize)]
pub struct SubmitterDone {}

/// A job execution actor finished (successfully or not); the job record
/// already carries the terminal state.
#[derive(Clone, Serialize)]
pub struct JobCompletedEvent {
    pub job_id: String,
}

/// Tells the job executor component to spawn the actor for one execution.
#[derive(Clone, Serialize)]
pub struct ScheduleJobExecution {
    pub execution_id: u64,
}

/// Keyed signal consumed by the targeted job actor. If the actor finished
/// in the same instant, the executor component acks it instead.
#[derive(Clone, Serialize)]
pub struct KillJobSignal {
    pub execution_id: u64,
    pub job_id: String,
    pub group: u64,
    pub for_what: u8,
}

/// A job actor acknowledges its kill, carrying the progress snapshot.
#[derive(Clone, Serialize)]
pub struct KillAckEvent {
    pub group: u64,
    pub job_id: String,
    pub for_what: u8,
    pub progress: Option<Value>,
    pub progress_value: f64,
}

/// A call-me-later reached its target time.
#[derive(Clone, Serialize)]
pub struct TimerFired {
    pub id: i64,
    pub purpose: u8,
    /// Scheduler-armed timers produce an outbound REQUESTED_CALL on fire;
    /// internal ones do not.
    pub from_scheduler: bool,
}
