use rustc_hash::FxHashMap;

use crate::interval_set::IntervalSet;
use crate::jobs::JobIdentifier;

/// Everything the job executor needs to run one scheduled execution.
#[derive(Clone)]
pub struct ExecutionRequest {
    pub execution_id: u64,
    pub job_id: JobIdentifier,
    pub machine_ids: IntervalSet,
    /// Executor-to-allocation-index mapping from EXECUTE_JOB (empty means
    /// identity).
    pub mapping: Vec<u32>,
    /// Storage label to machine id resolution from EXECUTE_JOB.
    pub storage_mapping: FxHashMap<String, u32>,
    /// Name of the additional IO profile to merge before execution.
    pub io_profile: Option<String>,
}

/// Execution requests shared between the server (producer) and the job
/// executor component (consumer). Only the server thread mutates it.
#[derive(Default)]
pub struct SharedExecutionStorage {
    executions_info: FxHashMap<u64, ExecutionRequest>,
    next_execution_id: u64,
}

impl SharedExecutionStorage {
    pub fn new() -> SharedExecutionStorage {
        Self::default()
    }

    pub fn allocate_execution_id(&mut self) -> u64 {
        let id = self.next_execution_id;
        self.next_execution_id += 1;
        id
    }

    pub fn set_execution_request(&mut self, request: ExecutionRequest) {
        self.executions_info.insert(request.execution_id, request);
    }

    pub fn get_execution_request(&self, execution_id: u64) -> Option<&ExecutionRequest> {
        self.executions_info.get(&execution_id)
    }

    pub fn remove_execution_request(&mut self, execution_id: u64) {
        self.executions_info.remove(&execution_id);
    }

    pub fn executions_info_len(&self) -> usize {
        self.executions_info.len()
    }
}
