/// Task-level tracing for driver activity.
///
/// Lifecycle hooks emit structured `tracing` events and accumulate run
/// counters under a unique simulation id. A counter snapshot serializes to
/// JSON; writes are atomic (write to .tmp then rename) so a concurrent
/// reader never observes a torn file.
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

pub const TRACE_PATH: &str = "/tmp/gcnsim_trace.json";

/// Serializable view of one simulation run's activity.
#[derive(Serialize, Deserialize, Default, Clone, Debug)]
pub struct TraceSnapshot {
    pub simulation_id: String,
    /// Commands admitted from command queues
    pub commands_started: u64,
    /// Commands whose outstanding requests all completed
    pub commands_completed: u64,
    /// Launch requests handed to the GPU port
    pub reqs_initiated: u64,
    /// Launch responses matched back to their request
    pub reqs_finalized: u64,
    /// Page-migration requests fully serviced
    pub migrations_completed: u64,
    /// Individual pages copied between devices
    pub pages_migrated: u64,
}

/// Accumulates the snapshot and narrates driver activity.
pub struct SimulationTrace {
    snapshot: TraceSnapshot,
}

impl SimulationTrace {
    pub fn new() -> Self {
        SimulationTrace {
            snapshot: TraceSnapshot {
                simulation_id: Uuid::new_v4().to_string(),
                ..Default::default()
            },
        }
    }

    pub fn simulation_id(&self) -> &str {
        &self.snapshot.simulation_id
    }

    pub fn simulation_start(&self) {
        info!(simulation = %self.snapshot.simulation_id, "simulation started");
    }

    pub fn simulation_end(&self) {
        info!(simulation = %self.snapshot.simulation_id, "simulation terminated");
    }

    pub fn command_start(&mut self, id: u64, kind: &str) {
        self.snapshot.commands_started += 1;
        debug!(command = id, kind, "command started");
    }

    pub fn command_complete(&mut self, id: u64) {
        self.snapshot.commands_completed += 1;
        debug!(command = id, "command completed");
    }

    pub fn req_initiate(&mut self, cmd_id: u64, req_id: u64) {
        self.snapshot.reqs_initiated += 1;
        debug!(command = cmd_id, req = req_id, "request initiated");
    }

    pub fn req_finalize(&mut self, cmd_id: u64, req_id: u64) {
        self.snapshot.reqs_finalized += 1;
        debug!(command = cmd_id, req = req_id, "request finalized");
    }

    pub fn page_migrated(&mut self, v_addr: u64) {
        self.snapshot.pages_migrated += 1;
        debug!(v_addr, "page copy completed");
    }

    pub fn migration_complete(&mut self) {
        self.snapshot.migrations_completed += 1;
        debug!("page migration completed");
    }

    pub fn snapshot(&self) -> TraceSnapshot {
        self.snapshot.clone()
    }
}

impl Default for SimulationTrace {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// I/O helpers
// ---------------------------------------------------------------------------

/// Atomically write a snapshot. Uses a .tmp intermediate file + rename to
/// avoid torn reads.
pub fn write_snapshot(snapshot: &TraceSnapshot, path: &str) {
    if let Ok(json) = serde_json::to_string_pretty(snapshot) {
        let tmp = format!("{path}.tmp");
        if std::fs::write(&tmp, &json).is_ok() {
            let _ = std::fs::rename(&tmp, path);
        }
    }
}

/// Read back a snapshot. Returns None if the file doesn't exist or can't
/// be parsed.
pub fn read_snapshot(path: &str) -> Option<TraceSnapshot> {
    let data = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&data).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let mut trace = SimulationTrace::new();
        trace.command_start(1, "Noop");
        trace.command_start(2, "LaunchKernel");
        trace.req_initiate(2, 3);
        trace.req_finalize(2, 3);
        trace.command_complete(2);

        let snap = trace.snapshot();
        assert_eq!(snap.commands_started, 2);
        assert_eq!(snap.commands_completed, 1);
        assert_eq!(snap.reqs_initiated, 1);
        assert_eq!(snap.reqs_finalized, 1);
    }

    #[test]
    fn snapshots_round_trip_through_disk() {
        let mut trace = SimulationTrace::new();
        trace.page_migrated(0x1000);
        trace.migration_complete();

        let path = format!("/tmp/gcnsim_trace_test_{}.json", std::process::id());
        write_snapshot(&trace.snapshot(), &path);
        let back = read_snapshot(&path).unwrap();
        assert_eq!(back.simulation_id, trace.simulation_id());
        assert_eq!(back.pages_migrated, 1);
        assert_eq!(back.migrations_completed, 1);
        let _ = std::fs::remove_file(&path);
    }
}
