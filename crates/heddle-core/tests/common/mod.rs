#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use heddle_core::ports::{CheckpointObserver, FixedClock};
use heddle_core::{Orchestrator, OrchestratorBuilder};

pub fn fixed_clock() -> Arc<FixedClock> {
    Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
    ))
}

pub fn in_memory(clock: &Arc<FixedClock>) -> Orchestrator {
    OrchestratorBuilder::new()
        .clock(clock.clone())
        .build()
        .unwrap()
}

pub fn with_checkpoints(
    clock: &Arc<FixedClock>,
    checkpoints: Arc<dyn CheckpointObserver>,
) -> Orchestrator {
    OrchestratorBuilder::new()
        .clock(clock.clone())
        .checkpoints(checkpoints)
        .build()
        .unwrap()
}

pub fn on_file(path: &Path, clock: &Arc<FixedClock>) -> Orchestrator {
    OrchestratorBuilder::new()
        .database(path)
        .clock(clock.clone())
        .build()
        .unwrap()
}
