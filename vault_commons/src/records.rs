use crate::{VaultError, VaultResult};
use std::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, PartialOrd)]
pub enum RecordPoint {
    Arrival,         // Inputs validated, run starts
    RoutineLocated,  // Routine signature matched
    RecordLocated,   // Request record address resolved
    RecordBuilt,     // Record writes computed
    InvocationStart, // Sandbox run starts
    InvocationEnd,   // Sandbox run halted
    SecretExtracted, // Result read back
}

const RECORD_POINTS: usize = 7;

/// Timestamps for the phases of one extraction run.
pub struct Recorder {
    start_time: Instant,
    timestamps: [Option<Instant>; RECORD_POINTS],
    last_point: Option<RecordPoint>,
}

impl Recorder {
    pub fn new() -> Recorder {
        Recorder {
            start_time: Instant::now(),
            timestamps: [None; RECORD_POINTS],
            last_point: None,
        }
    }

    pub fn record(&mut self, current_point: RecordPoint) -> VaultResult<()> {
        if let Some(last) = self.last_point {
            if current_point <= last {
                return Err(VaultError::RecordSequencingFailure(last, current_point));
            }
        }
        self.timestamps[current_point as usize] = Some(Instant::now());
        self.last_point = Some(current_point);
        Ok(())
    }

    pub fn get_summary(&self) -> String {
        let mut summary = String::new();
        let mut previous = self.start_time;
        for (index, timestamp) in self.timestamps.iter().enumerate() {
            if let Some(timestamp) = timestamp {
                let since_start = timestamp.duration_since(self.start_time).as_micros();
                let step = timestamp.duration_since(previous).as_micros();
                summary.push_str(&format!(
                    "{:?}: +{}us ({}us total)\n",
                    POINT_ORDER[index], step, since_start
                ));
                previous = *timestamp;
            }
        }
        summary
    }
}

const POINT_ORDER: [RecordPoint; RECORD_POINTS] = [
    RecordPoint::Arrival,
    RecordPoint::RoutineLocated,
    RecordPoint::RecordLocated,
    RecordPoint::RecordBuilt,
    RecordPoint::InvocationStart,
    RecordPoint::InvocationEnd,
    RecordPoint::SecretExtracted,
];

#[test]
fn phases_in_order() {
    let mut recorder = Recorder::new();
    recorder.record(RecordPoint::Arrival).expect("first point");
    recorder
        .record(RecordPoint::RecordLocated)
        .expect("skipping a point is allowed");
    assert_eq!(
        Err(VaultError::RecordSequencingFailure(
            RecordPoint::RecordLocated,
            RecordPoint::RoutineLocated
        )),
        recorder.record(RecordPoint::RoutineLocated)
    );
    let summary = recorder.get_summary();
    assert!(summary.contains("Arrival"));
    assert!(summary.contains("RecordLocated"));
    assert!(!summary.contains("RoutineLocated"));
}
