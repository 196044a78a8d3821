//! The raster scan core: plan, records, events and the orchestrator.
//!
//! # Data Flow
//!
//! ```text
//! ScanOrchestrator (worker task)
//!   ├── ClosedLoopAxis (Y) ── Kpz101 / Ksg101 ── transport
//!   ├── ClosedLoopAxis (X) ── Kpz101 / Ksg101 ── transport
//!   ├── MeasurementSource
//!   ├── RecordSink (flushed per record)
//!   └── ScanEvent ──▶ unbounded channel ──▶ controlling context
//!              ControlChannel ◀── pause / resume / stop
//! ```
//!
//! The worker owns all hardware for the duration of a scan; the control
//! channel is the only shared state and the event channel never blocks the
//! worker.

pub mod axis;
pub mod control;
pub mod orchestrator;

pub use axis::{AxisCalibration, ClosedLoopAxis, ConvergenceParameters, UnconvergedPolicy};
pub use control::ControlChannel;
pub use orchestrator::ScanOrchestrator;

use crate::error::{AptResult, ScanError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Header row written to the result sink before any record.
pub const RECORD_SCHEMA: [&str; 5] = ["col", "row", "targetX_um", "targetY_um", "value"];

/// One of the two stage axes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::X => write!(f, "x"),
            Axis::Y => write!(f, "y"),
        }
    }
}

/// Geometry and timing of a raster scan.
///
/// The grid has `nx() * ny()` cells at `step` spacing, covering
/// `[0, length]` on each axis inclusively.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanPlan {
    pub length_x_um: f64,
    pub length_y_um: f64,
    pub step_x_um: f64,
    pub step_y_um: f64,
    /// Wait after each axis move before measuring.
    #[serde(with = "humantime_serde")]
    pub settle_time: Duration,
    pub convergence: ConvergenceParameters,
}

impl Default for ScanPlan {
    fn default() -> Self {
        Self {
            length_x_um: 10.0,
            length_y_um: 5.0,
            step_x_um: 0.2,
            step_y_um: 0.1,
            settle_time: Duration::from_millis(500),
            convergence: ConvergenceParameters::default(),
        }
    }
}

impl ScanPlan {
    /// Number of columns, always at least 1.
    pub fn nx(&self) -> usize {
        (self.length_x_um / self.step_x_um).floor() as usize + 1
    }

    /// Number of rows, always at least 1.
    pub fn ny(&self) -> usize {
        (self.length_y_um / self.step_y_um).floor() as usize + 1
    }

    pub fn target_x_um(&self, col: usize) -> f64 {
        col as f64 * self.step_x_um
    }

    pub fn target_y_um(&self, row: usize) -> f64 {
        row as f64 * self.step_y_um
    }

    pub fn validate(&self) -> AptResult<()> {
        if !(self.step_x_um.is_finite() && self.step_x_um > 0.0)
            || !(self.step_y_um.is_finite() && self.step_y_um > 0.0)
        {
            return Err(ScanError::Plan(format!(
                "step sizes must be positive, got {} x {}",
                self.step_x_um, self.step_y_um
            )));
        }
        if self.length_x_um < 0.0 || self.length_y_um < 0.0 {
            return Err(ScanError::Plan(format!(
                "scan lengths must not be negative, got {} x {}",
                self.length_x_um, self.length_y_um
            )));
        }
        self.convergence.validate()
    }
}

/// One completed grid cell, in row-major scan order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    pub col: u32,
    pub row: u32,
    pub target_x_um: f64,
    pub target_y_um: f64,
    pub value: f64,
}

/// How a scan run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Every grid cell was visited.
    Completed,
    /// A stop request took effect at a checkpoint.
    Aborted,
}

/// Worker lifecycle state, reported through the log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunMode {
    Idle,
    Running,
    Paused,
    Stopping,
    Completed,
}

/// Progress notifications from the scan worker.
///
/// Convergence events are progress telemetry; `CellMeasured` events carry
/// the same records the sink persists and are never dropped.
#[derive(Clone, Debug)]
pub enum ScanEvent {
    Convergence {
        axis: Axis,
        reading: i16,
        iteration: u32,
    },
    CellMeasured(MeasurementRecord),
    Finished(ScanOutcome),
}

/// Handle onto a running scan.
pub struct ScanHandle {
    /// Control side of the worker's pause/stop flags.
    pub control: ControlChannel,
    /// Ordered event stream; closes when the worker exits.
    pub events: mpsc::UnboundedReceiver<ScanEvent>,
    task: JoinHandle<AptResult<ScanOutcome>>,
}

impl ScanHandle {
    pub(crate) fn new(
        control: ControlChannel,
        events: mpsc::UnboundedReceiver<ScanEvent>,
        task: JoinHandle<AptResult<ScanOutcome>>,
    ) -> Self {
        Self {
            control,
            events,
            task,
        }
    }

    /// Wait for the worker to finish and return how the scan ended.
    pub async fn join(self) -> AptResult<ScanOutcome> {
        self.task
            .await
            .map_err(|e| ScanError::Worker(e.to_string()))?
    }
}
