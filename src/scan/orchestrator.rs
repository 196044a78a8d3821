//! The raster scan worker.
//!
//! Drives the Y axis across rows and the X axis across columns, capturing a
//! measurement per grid cell. Pause and stop are consulted only at row and
//! column boundaries: a request issued mid-convergence takes effect after
//! the current axis motion finishes, so a hardware write is never cut off
//! mid-flight. Worst-case stop latency is one axis convergence.

use crate::error::AptResult;
use crate::measure::MeasurementSource;
use crate::scan::{
    Axis, ClosedLoopAxis, MeasurementRecord, RunMode, ScanEvent, ScanHandle, ScanOutcome,
    ScanPlan, RECORD_SCHEMA,
};
use crate::scan::control::ControlChannel;
use crate::storage::RecordSink;
use log::{debug, info, warn};
use std::time::Duration;
use tokio::sync::mpsc;

/// Poll interval while paused.
const PAUSE_POLL: Duration = Duration::from_millis(100);

#[derive(PartialEq, Eq)]
enum Checkpoint {
    Continue,
    Stop,
}

/// Owns both axes, the measurement source and the result sink for one scan.
pub struct ScanOrchestrator {
    plan: ScanPlan,
    x: ClosedLoopAxis,
    y: ClosedLoopAxis,
    source: Box<dyn MeasurementSource>,
    sink: Box<dyn RecordSink>,
    state: RunMode,
}

impl ScanOrchestrator {
    pub fn new(
        plan: ScanPlan,
        x: ClosedLoopAxis,
        y: ClosedLoopAxis,
        source: Box<dyn MeasurementSource>,
        sink: Box<dyn RecordSink>,
    ) -> AptResult<Self> {
        plan.validate()?;
        Ok(Self {
            plan,
            x,
            y,
            source,
            sink,
            state: RunMode::Idle,
        })
    }

    /// Spawn the scan worker and hand back its control and event channels.
    pub fn start(self) -> ScanHandle {
        let control = ControlChannel::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.run(control.clone(), events_tx));
        ScanHandle::new(control, events_rx, task)
    }

    async fn run(
        mut self,
        control: ControlChannel,
        events: mpsc::UnboundedSender<ScanEvent>,
    ) -> AptResult<ScanOutcome> {
        let result = self.execute(&control, &events).await;

        // Teardown runs on every exit path. Output disables are best-effort,
        // the sink close happens exactly once.
        if let Err(e) = self.x.disable_output().await {
            warn!("failed to disable x output during teardown: {e}");
        }
        if let Err(e) = self.y.disable_output().await {
            warn!("failed to disable y output during teardown: {e}");
        }
        if let Err(e) = self.sink.close().await {
            warn!("failed to close result sink: {e}");
        }

        let outcome = result?;
        let _ = events.send(ScanEvent::Finished(outcome));
        info!("scan finished: {outcome:?}");
        Ok(outcome)
    }

    async fn execute(
        &mut self,
        control: &ControlChannel,
        events: &mpsc::UnboundedSender<ScanEvent>,
    ) -> AptResult<ScanOutcome> {
        let (nx, ny) = (self.plan.nx(), self.plan.ny());
        info!("starting scan: {nx} x {ny} grid");
        self.set_state(RunMode::Running);

        self.x.enable_output().await?;
        self.y.enable_output().await?;
        self.x.zero_sensor().await?;
        self.y.zero_sensor().await?;
        self.sink.open(&RECORD_SCHEMA).await?;

        for row in 0..ny {
            if self.checkpoint(control).await == Checkpoint::Stop {
                return Ok(self.abort());
            }

            let target_y = self.plan.target_y_um(row);
            self.move_axis(Axis::Y, target_y, events).await?;
            tokio::time::sleep(self.plan.settle_time).await;

            for col in 0..nx {
                if self.checkpoint(control).await == Checkpoint::Stop {
                    return Ok(self.abort());
                }

                let target_x = self.plan.target_x_um(col);
                self.move_axis(Axis::X, target_x, events).await?;
                tokio::time::sleep(self.plan.settle_time).await;

                let value = self.source.acquire().await?;
                let record = MeasurementRecord {
                    col: col as u32,
                    row: row as u32,
                    target_x_um: target_x,
                    target_y_um: target_y,
                    value,
                };
                self.sink.append(&record).await?;
                debug!(
                    "[{col}, {row}] x={target_x:.2} um y={target_y:.2} um value={value:.3}"
                );
                let _ = events.send(ScanEvent::CellMeasured(record));
            }
        }

        self.set_state(RunMode::Completed);
        Ok(ScanOutcome::Completed)
    }

    async fn move_axis(
        &mut self,
        axis: Axis,
        target_um: f64,
        events: &mpsc::UnboundedSender<ScanEvent>,
    ) -> AptResult<()> {
        let tx = events.clone();
        let mut observer = move |reading: i16, iteration: u32| {
            let _ = tx.send(ScanEvent::Convergence {
                axis,
                reading,
                iteration,
            });
        };
        let controller = match axis {
            Axis::X => &mut self.x,
            Axis::Y => &mut self.y,
        };
        controller
            .move_to(target_um, &self.plan.convergence, &mut observer)
            .await?;
        Ok(())
    }

    /// Consult the control flags. Holds here while paused, re-checking stop
    /// on each wake, without touching the axes.
    async fn checkpoint(&mut self, control: &ControlChannel) -> Checkpoint {
        if control.is_stop_requested() {
            return Checkpoint::Stop;
        }
        if control.is_paused() {
            self.set_state(RunMode::Paused);
            while control.is_paused() && !control.is_stop_requested() {
                tokio::time::sleep(PAUSE_POLL).await;
            }
            if control.is_stop_requested() {
                return Checkpoint::Stop;
            }
            self.set_state(RunMode::Running);
        }
        Checkpoint::Continue
    }

    fn abort(&mut self) -> ScanOutcome {
        self.set_state(RunMode::Stopping);
        ScanOutcome::Aborted
    }

    fn set_state(&mut self, state: RunMode) {
        if self.state != state {
            info!("scan state: {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }
}
