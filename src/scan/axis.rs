//! Per-axis calibration and the software closed-loop position controller.
//!
//! The controller is deliberately simple: pure proportional feedback with a
//! hard iteration cap and a voltage clamp. There is no integral or
//! derivative term and no oscillation detection, so an overly large gain
//! stops at the cap with whatever reading resulted. What happens then is a
//! policy choice, see [`UnconvergedPolicy`].

use crate::error::{AptResult, ScanError};
use crate::instrument::{Kpz101, Ksg101};
use crate::protocol::{AxisMode, MAX_COUNTS};
use crate::scan::Axis;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Conversion between gauge counts and physical micrometers.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct AxisCalibration {
    /// Gauge counts per micrometer of travel.
    pub counts_per_um: f64,
}

impl Default for AxisCalibration {
    fn default() -> Self {
        // Full scale of the gauge over a 20 um stage.
        Self {
            counts_per_um: MAX_COUNTS as f64 / 20.0,
        }
    }
}

impl AxisCalibration {
    pub fn um_to_counts(&self, um: f64) -> f64 {
        um * self.counts_per_um
    }

    pub fn counts_to_um(&self, counts: f64) -> f64 {
        counts / self.counts_per_um
    }
}

/// What to do when a move hits the iteration cap outside tolerance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnconvergedPolicy {
    /// Return the last reading as if the move had finished.
    #[default]
    ReturnLast,
    /// Fail the move, aborting any enclosing scan.
    Error,
}

/// Tuning of the proportional convergence loop.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergenceParameters {
    /// Proportional gain in volts per count of error.
    pub gain: f64,
    /// Convergence band around the target.
    pub tolerance_um: f64,
    /// Wait between correction steps.
    #[serde(with = "humantime_serde")]
    pub settle_delay: Duration,
    /// Hard cap on correction steps per move.
    pub max_iterations: u32,
    pub on_unconverged: UnconvergedPolicy,
}

impl Default for ConvergenceParameters {
    fn default() -> Self {
        Self {
            gain: 0.002,
            tolerance_um: 0.5,
            settle_delay: Duration::from_millis(10),
            max_iterations: 200,
            on_unconverged: UnconvergedPolicy::ReturnLast,
        }
    }
}

impl ConvergenceParameters {
    pub fn validate(&self) -> AptResult<()> {
        if !(self.gain.is_finite() && self.gain > 0.0) {
            return Err(ScanError::Plan(format!(
                "convergence gain must be positive, got {}",
                self.gain
            )));
        }
        if self.tolerance_um < 0.0 {
            return Err(ScanError::Plan(format!(
                "tolerance must not be negative, got {}",
                self.tolerance_um
            )));
        }
        if self.max_iterations < 1 {
            return Err(ScanError::Plan("max_iterations must be at least 1".into()));
        }
        Ok(())
    }
}

/// One stage axis under software closed-loop control.
///
/// Owns the actuator and sensor for its axis. The actuator must be in
/// open-loop mode: the loop here commands voltages directly and closes the
/// loop through the gauge, rather than delegating to the instrument
/// firmware.
pub struct ClosedLoopAxis {
    axis: Axis,
    actuator: Kpz101,
    sensor: Ksg101,
    calibration: AxisCalibration,
    last_voltage: f64,
}

impl ClosedLoopAxis {
    pub fn new(
        axis: Axis,
        actuator: Kpz101,
        sensor: Ksg101,
        calibration: AxisCalibration,
    ) -> AptResult<Self> {
        if actuator.mode() != AxisMode::OpenLoop {
            return Err(ScanError::InvalidMode {
                required: AxisMode::OpenLoop,
                actual: actuator.mode(),
            });
        }
        Ok(Self {
            axis,
            actuator,
            sensor,
            calibration,
            last_voltage: 0.0,
        })
    }

    pub fn axis(&self) -> Axis {
        self.axis
    }

    /// Voltage left on the actuator by the most recent move.
    pub fn last_voltage(&self) -> f64 {
        self.last_voltage
    }

    pub async fn enable_output(&mut self) -> AptResult<()> {
        self.actuator.enable_output().await
    }

    pub async fn disable_output(&mut self) -> AptResult<()> {
        self.actuator.disable_output().await
    }

    pub async fn zero_sensor(&mut self) -> AptResult<()> {
        self.sensor.zero().await
    }

    /// Converge to `target_um` and return the final gauge reading.
    ///
    /// Starts from zero volts, then repeats read, compare, correct until the
    /// error is within tolerance or `max_iterations` steps have run. Each
    /// commanded voltage is the previous one plus `gain * error`, clamped to
    /// the actuator's configured voltage limit. The observer sees every
    /// `(reading, iteration)` pair plus one final observation after the loop.
    ///
    /// A transport failure aborts the move immediately; there is no retry.
    pub async fn move_to(
        &mut self,
        target_um: f64,
        params: &ConvergenceParameters,
        observer: &mut (dyn FnMut(i16, u32) + Send),
    ) -> AptResult<i16> {
        let target_counts = self.calibration.um_to_counts(target_um);
        let tolerance_counts = self.calibration.um_to_counts(params.tolerance_um);
        let limit = self.actuator.voltage_limit().volts();

        let mut voltage = 0.0;
        self.actuator.set_output_voltage(voltage).await?;

        let mut iteration = 0u32;
        let mut converged = false;
        while iteration < params.max_iterations {
            let reading = self.sensor.read().await?;
            observer(reading, iteration);

            let error = target_counts - reading as f64;
            if error.abs() < tolerance_counts {
                converged = true;
                break;
            }

            voltage = (voltage + params.gain * error).clamp(0.0, limit);
            self.actuator.set_output_voltage(voltage).await?;
            tokio::time::sleep(params.settle_delay).await;
            iteration += 1;
        }

        let reading = self.sensor.read().await?;
        observer(reading, iteration);
        self.last_voltage = voltage;

        if converged {
            debug!(
                "[{}] converged to {:.3} um in {} iterations, reading {}",
                self.axis, target_um, iteration, reading
            );
        } else {
            warn!(
                "[{}] unconverged after {} iterations, reading {} (target {:.0} counts)",
                self.axis, iteration, reading, target_counts
            );
            if params.on_unconverged == UnconvergedPolicy::Error {
                return Err(ScanError::Unconverged {
                    iterations: iteration,
                    reading,
                });
            }
        }
        Ok(reading)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::VoltageLimit;
    use crate::transport::{MockTransport, PiezoPlant};

    fn plant_axis(
        counts_per_unit: f64,
        limit: VoltageLimit,
    ) -> (ClosedLoopAxis, std::sync::Arc<std::sync::Mutex<PiezoPlant>>) {
        let plant = PiezoPlant::shared(counts_per_unit);
        let kpz = Kpz101::new(
            "kpz_test",
            Box::new(MockTransport::actuator(std::sync::Arc::clone(&plant))),
            AxisMode::OpenLoop,
            limit,
            None,
        );
        let ksg = Ksg101::new(
            "ksg_test",
            Box::new(MockTransport::gauge(std::sync::Arc::clone(&plant))),
        );
        (
            ClosedLoopAxis::new(Axis::X, kpz, ksg, AxisCalibration::default()).unwrap(),
            plant,
        )
    }

    async fn connect(axis: &mut ClosedLoopAxis) {
        axis.actuator.connect().await.unwrap();
    }

    fn fast_params() -> ConvergenceParameters {
        ConvergenceParameters {
            settle_delay: Duration::from_millis(0),
            ..ConvergenceParameters::default()
        }
    }

    #[tokio::test]
    async fn test_converges_within_tolerance() {
        let (mut axis, _plant) = plant_axis(1.0, VoltageLimit::V75);
        connect(&mut axis).await;

        let params = fast_params();
        let reading = axis.move_to(5.0, &params, &mut |_, _| {}).await.unwrap();

        let target = AxisCalibration::default().um_to_counts(5.0);
        let tolerance = AxisCalibration::default().um_to_counts(params.tolerance_um);
        assert!((reading as f64 - target).abs() < tolerance);
    }

    #[tokio::test]
    async fn test_sensor_reads_bounded_by_iteration_cap() {
        let (mut axis, plant) = plant_axis(1.0, VoltageLimit::V75);
        connect(&mut axis).await;

        // Zero gain never moves the stage, so the loop must run to the cap.
        let params = ConvergenceParameters {
            gain: f64::MIN_POSITIVE,
            tolerance_um: 0.1,
            max_iterations: 25,
            ..fast_params()
        };
        axis.move_to(10.0, &params, &mut |_, _| {}).await.unwrap();

        assert_eq!(plant.lock().unwrap().gauge_reads, 26);
    }

    #[tokio::test]
    async fn test_observer_sees_final_observation() {
        let (mut axis, _plant) = plant_axis(1.0, VoltageLimit::V75);
        connect(&mut axis).await;

        let mut observations = Vec::new();
        let mut observer = |reading: i16, iteration: u32| observations.push((reading, iteration));
        axis.move_to(2.0, &fast_params(), &mut observer)
            .await
            .unwrap();

        assert!(observations.len() >= 2);
        // The final observation repeats the iteration count of loop exit.
        let (_, last_iteration) = observations[observations.len() - 1];
        let (_, prev_iteration) = observations[observations.len() - 2];
        assert_eq!(last_iteration, prev_iteration);
    }

    #[tokio::test]
    async fn test_oversized_gain_stops_at_cap() {
        let (mut axis, plant) = plant_axis(1.0, VoltageLimit::V75);
        connect(&mut axis).await;

        // An effective loop gain above 2 oscillates instead of converging.
        let params = ConvergenceParameters {
            gain: 0.05,
            tolerance_um: 0.01,
            max_iterations: 30,
            ..fast_params()
        };
        let result = axis.move_to(5.0, &params, &mut |_, _| {}).await;

        assert!(result.is_ok());
        assert_eq!(plant.lock().unwrap().gauge_reads, 31);
    }

    #[tokio::test]
    async fn test_unconverged_policy_error() {
        let (mut axis, _plant) = plant_axis(1.0, VoltageLimit::V75);
        connect(&mut axis).await;

        let params = ConvergenceParameters {
            gain: 0.05,
            tolerance_um: 0.01,
            max_iterations: 30,
            on_unconverged: UnconvergedPolicy::Error,
            ..fast_params()
        };
        let err = axis.move_to(5.0, &params, &mut |_, _| {}).await.unwrap_err();
        assert!(matches!(
            err,
            ScanError::Unconverged { iterations: 30, .. }
        ));
    }

    #[tokio::test]
    async fn test_requires_open_loop_actuator() {
        let kpz = Kpz101::new(
            "kpz_test",
            Box::new(MockTransport::new()),
            AxisMode::ClosedLoop,
            VoltageLimit::V75,
            Some(crate::protocol::FeedbackSource::Chan1),
        );
        let ksg = Ksg101::new("ksg_test", Box::new(MockTransport::new()));
        let result = ClosedLoopAxis::new(Axis::X, kpz, ksg, AxisCalibration::default());
        assert!(matches!(result, Err(ScanError::InvalidMode { .. })));
    }

    #[test]
    fn test_convergence_parameter_validation() {
        let mut params = ConvergenceParameters::default();
        assert!(params.validate().is_ok());
        params.gain = 0.0;
        assert!(params.validate().is_err());
        params.gain = 0.002;
        params.max_iterations = 0;
        assert!(params.validate().is_err());
    }
}
