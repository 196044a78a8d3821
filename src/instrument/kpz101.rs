//! Thorlabs KPZ101 Piezo Controller Driver
//!
//! The KPZ101 drives a piezo stack with up to 150 V. Depending on the
//! position control mode it accepts either a direct output voltage
//! (open-loop) or a position setpoint that the instrument firmware servos
//! to (closed-loop, requires a feedback input). Commands are validated
//! against the mode and the configured limits before any frame is written,
//! so a rejected command never leaves the device in a partial state.
//!
//! # Example Usage
//!
//! ```no_run
//! use apt_scan::instrument::Kpz101;
//! use apt_scan::protocol::{AxisMode, VoltageLimit};
//! use apt_scan::transport::SerialTransport;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let transport = SerialTransport::open("/dev/ttyUSB0", 115200)?;
//!     let mut kpz = Kpz101::new(
//!         "kpz_x",
//!         Box::new(transport),
//!         AxisMode::OpenLoop,
//!         VoltageLimit::V75,
//!         None,
//!     );
//!     kpz.connect().await?;
//!     kpz.enable_output().await?;
//!     kpz.set_output_voltage(12.5).await?;
//!     kpz.disable_output().await?;
//!     Ok(())
//! }
//! ```

use crate::error::{AptResult, ScanError};
use crate::protocol::{self, AxisMode, FeedbackSource, VoltageLimit};
use crate::transport::AptTransport;
use log::{debug, info, warn};

pub struct Kpz101 {
    name: String,
    transport: Box<dyn AptTransport>,
    mode: AxisMode,
    voltage_limit: VoltageLimit,
    feedback: Option<FeedbackSource>,
    connected: bool,
}

impl Kpz101 {
    /// Create a driver instance. No frames are written until [`connect`].
    ///
    /// `feedback` selects the input servoed in closed-loop mode; open-loop
    /// units ignore it and their I/O settings encode the external input.
    ///
    /// [`connect`]: Kpz101::connect
    pub fn new(
        name: impl Into<String>,
        transport: Box<dyn AptTransport>,
        mode: AxisMode,
        voltage_limit: VoltageLimit,
        feedback: Option<FeedbackSource>,
    ) -> Self {
        Self {
            name: name.into(),
            transport,
            mode,
            voltage_limit,
            feedback: match mode {
                AxisMode::ClosedLoop => feedback,
                AxisMode::OpenLoop => None,
            },
            connected: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> AxisMode {
        self.mode
    }

    pub fn voltage_limit(&self) -> VoltageLimit {
        self.voltage_limit
    }

    /// One-time setup: output off, then I/O settings, then mode select.
    /// Voltage and position commands are rejected until this has run.
    pub async fn connect(&mut self) -> AptResult<()> {
        self.disable_output().await?;

        let io = protocol::io_settings_payload(self.voltage_limit, self.feedback);
        self.transport
            .write_with_data(protocol::PZ_SET_TPZ_IOSETTINGS, &io)
            .await?;

        self.transport
            .write(protocol::PZ_SET_POSCONTROLMODE, self.mode.wire_code())
            .await?;

        self.connected = true;
        info!(
            "[{}] configured: {} mode, {} V limit",
            self.name,
            self.mode,
            self.voltage_limit.volts()
        );
        Ok(())
    }

    /// Switch on the high-voltage output stage.
    pub async fn enable_output(&mut self) -> AptResult<()> {
        self.require_connected()?;
        warn!("[{}] enabling high-voltage output", self.name);
        self.transport
            .write(protocol::MOD_SET_CHANENABLESTATE, protocol::CHAN_ENABLE)
            .await
    }

    /// Switch off the high-voltage output stage.
    ///
    /// Safe to call at any point, including before [`connect`] and on
    /// teardown paths where the device state is unknown.
    ///
    /// [`connect`]: Kpz101::connect
    pub async fn disable_output(&mut self) -> AptResult<()> {
        self.transport
            .write(protocol::MOD_SET_CHANENABLESTATE, protocol::CHAN_DISABLE)
            .await
    }

    /// Command an output voltage in volts. Open-loop mode only.
    pub async fn set_output_voltage(&mut self, volts: f64) -> AptResult<()> {
        self.require_connected()?;
        self.require_mode(AxisMode::OpenLoop)?;

        let limit = self.voltage_limit.volts();
        if !(0.0..=limit).contains(&volts) {
            return Err(ScanError::OutOfRange {
                what: "voltage",
                value: volts,
                limit,
            });
        }

        let device_value = protocol::volts_to_device_units(volts, self.voltage_limit);
        debug!(
            "[{}] output voltage {:.3} V ({} device units)",
            self.name, volts, device_value
        );
        self.transport
            .write_with_data(
                protocol::PZ_SET_OUTPUTVOLTS,
                &protocol::voltage_payload(device_value),
            )
            .await
    }

    /// Command a position setpoint in counts. Closed-loop mode only.
    pub async fn set_position(&mut self, counts: i32) -> AptResult<()> {
        self.require_connected()?;
        self.require_mode(AxisMode::ClosedLoop)?;

        if !(0..=protocol::MAX_COUNTS).contains(&counts) {
            return Err(ScanError::OutOfRange {
                what: "position",
                value: counts as f64,
                limit: protocol::MAX_COUNTS as f64,
            });
        }

        debug!("[{}] position setpoint {} counts", self.name, counts);
        self.transport
            .write_with_data(
                protocol::PZ_SET_OUTPUTPOS,
                &protocol::position_payload(counts as i16),
            )
            .await
    }

    /// Blink the front panel LED.
    pub async fn identify(&mut self) -> AptResult<()> {
        self.transport.write(protocol::MOD_IDENTIFY, 0x00).await
    }

    fn require_connected(&self) -> AptResult<()> {
        if self.connected {
            Ok(())
        } else {
            Err(ScanError::NotConnected)
        }
    }

    fn require_mode(&self, required: AxisMode) -> AptResult<()> {
        if self.mode == required {
            Ok(())
        } else {
            Err(ScanError::InvalidMode {
                required,
                actual: self.mode,
            })
        }
    }
}
