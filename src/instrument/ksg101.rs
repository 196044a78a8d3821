//! Thorlabs KSG101 Strain Gauge Reader Driver
//!
//! The KSG101 reads the strain gauge bonded to a piezo stack and reports a
//! signed position count. Readings are relative to the last tare point set
//! with [`Ksg101::zero`].

use crate::error::AptResult;
use crate::protocol;
use crate::transport::AptTransport;
use log::{debug, info};

pub struct Ksg101 {
    name: String,
    transport: Box<dyn AptTransport>,
}

impl Ksg101 {
    pub fn new(name: impl Into<String>, transport: Box<dyn AptTransport>) -> Self {
        Self {
            name: name.into(),
            transport,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current raw position count, roughly -32768 to 32767 full scale.
    pub async fn read(&mut self) -> AptResult<i16> {
        let payload = self
            .transport
            .query(
                protocol::PZ_REQ_PZSTATUSUPDATE,
                protocol::PZ_GET_PZSTATUSUPDATE,
            )
            .await?;
        let position = protocol::status_position(&payload)?;
        debug!("[{}] reading {} counts", self.name, position);
        Ok(position)
    }

    /// Tare the gauge so subsequent readings are relative to the current
    /// position. The instrument needs a moment to run its zero routine.
    pub async fn zero(&mut self) -> AptResult<()> {
        info!("[{}] zeroing", self.name);
        self.transport
            .write(protocol::PZ_SET_ZERO, protocol::CHAN_IDENT)
            .await
    }

    /// Full mechanical travel of the attached stage in micrometers.
    pub async fn max_travel_um(&mut self) -> AptResult<f64> {
        let payload = self
            .transport
            .query(protocol::PZ_REQ_MAXTRAVEL, protocol::PZ_GET_MAXTRAVEL)
            .await?;
        // The instrument reports travel in 100 nm steps.
        Ok(protocol::max_travel(&payload)? as f64 / 10.0)
    }

    /// Blink the front panel LED.
    pub async fn identify(&mut self) -> AptResult<()> {
        self.transport.write(protocol::MOD_IDENTIFY, 0x00).await
    }
}
