//! In-memory transport for tests and offline runs.
//!
//! [`MockTransport`] records every frame it is asked to send and serves
//! query responses either from a scripted queue or from a shared
//! [`PiezoPlant`], a first-order stand-in for a piezo stack and strain
//! gauge pair. Linking an actuator-role mock and a gauge-role mock to the
//! same plant closes the loop: voltage writes move the simulated stage and
//! gauge queries read it back.

use crate::error::{AptResult, ScanError};
use crate::protocol;
use crate::transport::AptTransport;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// A frame captured by a [`MockTransport`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WireCall {
    Short { id: u16, value: u16 },
    Data { id: u16, payload: Vec<u8> },
}

impl WireCall {
    /// Message id of the captured frame.
    pub fn id(&self) -> u16 {
        match self {
            WireCall::Short { id, .. } | WireCall::Data { id, .. } => *id,
        }
    }
}

/// Shared state of the simulated stage.
///
/// The model is a perfectly linear, instantly settling stack: the gauge
/// raw count is the commanded device value scaled by `counts_per_unit`.
/// Taring latches the current raw count as an offset, as the real gauge
/// does.
pub struct PiezoPlant {
    counts_per_unit: f64,
    device_value: f64,
    offset: f64,
    /// Number of gauge status queries served.
    pub gauge_reads: u32,
}

impl PiezoPlant {
    /// Create a plant behind the shared handle both mock roles need.
    pub fn shared(counts_per_unit: f64) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self {
            counts_per_unit,
            device_value: 0.0,
            offset: 0.0,
            gauge_reads: 0,
        }))
    }

    fn raw(&self) -> f64 {
        self.device_value * self.counts_per_unit
    }

    fn reading(&self) -> i16 {
        (self.raw() - self.offset).round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
    }
}

enum Role {
    Passive,
    Actuator(Arc<Mutex<PiezoPlant>>),
    Gauge(Arc<Mutex<PiezoPlant>>),
}

/// Transport double recording frames and answering queries.
pub struct MockTransport {
    calls: Arc<Mutex<Vec<WireCall>>>,
    responses: HashMap<u16, VecDeque<Vec<u8>>>,
    role: Role,
}

impl MockTransport {
    /// A passive mock: records writes, answers only scripted queries.
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            responses: HashMap::new(),
            role: Role::Passive,
        }
    }

    /// Mock for the piezo controller side of `plant`.
    pub fn actuator(plant: Arc<Mutex<PiezoPlant>>) -> Self {
        Self {
            role: Role::Actuator(plant),
            ..Self::new()
        }
    }

    /// Mock for the strain gauge side of `plant`.
    pub fn gauge(plant: Arc<Mutex<PiezoPlant>>) -> Self {
        Self {
            role: Role::Gauge(plant),
            ..Self::new()
        }
    }

    /// Queue a payload to be returned for the next query expecting `resp_id`.
    pub fn script_response(&mut self, resp_id: u16, payload: Vec<u8>) {
        self.responses.entry(resp_id).or_default().push_back(payload);
    }

    /// Snapshot of all frames sent so far.
    pub fn calls(&self) -> Vec<WireCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Handle onto the call log, usable after the mock moves into a driver.
    pub fn calls_handle(&self) -> Arc<Mutex<Vec<WireCall>>> {
        Arc::clone(&self.calls)
    }

    fn record(&self, call: WireCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    fn plant_response(&self, resp_id: u16) -> Option<Vec<u8>> {
        let Role::Gauge(plant) = &self.role else {
            return None;
        };
        let mut plant = plant.lock().ok()?;
        match resp_id {
            protocol::PZ_GET_PZSTATUSUPDATE => {
                plant.gauge_reads += 1;
                let mut payload = vec![0u8; 10];
                payload[..2].copy_from_slice(&protocol::CHAN_IDENT.to_le_bytes());
                payload[4..6].copy_from_slice(&plant.reading().to_le_bytes());
                Some(payload)
            }
            protocol::PZ_GET_MAXTRAVEL => {
                // 20 um of travel in 100 nm steps.
                let mut payload = vec![0u8; 4];
                payload[..2].copy_from_slice(&protocol::CHAN_IDENT.to_le_bytes());
                payload[2..4].copy_from_slice(&200u16.to_le_bytes());
                Some(payload)
            }
            _ => None,
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AptTransport for MockTransport {
    async fn write(&mut self, id: u16, value: u16) -> AptResult<()> {
        self.record(WireCall::Short { id, value });
        if let Role::Gauge(plant) = &self.role {
            if id == protocol::PZ_SET_ZERO {
                if let Ok(mut plant) = plant.lock() {
                    plant.offset = plant.raw();
                }
            }
        }
        Ok(())
    }

    async fn write_with_data(&mut self, id: u16, data: &[u8]) -> AptResult<()> {
        self.record(WireCall::Data {
            id,
            payload: data.to_vec(),
        });
        if let Role::Actuator(plant) = &self.role {
            if let Ok(mut plant) = plant.lock() {
                match id {
                    protocol::PZ_SET_OUTPUTVOLTS if data.len() >= 4 => {
                        plant.device_value =
                            u16::from_le_bytes([data[2], data[3]]) as f64;
                    }
                    protocol::PZ_SET_OUTPUTPOS if data.len() >= 4 => {
                        // Firmware closed loop: the stage lands on the
                        // commanded position directly.
                        let pos = i16::from_le_bytes([data[2], data[3]]) as f64;
                        plant.device_value = pos / plant.counts_per_unit;
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    async fn query(&mut self, req_id: u16, resp_id: u16) -> AptResult<Vec<u8>> {
        if let Some(queue) = self.responses.get_mut(&resp_id) {
            if let Some(payload) = queue.pop_front() {
                return Ok(payload);
            }
        }
        if let Some(payload) = self.plant_response(resp_id) {
            return Ok(payload);
        }
        Err(ScanError::Transport(format!(
            "no response scripted for query {req_id:#06x}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_plant_round_trip() {
        let plant = PiezoPlant::shared(2.0);
        let mut actuator = MockTransport::actuator(Arc::clone(&plant));
        let mut gauge = MockTransport::gauge(Arc::clone(&plant));

        actuator
            .write_with_data(protocol::PZ_SET_OUTPUTVOLTS, &protocol::voltage_payload(100))
            .await
            .unwrap();

        let payload = gauge
            .query(
                protocol::PZ_REQ_PZSTATUSUPDATE,
                protocol::PZ_GET_PZSTATUSUPDATE,
            )
            .await
            .unwrap();
        assert_eq!(protocol::status_position(&payload).unwrap(), 200);
    }

    #[tokio::test]
    async fn test_zero_tares_reading() {
        let plant = PiezoPlant::shared(1.0);
        let mut actuator = MockTransport::actuator(Arc::clone(&plant));
        let mut gauge = MockTransport::gauge(Arc::clone(&plant));

        actuator
            .write_with_data(protocol::PZ_SET_OUTPUTVOLTS, &protocol::voltage_payload(500))
            .await
            .unwrap();
        gauge.write(protocol::PZ_SET_ZERO, 0x01).await.unwrap();

        let payload = gauge
            .query(
                protocol::PZ_REQ_PZSTATUSUPDATE,
                protocol::PZ_GET_PZSTATUSUPDATE,
            )
            .await
            .unwrap();
        assert_eq!(protocol::status_position(&payload).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unscripted_query_fails() {
        let mut mock = MockTransport::new();
        let err = mock.query(0x0650, 0x0651).await.unwrap_err();
        assert!(matches!(err, ScanError::Transport(_)));
    }
}
