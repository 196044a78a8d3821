//! Wire transports for APT devices.
//!
//! [`AptTransport`] is the seam between the instrument drivers and the
//! physical link. Drivers are written against the trait object, so the same
//! driver code runs over a real serial port or the in-memory mock used by
//! the test suite.

pub mod mock;
pub mod serial;

pub use mock::{MockTransport, PiezoPlant, WireCall};
pub use serial::SerialTransport;

use crate::error::AptResult;
use async_trait::async_trait;

/// Register-level write and query primitives over an APT link.
///
/// Writes either carry a 16-bit parameter word in the frame header or a
/// trailing payload. A query sends a request frame and returns the payload
/// of the matching response frame.
#[async_trait]
pub trait AptTransport: Send {
    /// Write a short frame: message id plus a 16-bit parameter word.
    async fn write(&mut self, id: u16, value: u16) -> AptResult<()>;

    /// Write a data frame: message id header followed by `data`.
    async fn write_with_data(&mut self, id: u16, data: &[u8]) -> AptResult<()>;

    /// Send the request frame `req_id` and return the payload of the
    /// `resp_id` response.
    async fn query(&mut self, req_id: u16, resp_id: u16) -> AptResult<Vec<u8>>;
}
