//! Drivers for the APT T-cube units making up one stage axis.
//!
//! Each axis pairs a [`Kpz101`] piezo controller (the actuator) with a
//! [`Ksg101`] strain gauge reader (the sensor). Drivers own their transport
//! as a boxed [`crate::transport::AptTransport`], so the same code drives a
//! serial port or the test mock.

pub mod kpz101;
pub mod ksg101;

pub use kpz101::Kpz101;
pub use ksg101::Ksg101;
