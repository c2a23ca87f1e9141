//! Bridges a fan accessory (On, RotationSpeed, RotationDirection) to an
//! HTTP-controlled fan device.
//!
//! [`accessory::FanAccessory`] owns the cached characteristics, polls the
//! device's `/status` route and turns sets into device requests.
//! [`listener::Listener`] accepts pushes from the device, and [`api`] exposes
//! everything to a local host.

pub mod accessory;
pub mod api;
pub mod characteristic;
pub mod client;
pub mod config;
pub mod error;
pub mod listener;
#[cfg(test)]
mod test_support;
