//! Couche de connectivité devices : transport, pool des connexions, accept loop.

pub mod connection;
pub mod listener;
pub mod registry;

pub use connection::{DeviceConnection, DeviceError, TelemetryFrame};
pub use listener::DeviceListener;
pub use registry::ConnectionRegistry;
