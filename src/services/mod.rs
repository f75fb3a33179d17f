//! Worker services reachable through the broker or directly: the device
//! driver boundary and the telemetry archive (spec §4.3, §4.4).

pub mod device_backend;
pub mod monitor;

pub use device_backend::{ChannelSample, DeviceBackend, DeviceDriver, FakeDriver, UnimplementedDriver};
pub use monitor::{Archive, Monitor, MonitorConfig, ParamRow, SqliteArchive, StatusRow};
