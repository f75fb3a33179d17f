//! Supervisor control plane for a high-voltage power-supply setup.
//!
//! See each module's docs for its slice of the system: [`transport`] is
//! the receipt wire protocol and its client/server halves, [`broker`] is
//! the router standing in for a ZeroMQ ROUTER pair, [`services`] holds
//! the device and monitor workers, [`interlock`] the external safety
//! signal, [`supervisor`] the script engine that ties them together, and
//! [`facade`] the narrow boundary an operator-facing HTTP layer would
//! call through.

pub mod broker;
pub mod config;
pub mod facade;
pub mod interlock;
pub mod receipt;
pub mod services;
pub mod supervisor;
pub mod transport;
