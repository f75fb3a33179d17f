//! The receipt transport layer: wire codec, request client, reply server.

pub mod client;
pub mod framing;
pub mod server;

pub use client::AsyncClient;
pub use framing::{Frame, FrameDecoder};
pub use server::{serve, Inbound, ReceiptDispatch, RouterServer};
