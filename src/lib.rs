//! On-host debug server bridging GDB's Remote Serial Protocol to 8-bit
//! AVR targets behind EDBG-based (CMSIS-DAP) debug probes.
//!
//! The pipeline has one-way ownership: the RSP front-end talks to the
//! [`controller::TargetControllerService`], whose controller thread
//! owns the [`target::avr8::Avr8`] façade, which drives the
//! [`probe::edbg::EdbgAvr8Interface`] protocol engine over a
//! [`probe::WireTransport`]. State changes flow back through the
//! [`controller::EventBus`].

pub mod config;
pub mod controller;
pub mod error;
pub mod gdb_server;
pub mod probe;
pub mod target;

pub use config::ProjectConfig;
pub use controller::{TargetController, TargetControllerService};
pub use error::Error;
pub use gdb_server::GdbServer;
