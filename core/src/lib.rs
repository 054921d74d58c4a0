//! Cellular modem simulator speaking AT commands over Unix sockets
//!
//! Each [`ModemSimulator`] answers a RIL connected to its listening socket and
//! can place calls and send messages to peer simulator processes identified
//! by host port.

pub mod channel;
pub mod config;
pub mod error;
pub mod icc;
pub mod looper;
pub mod modem;
pub mod nvram;
pub mod parser;
pub mod pdu;
pub mod peer;
pub mod services;

pub use channel::{ChannelMonitor, Client, ClientKind, Outgoing};
pub use config::{DeviceConfig, SimType, SimulatorConfig};
pub use error::{CmeError, CmsError, ModemError, Result};
pub use looper::Looper;
pub use modem::ModemSimulator;
pub use nvram::NvramStore;
pub use parser::CommandParser;
pub use pdu::SmsPdu;
pub use peer::{LocalSocketConnector, MonitorToken, PeerConnector};
