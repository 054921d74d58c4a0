//! Simulator-to-simulator link
//!
//! Each simulator process listens on the abstract socket
//! `modem_simulator<host_port>`. A connection opens with a 4-byte token:
//! `REM<N>` hands the socket to modem `N` as a REMOTE client, `STOP` asks the
//! process to save state and exit. Calls and messages then travel as
//! ordinary AT lines (`AT+REMOTECALL=...`, `AT+REMOTESMS=...`).

use std::io::{self, Read};
use std::ops::RangeInclusive;
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixStream};

/// Host ports that identify peer simulators by phone number suffix
pub const PEER_PORT_RANGE: RangeInclusive<u16> = 6520..=6619;

pub const TOKEN_LEN: usize = 4;
pub const STOP_TOKEN: &[u8; TOKEN_LEN] = b"STOP";
pub const REMOTE_TOKEN_PREFIX: &[u8; 3] = b"REM";

/// Socket name of the parent monitor for `port`
pub fn monitor_socket_name(port: u16) -> String {
    format!("modem_simulator{}", port)
}

/// Opens a stream to the simulator listening on a given host port.
pub trait PeerConnector: Send + Sync {
    fn connect(&self, port: u16) -> io::Result<UnixStream>;
}

/// Connects through the abstract-namespace monitor socket
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalSocketConnector;

impl PeerConnector for LocalSocketConnector {
    fn connect(&self, port: u16) -> io::Result<UnixStream> {
        let addr = SocketAddr::from_abstract_name(monitor_socket_name(port))?;
        UnixStream::connect_addr(&addr)
    }
}

/// Token received on a freshly accepted monitor connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorToken {
    Stop,
    Remote(usize),
    Unknown(Vec<u8>),
}

impl MonitorToken {
    pub fn parse(token: &[u8]) -> Self {
        if token == STOP_TOKEN {
            return MonitorToken::Stop;
        }
        if token.len() == TOKEN_LEN && token.starts_with(REMOTE_TOKEN_PREFIX) {
            let digit = token[3];
            if digit.is_ascii_digit() {
                return MonitorToken::Remote(usize::from(digit - b'0'));
            }
        }
        MonitorToken::Unknown(token.to_vec())
    }

    /// Token a peer writes before its first command
    pub fn remote(modem_id: usize) -> String {
        format!("REM{}", modem_id)
    }
}

/// Read the leading token of a monitor connection
pub fn read_token<R: Read>(stream: &mut R) -> io::Result<MonitorToken> {
    let mut token = [0u8; TOKEN_LEN];
    stream.read_exact(&mut token)?;
    Ok(MonitorToken::parse(&token))
}

/// Peer host port encoded in the last four digits of `number`
pub fn peer_port_for_number(number: &str) -> Option<u16> {
    let digits = number.trim_end_matches(';');
    if digits.len() < 4 {
        return None;
    }
    let suffix = &digits[digits.len() - 4..];
    if !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let port: u16 = suffix.parse().ok()?;
    PEER_PORT_RANGE.contains(&port).then_some(port)
}

/// Peer port of `number`, unless it is our own
pub fn remote_port(number: &str, host_port: u16) -> Option<u16> {
    peer_port_for_number(number).filter(|port| *port != host_port)
}
