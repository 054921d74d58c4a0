//! Voice calls: local loopback calls, calls to peer simulators, and the
//! 3GPP TS 22.030 call-hold procedures

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::channel::Client;
use crate::error::CmeError;
use crate::looper::{safe_callback, Serial};
use crate::parser::CommandParser;
use crate::peer::{remote_port, MonitorToken};
use crate::services::network::RegState;
use crate::services::{
    strip_at, CommandHandler, Link, ModemContext, NetworkService, Service, SimService, NO_CARRIER,
    OK,
};

/// Time a local call spends dialing before it is answered
pub const LOCAL_ANSWER_DELAY: Duration = Duration::from_secs(1);
/// Time a peer call may stay unanswered
pub const PEER_DIAL_TIMEOUT: Duration = Duration::from_secs(60);

pub const MAX_DIAL_STRING_LEN: usize = 40;
pub const EMERGENCY_NUMBERS: [&str; 8] = ["112", "911", "999", "000", "08", "110", "118", "119"];

const TOA_INTERNATIONAL: i32 = 145;
const TOA_UNKNOWN: i32 = 129;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Active = 0,
    Held = 1,
    Dialing = 2,
    Alerting = 3,
    Incoming = 4,
    Waiting = 5,
    Hangup = 6,
}

impl CallState {
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => CallState::Active,
            1 => CallState::Held,
            2 => CallState::Dialing,
            3 => CallState::Alerting,
            4 => CallState::Incoming,
            5 => CallState::Waiting,
            6 => CallState::Hangup,
            _ => return None,
        })
    }

    pub fn code(self) -> i32 {
        self as i32
    }

    fn is_ringing(self) -> bool {
        matches!(self, CallState::Incoming | CallState::Waiting)
    }

    fn is_outgoing_setup(self) -> bool {
        matches!(self, CallState::Dialing | CallState::Alerting)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    MobileOriginated = 0,
    MobileTerminated = 1,
}

#[derive(Debug, Clone)]
pub struct CallRecord {
    pub state: CallState,
    pub direction: CallDirection,
    /// `<mode>` of `+CLCC`; 0 is voice
    pub mode: i32,
    pub multiparty: bool,
    pub number: String,
    pub international: bool,
    /// Connection to the simulator on the other end
    remote: Option<Arc<Client>>,
    /// Pending answer or dial-timeout event
    timeout: Option<Serial>,
}

impl CallRecord {
    fn new(state: CallState, direction: CallDirection, number: &str) -> Self {
        Self {
            state,
            direction,
            mode: 0,
            multiparty: false,
            number: number.trim_start_matches('+').to_string(),
            international: number.starts_with('+'),
            remote: None,
            timeout: None,
        }
    }

    fn clcc_line(&self, index: u32) -> String {
        format!(
            "+CLCC: {},{},{},{},{},\"{}{}\",{}",
            index,
            self.direction as i32,
            self.state.code(),
            self.mode,
            u8::from(self.multiparty),
            if self.international { "+" } else { "" },
            self.number,
            if self.international { TOA_INTERNATIONAL } else { TOA_UNKNOWN }
        )
    }

    fn is_bound_to(&self, client: &Client) -> bool {
        self.remote.as_ref().is_some_and(|r| r.id() == client.id())
    }
}

pub fn is_emergency_number(number: &str) -> bool {
    EMERGENCY_NUMBERS.contains(&number)
}

struct CallTable {
    calls: BTreeMap<u32, CallRecord>,
    mute: bool,
}

impl CallTable {
    /// Lowest index not in use
    fn free_index(&self) -> u32 {
        (1..).find(|i| !self.calls.contains_key(i)).unwrap_or(1)
    }

    fn indices_where(&self, pred: impl Fn(&CallRecord) -> bool) -> Vec<u32> {
        self.calls
            .iter()
            .filter(|(_, call)| pred(call))
            .map(|(index, _)| *index)
            .collect()
    }
}

pub struct CallService {
    ctx: Arc<ModemContext>,
    table: Mutex<CallTable>,
    sim: Link<SimService>,
    network: Link<NetworkService>,
}

impl Service for CallService {
    const NAME: &'static str = "call";

    fn handlers() -> &'static [CommandHandler<Self>] {
        const HANDLERS: &[CommandHandler<CallService>] = &[
            CommandHandler::prefix("D", CallService::handle_dial),
            CommandHandler::full("A", CallService::handle_answer),
            CommandHandler::full("H", CallService::handle_hangup),
            CommandHandler::full("+CLCC", CallService::handle_list_calls),
            CommandHandler::prefix("+CHLD=", CallService::handle_hold),
            CommandHandler::full("+CMUT?", CallService::handle_query_mute),
            CommandHandler::prefix("+CMUT=", CallService::handle_set_mute),
            CommandHandler::prefix("+VTS=", CallService::handle_dtmf),
            CommandHandler::full("+WSOS?", CallService::handle_query_emergency_mode),
            CommandHandler::prefix("+WSOS=", CallService::handle_set_emergency_mode),
            CommandHandler::prefix("+REMOTECALL=", CallService::handle_remote_call),
        ];
        HANDLERS
    }
}

impl CallService {
    pub fn new(ctx: Arc<ModemContext>) -> Self {
        Self {
            ctx,
            table: Mutex::new(CallTable {
                calls: BTreeMap::new(),
                mute: false,
            }),
            sim: Link::default(),
            network: Link::default(),
        }
    }

    pub fn setup_dependency(&self, sim: &Arc<SimService>, network: &Arc<NetworkService>) {
        self.sim.set(sim);
        self.network.set(network);
    }

    fn lock(&self) -> MutexGuard<'_, CallTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of calls in any state
    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    /// Tell the peer behind `call` about its new state
    fn notify_peer(&self, call: &CallRecord, state: CallState) {
        if let Some(remote) = &call.remote {
            remote.send_line(&format!(
                "AT+REMOTECALL={},{},{},\"{}\",{}",
                state.code(),
                call.mode,
                u8::from(call.multiparty),
                self.ctx.host_port(),
                TOA_UNKNOWN
            ));
        }
    }

    fn set_state(&self, call: &mut CallRecord, state: CallState) {
        if call.state == state {
            return;
        }
        call.state = state;
        self.notify_peer(call, state);
    }

    /// Remove a call, cancelling its timer and hanging up its peer
    fn release(&self, table: &mut CallTable, index: u32) {
        if let Some(call) = table.calls.remove(&index) {
            log::info!("call {} to {} released", index, call.number);
            if let Some(serial) = call.timeout {
                self.ctx.looper.cancel(serial);
            }
            self.notify_peer(&call, CallState::Hangup);
            if let Some(remote) = &call.remote {
                remote.close();
            }
        }
    }

    fn cancel_timeout(&self, call: &mut CallRecord) {
        if let Some(serial) = call.timeout.take() {
            self.ctx.looper.cancel(serial);
        }
    }

    fn handle_dial(self: &Arc<Self>, client: &Arc<Client>, command: &str) {
        let number = strip_at(command)[1..]
            .trim()
            .trim_end_matches(';')
            .trim_end_matches(['I', 'i'])
            .trim();
        if number.is_empty() {
            return client.send_line(&CmeError::IncorrectParameters.to_string());
        }
        if number.len() > MAX_DIAL_STRING_LEN {
            return client.send_line(&CmeError::DialStringTooLong.to_string());
        }

        let emergency = is_emergency_number(number);
        let voice = self
            .network
            .get()
            .map_or(RegState::Unregistered, |network| network.voice_state());
        match voice {
            RegState::Home | RegState::Roaming => {}
            RegState::Emergency if emergency => {}
            RegState::Emergency => {
                return client.send_line(&CmeError::EmergencyCallsOnly.to_string())
            }
            _ => return client.send_line(&CmeError::NoNetworkService.to_string()),
        }

        if !emergency {
            if let Some(sim) = self.sim.get() {
                if sim.is_fdn_enabled() && !sim.is_fdn_number(number) {
                    return client.send_line(&CmeError::FixedDialNumberOnly.to_string());
                }
            }
        }

        match remote_port(number, self.ctx.host_port()) {
            Some(port) => self.dial_peer(client, number, port),
            None => self.dial_local(client, number),
        }
    }

    fn dial_local(self: &Arc<Self>, client: &Arc<Client>, number: &str) {
        let mut table = self.lock();
        let index = table.free_index();
        let mut call = CallRecord::new(CallState::Dialing, CallDirection::MobileOriginated, number);
        call.timeout = Some(self.ctx.looper.post_with_delay(
            LOCAL_ANSWER_DELAY,
            safe_callback(self, |call: &Arc<CallService>| call.complete_local_dials()),
        ));
        table.calls.insert(index, call);
        drop(table);

        log::info!("call {} dialing {}", index, number);
        client.send_line(OK);
    }

    /// The far end of every local call picks up
    fn complete_local_dials(&self) {
        let mut table = self.lock();
        for (index, call) in table.calls.iter_mut() {
            if call.remote.is_none() && call.state.is_outgoing_setup() {
                log::info!("call {} answered", index);
                call.state = CallState::Active;
                call.timeout = None;
            }
        }
    }

    fn dial_peer(self: &Arc<Self>, client: &Arc<Client>, number: &str, port: u16) {
        let remote = self
            .ctx
            .config
            .connector
            .connect(port)
            .and_then(|stream| self.ctx.monitor.set_remote_client(stream, false));
        let remote = match remote {
            Ok(remote) => remote,
            Err(e) => {
                log::warn!("cannot reach peer simulator on port {}: {}", port, e);
                return client.send_line(NO_CARRIER);
            }
        };

        remote.send_raw(MonitorToken::remote(0));
        remote.send_line(&format!(
            "AT+REMOTECALL={},0,0,\"{}\",{}",
            CallState::Incoming.code(),
            self.ctx.host_port(),
            TOA_UNKNOWN
        ));

        let mut table = self.lock();
        let index = table.free_index();
        let mut call = CallRecord::new(CallState::Dialing, CallDirection::MobileOriginated, number);
        call.remote = Some(Arc::clone(&remote));
        call.timeout = Some(self.ctx.looper.post_with_delay(
            PEER_DIAL_TIMEOUT,
            safe_callback(self, move |call: &Arc<CallService>| call.on_dial_timeout(index, &remote)),
        ));
        table.calls.insert(index, call);
        drop(table);

        log::info!("call {} dialing peer {}", index, port);
        client.send_line(OK);
    }

    fn on_dial_timeout(&self, index: u32, remote: &Arc<Client>) {
        let mut table = self.lock();
        let unanswered = table
            .calls
            .get(&index)
            .is_some_and(|call| call.is_bound_to(remote) && call.state.is_outgoing_setup());
        if unanswered {
            log::info!("call {} not answered in {:?}", index, PEER_DIAL_TIMEOUT);
            if let Some(call) = table.calls.get_mut(&index) {
                call.timeout = None;
            }
            self.release(&mut table, index);
        }
    }

    fn handle_answer(self: &Arc<Self>, client: &Arc<Client>, _command: &str) {
        let mut table = self.lock();
        let ringing = table.indices_where(|call| call.state.is_ringing());
        if ringing.is_empty() {
            drop(table);
            return client.send_line(&CmeError::OperationNotAllowed.to_string());
        }

        for index in table.indices_where(|call| call.state == CallState::Active) {
            if let Some(call) = table.calls.get_mut(&index) {
                self.set_state(call, CallState::Held);
            }
        }
        for index in ringing {
            if let Some(call) = table.calls.get_mut(&index) {
                self.cancel_timeout(call);
                self.set_state(call, CallState::Active);
                log::info!("call {} answered", index);
            }
        }
        drop(table);
        client.send_line(OK);
    }

    fn handle_hangup(self: &Arc<Self>, client: &Arc<Client>, _command: &str) {
        let mut table = self.lock();
        let pending =
            table.indices_where(|call| call.state.is_ringing() || call.state.is_outgoing_setup());
        for index in pending {
            self.release(&mut table, index);
        }
        drop(table);
        client.send_line(OK);
    }

    fn handle_list_calls(self: &Arc<Self>, client: &Arc<Client>, _command: &str) {
        let lines: Vec<String> = self
            .lock()
            .calls
            .iter()
            .filter(|(_, call)| call.state != CallState::Hangup)
            .map(|(index, call)| call.clcc_line(*index))
            .collect();
        client.send_lines(lines.iter().map(String::as_str).chain([OK]));
    }

    /// `+CHLD=<n>[<idx>]`
    fn handle_hold(self: &Arc<Self>, client: &Arc<Client>, command: &str) {
        let mut cmd = CommandParser::new(command);
        cmd.skip_prefix();
        let arg = cmd.remaining().trim();
        let Some(operation) = arg.chars().next().and_then(|c| c.to_digit(10)) else {
            return client.send_line(&CmeError::IncorrectParameters.to_string());
        };
        let target = match &arg[1..] {
            "" => None,
            digits => match digits.parse::<u32>() {
                Ok(index) => Some(index),
                Err(_) => return client.send_line(&CmeError::IncorrectParameters.to_string()),
            },
        };

        let mut table = self.lock();
        if let Some(index) = target {
            if !table.calls.contains_key(&index) {
                drop(table);
                return client.send_line(&CmeError::InvalidIndex.to_string());
            }
        }

        let result = match (operation, target) {
            (0, None) => {
                let waiting = table.indices_where(|call| call.state == CallState::Waiting);
                let doomed = if waiting.is_empty() {
                    table.indices_where(|call| call.state == CallState::Held)
                } else {
                    waiting
                };
                for index in doomed {
                    self.release(&mut table, index);
                }
                Ok(())
            }
            (1, None) => {
                for index in table.indices_where(|call| call.state == CallState::Active) {
                    self.release(&mut table, index);
                }
                self.resume_waiting_or_held(&mut table);
                Ok(())
            }
            (1, Some(index)) => {
                self.release(&mut table, index);
                Ok(())
            }
            (2, None) => {
                let waiting = table.indices_where(|call| call.state == CallState::Waiting);
                let held = table.indices_where(|call| call.state == CallState::Held);
                for index in table.indices_where(|call| call.state == CallState::Active) {
                    if let Some(call) = table.calls.get_mut(&index) {
                        self.set_state(call, CallState::Held);
                    }
                }
                let resumed = if waiting.is_empty() { held } else { waiting };
                for index in resumed {
                    if let Some(call) = table.calls.get_mut(&index) {
                        self.cancel_timeout(call);
                        self.set_state(call, CallState::Active);
                    }
                }
                Ok(())
            }
            (2, Some(target)) => {
                let others = table.indices_where(|call| call.state == CallState::Active);
                for index in others.into_iter().filter(|i| *i != target) {
                    if let Some(call) = table.calls.get_mut(&index) {
                        self.set_state(call, CallState::Held);
                    }
                }
                if let Some(call) = table.calls.get_mut(&target) {
                    self.cancel_timeout(call);
                    self.set_state(call, CallState::Active);
                }
                Ok(())
            }
            (3 | 4, None) => {
                let joined = table.indices_where(|call| {
                    matches!(call.state, CallState::Active | CallState::Held)
                });
                let multiparty = joined.len() > 1;
                for index in joined {
                    if let Some(call) = table.calls.get_mut(&index) {
                        call.multiparty = multiparty;
                        self.set_state(call, CallState::Active);
                    }
                }
                Ok(())
            }
            _ => Err(CmeError::IncorrectParameters),
        };
        drop(table);

        match result {
            Ok(()) => client.send_line(OK),
            Err(e) => client.send_line(&e.to_string()),
        }
    }

    /// Accept the waiting call, or resume the held ones when none waits
    fn resume_waiting_or_held(&self, table: &mut CallTable) {
        let waiting = table.indices_where(|call| call.state == CallState::Waiting);
        let resumed = if waiting.is_empty() {
            table.indices_where(|call| call.state == CallState::Held)
        } else {
            waiting
        };
        for index in resumed {
            if let Some(call) = table.calls.get_mut(&index) {
                self.cancel_timeout(call);
                self.set_state(call, CallState::Active);
            }
        }
    }

    fn handle_query_mute(self: &Arc<Self>, client: &Arc<Client>, _command: &str) {
        let mute = self.lock().mute;
        client.send_lines([format!("+CMUT: {}", u8::from(mute)).as_str(), OK]);
    }

    fn handle_set_mute(self: &Arc<Self>, client: &Arc<Client>, command: &str) {
        let mut cmd = CommandParser::new(command);
        cmd.skip_prefix();
        match cmd.next_int() {
            n @ (0 | 1) => {
                self.lock().mute = n == 1;
                client.send_line(OK);
            }
            _ => client.send_line(&CmeError::IncorrectParameters.to_string()),
        }
    }

    fn handle_dtmf(self: &Arc<Self>, client: &Arc<Client>, _command: &str) {
        client.send_line(OK);
    }

    fn handle_query_emergency_mode(self: &Arc<Self>, client: &Arc<Client>, _command: &str) {
        let enabled = self.ctx.nvram.instance(self.ctx.instance_id()).emergency_mode;
        client.send_lines([format!("+WSOS: {}", u8::from(enabled)).as_str(), OK]);
    }

    fn handle_set_emergency_mode(self: &Arc<Self>, client: &Arc<Client>, command: &str) {
        let mut cmd = CommandParser::new(command);
        cmd.skip_prefix();
        let enabled = match cmd.next_int() {
            0 => false,
            1 => true,
            _ => return client.send_line(&CmeError::IncorrectParameters.to_string()),
        };
        self.ctx
            .nvram
            .update(self.ctx.instance_id(), |instance| instance.emergency_mode = enabled);
        if let Err(e) = self.ctx.nvram.save() {
            log::warn!("failed to persist emergency mode: {}", e);
        }
        client.send_line(OK);
    }

    /// `+REMOTECALL=<state>,<mode>,<mpty>,"<number>",<ton>` from a peer
    fn handle_remote_call(self: &Arc<Self>, client: &Arc<Client>, command: &str) {
        let mut cmd = CommandParser::new(command);
        cmd.skip_prefix();
        let state = cmd.next_int();
        let mode = cmd.next_int();
        cmd.skip_comma();
        let number = cmd.next_str().to_string();

        let Some(state) = CallState::from_code(state) else {
            log::warn!("ignoring REMOTECALL with state {}", state);
            return;
        };

        let mut table = self.lock();
        let existing = table
            .calls
            .iter()
            .find(|(_, call)| call.is_bound_to(client))
            .or_else(|| table.calls.iter().find(|(_, call)| call.number == number))
            .map(|(index, _)| *index);

        match (state, existing) {
            (CallState::Incoming, _) => {
                let radio_on = self.network.get().is_some_and(|n| n.is_radio_on());
                if !radio_on {
                    drop(table);
                    log::info!("radio off, refusing call from {}", number);
                    return client.close();
                }
                let state = if table.calls.is_empty() {
                    CallState::Incoming
                } else {
                    CallState::Waiting
                };
                let index = table.free_index();
                let mut call = CallRecord::new(state, CallDirection::MobileTerminated, &number);
                call.mode = mode.max(0);
                call.remote = Some(Arc::clone(client));
                table.calls.insert(index, call);
                log::info!("call {} from peer {} ({:?})", index, number, state);
            }
            (CallState::Active | CallState::Held | CallState::Alerting, Some(index)) => {
                if let Some(call) = table.calls.get_mut(&index) {
                    if state != CallState::Alerting {
                        self.cancel_timeout(call);
                    }
                    // The peer already knows; no echo
                    call.state = state;
                }
            }
            (CallState::Hangup, Some(index)) => {
                if let Some(call) = table.calls.remove(&index) {
                    log::info!("peer hung up call {}", index);
                    if let Some(serial) = call.timeout {
                        self.ctx.looper.cancel(serial);
                    }
                    if let Some(remote) = call.remote {
                        remote.close();
                    }
                }
            }
            (state, None) => log::debug!("REMOTECALL {:?} for unknown call {}", state, number),
            (state, Some(index)) => log::debug!("ignoring REMOTECALL {:?} for call {}", state, index),
        }
        drop(table);

        self.ctx
            .looper
            .post(safe_callback(self, |call: &Arc<CallService>| call.on_state_changed()));
    }

    fn on_state_changed(&self) {
        self.ctx.send_unsolicited("RING");
    }

    /// A peer connection went away: end every call riding on it
    pub fn on_remote_closed(&self, client: &Arc<Client>) {
        let mut table = self.lock();
        let bound = table.indices_where(|call| call.is_bound_to(client));
        for index in &bound {
            if let Some(call) = table.calls.remove(index) {
                log::info!("peer connection for call {} closed", index);
                if let Some(serial) = call.timeout {
                    self.ctx.looper.cancel(serial);
                }
            }
        }
        drop(table);
        if !bound.is_empty() {
            self.on_state_changed();
        }
    }
}
