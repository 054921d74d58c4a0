//! SIM/USIM service: PIN state machine, SIM-IO, facility locks and
//! logical channels

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::channel::Client;
use crate::error::CmeError;
use crate::icc::{IccProfile, PinProfile, SimIo, StkMenuItem};
use crate::parser::CommandParser;
use crate::services::{CommandHandler, Link, ModemContext, NetworkService, Service, OK};

pub const PIN_RETRIES: u32 = 3;
pub const PUK_RETRIES: u32 = 10;

/// Facilities known to `+CLCK`, in reporting order
pub const FACILITIES: [&str; 10] = ["SC", "FD", "AO", "OI", "OX", "AI", "IR", "AB", "AG", "AC"];

const LOGICAL_CHANNELS: usize = 3;
/// Status word returned over a logical channel when the card has no answer
const SW_FILE_NOT_FOUND: &str = "6A82";
/// Class reported for call barring facilities (voice + data + fax)
const DEFAULT_SERVICE_CLASS: i32 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimStatus {
    Absent,
    NotReady,
    Ready,
    PinRequired,
    PukRequired,
}

impl SimStatus {
    /// Value persisted under `<SIMSTATUS>`
    fn as_profile_str(self) -> &'static str {
        match self {
            SimStatus::Absent => "ABSENT",
            SimStatus::NotReady => "NOT READY",
            SimStatus::Ready => "READY",
            SimStatus::PinRequired => "SIM PIN",
            SimStatus::PukRequired => "SIM PUK",
        }
    }
}

/// One PIN with its unblocking key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinStatus {
    pub pin: String,
    pub puk: String,
    pub pin_remaining: u32,
    pub puk_remaining: u32,
}

pub enum PinCheck {
    Accepted,
    Rejected,
    /// Wrong entry that exhausted the retry counter
    Blocked,
}

impl PinStatus {
    pub fn verify_pin(&mut self, code: &str) -> PinCheck {
        if self.pin_remaining == 0 {
            return PinCheck::Blocked;
        }
        if code == self.pin {
            self.pin_remaining = PIN_RETRIES;
            return PinCheck::Accepted;
        }
        self.pin_remaining -= 1;
        if self.pin_remaining == 0 {
            PinCheck::Blocked
        } else {
            PinCheck::Rejected
        }
    }

    /// Check `puk` and on success replace the PIN
    pub fn verify_puk(&mut self, puk: &str, new_pin: &str) -> PinCheck {
        if self.puk_remaining == 0 {
            return PinCheck::Blocked;
        }
        if puk == self.puk {
            self.pin = new_pin.to_string();
            self.pin_remaining = PIN_RETRIES;
            self.puk_remaining = PUK_RETRIES;
            return PinCheck::Accepted;
        }
        self.puk_remaining -= 1;
        if self.puk_remaining == 0 {
            PinCheck::Blocked
        } else {
            PinCheck::Rejected
        }
    }

    pub fn change_pin(&mut self, old: &str, new: &str) -> PinCheck {
        let check = self.verify_pin(old);
        if let PinCheck::Accepted = check {
            self.pin = new.to_string();
        }
        check
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FacilityLock {
    enabled: bool,
    class: i32,
}

#[derive(Debug, Clone)]
struct LogicalChannel {
    session_id: u32,
    aid: String,
}

struct SimState {
    profile: IccProfile,
    status: SimStatus,
    pin1: PinStatus,
    pin2: PinStatus,
    facilities: BTreeMap<String, FacilityLock>,
    channels: [Option<LogicalChannel>; LOGICAL_CHANNELS],
}

impl SimState {
    fn new(profile: IccProfile) -> Self {
        let pins = profile.pin_profile();
        let mut facilities: BTreeMap<String, FacilityLock> = FACILITIES
            .iter()
            .map(|name| {
                (
                    name.to_string(),
                    FacilityLock {
                        enabled: false,
                        class: DEFAULT_SERVICE_CLASS,
                    },
                )
            })
            .collect();
        for (name, enabled) in profile.facility_locks() {
            facilities
                .entry(name)
                .or_insert(FacilityLock {
                    enabled,
                    class: DEFAULT_SERVICE_CLASS,
                })
                .enabled = enabled;
        }

        let pin1 = PinStatus {
            pin: pins.pin1.clone(),
            puk: pins.puk1.clone(),
            pin_remaining: pins.pin1_remaining,
            puk_remaining: pins.puk1_remaining,
        };
        let pin2 = PinStatus {
            pin: pins.pin2.clone(),
            puk: pins.puk2.clone(),
            pin_remaining: pins.pin2_remaining,
            puk_remaining: pins.puk2_remaining,
        };

        let pin_on_boot = facilities.get("SC").is_some_and(|f| f.enabled);
        let status = if pin1.puk_remaining == 0 || pins.sim_status == "ABSENT" {
            SimStatus::Absent
        } else if pin1.pin_remaining == 0 || pins.sim_status == "SIM PUK" {
            SimStatus::PukRequired
        } else if pin_on_boot {
            SimStatus::PinRequired
        } else {
            SimStatus::Ready
        };

        Self {
            profile,
            status,
            pin1,
            pin2,
            facilities,
            channels: Default::default(),
        }
    }

    fn is_facility_enabled(&self, name: &str) -> bool {
        self.facilities.get(name).is_some_and(|f| f.enabled)
    }

    /// Mirror PIN and lock state into the ICC document
    fn sync_profile(&mut self) {
        let pins = PinProfile {
            pin1: self.pin1.pin.clone(),
            puk1: self.pin1.puk.clone(),
            pin1_remaining: self.pin1.pin_remaining,
            puk1_remaining: self.pin1.puk_remaining,
            pin2: self.pin2.pin.clone(),
            puk2: self.pin2.puk.clone(),
            pin2_remaining: self.pin2.pin_remaining,
            puk2_remaining: self.pin2.puk_remaining,
            sim_status: self.status.as_profile_str().to_string(),
        };
        self.profile.set_pin_profile(&pins);
        for (name, lock) in &self.facilities {
            self.profile.set_facility_lock(name, lock.enabled);
        }
    }
}

pub struct SimService {
    ctx: Arc<ModemContext>,
    state: Mutex<SimState>,
    network: Link<NetworkService>,
}

impl Service for SimService {
    const NAME: &'static str = "sim";

    fn handlers() -> &'static [CommandHandler<Self>] {
        const HANDLERS: &[CommandHandler<SimService>] = &[
            CommandHandler::full("+CPIN?", SimService::handle_query_pin),
            CommandHandler::prefix("+CPINR", SimService::handle_pin_retries),
            CommandHandler::prefix("+CPIN=", SimService::handle_enter_pin),
            CommandHandler::prefix("+CRSM=", SimService::handle_sim_io),
            CommandHandler::full("+CIMI", SimService::handle_imsi),
            CommandHandler::full("+CICCID", SimService::handle_iccid),
            CommandHandler::prefix("+CLCK=", SimService::handle_facility_lock),
            CommandHandler::prefix("+CPWD=", SimService::handle_change_password),
            CommandHandler::prefix("+CCHO=", SimService::handle_open_channel),
            CommandHandler::prefix("+CCHC=", SimService::handle_close_channel),
            CommandHandler::prefix("+CGLA=", SimService::handle_channel_access),
        ];
        HANDLERS
    }
}

impl SimService {
    pub fn new(ctx: Arc<ModemContext>, profile: IccProfile) -> Self {
        let state = SimState::new(profile);
        log::info!("SIM {} starts {:?}", ctx.instance_id(), state.status);
        Self {
            ctx,
            state: Mutex::new(state),
            network: Link::default(),
        }
    }

    pub fn setup_dependency(&self, network: &Arc<NetworkService>) {
        self.network.set(network);
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self) -> SimStatus {
        self.lock().status
    }

    pub fn is_ready(&self) -> bool {
        self.status() == SimStatus::Ready
    }

    pub fn msisdn(&self) -> Option<String> {
        self.lock().profile.msisdn()
    }

    pub fn imsi(&self) -> Option<String> {
        self.lock().profile.imsi()
    }

    pub fn is_fdn_enabled(&self) -> bool {
        self.lock().is_facility_enabled("FD")
    }

    /// Whether dialing `number` is allowed by EF_FDN
    pub fn is_fdn_number(&self, number: &str) -> bool {
        let number = number.trim_start_matches('+');
        self.lock()
            .profile
            .fdn_numbers()
            .iter()
            .any(|entry| entry == number)
    }

    pub fn stk_setup_menu(&self) -> Option<String> {
        self.lock().profile.stk_setup_menu()
    }

    pub fn stk_item(&self, menu_ids: &[u32]) -> Option<StkMenuItem> {
        self.lock().profile.stk_item(menu_ids)
    }

    /// Write PIN and facility state into the ICC document and flush it
    pub fn save_state(&self) -> crate::error::Result<()> {
        let mut state = self.lock();
        state.sync_profile();
        state.profile.save()
    }

    fn set_status(&self, state: &mut SimState, status: SimStatus) -> bool {
        if state.status == status {
            return false;
        }
        log::info!("SIM {} {:?} -> {:?}", self.ctx.instance_id(), state.status, status);
        state.status = status;
        state.sync_profile();
        true
    }

    fn notify_status_changed(&self) {
        if let Some(network) = self.network.get() {
            network.on_sim_status_changed();
        }
    }

    fn handle_query_pin(self: &Arc<Self>, client: &Arc<Client>, _command: &str) {
        let line = match self.status() {
            SimStatus::Ready => "+CPIN: READY".to_string(),
            SimStatus::PinRequired => "+CPIN: SIM PIN".to_string(),
            SimStatus::PukRequired => "+CPIN: SIM PUK".to_string(),
            SimStatus::Absent => return client.send_line(&CmeError::SimNotInserted.to_string()),
            SimStatus::NotReady => return client.send_line(&CmeError::SimBusy.to_string()),
        };
        client.send_lines([line.as_str(), OK]);
    }

    fn handle_pin_retries(self: &Arc<Self>, client: &Arc<Client>, command: &str) {
        let state = self.lock();
        let counters = [
            ("SIM PIN", state.pin1.pin_remaining, PIN_RETRIES),
            ("SIM PUK", state.pin1.puk_remaining, PUK_RETRIES),
            ("SIM PIN2", state.pin2.pin_remaining, PIN_RETRIES),
            ("SIM PUK2", state.pin2.puk_remaining, PUK_RETRIES),
        ];
        drop(state);

        let mut cmd = CommandParser::new(command);
        cmd.skip_prefix();
        let wanted = cmd.next_str();
        let selected: Vec<_> = counters
            .iter()
            .filter(|(name, _, _)| wanted.is_empty() || name.eq_ignore_ascii_case(wanted))
            .collect();
        if selected.is_empty() {
            return client.send_line(&CmeError::IncorrectParameters.to_string());
        }
        for (name, remaining, default) in selected {
            client.send_line(&format!("+CPINR: {},{},{}", name, remaining, default));
        }
        client.send_line(OK);
    }

    fn handle_enter_pin(self: &Arc<Self>, client: &Arc<Client>, command: &str) {
        let mut cmd = CommandParser::new(command);
        cmd.skip_prefix();
        let first = cmd.next_str().to_string();
        let second = cmd.next_str().to_string();

        let mut state = self.lock();
        let (reply, changed) = match state.status {
            SimStatus::Absent => (Err(CmeError::SimNotInserted), false),
            SimStatus::NotReady => (Err(CmeError::SimBusy), false),
            SimStatus::PinRequired => match state.pin1.verify_pin(&first) {
                PinCheck::Accepted => (Ok(()), self.set_status(&mut state, SimStatus::Ready)),
                PinCheck::Rejected => (Err(CmeError::IncorrectPassword), false),
                PinCheck::Blocked => (
                    Err(CmeError::IncorrectPassword),
                    self.set_status(&mut state, SimStatus::PukRequired),
                ),
            },
            SimStatus::PukRequired if second.is_empty() => (Err(CmeError::SimPukRequired), false),
            SimStatus::PukRequired => match state.pin1.verify_puk(&first, &second) {
                PinCheck::Accepted => (Ok(()), self.set_status(&mut state, SimStatus::Ready)),
                PinCheck::Rejected => (Err(CmeError::IncorrectPassword), false),
                PinCheck::Blocked => (
                    Err(CmeError::IncorrectPassword),
                    self.set_status(&mut state, SimStatus::Absent),
                ),
            },
            SimStatus::Ready if second.is_empty() => (Err(CmeError::OperationNotAllowed), false),
            SimStatus::Ready => match state.pin1.change_pin(&first, &second) {
                PinCheck::Accepted => (Ok(()), false),
                PinCheck::Rejected => (Err(CmeError::IncorrectPassword), false),
                PinCheck::Blocked => (
                    Err(CmeError::IncorrectPassword),
                    self.set_status(&mut state, SimStatus::PukRequired),
                ),
            },
        };
        state.sync_profile();
        drop(state);

        match reply {
            Ok(()) => client.send_line(OK),
            Err(e) => client.send_line(&e.to_string()),
        }
        if changed {
            self.notify_status_changed();
        }
    }

    fn handle_sim_io(self: &Arc<Self>, client: &Arc<Client>, command: &str) {
        if self.status() == SimStatus::Absent {
            return client.send_line(&CmeError::SimNotInserted.to_string());
        }

        let mut cmd = CommandParser::new(command);
        cmd.skip_prefix();
        let command_byte = cmd.next_int();
        let file_id = cmd.next_dec_to_hex();
        let [p1, p2, p3] = [cmd.next_int(), cmd.next_int(), cmd.next_int()];
        let in_byte = |v: i32| u8::try_from(v).ok();
        let (Some(command_byte), Some(p1), Some(p2), Some(p3)) =
            (in_byte(command_byte), in_byte(p1), in_byte(p2), in_byte(p3))
        else {
            return client.send_line(&CmeError::IncorrectParameters.to_string());
        };
        if file_id.is_empty() || file_id.len() > 4 {
            return client.send_line(&CmeError::IncorrectParameters.to_string());
        }

        let data = cmd.next_str();
        let path = cmd.next_str();
        let request = SimIo {
            command: command_byte,
            file_id: format!("{:0>4}", file_id),
            p1,
            p2,
            p3,
            data: (!data.is_empty()).then(|| data.to_string()),
            path: (!path.is_empty()).then(|| path.to_string()),
        };

        let response = self.lock().profile.sim_io(&request);
        client.send_lines([format!("+CRSM: {}", response).as_str(), OK]);
    }

    fn handle_imsi(self: &Arc<Self>, client: &Arc<Client>, _command: &str) {
        if self.status() != SimStatus::Ready {
            return client.send_line(&CmeError::SimPinRequired.to_string());
        }
        match self.imsi() {
            Some(imsi) => client.send_lines([imsi.as_str(), OK]),
            None => client.send_line(&CmeError::NotFound.to_string()),
        }
    }

    fn handle_iccid(self: &Arc<Self>, client: &Arc<Client>, _command: &str) {
        if self.status() == SimStatus::Absent {
            return client.send_line(&CmeError::SimNotInserted.to_string());
        }
        match self.lock().profile.iccid() {
            Some(iccid) => client.send_lines([iccid.as_str(), OK]),
            None => client.send_line(&CmeError::NotFound.to_string()),
        }
    }

    /// `+CLCK=<fac>,<mode>[,<passwd>[,<class>]]`
    fn handle_facility_lock(self: &Arc<Self>, client: &Arc<Client>, command: &str) {
        let mut cmd = CommandParser::new(command);
        cmd.skip_prefix();
        let facility = cmd.next_str().to_ascii_uppercase();
        let mode = cmd.next_int();
        let password = cmd.next_str().to_string();
        let class = cmd.next_int();

        let mut state = self.lock();
        if !state.facilities.contains_key(&facility) {
            drop(state);
            return client.send_line(&CmeError::IncorrectParameters.to_string());
        }

        if mode == 2 {
            let lock = state.facilities[&facility];
            drop(state);
            let line = match facility.as_str() {
                "SC" | "FD" => format!("+CLCK: {}", u8::from(lock.enabled)),
                _ => format!("+CLCK: {},{}", u8::from(lock.enabled), lock.class),
            };
            return client.send_lines([line.as_str(), OK]);
        }
        if mode != 0 && mode != 1 {
            drop(state);
            return client.send_line(&CmeError::IncorrectParameters.to_string());
        }

        let mut status_changed = false;
        let verdict = match facility.as_str() {
            "SC" => match state.pin1.verify_pin(&password) {
                PinCheck::Accepted => Ok(()),
                PinCheck::Rejected => Err(CmeError::IncorrectPassword),
                PinCheck::Blocked => {
                    status_changed = self.set_status(&mut state, SimStatus::PukRequired);
                    Err(CmeError::IncorrectPassword)
                }
            },
            "FD" => match state.pin2.verify_pin(&password) {
                PinCheck::Accepted => Ok(()),
                PinCheck::Rejected | PinCheck::Blocked => Err(CmeError::IncorrectPassword),
            },
            _ if password.is_empty() => Err(CmeError::IncorrectPassword),
            _ => Ok(()),
        };

        if verdict.is_ok() {
            if let Some(lock) = state.facilities.get_mut(&facility) {
                lock.enabled = mode == 1;
                if class > 0 {
                    lock.class = class;
                }
            }
        }
        state.sync_profile();
        drop(state);

        match verdict {
            Ok(()) => client.send_line(OK),
            Err(e) => client.send_line(&e.to_string()),
        }
        if status_changed {
            self.notify_status_changed();
        }
    }

    /// `+CPWD=<fac>,<oldpwd>,<newpwd>`
    fn handle_change_password(self: &Arc<Self>, client: &Arc<Client>, command: &str) {
        let mut cmd = CommandParser::new(command);
        cmd.skip_prefix();
        let facility = cmd.next_str().to_ascii_uppercase();
        let old = cmd.next_str().to_string();
        let new = cmd.next_str().to_string();
        if new.is_empty() {
            return client.send_line(&CmeError::IncorrectParameters.to_string());
        }

        let mut state = self.lock();
        let mut status_changed = false;
        let verdict = match facility.as_str() {
            "SC" => match state.pin1.change_pin(&old, &new) {
                PinCheck::Accepted => Ok(()),
                PinCheck::Rejected => Err(CmeError::IncorrectPassword),
                PinCheck::Blocked => {
                    status_changed = self.set_status(&mut state, SimStatus::PukRequired);
                    Err(CmeError::IncorrectPassword)
                }
            },
            "P2" | "FD" => match state.pin2.change_pin(&old, &new) {
                PinCheck::Accepted => Ok(()),
                PinCheck::Rejected | PinCheck::Blocked => Err(CmeError::IncorrectPassword),
            },
            // Barring passwords live in the network
            _ if state.facilities.contains_key(&facility) => Ok(()),
            _ => Err(CmeError::IncorrectParameters),
        };
        state.sync_profile();
        drop(state);

        match verdict {
            Ok(()) => client.send_line(OK),
            Err(e) => client.send_line(&e.to_string()),
        }
        if status_changed {
            self.notify_status_changed();
        }
    }

    fn handle_open_channel(self: &Arc<Self>, client: &Arc<Client>, command: &str) {
        let mut cmd = CommandParser::new(command);
        cmd.skip_prefix();
        let aid = cmd.next_str().to_ascii_uppercase();

        let mut state = self.lock();
        if aid.is_empty() || !state.profile.has_application(&aid) {
            drop(state);
            return client.send_line(&CmeError::NotFound.to_string());
        }
        let Some(slot) = state.channels.iter().position(Option::is_none) else {
            drop(state);
            return client.send_line(&CmeError::MemoryFull.to_string());
        };
        let session_id = slot as u32 + 1;
        state.channels[slot] = Some(LogicalChannel { session_id, aid });
        drop(state);

        client.send_lines([session_id.to_string().as_str(), OK]);
    }

    fn handle_close_channel(self: &Arc<Self>, client: &Arc<Client>, command: &str) {
        let mut cmd = CommandParser::new(command);
        cmd.skip_prefix();
        let session_id = cmd.next_int();

        let mut state = self.lock();
        let slot = state
            .channels
            .iter()
            .position(|c| c.as_ref().is_some_and(|c| c.session_id as i32 == session_id));
        match slot {
            Some(slot) => {
                state.channels[slot] = None;
                drop(state);
                client.send_lines(["+CCHC", OK]);
            }
            None => {
                drop(state);
                client.send_line(&CmeError::InvalidIndex.to_string());
            }
        }
    }

    /// `+CGLA=<sessionid>,<length>,<command>`
    fn handle_channel_access(self: &Arc<Self>, client: &Arc<Client>, command: &str) {
        let mut cmd = CommandParser::new(command);
        cmd.skip_prefix();
        let session_id = cmd.next_int();
        let length = cmd.next_int();
        let apdu = cmd.next_str().to_ascii_uppercase();
        if length >= 0 && length as usize != apdu.len() {
            log::debug!("CGLA length {} does not match APDU {}", length, apdu);
        }

        let state = self.lock();
        let channel = state
            .channels
            .iter()
            .flatten()
            .find(|c| c.session_id as i32 == session_id);
        let Some(channel) = channel else {
            drop(state);
            return client.send_line(&CmeError::InvalidIndex.to_string());
        };
        let response = state
            .profile
            .logical_channel_response(&channel.aid, &apdu)
            .unwrap_or_else(|| SW_FILE_NOT_FOUND.to_string());
        drop(state);

        client.send_lines([
            format!("+CGLA: {},\"{}\"", response.len(), response).as_str(),
            OK,
        ]);
    }
}
