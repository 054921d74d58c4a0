//! Radio power, operator selection, registration state and signal strength

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::channel::Client;
use crate::error::CmeError;
use crate::looper::safe_callback;
use crate::nvram::DEFAULT_OPERATOR_NUMERIC;
use crate::parser::CommandParser;
use crate::services::{
    CommandHandler, DataService, Link, MiscService, ModemContext, Service, SimService, OK,
};

/// Delay between radio power-on (or a RAT change) and registration
pub const REGISTRATION_DELAY: Duration = Duration::from_secs(1);

pub const LOCATION_AREA_CODE: &str = "2142";
pub const CELL_ID: &str = "0000B804";

const DEFAULT_REPORT_MODE: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegState {
    Unregistered = 0,
    Home = 1,
    Searching = 2,
    Denied = 3,
    Unknown = 4,
    Roaming = 5,
    /// Limited service, emergency calls only
    Emergency = 8,
}

impl RegState {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// States whose reports carry the cell identity
    fn has_cell(self) -> bool {
        matches!(self, RegState::Home | RegState::Roaming | RegState::Emergency)
    }

    pub fn is_registered(self) -> bool {
        matches!(self, RegState::Home | RegState::Roaming)
    }
}

/// Radio access technology; the discriminant is the `+CTEC` index and the
/// bit position inside the preferred mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModemTechnology {
    Gsm = 0,
    Wcdma = 1,
    Cdma = 2,
    Evdo = 3,
    Tdscdma = 4,
    Lte = 5,
    Nr = 6,
}

impl ModemTechnology {
    pub fn from_index(index: i32) -> Option<Self> {
        Some(match index {
            0 => ModemTechnology::Gsm,
            1 => ModemTechnology::Wcdma,
            2 => ModemTechnology::Cdma,
            3 => ModemTechnology::Evdo,
            4 => ModemTechnology::Tdscdma,
            5 => ModemTechnology::Lte,
            6 => ModemTechnology::Nr,
            _ => return None,
        })
    }

    pub fn index(self) -> i32 {
        self as i32
    }

    pub fn mask(self) -> i32 {
        1 << self.index()
    }

    /// `<AcT>` of 3GPP TS 27.007
    pub fn access_technology(self) -> i32 {
        match self {
            ModemTechnology::Gsm | ModemTechnology::Cdma | ModemTechnology::Evdo => 0,
            ModemTechnology::Wcdma | ModemTechnology::Tdscdma => 2,
            ModemTechnology::Lte => 7,
            ModemTechnology::Nr => 11,
        }
    }

    /// Packet registration is reported through `+CEREG` on EPS/5GS
    fn uses_eps_report(self) -> bool {
        matches!(self, ModemTechnology::Lte | ModemTechnology::Nr)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    Automatic = 0,
    Manual = 1,
    Deregister = 2,
    ManualAutomatic = 4,
}

impl SelectionMode {
    fn from_code(code: i32) -> Self {
        match code {
            1 => SelectionMode::Manual,
            2 => SelectionMode::Deregister,
            4 => SelectionMode::ManualAutomatic,
            _ => SelectionMode::Automatic,
        }
    }
}

pub struct OperatorInfo {
    pub numeric: &'static str,
    pub long_name: &'static str,
    pub short_name: &'static str,
    pub forbidden: bool,
}

pub const OPERATORS: [OperatorInfo; 3] = [
    OperatorInfo {
        numeric: DEFAULT_OPERATOR_NUMERIC,
        long_name: "Android Virtual Operator",
        short_name: "Android",
        forbidden: false,
    },
    OperatorInfo {
        numeric: "310300",
        long_name: "Alternative Operator",
        short_name: "Alternative",
        forbidden: false,
    },
    OperatorInfo {
        numeric: "310400",
        long_name: "Hermetic Network Operator",
        short_name: "Hermetic",
        forbidden: true,
    },
];

fn find_operator(name: &str) -> Option<&'static OperatorInfo> {
    OPERATORS.iter().find(|op| {
        op.numeric == name
            || op.long_name.eq_ignore_ascii_case(name)
            || op.short_name.eq_ignore_ascii_case(name)
    })
}

/// One signal field bouncing by one unit inside `[min, max]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Drift {
    value: i32,
    min: i32,
    max: i32,
    step: i32,
}

impl Drift {
    const fn new(value: i32, min: i32, max: i32) -> Self {
        Self {
            value,
            min,
            max,
            step: 1,
        }
    }

    const fn fixed(value: i32) -> Self {
        Self::new(value, value, value)
    }

    fn next(&mut self) -> i32 {
        if self.min < self.max {
            let mut candidate = self.value + self.step;
            if candidate > self.max || candidate < self.min {
                self.step = -self.step;
                candidate = self.value + self.step;
            }
            self.value = candidate.clamp(self.min, self.max);
        }
        self.value
    }
}

pub const SIGNAL_FIELDS: usize = 22;
const UNKNOWN_RSSI: i32 = 99;
const UNAVAILABLE: i32 = i32::MAX;

/// Signal strength vector reported by `+CSQ`: GSM(2) CDMA(2) EVDO(3)
/// LTE(6) TD-SCDMA(1) WCDMA(2) NR(6)
#[derive(Debug, Clone)]
struct SignalStrength {
    fields: [Option<Drift>; SIGNAL_FIELDS],
}

impl SignalStrength {
    fn for_technology(tech: ModemTechnology) -> Self {
        let mut fields = [None; SIGNAL_FIELDS];
        let mut set = |start: usize, values: &[Drift]| {
            for (i, drift) in values.iter().enumerate() {
                fields[start + i] = Some(*drift);
            }
        };
        match tech {
            ModemTechnology::Gsm => set(0, &[Drift::new(20, 4, 30), Drift::fixed(0)]),
            ModemTechnology::Cdma => set(2, &[Drift::new(85, 60, 110), Drift::new(90, 60, 160)]),
            ModemTechnology::Evdo => set(
                4,
                &[
                    Drift::new(85, 60, 110),
                    Drift::new(90, 60, 160),
                    Drift::new(6, 0, 8),
                ],
            ),
            ModemTechnology::Lte => set(
                7,
                &[
                    Drift::new(22, 4, 30),
                    Drift::new(85, 44, 140),
                    Drift::new(10, 3, 20),
                    Drift::new(100, -200, 300),
                    Drift::fixed(UNAVAILABLE),
                    Drift::fixed(UNAVAILABLE),
                ],
            ),
            ModemTechnology::Tdscdma => set(13, &[Drift::new(60, 25, 120)]),
            ModemTechnology::Wcdma => set(14, &[Drift::new(20, 4, 30), Drift::fixed(0)]),
            ModemTechnology::Nr => set(
                16,
                &[
                    Drift::new(85, 44, 140),
                    Drift::new(10, 3, 20),
                    Drift::new(20, -23, 40),
                    Drift::fixed(UNAVAILABLE),
                    Drift::fixed(UNAVAILABLE),
                    Drift::fixed(UNAVAILABLE),
                ],
            ),
        }
        Self { fields }
    }

    /// Placeholder for a field the current RAT does not use
    fn unused_value(index: usize) -> i32 {
        match index {
            0..=6 | 13..=15 => UNKNOWN_RSSI,
            _ => UNAVAILABLE,
        }
    }

    /// Advance every drifting field and render the vector
    fn sample(&mut self) -> String {
        self.fields
            .iter_mut()
            .enumerate()
            .map(|(i, field)| match field {
                Some(drift) => drift.next(),
                None => Self::unused_value(i),
            })
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

struct NetworkState {
    radio_on: bool,
    voice: RegState,
    data: RegState,
    creg_mode: i32,
    cgreg_mode: i32,
    cereg_mode: i32,
    operator: String,
    selection_mode: SelectionMode,
    /// Result of a failed manual selection
    forced: Option<RegState>,
    oper_format: i32,
    technology: ModemTechnology,
    preferred_mask: i32,
    signal: SignalStrength,
}

impl NetworkState {
    fn target(&self, sim_ready: bool) -> (RegState, RegState) {
        if !self.radio_on {
            return (RegState::Unregistered, RegState::Unregistered);
        }
        if self.selection_mode == SelectionMode::Deregister {
            return (RegState::Unregistered, RegState::Unregistered);
        }
        if !sim_ready {
            return (RegState::Emergency, RegState::Unregistered);
        }
        match self.forced {
            Some(state) => (state, state),
            None => (RegState::Home, RegState::Home),
        }
    }

    fn operator_info(&self) -> Option<&'static OperatorInfo> {
        OPERATORS.iter().find(|op| op.numeric == self.operator)
    }

    fn operator_name(&self, format: i32) -> Option<&'static str> {
        let info = self.operator_info()?;
        Some(match format {
            0 => info.long_name,
            1 => info.short_name,
            _ => info.numeric,
        })
    }

    fn cell_suffix(&self, state: RegState) -> String {
        if !state.has_cell() {
            return String::new();
        }
        format!(
            ",\"{}\",\"{}\",{}",
            LOCATION_AREA_CODE,
            CELL_ID,
            self.technology.access_technology()
        )
    }

    fn data_prefix(&self) -> &'static str {
        if self.technology.uses_eps_report() {
            "+CEREG"
        } else {
            "+CGREG"
        }
    }

    fn data_mode(&self) -> i32 {
        if self.technology.uses_eps_report() {
            self.cereg_mode
        } else {
            self.cgreg_mode
        }
    }

    /// Unsolicited registration line, `None` when reporting is off
    fn unsolicited(&self, prefix: &str, mode: i32, state: RegState) -> Option<String> {
        match mode {
            1 => Some(format!("{}: 1,{}", prefix, state.code())),
            2 => Some(format!("{}: 1,{}{}", prefix, state.code(), self.cell_suffix(state))),
            _ => None,
        }
    }

    fn query(&self, prefix: &str, mode: i32, state: RegState) -> String {
        let suffix = if mode >= 2 {
            self.cell_suffix(state)
        } else {
            String::new()
        };
        format!("{}: {},{}{}", prefix, mode, state.code(), suffix)
    }
}

pub struct NetworkService {
    ctx: Arc<ModemContext>,
    state: Mutex<NetworkState>,
    sim: Link<SimService>,
    misc: Link<MiscService>,
    data: Link<DataService>,
}

impl Service for NetworkService {
    const NAME: &'static str = "network";

    fn handlers() -> &'static [CommandHandler<Self>] {
        const HANDLERS: &[CommandHandler<NetworkService>] = &[
            CommandHandler::full("+CFUN?", NetworkService::handle_query_radio),
            CommandHandler::prefix("+CFUN=", NetworkService::handle_set_radio),
            CommandHandler::full("+CSQ", NetworkService::handle_signal_strength),
            CommandHandler::full(
                "+COPS=3,0;+COPS?;+COPS=3,1;+COPS?;+COPS=3,2;+COPS?",
                NetworkService::handle_query_all_operator_names,
            ),
            CommandHandler::full("+COPS?", NetworkService::handle_query_operator),
            CommandHandler::full("+COPS=?", NetworkService::handle_list_operators),
            CommandHandler::prefix("+COPS=", NetworkService::handle_select_operator),
            CommandHandler::full("+CREG?", NetworkService::handle_query_voice_registration),
            CommandHandler::prefix("+CREG=", NetworkService::handle_set_report_mode),
            CommandHandler::full("+CGREG?", NetworkService::handle_query_data_registration),
            CommandHandler::prefix("+CGREG=", NetworkService::handle_set_report_mode),
            CommandHandler::full("+CEREG?", NetworkService::handle_query_data_registration),
            CommandHandler::prefix("+CEREG=", NetworkService::handle_set_report_mode),
            CommandHandler::full("+CTEC?", NetworkService::handle_query_technology),
            CommandHandler::full("+CTEC=?", NetworkService::handle_list_technologies),
            CommandHandler::prefix("+CTEC=", NetworkService::handle_set_technology),
        ];
        HANDLERS
    }
}

impl NetworkService {
    pub fn new(ctx: Arc<ModemContext>) -> Self {
        let nvram = ctx.nvram.instance(ctx.instance_id());
        let technology =
            ModemTechnology::from_index(nvram.modem_technology).unwrap_or(ModemTechnology::Lte);
        let operator = if find_operator(&nvram.operator_numeric).is_some() {
            nvram.operator_numeric.clone()
        } else {
            DEFAULT_OPERATOR_NUMERIC.to_string()
        };
        let state = NetworkState {
            radio_on: false,
            voice: RegState::Unregistered,
            data: RegState::Unregistered,
            creg_mode: DEFAULT_REPORT_MODE,
            cgreg_mode: DEFAULT_REPORT_MODE,
            cereg_mode: DEFAULT_REPORT_MODE,
            operator,
            selection_mode: SelectionMode::from_code(nvram.network_selection_mode),
            forced: None,
            oper_format: 0,
            technology,
            preferred_mask: nvram.preferred_network_mode,
            signal: SignalStrength::for_technology(technology),
        };
        Self {
            ctx,
            state: Mutex::new(state),
            sim: Link::default(),
            misc: Link::default(),
            data: Link::default(),
        }
    }

    pub fn setup_dependency(
        &self,
        sim: &Arc<SimService>,
        misc: &Arc<MiscService>,
        data: &Arc<DataService>,
    ) {
        self.sim.set(sim);
        self.misc.set(misc);
        self.data.set(data);
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_radio_on(&self) -> bool {
        self.lock().radio_on
    }

    pub fn voice_state(&self) -> RegState {
        self.lock().voice
    }

    pub fn data_state(&self) -> RegState {
        self.lock().data
    }

    pub fn technology(&self) -> ModemTechnology {
        self.lock().technology
    }

    fn sim_ready(&self) -> bool {
        self.sim.get().is_some_and(|sim| sim.is_ready())
    }

    /// Emit the current voice and data registration lines
    pub fn report_registration(&self) {
        let lines = {
            let state = self.lock();
            [
                state.unsolicited("+CREG", state.creg_mode, state.voice),
                state.unsolicited(state.data_prefix(), state.data_mode(), state.data),
            ]
        };
        for line in lines.iter().flatten() {
            self.ctx.send_unsolicited(line);
        }
    }

    pub fn on_sim_status_changed(self: &Arc<Self>) {
        if self.is_radio_on() {
            self.update_registration();
        }
    }

    /// Move both registrations towards the state the radio, SIM and
    /// operator selection allow, reporting every change
    pub fn update_registration(self: &Arc<Self>) {
        let sim_ready = self.sim_ready();
        let (voice, data) = self.lock().target(sim_ready);
        self.set_registration(voice, data);
    }

    fn set_registration(&self, voice: RegState, data: RegState) {
        let mut lines = Vec::new();
        let reached_home;
        {
            let mut state = self.lock();
            reached_home = voice == RegState::Home && state.voice != RegState::Home;
            if state.voice != voice {
                log::info!("voice registration {:?} -> {:?}", state.voice, voice);
                state.voice = voice;
                lines.extend(state.unsolicited("+CREG", state.creg_mode, voice));
            }
            if state.data != data {
                log::info!("data registration {:?} -> {:?}", state.data, data);
                state.data = data;
                lines.extend(state.unsolicited(state.data_prefix(), state.data_mode(), data));
            }
        }
        for line in &lines {
            self.ctx.send_unsolicited(line);
        }

        if reached_home {
            if let Some(misc) = self.misc.get() {
                misc.time_update();
            }
            let signal = self.lock().signal.sample();
            self.ctx.send_unsolicited(&format!("+CSQ: {}", signal));
        }
    }

    fn persist(&self) {
        let (mode, operator, technology, preferred) = {
            let state = self.lock();
            (
                state.selection_mode as i32,
                state.operator.clone(),
                state.technology.index(),
                state.preferred_mask,
            )
        };
        let nvram = &self.ctx.nvram;
        nvram.update(self.ctx.instance_id(), |instance| {
            instance.network_selection_mode = mode;
            instance.operator_numeric = operator;
            instance.modem_technology = technology;
            instance.preferred_network_mode = preferred;
        });
        if let Err(e) = nvram.save() {
            log::warn!("failed to persist network settings: {}", e);
        }
    }

    fn handle_query_radio(self: &Arc<Self>, client: &Arc<Client>, _command: &str) {
        let on = self.is_radio_on();
        client.send_lines([format!("+CFUN: {}", u8::from(on)).as_str(), OK]);
    }

    fn handle_set_radio(self: &Arc<Self>, client: &Arc<Client>, command: &str) {
        let mut cmd = CommandParser::new(command);
        cmd.skip_prefix();
        match cmd.next_int() {
            1 => {
                self.lock().radio_on = true;
                client.send_line(OK);
                log::info!("radio on, registering in {:?}", REGISTRATION_DELAY);
                self.ctx.looper.post_with_delay(
                    REGISTRATION_DELAY,
                    safe_callback(self, |network| network.update_registration()),
                );
            }
            0 | 4 => {
                self.lock().radio_on = false;
                client.send_line(OK);
                log::info!("radio off");
                self.set_registration(RegState::Unregistered, RegState::Unregistered);
                if let Some(data) = self.data.get() {
                    data.deactivate_all();
                }
            }
            _ => client.send_line(&CmeError::IncorrectParameters.to_string()),
        }
    }

    fn handle_signal_strength(self: &Arc<Self>, client: &Arc<Client>, _command: &str) {
        let signal = self.lock().signal.sample();
        client.send_lines([format!("+CSQ: {}", signal).as_str(), OK]);
    }

    fn operator_line(state: &NetworkState, format: i32) -> String {
        let mode = state.selection_mode as i32;
        match state.operator_name(format) {
            Some(name) if state.voice.is_registered() => {
                format!("+COPS: {},{},\"{}\"", mode, format, name)
            }
            _ => format!("+COPS: {}", mode),
        }
    }

    fn handle_query_all_operator_names(self: &Arc<Self>, client: &Arc<Client>, _command: &str) {
        let lines: Vec<String> = {
            let state = self.lock();
            (0..3).map(|format| Self::operator_line(&state, format)).collect()
        };
        client.send_lines(lines.iter().map(String::as_str).chain([OK]));
    }

    fn handle_query_operator(self: &Arc<Self>, client: &Arc<Client>, _command: &str) {
        let line = {
            let state = self.lock();
            Self::operator_line(&state, state.oper_format)
        };
        client.send_lines([line.as_str(), OK]);
    }

    fn handle_list_operators(self: &Arc<Self>, client: &Arc<Client>, _command: &str) {
        let (current, act) = {
            let state = self.lock();
            (state.operator.clone(), state.technology.access_technology())
        };
        let entries: Vec<String> = OPERATORS
            .iter()
            .map(|op| {
                let stat = if op.forbidden {
                    3
                } else if op.numeric == current {
                    2
                } else {
                    1
                };
                format!(
                    "({},\"{}\",\"{}\",\"{}\",{})",
                    stat, op.long_name, op.short_name, op.numeric, act
                )
            })
            .collect();
        let line = format!("+COPS: {},,(0,1,2,3,4),(0,1,2)", entries.join(","));
        client.send_lines([line.as_str(), OK]);
    }

    /// `+COPS=<mode>[,<format>,<oper>[,<act>]]`
    fn handle_select_operator(self: &Arc<Self>, client: &Arc<Client>, command: &str) {
        let mut cmd = CommandParser::new(command);
        cmd.skip_prefix();
        let mode = cmd.next_int();
        let format = cmd.next_int();
        let name = cmd.next_str().to_string();

        let reply = {
            let mut state = self.lock();
            if (0..=2).contains(&format) {
                state.oper_format = format;
            }
            match mode {
                0 => {
                    state.selection_mode = SelectionMode::Automatic;
                    state.operator = OPERATORS[0].numeric.to_string();
                    state.forced = None;
                    Ok(true)
                }
                1 | 4 => {
                    let manual = if mode == 1 {
                        SelectionMode::Manual
                    } else {
                        SelectionMode::ManualAutomatic
                    };
                    match find_operator(&name) {
                        Some(op) if !op.forbidden => {
                            state.selection_mode = manual;
                            state.operator = op.numeric.to_string();
                            state.forced = None;
                            Ok(true)
                        }
                        _ if mode == 4 => {
                            log::info!("manual selection of {} failed, falling back to automatic", name);
                            state.selection_mode = manual;
                            state.operator = OPERATORS[0].numeric.to_string();
                            state.forced = None;
                            Ok(true)
                        }
                        Some(op) => {
                            state.selection_mode = manual;
                            state.operator = op.numeric.to_string();
                            state.forced = Some(RegState::Denied);
                            Err(CmeError::NoNetworkService)
                        }
                        None => {
                            state.selection_mode = manual;
                            state.forced = Some(RegState::Unknown);
                            Err(CmeError::NoNetworkService)
                        }
                    }
                }
                2 => {
                    state.selection_mode = SelectionMode::Deregister;
                    state.forced = None;
                    Ok(true)
                }
                3 => Ok(false),
                _ => Err(CmeError::IncorrectParameters),
            }
        };

        let selection_changed = !matches!(reply, Ok(false) | Err(CmeError::IncorrectParameters));
        if selection_changed {
            self.persist();
            self.update_registration();
        }
        match reply {
            Ok(_) => client.send_line(OK),
            Err(e) => client.send_line(&e.to_string()),
        }
    }

    fn handle_query_voice_registration(self: &Arc<Self>, client: &Arc<Client>, _command: &str) {
        let line = {
            let state = self.lock();
            state.query("+CREG", state.creg_mode, state.voice)
        };
        client.send_lines([line.as_str(), OK]);
    }

    fn handle_query_data_registration(self: &Arc<Self>, client: &Arc<Client>, command: &str) {
        let line = {
            let state = self.lock();
            if command.to_ascii_uppercase().contains("+CEREG") {
                state.query("+CEREG", state.cereg_mode, state.data)
            } else {
                state.query("+CGREG", state.cgreg_mode, state.data)
            }
        };
        client.send_lines([line.as_str(), OK]);
    }

    /// `+CREG=<n>`, `+CGREG=<n>`, `+CEREG=<n>`
    fn handle_set_report_mode(self: &Arc<Self>, client: &Arc<Client>, command: &str) {
        let upper = command.to_ascii_uppercase();
        let mut cmd = CommandParser::new(command);
        cmd.skip_prefix();
        let mode = cmd.next_int();
        if !(0..=2).contains(&mode) {
            return client.send_line(&CmeError::IncorrectParameters.to_string());
        }

        let mut state = self.lock();
        if upper.contains("+CEREG") {
            state.cereg_mode = mode;
        } else if upper.contains("+CGREG") {
            state.cgreg_mode = mode;
        } else {
            state.creg_mode = mode;
        }
        drop(state);
        client.send_line(OK);
    }

    fn handle_query_technology(self: &Arc<Self>, client: &Arc<Client>, _command: &str) {
        let line = {
            let state = self.lock();
            format!("+CTEC: {},{:x}", state.technology.index(), state.preferred_mask)
        };
        client.send_lines([line.as_str(), OK]);
    }

    fn handle_list_technologies(self: &Arc<Self>, client: &Arc<Client>, _command: &str) {
        let supported = [
            ModemTechnology::Gsm,
            ModemTechnology::Wcdma,
            ModemTechnology::Lte,
            ModemTechnology::Nr,
        ]
        .iter()
        .map(|tech| tech.index().to_string())
        .collect::<Vec<_>>()
        .join(",");
        client.send_lines([format!("+CTEC: {}", supported).as_str(), OK]);
    }

    /// `+CTEC=<current>,"<preferred mask hex>"`
    fn handle_set_technology(self: &Arc<Self>, client: &Arc<Client>, command: &str) {
        let mut cmd = CommandParser::new(command);
        cmd.skip_prefix();
        let current = cmd.next_int();
        let preferred = cmd.next_hex_int();

        let Some(technology) = ModemTechnology::from_index(current) else {
            return client.send_line(&CmeError::IncorrectParameters.to_string());
        };

        let changed = {
            let mut state = self.lock();
            if preferred > 0 {
                state.preferred_mask = preferred;
            }
            let changed = state.technology != technology;
            if changed {
                log::info!("technology {:?} -> {:?}", state.technology, technology);
                state.technology = technology;
                state.signal = SignalStrength::for_technology(technology);
            }
            changed
        };
        self.persist();

        let line = {
            let state = self.lock();
            format!("+CTEC: {},{:x}", state.technology.index(), state.preferred_mask)
        };
        client.send_lines([line.as_str(), OK]);

        if changed && self.is_radio_on() {
            self.set_registration(RegState::Unregistered, RegState::Unregistered);
            self.ctx.looper.post_with_delay(
                REGISTRATION_DELAY,
                safe_callback(self, |network| network.update_registration()),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drift_stays_in_range() {
        let mut drift = Drift::new(29, 4, 30);
        let values: Vec<i32> = (0..6).map(|_| drift.next()).collect();
        assert_eq!(values, vec![30, 29, 28, 27, 26, 25]);

        let mut low = Drift::new(5, 4, 30);
        let values: Vec<i32> = (0..4).map(|_| low.next()).collect();
        assert_eq!(values, vec![6, 7, 8, 9]);

        let mut drift = Drift::new(4, 4, 30);
        for _ in 0..200 {
            let v = drift.next();
            assert!((4..=30).contains(&v));
        }
    }

    #[test]
    fn test_fixed_field_does_not_move() {
        let mut fixed = Drift::fixed(UNAVAILABLE);
        assert_eq!(fixed.next(), UNAVAILABLE);
        assert_eq!(fixed.next(), UNAVAILABLE);
    }

    #[test]
    fn test_signal_vector_layout() {
        let mut lte = SignalStrength::for_technology(ModemTechnology::Lte);
        let rendered = lte.sample();
        let fields: Vec<i64> = rendered.split(',').map(|v| v.parse().unwrap()).collect();
        assert_eq!(fields.len(), SIGNAL_FIELDS);
        assert_eq!(fields[0], 99);
        assert_eq!(fields[7], 23);
        assert_eq!(fields[11], i64::from(i32::MAX));
        assert_eq!(fields[16], i64::from(i32::MAX));

        let mut gsm = SignalStrength::for_technology(ModemTechnology::Gsm);
        let fields: Vec<i64> = gsm.sample().split(',').map(|v| v.parse().unwrap()).collect();
        assert_eq!(fields[0], 21);
        assert_eq!(fields[1], 0);
        assert_eq!(fields[7], i64::from(i32::MAX));
    }

    #[test]
    fn test_technology_mapping() {
        assert_eq!(ModemTechnology::Lte.access_technology(), 7);
        assert_eq!(ModemTechnology::Nr.access_technology(), 11);
        assert_eq!(ModemTechnology::Gsm.mask() | ModemTechnology::Nr.mask(), 0x41);
        assert_eq!(ModemTechnology::from_index(5), Some(ModemTechnology::Lte));
        assert_eq!(ModemTechnology::from_index(7), None);
    }

    #[test]
    fn test_operator_lookup() {
        assert_eq!(find_operator("310300").map(|op| op.short_name), Some("Alternative"));
        assert!(find_operator("hermetic").is_some_and(|op| op.forbidden));
        assert!(find_operator("00101").is_none());
    }
}
