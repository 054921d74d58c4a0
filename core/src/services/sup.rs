//! Supplementary services: USSD, CLIR, CLIP, call waiting and forwarding

use std::sync::{Arc, Mutex, MutexGuard};

use crate::channel::Client;
use crate::error::CmeError;
use crate::parser::CommandParser;
use crate::services::{CommandHandler, ModemContext, Service, OK};

const DEFAULT_SERVICE_CLASS: i32 = 7;
const TOA_UNKNOWN: i32 = 129;

/// `<reason>` of `+CCFCU`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardReason {
    Unconditional = 0,
    Busy = 1,
    NoReply = 2,
    NotReachable = 3,
}

static FORWARD_REASONS: [ForwardReason; 4] = [
    ForwardReason::Unconditional,
    ForwardReason::Busy,
    ForwardReason::NoReply,
    ForwardReason::NotReachable,
];

impl ForwardReason {
    /// Records addressed by a reason code; 4 is all, 5 all conditional
    fn expand(code: i32) -> Option<&'static [ForwardReason]> {
        match code {
            0..=3 => Some(&FORWARD_REASONS[code as usize..=code as usize]),
            4 => Some(&FORWARD_REASONS[..]),
            5 => Some(&FORWARD_REASONS[1..]),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallForwardInfo {
    pub enabled: bool,
    pub class: i32,
    pub number_type: i32,
    pub ton: i32,
    pub number: String,
    pub time: i32,
}

impl Default for CallForwardInfo {
    fn default() -> Self {
        Self {
            enabled: false,
            class: DEFAULT_SERVICE_CLASS,
            number_type: 1,
            ton: TOA_UNKNOWN,
            number: String::new(),
            time: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CallWaiting {
    enabled: bool,
    class: i32,
}

struct SupState {
    /// `<n>` and `<m>` of `+CLIR`
    clir: (i32, i32),
    clip_enabled: bool,
    forwarding: [CallForwardInfo; 4],
    waiting: CallWaiting,
}

pub struct SupService {
    ctx: Arc<ModemContext>,
    state: Mutex<SupState>,
}

impl Service for SupService {
    const NAME: &'static str = "sup";

    fn handlers() -> &'static [CommandHandler<Self>] {
        const HANDLERS: &[CommandHandler<SupService>] = &[
            CommandHandler::prefix("+CUSD=", SupService::handle_ussd),
            CommandHandler::full("+CLIR?", SupService::handle_query_clir),
            CommandHandler::prefix("+CLIR=", SupService::handle_set_clir),
            CommandHandler::prefix("+CCWA=", SupService::handle_call_waiting),
            CommandHandler::full("+CLIP?", SupService::handle_query_clip),
            CommandHandler::prefix("+CLIP=", SupService::handle_set_clip),
            CommandHandler::prefix("+CCFCU=", SupService::handle_call_forwarding),
            CommandHandler::prefix("+CSSN", SupService::handle_supplementary_notifications),
        ];
        HANDLERS
    }
}

impl SupService {
    pub fn new(ctx: Arc<ModemContext>) -> Self {
        Self {
            ctx,
            state: Mutex::new(SupState {
                clir: (0, 4),
                clip_enabled: true,
                forwarding: Default::default(),
                waiting: CallWaiting {
                    enabled: false,
                    class: DEFAULT_SERVICE_CLASS,
                },
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SupState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn forwarding(&self, reason: ForwardReason) -> CallForwardInfo {
        self.lock().forwarding[reason as usize].clone()
    }

    /// `+CUSD=<n>[,<str>[,<dcs>]]`; the network echoes the request back
    fn handle_ussd(self: &Arc<Self>, client: &Arc<Client>, command: &str) {
        let mut cmd = CommandParser::new(command);
        cmd.skip_prefix();
        cmd.skip_comma();
        let text = cmd.next_str().to_string();
        let dcs = cmd.next_int();
        client.send_line(OK);

        if !text.is_empty() {
            let dcs = if dcs < 0 { 0x0F } else { dcs };
            self.ctx
                .send_unsolicited(&format!("+CUSD: 0,\"{}\",{}", text, dcs));
        }
    }

    fn handle_query_clir(self: &Arc<Self>, client: &Arc<Client>, _command: &str) {
        let (n, m) = self.lock().clir;
        client.send_lines([format!("+CLIR: {},{}", n, m).as_str(), OK]);
    }

    fn handle_set_clir(self: &Arc<Self>, client: &Arc<Client>, command: &str) {
        let mut cmd = CommandParser::new(command);
        cmd.skip_prefix();
        let n = cmd.next_int();
        if !(0..=2).contains(&n) {
            return client.send_line(&CmeError::IncorrectParameters.to_string());
        }
        self.lock().clir.0 = n;
        client.send_line(OK);
    }

    /// `+CCWA=<n>,<mode>[,<class>]`
    fn handle_call_waiting(self: &Arc<Self>, client: &Arc<Client>, command: &str) {
        let mut cmd = CommandParser::new(command);
        cmd.skip_prefix();
        cmd.skip_comma();
        let mode = cmd.next_int();
        let class = cmd.next_int();

        let mut state = self.lock();
        match mode {
            0 | 1 => {
                state.waiting.enabled = mode == 1;
                if class > 0 {
                    state.waiting.class = class;
                }
                drop(state);
                client.send_line(OK);
            }
            2 => {
                let waiting = state.waiting;
                drop(state);
                let line = format!("+CCWA: {},{}", u8::from(waiting.enabled), waiting.class);
                client.send_lines([line.as_str(), OK]);
            }
            // Only changes the presentation of unsolicited results
            -1 => {
                drop(state);
                client.send_line(OK);
            }
            _ => {
                drop(state);
                client.send_line(&CmeError::IncorrectParameters.to_string());
            }
        }
    }

    fn handle_query_clip(self: &Arc<Self>, client: &Arc<Client>, _command: &str) {
        let enabled = self.lock().clip_enabled;
        client.send_lines([format!("+CLIP: {},1", u8::from(enabled)).as_str(), OK]);
    }

    fn handle_set_clip(self: &Arc<Self>, client: &Arc<Client>, command: &str) {
        let mut cmd = CommandParser::new(command);
        cmd.skip_prefix();
        match cmd.next_int() {
            n @ (0 | 1) => {
                self.lock().clip_enabled = n == 1;
                client.send_line(OK);
            }
            _ => client.send_line(&CmeError::IncorrectParameters.to_string()),
        }
    }

    /// `+CCFCU=<reason>,<mode>[,<numtype>,<ton>,<number>[,<class>[,<subaddr>,<satype>[,<time>]]]]`
    fn handle_call_forwarding(self: &Arc<Self>, client: &Arc<Client>, command: &str) {
        let mut cmd = CommandParser::new(command);
        cmd.skip_prefix();
        let reason = cmd.next_int();
        let mode = cmd.next_int();
        let number_type = cmd.next_int();
        let ton = cmd.next_int();
        let number = cmd.next_str().to_string();
        let class = cmd.next_int();
        let _subaddr = cmd.next_str();
        let _satype = cmd.next_int();
        let time = cmd.next_int();

        let Some(reasons) = ForwardReason::expand(reason) else {
            return client.send_line(&CmeError::IncorrectParameters.to_string());
        };

        let mut state = self.lock();
        match mode {
            // Disable keeps the number registered, erasure forgets it
            0 | 4 => {
                for reason in reasons {
                    let info = &mut state.forwarding[*reason as usize];
                    info.enabled = false;
                    if mode == 4 {
                        info.number.clear();
                    }
                }
                drop(state);
                client.send_line(OK);
            }
            1 | 3 => {
                if number.is_empty()
                    && reasons
                        .iter()
                        .any(|r| state.forwarding[*r as usize].number.is_empty())
                {
                    drop(state);
                    return client.send_line(&CmeError::IncorrectParameters.to_string());
                }
                for reason in reasons {
                    let info = &mut state.forwarding[*reason as usize];
                    info.enabled = true;
                    if !number.is_empty() {
                        info.number = number.clone();
                    }
                    if number_type >= 0 {
                        info.number_type = number_type;
                    }
                    if ton >= 0 {
                        info.ton = ton;
                    }
                    if class > 0 {
                        info.class = class;
                    }
                    if time > 0 {
                        info.time = time;
                    }
                }
                drop(state);
                client.send_line(OK);
            }
            2 => {
                let lines: Vec<String> = reasons
                    .iter()
                    .map(|r| {
                        let info = &state.forwarding[*r as usize];
                        if info.enabled {
                            format!(
                                "+CCFCU: 1,{},{},{},\"{}\"",
                                info.class, info.number_type, info.ton, info.number
                            )
                        } else {
                            format!("+CCFCU: 0,{}", info.class)
                        }
                    })
                    .collect();
                drop(state);
                client.send_lines(lines.iter().map(String::as_str).chain([OK]));
            }
            _ => {
                drop(state);
                client.send_line(&CmeError::IncorrectParameters.to_string());
            }
        }
    }

    fn handle_supplementary_notifications(self: &Arc<Self>, client: &Arc<Client>, _command: &str) {
        client.send_line(OK);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_reason_expansion() {
        assert_eq!(ForwardReason::expand(0), Some(&[ForwardReason::Unconditional][..]));
        assert_eq!(ForwardReason::expand(4).map(<[_]>::len), Some(4));
        assert_eq!(
            ForwardReason::expand(5),
            Some(
                &[
                    ForwardReason::Busy,
                    ForwardReason::NoReply,
                    ForwardReason::NotReachable
                ][..]
            )
        );
        assert_eq!(ForwardReason::expand(6), None);
        assert_eq!(ForwardReason::expand(-1), None);
    }
}
