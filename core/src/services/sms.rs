//! Short messages: submission, local loopback, peer relay and SIM storage

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::channel::Client;
use crate::error::{CmeError, CmsError};
use crate::looper::safe_callback;
use crate::parser::CommandParser;
use crate::pdu::SmsPdu;
use crate::peer::{remote_port, MonitorToken};
use crate::services::{CommandHandler, Link, ModemContext, Service, SimService, OK, PROMPT};

/// Delay before a looped-back message or status report is delivered
pub const DELIVERY_DELAY: Duration = Duration::from_secs(1);

pub const DEFAULT_SMSC: &str = "+15551230000";
const TOA_INTERNATIONAL: i32 = 145;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// `<stat>` given to `+CMGW`
    pub status: i32,
    pub pdu: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BroadcastConfig {
    mode: i32,
    message_ids: String,
    coding_schemes: String,
}

enum PendingBody {
    None,
    Submit,
    /// `+CMGW` body, with the status it will be stored under
    Store(i32),
}

struct SmsState {
    pending: PendingBody,
    message_reference: u8,
    next_index: u32,
    stored: BTreeMap<u32, StoredMessage>,
    broadcast: BroadcastConfig,
    smsc: (String, i32),
}

pub struct SmsService {
    ctx: Arc<ModemContext>,
    state: Mutex<SmsState>,
    sim: Link<SimService>,
}

impl Service for SmsService {
    const NAME: &'static str = "sms";

    fn handlers() -> &'static [CommandHandler<Self>] {
        const HANDLERS: &[CommandHandler<SmsService>] = &[
            CommandHandler::prefix("+CMGS=", SmsService::handle_send),
            CommandHandler::prefix("+CMGW=", SmsService::handle_write_to_sim),
            CommandHandler::prefix("+CMGD=", SmsService::handle_delete),
            CommandHandler::full("+CSCB?", SmsService::handle_query_broadcast),
            CommandHandler::prefix("+CSCB=", SmsService::handle_set_broadcast),
            CommandHandler::full("+CSCA?", SmsService::handle_query_smsc),
            CommandHandler::prefix("+CSCA=", SmsService::handle_set_smsc),
            CommandHandler::prefix("+CNMA", SmsService::handle_acknowledge),
            CommandHandler::prefix("+REMOTESMS=", SmsService::handle_remote_sms),
        ];
        HANDLERS
    }
}

impl SmsService {
    pub fn new(ctx: Arc<ModemContext>) -> Self {
        Self {
            ctx,
            state: Mutex::new(SmsState {
                pending: PendingBody::None,
                message_reference: 0,
                next_index: 1,
                stored: BTreeMap::new(),
                broadcast: BroadcastConfig {
                    mode: 0,
                    message_ids: String::new(),
                    coding_schemes: String::new(),
                },
                smsc: (DEFAULT_SMSC.to_string(), TOA_INTERNATIONAL),
            }),
            sim: Link::default(),
        }
    }

    pub fn setup_dependency(&self, sim: &Arc<SimService>) {
        self.sim.set(sim);
    }

    fn lock(&self) -> MutexGuard<'_, SmsState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Next line is the body of a `+CMGS`
    pub fn is_waiting_sms_pdu(&self) -> bool {
        matches!(self.lock().pending, PendingBody::Submit)
    }

    /// Next line is the body of a `+CMGW`
    pub fn is_waiting_sms_to_sim(&self) -> bool {
        matches!(self.lock().pending, PendingBody::Store(_))
    }

    /// Whether the channel should frame the next line up to Ctrl-Z
    pub fn is_waiting_pdu(&self) -> bool {
        !matches!(self.lock().pending, PendingBody::None)
    }

    pub fn stored_message(&self, index: u32) -> Option<StoredMessage> {
        self.lock().stored.get(&index).cloned()
    }

    fn handle_send(self: &Arc<Self>, client: &Arc<Client>, _command: &str) {
        self.lock().pending = PendingBody::Submit;
        client.send_line(PROMPT);
    }

    /// `+CMGW=<length>[,<stat>]`
    fn handle_write_to_sim(self: &Arc<Self>, client: &Arc<Client>, command: &str) {
        let mut cmd = CommandParser::new(command);
        cmd.skip_prefix();
        cmd.skip_comma();
        let status = cmd.next_int().max(0);
        self.lock().pending = PendingBody::Store(status);
        client.send_line(PROMPT);
    }

    /// Body of a `+CMGS`
    pub fn handle_sms_pdu(self: &Arc<Self>, client: &Arc<Client>, body: &str) {
        self.lock().pending = PendingBody::None;

        let pdu = match SmsPdu::decode(body) {
            Ok(pdu) if pdu.is_valid_pdu() => pdu,
            Ok(_) | Err(_) => {
                log::warn!("rejecting malformed SMS PDU {:?}", body);
                return client.send_line(&CmsError::InvalidPduModeParameter.to_string());
            }
        };

        let reference = {
            let mut state = self.lock();
            state.message_reference = state.message_reference.wrapping_add(1);
            state.message_reference
        };
        client.send_lines([format!("+CMGS: {}", reference).as_str(), OK]);

        let number = pdu.phone_number();
        match remote_port(&number, self.ctx.host_port()) {
            Some(port) => self.relay_to_peer(port, &pdu),
            None => {
                let own_number = self.sim.get().and_then(|sim| sim.msisdn());
                if own_number.as_deref() != Some(number.as_str()) {
                    log::debug!(
                        "SMS to {} has no peer route, delivering to {:?}",
                        number,
                        own_number
                    );
                }
                let deliver = pdu.create_deliver_pdu();
                let target = Arc::clone(client);
                self.ctx.looper.post_with_delay(
                    DELIVERY_DELAY,
                    safe_callback(self, move |_sms: &Arc<SmsService>| {
                        target.send_lines(["+CMT: 0", deliver.as_str()]);
                    }),
                );
            }
        }

        if pdu.status_report_requested() {
            let report = pdu.create_status_report(reference);
            let octets = match SmsPdu::decode(&report) {
                Ok(parsed) => parsed.tpdu_octets(),
                Err(e) => {
                    log::warn!("unusable status report {}: {}", report, e);
                    return;
                }
            };
            let target = Arc::clone(client);
            self.ctx.looper.post_with_delay(
                DELIVERY_DELAY,
                safe_callback(self, move |_sms: &Arc<SmsService>| {
                    target.send_lines([format!("+CDS: {}", octets).as_str(), report.as_str()]);
                }),
            );
        }
    }

    fn relay_to_peer(&self, port: u16, pdu: &SmsPdu) {
        let Some(remote) = pdu.create_remote_pdu(&self.ctx.host_port().to_string()) else {
            log::warn!("cannot rewrite SMS for peer {}", port);
            return;
        };
        let stream = match self.ctx.config.connector.connect(port) {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("failed to reach peer {} for SMS: {}", port, e);
                return;
            }
        };
        match self.ctx.monitor.set_remote_client(stream, false) {
            Ok(peer) => {
                log::info!("relaying SMS to peer {}", port);
                peer.send_raw(MonitorToken::remote(0));
                peer.send_line(&format!("AT+REMOTESMS={}", remote));
                peer.close();
            }
            Err(e) => log::warn!("failed to register peer {} connection: {}", port, e),
        }
    }

    /// Body of a `+CMGW`
    pub fn handle_sms_to_sim(self: &Arc<Self>, client: &Arc<Client>, body: &str) {
        let status = match std::mem::replace(&mut self.lock().pending, PendingBody::None) {
            PendingBody::Store(status) => status,
            _ => 0,
        };
        if SmsPdu::decode(body).is_err() {
            return client.send_line(&CmsError::InvalidPduModeParameter.to_string());
        }

        let index = {
            let mut state = self.lock();
            let index = state.next_index;
            state.next_index += 1;
            state.stored.insert(
                index,
                StoredMessage {
                    status,
                    pdu: body.to_string(),
                },
            );
            index
        };
        client.send_lines([format!("+CMGW: {}", index).as_str(), OK]);
    }

    fn handle_delete(self: &Arc<Self>, client: &Arc<Client>, command: &str) {
        let mut cmd = CommandParser::new(command);
        cmd.skip_prefix();
        let index = cmd.next_int();
        let removed = u32::try_from(index)
            .ok()
            .and_then(|index| self.lock().stored.remove(&index));
        match removed {
            Some(_) => client.send_line(OK),
            None => client.send_line(&CmeError::InvalidIndex.to_string()),
        }
    }

    fn handle_query_broadcast(self: &Arc<Self>, client: &Arc<Client>, _command: &str) {
        let broadcast = self.lock().broadcast.clone();
        let line = format!(
            "+CSCB: {},\"{}\",\"{}\"",
            broadcast.mode, broadcast.message_ids, broadcast.coding_schemes
        );
        client.send_lines([line.as_str(), OK]);
    }

    /// `+CSCB=<mode>[,<mids>[,<dcss>]]`
    fn handle_set_broadcast(self: &Arc<Self>, client: &Arc<Client>, command: &str) {
        let mut cmd = CommandParser::new(command);
        cmd.skip_prefix();
        let mode = cmd.next_int();
        if mode != 0 && mode != 1 {
            return client.send_line(&CmeError::IncorrectParameters.to_string());
        }
        let message_ids = cmd.next_str().to_string();
        let coding_schemes = cmd.next_str().to_string();
        self.lock().broadcast = BroadcastConfig {
            mode,
            message_ids,
            coding_schemes,
        };
        client.send_line(OK);
    }

    fn handle_query_smsc(self: &Arc<Self>, client: &Arc<Client>, _command: &str) {
        let (address, toa) = self.lock().smsc.clone();
        client.send_lines([format!("+CSCA: \"{}\",{}", address, toa).as_str(), OK]);
    }

    /// `+CSCA=<sca>[,<tosca>]`
    fn handle_set_smsc(self: &Arc<Self>, client: &Arc<Client>, command: &str) {
        let mut cmd = CommandParser::new(command);
        cmd.skip_prefix();
        let address = cmd.next_str().to_string();
        let toa = cmd.next_int();
        if address.is_empty() {
            return client.send_line(&CmeError::InvalidTextParameter.to_string());
        }
        let toa = if toa < 0 { TOA_INTERNATIONAL } else { toa };
        self.lock().smsc = (address, toa);
        client.send_line(OK);
    }

    fn handle_acknowledge(self: &Arc<Self>, client: &Arc<Client>, _command: &str) {
        client.send_line(OK);
    }

    /// `+REMOTESMS=<pdu>` from a peer simulator
    fn handle_remote_sms(self: &Arc<Self>, _client: &Arc<Client>, command: &str) {
        let mut cmd = CommandParser::new(command);
        cmd.skip_prefix();
        let body = cmd.remaining().trim();
        match SmsPdu::decode(body) {
            Ok(pdu) if pdu.is_valid_pdu() => {
                let deliver = pdu.create_deliver_pdu();
                log::info!("SMS from peer {}", pdu.phone_number());
                self.ctx.send_unsolicited("+CMT: 0");
                self.ctx.send_unsolicited(&deliver);
            }
            _ => log::warn!("dropping malformed SMS from peer: {:?}", body),
        }
    }
}
