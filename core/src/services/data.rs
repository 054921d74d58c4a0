//! Packet data: PDP context definition, activation and dynamic parameters

use std::sync::{Arc, Mutex, MutexGuard};

use crate::channel::Client;
use crate::error::CmeError;
use crate::parser::CommandParser;
use crate::services::{CommandHandler, Link, ModemContext, NetworkService, Service, CONNECT, ERROR, OK};

pub const MAX_CONTEXT_ID: i32 = 15;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdpContext {
    pub cid: i32,
    pub pdp_type: String,
    pub apn: String,
    pub active: bool,
}

pub struct DataService {
    ctx: Arc<ModemContext>,
    contexts: Mutex<Vec<PdpContext>>,
    network: Link<NetworkService>,
}

impl Service for DataService {
    const NAME: &'static str = "data";

    fn handlers() -> &'static [CommandHandler<Self>] {
        const HANDLERS: &[CommandHandler<DataService>] = &[
            CommandHandler::full("+CGACT?", DataService::handle_query_activation),
            CommandHandler::prefix("+CGACT=", DataService::handle_activate),
            CommandHandler::full("+CGDCONT?", DataService::handle_query_contexts),
            CommandHandler::prefix("+CGDCONT=", DataService::handle_define_context),
            CommandHandler::prefix("+CGDATA=", DataService::handle_enter_data),
            CommandHandler::prefix("+CGCONTRDP", DataService::handle_read_dynamic_parameters),
        ];
        HANDLERS
    }
}

impl DataService {
    pub fn new(ctx: Arc<ModemContext>) -> Self {
        Self {
            ctx,
            contexts: Mutex::new(Vec::new()),
            network: Link::default(),
        }
    }

    pub fn setup_dependency(&self, network: &Arc<NetworkService>) {
        self.network.set(network);
    }

    fn lock(&self) -> MutexGuard<'_, Vec<PdpContext>> {
        self.contexts.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn contexts(&self) -> Vec<PdpContext> {
        self.lock().clone()
    }

    /// Drop every active context, e.g. when the radio goes off
    pub fn deactivate_all(&self) {
        let mut contexts = self.lock();
        for context in contexts.iter_mut().filter(|c| c.active) {
            log::info!("deactivating PDP context {}", context.cid);
            context.active = false;
        }
    }

    fn data_registered(&self) -> bool {
        self.network
            .get()
            .is_some_and(|network| network.data_state().is_registered())
    }

    fn handle_query_activation(self: &Arc<Self>, client: &Arc<Client>, _command: &str) {
        let lines: Vec<String> = self
            .lock()
            .iter()
            .map(|c| format!("+CGACT: {},{}", c.cid, u8::from(c.active)))
            .collect();
        client.send_lines(lines.iter().map(String::as_str).chain([OK]));
    }

    /// `+CGACT=<state>[,<cid>[,<cid>...]]`
    fn handle_activate(self: &Arc<Self>, client: &Arc<Client>, command: &str) {
        let mut cmd = CommandParser::new(command);
        cmd.skip_prefix();
        let state = cmd.next_int();
        if state != 0 && state != 1 {
            return client.send_line(&CmeError::IncorrectParameters.to_string());
        }
        let mut cids = Vec::new();
        while !cmd.is_empty() {
            let cid = cmd.next_int();
            if cid > 0 {
                cids.push(cid);
            }
        }

        if state == 1 && !self.data_registered() {
            return client.send_line(&CmeError::NoNetworkService.to_string());
        }

        let mut contexts = self.lock();
        if cids.iter().any(|cid| !contexts.iter().any(|c| c.cid == *cid)) {
            drop(contexts);
            return client.send_line(&CmeError::InvalidIndex.to_string());
        }
        for context in contexts
            .iter_mut()
            .filter(|c| cids.is_empty() || cids.contains(&c.cid))
        {
            context.active = state == 1;
            log::info!(
                "PDP context {} {}",
                context.cid,
                if context.active { "activated" } else { "deactivated" }
            );
        }
        drop(contexts);
        client.send_line(OK);
    }

    fn handle_query_contexts(self: &Arc<Self>, client: &Arc<Client>, _command: &str) {
        let lines: Vec<String> = self
            .lock()
            .iter()
            .map(|c| {
                format!(
                    "+CGDCONT: {},\"{}\",\"{}\",\"{}\",0,0",
                    c.cid,
                    c.pdp_type,
                    c.apn,
                    if c.active { self.ctx.config.device.ril_address.as_str() } else { "" }
                )
            })
            .collect();
        client.send_lines(lines.iter().map(String::as_str).chain([OK]));
    }

    /// `+CGDCONT=<cid>[,<type>,<apn>,...]`; a bare `<cid>` removes the context
    fn handle_define_context(self: &Arc<Self>, client: &Arc<Client>, command: &str) {
        let mut cmd = CommandParser::new(command);
        cmd.skip_prefix();
        let cid = cmd.next_int();
        if !(1..=MAX_CONTEXT_ID).contains(&cid) {
            return client.send_line(&CmeError::IncorrectParameters.to_string());
        }
        let pdp_type = cmd.next_str().to_string();
        let apn = cmd.next_str().to_string();

        let mut contexts = self.lock();
        if pdp_type.is_empty() {
            contexts.retain(|c| c.cid != cid);
            drop(contexts);
            return client.send_line(OK);
        }

        match contexts.iter_mut().find(|c| c.cid == cid) {
            Some(context) => {
                context.pdp_type = pdp_type;
                context.apn = apn;
            }
            None => {
                contexts.push(PdpContext {
                    cid,
                    pdp_type,
                    apn,
                    active: false,
                });
                contexts.sort_by_key(|c| c.cid);
            }
        }
        drop(contexts);
        client.send_line(OK);
    }

    /// `+CGDATA=<L2P>,<cid>`
    fn handle_enter_data(self: &Arc<Self>, client: &Arc<Client>, command: &str) {
        let mut cmd = CommandParser::new(command);
        cmd.skip_prefix();
        let _l2p = cmd.next_str();
        let cid = cmd.next_int();

        let active = self.lock().iter().any(|c| c.cid == cid && c.active);
        client.send_line(if active { CONNECT } else { ERROR });
    }

    /// `+CGCONTRDP[=<cid>]`
    fn handle_read_dynamic_parameters(self: &Arc<Self>, client: &Arc<Client>, command: &str) {
        let mut cmd = CommandParser::new(command);
        cmd.skip_prefix();
        let cid = cmd.next_int();

        let device = &self.ctx.config.device;
        let netmask = device.netmask();
        let dns = device
            .ril_dns
            .iter()
            .map(|server| format!("\"{}\"", server))
            .collect::<Vec<_>>()
            .join(",");

        let lines: Vec<String> = self
            .lock()
            .iter()
            .filter(|c| c.active && (cid < 0 || c.cid == cid))
            .map(|c| {
                let mut line = format!(
                    "+CGCONTRDP: {},5,\"{}\",\"{}.{}\",\"{}\"",
                    c.cid, c.apn, device.ril_address, netmask, device.ril_gateway
                );
                if !dns.is_empty() {
                    line.push(',');
                    line.push_str(&dns);
                }
                line
            })
            .collect();
        if lines.is_empty() && cid >= 0 {
            return client.send_line(&CmeError::InvalidIndex.to_string());
        }
        client.send_lines(lines.iter().map(String::as_str).chain([OK]));
    }
}
