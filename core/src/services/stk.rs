//! SIM Toolkit menu navigation

use std::sync::{Arc, Mutex, MutexGuard};

use crate::channel::Client;
use crate::services::{CommandHandler, Link, ModemContext, Service, SimService, OK};

/// Proactive command type of SELECT ITEM
pub const COMMAND_SELECT_ITEM: &str = "24";

const RESULT_OK: &str = "00";
const RESULT_SESSION_TERMINATED: &str = "10";
const RESULT_BACKWARD_MOVE: &str = "11";
const RESULT_NO_RESPONSE: &str = "12";

pub struct StkService {
    ctx: Arc<ModemContext>,
    /// Menu ids from the setup menu down to the open SELECT ITEM
    stack: Mutex<Vec<u32>>,
    sim: Link<SimService>,
}

impl Service for StkService {
    const NAME: &'static str = "stk";

    fn handlers() -> &'static [CommandHandler<Self>] {
        const HANDLERS: &[CommandHandler<StkService>] = &[
            CommandHandler::full("+CUSATD?", StkService::handle_profile_download),
            CommandHandler::prefix("+CUSATE=", StkService::handle_envelope),
            CommandHandler::prefix("+CUSATT=", StkService::handle_terminal_response),
        ];
        HANDLERS
    }
}

/// Last two hex digits of an envelope or terminal response
fn trailing_code(command: &str) -> &str {
    let body = command
        .split_once('=')
        .map_or("", |(_, body)| body)
        .trim()
        .trim_matches('"');
    body.get(body.len().saturating_sub(2)..).unwrap_or("")
}

impl StkService {
    pub fn new(ctx: Arc<ModemContext>) -> Self {
        Self {
            ctx,
            stack: Mutex::new(Vec::new()),
            sim: Link::default(),
        }
    }

    pub fn setup_dependency(&self, sim: &Arc<SimService>) {
        self.sim.set(sim);
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u32>> {
        self.stack.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit_proactive(&self, text: &str) {
        self.ctx.send_unsolicited(&format!("+CUSATP: {}", text));
    }

    fn end_session(&self) {
        self.lock().clear();
        self.ctx.send_unsolicited("+CUSATEND");
    }

    /// Open the item `menu_id` under the current menu
    fn select(&self, menu_id: &str) {
        let Some(sim) = self.sim.get() else {
            return self.end_session();
        };
        let Ok(id) = u32::from_str_radix(menu_id, 16) else {
            log::warn!("STK: bad menu id {:?}", menu_id);
            return self.end_session();
        };

        let mut path = self.lock().clone();
        path.push(id);
        match sim.stk_item(&path) {
            Some(item) => {
                if item.command == COMMAND_SELECT_ITEM {
                    self.lock().push(id);
                }
                self.emit_proactive(&item.text);
            }
            None => {
                log::debug!("STK: no item at {:?}", path);
                self.end_session();
            }
        }
    }

    fn handle_profile_download(self: &Arc<Self>, client: &Arc<Client>, _command: &str) {
        client.send_lines(["+CUSATD: 0,1", OK]);
        self.lock().clear();
        match self.sim.get().and_then(|sim| sim.stk_setup_menu()) {
            Some(menu) => self.emit_proactive(&menu),
            None => log::debug!("STK: card has no setup menu"),
        }
    }

    /// `+CUSATE=<envelope>`: menu selection
    fn handle_envelope(self: &Arc<Self>, client: &Arc<Client>, command: &str) {
        self.select(trailing_code(command));
        client.send_lines(["+CUSATE: 0", OK]);
    }

    /// `+CUSATT=<terminal response>`
    fn handle_terminal_response(self: &Arc<Self>, client: &Arc<Client>, command: &str) {
        client.send_line(OK);

        let code = trailing_code(command).to_ascii_uppercase();
        match code.as_str() {
            RESULT_SESSION_TERMINATED | RESULT_NO_RESPONSE => self.end_session(),
            RESULT_BACKWARD_MOVE => {
                let path = {
                    let mut stack = self.lock();
                    stack.pop();
                    stack.clone()
                };
                self.reemit(&path);
            }
            RESULT_OK => {
                let path = self.lock().clone();
                self.reemit(&path);
            }
            other => self.select(other),
        }
    }

    /// Show the SELECT ITEM at `path` again; an empty path ends the session
    fn reemit(&self, path: &[u32]) {
        if path.is_empty() {
            return self.end_session();
        }
        match self.sim.get().and_then(|sim| sim.stk_item(path)) {
            Some(item) => self.emit_proactive(&item.text),
            None => self.end_session(),
        }
    }
}
