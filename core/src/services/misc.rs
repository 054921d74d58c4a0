//! Initialization no-ops, device identity and network time

use std::sync::Arc;

use chrono::{DateTime, Datelike, Local, Offset, TimeZone, Timelike, Utc};

use crate::channel::Client;
use crate::parser::CommandParser;
use crate::services::{CommandHandler, ModemContext, Service, OK};

pub const IMEI: &str = "867400022047199";
pub const SOFTWARE_VERSION: &str = "01";

pub struct MiscService {
    ctx: Arc<ModemContext>,
}

impl Service for MiscService {
    const NAME: &'static str = "misc";

    fn handlers() -> &'static [CommandHandler<Self>] {
        const HANDLERS: &[CommandHandler<MiscService>] = &[
            CommandHandler::full("", MiscService::handle_no_op),
            CommandHandler::full("E0Q0V1", MiscService::handle_no_op),
            CommandHandler::full("S0=0", MiscService::handle_no_op),
            CommandHandler::full("+CMEE=1", MiscService::handle_no_op),
            CommandHandler::full("+CMOD=0", MiscService::handle_no_op),
            CommandHandler::full("+COLP=0", MiscService::handle_no_op),
            CommandHandler::full("+CSCS=\"HEX\"", MiscService::handle_no_op),
            CommandHandler::full("+CMGF=0", MiscService::handle_no_op),
            CommandHandler::prefix("+CGSN", MiscService::handle_serial_number),
            CommandHandler::full("+REMOTETIMEUPDATE", MiscService::handle_remote_time_update),
        ];
        HANDLERS
    }
}

impl MiscService {
    pub fn new(ctx: Arc<ModemContext>) -> Self {
        Self { ctx }
    }

    fn handle_no_op(self: &Arc<Self>, client: &Arc<Client>, _command: &str) {
        client.send_line(OK);
    }

    /// `+CGSN[=<snt>]`: 0 serial number, 1 IMEI, 2 IMEISV, 3 SVN
    fn handle_serial_number(self: &Arc<Self>, client: &Arc<Client>, command: &str) {
        let mut cmd = CommandParser::new(command);
        cmd.skip_prefix();
        let snt = cmd.next_int();

        let imeisv = format!("{}{}", &IMEI[..IMEI.len() - 1], SOFTWARE_VERSION);
        let line = match snt {
            -1 => IMEI.to_string(),
            0 | 1 => format!("+CGSN: \"{}\"", IMEI),
            2 => format!("+CGSN: \"{}\"", imeisv),
            3 => format!("+CGSN: \"{}\"", SOFTWARE_VERSION),
            _ => {
                return client.send_line(&crate::error::CmeError::IncorrectParameters.to_string())
            }
        };
        client.send_lines([line.as_str(), OK]);
    }

    fn handle_remote_time_update(self: &Arc<Self>, _client: &Arc<Client>, _command: &str) {
        self.time_update();
    }

    /// Emit the network time and zone as `%CTZV`
    pub fn time_update(&self) {
        let now = Local::now();
        let line = format_time_update(
            &now.with_timezone(&Utc),
            now.offset().fix().local_minus_utc(),
            self.ctx.config.timezone.as_deref(),
        );
        self.ctx.send_unsolicited(&line);
    }
}

/// `%CTZV: yy/mm/dd:hh:mm:ss<±quarter hours>:<dst>[:<zone>]`, time in UTC
pub fn format_time_update<Tz: TimeZone>(
    utc: &DateTime<Tz>,
    offset_seconds: i32,
    zone: Option<&str>,
) -> String {
    let quarters = offset_seconds / (15 * 60);
    let mut line = format!(
        "%CTZV: {:02}/{:02}/{:02}:{:02}:{:02}:{:02}{}{}:0",
        utc.year() % 100,
        utc.month(),
        utc.day(),
        utc.hour(),
        utc.minute(),
        utc.second(),
        if quarters < 0 { '-' } else { '+' },
        quarters.abs()
    );
    if let Some(zone) = zone {
        line.push(':');
        line.push_str(zone);
    }
    line
}
