//! Telephony services and the command tables they dispatch from

use std::sync::{Arc, OnceLock, Weak};

use crate::channel::{ChannelMonitor, Client};
use crate::config::SimulatorConfig;
use crate::looper::Looper;
use crate::nvram::NvramStore;
use crate::parser::CommandParser;

pub mod call;
pub mod data;
pub mod misc;
pub mod network;
pub mod sim;
pub mod sms;
pub mod stk;
pub mod sup;

pub use call::CallService;
pub use data::DataService;
pub use misc::MiscService;
pub use network::NetworkService;
pub use sim::SimService;
pub use sms::SmsService;
pub use stk::StkService;
pub use sup::SupService;

pub const OK: &str = "OK";
pub const ERROR: &str = "ERROR";
pub const CONNECT: &str = "CONNECT";
pub const NO_CARRIER: &str = "NO CARRIER";
pub const PROMPT: &str = "> ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// Whole command (after `AT`) equals the key
    Full,
    /// Command starts with the key
    Prefix,
}

pub type Handler<S> = fn(&Arc<S>, &Arc<Client>, &str);

pub struct CommandHandler<S: 'static> {
    pub command: &'static str,
    pub match_mode: MatchMode,
    pub handler: Handler<S>,
}

impl<S> CommandHandler<S> {
    pub const fn full(command: &'static str, handler: Handler<S>) -> Self {
        Self {
            command,
            match_mode: MatchMode::Full,
            handler,
        }
    }

    pub const fn prefix(command: &'static str, handler: Handler<S>) -> Self {
        Self {
            command,
            match_mode: MatchMode::Prefix,
            handler,
        }
    }

    pub fn matches(&self, command: &str) -> bool {
        let body = strip_at(command);
        match self.match_mode {
            MatchMode::Full => body.eq_ignore_ascii_case(self.command),
            MatchMode::Prefix => body
                .get(..self.command.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(self.command)),
        }
    }
}

/// Command text after a leading `AT`
pub fn strip_at(command: &str) -> &str {
    CommandParser::new(command).skip_prefix_at().remaining()
}

/// A service answers the commands listed in its handler table.
pub trait Service: Send + Sync + Sized + 'static {
    const NAME: &'static str;

    fn handlers() -> &'static [CommandHandler<Self>];

    /// Run the first matching handler; false when none claims `command`
    fn handle(self: &Arc<Self>, client: &Arc<Client>, command: &str) -> bool {
        match Self::handlers().iter().find(|h| h.matches(command)) {
            Some(entry) => {
                log::debug!("{} handles {}", Self::NAME, command);
                (entry.handler)(self, client, command);
                true
            }
            None => false,
        }
    }
}

/// Everything a service shares with its siblings
pub struct ModemContext {
    pub config: SimulatorConfig,
    pub looper: Looper,
    pub monitor: Arc<ChannelMonitor>,
    pub nvram: Arc<NvramStore>,
}

impl ModemContext {
    pub fn instance_id(&self) -> usize {
        self.config.instance_id
    }

    pub fn host_port(&self) -> u16 {
        self.config.host_port
    }

    pub fn send_unsolicited(&self, line: &str) {
        self.monitor.send_unsolicited(line);
    }
}

/// Non-owning link to a sibling service, set once during wiring
pub struct Link<T>(OnceLock<Weak<T>>);

impl<T> Default for Link<T> {
    fn default() -> Self {
        Self(OnceLock::new())
    }
}

impl<T> Link<T> {
    pub fn set(&self, target: &Arc<T>) {
        if self.0.set(Arc::downgrade(target)).is_err() {
            log::warn!("service dependency wired twice, keeping the first");
        }
    }

    pub fn get(&self) -> Option<Arc<T>> {
        self.0.get().and_then(Weak::upgrade)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy;

    fn noop(_: &Arc<Dummy>, _: &Arc<Client>, _: &str) {}

    #[test]
    fn test_strip_at() {
        assert_eq!(strip_at("AT+CFUN=1"), "+CFUN=1");
        assert_eq!(strip_at("at+cfun?"), "+cfun?");
        assert_eq!(strip_at("AT"), "");
        assert_eq!(strip_at("+CMGS"), "+CMGS");
        assert_eq!(strip_at("A"), "A");
        assert_eq!(strip_at("Aé"), "Aé");
    }

    #[test]
    fn test_match_modes() {
        let full = CommandHandler::<Dummy>::full("+CPIN?", noop);
        assert!(full.matches("AT+CPIN?"));
        assert!(full.matches("at+cpin?"));
        assert!(!full.matches("AT+CPIN=1234"));

        let prefix = CommandHandler::<Dummy>::prefix("+CPIN=", noop);
        assert!(prefix.matches("AT+CPIN=1234"));
        assert!(!prefix.matches("AT+CPIN?"));
        assert!(!prefix.matches("AT+CPI"));

        let bare = CommandHandler::<Dummy>::full("", noop);
        assert!(bare.matches("AT"));
        assert!(!bare.matches("ATE0"));
    }

    fn table_commands<S: Service>() -> Vec<String> {
        S::handlers()
            .iter()
            .map(|h| format!("AT{}", h.command))
            .collect()
    }

    fn claims<S: Service>(command: &str) -> bool {
        S::handlers().iter().any(|h| h.matches(command))
    }

    #[test]
    fn test_each_command_has_one_owner() {
        let commands = [
            table_commands::<SimService>(),
            table_commands::<NetworkService>(),
            table_commands::<CallService>(),
            table_commands::<SmsService>(),
            table_commands::<DataService>(),
            table_commands::<SupService>(),
            table_commands::<StkService>(),
            table_commands::<MiscService>(),
        ]
        .concat();
        for command in &commands {
            let owners = [
                claims::<SimService>(command),
                claims::<NetworkService>(command),
                claims::<CallService>(command),
                claims::<SmsService>(command),
                claims::<DataService>(command),
                claims::<SupService>(command),
                claims::<StkService>(command),
                claims::<MiscService>(command),
            ]
            .into_iter()
            .filter(|claimed| *claimed)
            .count();
            assert_eq!(owners, 1, "{} is handled by {} services", command, owners);
        }
    }

    #[test]
    fn test_link_is_weak() {
        let link = Link::default();
        let target = Arc::new(5u32);
        link.set(&target);
        assert_eq!(link.get().as_deref(), Some(&5));
        drop(target);
        assert!(link.get().is_none());
    }
}
