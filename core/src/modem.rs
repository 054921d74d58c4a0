//! One simulated modem: the services, their looper and the AT channel
//!
//! Commands framed by the [`ChannelMonitor`] are posted to the looper and
//! handled there one at a time, so every service sees a single-threaded
//! stream of commands and timer events.

use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Weak};

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

use crate::channel::{ChannelMonitor, Client, ClientKind, CommandDispatcher, Outgoing};
use crate::config::{SimType, SimulatorConfig};
use crate::error::{CmeError, Result};
use crate::icc::{IccProfile, CARRIER_TEST_PROFILE, DEFAULT_PROFILE};
use crate::looper::{safe_callback, Looper};
use crate::nvram::NvramStore;
use crate::services::{
    CallService, DataService, MiscService, ModemContext, NetworkService, Service, SimService,
    SmsService, StkService, SupService,
};

pub struct ModemSimulator {
    this: Weak<ModemSimulator>,
    ctx: Arc<ModemContext>,
    sim: Arc<SimService>,
    network: Arc<NetworkService>,
    call: Arc<CallService>,
    sms: Arc<SmsService>,
    data: Arc<DataService>,
    sup: Arc<SupService>,
    stk: Arc<StkService>,
    misc: Arc<MiscService>,
}

impl ModemSimulator {
    /// Build the services for `config`. The channel tasks run on `runtime`;
    /// nothing is accepted until [`serve`](Self::serve) is called.
    pub fn new(config: SimulatorConfig, nvram: Arc<NvramStore>, runtime: Handle) -> Result<Arc<Self>> {
        let looper = Looper::new(&format!("modem{}", config.instance_id))?;
        let default_xml = match config.sim_type {
            SimType::Normal => DEFAULT_PROFILE,
            SimType::CarrierTest => CARRIER_TEST_PROFILE,
        };
        let profile = IccProfile::load(config.icc_profile_path(), default_xml)?;
        log::info!(
            "modem {} on host port {} ({:?} SIM)",
            config.instance_id,
            config.host_port,
            config.sim_type
        );

        Ok(Arc::new_cyclic(|this: &Weak<ModemSimulator>| {
            let dispatcher: Weak<dyn CommandDispatcher> = this.clone();
            let monitor = ChannelMonitor::new(runtime, dispatcher);
            let ctx = Arc::new(ModemContext {
                config,
                looper,
                monitor,
                nvram,
            });

            let sim = Arc::new(SimService::new(Arc::clone(&ctx), profile));
            let network = Arc::new(NetworkService::new(Arc::clone(&ctx)));
            let call = Arc::new(CallService::new(Arc::clone(&ctx)));
            let sms = Arc::new(SmsService::new(Arc::clone(&ctx)));
            let data = Arc::new(DataService::new(Arc::clone(&ctx)));
            let sup = Arc::new(SupService::new(Arc::clone(&ctx)));
            let stk = Arc::new(StkService::new(Arc::clone(&ctx)));
            let misc = Arc::new(MiscService::new(Arc::clone(&ctx)));

            network.setup_dependency(&sim, &misc, &data);
            sim.setup_dependency(&network);
            call.setup_dependency(&sim, &network);
            stk.setup_dependency(&sim);
            sms.setup_dependency(&sim);
            data.setup_dependency(&network);

            Self {
                this: this.clone(),
                ctx,
                sim,
                network,
                call,
                sms,
                data,
                sup,
                stk,
                misc,
            }
        }))
    }

    pub fn instance_id(&self) -> usize {
        self.ctx.instance_id()
    }

    pub fn host_port(&self) -> u16 {
        self.ctx.host_port()
    }

    pub fn monitor(&self) -> &Arc<ChannelMonitor> {
        &self.ctx.monitor
    }

    pub fn sim(&self) -> &Arc<SimService> {
        &self.sim
    }

    pub fn network(&self) -> &Arc<NetworkService> {
        &self.network
    }

    pub fn call(&self) -> &Arc<CallService> {
        &self.call
    }

    pub fn sms(&self) -> &Arc<SmsService> {
        &self.sms
    }

    pub fn data(&self) -> &Arc<DataService> {
        &self.data
    }

    /// Events queued on the looper, timers included
    pub fn pending_events(&self) -> usize {
        self.ctx.looper.pending()
    }

    /// Accept RIL clients on an inherited listening socket
    pub fn serve(&self, listener: OwnedFd) -> Result<()> {
        self.ctx.monitor.listen(listener)
    }

    /// Hand over a connection accepted on behalf of a peer simulator
    pub fn set_remote_client(&self, stream: UnixStream) -> io::Result<Arc<Client>> {
        self.ctx.monitor.set_remote_client(stream, true)
    }

    /// Register a client with no socket; feed it with
    /// [`dispatch_blocking`](Self::dispatch_blocking)
    pub fn attach_client(&self, kind: ClientKind) -> (Arc<Client>, mpsc::UnboundedReceiver<Outgoing>) {
        self.ctx.monitor.attach_detached(kind)
    }

    pub fn disconnect(&self, client: &Arc<Client>) {
        self.ctx.monitor.disconnect(client);
    }

    /// Handle `command` on the looper and wait until it has been processed
    pub fn dispatch_blocking(self: &Arc<Self>, client: &Arc<Client>, command: &str) -> Result<()> {
        let this = Arc::clone(self);
        let client = Arc::clone(client);
        let command = command.to_string();
        self.ctx
            .looper
            .post_and_wait(move || this.dispatch_now(&client, &command))
    }

    /// Route one command; runs on the looper thread
    fn dispatch_now(&self, client: &Arc<Client>, command: &str) {
        if self.sms.is_waiting_sms_pdu() {
            return self.sms.handle_sms_pdu(client, command);
        }
        if self.sms.is_waiting_sms_to_sim() {
            return self.sms.handle_sms_to_sim(client, command);
        }

        let handled = self.sim.handle(client, command)
            || self.network.handle(client, command)
            || self.call.handle(client, command)
            || self.sms.handle(client, command)
            || self.data.handle(client, command)
            || self.sup.handle(client, command)
            || self.stk.handle(client, command)
            || self.misc.handle(client, command);
        if handled {
            return;
        }

        if client.is_remote() {
            log::debug!("ignoring unknown command {:?} from peer", command);
        } else {
            log::debug!("unsupported command {:?}", command);
            client.send_line(&CmeError::OperationNotSupported.to_string());
        }
    }

    /// Write PIN and facility-lock state back to the ICC document
    pub fn save_modem_state(&self) -> Result<()> {
        self.sim.save_state()
    }

    /// Close every client and stop the looper
    pub fn stop(&self) {
        log::info!("stopping modem {}", self.instance_id());
        self.ctx.monitor.shutdown();
        self.ctx.looper.stop();
    }
}

impl CommandDispatcher for ModemSimulator {
    fn dispatch(&self, client: Arc<Client>, command: String, done: oneshot::Sender<()>) {
        let this = self.this.clone();
        self.ctx.looper.post(move || {
            if let Some(modem) = this.upgrade() {
                modem.dispatch_now(&client, &command);
            }
            let _ = done.send(());
        });
    }

    fn is_waiting_pdu(&self) -> bool {
        self.sms.is_waiting_pdu()
    }

    fn on_first_client_connected(&self) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        self.ctx.looper.post(safe_callback(&this, |modem: &Arc<ModemSimulator>| {
            modem.misc.time_update();
            modem.network.report_registration();
        }));
    }

    fn on_client_closed(&self, client: &Arc<Client>) {
        if !client.is_remote() {
            return;
        }
        let client = Arc::clone(client);
        self.ctx.looper.post(safe_callback(&self.call, move |call: &Arc<CallService>| {
            call.on_remote_closed(&client)
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn modem() -> (tokio::runtime::Runtime, TempDir, Arc<ModemSimulator>) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let dir = TempDir::new().unwrap();
        let nvram = Arc::new(NvramStore::in_dir(dir.path()));
        let config = SimulatorConfig::new(0, dir.path());
        let modem = ModemSimulator::new(config, nvram, runtime.handle().clone()).unwrap();
        (runtime, dir, modem)
    }

    fn lines(rx: &mut mpsc::UnboundedReceiver<Outgoing>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(Outgoing::Data(bytes)) = rx.try_recv() {
            out.push(String::from_utf8_lossy(&bytes).trim_end_matches('\r').to_string());
        }
        out
    }

    #[test]
    fn test_unknown_command_is_unsupported_for_ril_only() {
        let (_runtime, _dir, modem) = modem();
        let (ril, mut ril_rx) = modem.attach_client(ClientKind::Ril);
        let (peer, mut peer_rx) = modem.attach_client(ClientKind::Remote);
        // Drain the first-client greeting
        modem.dispatch_blocking(&ril, "AT").unwrap();
        lines(&mut ril_rx);

        modem.dispatch_blocking(&ril, "AT+BOGUS").unwrap();
        assert_eq!(lines(&mut ril_rx), vec!["+CME ERROR: 4"]);

        modem.dispatch_blocking(&peer, "AT+BOGUS").unwrap();
        assert!(lines(&mut peer_rx).is_empty());
        modem.stop();
    }

    #[test]
    fn test_profile_written_on_first_start() {
        let (_runtime, dir, modem) = modem();
        assert!(dir.path().join("iccprofile_for_sim0.xml").exists());
        modem.save_modem_state().unwrap();
        modem.stop();
    }
}
