#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use modemsim_core::peer::{read_token, MonitorToken};
use modemsim_core::{
    Client, ClientKind, ModemSimulator, NvramStore, Outgoing, PeerConnector, SimulatorConfig,
};
use tempfile::TempDir;
use tokio::runtime::Runtime;
use tokio::sync::mpsc::UnboundedReceiver;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A modem with its own runtime and instance directory
pub struct TestModem {
    pub modem: Arc<ModemSimulator>,
    pub runtime: Runtime,
    pub dir: TempDir,
    configure: fn(SimulatorConfig) -> SimulatorConfig,
}

impl TestModem {
    pub fn start() -> Self {
        Self::start_with(|config| config)
    }

    pub fn start_with(configure: fn(SimulatorConfig) -> SimulatorConfig) -> Self {
        init_logging();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("Failed to build runtime");
        let dir = TempDir::new().expect("Failed to create instance dir");
        let modem = Self::build(&runtime, &dir, configure(SimulatorConfig::new(0, dir.path())));
        Self {
            modem,
            runtime,
            dir,
            configure,
        }
    }

    /// Modem with the given host port whose peer calls go through `peers`
    pub fn start_peer(port: u16, peers: &PeerRegistry) -> Self {
        init_logging();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("Failed to build runtime");
        let dir = TempDir::new().expect("Failed to create instance dir");
        let config = SimulatorConfig::new(0, dir.path())
            .with_host_port(port)
            .with_connector(Arc::new(peers.clone()));
        let modem = Self::build(&runtime, &dir, config);
        peers.register(&modem);
        Self {
            modem,
            runtime,
            dir,
            configure: |config| config,
        }
    }

    fn build(runtime: &Runtime, dir: &TempDir, config: SimulatorConfig) -> Arc<ModemSimulator> {
        let nvram = Arc::new(NvramStore::in_dir(dir.path()));
        ModemSimulator::new(config, nvram, runtime.handle().clone()).expect("Failed to create modem")
    }

    /// Save state, stop, and boot a fresh modem from the same directory
    pub fn restart(&mut self) {
        self.modem.save_modem_state().expect("Failed to save modem state");
        self.modem.stop();
        let config = (self.configure)(SimulatorConfig::new(0, self.dir.path()));
        self.modem = Self::build(&self.runtime, &self.dir, config);
    }

    /// Attach a RIL client and swallow the greeting it gets as first client
    pub fn ril(&self) -> TestClient {
        let (client, rx) = self.modem.attach_client(ClientKind::Ril);
        let mut ril = TestClient::new(client, rx);
        self.send(&mut ril, "AT");
        ril
    }

    /// Run one command to completion and return the lines it produced
    pub fn send(&self, client: &mut TestClient, command: &str) -> Vec<String> {
        self.modem
            .dispatch_blocking(&client.client, command)
            .expect("Looper stopped");
        client.lines()
    }

    /// Power the radio on and wait for home registration
    pub fn register(&self, ril: &mut TestClient) {
        assert_eq!(self.send(ril, "AT+CFUN=1"), vec!["OK"]);
        ril.wait_for("+CREG: 1,1");
    }
}

impl Drop for TestModem {
    fn drop(&mut self) {
        self.modem.stop();
    }
}

pub struct TestClient {
    pub client: Arc<Client>,
    rx: UnboundedReceiver<Outgoing>,
    /// Lines received but not yet consumed by `wait_for`
    backlog: VecDeque<String>,
}

impl TestClient {
    pub fn new(client: Arc<Client>, rx: UnboundedReceiver<Outgoing>) -> Self {
        Self {
            client,
            rx,
            backlog: VecDeque::new(),
        }
    }

    /// Lines queued so far, without their CR
    pub fn lines(&mut self) -> Vec<String> {
        let mut out: Vec<String> = self.backlog.drain(..).collect();
        while let Ok(item) = self.rx.try_recv() {
            if let Outgoing::Data(bytes) = item {
                out.extend(split_lines(&bytes));
            }
        }
        out
    }

    /// Collect lines until one starts with `prefix`; returns everything
    /// collected, the match last. Later lines stay queued.
    pub fn wait_for(&mut self, prefix: &str) -> Vec<String> {
        let deadline = Instant::now() + WAIT;
        let mut seen = Vec::new();
        loop {
            let mut batch = self.lines().into_iter();
            while let Some(line) = batch.next() {
                let done = line.starts_with(prefix);
                seen.push(line);
                if done {
                    self.backlog.extend(batch);
                    return seen;
                }
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {:?}, saw {:?}",
                prefix,
                seen
            );
            thread::sleep(Duration::from_millis(20));
        }
    }

    /// Line following the one that starts with `prefix`
    pub fn line_after(&mut self, prefix: &str) -> String {
        self.wait_for(prefix);
        self.next_line()
    }

    /// Next line to arrive, waiting for it if none is queued
    pub fn next_line(&mut self) -> String {
        let deadline = Instant::now() + WAIT;
        loop {
            let mut batch = self.lines().into_iter();
            if let Some(line) = batch.next() {
                self.backlog.extend(batch);
                return line;
            }
            assert!(Instant::now() < deadline, "no further line arrived");
            thread::sleep(Duration::from_millis(20));
        }
    }
}

pub fn split_lines(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .split('\r')
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Poll `condition` until it holds
pub fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(20));
    }
}

/// In-process stand-in for the parent monitor: hands the far end of a
/// socket pair to the modem registered for the dialed port
#[derive(Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<Mutex<HashMap<u16, Weak<ModemSimulator>>>>,
}

impl PeerRegistry {
    pub fn register(&self, modem: &Arc<ModemSimulator>) {
        self.peers
            .lock()
            .unwrap()
            .insert(modem.host_port(), Arc::downgrade(modem));
    }
}

impl PeerConnector for PeerRegistry {
    fn connect(&self, port: u16) -> io::Result<UnixStream> {
        let peer = self
            .peers
            .lock()
            .unwrap()
            .get(&port)
            .and_then(Weak::upgrade)
            .ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionRefused))?;
        let (ours, mut theirs) = UnixStream::pair()?;
        thread::spawn(move || match read_token(&mut theirs) {
            Ok(MonitorToken::Remote(0)) => {
                peer.set_remote_client(theirs).expect("Failed to hand over peer socket");
            }
            other => panic!("unexpected peer token {:?}", other),
        });
        Ok(ours)
    }
}
