//! AT channel multiplexer
//!
//! The monitor accepts connections on an inherited listening socket and runs
//! a reader and a writer task per client on the tokio runtime. Readers frame
//! commands (CR terminated, Ctrl-Z while an SMS body is expected) and hand
//! each one to the [`CommandDispatcher`], waiting for it to be handled before
//! framing the next so the terminator always reflects the current mode.
//! Writers drain a per-client queue, which keeps every response on one
//! connection in the order it was produced.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch, Notify};

use crate::error::Result;

/// Largest command (or pending fragment) accepted from a client
pub const MAX_COMMAND_LEN: usize = 4096;

/// Terminates an SMS PDU body
pub const CTRL_Z: u8 = 0x1A;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    /// Telephony stack of the local guest
    Ril,
    /// Another simulator instance
    Remote,
}

/// Item queued for a client's writer task
#[derive(Debug, PartialEq, Eq)]
pub enum Outgoing {
    Data(Vec<u8>),
    Close,
}

pub struct Client {
    id: u64,
    kind: ClientKind,
    tx: mpsc::UnboundedSender<Outgoing>,
    valid: AtomicBool,
    closed: Notify,
}

impl Client {
    fn new(kind: ClientKind, tx: mpsc::UnboundedSender<Outgoing>) -> Self {
        Self {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            tx,
            valid: AtomicBool::new(true),
            closed: Notify::new(),
        }
    }

    /// A client with no socket behind it; whatever it is sent lands in the
    /// returned receiver
    pub fn detached(kind: ClientKind) -> (Arc<Client>, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Client::new(kind, tx)), rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> ClientKind {
        self.kind
    }

    pub fn is_remote(&self) -> bool {
        self.kind == ClientKind::Remote
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Queue one line, adding the trailing CR when missing
    pub fn send_line(&self, line: &str) {
        log::debug!("client {} -> {}", self.id, line.trim_end());
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        if !line.ends_with('\r') {
            bytes.push(b'\r');
        }
        self.send_raw(bytes);
    }

    pub fn send_lines<I, S>(&self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for line in lines {
            self.send_line(line.as_ref());
        }
    }

    /// Queue bytes exactly as given
    pub fn send_raw(&self, bytes: impl Into<Vec<u8>>) {
        if !self.is_valid() {
            log::debug!("client {} closed, dropping write", self.id);
            return;
        }
        if self.tx.send(Outgoing::Data(bytes.into())).is_err() {
            log::debug!("client {} writer gone, dropping write", self.id);
        }
    }

    /// Flush queued writes, then close the connection
    pub fn close(&self) {
        if self.valid.swap(false, Ordering::AcqRel) {
            let _ = self.tx.send(Outgoing::Close);
            self.closed.notify_one();
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("valid", &self.is_valid())
            .finish()
    }
}

/// Receives framed commands and connection events from the monitor.
pub trait CommandDispatcher: Send + Sync + 'static {
    /// Handle `command`; `done` fires once it has been processed
    fn dispatch(&self, client: Arc<Client>, command: String, done: oneshot::Sender<()>);

    /// Whether the next line is an SMS body (Ctrl-Z terminated)
    fn is_waiting_pdu(&self) -> bool;

    fn on_first_client_connected(&self);

    fn on_client_closed(&self, client: &Arc<Client>);
}

#[derive(Default)]
struct ClientTable {
    ril: Vec<Arc<Client>>,
    remote: Vec<Arc<Client>>,
    /// Recipient of unsolicited lines
    unsolicited: Option<Arc<Client>>,
}

pub struct ChannelMonitor {
    runtime: Handle,
    dispatcher: Weak<dyn CommandDispatcher>,
    clients: Mutex<ClientTable>,
    shutdown: watch::Sender<bool>,
}

impl ChannelMonitor {
    pub fn new(runtime: Handle, dispatcher: Weak<dyn CommandDispatcher>) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            runtime,
            dispatcher,
            clients: Mutex::new(ClientTable::default()),
            shutdown,
        })
    }

    fn lock(&self) -> MutexGuard<'_, ClientTable> {
        self.clients.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start accepting RIL connections on an already-listening socket
    pub fn listen(self: &Arc<Self>, listener: OwnedFd) -> Result<()> {
        let listener = std::os::unix::net::UnixListener::from(listener);
        listener.set_nonblocking(true)?;
        let _guard = self.runtime.enter();
        let listener = UnixListener::from_std(listener)?;
        let shutdown = self.shutdown.subscribe();
        self.runtime
            .spawn(Arc::clone(self).accept_loop(listener, shutdown));
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: UnixListener, mut shutdown: watch::Receiver<bool>) {
        log::info!("accepting AT clients on fd {}", listener.as_raw_fd());
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => continue,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let client = self.attach(stream, ClientKind::Ril);
                        log::info!("RIL client {} connected", client.id());
                    }
                    Err(e) => {
                        log::warn!("accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
        log::info!("accept loop finished");
    }

    /// Register a connection to or from a peer simulator
    pub fn set_remote_client(
        self: &Arc<Self>,
        stream: std::os::unix::net::UnixStream,
        is_accepted: bool,
    ) -> io::Result<Arc<Client>> {
        stream.set_nonblocking(true)?;
        let _guard = self.runtime.enter();
        let stream = UnixStream::from_std(stream)?;
        let client = self.attach(stream, ClientKind::Remote);
        log::info!(
            "remote client {} registered ({})",
            client.id(),
            if is_accepted { "accepted" } else { "dialed" }
        );
        Ok(client)
    }

    fn attach(self: &Arc<Self>, stream: UnixStream, kind: ClientKind) -> Arc<Client> {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Arc::new(Client::new(kind, tx));
        let (reader, writer) = stream.into_split();
        self.runtime.spawn(write_loop(Arc::clone(&client), writer, rx));

        let first = self.register(&client);
        self.runtime
            .spawn(Arc::clone(self).read_loop(Arc::clone(&client), reader));
        if first {
            self.notify_first_client();
        }
        client
    }

    /// Register a client with no socket behind it; its output lands in the
    /// returned receiver. Commands are fed through the dispatcher directly.
    pub fn attach_detached(
        self: &Arc<Self>,
        kind: ClientKind,
    ) -> (Arc<Client>, mpsc::UnboundedReceiver<Outgoing>) {
        let (client, rx) = Client::detached(kind);
        if self.register(&client) {
            self.notify_first_client();
        }
        (client, rx)
    }

    /// Close and forget `client` as if its peer had hung up
    pub fn disconnect(&self, client: &Arc<Client>) {
        self.drop_client(client);
    }

    /// Add to the client table; true when it became the unsolicited target
    fn register(&self, client: &Arc<Client>) -> bool {
        let mut table = self.lock();
        match client.kind() {
            ClientKind::Ril => table.ril.push(Arc::clone(client)),
            ClientKind::Remote => table.remote.push(Arc::clone(client)),
        }
        if client.kind() == ClientKind::Ril && table.unsolicited.is_none() {
            table.unsolicited = Some(Arc::clone(client));
            true
        } else {
            false
        }
    }

    fn notify_first_client(&self) {
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.on_first_client_connected();
        }
    }

    async fn read_loop(self: Arc<Self>, client: Arc<Client>, mut reader: OwnedReadHalf) {
        let mut pending: Vec<u8> = Vec::new();
        // Set while skipping the rest of an overlong line
        let mut discarding = false;
        let mut buf = vec![0u8; MAX_COMMAND_LEN];
        loop {
            let read = tokio::select! {
                read = reader.read(&mut buf) => read,
                _ = client.closed.notified() => break,
            };
            match read {
                Ok(0) => {
                    log::debug!("client {} hung up", client.id());
                    break;
                }
                Ok(n) => {
                    pending.extend(buf[..n].iter().map(|&b| if b == b'\n' { b'\r' } else { b }));
                    if !self.drain_commands(&client, &mut pending, &mut discarding).await {
                        break;
                    }
                }
                Err(e) => {
                    log::warn!("read from client {} failed: {}", client.id(), e);
                    break;
                }
            }
        }
        self.drop_client(&client);
    }

    /// Dispatch every complete command in `pending`; false once the
    /// dispatcher has gone away. Lines of `MAX_COMMAND_LEN` bytes or more are
    /// dropped whole, even when they arrive over several reads.
    async fn drain_commands(
        &self,
        client: &Arc<Client>,
        pending: &mut Vec<u8>,
        discarding: &mut bool,
    ) -> bool {
        loop {
            let Some(dispatcher) = self.dispatcher.upgrade() else {
                return false;
            };
            let terminator = if dispatcher.is_waiting_pdu() { CTRL_Z } else { b'\r' };
            let Some(pos) = pending.iter().position(|&b| b == terminator) else {
                break;
            };

            let line: Vec<u8> = pending.drain(..=pos).collect();
            if std::mem::take(discarding) {
                log::debug!("client {} overlong line ended after {} more bytes", client.id(), pos);
                continue;
            }
            if pos >= MAX_COMMAND_LEN {
                log::warn!("client {} sent a {} byte command, discarding", client.id(), pos);
                continue;
            }
            let command = String::from_utf8_lossy(&line[..pos]).trim().to_string();
            if command.is_empty() {
                continue;
            }
            log::debug!("client {} <- {}", client.id(), command);

            let (done_tx, done_rx) = oneshot::channel();
            dispatcher.dispatch(Arc::clone(client), command, done_tx);
            drop(dispatcher);
            if done_rx.await.is_err() {
                log::debug!("dispatcher dropped command from client {}", client.id());
                return false;
            }
        }

        if pending.len() >= MAX_COMMAND_LEN {
            log::warn!(
                "client {} sent {} bytes without a terminator, discarding",
                client.id(),
                pending.len()
            );
            pending.clear();
            *discarding = true;
        }
        true
    }

    fn drop_client(&self, client: &Arc<Client>) {
        client.close();
        let promoted = {
            let mut table = self.lock();
            let before = table.ril.len() + table.remote.len();
            table.ril.retain(|c| !Arc::ptr_eq(c, client));
            table.remote.retain(|c| !Arc::ptr_eq(c, client));
            if before == table.ril.len() + table.remote.len() {
                // Already removed, e.g. by shutdown
                return;
            }
            let was_unsolicited = table
                .unsolicited
                .as_ref()
                .is_some_and(|c| Arc::ptr_eq(c, client));
            if was_unsolicited {
                table.unsolicited = table.ril.iter().find(|c| c.is_valid()).cloned();
                table.unsolicited.is_some()
            } else {
                false
            }
        };
        log::info!("client {} removed", client.id());

        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.on_client_closed(client);
            if promoted {
                dispatcher.on_first_client_connected();
            }
        }
    }

    /// Send a line to the designated RIL client
    pub fn send_unsolicited(&self, line: &str) {
        let target = self.lock().unsolicited.clone();
        match target {
            Some(client) => client.send_line(line),
            None => log::debug!("no RIL client, dropping unsolicited {}", line.trim_end()),
        }
    }

    pub fn ril_client_count(&self) -> usize {
        self.lock().ril.len()
    }

    pub fn remote_client_count(&self) -> usize {
        self.lock().remote.len()
    }

    /// Stop accepting and close every client
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let table = std::mem::take(&mut *self.lock());
        for client in table.ril.iter().chain(table.remote.iter()) {
            client.close();
        }
    }
}

async fn write_loop(client: Arc<Client>, mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Outgoing>) {
    while let Some(item) = rx.recv().await {
        match item {
            Outgoing::Data(bytes) => {
                if let Err(e) = writer.write_all(&bytes).await {
                    log::warn!("write to client {} failed: {}", client.id(), e);
                    break;
                }
            }
            Outgoing::Close => break,
        }
    }
    let _ = writer.shutdown().await;
    client.close();
}
