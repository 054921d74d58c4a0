//! modem_simulator: one simulated modem per inherited listening socket
//!
//! The launcher passes pre-opened listening fds with `--server_fds`. Modem
//! `N` serves the `N`th fd. The process also listens on the abstract socket
//! `modem_simulator<host_port>`, where `STOP` saves state and exits and
//! `REM<N>` hands a peer simulator's connection to modem `N`.

use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{error, info, warn};

use modemsim_core::config::{load_timezone, DEFAULT_HOST_PORT, TIMEZONE_FILE};
use modemsim_core::peer::{monitor_socket_name, MonitorToken, TOKEN_LEN};
use modemsim_core::{DeviceConfig, ModemError, ModemSimulator, NvramStore, SimType, SimulatorConfig};

const EXIT_LISTEN_FAILURE: u8 = 2;
/// How long a monitor connection may take to send its token
const TOKEN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "modem_simulator")]
#[command(about = "Cellular modem simulator speaking AT commands over Unix sockets")]
struct Cli {
    /// Listening socket fds, one per modem instance
    #[arg(long = "server_fds", value_delimiter = ',', required = true)]
    server_fds: Vec<RawFd>,

    /// 1 for the normal profile, 2 for the carrier-API test profile
    #[arg(long = "sim_type", default_value_t = 1)]
    sim_type: u8,

    /// Port identifying this simulator to its peers
    #[arg(long = "host_port", default_value_t = DEFAULT_HOST_PORT)]
    host_port: u16,

    /// Directory holding the NVRAM file and ICC profiles
    #[arg(long = "instance_dir", default_value = ".")]
    instance_dir: PathBuf,

    #[arg(long = "ril_address", default_value = "10.0.2.15")]
    ril_address: String,

    #[arg(long = "ril_prefixlen", default_value_t = 24)]
    ril_prefixlen: u8,

    #[arg(long = "ril_gateway", default_value = "10.0.2.2")]
    ril_gateway: String,

    /// DNS servers handed out with PDP contexts
    #[arg(long = "ril_dns", value_delimiter = ',', default_value = "8.8.8.8")]
    ril_dns: Vec<String>,

    /// File holding the zone name reported in %CTZV
    #[arg(long = "timezone_file", default_value = TIMEZONE_FILE)]
    timezone_file: PathBuf,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("server fd {fd} is not usable: {source}")]
    ServerFd {
        fd: RawFd,
        #[source]
        source: ModemError,
    },

    #[error("cannot listen on monitor socket {name}: {source}")]
    MonitorSocket {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Modem(#[from] ModemError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl CliError {
    fn exit_code(&self) -> ExitCode {
        match self {
            CliError::ServerFd { .. } | CliError::MonitorSocket { .. } => {
                ExitCode::from(EXIT_LISTEN_FAILURE)
            }
            _ => ExitCode::FAILURE,
        }
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => {
            info!("simulator exited");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            e.exit_code()
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let sim_type = SimType::try_from(cli.sim_type)?;
    let device = DeviceConfig {
        ril_address: cli.ril_address.clone(),
        ril_prefixlen: cli.ril_prefixlen,
        ril_gateway: cli.ril_gateway.clone(),
        ril_dns: cli.ril_dns.clone(),
    };
    let timezone = load_timezone(&cli.timezone_file);
    let nvram = Arc::new(NvramStore::in_dir(&cli.instance_dir));

    let mut modems = Vec::with_capacity(cli.server_fds.len());
    for (instance_id, &fd) in cli.server_fds.iter().enumerate() {
        let listener = adopt_fd(fd).map_err(|source| CliError::ServerFd { fd, source })?;
        let config = SimulatorConfig::new(instance_id, &cli.instance_dir)
            .with_host_port(cli.host_port)
            .with_sim_type(sim_type)
            .with_device(device.clone())
            .with_timezone(timezone.clone());
        let modem = ModemSimulator::new(config, Arc::clone(&nvram), tokio::runtime::Handle::current())?;
        modem
            .serve(listener)
            .map_err(|source| CliError::ServerFd { fd, source })?;
        info!("modem {} serving fd {}", instance_id, fd);
        modems.push(modem);
    }

    let monitor = bind_monitor(cli.host_port)?;
    let result = tokio::select! {
        result = monitor_loop(&monitor, &nvram, &modems) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            save_state(&nvram, &modems);
            Ok(())
        }
    };

    for modem in &modems {
        modem.stop();
    }
    result
}

/// Take ownership of an inherited fd after checking that it is open
fn adopt_fd(fd: RawFd) -> modemsim_core::Result<OwnedFd> {
    // SAFETY: F_GETFD only inspects the descriptor table
    if unsafe { libc::fcntl(fd, libc::F_GETFD) } < 0 {
        return Err(io::Error::last_os_error().into());
    }
    // SAFETY: the fd is open and was handed to this process to own
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn bind_monitor(host_port: u16) -> Result<UnixListener, CliError> {
    let name = monitor_socket_name(host_port);
    let bind = || -> io::Result<UnixListener> {
        let addr = SocketAddr::from_abstract_name(&name)?;
        let listener = std::os::unix::net::UnixListener::bind_addr(&addr)?;
        listener.set_nonblocking(true)?;
        UnixListener::from_std(listener)
    };
    match bind() {
        Ok(listener) => {
            info!("parent monitor listening on @{}", name);
            Ok(listener)
        }
        Err(source) => Err(CliError::MonitorSocket { name, source }),
    }
}

/// Serve the parent monitor until a `STOP` arrives
async fn monitor_loop(
    listener: &UnixListener,
    nvram: &NvramStore,
    modems: &[Arc<ModemSimulator>],
) -> Result<(), CliError> {
    loop {
        let (mut stream, _) = listener.accept().await?;
        let token = match read_token(&mut stream).await {
            Ok(token) => token,
            Err(e) => {
                warn!("monitor connection without token: {}", e);
                continue;
            }
        };

        match token {
            MonitorToken::Stop => {
                info!("STOP requested");
                save_state(nvram, modems);
                stream.write_all(b"OK").await?;
                stream.flush().await?;
                return Ok(());
            }
            MonitorToken::Remote(id) => match modems.get(id) {
                Some(modem) => {
                    let stream = stream.into_std()?;
                    modem.set_remote_client(stream)?;
                    info!("peer connection handed to modem {}", id);
                }
                None => error!("REM{} names no modem, closing", id),
            },
            MonitorToken::Unknown(bytes) => {
                warn!("unknown monitor token {:?}", String::from_utf8_lossy(&bytes));
            }
        }
    }
}

async fn read_token(stream: &mut UnixStream) -> io::Result<MonitorToken> {
    let mut token = [0u8; TOKEN_LEN];
    tokio::time::timeout(TOKEN_TIMEOUT, stream.read_exact(&mut token))
        .await
        .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))??;
    Ok(MonitorToken::parse(&token))
}

fn save_state(nvram: &NvramStore, modems: &[Arc<ModemSimulator>]) {
    if let Err(e) = nvram.save() {
        warn!("failed to save NVRAM to {}: {}", nvram.path().display(), e);
    }
    for modem in modems {
        if let Err(e) = modem.save_modem_state() {
            warn!("failed to save modem {} state: {}", modem.instance_id(), e);
        }
    }
}
