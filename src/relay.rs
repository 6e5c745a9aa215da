//! Supervisor: configuration, signals and the reload loop
//!
//! SIGINT and SIGTERM stop the relay. SIGHUP stops the running role, reloads
//! the configuration and starts again.

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Args, Device, RelayConfig, Role};
use crate::error::{RelayError, RelayResult};
use crate::listener::Listener;
use crate::logging;
use crate::output::OutputTransport;
use crate::register_map::RegisterMap;
use crate::scheduler::{DeviceLine, Scheduler};

/// How one supervisor cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleEnd {
    Stopped,
    Reload,
}

/// Install the signal handlers. Stop signals cancel `stop`; SIGHUP is sent on `reload`.
fn spawn_signal_task(
    stop: CancellationToken,
    reload: mpsc::UnboundedSender<()>,
) -> RelayResult<JoinHandle<()>> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = interrupt.recv() => {
                    info!("SIGINT received, stopping");
                    stop.cancel();
                    break;
                }
                _ = terminate.recv() => {
                    info!("SIGTERM received, stopping");
                    stop.cancel();
                    break;
                }
                _ = hangup.recv() => {
                    info!("SIGHUP received, reloading configuration");
                    if reload.send(()).is_err() {
                        break;
                    }
                }
            }
        }
    }))
}

/// Run the relay until stopped
pub async fn run(args: Args) -> RelayResult<()> {
    let mut config = args.load()?;
    let stop = CancellationToken::new();
    let (reload_tx, mut reload_rx) = mpsc::unbounded_channel();
    let signals = spawn_signal_task(stop.clone(), reload_tx)?;

    let result = loop {
        logging::set_verbose(config.verbose)?;

        match run_cycle(&config, &stop, &mut reload_rx).await {
            Ok(CycleEnd::Stopped) => break Ok(()),
            Ok(CycleEnd::Reload) => match args.load() {
                Ok(reloaded) => config = reloaded,
                Err(e) => warn!("Keeping previous configuration: {}", e),
            },
            Err(e) => break Err(e),
        }
    };

    signals.abort();
    info!("Relay stopped");
    result
}

/// Run the configured role once, until a stop or a reload request
pub async fn run_cycle(
    config: &RelayConfig,
    stop: &CancellationToken,
    reload: &mut mpsc::UnboundedReceiver<()>,
) -> RelayResult<CycleEnd> {
    let cycle = stop.child_token();
    let role = run_role(config, &cycle);
    tokio::pin!(role);

    let mut reloading = false;
    loop {
        tokio::select! {
            result = &mut role => {
                result?;
                return Ok(if reloading && !stop.is_cancelled() {
                    CycleEnd::Reload
                } else {
                    CycleEnd::Stopped
                });
            }
            Some(()) = reload.recv(), if !reloading => {
                reloading = true;
                cycle.cancel();
            }
        }
    }
}

/// Build and run the poll or serve role until `token` is cancelled
pub async fn run_role(config: &RelayConfig, token: &CancellationToken) -> RelayResult<()> {
    let output = OutputTransport::new(&config.socket_file)
        .with_retry_delay(config.retry_delay)
        .with_send_timeout(config.response_timeout);

    match config.role {
        Role::Poll => {
            let line = open_line(config).await?;
            info!(
                "Polling {} targets, output to {}",
                config.targets.len(),
                config.socket_file.display()
            );
            let mut scheduler =
                Scheduler::new(config.targets.clone(), line, output, config.interval);
            let result = scheduler.run(token).await;
            scheduler.source_mut().close().await;
            scheduler.sink_mut().close();
            result
        }
        Role::Serve => {
            let Device::Tcp(addr) = config.device else {
                return Err(RelayError::config("Serve mode is only available over TCP"));
            };
            let map = RegisterMap::new(config.registers);
            let mut listener = Listener::bind(addr, map, output)
                .await?
                .with_reply_timeout(config.response_timeout);
            info!(
                "Running as unit {} on {}, output to {}",
                config.unit_id,
                listener.local_addr()?,
                config.socket_file.display()
            );
            let result = listener.run(token).await;
            if let Err(ref e) = result {
                error!("Listener failed: {}", e);
            }
            result
        }
    }
}

async fn open_line(config: &RelayConfig) -> RelayResult<DeviceLine> {
    match &config.device {
        Device::Tcp(addr) => {
            DeviceLine::open_tcp(*addr, &config.targets, config.response_timeout).await
        }
        #[cfg(feature = "rtu")]
        Device::Rtu(line) => DeviceLine::open_rtu(&line.settings(), config.response_timeout),
        #[cfg(not(feature = "rtu"))]
        Device::Rtu(line) => Err(RelayError::config(format!(
            "Cannot open {}: built without RTU support",
            line.port
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn serve_config(socket_file: PathBuf) -> RelayConfig {
        RelayConfig {
            role: Role::Serve,
            unit_id: 1,
            interval: Duration::from_secs(10),
            socket_file,
            registers: 8,
            retry_delay: Duration::from_millis(10),
            response_timeout: Duration::from_millis(500),
            verbose: false,
            device: Device::Tcp("127.0.0.1:0".parse().unwrap()),
            targets: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_cycle_stops() {
        let dir = tempfile::tempdir().unwrap();
        let config = serve_config(dir.path().join("out.sock"));
        let stop = CancellationToken::new();
        let (_tx, mut rx) = mpsc::unbounded_channel();

        let canceller = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let end = run_cycle(&config, &stop, &mut rx).await.unwrap();
        assert_eq!(end, CycleEnd::Stopped);
    }

    #[tokio::test]
    async fn test_cycle_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let config = serve_config(dir.path().join("out.sock"));
        let stop = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(()).unwrap();

        let end = run_cycle(&config, &stop, &mut rx).await.unwrap();
        assert_eq!(end, CycleEnd::Reload);
        assert!(!stop.is_cancelled());
    }

    #[tokio::test]
    async fn test_poll_without_device_fails() {
        let dir = tempfile::tempdir().unwrap();
        // Bind then drop to get a port nobody listens on
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        let mut config = serve_config(dir.path().join("out.sock"));
        config.role = Role::Poll;
        config.device = Device::Tcp(port);
        config.targets = vec![crate::scheduler::Target {
            id: 1,
            name: None,
            endpoint: None,
            specs: Vec::new(),
        }];

        let token = CancellationToken::new();
        assert!(run_role(&config, &token).await.is_err());
    }
}
