use crate::config::ProbeConfig;
use crate::state::{ErrorThrottle, ProbeRunResult, ProbeState};
use crate::stats::{EventMetrics, StatsKeeper};
use crate::targets::{Endpoint, TargetProvider};
use crate::transport::{self, MAX_MSG_SIZE, TransportError};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const PROBE_TYPE: &str = "udp";
const MIN_RESULTS_CHANNEL_LEN: usize = 10;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Datagram copy handed from the receive loop to the echo loop.
#[derive(Debug)]
struct EchoMsg {
    addr: SocketAddr,
    buf: Bytes,
}

/// Output tick: half the export interval (rounded to the send interval) when
/// a window spans several packets, otherwise the send interval itself.
pub fn output_tick(interval: Duration, export_interval: Duration) -> Duration {
    let pkts_per_export = export_interval.as_nanos() / interval.as_nanos().max(1);
    if pkts_per_export <= 1 {
        return interval;
    }
    round_to(export_interval / 2, interval)
}

fn round_to(d: Duration, m: Duration) -> Duration {
    let (d_ns, m_ns) = (d.as_nanos(), m.as_nanos());
    if m_ns == 0 {
        return d;
    }
    let r = d_ns % m_ns;
    let rounded = if r + r < m_ns {
        d_ns - r
    } else {
        d_ns + (m_ns - r)
    };
    Duration::from_nanos(rounded as u64)
}

/// Packets each sender should have sent in `elapsed`: the number of send
/// intervals, rounded to nearest, times packets per interval.
pub fn expected_count(elapsed: Duration, interval: Duration, packets_per_probe: u32) -> u64 {
    let round_add = (interval / 2).saturating_sub(Duration::from_nanos(1));
    let intervals = (elapsed + round_add).as_nanos() / interval.as_nanos().max(1);
    intervals as u64 * packets_per_probe as u64
}

#[derive(Clone)]
pub struct Probe {
    config: ProbeConfig,
    socket: Arc<UdpSocket>,
    state: Arc<Mutex<ProbeState>>,
    throttle: Arc<ErrorThrottle>,
    targets: Arc<dyn TargetProvider>,
}

impl Probe {
    /// Binds the listening socket. Bind failures abort initialization.
    pub fn init(config: ProbeConfig, targets: Arc<dyn TargetProvider>) -> Result<Self, ProbeError> {
        let socket = transport::listen(config.source_ip, config.port).inspect_err(|e| {
            warn!("Opening a listen UDP socket on port {} failed: {}", config.port, e);
        })?;

        Ok(Self {
            state: Arc::new(Mutex::new(ProbeState::new(config.max_sources()))),
            throttle: Arc::new(ErrorThrottle::new(config.log_throttle_threshold)),
            socket: Arc::new(socket),
            targets,
            config,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Runs the probe until `cancel` fires. Records go to `sink`.
    pub async fn start(self, cancel: CancellationToken, sink: mpsc::Sender<EventMetrics>) {
        let endpoints = self.refresh_targets();
        self.state.lock().await.reset_targets(&endpoints);

        let results_len = endpoints.len().max(MIN_RESULTS_CHANNEL_LEN);
        let (results_tx, results_rx) = mpsc::channel(results_len);
        let (targets_tx, targets_rx) = watch::channel(endpoints);

        let keeper = StatsKeeper::new(
            PROBE_TYPE,
            &self.config.name,
            self.config.additional_labels.clone(),
            self.config.stats_export_interval(),
        );
        let keeper_handle = tokio::spawn(keeper.run(results_rx, targets_rx, sink, cancel.clone()));

        info!(
            probe = %self.config.name,
            "Listening on {:?} (echo: {})",
            self.local_addr(),
            self.config.echo_mode()
        );

        self.probe_loop(cancel, results_tx, targets_tx).await;

        if let Err(e) = keeper_handle.await {
            error!("Stats keeper task failed: {}", e);
        }
        info!(probe = %self.config.name, "Probe stopped");
    }

    async fn probe_loop(
        &self,
        cancel: CancellationToken,
        results_tx: mpsc::Sender<ProbeRunResult>,
        targets_tx: watch::Sender<Vec<Endpoint>>,
    ) {
        // 1. Output loop
        let output = {
            let p = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { p.output_loop(cancel, results_tx, targets_tx).await })
        };

        // 2. Echo loop, echo mode only
        let mut echo = None;
        let mut echo_tx = None;
        if self.config.echo_mode() {
            let (tx, rx) = mpsc::channel(self.config.max_targets);
            let socket = self.socket.clone();
            let cancel = cancel.clone();
            echo = Some(tokio::spawn(echo_loop(socket, rx, cancel)));
            echo_tx = Some(tx);
        }

        // 3. Receive loop owns this task until shutdown
        self.recv_loop(cancel, echo_tx).await;

        if let Err(e) = output.await {
            error!("Output loop task failed: {}", e);
        }
        if let Some(h) = echo {
            if let Err(e) = h.await {
                error!("Echo loop task failed: {}", e);
            }
        }
    }

    fn refresh_targets(&self) -> Vec<Endpoint> {
        let endpoints = self.targets.list_endpoints();
        if self.config.echo_mode() && endpoints.len() > self.config.max_targets {
            warn!(
                "too many targets (got {} > max {}), responses might be slow.",
                endpoints.len(),
                self.config.max_targets
            );
        }
        endpoints
    }

    async fn recv_loop(&self, cancel: CancellationToken, echo_tx: Option<mpsc::Sender<EchoMsg>>) {
        let mut buf = vec![0u8; MAX_MSG_SIZE];
        let deadline = self.config.read_deadline();

        while !cancel.is_cancelled() {
            let (n, src_addr) =
                match tokio::time::timeout(deadline, self.socket.recv_from(&mut buf)).await {
                    Ok(Ok(r)) => r,
                    Ok(Err(e)) => {
                        debug!("Error receiving on UDP socket: {}", e);
                        continue;
                    }
                    // Deadline hit, go check for cancellation
                    Err(_) => continue,
                };
            let rx_ts = Instant::now();
            let packet = &buf[..n];

            if let Some(tx) = &echo_tx {
                let msg = EchoMsg {
                    addr: src_addr,
                    buf: Bytes::copy_from_slice(packet),
                };
                if let Err(TrySendError::Full(m)) = tx.try_send(msg) {
                    debug!("Echo queue full, not echoing {} bytes to {}", m.buf.len(), m.addr);
                }
            }

            let outcome = self
                .state
                .lock()
                .await
                .process_message(packet, rx_ts, src_addr);

            if outcome.is_error() && self.throttle.note_error() {
                self.state.lock().await.flush_errors(&self.config.name);
            }
        }
        debug!("Receive loop stopped");
    }

    async fn output_loop(
        &self,
        cancel: CancellationToken,
        results_tx: mpsc::Sender<ProbeRunResult>,
        targets_tx: watch::Sender<Vec<Endpoint>>,
    ) {
        let interval = self.config.interval();
        let tick = output_tick(interval, self.config.stats_export_interval());
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + tick, tick);
        let mut last_export = Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let expected = expected_count(
                        last_export.elapsed(),
                        interval,
                        self.config.packets_per_probe,
                    );
                    let endpoints = self.refresh_targets();

                    let snapshots = {
                        let mut state = self.state.lock().await;
                        let snapshots = state.output_results(expected, &endpoints);
                        state.flush_errors(&self.config.name);
                        snapshots
                    };
                    self.throttle.rearm();
                    targets_tx.send_replace(endpoints);

                    for s in snapshots {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            res = results_tx.send(s) => {
                                if res.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    last_export = Instant::now();
                }
            }
        }
        debug!("Output loop stopped");
    }
}

async fn echo_loop(
    socket: Arc<UdpSocket>,
    mut rx: mpsc::Receiver<EchoMsg>,
    cancel: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            m = rx.recv() => match m {
                Some(m) => m,
                None => break,
            },
        };

        match socket.send_to(&msg.buf, msg.addr).await {
            Ok(n) if n < msg.buf.len() => {
                warn!(
                    "Reply truncated: sent {} out of {} bytes to {}.",
                    n,
                    msg.buf.len(),
                    msg.addr
                );
            }
            Ok(_) => {}
            Err(e) if transport::is_socket_closed(&e) => {
                info!("Echo socket closed: {}", e);
                break;
            }
            Err(e) => error!("Error writing echo response to {}: {}", msg.addr, e),
        }
    }
    debug!("Echo loop stopped");
}
