use rosc::{OscMessage, OscPacket, OscType};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::playback::{PlaybackHandle, PlaybackStatus, SyncAction};

/// OSC address external players report their position on.
pub const REPORT_ADDR: &str = "/playback";
/// OSC address the reconciled position is acknowledged on.
pub const ACK_ADDR: &str = "/playback/ack";

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Binding Error: {0}")]
    Binding(String),
    #[error("Invalid OSC packet: {0}")]
    Decode(String),
    #[error("Could not encode OSC packet: {0}")]
    Encode(String),
    #[error("Unexpected OSC address: {0}")]
    UnexpectedAddress(String),
    #[error("Malformed playback report: {0}")]
    MalformedReport(String),
}

/// `{is_playing, current_time}` as exchanged with the external player.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct PlaybackReport {
    pub is_playing: bool,
    pub current_time: f64,
}

impl From<PlaybackStatus> for PlaybackReport {
    fn from(status: PlaybackStatus) -> Self {
        Self {
            is_playing: status.is_playing(),
            current_time: status.current_time,
        }
    }
}

impl PlaybackReport {
    /// Reads a report from `/playback [playing, time]`. The flag may be an
    /// OSC bool or an integer, the time any numeric type.
    pub fn from_message(message: &OscMessage) -> Result<Self, SyncError> {
        if message.addr != REPORT_ADDR {
            return Err(SyncError::UnexpectedAddress(message.addr.clone()));
        }
        let is_playing = match message.args.first() {
            Some(OscType::Bool(b)) => *b,
            Some(OscType::Int(i)) => *i != 0,
            Some(OscType::Long(l)) => *l != 0,
            other => {
                return Err(SyncError::MalformedReport(format!(
                    "expected playing flag, got {other:?}"
                )));
            }
        };
        let current_time = match message.args.get(1) {
            Some(OscType::Float(x)) => *x as f64,
            Some(OscType::Double(x)) => *x,
            Some(OscType::Int(x)) => *x as f64,
            Some(OscType::Long(x)) => *x as f64,
            other => {
                return Err(SyncError::MalformedReport(format!(
                    "expected time, got {other:?}"
                )));
            }
        };
        if !current_time.is_finite() {
            return Err(SyncError::MalformedReport(format!(
                "time {current_time} is not finite"
            )));
        }
        Ok(Self {
            is_playing,
            current_time,
        })
    }

    /// Reads the first report in a packet; bundles are searched in order.
    pub fn from_packet(packet: &OscPacket) -> Result<Self, SyncError> {
        match packet {
            OscPacket::Message(message) => Self::from_message(message),
            OscPacket::Bundle(bundle) => bundle
                .content
                .iter()
                .find_map(|p| Self::from_packet(p).ok())
                .ok_or_else(|| SyncError::MalformedReport(String::from("no report in bundle"))),
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SyncError> {
        let (_, packet) =
            rosc::decoder::decode_udp(bytes).map_err(|e| SyncError::Decode(format!("{e:?}")))?;
        Self::from_packet(&packet)
    }

    pub fn to_packet(&self, addr: &str) -> OscPacket {
        OscPacket::Message(OscMessage {
            addr: addr.to_string(),
            args: vec![OscType::Bool(self.is_playing), OscType::Double(self.current_time)],
        })
    }

    pub fn encode(&self, addr: &str) -> Result<Vec<u8>, SyncError> {
        rosc::encoder::encode(&self.to_packet(addr)).map_err(|e| SyncError::Encode(format!("{e:?}")))
    }
}

/// Applies a report to the clock and returns the acknowledgement.
pub fn reconcile(clock: &PlaybackHandle, report: PlaybackReport) -> (SyncAction, PlaybackReport) {
    let (action, status) = clock.sync(report.is_playing, report.current_time);
    match action {
        SyncAction::InSync => {}
        _ => tracing::info!(
            %action,
            reported = report.current_time,
            playing = report.is_playing,
            "playback synced"
        ),
    }
    (action, status.into())
}

/// Listens for playback reports and answers each with the reconciled
/// position. Dropping the bridge aborts the task.
pub struct SyncBridge {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl SyncBridge {
    pub async fn bind(address: SocketAddr, clock: PlaybackHandle) -> Result<Self, SyncError> {
        let socket = UdpSocket::bind(address)
            .await
            .map_err(|e| SyncError::Binding(e.to_string()))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| SyncError::Binding(e.to_string()))?;
        let (shutdown, mut shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut buffer = [0u8; rosc::decoder::MTU];
            'task: loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break 'task,
                    received = socket.recv_from(&mut buffer) => {
                        let (size, peer) = match received {
                            Ok(r) => r,
                            Err(e) => {
                                tracing::warn!(error = %e, "sync receive failed");
                                continue;
                            }
                        };
                        let report = match PlaybackReport::decode(&buffer[..size]) {
                            Ok(report) => report,
                            Err(e) => {
                                tracing::warn!(%peer, error = %e, "ignored sync packet");
                                continue;
                            }
                        };
                        let (_, ack) = reconcile(&clock, report);
                        match ack.encode(ACK_ADDR) {
                            Ok(bytes) => {
                                if let Err(e) = socket.send_to(&bytes, peer).await {
                                    tracing::warn!(%peer, error = %e, "sync ack failed");
                                }
                            }
                            Err(e) => tracing::warn!(error = %e, "sync ack encoding failed"),
                        }
                    }
                }
            }
            tracing::info!("sync bridge stopped");
        });
        tracing::info!(%local_addr, "sync bridge listening");

        Ok(Self {
            shutdown: Some(shutdown),
            task: Some(task),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops the listener and waits for the task to finish.
    pub async fn shutdown(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SyncBridge {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}
