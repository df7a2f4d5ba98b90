/**
 * DEVICE CONNECTION - Une connexion vivante vers un device
 *
 * FONCTIONNEMENT :
 * - Une task par transport, propriétaire exclusive du stream
 * - File de requêtes à une seule place : au plus UNE requête en vol par connexion
 *   (le protocole n'a pas d'identifiant de requête, la réponse est la trame suivante)
 * - Hors requête, les trames reçues sont de la télémétrie spontanée
 * - Timeout par requête : un device muet est considéré mort
 *
 * Toute erreur I/O ou timeout marque la connexion morte et termine la task ;
 * l'appelant reçoit `DeviceError` et doit évincer la connexion du registry.
 */

use crate::models::DeviceId;
use crate::protocol::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

/// Taille max d'une trame lue en une fois
const FRAME_CAPACITY: usize = 1024;

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum DeviceError {
    #[error("{0} disconnected")]
    Disconnected(DeviceId),
    #[error("{0} did not reply within {1:?}")]
    Timeout(DeviceId, Duration),
}

/// Trame reçue d'un device sans requête en cours
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryFrame {
    pub device: DeviceId,
    pub payload: String,
}

pub type TelemetrySender = mpsc::UnboundedSender<TelemetryFrame>;

struct PendingRequest {
    command: String,
    reply: oneshot::Sender<Result<String, DeviceError>>,
}

struct Inner {
    id: DeviceId,
    peer: String,
    connected_at: OffsetDateTime,
    alive: AtomicBool,
    closed: Notify,
    requests: mpsc::Sender<PendingRequest>,
}

/// Handle clonable vers la task qui possède le transport
#[derive(Clone)]
pub struct DeviceConnection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DeviceConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceConnection")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl DeviceConnection {
    /// Prend possession du transport et démarre la task de la connexion
    pub fn spawn<S>(
        id: DeviceId,
        peer: impl Into<String>,
        stream: S,
        telemetry: TelemetrySender,
        request_timeout: Duration,
    ) -> (Self, JoinHandle<()>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        // une seule place : les appelants concurrents attendent leur tour sur `send`
        let (tx, rx) = mpsc::channel(1);
        let conn = Self {
            inner: Arc::new(Inner {
                id,
                peer: peer.into(),
                connected_at: OffsetDateTime::now_utc(),
                alive: AtomicBool::new(true),
                closed: Notify::new(),
                requests: tx,
            }),
        };
        let task = tokio::spawn(run_connection(conn.inner.clone(), stream, rx, telemetry, request_timeout));
        (conn, task)
    }

    pub fn id(&self) -> DeviceId {
        self.inner.id
    }

    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    pub fn connected_at(&self) -> OffsetDateTime {
        self.inner.connected_at
    }

    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire)
    }

    /// Vrai si les deux handles désignent la même connexion physique
    pub fn same_as(&self, other: &DeviceConnection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Ferme le transport ; idempotent
    pub fn close(&self) {
        if self.inner.alive.swap(false, Ordering::AcqRel) {
            self.inner.closed.notify_one();
        }
    }

    /// Envoie une commande et attend la réponse du device.
    /// Les appels concurrents sur la même connexion sont mis en file.
    pub async fn request(&self, command: &Command) -> Result<String, DeviceError> {
        let id = self.inner.id;
        if !self.is_alive() {
            return Err(DeviceError::Disconnected(id));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let pending = PendingRequest { command: command.to_string(), reply: reply_tx };
        self.inner
            .requests
            .send(pending)
            .await
            .map_err(|_| DeviceError::Disconnected(id))?;

        // canal fermé = la task s'est terminée avant de répondre
        reply_rx.await.unwrap_or(Err(DeviceError::Disconnected(id)))
    }
}

async fn run_connection<S>(
    inner: Arc<Inner>,
    mut stream: S,
    mut requests: mpsc::Receiver<PendingRequest>,
    telemetry: TelemetrySender,
    request_timeout: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let id = inner.id;
    let mut buf = vec![0u8; FRAME_CAPACITY];

    loop {
        tokio::select! {
            _ = inner.closed.notified() => {
                debug!(device = %id, "connection closed");
                break;
            }
            pending = requests.recv() => {
                let Some(pending) = pending else { break };
                let result = exchange(id, &mut stream, &mut buf, &pending.command, request_timeout).await;
                let failed = result.is_err();
                if let Err(e) = &result {
                    warn!(device = %id, command = %pending.command, error = %e, "device request failed");
                }
                // l'appelant a pu abandonner ; rien à faire dans ce cas
                let _ = pending.reply.send(result);
                if failed {
                    break;
                }
            }
            read = stream.read(&mut buf) => match read {
                Ok(0) => {
                    debug!(device = %id, "device closed the transport");
                    break;
                }
                Ok(n) => {
                    let payload = decode_frame(&buf[..n]);
                    debug!(device = %id, %payload, "unsolicited frame");
                    if telemetry.send(TelemetryFrame { device: id, payload }).is_err() {
                        debug!(device = %id, "telemetry sink gone, frame dropped");
                    }
                }
                Err(e) => {
                    warn!(device = %id, error = %e, "read failed");
                    break;
                }
            },
        }
    }

    inner.alive.store(false, Ordering::Release);
    // réveille les requêtes restées en file
    requests.close();
    while let Ok(pending) = requests.try_recv() {
        let _ = pending.reply.send(Err(DeviceError::Disconnected(id)));
    }
    let _ = stream.shutdown().await;
}

/// Écriture + lecture de la réponse sous une seule échéance
async fn exchange<S>(
    id: DeviceId,
    stream: &mut S,
    buf: &mut [u8],
    command: &str,
    request_timeout: Duration,
) -> Result<String, DeviceError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let round_trip = async {
        stream.write_all(command.as_bytes()).await?;
        stream.flush().await?;
        stream.read(buf).await
    };
    match timeout(request_timeout, round_trip).await {
        Ok(Ok(0)) | Ok(Err(_)) => Err(DeviceError::Disconnected(id)),
        Ok(Ok(n)) => Ok(decode_frame(&buf[..n])),
        Err(_) => Err(DeviceError::Timeout(id, request_timeout)),
    }
}

/// Une lecture = une trame ; les blancs de fin (CR/LF éventuels) sont retirés
fn decode_frame(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use binlink_devkit::{init_test_logging, wait_for, DeviceProfile, SimulatedDevice};

    fn attach(id: u32, profile: DeviceProfile) -> (DeviceConnection, SimulatedDevice, mpsc::UnboundedReceiver<TelemetryFrame>) {
        init_test_logging();
        let (kernel_side, device_side) = tokio::io::duplex(1024);
        let (tx, rx) = mpsc::unbounded_channel();
        let (conn, _task) = DeviceConnection::spawn(DeviceId(id), "duplex", kernel_side, tx, Duration::from_millis(500));
        let device = SimulatedDevice::attach(device_side, profile);
        (conn, device, rx)
    }

    #[tokio::test]
    async fn test_request_reply() {
        let (conn, device, _rx) = attach(3, DeviceProfile::default().humidity(25.0));
        assert_eq!(conn.request(&Command::GetHumidity).await.unwrap(), "humid:25.0");
        assert_eq!(conn.request(&Command::SetFillThreshold(70.0)).await.unwrap(), "Threshold set");
        assert_eq!(device.received_commands(), vec!["getHumidity", "setFillThreshold:70"]);
        assert!(conn.is_alive());
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_serialized() {
        let profile = DeviceProfile::default().humidity(40.0).level(12.5).reply_delay(Duration::from_millis(50));
        let (conn, device, _rx) = attach(1, profile);

        let (a, b) = tokio::join!(conn.request(&Command::GetHumidity), conn.request(&Command::GetCurrentLevel));
        assert_eq!(a.unwrap(), "humid:40.0");
        assert_eq!(b.unwrap(), "level:12.5");
        assert_eq!(device.command_count(), 2);
    }

    #[tokio::test]
    async fn test_silent_device_times_out() {
        let (conn, _device, _rx) = attach(9, DeviceProfile::default().silent());
        let err = conn.request(&Command::GetStatus).await.unwrap_err();
        assert_eq!(err, DeviceError::Timeout(DeviceId(9), Duration::from_millis(500)));
        assert!(wait_for(1000, || !conn.is_alive()).await);
        assert_eq!(conn.request(&Command::GetStatus).await.unwrap_err(), DeviceError::Disconnected(DeviceId(9)));
    }

    #[tokio::test]
    async fn test_write_and_read_share_one_deadline() {
        init_test_logging();
        // tampon plus petit que la commande : l'écriture attend que le device lise
        let (kernel_side, mut device_side) = tokio::io::duplex(16);
        let (tx, _rx) = mpsc::unbounded_channel();
        let (conn, _task) = DeviceConnection::spawn(DeviceId(8), "duplex", kernel_side, tx, Duration::from_millis(500));

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let mut buf = [0u8; 64];
            let mut got = 0;
            while got < "setFillThreshold:70".len() {
                match device_side.read(&mut buf[got..]).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => got += n,
                }
            }
            tokio::time::sleep(Duration::from_millis(400)).await;
            let _ = device_side.write_all(b"Threshold set").await;
        });

        // 300 ms d'écriture + 400 ms d'attente dépassent l'échéance de 500 ms
        let err = conn.request(&Command::SetFillThreshold(70.0)).await.unwrap_err();
        assert_eq!(err, DeviceError::Timeout(DeviceId(8), Duration::from_millis(500)));
    }

    #[tokio::test]
    async fn test_device_disconnect() {
        let (conn, device, _rx) = attach(4, DeviceProfile::default());
        device.disconnect();
        assert!(wait_for(1000, || !conn.is_alive()).await);
        let err = conn.request(&Command::GetHumidity).await.unwrap_err();
        assert_eq!(err.to_string(), "4 disconnected");
    }

    #[tokio::test]
    async fn test_unsolicited_frames_become_telemetry() {
        let (conn, device, mut rx) = attach(5, DeviceProfile::default());
        device.push_telemetry("level:80.0").unwrap();
        let frame = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(frame, TelemetryFrame { device: DeviceId(5), payload: "level:80.0".into() });
        assert!(conn.is_alive());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (conn, _device, _rx) = attach(6, DeviceProfile::default());
        let other = conn.clone();
        assert!(conn.same_as(&other));
        conn.close();
        other.close();
        assert!(!conn.is_alive());
        assert!(conn.request(&Command::GetHumidity).await.is_err());
    }
}
