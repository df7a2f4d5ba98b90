/**
 * DEVICE LISTENER - Accepte les connexions entrantes des devices
 *
 * FONCTIONNEMENT :
 * - Bind TCP au démarrage (échec = arrêt du serveur)
 * - Boucle d'accept pour toute la durée du process
 * - Chaque transport accepté reçoit l'identité suivante (1, 2, 3... jamais réutilisée),
 *   en sautant la plage réservée aux devices simulés
 * - Une task de supervision évince la connexion du registry quand elle meurt
 *
 * Une erreur d'accept est loggée puis la boucle continue.
 */

use crate::device::connection::{DeviceConnection, TelemetrySender};
use crate::device::registry::ConnectionRegistry;
use crate::health::HealthTracker;
use crate::models::DeviceId;
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Duration;
use tracing::{error, info, warn};

/// Séquence atomique des identités, propriété du listener.
/// Les identités de la plage réservée (devices simulés) ne sont jamais distribuées.
#[derive(Debug)]
pub struct IdentitySequence {
    next: AtomicU32,
    reserved: RangeInclusive<u32>,
}

impl IdentitySequence {
    pub fn new() -> Self {
        Self::skipping(1..=0)
    }

    pub fn skipping(reserved: RangeInclusive<u32>) -> Self {
        Self { next: AtomicU32::new(1), reserved }
    }

    pub fn next(&self) -> DeviceId {
        let prev = self
            .next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(self.skip_reserved(n) + 1))
            .unwrap_or_else(|n| n);
        DeviceId(self.skip_reserved(prev))
    }

    fn skip_reserved(&self, n: u32) -> u32 {
        if self.reserved.contains(&n) {
            self.reserved.end() + 1
        } else {
            n
        }
    }
}

impl Default for IdentitySequence {
    fn default() -> Self {
        Self::new()
    }
}

pub struct DeviceListener {
    listener: TcpListener,
    identities: IdentitySequence,
    registry: ConnectionRegistry,
    telemetry: TelemetrySender,
    request_timeout: Duration,
    health: HealthTracker,
}

impl DeviceListener {
    pub async fn bind(
        addr: SocketAddr,
        registry: ConnectionRegistry,
        telemetry: TelemetrySender,
        request_timeout: Duration,
        health: HealthTracker,
        reserved_ids: RangeInclusive<u32>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            identities: IdentitySequence::skipping(reserved_ids),
            registry,
            telemetry,
            request_timeout,
            health,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Boucle d'accept ; ne se termine jamais sur une erreur isolée
    pub async fn run(self) {
        match self.local_addr() {
            Ok(addr) => info!(%addr, "device listener ready"),
            Err(e) => warn!(error = %e, "device listener ready (unknown address)"),
        }
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => self.accept_connection(stream, peer),
                Err(e) => {
                    error!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    fn accept_connection(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(%peer, error = %e, "failed to set TCP_NODELAY");
        }
        let id = self.identities.next();
        let (conn, task) =
            DeviceConnection::spawn(id, peer.to_string(), stream, self.telemetry.clone(), self.request_timeout);

        if let Err(e) = self.registry.register(conn.clone()) {
            error!(device = %id, %peer, error = %e, "registration refused, dropping connection");
            conn.close();
            return;
        }
        self.health.record_accept();
        info!(device = %id, %peer, "device connected");

        let registry = self.registry.clone();
        tokio::spawn(async move {
            let _ = task.await;
            if registry.evict(&conn) {
                info!(device = %conn.id(), "device disconnected");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use binlink_devkit::{init_test_logging, wait_for, DeviceProfile, SimulatedDevice};
    use crate::protocol::Command;
    use std::collections::HashSet;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    async fn start() -> (SocketAddr, ConnectionRegistry, HealthTracker) {
        init_test_logging();
        let registry = ConnectionRegistry::new();
        let health = HealthTracker::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let listener = DeviceListener::bind(
            "127.0.0.1:0".parse().unwrap(),
            registry.clone(),
            tx,
            Duration::from_secs(1),
            health.clone(),
            1000..=1999,
        )
        .await
        .unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(listener.run());
        (addr, registry, health)
    }

    #[test]
    fn test_identity_sequence_starts_at_one() {
        let seq = IdentitySequence::new();
        assert_eq!(seq.next(), DeviceId(1));
        assert_eq!(seq.next(), DeviceId(2));
    }

    #[test]
    fn test_identity_sequence_skips_reserved_range() {
        let seq = IdentitySequence::skipping(3..=5);
        let ids: Vec<u32> = (0..4).map(|_| seq.next().0).collect();
        assert_eq!(ids, vec![1, 2, 6, 7]);

        // plage démarrant à 1
        let seq = IdentitySequence::skipping(1..=1000);
        assert_eq!(seq.next(), DeviceId(1001));
        assert_eq!(seq.next(), DeviceId(1002));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reserved_range_skipped_under_concurrency() {
        let seq = Arc::new(IdentitySequence::skipping(100..=199));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let seq = seq.clone();
            handles.push(tokio::spawn(async move { (0..100).map(|_| seq.next().0).collect::<Vec<_>>() }));
        }
        let mut seen = HashSet::new();
        for h in handles {
            seen.extend(h.await.unwrap());
        }
        assert_eq!(seen.len(), 400);
        assert!(seen.iter().all(|id| !(100..=199).contains(id)));
        assert_eq!(seen.iter().max(), Some(&500));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_identities_unique_under_concurrency() {
        let seq = Arc::new(IdentitySequence::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let seq = seq.clone();
            handles.push(tokio::spawn(async move { (0..100).map(|_| seq.next()).collect::<Vec<_>>() }));
        }
        let mut seen = HashSet::new();
        for h in handles {
            let ids = h.await.unwrap();
            // croissance stricte dans chaque task
            assert!(ids.windows(2).all(|w| w[0] < w[1]));
            seen.extend(ids);
        }
        assert_eq!(seen.len(), 800);
        assert!(seen.iter().all(|id| id.0 >= 1 && id.0 <= 800));
    }

    #[tokio::test]
    async fn test_accepted_devices_get_sequential_ids() {
        let (addr, registry, health) = start().await;

        let mut devices = Vec::new();
        for expected in 1..=3u32 {
            devices.push(SimulatedDevice::connect(addr, DeviceProfile::default()).await.unwrap());
            assert!(wait_for(2000, || registry.contains(DeviceId(expected))).await);
        }
        let ids: Vec<DeviceId> = registry.list_all().iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec![DeviceId(1), DeviceId(2), DeviceId(3)]);
        assert_eq!(health.accepted(), 3);

        let reply = registry.lookup(DeviceId(2)).unwrap().request(&Command::GetStatus).await.unwrap();
        assert_eq!(reply, "statu:OK");
    }

    #[tokio::test]
    async fn test_disconnect_removes_entry_and_ids_are_not_reused() {
        let (addr, registry, _health) = start().await;

        let first = SimulatedDevice::connect(addr, DeviceProfile::default()).await.unwrap();
        assert!(wait_for(2000, || registry.contains(DeviceId(1))).await);
        first.disconnect();
        assert!(wait_for(2000, || registry.is_empty()).await);

        let _second = SimulatedDevice::connect(addr, DeviceProfile::default()).await.unwrap();
        assert!(wait_for(2000, || registry.contains(DeviceId(2))).await);
        assert!(!registry.contains(DeviceId(1)));
    }
}
