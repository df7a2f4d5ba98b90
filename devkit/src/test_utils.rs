/*!
Helpers de test pour le kernel Binlink

- Init du logging une seule fois par process de test
- Attente active d'une condition (état du registry, connexion morte...)
*/

use std::time::{Duration, Instant};

/// Init logging pour tests (sans effet si déjà initialisé)
pub fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Attend que `condition` devienne vraie, au plus `timeout_ms` millisecondes
pub async fn wait_for<F>(timeout_ms: u64, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();

    while start.elapsed() < Duration::from_millis(timeout_ms) {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let ok = condition();
    if !ok {
        log::warn!("⏰ Timeout after {}ms waiting for condition", timeout_ms);
    }
    ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_wait_for_condition() {
        init_test_logging();
        let counter = Arc::new(AtomicUsize::new(0));
        let bump = counter.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            bump.store(1, Ordering::SeqCst);
        });

        assert!(wait_for(1000, || counter.load(Ordering::SeqCst) == 1).await);
        assert!(!wait_for(50, || false).await);
    }
}
