use std::{future::Future, sync::Arc, time::Duration};

use tokio::time::sleep;
use tracing::{info, warn};

use crate::{
    dao::{kv_store::KvStore, storage::StorageError},
    state::SharedState,
};

const INITIAL_DELAY: Duration = Duration::from_millis(1_000);
const MAX_DELAY: Duration = Duration::from_secs(10);
const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(5);
const MAX_HEALTH_RETRIES: u32 = 3;

/// Install the storage backend and keep the shared state in degraded mode while it is unavailable.
///
/// A backend that keeps failing its health checks is replaced through `connect`.
pub async fn run<F, Fut>(state: SharedState, mut connect: F)
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Arc<dyn KvStore>, StorageError>> + Send,
{
    let mut delay = INITIAL_DELAY;

    loop {
        match connect().await {
            Ok(kv) => {
                state.install_store(kv.clone()).await;
                info!("storage connection established; leaving degraded mode");
                delay = INITIAL_DELAY;

                watch_health(&state, kv.as_ref()).await;
                warn!("exhausted storage health retries; reconnecting");
                sleep(delay).await;
                delay = (delay * 2).min(MAX_DELAY);
            }
            Err(err) => {
                warn!(error = %err, "storage connection attempt failed");
                sleep(delay).await;
                delay = (delay * 2).min(MAX_DELAY);
            }
        }
    }
}

/// Poll the backend until it fails [`MAX_HEALTH_RETRIES`] checks in a row.
async fn watch_health(state: &SharedState, kv: &dyn KvStore) {
    let mut failures = 0;
    let mut retry_delay = INITIAL_DELAY;

    while failures < MAX_HEALTH_RETRIES {
        match kv.health_check().await {
            Ok(()) => {
                if state.is_degraded() {
                    info!("storage healthy again; leaving degraded mode");
                    state.set_degraded(false);
                }
                failures = 0;
                retry_delay = INITIAL_DELAY;
                sleep(HEALTH_POLL_INTERVAL).await;
            }
            Err(err) => {
                if failures == 0 {
                    warn!(error = %err, "storage health check failed; entering degraded mode");
                    state.set_degraded(true);
                } else {
                    warn!(attempt = failures, error = %err, "storage health check failed again");
                }
                failures += 1;
                sleep(retry_delay).await;
                retry_delay = (retry_delay * 2).min(MAX_DELAY);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::{config::AppConfig, dao::kv_store::memory::MemoryStore, state::AppState};

    #[tokio::test(start_paused = true)]
    async fn retries_until_backend_connects() {
        let state = AppState::new(AppConfig::default());
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let mut degraded = state.degraded_watcher();

        tokio::spawn(run(state.clone(), move || {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(StorageError::unavailable(
                        "backend offline".into(),
                        std::io::Error::other("refused"),
                    ))
                } else {
                    Ok(Arc::new(MemoryStore::new()) as Arc<dyn KvStore>)
                }
            }
        }));

        degraded.wait_for(|degraded| !*degraded).await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(state.store().await.is_some());
    }
}
