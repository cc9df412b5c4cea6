/// Coalescing refresh scheduler: collect signals over a fixed window, run at most
/// one refresh per window.
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::debug;

pub struct DebouncedRefresh {
    tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
    runs: Arc<AtomicU64>,
}

impl DebouncedRefresh {
    /// Spawn the scheduler. `refresh` runs once per window that saw at least one signal.
    pub fn spawn<F, Fut>(window: Duration, refresh: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        // Capacity 1: a full slot already means "refresh pending"
        let (tx, mut rx) = mpsc::channel::<()>(1);
        let runs = Arc::new(AtomicU64::new(0));
        let counter = runs.clone();

        let task = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                sleep(window).await;
                // Anything that arrived during the window is folded into this run
                while rx.try_recv().is_ok() {}
                counter.fetch_add(1, Ordering::SeqCst);
                debug!("Debounced refresh firing");
                refresh().await;
            }
        });

        Self { tx, task, runs }
    }

    /// Request a refresh. Cheap; extra signals within a window are coalesced.
    pub fn signal(&self) {
        // Full means a refresh is already scheduled
        let _ = self.tx.try_send(());
    }

    /// Number of refreshes executed so far
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for DebouncedRefresh {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_burst_coalesces_into_one_run() {
        let calls = Arc::new(AtomicU64::new(0));
        let c = calls.clone();
        let refresher = DebouncedRefresh::spawn(Duration::from_millis(50), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        for _ in 0..20 {
            refresher.signal();
        }
        sleep(Duration::from_millis(200)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(refresher.runs(), 1);
    }

    #[tokio::test]
    async fn test_separate_windows_run_separately() {
        let calls = Arc::new(AtomicU64::new(0));
        let c = calls.clone();
        let refresher = DebouncedRefresh::spawn(Duration::from_millis(30), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        refresher.signal();
        sleep(Duration::from_millis(150)).await;
        refresher.signal();
        sleep(Duration::from_millis(150)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_signal_no_run() {
        let refresher = DebouncedRefresh::spawn(Duration::from_millis(10), || async {});
        sleep(Duration::from_millis(50)).await;
        assert_eq!(refresher.runs(), 0);
    }
}
