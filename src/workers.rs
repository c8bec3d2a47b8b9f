//! 后台任务
//! 每个任务一个线程，按固定间隔触发，收到关闭信号后退出。

use crate::{error::Result, state::AppState};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Handle to a periodic background thread
#[derive(Debug)]
pub struct BackgroundWorker {
    name: String,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl BackgroundWorker {
    /// Run `task` every `interval` until shut down. Failures are logged and
    /// the next tick runs as usual.
    pub fn spawn<F>(name: &str, interval: Duration, mut task: F) -> std::io::Result<Self>
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let thread_name = name.to_string();

        let join = thread::Builder::new()
            .name(format!("sentinel-{}", name))
            .spawn(move || {
                tracing::info!(worker = %thread_name, interval_ms = interval.as_millis() as u64, "Worker started");
                loop {
                    match shutdown_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            if let Err(e) = task() {
                                metrics::counter!("sentinel_worker_failures_total", "worker" => thread_name.clone())
                                    .increment(1);
                                tracing::error!(worker = %thread_name, error = %e, "Worker tick failed");
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                tracing::info!(worker = %thread_name, "Worker stopped");
            })?;

        Ok(Self {
            name: name.to_string(),
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request shutdown and wait for the current tick to finish
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                tracing::error!(worker = %self.name, "Worker thread panicked");
            }
        }
    }
}

impl Drop for BackgroundWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Session sweep, key rotation and expired-token cleanup
pub fn spawn_all(state: &AppState) -> std::io::Result<Vec<BackgroundWorker>> {
    let workers = &state.config.workers;

    let sessions = Arc::clone(&state.sessions);
    let sweep = BackgroundWorker::spawn(
        "session-sweep",
        Duration::from_secs(workers.session_sweep_interval_secs),
        move || sessions.sweep_expired().map(|_| ()),
    )?;

    let tokens = Arc::clone(&state.tokens);
    let rotation = BackgroundWorker::spawn(
        "key-rotation",
        Duration::from_secs(workers.key_rotation_check_interval_secs),
        move || tokens.rotate_if_due().map(|_| ()),
    )?;

    let tokens = Arc::clone(&state.tokens);
    let cleanup = BackgroundWorker::spawn(
        "token-cleanup",
        Duration::from_secs(workers.token_cleanup_interval_secs),
        move || tokens.cleanup_expired_tokens().map(|_| ()),
    )?;

    Ok(vec![sweep, rotation, cleanup])
}

/// Run every worker until `shutdown` receives a message (or its sender is
/// dropped), then stop them. Returns how many workers were stopped.
pub fn run_until(state: &AppState, shutdown: mpsc::Receiver<()>) -> std::io::Result<usize> {
    let workers = spawn_all(state)?;
    let count = workers.len();
    tracing::info!(workers = count, "Background workers running");

    if shutdown.recv().is_err() {
        tracing::warn!("Shutdown channel closed without a signal");
    }

    tracing::info!("Shutdown requested");
    for worker in workers {
        worker.shutdown();
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_worker_ticks_until_shutdown() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let worker = BackgroundWorker::spawn("test", Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

        while ticks.load(Ordering::SeqCst) < 3 {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(worker.name(), "test");
        worker.shutdown();

        let after = ticks.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(ticks.load(Ordering::SeqCst), after);
    }

    #[test]
    fn test_failing_tick_does_not_stop_worker() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let worker = BackgroundWorker::spawn("failing", Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(AppError::Storage("disk gone".to_string()))
        })
        .unwrap();

        while ticks.load(Ordering::SeqCst) < 2 {
            thread::sleep(Duration::from_millis(5));
        }
        drop(worker);
    }
}
