use std::{
    fmt::Debug,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{sync::Notify, task::AbortHandle};
use tracing::{Level, debug, error, instrument, trace, warn};

/// Handle of a periodic background task.
pub struct TaskHandle {
    name: &'static str,
    is_closing: Arc<AtomicBool>,
    close_requested: Arc<Notify>,
    abort_handle: AbortHandle,
}

impl TaskHandle {
    /// Spawns `tick` in a loop, sleeping `tick_sleep` between runs, until closed.
    /// Closing interrupts the sleep but never a running tick.
    pub(crate) fn spawn_periodic<F, Fut>(name: &'static str, tick_sleep: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let is_closing = Arc::new(AtomicBool::default());
        let close_requested = Arc::new(Notify::new());
        let abort_handle = tokio::spawn({
            let is_closing = is_closing.clone();
            let close_requested = close_requested.clone();
            async move {
                debug!("Spawned {name}");
                while !is_closing.load(Ordering::Relaxed) {
                    tick().await;
                    tokio::select! {
                        () = tokio::time::sleep(tick_sleep) => {}
                        () = close_requested.notified() => {}
                    }
                }
            }
        })
        .abort_handle();
        Self {
            name,
            is_closing,
            close_requested,
            abort_handle,
        }
    }

    #[instrument(level = Level::DEBUG, skip_all, fields(name = self.name))]
    pub async fn close(&self) {
        trace!("Gracefully closing");
        self.is_closing.store(true, Ordering::Relaxed);
        // Stores a permit when the loop is mid-tick.
        self.close_requested.notify_one();
        while !self.abort_handle.is_finished() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        debug!("Gracefully closed {}", self.name);
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        if self.abort_handle.is_finished() {
            return;
        }
        warn!("Aborting the {}", self.name);
        self.abort_handle.abort();
    }
}

/// Logs a tick error unless it repeats the previous one.
pub(crate) fn log_err_if_new<T, E: PartialEq + Debug>(res: Result<T, E>, old_err: &mut Option<E>) {
    match (res, &old_err) {
        (Ok(_), _) => {
            *old_err = None;
        }
        (Err(err), Some(old)) if err == *old => {}
        (Err(err), _) => {
            error!("Tick failed: {err:?}");
            *old_err = Some(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn close_stops_the_loop() {
        test_utils::set_up();
        let ticks = Arc::new(AtomicUsize::default());
        let handle = TaskHandle::spawn_periodic("counter", Duration::from_millis(1), {
            let ticks = ticks.clone();
            move || {
                let ticks = ticks.clone();
                async move {
                    ticks.fetch_add(1, Ordering::Relaxed);
                }
            }
        });
        while ticks.load(Ordering::Relaxed) < 3 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        handle.close().await;
        let after_close = ticks.load(Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(after_close, ticks.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn close_interrupts_a_long_sleep() {
        test_utils::set_up();
        let ticks = Arc::new(AtomicUsize::default());
        let handle = TaskHandle::spawn_periodic("hourly", Duration::from_secs(3600), {
            let ticks = ticks.clone();
            move || {
                let ticks = ticks.clone();
                async move {
                    ticks.fetch_add(1, Ordering::Relaxed);
                }
            }
        });
        while ticks.load(Ordering::Relaxed) < 1 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        tokio::time::timeout(Duration::from_secs(5), handle.close())
            .await
            .expect("close must not wait for the next tick");
        assert_eq!(1, ticks.load(Ordering::Relaxed));
    }

    #[test]
    fn repeated_error_is_remembered_once() {
        let mut old_err = None;
        log_err_if_new::<(), _>(Err("down"), &mut old_err);
        assert_eq!(Some("down"), old_err);
        log_err_if_new::<(), _>(Err("down"), &mut old_err);
        assert_eq!(Some("down"), old_err);
        log_err_if_new(Ok(()), &mut old_err);
        assert_eq!(None, old_err);
    }
}
