use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use folio_core::{Clock, Timestamp};

/// A unit of background work invoked on a fixed cadence.
pub trait ScheduledTask: Send + 'static {
    fn name(&self) -> &'static str;

    fn run(&mut self, now: Timestamp);
}

pub struct Scheduler;

impl Scheduler {
    /// Run `task` every `interval` on a dedicated thread until the handle is
    /// stopped or dropped. The first run happens one interval after spawning.
    pub fn spawn<T: ScheduledTask>(
        interval: Duration,
        clock: Arc<dyn Clock>,
        mut task: T,
    ) -> std::io::Result<SchedulerHandle<T>> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let name = task.name();
        let join = thread::Builder::new()
            .name(format!("folio-{name}"))
            .spawn(move || {
                tracing::debug!(task = name, ?interval, "scheduled task started");
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => task.run(clock.now()),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                tracing::debug!(task = name, "scheduled task stopped");
                task
            })?;
        Ok(SchedulerHandle {
            stop: Some(stop_tx),
            join: Some(join),
        })
    }
}

pub struct SchedulerHandle<T> {
    stop: Option<Sender<()>>,
    join: Option<JoinHandle<T>>,
}

impl<T> SchedulerHandle<T> {
    /// Stop the task and hand it back. `None` if the task thread panicked.
    pub fn stop(mut self) -> Option<T> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Option<T> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.join.take().and_then(|j| j.join().ok())
    }
}

impl<T> Drop for SchedulerHandle<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::ManualClock;

    struct Counter {
        runs: Vec<Timestamp>,
    }

    impl ScheduledTask for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        fn run(&mut self, now: Timestamp) {
            self.runs.push(now);
        }
    }

    #[test]
    fn runs_on_interval_and_returns_task() {
        let clock = ManualClock::new(Timestamp::from_secs(42));
        let handle = Scheduler::spawn(
            Duration::from_millis(5),
            Arc::new(clock),
            Counter { runs: Vec::new() },
        )
        .unwrap();

        thread::sleep(Duration::from_millis(200));
        let counter = handle.stop().unwrap();
        assert!(!counter.runs.is_empty());
        assert!(counter.runs.iter().all(|t| *t == Timestamp::from_secs(42)));
    }

    #[test]
    fn stop_before_first_tick_never_runs() {
        let handle = Scheduler::spawn(
            Duration::from_secs(3600),
            Arc::new(ManualClock::default()),
            Counter { runs: Vec::new() },
        )
        .unwrap();
        let counter = handle.stop().unwrap();
        assert!(counter.runs.is_empty());
    }
}
