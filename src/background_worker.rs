// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{poison_dart::PoisonDart, stop_signal::StopSignal};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

pub trait Activity {
    /// Gets the name of the activity.
    fn name(&self) -> &'static str;

    /// Runs the activity once.
    fn run(&mut self) -> crate::Result<()>;
}

/// Repeatedly runs an activity on its own thread until the stop signal is sent
///
/// A failing activity poisons its owner and ends the thread.
pub struct BackgroundWorker<A: Activity> {
    activity: A,
    poison_dart: PoisonDart,
    thread_counter: Arc<AtomicUsize>,
    stop_signal: StopSignal,
}

impl<A: Activity + Send + 'static> BackgroundWorker<A> {
    pub fn new(
        activity: A,
        poison_dart: PoisonDart,
        thread_counter: Arc<AtomicUsize>,
        stop_signal: StopSignal,
    ) -> Self {
        Self {
            activity,
            poison_dart,
            thread_counter,
            stop_signal,
        }
    }

    /// Spawns a named thread running the activity
    ///
    /// The thread counter is incremented before this returns, so owners
    /// can wait for it to drop back to zero on shutdown.
    pub fn spawn(self) -> crate::Result<()> {
        self.thread_counter.fetch_add(1, Ordering::AcqRel);

        // NOTE: If spawning fails, the worker is dropped, which decrements the counter again
        std::thread::Builder::new()
            .name(self.activity.name().into())
            .spawn(move || self.start())?;

        Ok(())
    }

    /// Starts the background activity.
    ///
    /// Does not start a thread; this function is blocking.
    fn start(mut self) {
        log::debug!("Starting background worker {:?}", self.activity.name());

        loop {
            if self.stop_signal.is_stopped() {
                log::trace!(
                    "Background worker {:?} exiting because its owner is dropping",
                    self.activity.name(),
                );
                return;
            }

            match self.activity.run() {
                Ok(()) => {}
                Err(crate::Error::Cancelled) if self.stop_signal.is_stopped() => {
                    log::trace!("Background worker {:?} was cancelled", self.activity.name());
                    return;
                }
                Err(e) => {
                    log::error!("Background worker {:?} failed: {e:?}", self.activity.name());
                    self.poison_dart.poison();
                    return;
                }
            }
        }
    }
}

impl<A: Activity> Drop for BackgroundWorker<A> {
    fn drop(&mut self) {
        self.thread_counter.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use test_log::test;

    struct Countdown(usize);

    impl Activity for Countdown {
        fn name(&self) -> &'static str {
            "countdown"
        }

        fn run(&mut self) -> crate::Result<()> {
            if self.0 == 0 {
                return Err(crate::Error::Poisoned);
            }
            self.0 -= 1;
            Ok(())
        }
    }

    #[test]
    fn background_worker_poisons_on_error() -> crate::Result<()> {
        let poisoned = Arc::new(AtomicBool::default());
        let counter = Arc::new(AtomicUsize::default());

        BackgroundWorker::new(
            Countdown(10),
            PoisonDart::new("countdown", poisoned.clone()),
            counter.clone(),
            StopSignal::default(),
        )
        .spawn()?;

        while counter.load(Ordering::Acquire) > 0 {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }

        assert!(poisoned.load(Ordering::Acquire));

        Ok(())
    }

    #[test]
    fn background_worker_stops() -> crate::Result<()> {
        let poisoned = Arc::new(AtomicBool::default());
        let counter = Arc::new(AtomicUsize::default());
        let stop_signal = StopSignal::default();
        stop_signal.send();

        BackgroundWorker::new(
            Countdown(usize::MAX),
            PoisonDart::new("countdown", poisoned.clone()),
            counter.clone(),
            stop_signal,
        )
        .spawn()?;

        while counter.load(Ordering::Acquire) > 0 {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }

        assert!(!poisoned.load(Ordering::Acquire));

        Ok(())
    }
}
