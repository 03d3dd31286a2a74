use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// What the owner of a running plan wants it to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunSignal {
    Run,
    Pause,
    Cancel,
}

/// Cloneable control handle for one plan run.
///
/// Cancellation is sticky: once cancelled, pause and resume are ignored.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<RunSignal>>,
    rx: watch::Receiver<RunSignal>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(RunSignal::Run);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(RunSignal::Cancel);
    }

    /// Stop scheduling new steps at the next round boundary
    pub fn pause(&self) {
        self.tx.send_if_modified(|signal| {
            if *signal == RunSignal::Run {
                *signal = RunSignal::Pause;
                true
            } else {
                false
            }
        });
    }

    pub fn resume(&self) {
        self.tx.send_if_modified(|signal| {
            if *signal == RunSignal::Pause {
                *signal = RunSignal::Run;
                true
            } else {
                false
            }
        });
    }

    pub fn signal(&self) -> RunSignal {
        *self.rx.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal() == RunSignal::Cancel
    }

    pub fn is_paused(&self) -> bool {
        self.signal() == RunSignal::Pause
    }

    /// Resolves once the run is cancelled, checking at least every `poll`
    pub async fn cancelled(&self, poll: Duration) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() == RunSignal::Cancel {
                return;
            }
            wait_for_change(&mut rx, poll).await;
        }
    }

    /// Block while paused. Returns false if the run was cancelled instead of resumed.
    pub async fn wait_resumed(&self, poll: Duration) -> bool {
        let mut rx = self.rx.clone();
        loop {
            match *rx.borrow_and_update() {
                RunSignal::Run => return true,
                RunSignal::Cancel => return false,
                RunSignal::Pause => {}
            }
            wait_for_change(&mut rx, poll).await;
        }
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

async fn wait_for_change(rx: &mut watch::Receiver<RunSignal>, poll: Duration) {
    tokio::select! {
        changed = rx.changed() => {
            if changed.is_err() {
                tokio::time::sleep(poll).await;
            }
        }
        _ = tokio::time::sleep(poll) => {}
    }
}
