// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Delayed work drained by the governor worker thread. Cluster switches and
//! hotplug can block for a long time and never run on the frequency
//! decision path.

use std::sync::Mutex;
use std::time::Duration;

use crossbeam::channel;
use crossbeam::channel::Receiver;
use crossbeam::channel::RecvTimeoutError;
use crossbeam::channel::Sender;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Work {
    /// Execute the recorded cluster switch decision.
    ClusterSwitch,
    /// Bring the online core count within the min/max bounds.
    MinMax,
    /// Apply the manual core mask.
    CoreState,
    Hotplug { cpu: usize, up: bool },
}

#[derive(Debug)]
pub struct WorkQueue {
    pending: Mutex<Vec<(u64, Work)>>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    pub fn new() -> Self {
        let (wake_tx, wake_rx) = channel::bounded(1);
        Self {
            pending: Mutex::new(vec![]),
            wake_tx,
            wake_rx,
        }
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, Vec<(u64, Work)>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue `work` to run at `due_ns`. An identical item already queued is
    /// not re-armed, it only moves earlier if `due_ns` is sooner.
    pub fn queue(&self, work: Work, due_ns: u64) {
        {
            let mut pending = self.pending();
            match pending.iter_mut().find(|(_, w)| *w == work) {
                Some((due, _)) => *due = (*due).min(due_ns),
                None => pending.push((due_ns, work)),
            }
        }
        let _ = self.wake_tx.try_send(());
    }

    pub fn cancel(&self, work: Work) {
        self.pending().retain(|(_, w)| *w != work);
    }

    pub fn is_pending(&self, work: Work) -> bool {
        self.pending().iter().any(|(_, w)| *w == work)
    }

    /// Remove and return every item due at `now_ns`, earliest first.
    pub fn take_due(&self, now_ns: u64) -> Vec<Work> {
        let mut pending = self.pending();
        let mut due: Vec<(u64, Work)> = vec![];
        pending.retain(|&(at, work)| {
            if at <= now_ns {
                due.push((at, work));
                false
            } else {
                true
            }
        });
        due.sort_by_key(|&(at, _)| at);
        due.into_iter().map(|(_, work)| work).collect()
    }

    pub fn next_due(&self) -> Option<u64> {
        self.pending().iter().map(|&(at, _)| at).min()
    }

    /// Block until new work is queued or `timeout` passes.
    pub fn wait(&self, timeout: Duration) {
        match self.wake_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
        }
    }
}
