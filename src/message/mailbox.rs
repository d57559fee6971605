use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::trace;
use serde::{Deserialize, Serialize};

use super::comm::Tag;
use crate::error::{Error, Result};

/// Longest wait on the channel before a blocked receive looks at the held
/// messages again. Another thread may have set aside the one it wants.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A message in flight, tagged with the rank that sent it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub source: usize,
    pub tag: Tag,
    pub data: Vec<u8>,
}

impl Envelope {
    fn matches(&self, source: usize, tag: Tag) -> bool {
        self.source == source && self.tag == tag
    }
}

/// The receive side of a rank. Incoming envelopes arrive on a channel in
/// transport order; the mailbox hands them out by (source, tag) and keeps
/// the ones nobody asked for yet, so that a receive for one peer never
/// consumes a message meant for a later receive. The held messages are only
/// locked briefly, never while waiting on the channel.
pub struct Mailbox {
    inbound: Receiver<Envelope>,
    pending: Mutex<VecDeque<Envelope>>,
    timeout: Option<Duration>,
}

impl Mailbox {
    pub fn new(inbound: Receiver<Envelope>) -> Self {
        Self {
            inbound,
            pending: Mutex::new(VecDeque::new()),
            timeout: None,
        }
    }

    /// Give up on a receive after the given duration with `Error::Timeout`.
    /// Without a timeout, receives block until the peer sends.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout
    }

    pub fn recv(&self, source: usize, tag: Tag) -> Result<Vec<u8>> {
        let deadline = self.deadline();
        loop {
            let held = take_first(&mut self.pending(), source, tag);
            if let Some(env) = held {
                return Ok(env.data);
            }
            match self.next_inbound(source, tag, deadline)? {
                Some(env) if env.matches(source, tag) => return Ok(env.data),
                Some(env) => {
                    trace!("holding message from {} with tag {}", env.source, env.tag);
                    self.pending().push_back(env);
                }
                None => {}
            }
        }
    }

    pub fn probe(&self, source: usize, tag: Tag) -> Result<usize> {
        let deadline = self.deadline();
        loop {
            let held = self
                .pending()
                .iter()
                .find(|e| e.matches(source, tag))
                .map(|e| e.data.len());
            if let Some(size) = held {
                return Ok(size);
            }
            if let Some(env) = self.next_inbound(source, tag, deadline)? {
                let found = env.matches(source, tag).then(|| env.data.len());
                self.pending().push_back(env);

                if let Some(size) = found {
                    return Ok(size);
                }
            }
        }
    }

    pub fn try_recv(&self, source: usize, tag: Tag) -> Result<Option<Vec<u8>>> {
        let mut pending = self.pending();

        if let Some(env) = take_first(&mut pending, source, tag) {
            return Ok(Some(env.data));
        }
        while let Ok(env) = self.inbound.try_recv() {
            if env.matches(source, tag) {
                return Ok(Some(env.data));
            }
            pending.push_back(env);
        }
        Ok(None)
    }

    /// Number of messages received but not yet handed out.
    pub fn num_pending(&self) -> usize {
        self.pending().len()
    }

    fn pending(&self) -> MutexGuard<'_, VecDeque<Envelope>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|timeout| Instant::now() + timeout)
    }

    /// Wait at most one poll interval for the next envelope. `None` means
    /// the interval passed; a passed deadline is `Error::Timeout`.
    fn next_inbound(&self, source: usize, tag: Tag, deadline: Option<Instant>) -> Result<Option<Envelope>> {
        let wait = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(Error::Timeout { rank: source, tag });
                }
                (deadline - now).min(POLL_INTERVAL)
            }
            None => POLL_INTERVAL,
        };
        match self.inbound.recv_timeout(wait) {
            Ok(env) => Ok(Some(env)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Error::Disconnected),
        }
    }
}

fn take_first(pending: &mut VecDeque<Envelope>, source: usize, tag: Tag) -> Option<Envelope> {
    let index = pending.iter().position(|e| e.matches(source, tag))?;
    pending.remove(index)
}
