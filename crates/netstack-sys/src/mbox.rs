//! API mailbox (`sys_mbox_t`): the FIFO channel blocking-mode callers post work onto and the
//! protocol thread drains. Messages posted to the API mailbox are processed in FIFO order.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, SendError, Sender};

/// Bounded, multi-producer single-consumer FIFO. Bounded so a runaway producer applies
/// backpressure (`try_post` returning the message back) rather than growing without limit.
pub struct Mailbox<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> Mailbox<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Self { tx, rx }
    }

    pub fn sender(&self) -> MailboxSender<T> {
        MailboxSender { tx: self.tx.clone() }
    }

    /// Blocks until the protocol thread pulls an item, or the mailbox is closed (`CLOSED`).
    /// Closing a netconn wakes any thread blocked on its mailboxes.
    pub fn post(&self, msg: T) -> Result<(), T> {
        self.tx.send(msg).map_err(|SendError(msg)| msg)
    }

    /// Drains the next message, waiting at most `timeout` (or forever if `None`). Used by the
    /// protocol thread's event loop, where `timeout` is the delay until the next due timer.
    pub fn fetch(&self, timeout: Option<Duration>) -> Option<T> {
        match timeout {
            Some(timeout) => match self.rx.recv_timeout(timeout) {
                Ok(msg) => Some(msg),
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
            },
            None => self.rx.recv().ok(),
        }
    }

    pub fn try_fetch(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

/// A cloneable handle posting into a [`Mailbox`], handed out to blocking-API callers so they
/// don't need a reference to the mailbox's consuming half.
#[derive(Clone)]
pub struct MailboxSender<T> {
    tx: Sender<T>,
}

impl<T> MailboxSender<T> {
    pub fn post(&self, msg: T) -> Result<(), T> {
        self.tx.send(msg).map_err(|SendError(msg)| msg)
    }
}
