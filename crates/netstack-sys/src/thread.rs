//! The protocol thread: a single-owner event loop where the next-timer-deadline drives the
//! mailbox receive timeout; on wake it fires due timers then dispatches one message. This crate
//! provides the loop shape; `netstack` supplies the closures that know about timers and messages.

use std::thread::JoinHandle;
use std::time::Duration;

use crate::mbox::Mailbox;

/// Spawns the single protocol thread. `fire_due_timers` runs first on every wake (whether the
/// wake was a timer deadline or an arriving message) and returns the delay until the next
/// deadline, or `None` if no timer is pending. `dispatch` handles exactly one message per wake,
/// matching the run-to-completion-per-message/packet suspension rule, and returns
/// `false` to ask the loop to stop (the caller's message type carries its own shutdown variant;
/// there's no implicit exit-on-disconnect, since `Mailbox` keeps its own sending half alive).
pub fn spawn<M, FT, FD>(mailbox: std::sync::Arc<Mailbox<M>>, mut fire_due_timers: FT, mut dispatch: FD) -> JoinHandle<()>
where
    M: Send + 'static,
    FT: FnMut() -> Option<Duration> + Send + 'static,
    FD: FnMut(M) -> bool + Send + 'static,
{
    std::thread::Builder::new()
        .name("netstack-protocol".into())
        .spawn(move || loop {
            let next_deadline = fire_due_timers();
            if let Some(msg) = mailbox.fetch(next_deadline) {
                if !dispatch(msg) {
                    break;
                }
            }
        })
        .expect("failed to spawn protocol thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn dispatches_posted_messages_until_shutdown_sentinel() {
        let mailbox = Arc::new(Mailbox::<Option<u32>>::new(4));
        let sender = mailbox.sender();
        let received = Arc::new(AtomicUsize::new(0));
        let received2 = Arc::clone(&received);

        let handle = spawn(
            Arc::clone(&mailbox),
            || None,
            move |msg| match msg {
                Some(n) => {
                    received2.fetch_add(n as usize, Ordering::SeqCst);
                    true
                }
                None => false, // shutdown sentinel
            },
        );

        sender.post(Some(1)).unwrap();
        sender.post(Some(2)).unwrap();
        sender.post(None).unwrap();
        handle.join().unwrap();
        assert_eq!(received.load(Ordering::SeqCst), 3);
    }
}
