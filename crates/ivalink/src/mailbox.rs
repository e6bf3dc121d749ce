//! Message delivery to a link task.
//!
//! Data notifications are doorbells: while one is pending, further rings are
//! absorbed, so a burst of notifications costs the task one wakeup. Commands
//! are queued individually and may carry a reply channel for callers that
//! wait on the outcome.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc::{self, Receiver, Sender},
};

use crate::LinkError;

/// What a link task receives.
#[derive(Debug)]
pub(crate) enum Msg<C> {
    /// The previous stage has full buffers, or an empty output buffer came back.
    NewData,
    /// The worker completed a request.
    ProcessedData,
    Command(C),
}

/// Reply channel for a command answered by the link task.
pub(crate) type Reply<T> = Sender<Result<T, LinkError>>;

pub(crate) struct Mailbox<C> {
    tx: Sender<Msg<C>>,
    new_data: AtomicBool,
    processed: AtomicBool,
}

impl<C> Mailbox<C> {
    pub(crate) fn new() -> (Self, Receiver<Msg<C>>) {
        let (tx, rx) = mpsc::channel();
        (
            Self {
                tx,
                new_data: AtomicBool::new(false),
                processed: AtomicBool::new(false),
            },
            rx,
        )
    }

    pub(crate) fn ring_new_data(&self) {
        if !self.new_data.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(Msg::NewData);
        }
    }

    pub(crate) fn ring_processed(&self) {
        if !self.processed.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(Msg::ProcessedData);
        }
    }

    /// Re-arm the doorbell of `msg`. The task calls this before acting on it
    /// so that rings arriving during the work are not lost.
    pub(crate) fn rearm(&self, msg: &Msg<C>) {
        match msg {
            Msg::NewData => self.new_data.store(false, Ordering::Release),
            Msg::ProcessedData => self.processed.store(false, Ordering::Release),
            Msg::Command(_) => {}
        }
    }

    pub(crate) fn command(&self, cmd: C) -> Result<(), LinkError> {
        self.tx
            .send(Msg::Command(cmd))
            .map_err(|_| LinkError::Disconnected)
    }

    /// Send the command built by `build` and wait for its reply.
    pub(crate) fn call<T>(&self, build: impl FnOnce(Reply<T>) -> C) -> Result<T, LinkError> {
        let (reply, answer) = mpsc::channel();
        self.command(build(reply))?;
        answer.recv().map_err(|_| LinkError::Disconnected)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doorbells_coalesce_until_rearmed() {
        let (mailbox, rx) = Mailbox::<()>::new();
        mailbox.ring_new_data();
        mailbox.ring_new_data();
        mailbox.ring_processed();
        let msgs: Vec<_> = rx.try_iter().collect();
        assert_eq!(msgs.len(), 2);
        mailbox.rearm(&msgs[0]);
        mailbox.ring_new_data();
        assert!(matches!(rx.try_recv(), Ok(Msg::NewData)));
    }

    #[test]
    fn call_reports_a_vanished_task() {
        let (mailbox, rx) = Mailbox::<Reply<u8>>::new();
        drop(rx);
        assert_eq!(mailbox.call(|reply| reply), Err(LinkError::Disconnected));
    }

    #[test]
    fn call_returns_the_reply() {
        let (mailbox, rx) = Mailbox::<Reply<u8>>::new();
        let task = std::thread::spawn(move || {
            if let Ok(Msg::Command(reply)) = rx.recv() {
                let _ = reply.send(Ok(7));
            }
        });
        assert_eq!(mailbox.call(|reply| reply), Ok(7));
        task.join().expect("task thread");
    }
}
