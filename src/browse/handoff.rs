// Two-slot handoff between the browse preprocess and encode threads

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};

use crate::capture::{CancelToken, Timecode};

/// Number of frames that may be pending between the two threads
pub const HANDOFF_SLOTS: usize = 2;

/// One browse frame ready for encoding
#[derive(Debug, Clone)]
pub struct BrowseFrame {
    /// Planar 4:2:0 picture
    pub video: Vec<u8>,
    /// Interleaved 16-bit stereo
    pub audio: Vec<i16>,
    pub vitc: Option<Timecode>,
    pub ltc: Option<Timecode>,
    /// Running browse frame counter as a timecode
    pub control: Timecode,
    /// Substituted black and silence rather than captured essence
    pub black: bool,
}

#[derive(Debug)]
pub enum Handoff {
    Frame(BrowseFrame),
    EndOfSequence,
}

pub fn channel() -> (HandoffSender, HandoffReceiver) {
    let (tx, rx) = bounded(HANDOFF_SLOTS);
    (HandoffSender { tx }, HandoffReceiver { rx })
}

pub struct HandoffSender {
    tx: Sender<Handoff>,
}

impl HandoffSender {
    /// Block while both slots are pending read. Gives up when any token is
    /// cancelled or the receiver has gone. Returns true if the item was
    /// handed over.
    pub fn send(&self, item: Handoff, poll: Duration, cancel: &[&CancelToken]) -> bool {
        let mut item = item;
        loop {
            match self.tx.send_timeout(item, poll) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(back)) => {
                    if cancel.iter().any(|t| t.is_cancelled()) {
                        return false;
                    }
                    item = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
    }
}

pub struct HandoffReceiver {
    rx: Receiver<Handoff>,
}

impl HandoffReceiver {
    /// `None` on timeout. A closed channel reads as end of sequence.
    pub fn recv(&self, timeout: Duration) -> Option<Handoff> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Handoff::EndOfSequence),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(n: u32) -> Handoff {
        Handoff::Frame(BrowseFrame {
            video: Vec::new(),
            audio: Vec::new(),
            vitc: None,
            ltc: None,
            control: Timecode::from_frames(n, 25),
            black: false,
        })
    }

    #[test]
    fn test_blocks_when_both_slots_pending() {
        let (tx, rx) = channel();
        let cancel = CancelToken::new();
        let poll = Duration::from_millis(5);

        assert!(tx.send(frame(0), poll, &[&cancel]));
        assert!(tx.send(frame(1), poll, &[&cancel]));

        // Third send can't complete until cancelled
        let waiter = {
            let cancel = cancel.clone();
            std::thread::spawn(move || tx.send(frame(2), poll, &[&cancel]))
        };
        std::thread::sleep(Duration::from_millis(30));
        cancel.cancel();
        assert!(!waiter.join().unwrap());

        // FIFO order
        for expected in 0..2 {
            match rx.recv(poll) {
                Some(Handoff::Frame(f)) => assert_eq!(f.control.frames(), expected),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_closed_channel_reads_as_end() {
        let (tx, rx) = channel();
        drop(tx);
        assert!(matches!(rx.recv(Duration::from_millis(1)), Some(Handoff::EndOfSequence)));
    }
}
