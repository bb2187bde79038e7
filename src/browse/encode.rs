// Browse encode thread: drains the handoff into the session's encoder

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::handoff::{Handoff, HandoffReceiver};
use super::BrowseEncoder;
use crate::capture::CancelToken;

/// Encode thread progress, readable after the thread is detached
#[derive(Debug, Default)]
pub struct BrowseProgress {
    frames_encoded: AtomicU64,
    black_frames: AtomicU64,
    failed: AtomicBool,
    finished: AtomicBool,
}

impl BrowseProgress {
    pub fn frames_encoded(&self) -> u64 {
        self.frames_encoded.load(Ordering::SeqCst)
    }

    pub fn black_frames(&self) -> u64 {
        self.black_frames.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

pub(crate) fn spawn(
    encoder: Box<dyn BrowseEncoder>,
    receiver: HandoffReceiver,
    progress: Arc<BrowseProgress>,
    shutdown: CancelToken,
    wait_timeout: Duration,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("ingest-browse-enc".into())
        .spawn(move || {
            run(encoder, receiver, &progress, &shutdown, wait_timeout);
            progress.finished.store(true, Ordering::SeqCst);
        })
}

fn run(
    mut encoder: Box<dyn BrowseEncoder>,
    receiver: HandoffReceiver,
    progress: &BrowseProgress,
    shutdown: &CancelToken,
    wait_timeout: Duration,
) {
    log::info!("Browse encode thread started");
    let mut frame_number = 0u64;

    loop {
        let frame = match receiver.recv(wait_timeout) {
            Some(Handoff::Frame(frame)) => frame,
            Some(Handoff::EndOfSequence) => break,
            None if shutdown.is_cancelled() => break,
            None => continue,
        };

        // After a failure keep draining so the preprocess thread never blocks
        if progress.failed() {
            continue;
        }

        match encoder.encode(&frame.video, &frame.audio, frame_number) {
            Ok(()) => {
                frame_number += 1;
                progress.frames_encoded.fetch_add(1, Ordering::SeqCst);
                if frame.black {
                    progress.black_frames.fetch_add(1, Ordering::SeqCst);
                }
            }
            Err(e) => {
                log::error!("Browse encode failed, dropping the rest of the browse copy: {}", e);
                progress.failed.store(true, Ordering::SeqCst);
            }
        }
    }

    match encoder.finish() {
        Ok(()) => log::info!("Browse encode finished after {} frames", frame_number),
        Err(e) => {
            log::error!("Failed to close browse encoder: {}", e);
            progress.failed.store(true, Ordering::SeqCst);
        }
    }
}
