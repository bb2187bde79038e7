// Fixed-size frame ring shared by the capture thread and its consumers
//
// There are no per-slot locks. A slot for frame N is written only by the
// capture thread before `captured` passes N. Consumers read it only while
// `captured - N < capacity`, which each consumer enforces with its own
// overflow check before and after the read. The debug assertions below
// check the same bound.

use std::cell::UnsafeCell;

use super::timecode::Timecode;
use super::VideoFormat;

/// One frame's storage. Buffer sizes are fixed when the ring is allocated.
pub struct FrameSlot {
    pub video: Vec<u8>,
    /// One buffer per audio pair
    pub audio: Vec<Vec<u8>>,
    pub vitc: Option<Timecode>,
    pub ltc: Option<Timecode>,
}

impl FrameSlot {
    fn new(format: &VideoFormat) -> Self {
        Self {
            video: vec![0; format.video_size()],
            audio: vec![vec![0; format.audio_pair_size()]; format.audio_pairs as usize],
            vitc: None,
            ltc: None,
        }
    }
}

/// Circular array of frame slots plus an optional 8-bit copy of the video
pub struct FrameRing {
    format: VideoFormat,
    capacity: usize,
    slots: Box<[UnsafeCell<FrameSlot>]>,
    reduced: Option<Box<[UnsafeCell<Vec<u8>>]>>,
}

// SAFETY: slot contents are only reached through the `unsafe` accessors,
// whose contracts give the single producer exclusive access to unpublished
// slots and consumers shared access to published slots within the lag bound.
unsafe impl Sync for FrameRing {}

impl FrameRing {
    /// Allocate `capacity` slots. A reduced-depth ring is added when the
    /// source is deeper than 8 bits.
    pub fn new(format: VideoFormat, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(FrameSlot::new(&format)))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let reduced = format.pixel_format.is_full_depth().then(|| {
            (0..capacity)
                .map(|_| UnsafeCell::new(vec![0u8; format.reduced_video_size()]))
                .collect::<Vec<_>>()
                .into_boxed_slice()
        });

        log::info!(
            "Allocated frame ring: {} slots of {} bytes video + {} x {} bytes audio{}",
            capacity,
            format.video_size(),
            format.audio_pairs,
            format.audio_pair_size(),
            if reduced.is_some() { " (+ 8-bit copy)" } else { "" }
        );

        Self {
            format,
            capacity,
            slots,
            reduced,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn format(&self) -> &VideoFormat {
        &self.format
    }

    pub fn has_reduced_copy(&self) -> bool {
        self.reduced.is_some()
    }

    /// Slot index for a frame number. Pure arithmetic.
    pub fn slot_for(&self, frame: u64) -> usize {
        (frame % self.capacity as u64) as usize
    }

    /// True when a consumer at `consumer` has fallen far enough behind
    /// `captured` that the producer may be writing the slot it reads next.
    pub fn is_overflowed(&self, captured: u64, consumer: u64) -> bool {
        captured.saturating_sub(consumer) >= self.capacity as u64 - 1
    }

    /// Mutable access to the slot for `frame`.
    ///
    /// # Safety
    /// Only the capture thread may call this, and `frame` must not yet be
    /// published (`captured <= frame`). No other `slot_mut` borrow of the
    /// same slot may be alive.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slot_mut(&self, frame: u64, captured: u64) -> &mut FrameSlot {
        debug_assert!(frame >= captured, "writing published frame {} (captured {})", frame, captured);
        &mut *self.slots[self.slot_for(frame)].get()
    }

    /// Mutable access to the 8-bit copy for `frame`, if the ring keeps one.
    ///
    /// # Safety
    /// Same contract as [`FrameRing::slot_mut`].
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn reduced_mut(&self, frame: u64, captured: u64) -> Option<&mut [u8]> {
        debug_assert!(frame >= captured);
        let index = self.slot_for(frame);
        self.reduced
            .as_ref()
            .map(|r| (*r[index].get()).as_mut_slice())
    }

    /// Shared access to a published slot.
    ///
    /// # Safety
    /// `frame < captured` and `captured - frame < capacity`. The caller must
    /// re-check the lag after it is done with the slot and discard what it
    /// read if the producer may have lapped it.
    pub unsafe fn slot(&self, frame: u64, captured: u64) -> &FrameSlot {
        debug_assert!(frame < captured, "reading unpublished frame {} (captured {})", frame, captured);
        debug_assert!(
            captured - frame < self.capacity as u64,
            "lag invariant violated: frame {} captured {} capacity {}",
            frame,
            captured,
            self.capacity
        );
        &*self.slots[self.slot_for(frame)].get()
    }

    /// The 8-bit video for a published frame: the reduced copy when there is
    /// one, otherwise the slot's own video.
    ///
    /// # Safety
    /// Same contract as [`FrameRing::slot`].
    pub unsafe fn analysis_video(&self, frame: u64, captured: u64) -> &[u8] {
        match self.reduced.as_ref() {
            Some(r) => {
                debug_assert!(frame < captured && captured - frame < self.capacity as u64);
                (*r[self.slot_for(frame)].get()).as_slice()
            }
            None => self.slot(frame, captured).video.as_slice(),
        }
    }
}
