// crates/tapecut-media/src/preview.rs
//
// PreviewService: background frame grabs for the trim view's start and end
// previews.
//
// Threads:
//   One decode thread per PreviewSlot. Each blocks on its own latest-wins
//   request slot (Mutex<Option<Job>> + Condvar). A new request overwrites
//   whatever is still waiting, so a user dragging the start handle produces
//   one grab for the position where they stopped, not one per mouse event.
//
// Cancellation:
//   Every request bumps the slot's generation counter. A decode already in
//   flight runs to completion (MediaSession grabs are not interruptible) and
//   its result is dropped if the generation moved on meanwhile. Cancelled
//   requests deliver nothing; requests for the other slot are unaffected.
//
// Shutdown:
//   A Job::Shutdown poison pill wakes each thread; both are joined.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};
use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};
use parking_lot::{Condvar, Mutex};

use tapecut_core::config::PreviewConfig;
use tapecut_core::helpers::geometry::{center_offset, fit_within};
use tapecut_core::media_types::{PreviewResult, PreviewSlot, PreviewTicket, VideoFrame};

use crate::session::MediaSession;

enum Job {
    Grab { generation: u64, session: Arc<MediaSession>, timestamp: f64 },
    Shutdown,
}

#[derive(Default)]
struct SlotShared {
    pending: Mutex<Option<Job>>,
    wake:    Condvar,
    latest:  AtomicU64,
}

impl SlotShared {
    fn put(&self, job: Job) {
        *self.pending.lock() = Some(job);
        self.wake.notify_one();
    }

    fn take(&self) -> Job {
        let mut guard = self.pending.lock();
        loop {
            if let Some(job) = guard.take() {
                return job;
            }
            self.wake.wait(&mut guard);
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.latest.load(Ordering::Acquire) == generation
    }
}

pub struct PreviewService {
    slots:        [Arc<SlotShared>; 2],
    threads:      Vec<JoinHandle<()>>,
    results_rx:   Receiver<PreviewResult>,
    preview_size: (u32, u32),
}

impl PreviewService {
    pub fn new(config: &PreviewConfig) -> Self {
        let (tx, results_rx) = unbounded();
        let slots: [Arc<SlotShared>; 2] = [Arc::default(), Arc::default()];
        let preview_size = config.preview_size();

        let threads = PreviewSlot::ALL
            .iter()
            .zip(slots.iter())
            .filter_map(|(&slot, shared)| {
                let shared = Arc::clone(shared);
                let tx = tx.clone();
                thread::Builder::new()
                    .name(format!("tapecut-preview-{}", slot.label()))
                    .spawn(move || preview_loop(slot, &shared, &tx, preview_size))
                    .map_err(|e| tracing::error!(slot = slot.label(), error = %e, "preview thread spawn failed"))
                    .ok()
            })
            .collect();

        Self { slots, threads, results_rx, preview_size }
    }

    /// Results of non-cancelled requests, in completion order.
    pub fn results(&self) -> &Receiver<PreviewResult> {
        &self.results_rx
    }

    pub fn preview_size(&self) -> (u32, u32) {
        self.preview_size
    }

    /// Ask for the frame at `timestamp` in `slot`, superseding any earlier
    /// request for the same slot.
    pub fn request_preview(
        &self,
        session:   &Arc<MediaSession>,
        timestamp: f64,
        slot:      PreviewSlot,
    ) -> PreviewTicket {
        let shared = &self.slots[slot_index(slot)];
        let generation = shared.latest.fetch_add(1, Ordering::AcqRel) + 1;
        shared.put(Job::Grab { generation, session: Arc::clone(session), timestamp });
        tracing::trace!(slot = slot.label(), generation, timestamp, "preview requested");
        PreviewTicket { slot, generation }
    }

    /// Stop and join both decode threads. Pending requests are dropped.
    pub fn shutdown(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        for shared in &self.slots {
            shared.latest.fetch_add(1, Ordering::AcqRel);
            shared.put(Job::Shutdown);
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        tracing::debug!("preview service stopped");
    }
}

impl Drop for PreviewService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn slot_index(slot: PreviewSlot) -> usize {
    match slot {
        PreviewSlot::Start => 0,
        PreviewSlot::End   => 1,
    }
}

fn preview_loop(slot: PreviewSlot, shared: &SlotShared, tx: &Sender<PreviewResult>, size: (u32, u32)) {
    loop {
        let (generation, session, timestamp) = match shared.take() {
            Job::Shutdown => return,
            Job::Grab { generation, session, timestamp } => (generation, session, timestamp),
        };
        if !shared.is_current(generation) {
            continue;
        }

        let frame = session.grab_frame_at(timestamp);

        // Superseded while decoding: drop the result.
        if !shared.is_current(generation) {
            tracing::trace!(slot = slot.label(), generation, "preview discarded");
            continue;
        }

        let ticket = PreviewTicket { slot, generation };
        let result = match frame {
            Some(frame) => PreviewResult::Frame { ticket, timestamp, frame: letterbox(&frame, size) },
            None        => PreviewResult::NoFrame { ticket, timestamp },
        };
        if tx.send(result).is_err() {
            return;
        }
    }
}

/// Fit `frame` into a `(box_w, box_h)` black canvas, keeping its aspect ratio.
pub fn letterbox(frame: &VideoFrame, (box_w, box_h): (u32, u32)) -> VideoFrame {
    let mut canvas = RgbaImage::from_pixel(box_w, box_h, Rgba([0, 0, 0, 255]));

    if let Some(src) = RgbaImage::from_raw(frame.width, frame.height, frame.data.clone()) {
        let (w, h) = fit_within(frame.width, frame.height, box_w, box_h);
        let scaled = if (w, h) == (frame.width, frame.height) {
            src
        } else {
            imageops::resize(&src, w, h, FilterType::Triangle)
        };
        let (x, y) = center_offset(w, h, box_w, box_h);
        imageops::overlay(&mut canvas, &scaled, i64::from(x), i64::from(y));
    }

    VideoFrame { width: box_w, height: box_h, timestamp: frame.timestamp, data: canvas.into_raw() }
}
