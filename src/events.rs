//! Typed event bus (spec §9 design note: "observer/signal plumbing becomes
//! a small typed event bus"). Each observable is a plain `crossbeam_channel`
//! of a typed event; the render thread drains the GL-affecting ones
//! (`CoreEvent::TextureReady`, `CoreEvent::TextureUploadFailed`), everything
//! else can be drained by whichever thread the embedder dispatches events
//! on (the façade itself does not assume a UI event loop).

use std::path::PathBuf;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::entry::{ExtractionStatus, PageIndex, TextureKey};

/// Events raised by the core façade and its subsystems. Subscribers receive
/// these via [`EventBus::subscribe`].
#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// First archive member has been extracted into L3.
    FirstFileExtracted { name: String },
    /// Archive extraction progress (supplements spec §4.4's `progress` step;
    /// present in the original implementation, dropped by the distillation).
    ExtractionProgress { done: usize, total: usize },
    /// A page finished decoding and was inserted into L2.
    PageInsertedL2 { page: PageIndex },
    /// A texture became resident in L1 and is ready to draw.
    TextureReady { key: TextureKey },
    /// Extraction for the current archive loader finished (in any terminal
    /// state).
    ExtractionFinished { status: ExtractionStatus },
    /// A page failed to decode; surfaced as a transient UI message.
    DecodeError { page: PageIndex, path: PathBuf, message: String },
    /// A texture upload failed; the page remains un-textured and is retried
    /// on the next navigation.
    UploadError { page: PageIndex, message: String },
    /// Decode finished successfully; carries timing telemetry (present in
    /// the original implementation's `loader.py`, dropped by the
    /// distillation).
    DecodeTiming { page: PageIndex, elapsed: Duration },
}

/// A single-producer/multi-consumer style bus: every subscriber gets its own
/// receiver fed from the same sender set, so a slow subscriber cannot block
/// another one (each receiver is independently bounded by nothing but its
/// own consumption rate — unbounded, since these are low-volume control
/// events, never pixel data).
#[derive(Clone)]
pub struct EventBus {
    senders: std::sync::Arc<parking_lot::Mutex<Vec<Sender<CoreEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self { senders: std::sync::Arc::new(parking_lot::Mutex::new(Vec::new())) }
    }

    /// Register a new subscriber; returns the receiving end.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        let (tx, rx) = unbounded();
        self.senders.lock().push(tx);
        rx
    }

    /// Publish an event to every live subscriber. Disconnected subscribers
    /// are pruned lazily.
    pub fn publish(&self, event: CoreEvent) {
        let mut senders = self.senders.lock();
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
