//! Frame-indexed deferred destruction.
//!
//! Resources released while a frame may still read them are queued with
//! the frame index that last used them and dropped only once that frame
//! is past the in-flight horizon.

/// Frames that may still be in flight when a resource is retired.
pub const IN_FLIGHT_FRAMES: u64 = 1;

pub(crate) type DestroyFn = Box<dyn FnOnce() + Send + Sync>;

/// Deferred-destroy queue keyed by frame index.
#[derive(Default)]
pub struct RetireQueue {
    entries: Vec<(u64, DestroyFn)>,
}

impl RetireQueue {
    /// Queue a destructor for a resource last used in `frame`.
    pub fn defer(&mut self, frame: u64, destroy: DestroyFn) {
        self.entries.push((frame, destroy));
    }

    /// Run every destructor whose frame is older than the in-flight
    /// horizon relative to `current_frame`. Returns how many ran.
    pub fn retire_all(&mut self, current_frame: u64) -> usize {
        let mut kept = Vec::new();
        let mut retired = 0;
        for (frame, destroy) in self.entries.drain(..) {
            if frame + IN_FLIGHT_FRAMES <= current_frame {
                destroy();
                retired += 1;
            } else {
                kept.push((frame, destroy));
            }
        }
        self.entries = kept;
        retired
    }

    /// Pending destructor count.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for RetireQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetireQueue")
            .field("pending", &self.entries.len())
            .finish()
    }
}
