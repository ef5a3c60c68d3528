//! Masked notification with a callback and a `(queue id, index)` payload.
//! Grounded on `include/nic/doorbell.h`, `src/doorbell.cpp`.

pub type DoorbellCallback = Box<dyn FnMut(u32, u32)>;

pub struct Doorbell {
    queue_id: u32,
    masked: bool,
    callback: Option<DoorbellCallback>,
    ring_count: u64,
}

impl Doorbell {
    pub fn new(queue_id: u32) -> Self {
        Self {
            queue_id,
            masked: false,
            callback: None,
            ring_count: 0,
        }
    }

    pub fn with_callback(mut self, callback: DoorbellCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn set_mask(&mut self, masked: bool) {
        self.masked = masked;
    }

    pub fn is_masked(&self) -> bool {
        self.masked
    }

    pub fn ring_count(&self) -> u64 {
        self.ring_count
    }

    #[tracing::instrument(level = "trace", skip(self))]
    pub fn ring(&mut self, index: u32) {
        if self.masked {
            return;
        }
        self.ring_count += 1;
        if let Some(cb) = &mut self.callback {
            cb(self.queue_id, index);
        }
    }
}
