//! RDMA completion queue: bounded FIFO of CQEs with an arm/notify gate.
//! Grounded on `include/nic/rocev2/completion_queue.h`,
//! `src/rocev2/completion_queue.cpp`.

use std::collections::VecDeque;

use crate::rdma::wqe::Cqe;

pub struct RdmaCompletionQueue {
    capacity: usize,
    entries: VecDeque<Cqe>,
    armed: bool,
    has_new: bool,
}

impl RdmaCompletionQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
            armed: false,
            has_new: false,
        }
    }

    pub fn post(&mut self, cqe: Cqe) -> bool {
        if self.entries.len() >= self.capacity {
            return false;
        }
        self.entries.push_back(cqe);
        self.has_new = true;
        true
    }

    pub fn poll(&mut self) -> Option<Cqe> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn arm(&mut self) {
        self.armed = true;
        self.has_new = false;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Consumes the armed+has-new state, returning whether a notification
    /// should fire. Mirrors one-shot MSI-X-style "request notification".
    pub fn take_notification(&mut self) -> bool {
        if self.armed && self.has_new {
            self.armed = false;
            self.has_new = false;
            true
        } else {
            false
        }
    }
}
