//! In-process packet fabric: registers devices by IP and forwards
//! generated RoCEv2 packets peer-to-peer. Grounded on
//! `driver/src/packet_router.cpp`'s two-phase "collect all packets from
//! all drivers, then route" pattern, generalized from its `NicDriver*`
//! registry to an `Rc<RefCell<Device>>` one.
//!
//! Only RoCEv2 (UDP/4791 data + CNP) traffic ever crosses the router; the
//! Ethernet queue-pair datapath loops TX back to RX within the same
//! `Device`/`QueueManager` and never reaches here.

use std::cell::RefCell;
use std::rc::Rc;

use crate::device::Device;
use crate::rdma::engine::OutgoingPacket;

struct Entry {
    ip: [u8; 4],
    device: Rc<RefCell<Device>>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RouterStats {
    pub routed: u64,
    pub undeliverable: u64,
}

#[derive(Default)]
pub struct Router {
    drivers: Vec<Entry>,
    stats: RouterStats,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> RouterStats {
        self.stats
    }

    #[tracing::instrument(level = "trace", skip(self, device))]
    pub fn register_driver(&mut self, ip: [u8; 4], device: Rc<RefCell<Device>>) {
        if let Some(entry) = self.drivers.iter_mut().find(|e| e.ip == ip) {
            entry.device = device;
            return;
        }
        self.drivers.push(Entry { ip, device });
    }

    #[tracing::instrument(level = "trace", skip(self))]
    pub fn unregister_driver(&mut self, ip: [u8; 4]) {
        self.drivers.retain(|e| e.ip != ip);
    }

    fn find_driver(&self, ip: [u8; 4]) -> Option<Rc<RefCell<Device>>> {
        self.drivers.iter().find(|e| e.ip == ip).map(|e| e.device.clone())
    }

    /// Delivers one packet to whichever registered device owns
    /// `dest_ip`, then immediately routes any response packets that
    /// delivery produced (ACK/NAK/CNP/READ response), since those are
    /// generated synchronously rather than queued for a later round.
    /// Returns `true` if a destination was found for the original packet.
    #[tracing::instrument(level = "trace", skip(self, data))]
    pub fn route_packet(&mut self, data: &[u8], dest_ip: [u8; 4]) -> bool {
        let Some(dest) = self.find_driver(dest_ip) else {
            self.stats.undeliverable += 1;
            tracing::warn!(ip = ?dest_ip, "route failed: no device for destination");
            return false;
        };
        let responses = dest.borrow_mut().deliver_rdma_packet(data);
        self.stats.routed += 1;
        for response in responses {
            self.route_packet(&response.data, response.dest_ip);
        }
        true
    }

    /// Routes a batch of already-generated packets (e.g. drained from one
    /// device's `process_once`), returning how many found a live
    /// destination.
    pub fn route_many(&mut self, packets: impl IntoIterator<Item = OutgoingPacket>) -> usize {
        let mut routed = 0;
        for packet in packets {
            if self.route_packet(&packet.data, packet.dest_ip) {
                routed += 1;
            }
        }
        routed
    }

    /// Services one round of every registered device (Ethernet queues
    /// plus, if enabled, RDMA packet generation), collecting every
    /// outgoing RDMA packet from every device *before* routing any of
    /// them — mirroring the two-phase collect-then-route shape of the
    /// original fabric, so routing into one device never races with
    /// collection from another.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn process_all(&mut self) -> usize {
        let mut pending = Vec::new();
        for entry in &self.drivers {
            let mut device = entry.device.borrow_mut();
            device.process_once(|packet| pending.push(packet));
        }
        self.route_many(pending)
    }
}
