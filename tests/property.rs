//! Property-based checks for the pieces of the stack with clean
//! algebraic invariants: ring FIFO order, PSN wraparound, packet codec
//! round-trips, MR bounds checking, the QP state machine, and checksum
//! offload.

use proptest::prelude::*;

use aero_net_roce::eth::offload::{compute_checksum, verify_checksum};
use aero_net_roce::rdma::mr::{MemoryRegionTable, MrError};
use aero_net_roce::rdma::packet::{build_packet, parse_packet, Aeth, AethSyndrome, Bth, RdmaOpcode, Reth};
use aero_net_roce::rdma::types::{advance_psn, psn_in_window, MrAccess, QpState, PSN_MASK};
use aero_net_roce::ring::DescriptorRing;

const ALL_STATES: [QpState; 7] =
    [QpState::Reset, QpState::Init, QpState::Rtr, QpState::Rts, QpState::Sqd, QpState::SqErr, QpState::Error];

fn qp_state_strategy() -> impl Strategy<Value = QpState> {
    (0usize..ALL_STATES.len()).prop_map(|i| ALL_STATES[i])
}

proptest! {
    /// Pushing N slots then popping N slots yields them back in FIFO
    /// order regardless of capacity or slot size, as long as pushes
    /// never exceed capacity.
    #[test]
    fn ring_preserves_fifo_order(
        capacity in 1usize..16,
        slot_size in 1usize..32,
        slots in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..32), 1..16),
    ) {
        let slot_size = slot_size.max(1);
        let slots: Vec<Vec<u8>> = slots
            .into_iter()
            .map(|mut s| {
                s.resize(slot_size, 0);
                s
            })
            .take(capacity)
            .collect();
        let mut ring = DescriptorRing::new_in_model(0, capacity, slot_size);
        for slot in &slots {
            ring.push(slot, None, None).unwrap();
        }
        prop_assert_eq!(ring.len(), slots.len());
        for expected in &slots {
            let mut out = vec![0u8; slot_size];
            ring.pop(&mut out, None, None).unwrap();
            prop_assert_eq!(&out, expected);
        }
        prop_assert!(ring.is_empty());
    }

    /// A full ring always rejects a further push, and an empty ring
    /// always rejects a pop, no matter the capacity.
    #[test]
    fn ring_respects_capacity_bounds(capacity in 1usize..16, slot_size in 1usize..16) {
        let mut ring = DescriptorRing::new_in_model(0, capacity, slot_size);
        let slot = vec![0u8; slot_size];
        for _ in 0..capacity {
            ring.push(&slot, None, None).unwrap();
        }
        prop_assert!(ring.is_full());
        prop_assert!(ring.push(&slot, None, None).is_err());

        let mut ring = DescriptorRing::new_in_model(0, capacity, slot_size);
        let mut out = vec![0u8; slot_size];
        prop_assert!(ring.pop(&mut out, None, None).is_err());
    }

    /// `advance_psn` always stays within the 24-bit PSN space and wraps
    /// rather than overflowing.
    #[test]
    fn psn_advance_stays_in_24_bits(psn in 0u32..=PSN_MASK, inc in 0u32..10_000_000) {
        let next = advance_psn(psn, inc);
        prop_assert!(next <= PSN_MASK);
        prop_assert_eq!(next, psn.wrapping_add(inc) & PSN_MASK);
    }

    /// A PSN is always within its own window of size >= 1, and advancing
    /// a PSN by less than the window keeps it inside that window.
    #[test]
    fn psn_window_contains_base_and_respects_size(
        base in 0u32..=PSN_MASK,
        window in 1u32..1_000_000,
        step in 0u32..1_000_000,
    ) {
        prop_assert!(psn_in_window(base, base, window));
        let advanced = advance_psn(base, step);
        prop_assert_eq!(psn_in_window(advanced, base, window), step < window);
    }

    /// Building then parsing a SEND-only packet with an arbitrary payload
    /// round-trips the BTH fields and payload bytes exactly. PSN and
    /// dest QP each get their own 24-bit field on the wire.
    #[test]
    fn send_only_packet_round_trips(
        dest_qp in 0u32..=PSN_MASK,
        psn in 0u32..=PSN_MASK,
        partition_key in any::<u16>(),
        fecn in any::<bool>(),
        becn in any::<bool>(),
        payload in prop::collection::vec(any::<u8>(), 0..256),
    ) {
        let bth = Bth {
            opcode: RdmaOpcode::SendOnly,
            solicited_event: false,
            mig_req: false,
            pad_count: 0,
            transport_version: 0,
            partition_key,
            fecn,
            becn,
            dest_qp,
            ack_request: true,
            psn,
        };
        let packet = build_packet(bth, None, None, None, &payload);
        let parsed = parse_packet(&packet).unwrap();
        prop_assert_eq!(parsed.bth.dest_qp, dest_qp);
        prop_assert_eq!(parsed.bth.psn, psn);
        prop_assert_eq!(parsed.bth.partition_key, partition_key);
        prop_assert_eq!(parsed.bth.fecn, fecn);
        prop_assert_eq!(parsed.bth.becn, becn);
        prop_assert_eq!(parsed.payload, payload);
    }

    /// A WRITE-first packet carrying a RETH round-trips its virtual
    /// address, rkey and DMA length.
    #[test]
    fn write_packet_with_reth_round_trips(
        virtual_address in any::<u64>(),
        rkey in any::<u32>(),
        dma_length in any::<u32>(),
        payload in prop::collection::vec(any::<u8>(), 0..256),
    ) {
        let bth = Bth {
            opcode: RdmaOpcode::RcWriteFirst,
            solicited_event: false,
            mig_req: false,
            pad_count: 0,
            transport_version: 0,
            partition_key: 0xFFFF,
            fecn: false,
            becn: false,
            dest_qp: 1,
            ack_request: false,
            psn: 0,
        };
        let reth = Reth { virtual_address, rkey, dma_length };
        let packet = build_packet(bth, Some(reth), None, None, &payload);
        let parsed = parse_packet(&packet).unwrap();
        let parsed_reth = parsed.reth.unwrap();
        prop_assert_eq!(parsed_reth.virtual_address, virtual_address);
        prop_assert_eq!(parsed_reth.rkey, rkey);
        prop_assert_eq!(parsed_reth.dma_length, dma_length);
        prop_assert_eq!(parsed.payload, payload);
    }

    /// An ACK packet's AETH syndrome and MSN survive the wire round trip.
    #[test]
    fn ack_packet_aeth_round_trips(msn in 0u32..=PSN_MASK) {
        let bth = Bth {
            opcode: RdmaOpcode::RcAck,
            solicited_event: false,
            mig_req: false,
            pad_count: 0,
            transport_version: 0,
            partition_key: 0xFFFF,
            fecn: false,
            becn: false,
            dest_qp: 7,
            ack_request: false,
            psn: 0,
        };
        let aeth = Aeth { syndrome: AethSyndrome::Ack, msn };
        let packet = build_packet(bth, None, Some(aeth), None, b"");
        let parsed = parse_packet(&packet).unwrap();
        let parsed_aeth = parsed.aeth.unwrap();
        prop_assert_eq!(parsed_aeth.syndrome, AethSyndrome::Ack);
        prop_assert_eq!(parsed_aeth.msn, msn);
    }

    /// Flipping any single byte of a built packet makes the ICRC check
    /// fail (the packet never happens to re-encode to the same CRC).
    #[test]
    fn corrupted_packet_fails_icrc(
        payload in prop::collection::vec(any::<u8>(), 1..64),
        flip_index in 0usize..64,
    ) {
        let bth = Bth {
            opcode: RdmaOpcode::SendOnly,
            solicited_event: false,
            mig_req: false,
            pad_count: 0,
            transport_version: 0,
            partition_key: 0xFFFF,
            fecn: false,
            becn: false,
            dest_qp: 3,
            ack_request: false,
            psn: 0,
        };
        let mut packet = build_packet(bth, None, None, None, &payload);
        let flip_index = flip_index % packet.len();
        packet[flip_index] ^= 0xFF;
        prop_assert_eq!(parse_packet(&packet).unwrap_err(), aero_net_roce::rdma::packet::PacketError::IcrcMismatch);
    }

    /// The RFC 1071 checksum always verifies against itself and always
    /// rejects any single flipped bit.
    #[test]
    fn checksum_round_trips_and_detects_corruption(
        mut data in prop::collection::vec(any::<u8>(), 1..128),
        flip_index in 0usize..128,
    ) {
        let checksum = compute_checksum(&data);
        prop_assert!(verify_checksum(&data, checksum));
        let flip_index = flip_index % data.len();
        data[flip_index] ^= 0xFF;
        prop_assert!(!verify_checksum(&data, checksum));
    }

    /// A memory region only validates accesses that lie fully within its
    /// registered `[va, va + length)` range.
    #[test]
    fn mr_bounds_check_matches_interval_containment(
        va in 0u64..1_000_000,
        length in 1u64..100_000,
        addr in 0u64..1_100_000,
        len in 0u64..100_000,
    ) {
        let mut table = MemoryRegionTable::new(4);
        let access = MrAccess::new(MrAccess::LOCAL_READ | MrAccess::LOCAL_WRITE);
        let (lkey, _) = table.register(1, va, length, access).unwrap();
        let result = table.validate_lkey(lkey, addr, len, false);
        let in_bounds = addr >= va && addr.saturating_add(len) <= va.saturating_add(length);
        prop_assert_eq!(result.is_ok(), in_bounds);
    }

    /// Access validation is denied whenever the requested permission bit
    /// is absent, even when the access is fully in bounds.
    #[test]
    fn mr_access_denied_without_permission_bit(
        va in 0u64..1000,
        length in 1u64..1000,
        is_write in any::<bool>(),
    ) {
        let mut table = MemoryRegionTable::new(4);
        let missing_bit = if is_write { MrAccess::LOCAL_READ } else { MrAccess::LOCAL_WRITE };
        let access = MrAccess::new(missing_bit);
        let (lkey, _) = table.register(1, va, length, access).unwrap();
        let result = table.validate_lkey(lkey, va, 1, is_write);
        prop_assert_eq!(result, Err(MrError::AccessDenied));
    }

    /// A deregistered MR never validates again, regardless of the
    /// access pattern requested.
    #[test]
    fn deregistered_mr_never_validates(
        va in 0u64..1000,
        length in 1u64..1000,
        addr in 0u64..1000,
        len in 0u64..1000,
    ) {
        let mut table = MemoryRegionTable::new(4);
        let access = MrAccess::new(MrAccess::LOCAL_READ | MrAccess::LOCAL_WRITE);
        let (lkey, _) = table.register(1, va, length, access).unwrap();
        table.deregister(lkey);
        let result = table.validate_lkey(lkey, addr, len, false);
        prop_assert!(result.is_err());
    }

    /// The QP state machine never allows a transition outside of its
    /// fixed edge set, and every state can always reach Reset.
    #[test]
    fn qp_state_machine_is_consistent(from in qp_state_strategy(), to in qp_state_strategy()) {
        let allowed = from.can_transition_to(to);
        if to == QpState::Reset {
            prop_assert!(allowed);
        }
        // Reset only ever opens onto Init.
        if from == QpState::Reset && to != QpState::Init && to != QpState::Reset {
            prop_assert!(!allowed);
        }
    }
}

#[test]
fn qp_state_machine_has_no_self_loops_except_reset_to_reset() {
    for &state in ALL_STATES.iter() {
        if state != QpState::Reset {
            assert!(!state.can_transition_to(state), "{state:?} should not self-transition");
        }
    }
}
