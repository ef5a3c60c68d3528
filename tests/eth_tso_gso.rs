//! Ethernet TSO/GSO segmentation and checksum offload driven through the
//! full `Device` facade (scenario S6).

use aero_net_roce::config::DeviceConfig;
use aero_net_roce::device::Device;
use aero_net_roce::eth::descriptor::{ChecksumMode, CompletionCode, RxDescriptor, RxFlags, TxDescriptor, TxFlags};
use aero_net_roce::eth::queue_pair::EthQueuePairConfig;

fn single_queue_device(max_mtu: u32) -> Device {
    let cfg = DeviceConfig {
        queue_pair_config: vec![EthQueuePairConfig {
            queue_id: 0,
            tx_capacity: 8,
            rx_capacity: 8,
            tx_cq_capacity: 8,
            rx_cq_capacity: 8,
            weight: 1,
            max_mtu,
            enable_tx_interrupts: false,
            enable_rx_interrupts: false,
        }],
        ..Default::default()
    };
    Device::new(cfg).unwrap()
}

#[test]
fn tso_segments_a_large_frame_and_replicates_the_header() {
    let mut device = single_queue_device(9000);
    let header = vec![0xEEu8; 14];
    let mut payload = header.clone();
    payload.extend(vec![0x11u8; 4000]);
    device.host_memory_mut().write(0, &payload).unwrap();

    let queue = device.queues_mut().queue_mut(0).unwrap();
    for i in 0..4 {
        queue.push_rx_descriptor(RxDescriptor {
            buffer_address: 16384 + i * 2048,
            buffer_length: 2000,
            checksum_mode: ChecksumMode::None,
            index: i as u32,
            flags: RxFlags::default(),
        });
    }
    queue.push_tx_descriptor(TxDescriptor {
        buffer_address: 0,
        length: payload.len() as u32,
        checksum_mode: ChecksumMode::None,
        index: 0,
        checksum_value: 0,
        flags: TxFlags { tso: true, ..Default::default() },
        mss: 1400,
        header_length: 14,
        vlan_tag: 0,
    });

    let mut sink = Vec::new();
    assert!(device.process_once(|p| sink.push(p)));
    assert!(sink.is_empty()); // Ethernet loopback never reaches the router sink

    let queue = device.queues_mut().queue_mut(0).unwrap();
    let tx_completion = queue.tx_cq_mut().pop().unwrap();
    assert_eq!(tx_completion.status, Some(CompletionCode::Success));
    assert!(tx_completion.tso_performed);
    assert_eq!(tx_completion.segments_produced, 3);

    // Every segment carries the 14-byte header plus its slice of the body.
    for _ in 0..3 {
        let rx_completion = queue.rx_cq_mut().pop().unwrap();
        assert_eq!(rx_completion.status, Some(CompletionCode::Success));
    }
}

#[test]
fn gso_segments_without_counting_as_tso() {
    let mut device = single_queue_device(9000);
    let header = vec![0xAB; 8];
    let mut payload = header.clone();
    payload.extend(vec![0x22u8; 2500]);
    device.host_memory_mut().write(0, &payload).unwrap();

    let queue = device.queues_mut().queue_mut(0).unwrap();
    for i in 0..4 {
        queue.push_rx_descriptor(RxDescriptor {
            buffer_address: 20000 + i * 2048,
            buffer_length: 2000,
            checksum_mode: ChecksumMode::None,
            index: i as u32,
            flags: RxFlags::default(),
        });
    }
    queue.push_tx_descriptor(TxDescriptor {
        buffer_address: 0,
        length: payload.len() as u32,
        checksum_mode: ChecksumMode::None,
        index: 0,
        checksum_value: 0,
        flags: TxFlags { gso: true, ..Default::default() },
        mss: 1000,
        header_length: 8,
        vlan_tag: 0,
    });

    let mut sink = Vec::new();
    device.process_once(|p| sink.push(p));

    let queue = device.queues_mut().queue_mut(0).unwrap();
    let tx_completion = queue.tx_cq_mut().pop().unwrap();
    assert!(tx_completion.gso_performed);
    assert!(!tx_completion.tso_performed);
    assert_eq!(tx_completion.segments_produced, 3);
}

#[test]
fn checksum_offload_is_verified_on_receive() {
    let mut device = single_queue_device(1500);
    let payload = b"checksum this frame".to_vec();
    device.host_memory_mut().write(0, &payload).unwrap();
    let checksum = aero_net_roce::eth::offload::compute_checksum(&payload);

    let queue = device.queues_mut().queue_mut(0).unwrap();
    queue.push_rx_descriptor(RxDescriptor {
        buffer_address: 4096,
        buffer_length: 64,
        checksum_mode: ChecksumMode::Layer4,
        index: 0,
        flags: RxFlags { checksum_offload: true, ..Default::default() },
    });
    queue.push_tx_descriptor(TxDescriptor {
        buffer_address: 0,
        length: payload.len() as u32,
        checksum_mode: ChecksumMode::Layer4,
        index: 0,
        checksum_value: checksum,
        flags: TxFlags::default(),
        mss: 0,
        header_length: 0,
        vlan_tag: 0,
    });

    let mut sink = Vec::new();
    device.process_once(|p| sink.push(p));

    let queue = device.queues_mut().queue_mut(0).unwrap();
    let rx_completion = queue.rx_cq_mut().pop().unwrap();
    assert_eq!(rx_completion.status, Some(CompletionCode::Success));

    let mut landed = vec![0u8; payload.len()];
    device.host_memory().read(4096, &mut landed).unwrap();
    assert_eq!(landed, payload);
}

#[test]
fn mismatched_checksum_is_rejected() {
    let mut device = single_queue_device(1500);
    let payload = b"this will not match".to_vec();
    device.host_memory_mut().write(0, &payload).unwrap();

    let queue = device.queues_mut().queue_mut(0).unwrap();
    queue.push_rx_descriptor(RxDescriptor {
        buffer_address: 4096,
        buffer_length: 64,
        checksum_mode: ChecksumMode::Layer4,
        index: 0,
        flags: RxFlags::default(),
    });
    queue.push_tx_descriptor(TxDescriptor {
        buffer_address: 0,
        length: payload.len() as u32,
        checksum_mode: ChecksumMode::Layer4,
        index: 0,
        checksum_value: 0xDEAD,
        flags: TxFlags::default(),
        mss: 0,
        header_length: 0,
        vlan_tag: 0,
    });

    let mut sink = Vec::new();
    device.process_once(|p| sink.push(p));

    let queue = device.queues_mut().queue_mut(0).unwrap();
    let rx_completion = queue.rx_cq_mut().pop().unwrap();
    assert_eq!(rx_completion.status, Some(CompletionCode::ChecksumError));
    assert_eq!(queue.stats().drops_checksum, 1);
}
