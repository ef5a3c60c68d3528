//! End-to-end SEND/RECV across two independent devices joined by the
//! packet router (scenario S1).

use std::cell::RefCell;
use std::rc::Rc;

use aero_net_roce::config::DeviceConfig;
use aero_net_roce::device::Device;
use aero_net_roce::rdma::engine::RdmaEngineConfig;
use aero_net_roce::rdma::qp::QpModifyParams;
use aero_net_roce::rdma::types::{MrAccess, QpState};
use aero_net_roce::rdma::wqe::{RecvWqe, SendWqe, WqeOpcode};
use aero_net_roce::router::Router;
use aero_net_roce::sgl::{SgEntry, Sgl};

fn rdma_device() -> Rc<RefCell<Device>> {
    let cfg = DeviceConfig {
        enable_rdma: true,
        rdma_config: RdmaEngineConfig::default(),
        ..Default::default()
    };
    Rc::new(RefCell::new(Device::new(cfg).unwrap()))
}

fn bring_up(device: &Rc<RefCell<Device>>, local_qp: u32, remote_qp: u32, remote_ip: [u8; 4]) {
    let mut dev = device.borrow_mut();
    let rdma = dev.rdma_mut().unwrap();
    rdma.modify_qp(local_qp, QpModifyParams { target_state: Some(QpState::Init), ..Default::default() }).unwrap();
    rdma.modify_qp(
        local_qp,
        QpModifyParams {
            target_state: Some(QpState::Rtr),
            dest_qp: Some(remote_qp),
            dest_ip: Some(remote_ip),
            ..Default::default()
        },
    )
    .unwrap();
    rdma.modify_qp(local_qp, QpModifyParams { target_state: Some(QpState::Rts), ..Default::default() }).unwrap();
}

#[test]
fn multi_packet_send_completes_across_devices() {
    let a = rdma_device();
    let b = rdma_device();
    let mut router = Router::new();
    router.register_driver([192, 168, 1, 1], a.clone());
    router.register_driver([192, 168, 1, 2], b.clone());

    let (pd_a, cq_a, qp_a) = {
        let mut dev = a.borrow_mut();
        let rdma = dev.rdma_mut().unwrap();
        let pd = rdma.create_pd().unwrap();
        let cq = rdma.create_cq(None).unwrap();
        (pd, cq, rdma.create_qp(pd, cq, cq).unwrap())
    };
    let (pd_b, cq_b, qp_b) = {
        let mut dev = b.borrow_mut();
        let rdma = dev.rdma_mut().unwrap();
        let pd = rdma.create_pd().unwrap();
        let cq = rdma.create_cq(None).unwrap();
        (pd, cq, rdma.create_qp(pd, cq, cq).unwrap())
    };

    bring_up(&a, qp_a, qp_b, [192, 168, 1, 2]);
    bring_up(&b, qp_b, qp_a, [192, 168, 1, 1]);

    let payload = vec![0x5Au8; 3000]; // spans multiple MTU-1024 packets
    let lkey_a = {
        let mut dev = a.borrow_mut();
        dev.host_memory_mut().write(0, &payload).unwrap();
        dev.rdma_mut().unwrap().create_mr(pd_a, 0, payload.len() as u64, MrAccess::new(MrAccess::LOCAL_READ)).unwrap().0
    };
    let lkey_b = b
        .borrow_mut()
        .rdma_mut()
        .unwrap()
        .create_mr(pd_b, 8192, payload.len() as u64, MrAccess::new(MrAccess::LOCAL_WRITE))
        .unwrap()
        .0;

    b.borrow_mut()
        .rdma_mut()
        .unwrap()
        .post_recv(
            qp_b,
            RecvWqe { wr_id: 1, sgl: Sgl::new(vec![SgEntry { address: 8192, length: payload.len() as u32 }]), lkey: lkey_b },
        )
        .unwrap();
    a.borrow_mut()
        .rdma_mut()
        .unwrap()
        .post_send(
            qp_a,
            SendWqe {
                wr_id: 77,
                opcode: WqeOpcode::Send,
                sgl: Sgl::new(vec![SgEntry { address: 0, length: payload.len() as u32 }]),
                lkey: lkey_a,
                immediate: None,
                remote_addr: 0,
                rkey: 0,
            },
        )
        .unwrap();

    for _ in 0..10 {
        router.process_all();
    }

    let recv_cqe = b.borrow_mut().rdma_mut().unwrap().poll_cq(cq_b).unwrap();
    assert_eq!(recv_cqe.wr_id, 1);
    assert_eq!(recv_cqe.bytes_transferred as usize, payload.len());

    let send_cqe = a.borrow_mut().rdma_mut().unwrap().poll_cq(cq_a).unwrap();
    assert_eq!(send_cqe.wr_id, 77);

    let mut landed = vec![0u8; payload.len()];
    b.borrow().host_memory().read(8192, &mut landed).unwrap();
    assert_eq!(landed, payload);
}
