//! Work queue entries and completion queue entries. Grounded on
//! `include/nic/rocev2/wqe.h`, `cqe.h`.

use crate::sgl::Sgl;
use crate::rdma::types::Handle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WqeOpcode {
    Send,
    SendWithImm,
    Write,
    WriteWithImm,
    Read,
}

#[derive(Debug, Clone)]
pub struct SendWqe {
    pub wr_id: u64,
    pub opcode: WqeOpcode,
    pub sgl: Sgl,
    pub lkey: Handle,
    pub immediate: Option<u32>,
    /// Remote side fields; populated for `Write`/`WriteWithImm`/`Read`.
    pub remote_addr: u64,
    pub rkey: Handle,
}

#[derive(Debug, Clone)]
pub struct RecvWqe {
    pub wr_id: u64,
    pub sgl: Sgl,
    pub lkey: Handle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WqeStatus {
    Success,
    LocalLengthError,
    LocalQpOperationError,
    LocalProtectionError,
    RemoteAccessError,
    RemoteInvalidRequestError,
    RemoteOperationError,
    RetryExceeded,
    RnrRetryExceeded,
    TransportRetryExceeded,
    InvalidQpStateError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CqeOpcode {
    Send,
    Write,
    Read,
    Recv,
    RecvWithImm,
}

#[derive(Debug, Clone, Copy)]
pub struct Cqe {
    pub wr_id: u64,
    pub qp_number: Handle,
    pub opcode: CqeOpcode,
    pub status: WqeStatus,
    pub bytes_transferred: u32,
    pub immediate: Option<u32>,
}
