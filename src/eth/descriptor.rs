//! Ethernet TX/RX descriptors and completion entries. Grounded on
//! `include/nic/tx_rx.h`.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumMode {
    None,
    Layer3,
    Layer4,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TxFlags {
    pub checksum_offload: bool,
    pub tso: bool,
    pub gso: bool,
    pub vlan_insert: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct TxDescriptor {
    pub buffer_address: u64,
    pub length: u32,
    pub checksum_mode: ChecksumMode,
    pub index: u32,
    pub checksum_value: u16,
    pub flags: TxFlags,
    pub mss: u16,
    pub header_length: u16,
    pub vlan_tag: u16,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RxFlags {
    pub checksum_offload: bool,
    pub vlan_strip: bool,
    pub gro_enable: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct RxDescriptor {
    pub buffer_address: u64,
    pub buffer_length: u32,
    pub checksum_mode: ChecksumMode,
    pub index: u32,
    pub flags: RxFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionCode {
    Success,
    BufferTooSmall,
    ChecksumError,
    NoDescriptor,
    Fault,
    MtuExceeded,
    InvalidMss,
    TooManySegments,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CompletionEntry {
    pub queue_id: u32,
    pub descriptor_index: u32,
    pub status: Option<CompletionCode>,
    pub checksum_verified: bool,
    pub tso_performed: bool,
    pub gso_performed: bool,
    pub vlan_inserted: bool,
    pub vlan_stripped: bool,
    pub gro_aggregated: bool,
    pub segments_produced: u32,
    pub vlan_tag: u16,
}

impl Default for CompletionCode {
    fn default() -> Self {
        CompletionCode::Success
    }
}

/// Fixed-size wire-free encoding used only to give descriptors a stable
/// byte length for storage in a [`crate::ring::DescriptorRing`] slot; there
/// is no real PCIe descriptor format to match here (see design notes).
pub const TX_DESCRIPTOR_WIRE_SIZE: usize = 32;
pub const RX_DESCRIPTOR_WIRE_SIZE: usize = 24;

fn checksum_mode_to_u8(mode: ChecksumMode) -> u8 {
    match mode {
        ChecksumMode::None => 0,
        ChecksumMode::Layer3 => 1,
        ChecksumMode::Layer4 => 2,
    }
}

fn checksum_mode_from_u8(v: u8) -> ChecksumMode {
    match v {
        1 => ChecksumMode::Layer3,
        2 => ChecksumMode::Layer4,
        _ => ChecksumMode::None,
    }
}

fn flags_to_u8(f: &TxFlags) -> u8 {
    (f.checksum_offload as u8) | ((f.tso as u8) << 1) | ((f.gso as u8) << 2) | ((f.vlan_insert as u8) << 3)
}

fn flags_from_u8(v: u8) -> TxFlags {
    TxFlags {
        checksum_offload: v & 1 != 0,
        tso: v & 2 != 0,
        gso: v & 4 != 0,
        vlan_insert: v & 8 != 0,
    }
}

fn rx_flags_to_u8(f: &RxFlags) -> u8 {
    (f.checksum_offload as u8) | ((f.vlan_strip as u8) << 1) | ((f.gro_enable as u8) << 2)
}

fn rx_flags_from_u8(v: u8) -> RxFlags {
    RxFlags {
        checksum_offload: v & 1 != 0,
        vlan_strip: v & 2 != 0,
        gro_enable: v & 4 != 0,
    }
}

impl TxDescriptor {
    pub fn to_bytes(&self) -> [u8; TX_DESCRIPTOR_WIRE_SIZE] {
        let mut buf = [0u8; TX_DESCRIPTOR_WIRE_SIZE];
        buf[0..8].copy_from_slice(&self.buffer_address.to_le_bytes());
        buf[8..12].copy_from_slice(&self.length.to_le_bytes());
        buf[12] = checksum_mode_to_u8(self.checksum_mode);
        buf[13..17].copy_from_slice(&self.index.to_le_bytes());
        buf[17..19].copy_from_slice(&self.checksum_value.to_le_bytes());
        buf[19] = flags_to_u8(&self.flags);
        buf[20..22].copy_from_slice(&self.mss.to_le_bytes());
        buf[22..24].copy_from_slice(&self.header_length.to_le_bytes());
        buf[24..26].copy_from_slice(&self.vlan_tag.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            buffer_address: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            length: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            checksum_mode: checksum_mode_from_u8(buf[12]),
            index: u32::from_le_bytes(buf[13..17].try_into().unwrap()),
            checksum_value: u16::from_le_bytes(buf[17..19].try_into().unwrap()),
            flags: flags_from_u8(buf[19]),
            mss: u16::from_le_bytes(buf[20..22].try_into().unwrap()),
            header_length: u16::from_le_bytes(buf[22..24].try_into().unwrap()),
            vlan_tag: u16::from_le_bytes(buf[24..26].try_into().unwrap()),
        }
    }
}

impl RxDescriptor {
    pub fn to_bytes(&self) -> [u8; RX_DESCRIPTOR_WIRE_SIZE] {
        let mut buf = [0u8; RX_DESCRIPTOR_WIRE_SIZE];
        buf[0..8].copy_from_slice(&self.buffer_address.to_le_bytes());
        buf[8..12].copy_from_slice(&self.buffer_length.to_le_bytes());
        buf[12] = checksum_mode_to_u8(self.checksum_mode);
        buf[13..17].copy_from_slice(&self.index.to_le_bytes());
        buf[17] = rx_flags_to_u8(&self.flags);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            buffer_address: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            buffer_length: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            checksum_mode: checksum_mode_from_u8(buf[12]),
            index: u32::from_le_bytes(buf[13..17].try_into().unwrap()),
            flags: rx_flags_from_u8(buf[17]),
        }
    }
}
