//! RoCEv2 packet codec: BTH/RETH/AETH builder and parser, plus the
//! Invariant CRC (CRC-32C). Grounded on `include/nic/rocev2/packet.h`.

pub const BTH_SIZE: usize = 12;
pub const RETH_SIZE: usize = 16;
pub const AETH_SIZE: usize = 4;
pub const IMMEDIATE_SIZE: usize = 4;
pub const ICRC_SIZE: usize = 4;

pub const ROCEV2_UDP_PORT: u16 = 4791;
pub const CNP_DSCP: u8 = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RdmaOpcode {
    SendFirst,
    SendMiddle,
    SendLast,
    SendLastImm,
    SendOnly,
    SendOnlyImm,
    RcWriteFirst,
    RcWriteMiddle,
    RcWriteLast,
    RcWriteLastImm,
    RcWriteOnly,
    RcWriteOnlyImm,
    RcReadRequest,
    RcReadResponseFirst,
    RcReadResponseMiddle,
    RcReadResponseLast,
    RcReadResponseOnly,
    RcAck,
    Cnp,
}

impl RdmaOpcode {
    pub fn to_u8(self) -> u8 {
        use RdmaOpcode::*;
        match self {
            SendFirst => 0x00,
            SendMiddle => 0x01,
            SendLast => 0x02,
            SendLastImm => 0x03,
            SendOnly => 0x04,
            SendOnlyImm => 0x05,
            RcWriteFirst => 0x06,
            RcWriteMiddle => 0x07,
            RcWriteLast => 0x08,
            RcWriteLastImm => 0x09,
            RcWriteOnly => 0x0A,
            RcWriteOnlyImm => 0x0B,
            RcReadRequest => 0x0C,
            RcReadResponseFirst => 0x0D,
            RcReadResponseMiddle => 0x0E,
            RcReadResponseLast => 0x0F,
            RcReadResponseOnly => 0x10,
            RcAck => 0x11,
            Cnp => 0x81,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        use RdmaOpcode::*;
        Some(match v {
            0x00 => SendFirst,
            0x01 => SendMiddle,
            0x02 => SendLast,
            0x03 => SendLastImm,
            0x04 => SendOnly,
            0x05 => SendOnlyImm,
            0x06 => RcWriteFirst,
            0x07 => RcWriteMiddle,
            0x08 => RcWriteLast,
            0x09 => RcWriteLastImm,
            0x0A => RcWriteOnly,
            0x0B => RcWriteOnlyImm,
            0x0C => RcReadRequest,
            0x0D => RcReadResponseFirst,
            0x0E => RcReadResponseMiddle,
            0x0F => RcReadResponseLast,
            0x10 => RcReadResponseOnly,
            0x11 => RcAck,
            0x81 => Cnp,
            _ => return None,
        })
    }

    pub fn has_immediate(self) -> bool {
        matches!(
            self,
            RdmaOpcode::SendLastImm
                | RdmaOpcode::SendOnlyImm
                | RdmaOpcode::RcWriteLastImm
                | RdmaOpcode::RcWriteOnlyImm
        )
    }

    pub fn has_reth(self) -> bool {
        matches!(
            self,
            RdmaOpcode::RcWriteFirst
                | RdmaOpcode::RcWriteOnly
                | RdmaOpcode::RcWriteOnlyImm
                | RdmaOpcode::RcReadRequest
        )
    }

    pub fn has_aeth(self) -> bool {
        matches!(
            self,
            RdmaOpcode::RcAck
                | RdmaOpcode::RcReadResponseFirst
                | RdmaOpcode::RcReadResponseOnly
                | RdmaOpcode::RcReadResponseLast
        )
    }

    pub fn is_first(self) -> bool {
        matches!(
            self,
            RdmaOpcode::SendFirst | RdmaOpcode::RcWriteFirst | RdmaOpcode::RcReadResponseFirst
        )
    }

    pub fn is_last_or_only(self) -> bool {
        matches!(
            self,
            RdmaOpcode::SendLast
                | RdmaOpcode::SendLastImm
                | RdmaOpcode::SendOnly
                | RdmaOpcode::SendOnlyImm
                | RdmaOpcode::RcWriteLast
                | RdmaOpcode::RcWriteLastImm
                | RdmaOpcode::RcWriteOnly
                | RdmaOpcode::RcWriteOnlyImm
                | RdmaOpcode::RcReadResponseLast
                | RdmaOpcode::RcReadResponseOnly
        )
    }

    pub fn is_only(self) -> bool {
        matches!(
            self,
            RdmaOpcode::SendOnly
                | RdmaOpcode::SendOnlyImm
                | RdmaOpcode::RcWriteOnly
                | RdmaOpcode::RcWriteOnlyImm
                | RdmaOpcode::RcReadResponseOnly
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AethSyndrome {
    Ack,
    RnrNak,
    PsnSeqError,
    InvalidRequest,
    RemoteAccessError,
    RemoteOpError,
}

impl AethSyndrome {
    fn to_u8(self) -> u8 {
        match self {
            AethSyndrome::Ack => 0x00,
            AethSyndrome::RnrNak => 0x20,
            AethSyndrome::PsnSeqError => 0x60,
            AethSyndrome::InvalidRequest => 0x61,
            AethSyndrome::RemoteAccessError => 0x62,
            AethSyndrome::RemoteOpError => 0x63,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0x20 => AethSyndrome::RnrNak,
            0x60 => AethSyndrome::PsnSeqError,
            0x61 => AethSyndrome::InvalidRequest,
            0x62 => AethSyndrome::RemoteAccessError,
            0x63 => AethSyndrome::RemoteOpError,
            _ => AethSyndrome::Ack,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Bth {
    pub opcode: RdmaOpcode,
    pub solicited_event: bool,
    pub mig_req: bool,
    pub pad_count: u8,
    pub transport_version: u8,
    pub partition_key: u16,
    pub fecn: bool,
    pub becn: bool,
    pub dest_qp: u32,
    pub ack_request: bool,
    pub psn: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct Reth {
    pub virtual_address: u64,
    pub rkey: u32,
    pub dma_length: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct Aeth {
    pub syndrome: AethSyndrome,
    pub msn: u32,
}

#[derive(Debug, Clone)]
pub struct ParsedPacket {
    pub bth: Bth,
    pub reth: Option<Reth>,
    pub aeth: Option<Aeth>,
    pub immediate: Option<u32>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    TooShort,
    UnknownOpcode,
    IcrcMismatch,
}

/// Builds a RoCEv2 packet: BTH + optional RETH/AETH/Immediate + payload +
/// ICRC, all big-endian on the wire.
pub fn build_packet(
    bth: Bth,
    reth: Option<Reth>,
    aeth: Option<Aeth>,
    immediate: Option<u32>,
    payload: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(BTH_SIZE + RETH_SIZE + AETH_SIZE + IMMEDIATE_SIZE + payload.len() + ICRC_SIZE);
    write_bth(&mut out, &bth);
    if let Some(r) = reth {
        write_reth(&mut out, &r);
    }
    if let Some(imm) = immediate {
        out.extend_from_slice(&imm.to_be_bytes());
    }
    if let Some(a) = aeth {
        write_aeth(&mut out, &a);
    }
    out.extend_from_slice(payload);
    let crc = crc32c(&out);
    out.extend_from_slice(&crc.to_be_bytes());
    out
}

fn write_bth(out: &mut Vec<u8>, bth: &Bth) {
    out.push(bth.opcode.to_u8());
    let flags = ((bth.solicited_event as u8) << 7)
        | ((bth.mig_req as u8) << 6)
        | ((bth.pad_count & 0x3) << 4)
        | (bth.transport_version & 0xF);
    out.push(flags);
    out.extend_from_slice(&bth.partition_key.to_be_bytes());
    let reserved = ((bth.fecn as u8) << 7) | ((bth.becn as u8) << 6);
    out.push(reserved);
    out.push(((bth.dest_qp >> 16) & 0xFF) as u8);
    out.push(((bth.dest_qp >> 8) & 0xFF) as u8);
    out.push((bth.dest_qp & 0xFF) as u8);
    out.push((bth.ack_request as u8) << 7);
    out.push(((bth.psn >> 16) & 0xFF) as u8);
    out.push(((bth.psn >> 8) & 0xFF) as u8);
    out.push((bth.psn & 0xFF) as u8);
}

fn read_bth(data: &[u8]) -> Result<Bth, PacketError> {
    if data.len() < BTH_SIZE {
        return Err(PacketError::TooShort);
    }
    let opcode = RdmaOpcode::from_u8(data[0]).ok_or(PacketError::UnknownOpcode)?;
    let flags = data[1];
    let solicited_event = flags & 0x80 != 0;
    let mig_req = flags & 0x40 != 0;
    let pad_count = (flags >> 4) & 0x3;
    let transport_version = flags & 0xF;
    let partition_key = u16::from_be_bytes([data[2], data[3]]);
    let fecn = data[4] & 0x80 != 0;
    let becn = data[4] & 0x40 != 0;
    let dest_qp = ((data[5] as u32) << 16) | ((data[6] as u32) << 8) | data[7] as u32;
    let ack_request = data[8] & 0x80 != 0;
    let psn = ((data[9] as u32) << 16) | ((data[10] as u32) << 8) | data[11] as u32;
    Ok(Bth {
        opcode,
        solicited_event,
        mig_req,
        pad_count,
        transport_version,
        partition_key,
        fecn,
        becn,
        dest_qp,
        ack_request,
        psn,
    })
}

fn write_reth(out: &mut Vec<u8>, reth: &Reth) {
    out.extend_from_slice(&reth.virtual_address.to_be_bytes());
    out.extend_from_slice(&reth.rkey.to_be_bytes());
    out.extend_from_slice(&reth.dma_length.to_be_bytes());
}

fn read_reth(data: &[u8]) -> Result<Reth, PacketError> {
    if data.len() < RETH_SIZE {
        return Err(PacketError::TooShort);
    }
    Ok(Reth {
        virtual_address: u64::from_be_bytes(data[0..8].try_into().unwrap()),
        rkey: u32::from_be_bytes(data[8..12].try_into().unwrap()),
        dma_length: u32::from_be_bytes(data[12..16].try_into().unwrap()),
    })
}

fn write_aeth(out: &mut Vec<u8>, aeth: &Aeth) {
    out.push(aeth.syndrome.to_u8());
    let msn = aeth.msn & 0x00FF_FFFF;
    out.push(((msn >> 16) & 0xFF) as u8);
    out.push(((msn >> 8) & 0xFF) as u8);
    out.push((msn & 0xFF) as u8);
}

fn read_aeth(data: &[u8]) -> Result<Aeth, PacketError> {
    if data.len() < AETH_SIZE {
        return Err(PacketError::TooShort);
    }
    let syndrome = AethSyndrome::from_u8(data[0]);
    let msn = ((data[1] as u32) << 16) | ((data[2] as u32) << 8) | data[3] as u32;
    Ok(Aeth { syndrome, msn })
}

/// Parses a full RoCEv2 packet (BTH..ICRC), verifying the ICRC.
pub fn parse_packet(data: &[u8]) -> Result<ParsedPacket, PacketError> {
    if data.len() < BTH_SIZE + ICRC_SIZE {
        return Err(PacketError::TooShort);
    }
    let body = &data[..data.len() - ICRC_SIZE];
    let expected_crc = u32::from_be_bytes(data[data.len() - ICRC_SIZE..].try_into().unwrap());
    if crc32c(body) != expected_crc {
        return Err(PacketError::IcrcMismatch);
    }
    let bth = read_bth(body)?;
    let mut offset = BTH_SIZE;
    let reth = if bth.opcode.has_reth() {
        let r = read_reth(&body[offset..])?;
        offset += RETH_SIZE;
        Some(r)
    } else {
        None
    };
    let immediate = if bth.opcode.has_immediate() {
        if body.len() < offset + IMMEDIATE_SIZE {
            return Err(PacketError::TooShort);
        }
        let imm = u32::from_be_bytes(body[offset..offset + IMMEDIATE_SIZE].try_into().unwrap());
        offset += IMMEDIATE_SIZE;
        Some(imm)
    } else {
        None
    };
    let aeth = if bth.opcode.has_aeth() {
        let a = read_aeth(&body[offset..])?;
        offset += AETH_SIZE;
        Some(a)
    } else {
        None
    };
    let payload = body[offset..].to_vec();
    Ok(ParsedPacket {
        bth,
        reth,
        aeth,
        immediate,
        payload,
    })
}

const CRC32C_POLY: u32 = 0x1EDC_6F41;

fn crc32c_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut j = 0;
        while j < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ CRC32C_POLY
            } else {
                crc >> 1
            };
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Computes the CRC-32C (Castagnoli) checksum used as the RoCEv2 ICRC.
pub fn crc32c(data: &[u8]) -> u32 {
    let table = crc32c_table();
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        let index = ((crc ^ byte as u32) & 0xFF) as usize;
        crc = (crc >> 8) ^ table[index];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_send_only() {
        let bth = Bth {
            opcode: RdmaOpcode::SendOnly,
            solicited_event: false,
            mig_req: false,
            pad_count: 0,
            transport_version: 0,
            partition_key: 0xFFFF,
            fecn: false,
            becn: false,
            dest_qp: 0x123456,
            ack_request: true,
            psn: 0xABCDEF,
        };
        let payload = b"payload bytes".to_vec();
        let packet = build_packet(bth, None, None, None, &payload);
        let parsed = parse_packet(&packet).unwrap();
        assert_eq!(parsed.bth.dest_qp, 0x123456);
        assert_eq!(parsed.bth.psn, 0xABCDEF);
        assert_eq!(parsed.payload, payload);
    }

    #[test]
    fn corrupted_icrc_is_rejected() {
        let bth = Bth {
            opcode: RdmaOpcode::RcAck,
            solicited_event: false,
            mig_req: false,
            pad_count: 0,
            transport_version: 0,
            partition_key: 0,
            fecn: false,
            becn: false,
            dest_qp: 1,
            ack_request: false,
            psn: 1,
        };
        let mut packet = build_packet(
            bth,
            None,
            Some(Aeth { syndrome: AethSyndrome::Ack, msn: 5 }),
            None,
            &[],
        );
        let last = packet.len() - 1;
        packet[last] ^= 0xFF;
        assert_eq!(parse_packet(&packet), Err(PacketError::IcrcMismatch));
    }

    #[test]
    fn write_first_carries_reth() {
        let bth = Bth {
            opcode: RdmaOpcode::RcWriteFirst,
            solicited_event: false,
            mig_req: false,
            pad_count: 0,
            transport_version: 0,
            partition_key: 0,
            fecn: false,
            becn: false,
            dest_qp: 7,
            ack_request: false,
            psn: 99,
        };
        let reth = Reth { virtual_address: 0xDEAD_BEEF, rkey: 42, dma_length: 4096 };
        let packet = build_packet(bth, Some(reth), None, None, b"chunk");
        let parsed = parse_packet(&packet).unwrap();
        let parsed_reth = parsed.reth.unwrap();
        assert_eq!(parsed_reth.virtual_address, 0xDEAD_BEEF);
        assert_eq!(parsed_reth.rkey, 42);
    }
}
