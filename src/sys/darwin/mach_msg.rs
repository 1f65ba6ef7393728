//! Mach message encoding and the MIG routines `mach_msg_trap` answers.
//!
//! Messages are decoded from and encoded to their wire layout field by
//! field. A routine receives the request and returns the complete reply,
//! which is written back over the request buffer.

use super::syscall::{Kernel, KernelError};
use crate::Result;
use linkme::distributed_slice;
use macros::xnu_trap;
use tracing::debug;

pub const MACH_MSG_HEADER_SIZE: usize = 24;
pub const MACH_MSGH_BITS_COMPLEX: u32 = 0x8000_0000;
/// Reply ids are request ids plus this offset.
pub const MIG_REPLY_ID_OFFSET: i32 = 100;

pub const MIG_HOST_INFO: u32 = 200;
pub const MIG_TASK_GET_SPECIAL_PORT: u32 = 3409;

pub const HOST_PRIORITY_INFO: i32 = 5;
pub const TASK_BOOTSTRAP_PORT: i32 = 4;
/// Port name handed out for the bootstrap port.
pub const BOOTSTRAP_PORT: u32 = 11;
/// `MACH_MSG_TYPE_MOVE_SEND`
pub const MACH_MSG_TYPE_MOVE_SEND: u8 = 17;
pub const MACH_MSG_PORT_DESCRIPTOR: u8 = 0;

/// `mach_msg_header_t`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachMsgHeader {
    pub bits: u32,
    pub size: u32,
    pub remote_port: u32,
    pub local_port: u32,
    pub voucher_port: u32,
    pub id: i32,
}

impl MachMsgHeader {
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let field = |n: usize| -> Option<u32> {
            let raw = bytes.get(n * 4..n * 4 + 4)?;
            Some(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
        };
        Some(Self {
            bits: field(0)?,
            size: field(1)?,
            remote_port: field(2)?,
            local_port: field(3)?,
            voucher_port: field(4)?,
            id: field(5)? as i32,
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        for value in [
            self.bits,
            self.size,
            self.remote_port,
            self.local_port,
            self.voucher_port,
            self.id as u32,
        ] {
            out.extend_from_slice(&value.to_le_bytes());
        }
    }

    /// Header of the reply to this request: ports swapped, id bumped,
    /// remote/local dispositions kept.
    pub fn reply(&self, size: u32, complex: bool) -> Self {
        let mut bits = self.bits & 0xff;
        if complex {
            bits |= MACH_MSGH_BITS_COMPLEX;
        }
        Self {
            bits,
            size,
            remote_port: self.local_port,
            local_port: 0,
            voucher_port: self.voucher_port,
            id: self.id.wrapping_add(MIG_REPLY_ID_OFFSET),
        }
    }
}

/// A request read from emulated memory.
#[derive(Debug, Clone)]
pub struct MachMessage {
    pub header: MachMsgHeader,
    /// The whole buffer, header included.
    pub bytes: Vec<u8>,
}

impl MachMessage {
    pub fn parse(bytes: Vec<u8>) -> std::result::Result<Self, KernelError> {
        let header = MachMsgHeader::decode(&bytes).ok_or(KernelError::MessageTooShort {
            id: 0,
            len: bytes.len(),
        })?;
        Ok(Self { header, bytes })
    }

    pub fn id(&self) -> u32 {
        self.header.id as u32
    }

    pub fn read_u32(&self, offset: usize) -> std::result::Result<u32, KernelError> {
        let raw = self
            .bytes
            .get(offset..offset + 4)
            .ok_or(KernelError::MessageTooShort {
                id: self.id(),
                len: self.bytes.len(),
            })?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    pub fn read_i32(&self, offset: usize) -> std::result::Result<i32, KernelError> {
        self.read_u32(offset).map(|v| v as i32)
    }

    /// The NDR record following the header.
    pub fn ndr(&self) -> std::result::Result<[u8; 8], KernelError> {
        let raw = self
            .bytes
            .get(MACH_MSG_HEADER_SIZE..MACH_MSG_HEADER_SIZE + 8)
            .ok_or(KernelError::MessageTooShort {
                id: self.id(),
                len: self.bytes.len(),
            })?;
        let mut ndr = [0; 8];
        ndr.copy_from_slice(raw);
        Ok(ndr)
    }
}

pub type MigHandler = fn(&Kernel, &MachMessage) -> Result<Vec<u8>>;

/// A MIG routine answered in place of the kernel server.
pub struct MigRoutine {
    pub id: u32,
    pub name: &'static str,
    pub handler: MigHandler,
}

/// MIG routines registered with `#[xnu_trap(mig = ID)]`.
#[distributed_slice]
pub static MIG_ROUTINES: [MigRoutine] = [..];

pub fn find_routine(id: u32) -> Option<&'static MigRoutine> {
    MIG_ROUTINES.iter().find(|routine| routine.id == id)
}

/// `host_info`, `HOST_PRIORITY_INFO` flavor only.
#[xnu_trap(mig = 200)]
fn host_info(_kernel: &Kernel, msg: &MachMessage) -> Result<Vec<u8>> {
    let flavor = msg.read_i32(32)?;
    if flavor != HOST_PRIORITY_INFO {
        return Err(KernelError::UnsupportedHostInfoFlavor { flavor }.into());
    }
    debug!("host_info(HOST_PRIORITY_INFO)");
    // kernel, system, server, user, depress, idle, minimum, maximum
    let priorities: [i32; 8] = [0, 0, 0, 0, 0, 0, -10, 10];
    let size = MACH_MSG_HEADER_SIZE + 8 + 4 + 4 + priorities.len() * 4;
    let mut reply = Vec::with_capacity(size);
    msg.header.reply(size as u32, false).encode(&mut reply);
    reply.extend_from_slice(&msg.ndr()?);
    reply.extend_from_slice(&0i32.to_le_bytes());
    reply.extend_from_slice(&(priorities.len() as u32).to_le_bytes());
    for priority in priorities {
        reply.extend_from_slice(&priority.to_le_bytes());
    }
    Ok(reply)
}

/// `task_get_special_port`, bootstrap port only.
#[xnu_trap(mig = 3409)]
fn task_get_special_port(_kernel: &Kernel, msg: &MachMessage) -> Result<Vec<u8>> {
    let which = msg.read_i32(32)?;
    if which != TASK_BOOTSTRAP_PORT {
        return Err(KernelError::UnsupportedSpecialPort { which }.into());
    }
    debug!("task_get_special_port(TASK_BOOTSTRAP_PORT)");
    let size = MACH_MSG_HEADER_SIZE + 4 + 12;
    let mut reply = Vec::with_capacity(size);
    msg.header.reply(size as u32, true).encode(&mut reply);
    // msgh_body.msgh_descriptor_count
    reply.extend_from_slice(&1u32.to_le_bytes());
    // mach_msg_port_descriptor_t
    reply.extend_from_slice(&BOOTSTRAP_PORT.to_le_bytes());
    reply.extend_from_slice(&0u32.to_le_bytes());
    reply.extend_from_slice(&0u16.to_le_bytes());
    reply.push(MACH_MSG_TYPE_MOVE_SEND);
    reply.push(MACH_MSG_PORT_DESCRIPTOR);
    Ok(reply)
}
