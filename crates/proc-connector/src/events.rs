//! Wire format of the kernel process connector (`linux/connector.h` and
//! `linux/cn_proc.h`).
//!
//! Every datagram received on the connector socket holds one or more netlink
//! messages. Each netlink payload is a `cn_msg` header followed by a
//! `proc_event`. Decoding works on raw bytes at fixed offsets so that no
//! unaligned reads are needed; the `#[repr(C)]` mirrors below only pin the
//! layout the offsets are derived from.

use log::{trace, warn};

/// Connector index and value of the process events channel.
pub const CN_IDX_PROC: u32 = 0x1;
pub const CN_VAL_PROC: u32 = 0x1;

/// Multicast control operations sent to the kernel.
pub const PROC_CN_MCAST_LISTEN: u32 = 1;
pub const PROC_CN_MCAST_IGNORE: u32 = 2;

const PROC_EVENT_NONE: u32 = 0x0000_0000;
const PROC_EVENT_FORK: u32 = 0x0000_0001;
const PROC_EVENT_EXEC: u32 = 0x0000_0002;
const PROC_EVENT_EXIT: u32 = 0x8000_0000;

/// `struct nlmsghdr`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct NlMsgHeader {
    pub len: u32,
    pub kind: u16,
    pub flags: u16,
    pub seq: u32,
    pub port: u32,
}

/// `struct cn_msg` without its flexible data member
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CnMsgHeader {
    pub idx: u32,
    pub val: u32,
    pub seq: u32,
    pub ack: u32,
    pub len: u16,
    pub flags: u16,
}

/// Leading fields of `struct proc_event`, before the `event_data` union
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcEventHeader {
    pub what: u32,
    pub cpu: u32,
    pub timestamp_ns: u64,
}

pub const NLMSG_HDRLEN: usize = std::mem::size_of::<NlMsgHeader>();
pub const CN_MSG_HDRLEN: usize = std::mem::size_of::<CnMsgHeader>();
const PROC_EVENT_HDRLEN: usize = std::mem::size_of::<ProcEventHeader>();

/// Decoded process event.
///
/// `pid` fields are kernel task ids, `tgid` fields the ids userspace calls PIDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcEvent {
    Fork {
        parent_pid: i32,
        parent_tgid: i32,
        child_pid: i32,
        child_tgid: i32,
        timestamp_ns: u64,
    },
    Exec {
        pid: i32,
        tgid: i32,
        timestamp_ns: u64,
    },
    Exit {
        pid: i32,
        tgid: i32,
        /// Raw `wait(2)` status word
        exit_code: u32,
        exit_signal: u32,
        timestamp_ns: u64,
    },
    /// Acknowledgements and event kinds this crate does not decode
    Other { what: u32 },
}

/// Builds the netlink datagram asking the kernel to start (or stop) sending
/// process events to this socket.
pub fn mcast_control_message(op: u32, port: u32) -> Vec<u8> {
    let payload_len = CN_MSG_HDRLEN + std::mem::size_of::<u32>();
    let total_len = NLMSG_HDRLEN + payload_len;

    let mut msg = Vec::with_capacity(total_len);
    msg.extend_from_slice(&(total_len as u32).to_ne_bytes());
    msg.extend_from_slice(&(libc::NLMSG_DONE as u16).to_ne_bytes());
    msg.extend_from_slice(&0u16.to_ne_bytes());
    msg.extend_from_slice(&0u32.to_ne_bytes());
    msg.extend_from_slice(&port.to_ne_bytes());

    msg.extend_from_slice(&CN_IDX_PROC.to_ne_bytes());
    msg.extend_from_slice(&CN_VAL_PROC.to_ne_bytes());
    msg.extend_from_slice(&0u32.to_ne_bytes());
    msg.extend_from_slice(&0u32.to_ne_bytes());
    msg.extend_from_slice(&(std::mem::size_of::<u32>() as u16).to_ne_bytes());
    msg.extend_from_slice(&0u16.to_ne_bytes());

    msg.extend_from_slice(&op.to_ne_bytes());
    msg
}

/// Decodes every process event contained in one received datagram.
///
/// Malformed or truncated messages end decoding of the datagram; what was
/// decoded before them is still returned.
pub fn decode_datagram(buf: &[u8]) -> Vec<ProcEvent> {
    let mut events = Vec::new();
    let mut offset = 0;

    while offset + NLMSG_HDRLEN <= buf.len() {
        let len = read_u32(buf, offset) as usize;
        let kind = read_u16(buf, offset + 4);

        if len < NLMSG_HDRLEN || offset + len > buf.len() {
            warn!("Truncated netlink message ({len} bytes at offset {offset})");
            break;
        }

        match kind as i32 {
            libc::NLMSG_NOOP => {}
            libc::NLMSG_ERROR => trace!("Ignoring netlink error message"),
            libc::NLMSG_OVERRUN => warn!("Netlink reported an overrun, process events were lost"),
            _ => {
                if let Some(event) = decode_cn_msg(&buf[offset + NLMSG_HDRLEN..offset + len]) {
                    events.push(event);
                }
            }
        }

        offset += nlmsg_align(len);
    }

    events
}

fn decode_cn_msg(payload: &[u8]) -> Option<ProcEvent> {
    if payload.len() < CN_MSG_HDRLEN {
        warn!("Connector message too short: {} bytes", payload.len());
        return None;
    }

    let idx = read_u32(payload, 0);
    let val = read_u32(payload, 4);
    if idx != CN_IDX_PROC || val != CN_VAL_PROC {
        trace!("Ignoring connector message for {idx}:{val}");
        return None;
    }

    let data_len = read_u16(payload, 16) as usize;
    let data = &payload[CN_MSG_HDRLEN..];
    if data.len() < data_len {
        warn!(
            "Connector message announces {data_len} bytes but carries {}",
            data.len()
        );
        return None;
    }

    decode_proc_event(&data[..data_len])
}

fn decode_proc_event(data: &[u8]) -> Option<ProcEvent> {
    if data.len() < PROC_EVENT_HDRLEN {
        warn!("Process event too short: {} bytes", data.len());
        return None;
    }

    let what = read_u32(data, 0);
    let timestamp_ns = read_u64(data, 8);
    let body = &data[PROC_EVENT_HDRLEN..];

    let needed = match what {
        PROC_EVENT_FORK | PROC_EVENT_EXIT => 16,
        PROC_EVENT_EXEC => 8,
        _ => 0,
    };
    if body.len() < needed {
        warn!("Process event {what:#x} truncated to {} bytes", body.len());
        return None;
    }

    let event = match what {
        PROC_EVENT_FORK => ProcEvent::Fork {
            parent_pid: read_i32(body, 0),
            parent_tgid: read_i32(body, 4),
            child_pid: read_i32(body, 8),
            child_tgid: read_i32(body, 12),
            timestamp_ns,
        },
        PROC_EVENT_EXEC => ProcEvent::Exec {
            pid: read_i32(body, 0),
            tgid: read_i32(body, 4),
            timestamp_ns,
        },
        PROC_EVENT_EXIT => ProcEvent::Exit {
            pid: read_i32(body, 0),
            tgid: read_i32(body, 4),
            exit_code: read_u32(body, 8),
            exit_signal: read_u32(body, 12),
            timestamp_ns,
        },
        PROC_EVENT_NONE => ProcEvent::Other { what },
        _ => ProcEvent::Other { what },
    };
    Some(event)
}

fn nlmsg_align(len: usize) -> usize {
    (len + 3) & !3
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_ne_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_ne_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_i32(buf: &[u8], at: usize) -> i32 {
    read_u32(buf, at) as i32
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_ne_bytes(bytes)
}

// Static assertions for C/Rust ABI safety
mod assertions {
    use super::*;
    use static_assertions::{assert_eq_size, const_assert_eq};
    use std::mem::offset_of;

    assert_eq_size!(NlMsgHeader, libc::nlmsghdr);
    const_assert_eq!(offset_of!(NlMsgHeader, kind), 4);
    const_assert_eq!(NLMSG_HDRLEN, 16);

    const_assert_eq!(CN_MSG_HDRLEN, 20);
    const_assert_eq!(offset_of!(CnMsgHeader, len), 16);

    const_assert_eq!(PROC_EVENT_HDRLEN, 16);
    const_assert_eq!(offset_of!(ProcEventHeader, timestamp_ns), 8);
}
