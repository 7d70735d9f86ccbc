//! The fixed-size IPC record exchanged between a worker slot thread and its
//! sandboxed child, in both directions, over a `SOCK_STREAM` socket pair.
//!
//! There is no framing beyond the raw byte layout: each message is exactly
//! [`WMsg::WIRE_SIZE`] bytes, native-endian, with no serde involved. This
//! matches the wire format called for in the design: a record this small
//! and this stable doesn't need a serialization library, and using one
//! would make the two ends of the same binary negotiate a format with
//! themselves.

use std::io::{Read, Write};

use crate::error::IpcError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Cmd {
    StatusUpdate = 1,
    Success = 2,
    Failure = 3,
    Freeze = 4,
    InstallPkgs = 5,
}

impl Cmd {
    fn from_i32(v: i32) -> Option<Self> {
        Some(match v {
            1 => Cmd::StatusUpdate,
            2 => Cmd::Success,
            3 => Cmd::Failure,
            4 => Cmd::Freeze,
            5 => Cmd::InstallPkgs,
            _ => return None,
        })
    }
}

/// `{cmd: i32, status: i32, lines: i64, memuse: i64, phase: i32}`, exchanged
/// verbatim. `status` doubles as the master->worker install-deps ack
/// (0/1) when `cmd == InstallPkgs`.
#[derive(Debug, Clone, Copy)]
pub struct WMsg {
    pub cmd: Cmd,
    pub status: i32,
    pub lines: i64,
    pub memuse: i64,
    pub phase: i32,
}

impl WMsg {
    pub const WIRE_SIZE: usize = 4 + 4 + 8 + 8 + 4;

    pub fn status_update(phase: i32, lines: i64, memuse: i64) -> Self {
        Self {
            cmd: Cmd::StatusUpdate,
            status: 0,
            lines,
            memuse,
            phase,
        }
    }

    pub fn success() -> Self {
        Self {
            cmd: Cmd::Success,
            status: 0,
            lines: 0,
            memuse: 0,
            phase: 0,
        }
    }

    pub fn failure() -> Self {
        Self {
            cmd: Cmd::Failure,
            status: 1,
            lines: 0,
            memuse: 0,
            phase: 0,
        }
    }

    pub fn freeze() -> Self {
        Self {
            cmd: Cmd::Freeze,
            status: 0,
            lines: 0,
            memuse: 0,
            phase: 0,
        }
    }

    pub fn install_pkgs_ack(required: bool) -> Self {
        Self {
            cmd: Cmd::InstallPkgs,
            status: required as i32,
            lines: 0,
            memuse: 0,
            phase: 0,
        }
    }

    fn to_bytes(self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..4].copy_from_slice(&(self.cmd as i32).to_ne_bytes());
        buf[4..8].copy_from_slice(&self.status.to_ne_bytes());
        buf[8..16].copy_from_slice(&self.lines.to_ne_bytes());
        buf[16..24].copy_from_slice(&self.memuse.to_ne_bytes());
        buf[24..28].copy_from_slice(&self.phase.to_ne_bytes());
        buf
    }

    fn from_bytes(buf: [u8; Self::WIRE_SIZE]) -> Result<Self, IpcError> {
        let cmd_raw = i32::from_ne_bytes(buf[0..4].try_into().unwrap());
        let cmd = Cmd::from_i32(cmd_raw).ok_or(IpcError::ShortRead {
            got: cmd_raw as usize,
            want: 0,
        })?;
        Ok(Self {
            cmd,
            status: i32::from_ne_bytes(buf[4..8].try_into().unwrap()),
            lines: i64::from_ne_bytes(buf[8..16].try_into().unwrap()),
            memuse: i64::from_ne_bytes(buf[16..24].try_into().unwrap()),
            phase: i32::from_ne_bytes(buf[24..28].try_into().unwrap()),
        })
    }
}

/// Read exactly one [`WMsg`] from `stream`. A clean EOF before any bytes
/// are read is reported as [`IpcError::UnexpectedEof`]; the caller
/// typically treats that as the worker dying without a terminal message.
pub fn read_msg(stream: &mut impl Read) -> Result<WMsg, IpcError> {
    let mut buf = [0u8; WMsg::WIRE_SIZE];
    let mut got = 0;
    while got < buf.len() {
        let n = stream.read(&mut buf[got..])?;
        if n == 0 {
            if got == 0 {
                return Err(IpcError::UnexpectedEof);
            }
            return Err(IpcError::ShortRead {
                got,
                want: buf.len(),
            });
        }
        got += n;
    }
    WMsg::from_bytes(buf)
}

pub fn write_msg(stream: &mut impl Write, msg: &WMsg) -> Result<(), IpcError> {
    stream.write_all(&msg.to_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_a_byte_buffer() {
        let msg = WMsg::status_update(7, 120, 4096);
        let mut buf = Vec::new();
        write_msg(&mut buf, &msg).unwrap();
        assert_eq!(buf.len(), WMsg::WIRE_SIZE);

        let mut cursor = &buf[..];
        let back = read_msg(&mut cursor).unwrap();
        assert_eq!(back.cmd, Cmd::StatusUpdate);
        assert_eq!(back.lines, 120);
        assert_eq!(back.memuse, 4096);
        assert_eq!(back.phase, 7);
    }

    #[test]
    fn eof_before_any_bytes_is_reported_distinctly() {
        let mut cursor: &[u8] = &[];
        assert!(matches!(read_msg(&mut cursor), Err(IpcError::UnexpectedEof)));
    }
}
