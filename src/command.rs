// Copyright (C) 2020  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Wire codec for the ModMiner command protocol.
//!
//! Every command starts with a 1-byte opcode, most are followed by a 1-byte
//! FPGA index. Replies are fixed width except for `GET_VERSION` which is
//! delimited by the read timeout. All multi-byte values are little-endian.

use crate::error::{self, ErrorKind};
use crate::hal;
use crate::io::Transport;

use byteorder::{ByteOrder, LittleEndian};
use packed_struct::prelude::*;
use packed_struct_codegen::{PackedStruct, PrimitiveEnum_u8};

/// Command opcodes understood by the board MCU
#[derive(PrimitiveEnum_u8, Clone, Copy, Debug, PartialEq)]
pub enum OpCode {
    /// No-op, used to flush half-written commands out of the MCU
    Ping = 0x00,
    GetVersion = 0x01,
    FpgaCount = 0x02,
    GetIdcode = 0x03,
    GetUsercode = 0x04,
    Program = 0x05,
    SetClock = 0x06,
    ReadClock = 0x07,
    SendWork = 0x08,
    CheckWork = 0x09,
    Temp1 = 0x0a,
}

/// FPGA index addressing all FPGAs at once (programming only)
pub const FPGAID_ALL: u8 = 4;

/// USERCODE reported by an FPGA carrying the expected bitstream
pub const USERCODE: [u8; 4] = [0x02, 0x04, b'$', b'B'];

/// Size of the send-work frame: opcode, FPGA index, midstate, tail
pub const SEND_WORK_FRAME_SIZE: usize = 46;

/// A ping followed by 45 `0xff` padding bytes; long enough to complete any
/// partially received send-work frame the device may be stuck in
pub fn noop_frame() -> [u8; SEND_WORK_FRAME_SIZE] {
    let mut frame = [0xffu8; SEND_WORK_FRAME_SIZE];
    frame[0] = OpCode::Ping.to_primitive();
    frame
}

fn cmd2(opcode: OpCode, fpga_id: u8) -> [u8; 2] {
    [opcode.to_primitive(), fpga_id]
}

/// `SET_CLOCK` frame; the clock is an even MHz value, the trailing bytes are
/// required by the MCU but always zero
#[derive(PackedStruct, Debug, PartialEq)]
#[packed_struct(endian = "lsb")]
pub struct SetClockCmd {
    opcode: u8,
    fpga_id: u8,
    clock: u8,
    pad: [u8; 3],
}

impl SetClockCmd {
    pub fn new(fpga_id: u8, clock: u8) -> Self {
        Self {
            opcode: OpCode::SetClock.to_primitive(),
            fpga_id,
            clock,
            pad: [0u8; 3],
        }
    }
}

/// `PROGRAM` announcement frame carrying the exact bitstream length
#[derive(PackedStruct, Debug, PartialEq)]
#[packed_struct(endian = "lsb")]
pub struct ProgramCmd {
    opcode: u8,
    fpga_id: u8,
    length: u32,
}

impl ProgramCmd {
    pub fn new(fpga_id: u8, length: u32) -> Self {
        Self {
            opcode: OpCode::Program.to_primitive(),
            fpga_id,
            length,
        }
    }
}

/// Prebuilt `SEND_WORK` frame retained per FPGA.
///
/// The frame doubles as the identity of the staged work unit: the scheduler
/// re-offering the same unit is detected by comparing against it.
#[derive(PackedStruct, Debug, Clone, PartialEq)]
#[packed_struct(endian = "lsb")]
pub struct SendWorkCmd {
    opcode: u8,
    fpga_id: u8,
    midstate: [u8; 32],
    tail: [u8; 12],
}

impl SendWorkCmd {
    pub fn new(fpga_id: u8) -> Self {
        Self {
            opcode: OpCode::SendWork.to_primitive(),
            fpga_id,
            midstate: [0u8; 32],
            tail: [0u8; 12],
        }
    }

    /// Copy the interesting 44 bytes of `work` into the frame.
    ///
    /// Returns false without touching the frame when `work` is identical to
    /// what is already staged.
    pub fn stage(&mut self, work: &hal::Work) -> bool {
        if self.midstate == work.midstate && self.tail[..] == *work.tail() {
            return false;
        }
        self.midstate.copy_from_slice(&work.midstate);
        self.tail.copy_from_slice(work.tail());
        true
    }
}

/// Decoded `CHECK_WORK` reply
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NonceReply {
    /// No candidate nonce available
    Idle,
    /// The MCU holds the clock assignment but keeps the FPGA disabled
    Disabled,
    /// Candidate nonce to be verified by the host
    Nonce(u32),
}

impl NonceReply {
    pub fn from_bytes(buf: &[u8; 4]) -> Self {
        match buf {
            [0xff, 0xff, 0xff, 0xff] => NonceReply::Idle,
            [0x00, 0xff, 0xff, 0xff] => NonceReply::Disabled,
            _ => NonceReply::Nonce(LittleEndian::read_u32(buf)),
        }
    }
}

/// Send the ping-and-padding flush and throw away whatever the device answers
pub fn noop_flush(port: &mut dyn Transport) -> error::Result<()> {
    port.write_all(&noop_frame())?;
    port.drain()?;
    Ok(())
}

/// Read the device version string; delimited by the read timeout
pub fn get_version(port: &mut dyn Transport) -> error::Result<String> {
    port.write_all(&[OpCode::GetVersion.to_primitive()])?;
    let raw = port.drain()?;
    let version: String = raw
        .into_iter()
        .take_while(|b| *b != 0)
        .map(char::from)
        .filter(|c| !c.is_control())
        .collect();
    if version.is_empty() {
        return Err(ErrorKind::Protocol("no response to version request".to_string()).into());
    }
    Ok(version)
}

pub fn fpga_count(port: &mut dyn Transport) -> error::Result<u8> {
    port.write_all(&[OpCode::FpgaCount.to_primitive()])?;
    let mut buf = [0u8; 1];
    port.read_exact(&mut buf)?;
    Ok(buf[0])
}

pub fn get_idcode(port: &mut dyn Transport, fpga_id: u8) -> error::Result<u32> {
    port.write_all(&cmd2(OpCode::GetIdcode, fpga_id))?;
    let mut buf = [0u8; 4];
    port.read_exact(&mut buf)?;
    Ok(LittleEndian::read_u32(&buf))
}

pub fn get_usercode(port: &mut dyn Transport, fpga_id: u8) -> error::Result<[u8; 4]> {
    port.write_all(&cmd2(OpCode::GetUsercode, fpga_id))?;
    let mut buf = [0u8; 4];
    port.read_exact(&mut buf)?;
    Ok(buf)
}

/// Request a new clock; the MCU is free to reject frequencies it cannot lock
pub fn set_clock(port: &mut dyn Transport, fpga_id: u8, clock: u8) -> error::Result<bool> {
    port.write_all(&SetClockCmd::new(fpga_id, clock).pack())?;
    let mut buf = [0u8; 1];
    port.read_exact(&mut buf)?;
    Ok(buf[0] != 0)
}

pub fn read_clock(port: &mut dyn Transport, fpga_id: u8) -> error::Result<u8> {
    port.write_all(&cmd2(OpCode::ReadClock, fpga_id))?;
    let mut buf = [0u8; 1];
    port.read_exact(&mut buf)?;
    Ok(buf[0])
}

pub fn check_work(port: &mut dyn Transport, fpga_id: u8) -> error::Result<NonceReply> {
    port.write_all(&cmd2(OpCode::CheckWork, fpga_id))?;
    let mut buf = [0u8; 4];
    port.read_exact(&mut buf)?;
    Ok(NonceReply::from_bytes(&buf))
}

pub fn read_temperature(port: &mut dyn Transport, fpga_id: u8) -> error::Result<u8> {
    port.write_all(&cmd2(OpCode::Temp1, fpga_id))?;
    let mut buf = [0u8; 1];
    port.read_exact(&mut buf)?;
    Ok(buf[0])
}

/// Read the 1-byte acknowledgment that follows programming chunks and
/// send-work frames; anything but 0x01 is a protocol violation
pub fn read_ack(port: &mut dyn Transport, what: &str) -> error::Result<()> {
    let mut buf = [0u8; 1];
    port.read_exact(&mut buf)?;
    if buf[0] != 1 {
        return Err(ErrorKind::Protocol(format!("wrong {} ack: {:#04x}", what, buf[0])).into());
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn build_noop_frame() {
        let frame = noop_frame();
        assert_eq!(frame.len(), SEND_WORK_FRAME_SIZE);
        assert_eq!(frame[0], 0x00);
        assert!(frame[1..].iter().all(|b| *b == 0xff));
    }

    #[test]
    fn build_set_clock_cmd() {
        let cmd = SetClockCmd::new(1, 228);
        let expected_cmd = [0x06u8, 0x01, 0xe4, 0x00, 0x00, 0x00];

        let cmd_bytes = cmd.pack();
        assert_eq!(
            cmd_bytes, expected_cmd,
            "Incorrectly composed command:{:#04x?} sliced view: {:#04x?} expected view: \
             {:#04x?}",
            cmd, cmd_bytes, expected_cmd
        );
    }

    #[test]
    fn build_program_cmd() {
        let cmd = ProgramCmd::new(FPGAID_ALL, 0x0004_1f30);
        let expected_cmd = [0x05u8, 0x04, 0x30, 0x1f, 0x04, 0x00];

        let cmd_bytes = cmd.pack();
        assert_eq!(
            cmd_bytes, expected_cmd,
            "Incorrectly composed command:{:#04x?} sliced view: {:#04x?} expected view: \
             {:#04x?}",
            cmd, cmd_bytes, expected_cmd
        );
    }

    #[test]
    fn build_send_work_cmd() {
        let mut midstate = [0u8; 32];
        let mut data = [0u8; hal::WORK_DATA_SIZE];
        for (i, b) in midstate.iter_mut().enumerate() {
            *b = i as u8;
        }
        for (i, b) in data.iter_mut().enumerate() {
            *b = 0x40 + i as u8;
        }
        let work = hal::Work::new(midstate, data);

        let mut cmd = SendWorkCmd::new(2);
        assert!(cmd.stage(&work), "fresh work must restage the frame");

        let mut expected_cmd = [0u8; SEND_WORK_FRAME_SIZE];
        expected_cmd[0] = 0x08;
        expected_cmd[1] = 0x02;
        expected_cmd[2..34].copy_from_slice(&midstate);
        expected_cmd[34..46].copy_from_slice(&data[64..76]);

        let cmd_bytes = cmd.pack();
        assert_eq!(cmd_bytes[..], expected_cmd[..]);
    }

    /// Offering an identical unit twice must not restage the frame
    #[test]
    fn stage_is_identity_checked() {
        let work = hal::Work::new([0x11u8; 32], [0x22u8; hal::WORK_DATA_SIZE]);
        let mut cmd = SendWorkCmd::new(0);

        assert!(cmd.stage(&work));
        assert!(!cmd.stage(&work));

        let mut other = work.clone();
        other.data[70] ^= 0xff;
        assert!(cmd.stage(&other), "tail change must restage");
    }

    #[test]
    fn parse_check_work_reply() {
        assert_eq!(
            NonceReply::from_bytes(&[0xff, 0xff, 0xff, 0xff]),
            NonceReply::Idle
        );
        assert_eq!(
            NonceReply::from_bytes(&[0x00, 0xff, 0xff, 0xff]),
            NonceReply::Disabled
        );
        assert_eq!(
            NonceReply::from_bytes(&[0x44, 0x33, 0x22, 0x11]),
            NonceReply::Nonce(0x11223344)
        );
        // nonce that merely resembles the sentinels is still a nonce
        assert_eq!(
            NonceReply::from_bytes(&[0xff, 0xff, 0xff, 0x00]),
            NonceReply::Nonce(0x00ffffff)
        );
    }
}
