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

//! Seam between the driver core and the hosting miner. The host generates
//! work, verifies hashes and collects shares; the driver only moves work and
//! nonces between the host and the board.

use crate::error;

use std::io::Read;

/// Size of the block header the board hashes
pub const WORK_DATA_SIZE: usize = 80;

/// Offset of the 12 tail bytes the FPGA needs besides the midstate
pub const WORK_TAIL_OFFSET: usize = 64;

/// Length of the work tail
pub const WORK_TAIL_SIZE: usize = 12;

/// One unit of hashing work as handed over by the host scheduler.
///
/// The driver copies the midstate and the data tail onto the wire and retains
/// the whole unit so that late nonces can still be verified against it.
#[derive(Clone, Debug)]
pub struct Work {
    /// Internal state of SHA256 after processing the first chunk
    pub midstate: [u8; 32],
    /// Full block header to be hashed
    pub data: [u8; WORK_DATA_SIZE],
    /// Nonce cursor advanced by the driver as hashes get accounted
    pub nonce: u32,
}

impl Work {
    pub fn new(midstate: [u8; 32], data: [u8; WORK_DATA_SIZE]) -> Self {
        Self {
            midstate,
            data,
            nonce: 0,
        }
    }

    /// The 12 bytes of chunk2 data the FPGA hashes after the midstate
    pub fn tail(&self) -> &[u8] {
        &self.data[WORK_TAIL_OFFSET..WORK_TAIL_OFFSET + WORK_TAIL_SIZE]
    }
}

/// Callbacks into the hosting miner, called from the per-FPGA worker threads.
pub trait Host: Send + Sync {
    /// Check that `nonce` makes the hash of `work` meet the minimum difficulty
    fn test_nonce(&self, work: &Work, nonce: u32) -> bool;

    /// Record a valid share found by the given FPGA
    fn submit_nonce(&self, fpga_id: usize, work: &Work, nonce: u32);

    /// Host-set abort signal; the worker abandons the current work unit when set
    fn work_restart(&self, fpga_id: usize) -> bool;

    /// Invalid nonce was produced by the given FPGA
    fn hw_error(&self, _fpga_id: usize) {}
}

/// Source of the FPGA configuration bitstream.
///
/// The driver does not parse the `.bit` container; the host hands over an
/// already-framed byte stream together with its exact length.
pub trait BitstreamSource {
    fn open(&mut self) -> error::Result<(Box<dyn Read>, u32)>;
}
