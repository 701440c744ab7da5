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

//! Bitstream uploader.
//!
//! Programming addresses all FPGAs at once and takes tens of seconds; the
//! caller is expected to hold the port for the whole duration. Every chunk is
//! individually acknowledged by the MCU.

use crate::command::{self, ProgramCmd, FPGAID_ALL};
use crate::config;
use crate::error::{self, ErrorKind};
use crate::io::Transport;
use crate::misc::LOGGER;

use packed_struct::PackedStruct;
use slog::info;

use std::io::Read;

/// Percentage of the bitstream already streamed to the device
pub fn progress_pct(sent: u32, total: u32) -> u8 {
    ((u64::from(sent) * 100) / u64::from(total)) as u8
}

/// Stream `total` bytes from `source` into all FPGAs.
///
/// `pdone` is the externally visible programming progress, 0..100. Any
/// failure is fatal for the device open; the caller reopens and retries from
/// scratch.
pub fn upload(
    port: &mut dyn Transport,
    label: &str,
    source: &mut dyn Read,
    total: u32,
    pdone: &mut u8,
) -> error::Result<()> {
    if total == 0 {
        return Err(ErrorKind::Program("empty bitstream".to_string()).into());
    }

    info!(
        LOGGER,
        "{}: programming... DO NOT EXIT UNTIL COMPLETE", label
    );
    *pdone = 0;

    port.write_all(&ProgramCmd::new(FPGAID_ALL, total).pack())?;
    command::read_ack(port, "programming start")?;

    let mut remaining = total as usize;
    let mut chunk = [0u8; config::BITSTREAM_CHUNK_SIZE];
    let mut next_status = 10u8;
    while remaining > 0 {
        let len = remaining.min(config::BITSTREAM_CHUNK_SIZE);
        source
            .read_exact(&mut chunk[..len])
            .map_err(|e| ErrorKind::Program(format!("bitstream underrun: {}", e)))?;
        port.write_all(&chunk[..len])?;
        command::read_ack(port, "programming chunk")?;
        remaining -= len;

        *pdone = progress_pct(total - remaining as u32, total);
        if *pdone >= next_status {
            next_status = *pdone - *pdone % 10 + 10;
            info!(LOGGER, "{}: programming... {}% complete", label, *pdone);
        }
    }
    command::read_ack(port, "programming finish")?;
    info!(LOGGER, "{}: done programming", label);

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn progress_rounds_down() {
        assert_eq!(progress_pct(0, 48), 0);
        assert_eq!(progress_pct(32, 48), 66);
        assert_eq!(progress_pct(48, 48), 100);
    }
}
