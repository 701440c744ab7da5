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

//! Per-board status records and runtime device options, shaped for the
//! cgminer-style status API of the hosting miner.

use crate::config;
use crate::Device;

use serde::Serialize;

/// Status record of one FPGA, one per board slot.
///
/// Frequencies are reported in Hz.
#[derive(Serialize, PartialEq, Clone, Debug)]
pub struct BoardStatus {
    /// Omitted while the reading is still unknown
    #[serde(rename = "Temperature", skip_serializing_if = "Option::is_none")]
    pub temperature: Option<u8>,
    #[serde(rename = "Frequency")]
    pub frequency: f64,
    #[serde(rename = "Cool Max Frequency")]
    pub cool_max_frequency: f64,
    #[serde(rename = "Max Frequency")]
    pub max_frequency: f64,
    #[serde(rename = "Hardware Errors")]
    pub hardware_errors: u64,
    #[serde(rename = "Valid Nonces")]
    pub valid_nonces: u64,
}

const HZ_PER_MULTIPLIER: f64 = 2.0 * 1_000_000.0;

impl Device {
    /// Snapshot of all per-board status fields.
    pub fn status_extra(&self) -> Vec<BoardStatus> {
        self.fpgas
            .iter()
            .map(|state_lock| {
                let state = state_lock.lock().expect("BUG: FPGA state lock poisoned");
                BoardStatus {
                    temperature: match state.temp {
                        0 => None,
                        temp => Some(temp),
                    },
                    frequency: f64::from(state.dclk.freq()) * HZ_PER_MULTIPLIER,
                    cool_max_frequency: f64::from(state.dclk.ceiling()) * HZ_PER_MULTIPLIER,
                    max_frequency: f64::from(state.freq_max_max_m) * HZ_PER_MULTIPLIER,
                    hardware_errors: state.bad_share_counter,
                    valid_nonces: state.good_share_counter,
                }
            })
            .collect()
    }

    /// Apply a runtime option.
    ///
    /// `clockN` retargets FPGA N, bare `clock` all of them. A user override
    /// bypasses the governor: the default frequency is updated first and the
    /// `SET_CLOCK` is issued immediately.
    ///
    /// Returns `None` on success, otherwise a reply text for the user.
    pub fn set_device(&self, option: &str, setting: Option<&str>) -> Option<String> {
        if option.eq_ignore_ascii_case("help") {
            return Some(format!(
                "clock: range {}-{} and a multiple of 2",
                config::MIN_CLOCK,
                config::MAX_CLOCK
            ));
        }

        let option_lower = option.to_ascii_lowercase();
        if !option_lower.starts_with("clock") {
            return Some(format!("Unknown option: {}", option));
        }

        let suffix = &option_lower["clock".len()..];
        let (first, last) = if suffix.is_empty() {
            (0, self.fpgas.len() - 1)
        } else {
            match suffix.parse::<usize>() {
                Ok(fpga_id) if fpga_id < self.fpgas.len() => (fpga_id, fpga_id),
                _ => {
                    return Some(format!(
                        "invalid fpga: '{}' valid range 0-{}",
                        suffix,
                        self.fpgas.len() - 1
                    ));
                }
            }
        };

        let setting = match setting {
            Some(setting) if !setting.is_empty() => setting,
            _ => return Some("missing clock setting".to_string()),
        };
        let clock = match setting.parse::<u16>() {
            Ok(clock) => clock,
            Err(_) => 0,
        };
        if clock < u16::from(config::MIN_CLOCK)
            || clock > u16::from(config::MAX_CLOCK)
            || clock % 2 != 0
        {
            return Some(format!(
                "invalid clock: '{}' valid range {}-{} and a multiple of 2",
                setting,
                config::MIN_CLOCK,
                config::MAX_CLOCK
            ));
        }

        let multiplier = (clock / 2) as u8;
        for fpga_id in first..=last {
            let mut state = self.fpgas[fpga_id]
                .lock()
                .expect("BUG: FPGA state lock poisoned");
            state.dclk.set_default(multiplier);
            match self.apply_clock(fpga_id, &mut state, multiplier, " on user request") {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    return Some(format!("Set clock failed: {}", self.label(fpga_id)));
                }
            }
        }

        None
    }
}
