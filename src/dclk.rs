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

//! Dynamic clock governor.
//!
//! Frequencies are stored halved (`freqM`) because the wire representation is
//! an even MHz value. The governor is pure: each work cycle feeds it nonce and
//! error counts and `update_freq` answers with a requested multiplier, which
//! the driver then tries to apply via `SET_CLOCK`. A rejected request is a
//! no-op for the governor.

use crate::config;

/// Weighted error ratio above which the clock steps down
const MAX_ERROR_RATE: f64 = 0.05;

/// Weight of the latest cycle in the error ratio average
const ERROR_WEIGHT: f64 = 0.5;

/// Per-cycle decay of the error ratio while the device runs clean
const CLEAN_DECAY: f64 = 0.9;

/// Consecutive clean cycles required before the clock steps back up
const STABLE_CYCLES: u32 = 30;

#[derive(Debug, Clone)]
pub struct DynClock {
    /// Current frequency, halved
    freq_m: u8,
    /// Ceiling the governor may step up to; moved down by the thermal
    /// supervisor and restored as the board cools
    freq_max_m: u8,
    /// Frequency requested at init or by the user, halved
    freq_m_default: u8,
    /// Exponentially weighted bad-nonce ratio of the recent cycles
    error_rate: f64,
    /// Cycles since the last cycle that produced a bad nonce
    clean_cycles: u32,
    /// Whether the current cycle reported errors
    cycle_errors: bool,
}

impl DynClock {
    pub fn new() -> Self {
        Self {
            freq_m: 0,
            freq_max_m: 0,
            freq_m_default: 0,
            error_rate: 0.0,
            clean_cycles: 0,
            cycle_errors: false,
        }
    }

    pub fn freq(&self) -> u8 {
        self.freq_m
    }

    pub fn ceiling(&self) -> u8 {
        self.freq_max_m
    }

    pub fn default_freq(&self) -> u8 {
        self.freq_m_default
    }

    /// Record a `SET_CLOCK` the device accepted
    pub fn applied(&mut self, multiplier: u8) {
        self.freq_m = multiplier;
    }

    /// Move the step-up ceiling; used by the thermal supervisor in both
    /// directions
    pub fn set_ceiling(&mut self, multiplier: u8) {
        self.freq_max_m = multiplier;
    }

    pub fn set_default(&mut self, multiplier: u8) {
        self.freq_m_default = multiplier;
    }

    /// A work cycle finished and nonces were harvested
    pub fn got_nonces(&mut self) {
        self.cycle_errors = false;
    }

    /// The cycle had bad nonces; `ratio` is bad/total for the cycle
    pub fn error_count(&mut self, ratio: f64) {
        self.error_rate = self.error_rate * (1.0 - ERROR_WEIGHT) + ratio * ERROR_WEIGHT;
        self.cycle_errors = true;
        self.clean_cycles = 0;
    }

    /// Settle the cycle accounting before deciding on a frequency change
    pub fn pre_update(&mut self) {
        if !self.cycle_errors {
            self.error_rate *= CLEAN_DECAY;
            self.clean_cycles += 1;
        }
    }

    /// Decide the next frequency multiplier, if any.
    ///
    /// The result never exceeds the ceiling, never differs from the current
    /// frequency by more than one, and at most one request is produced per
    /// call. Accumulated evidence is consumed by the decision, so a request
    /// the device later rejects does not cause a repeated step on the very
    /// next cycle.
    pub fn update_freq(&mut self) -> Option<u8> {
        let min_m = config::MIN_CLOCK / 2;

        // thermal supervisor moved the ceiling below us
        if self.freq_m > self.freq_max_m {
            return Some(self.freq_m - 1);
        }

        if self.error_rate > MAX_ERROR_RATE {
            self.error_rate = 0.0;
            self.clean_cycles = 0;
            if self.freq_m > min_m {
                return Some(self.freq_m - 1);
            }
            return None;
        }

        if self.clean_cycles >= STABLE_CYCLES && self.freq_m < self.freq_max_m {
            self.clean_cycles = 0;
            return Some(self.freq_m + 1);
        }

        None
    }
}
