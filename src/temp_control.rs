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

//! Thermal supervisor for one FPGA.
//!
//! Overheat throttles the clock at most once per wallclock second; cooling
//! below the target raises the governor ceiling again, with hysteresis so the
//! two directions cannot oscillate around the target.

/// What the driver should do after a temperature reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Action {
    None,
    /// Step the clock down one halved unit, then clamp the governor ceiling
    /// to the resulting frequency
    ReduceClock,
    /// Move the governor ceiling to the given multiplier
    SetCeiling(u8),
}

#[derive(Debug, Clone)]
pub struct TempControl {
    target_temp: u8,
    hysteresis: u8,
    /// Wallclock second of the last thermal throttle
    last_cutoff_reduced: Option<u64>,
}

impl TempControl {
    pub fn new(target_temp: u8, hysteresis: u8) -> Self {
        Self {
            target_temp,
            hysteresis,
            last_cutoff_reduced: None,
        }
    }

    /// Judge the reading taken at wallclock second `now`.
    ///
    /// * `freq_max_m` - current governor ceiling, halved
    /// * `freq_max_max_m` - hard ceiling found by calibration, halved
    pub fn update(&mut self, temp: u8, now: u64, freq_max_m: u8, freq_max_max_m: u8) -> Action {
        // a zero reading means the sensor has nothing to say
        if temp == 0 {
            return Action::None;
        }

        if u16::from(temp) > u16::from(self.target_temp) + u16::from(self.hysteresis) {
            if self.last_cutoff_reduced != Some(now) {
                self.last_cutoff_reduced = Some(now);
                return Action::ReduceClock;
            }
            return Action::None;
        }

        if freq_max_m < freq_max_max_m && temp < self.target_temp {
            if temp < self.target_temp.saturating_sub(self.hysteresis) {
                return Action::SetCeiling(freq_max_max_m);
            }
            return Action::SetCeiling(freq_max_m + 1);
        }

        Action::None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn throttle_is_rate_limited() {
        let mut control = TempControl::new(80, 3);

        // three hot readings within the same wallclock second
        assert_eq!(control.update(90, 100, 114, 114), Action::ReduceClock);
        assert_eq!(control.update(90, 100, 114, 114), Action::None);
        assert_eq!(control.update(90, 100, 114, 114), Action::None);

        // the next second may throttle again
        assert_eq!(control.update(90, 101, 113, 114), Action::ReduceClock);
    }

    #[test]
    fn hot_band_needs_hysteresis_margin() {
        let mut control = TempControl::new(80, 3);

        // within target + hysteresis nothing happens
        assert_eq!(control.update(83, 10, 114, 114), Action::None);
        assert_eq!(control.update(84, 11, 114, 114), Action::ReduceClock);
    }

    #[test]
    fn deep_cool_down_restores_ceiling() {
        let mut control = TempControl::new(80, 3);
        assert_eq!(control.update(70, 10, 99, 114), Action::SetCeiling(114));
    }

    #[test]
    fn shallow_cool_down_creeps_up() {
        let mut control = TempControl::new(80, 3);
        assert_eq!(control.update(78, 10, 99, 114), Action::SetCeiling(100));
    }

    #[test]
    fn at_target_nothing_moves() {
        let mut control = TempControl::new(80, 3);
        assert_eq!(control.update(80, 10, 99, 114), Action::None);
    }

    #[test]
    fn ceiling_already_restored_holds() {
        let mut control = TempControl::new(80, 3);
        assert_eq!(control.update(70, 10, 114, 114), Action::None);
    }

    #[test]
    fn zero_reading_is_unknown() {
        let mut control = TempControl::new(80, 3);
        // no throttle and no ceiling relax either
        assert_eq!(control.update(0, 10, 99, 114), Action::None);
    }
}
