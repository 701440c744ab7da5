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

//! This module handles ModMiner configuration and configuration file parsing

use crate::error::{self, ErrorKind};

use serde::Deserialize;

use std::time::Duration;

/// Lowest clock the boards accept, in MHz
pub const MIN_CLOCK: u8 = 2;

/// Frequency every FPGA is stepped down to right after calibration, in MHz
pub const DEF_CLOCK: u8 = 200;

/// Highest clock the calibration search starts from, in MHz
pub const MAX_CLOCK: u8 = 230;

/// Maximum number of FPGAs a single board exposes
pub const MAX_FPGAS: usize = 4;

/// Timeout for a single bounded read on the serial port
pub const SERIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// The largest reply is the version string; no fixed-width reply exceeds 4 bytes
pub const READ_BUF_SIZE: usize = 256;

/// How many times one work cycle polls the device for nonces
pub const NONCE_POLL_ITERATIONS: usize = 200;

/// Sleep between nonce polls, yields the port to the peer FPGA threads
pub const NONCE_POLL_DELAY: Duration = Duration::from_millis(1);

/// Bitstream data is streamed to the device in chunks of this size
pub const BITSTREAM_CHUNK_SIZE: usize = 32;

/// Default temperature the thermal supervisor steers toward, in degree celsius
pub const DEFAULT_TARGET_TEMP: u8 = 85;

/// Default thermal hysteresis, in degree celsius
pub const DEFAULT_HYSTERESIS: u8 = 3;

fn default_target_temp() -> u8 {
    DEFAULT_TARGET_TEMP
}

fn default_hysteresis() -> u8 {
    DEFAULT_HYSTERESIS
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Configuration {
    /// Temperature the thermal supervisor throttles above and relaxes below
    #[serde(default = "default_target_temp")]
    pub target_temp: u8,
    /// Dead band around `target_temp` preventing throttle/relax oscillation
    #[serde(default = "default_hysteresis")]
    pub hysteresis: u8,
    /// Reprogram FPGAs on first initialization even when the usercode matches
    #[serde(default)]
    pub force_dev_init: bool,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            target_temp: DEFAULT_TARGET_TEMP,
            hysteresis: DEFAULT_HYSTERESIS,
            force_dev_init: false,
        }
    }
}

impl Configuration {
    pub fn parse(config: &str) -> error::Result<Self> {
        toml::from_str(config)
            .map_err(|e| ErrorKind::General(format!("failed to interpret config file: {}", e)))
            .map_err(Into::into)
    }

    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Configuration::parse("").expect("empty config must parse");
        assert_eq!(config.target_temp, DEFAULT_TARGET_TEMP);
        assert_eq!(config.hysteresis, DEFAULT_HYSTERESIS);
        assert_eq!(config.force_dev_init, false);
    }

    #[test]
    fn test_config_override() {
        let config = Configuration::parse(
            "target_temp = 80\n\
             hysteresis = 5\n\
             force_dev_init = true\n",
        )
        .expect("config must parse");
        assert_eq!(config.target_temp, 80);
        assert_eq!(config.hysteresis, 5);
        assert_eq!(config.force_dev_init, true);
    }

    #[test]
    fn test_config_rejects_unknown_fields() {
        assert!(Configuration::parse("fan_speed = 100\n").is_err());
    }

    #[test]
    fn test_config_from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().expect("cannot create temp file");
        write!(file, "target_temp = 75\n").expect("cannot write temp file");
        let config = Configuration::from_file(file.path()).expect("config must load");
        assert_eq!(config.target_temp, 75);
        assert_eq!(config.hysteresis, DEFAULT_HYSTERESIS);
    }
}
