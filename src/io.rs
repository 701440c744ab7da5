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

//! Serial transport for the board MCU.
//!
//! All reads are bounded by [`config::SERIAL_TIMEOUT`]; the protocol is
//! half-duplex so there is never more than one outstanding reply.

use crate::config;
use crate::error;

use std::io::{self, Read, Write};

use serialport::prelude::*;

/// Byte transport towards one board.
///
/// The device coordinator owns the implementation behind its port mutex;
/// workers never hold onto it across lock releases.
pub trait Transport: Send {
    fn write_all(&mut self, buf: &[u8]) -> error::Result<()>;

    /// Read exactly `buf.len()` bytes; a timeout before that is an error
    fn read_exact(&mut self, buf: &mut [u8]) -> error::Result<()>;

    /// Read whatever the device has to say until the first timeout
    fn drain(&mut self) -> error::Result<Vec<u8>>;

    /// Close and open the port again, dropping any in-flight state
    fn reopen(&mut self) -> error::Result<()>;
}

fn open_port(path: &str) -> error::Result<Box<dyn SerialPort>> {
    let settings = SerialPortSettings {
        baud_rate: 115_200,
        data_bits: DataBits::Eight,
        flow_control: FlowControl::None,
        parity: Parity::None,
        stop_bits: StopBits::One,
        timeout: config::SERIAL_TIMEOUT,
    };
    serialport::open_with_settings(path, &settings).map_err(Into::into)
}

/// `Transport` backed by a real serial port.
///
/// The handle is dropped on `reopen` failure and lazily reestablished on the
/// next operation, so a transient fault does not permanently kill the device.
pub struct Serial {
    path: String,
    port: Option<Box<dyn SerialPort>>,
}

impl Serial {
    pub fn open(path: &str) -> error::Result<Self> {
        let port = open_port(path)?;
        Ok(Self {
            path: path.to_string(),
            port: Some(port),
        })
    }

    fn port(&mut self) -> error::Result<&mut Box<dyn SerialPort>> {
        if self.port.is_none() {
            self.port = Some(open_port(&self.path)?);
        }
        Ok(self
            .port
            .as_mut()
            .expect("BUG: serial port missing right after open"))
    }
}

impl Transport for Serial {
    fn write_all(&mut self, buf: &[u8]) -> error::Result<()> {
        let port = self.port()?;
        port.write_all(buf)?;
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> error::Result<()> {
        let port = self.port()?;
        port.read_exact(buf)?;
        Ok(())
    }

    fn drain(&mut self) -> error::Result<Vec<u8>> {
        let port = self.port()?;
        let mut out = Vec::new();
        let mut buf = [0u8; config::READ_BUF_SIZE];
        loop {
            match port.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::TimedOut => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(out)
    }

    fn reopen(&mut self) -> error::Result<()> {
        self.port = None;
        self.port = Some(open_port(&self.path)?);
        Ok(())
    }
}
