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

//! Driver core for the ModMiner Quad FPGA hashing board.
//!
//! One serial port fronts up to four independent FPGAs. The host runs one
//! worker thread per FPGA; all of them funnel their wire transactions through
//! the per-device port mutex owned by [`Device`].

pub mod bitstream;
pub mod cgminer;
pub mod command;
pub mod config;
pub mod dclk;
pub mod error;
pub mod hal;
pub mod io;
pub mod misc;
pub mod temp_control;


use crate::command::NonceReply;
use crate::error::ErrorKind;
use crate::misc::LOGGER;
use crate::temp_control::Action;

use packed_struct::{PackedStruct, PrimitiveEnum};
use slog::{debug, info, warn};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Short device name used in log messages
const DRIVER_NAME: &str = "MMQ";

fn unix_time_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Driver state of one FPGA.
///
/// Owned by the device record so that a transport reopen cannot invalidate
/// it; programming and calibration survive transient serial faults.
pub struct FpgaState {
    /// Whether a hash job is active on the FPGA
    pub(crate) work_running: bool,
    /// The job whose nonces the FPGA is currently emitting
    pub(crate) running_work: Option<hal::Work>,
    /// The immediately previous job; nonces straggle across a work change
    pub(crate) last_work: Option<hal::Work>,
    /// Wallclock at which the current job was sent
    pub(crate) tv_workstart: Instant,
    /// Hashes already credited for the current job
    pub(crate) hashes: u32,
    /// Prebuilt send-work frame, doubles as staged-work identity
    pub(crate) next_work_cmd: command::SendWorkCmd,
    pub(crate) dclk: dclk::DynClock,
    /// Hard frequency ceiling found by calibration, halved
    pub(crate) freq_max_max_m: u8,
    pub(crate) temp_control: temp_control::TempControl,
    /// Nonces that did not meet minimum difficulty, ever
    pub(crate) bad_share_counter: u64,
    /// Nonces that met minimum difficulty, ever
    pub(crate) good_share_counter: u64,
    /// Most recent reading in degree celsius, 0 when unknown
    pub(crate) temp: u8,
    /// Programming progress 0..100, 101 once programmed and calibrated
    pub(crate) pdone: u8,
}

impl FpgaState {
    fn new(fpga_id: u8, target_temp: u8, hysteresis: u8) -> Self {
        Self {
            work_running: false,
            running_work: None,
            last_work: None,
            tv_workstart: Instant::now(),
            hashes: 0,
            next_work_cmd: command::SendWorkCmd::new(fpga_id),
            dclk: dclk::DynClock::new(),
            freq_max_max_m: 0,
            temp_control: temp_control::TempControl::new(target_temp, hysteresis),
            bad_share_counter: 0,
            good_share_counter: 0,
            temp: 0,
            pdone: 0,
        }
    }
}

/// Temperature snapshot of a whole board
pub struct Stats {
    /// Per-FPGA temperature, 0 when unknown
    pub temps: Vec<u8>,
    /// Highest of the known temperatures
    pub hottest: u8,
}

/// One physical board behind a serial port.
///
/// The port handle lives behind a mutex; every wire transaction acquires it
/// for the duration of command and reply, which keeps transactions of the
/// per-FPGA worker threads from interleaving on the half-duplex port.
pub struct Device {
    pub(crate) path: String,
    pub(crate) name: String,
    pub(crate) port: Mutex<Box<dyn io::Transport>>,
    pub(crate) fpgas: Vec<Mutex<FpgaState>>,
    target_temp: u8,
    hysteresis: u8,
    force_dev_init: bool,
    /// Set once any FPGA completed `init`; gates the forced reprogramming
    initialized: AtomicBool,
    enabled: AtomicBool,
    pub(crate) hw_errors: AtomicU64,
}

impl Device {
    /// Probe every candidate path and register the boards that answer.
    pub fn detect(paths: &[String], config: &config::Configuration) -> Vec<Device> {
        let mut devices = Vec::new();
        for path in paths {
            match Self::detect_one(path, config) {
                Ok(device) => devices.push(device),
                Err(e) => debug!(LOGGER, "{} detect: {}: {}", DRIVER_NAME, path, e),
            }
        }
        devices
    }

    pub fn detect_one(path: &str, config: &config::Configuration) -> error::Result<Device> {
        let port = io::Serial::open(path)?;
        Self::attach(Box::new(port), path, config)
    }

    /// Bring up a board on an already-open transport.
    ///
    /// Flushes any half-received frame out of the MCU, reads the version
    /// string and the FPGA count, and builds the per-FPGA states.
    pub fn attach(
        mut port: Box<dyn io::Transport>,
        path: &str,
        config: &config::Configuration,
    ) -> error::Result<Device> {
        command::noop_flush(port.as_mut())?;

        let name = command::get_version(port.as_mut())?;
        debug!(LOGGER, "{} {}: identified as: {}", DRIVER_NAME, path, name);

        let count = command::fpga_count(port.as_mut())?;
        if count == 0 {
            return Err(ErrorKind::Detect(format!("zero FPGAs reported on {}", path)).into());
        }
        if count as usize > config::MAX_FPGAS {
            return Err(
                ErrorKind::Detect(format!("implausible FPGA count {} on {}", count, path)).into(),
            );
        }
        debug!(LOGGER, "{} {}: has {} FPGAs", DRIVER_NAME, path, count);

        let fpgas = (0..count)
            .map(|id| Mutex::new(FpgaState::new(id, config.target_temp, config.hysteresis)))
            .collect();

        Ok(Device {
            path: path.to_string(),
            name,
            port: Mutex::new(port),
            fpgas,
            target_temp: config.target_temp,
            hysteresis: config.hysteresis,
            force_dev_init: config.force_dev_init,
            initialized: AtomicBool::new(false),
            enabled: AtomicBool::new(true),
            hw_errors: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Display name the board reported via `GET_VERSION`
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fpga_count(&self) -> usize {
        self.fpgas.len()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Lifetime count of invalid nonces across all FPGAs of the board
    pub fn hw_error_count(&self) -> u64 {
        self.hw_errors.load(Ordering::Relaxed)
    }

    pub(crate) fn label(&self, fpga_id: usize) -> String {
        format!("{} {}.{}", DRIVER_NAME, self.path, fpga_id)
    }

    fn check_fpga(&self, fpga_id: usize) -> error::Result<&Mutex<FpgaState>> {
        self.fpgas
            .get(fpga_id)
            .ok_or_else(|| ErrorKind::InvalidFpga(fpga_id).into())
    }

    /// Run one wire transaction under the port lock.
    ///
    /// Any error makes the coordinator reopen the port before the error is
    /// propagated, so the next transaction starts from a clean handle. The
    /// closure must consume every reply byte it expects before returning.
    fn exec<R, F>(&self, f: F) -> error::Result<R>
    where
        F: FnOnce(&mut dyn io::Transport) -> error::Result<R>,
    {
        let mut port = self.port.lock().expect("BUG: port lock poisoned");
        match f(port.as_mut()) {
            Ok(r) => Ok(r),
            Err(e) => {
                if let Err(reopen_err) = port.reopen() {
                    warn!(
                        LOGGER,
                        "{} {}: failed to reopen: {}", DRIVER_NAME, self.path, reopen_err
                    );
                }
                Err(e)
            }
        }
    }

    /// Reset the per-FPGA state and make sure the port is usable.
    pub fn prepare(&self, fpga_id: usize) -> error::Result<()> {
        let state_lock = self.check_fpga(fpga_id)?;
        let mut state = state_lock.lock().expect("BUG: FPGA state lock poisoned");
        *state = FpgaState::new(fpga_id as u8, self.target_temp, self.hysteresis);

        // a ping reestablishes a closed port here rather than mid-mining
        self.exec(|port| port.write_all(&[command::OpCode::Ping.to_primitive()]))
    }

    /// Ensure the FPGA is programmed and find its maximum stable frequency.
    ///
    /// Holds the port for the whole sequence; peer FPGAs on the same board
    /// are not productive yet, so blocking them is fine.
    pub fn init(
        &self,
        fpga_id: usize,
        bitstream: &mut dyn hal::BitstreamSource,
    ) -> error::Result<()> {
        let state_lock = self.check_fpga(fpga_id)?;
        let mut state = state_lock.lock().expect("BUG: FPGA state lock poisoned");
        let state = &mut *state;

        let label = self.label(fpga_id);
        let force_program = self.force_dev_init && !self.initialized.load(Ordering::SeqCst);

        self.exec(|port| {
            let usercode = command::get_usercode(port, fpga_id as u8)?;
            if usercode != command::USERCODE {
                info!(LOGGER, "{}: FPGA not programmed", label);
                let (mut source, total) = bitstream.open()?;
                bitstream::upload(port, &label, source.as_mut(), total, &mut state.pdone)?;
            } else if force_program {
                debug!(
                    LOGGER,
                    "{}: FPGA is already programmed, but re-init is forced", label
                );
                let (mut source, total) = bitstream.open()?;
                bitstream::upload(port, &label, source.as_mut(), total, &mut state.pdone)?;
            } else {
                debug!(LOGGER, "{}: FPGA is already programmed :)", label);
            }
            state.pdone = 101;

            // The MCU rejects specific frequencies depending on silicon lot
            // and temperature; walk down until one sticks and the FPGA stays
            // enabled on it.
            let mut freq_m = config::MAX_CLOCK / 2 + 1;
            loop {
                if freq_m <= config::MIN_CLOCK / 2 {
                    return Err(ErrorKind::Calibration(fpga_id).into());
                }
                freq_m -= 1;
                if !command::set_clock(port, fpga_id as u8, freq_m * 2)? {
                    // MCU rejected assignment
                    continue;
                }
                match command::check_work(port, fpga_id as u8)? {
                    // MCU took assignment, but disabled FPGA
                    NonceReply::Disabled => continue,
                    _ => break,
                }
            }
            state.dclk.applied(freq_m);
            state.dclk.set_ceiling(freq_m);
            state.freq_max_max_m = freq_m;

            if freq_m > config::DEF_CLOCK / 2 {
                if command::set_clock(port, fpga_id as u8, config::DEF_CLOCK)? {
                    state.dclk.applied(config::DEF_CLOCK / 2);
                } else {
                    warn!(
                        LOGGER,
                        "{}: failed to set desired initial frequency of {} MHz",
                        label,
                        config::DEF_CLOCK
                    );
                }
            }
            state.dclk.set_default(state.dclk.freq());

            info!(
                LOGGER,
                "{}: frequency set to {} MHz (range: {}-{})",
                label,
                u32::from(state.dclk.freq()) * 2,
                config::MIN_CLOCK,
                u32::from(state.dclk.ceiling()) * 2
            );
            Ok(())
        })?;

        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// One work cycle for one FPGA, driven by the host scheduler.
    ///
    /// Returns the estimated number of hashes done, or -1 when the work unit
    /// had to be abandoned because of a transport fault. The caller's nonce
    /// cursor in `work` is advanced by the accounted hashes. The FPGA always
    /// sweeps the full search space on its own, so `max_nonce` is taken only
    /// for scheduler interface parity.
    pub fn scanhash(
        &self,
        fpga_id: usize,
        work: &mut hal::Work,
        _max_nonce: u64,
        host: &dyn hal::Host,
    ) -> i64 {
        let state_lock = match self.check_fpga(fpga_id) {
            Ok(lock) => lock,
            Err(e) => {
                warn!(LOGGER, "{}: scanhash: {}", self.label(fpga_id), e);
                return -1;
            }
        };
        let mut state = state_lock.lock().expect("BUG: FPGA state lock poisoned");
        let state = &mut *state;

        let startwork = state.next_work_cmd.stage(work);
        let mut hashes: i64 = 0;

        if startwork {
            // The board keeps emitting nonces of the old job for a moment
            // after a new one is sent; they are harvested on the next cycle
            // and credited against last_work instead of being drained here.
        } else if state.work_running {
            hashes = match self.process_results(fpga_id, state, host) {
                Ok(hashes) => hashes,
                Err(e) => {
                    warn!(
                        LOGGER,
                        "{}: abandoning work after transport fault: {}",
                        self.label(fpga_id),
                        e
                    );
                    state.work_running = false;
                    return -1;
                }
            };
            if host.work_restart(fpga_id) {
                state.work_running = false;
                return hashes;
            }
        } else {
            state.work_running = true;
        }

        if startwork {
            state.last_work = state.running_work.take();
            state.running_work = Some(work.clone());
            if let Err(e) = self.start_work(fpga_id, state) {
                warn!(
                    LOGGER,
                    "{}: failed to start work: {}",
                    self.label(fpga_id),
                    e
                );
                state.work_running = false;
                return -1;
            }
        }

        // this is intentionally early
        work.nonce = work.nonce.wrapping_add(hashes as u32);
        hashes
    }

    fn start_work(&self, fpga_id: usize, state: &mut FpgaState) -> error::Result<()> {
        let frame = state.next_work_cmd.pack();
        let tv_workstart = self.exec(|port| {
            port.write_all(&frame)?;
            let tv_workstart = Instant::now();
            command::read_ack(port, "start work")?;
            Ok(tv_workstart)
        })?;
        state.tv_workstart = tv_workstart;
        state.hashes = 0;

        if let Some(work) = state.running_work.as_ref() {
            debug!(
                LOGGER,
                "{}: started work: {}",
                self.label(fpga_id),
                hex::encode(&work.data[..])
            );
        }
        Ok(())
    }

    /// Harvest nonces and temperature for the running job.
    ///
    /// Polls up to [`config::NONCE_POLL_ITERATIONS`] times, releasing the
    /// port between polls so the peer FPGA threads make progress. Returns the
    /// estimated hash count credited for this cycle.
    fn process_results(
        &self,
        fpga_id: usize,
        state: &mut FpgaState,
        host: &dyn hal::Host,
    ) -> error::Result<i64> {
        self.poll_temperature_at(fpga_id, state, unix_time_secs())?;

        let mut immediate_nonces: u32 = 0;
        let mut immediate_bad: u32 = 0;
        let mut iter = config::NONCE_POLL_ITERATIONS;
        loop {
            let reply = self.exec(|port| command::check_work(port, fpga_id as u8))?;
            match reply {
                NonceReply::Idle => {}
                NonceReply::Disabled => {
                    // mid-run this is not a status report but a bogus nonce
                    warn!(
                        LOGGER,
                        "{}: FPGA reports disabled while hashing",
                        self.label(fpga_id)
                    );
                    immediate_nonces += 1;
                    immediate_bad += 1;
                    state.bad_share_counter += 1;
                    self.hw_errors.fetch_add(1, Ordering::Relaxed);
                    host.hw_error(fpga_id);
                }
                NonceReply::Nonce(nonce) => {
                    immediate_nonces += 1;
                    self.handle_nonce(fpga_id, state, host, nonce, &mut immediate_bad);
                }
            }
            iter -= 1;
            if host.work_restart(fpga_id) || iter == 0 {
                break;
            }
            thread::sleep(config::NONCE_POLL_DELAY);
            if host.work_restart(fpga_id) {
                break;
            }
        }

        // The FPGA provides no exact count; estimate from frequency and
        // elapsed time. The estimate paces the host's work generation.
        let elapsed = state.tv_workstart.elapsed();
        let mut hashes = u64::from(state.dclk.freq()) * 2 * elapsed.as_micros() as u64;
        if hashes > u64::from(u32::max_value()) {
            debug!(
                LOGGER,
                "{}: finished work before new one sent",
                self.label(fpga_id)
            );
            hashes = u64::from(u32::max_value());
        }
        if hashes <= u64::from(state.hashes) {
            hashes = 1;
        } else {
            hashes -= u64::from(state.hashes);
        }
        state.hashes = state.hashes.saturating_add(hashes as u32);

        state.dclk.got_nonces();
        if immediate_bad > 0 {
            state
                .dclk
                .error_count(f64::from(immediate_bad) / f64::from(immediate_nonces));
        }
        state.dclk.pre_update();
        if let Some(multiplier) = state.dclk.update_freq() {
            self.apply_clock(fpga_id, state, multiplier, "")?;
        }

        Ok(hashes as i64)
    }

    fn handle_nonce(
        &self,
        fpga_id: usize,
        state: &mut FpgaState,
        host: &dyn hal::Host,
        nonce: u32,
        immediate_bad: &mut u32,
    ) {
        let current = state
            .running_work
            .as_ref()
            .map_or(false, |work| host.test_nonce(work, nonce));
        if current {
            debug!(
                LOGGER,
                "{}: nonce for current  work: {:08x}",
                self.label(fpga_id),
                nonce
            );
            state.good_share_counter += 1;
            if let Some(work) = state.running_work.as_ref() {
                host.submit_nonce(fpga_id, work, nonce);
            }
            return;
        }

        let previous = state
            .last_work
            .as_ref()
            .map_or(false, |work| host.test_nonce(work, nonce));
        if previous {
            debug!(
                LOGGER,
                "{}: nonce for previous work: {:08x}",
                self.label(fpga_id),
                nonce
            );
            state.good_share_counter += 1;
            if let Some(work) = state.last_work.as_ref() {
                host.submit_nonce(fpga_id, work, nonce);
            }
            return;
        }

        debug!(
            LOGGER,
            "{}: nonce with H not zero  : {:08x}",
            self.label(fpga_id),
            nonce
        );
        *immediate_bad += 1;
        state.bad_share_counter += 1;
        self.hw_errors.fetch_add(1, Ordering::Relaxed);
        host.hw_error(fpga_id);
    }

    /// Read the temperature and let the thermal supervisor act on it, all
    /// within one port acquisition.
    fn poll_temperature_at(
        &self,
        fpga_id: usize,
        state: &mut FpgaState,
        now: u64,
    ) -> error::Result<()> {
        let label = self.label(fpga_id);
        self.exec(|port| {
            let temp = command::read_temperature(port, fpga_id as u8)?;
            state.temp = temp;

            let action =
                state
                    .temp_control
                    .update(temp, now, state.dclk.ceiling(), state.freq_max_max_m);
            match action {
                Action::None => {}
                Action::ReduceClock => {
                    let old = state.dclk.freq();
                    if old > config::MIN_CLOCK / 2 {
                        let target = old - 1;
                        if command::set_clock(port, fpga_id as u8, target * 2)? {
                            state.dclk.applied(target);
                            info!(
                                LOGGER,
                                "{}: frequency dropped from {} to {} MHz (temp: {})",
                                label,
                                u32::from(old) * 2,
                                u32::from(target) * 2,
                                temp
                            );
                        }
                    }
                    // the governor must not raise the clock right back
                    state.dclk.set_ceiling(state.dclk.freq());
                }
                Action::SetCeiling(multiplier) => state.dclk.set_ceiling(multiplier),
            }
            Ok(())
        })
    }

    /// Issue `SET_CLOCK` for an absolute multiplier and track acceptance.
    pub(crate) fn apply_clock(
        &self,
        fpga_id: usize,
        state: &mut FpgaState,
        multiplier: u8,
        reason: &str,
    ) -> error::Result<bool> {
        let old = state.dclk.freq();
        let accepted = self.exec(|port| command::set_clock(port, fpga_id as u8, multiplier * 2))?;
        if accepted {
            state.dclk.applied(multiplier);
            info!(
                LOGGER,
                "{}: frequency {} from {} MHz to {} MHz{}",
                self.label(fpga_id),
                if multiplier < old { "dropped" } else { "raised" },
                u32::from(old) * 2,
                u32::from(multiplier) * 2,
                reason
            );
        } else {
            debug!(
                LOGGER,
                "{}: frequency change to {} MHz rejected by MCU",
                self.label(fpga_id),
                u32::from(multiplier) * 2
            );
        }
        Ok(accepted)
    }

    /// Board temperature snapshot.
    ///
    /// While the device is enabled the workers keep the readings fresh and
    /// this returns the cache; a disabled device is polled right here.
    pub fn get_stats(&self) -> Stats {
        let refresh = !self.is_enabled();
        let now = unix_time_secs();

        let mut temps = Vec::with_capacity(self.fpgas.len());
        let mut hottest = 0u8;
        for (fpga_id, state_lock) in self.fpgas.iter().enumerate() {
            let mut state = state_lock.lock().expect("BUG: FPGA state lock poisoned");
            if refresh {
                if let Err(e) = self.poll_temperature_at(fpga_id, &mut state, now) {
                    debug!(
                        LOGGER,
                        "{}: temperature read failed: {}",
                        self.label(fpga_id),
                        e
                    );
                }
            }
            temps.push(state.temp);
            hottest = hottest.max(state.temp);
        }

        Stats { temps, hottest }
    }

    /// Per-FPGA shutdown; forgets any in-flight work of that FPGA.
    pub fn shutdown(&self, fpga_id: usize) {
        if let Ok(state_lock) = self.check_fpga(fpga_id) {
            let mut state = state_lock.lock().expect("BUG: FPGA state lock poisoned");
            state.work_running = false;
            state.running_work = None;
            state.last_work = None;
        }
    }
}
