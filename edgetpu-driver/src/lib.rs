// Copyright 2022 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![cfg_attr(not(test), no_std)]

//! USB framing of the Edge TPU protocol. Every transfer is submitted to the
//! host stack asynchronously and the calling task blocks on a Completion
//! until the callback fires or the transfer timeout expires.

extern crate alloc;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::time::Duration;
use edgetpu_interface::*;
use edgetpu_shared::*;
use log::{error, info, trace, warn};
use spin::Mutex;

pub mod registers;
use registers::*;

// Bound on register polls during bring-up; the chip settles in a few reads.
const REGISTER_POLL_LIMIT: usize = 100;
const TEMPSENSE_SETTLE_TIME: Duration = Duration::from_micros(100);

/// A completion record read back from the event endpoint.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Event {
    pub address: u64,
    pub length: u32,
    pub tag: u8,
}
impl Event {
    pub fn from_bytes(bytes: &[u8]) -> Option<Event> {
        if bytes.len() < EVENT_SIZE {
            return None;
        }
        let mut address = [0u8; 8];
        address.copy_from_slice(&bytes[0..8]);
        let mut length = [0u8; 4];
        length.copy_from_slice(&bytes[8..12]);
        Some(Event {
            address: u64::from_le_bytes(address),
            length: u32::from_le_bytes(length),
            tag: bytes[12] & 0xf,
        })
    }
}

/// Builds the header that precedes every bulk-out payload.
pub fn bulk_header(tag: DescriptorTag, length: u32) -> [u8; BULK_HEADER_SIZE] {
    let mut header = [0u8; BULK_HEADER_SIZE];
    header[..4].copy_from_slice(&length.to_le_bytes());
    header[4] = u8::from(tag) & 0xf;
    header
}

/// One-shot rendezvous between a transfer callback and the waiting task.
#[derive(Default)]
pub struct Completion {
    result: Mutex<Option<TransferResult>>,
}
impl Completion {
    pub fn new() -> Arc<Self> { Arc::new(Completion::default()) }

    pub fn callback(self: &Arc<Self>) -> TransferCallback {
        let completion = self.clone();
        Box::new(move |result| completion.complete(result))
    }

    pub fn complete(&self, result: TransferResult) { *self.result.lock() = Some(result); }

    pub fn take(&self) -> Option<TransferResult> { self.result.lock().take() }
}

#[derive(Clone, Copy, Debug)]
enum RegisterWidth {
    Bits32,
    Bits64,
}

pub struct TpuDriver {
    usb: Arc<dyn UsbHostEdgeTpu>,
    clock: Arc<dyn SystemClock>,
    transfer_timeout: Duration,
    max_chunk: usize,
}
impl TpuDriver {
    pub fn new(
        usb: Arc<dyn UsbHostEdgeTpu>,
        clock: Arc<dyn SystemClock>,
        transfer_timeout: Duration,
        max_chunk: usize,
    ) -> Self {
        TpuDriver {
            usb,
            clock,
            transfer_timeout,
            max_chunk: max_chunk.max(BULK_HEADER_SIZE),
        }
    }

    // Blocks until |completion| fires or the transfer timeout expires.
    fn wait(&self, completion: &Completion) -> Result<TransferResult, EdgeTpuError> {
        let deadline = self.clock.now() + self.transfer_timeout;
        loop {
            if let Some(result) = completion.take() {
                return Ok(result);
            }
            if self.clock.now() >= deadline {
                return Err(EdgeTpuError::Timeout);
            }
            self.clock.relax();
        }
    }

    fn transfer(
        &self,
        submit: impl FnOnce(TransferCallback) -> Result<(), EdgeTpuError>,
    ) -> Result<Vec<u8>, EdgeTpuError> {
        let completion = Completion::new();
        submit(completion.callback())?;
        let result = self.wait(&completion)?;
        if !result.is_ok() {
            warn!("transfer completed with {:?}", result.status);
            return Err(EdgeTpuError::TransferFailed);
        }
        Ok(result.data)
    }

    fn csr_transfer(
        &self,
        reg: u32,
        data: Vec<u8>,
        read: bool,
        width: RegisterWidth,
    ) -> Result<Vec<u8>, EdgeTpuError> {
        let mut request_type = RequestType::VENDOR;
        if read {
            request_type |= RequestType::DEVICE_TO_HOST;
        }
        let (request, length) = match width {
            RegisterWidth::Bits32 => (1, 4),
            RegisterWidth::Bits64 => (0, 8),
        };
        let setup = SetupPacket {
            request_type,
            request,
            value: (reg & 0xffff) as u16,
            index: ((reg >> 16) & 0xffff) as u16,
            length,
        };
        self.transfer(|done| self.usb.control(setup, data, done))
            .map_err(|e| {
                error!("CSR {:#x} {} failed: {:?}", reg, if read { "read" } else { "write" }, e);
                e
            })
    }

    pub fn read_csr32(&self, reg: u32) -> Result<u32, EdgeTpuError> {
        let data = self.csr_transfer(reg, Vec::new(), true, RegisterWidth::Bits32)?;
        let bytes: [u8; 4] = data
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or(EdgeTpuError::TransferFailed)?;
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn read_csr64(&self, reg: u32) -> Result<u64, EdgeTpuError> {
        let data = self.csr_transfer(reg, Vec::new(), true, RegisterWidth::Bits64)?;
        let bytes: [u8; 8] = data
            .get(..8)
            .and_then(|b| b.try_into().ok())
            .ok_or(EdgeTpuError::TransferFailed)?;
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn write_csr32(&self, reg: u32, value: u32) -> Result<(), EdgeTpuError> {
        self.csr_transfer(reg, value.to_le_bytes().to_vec(), false, RegisterWidth::Bits32)
            .map(|_| ())
    }

    pub fn write_csr64(&self, reg: u32, value: u64) -> Result<(), EdgeTpuError> {
        self.csr_transfer(reg, value.to_le_bytes().to_vec(), false, RegisterWidth::Bits64)
            .map(|_| ())
    }

    fn poll_csr32(&self, reg: u32, done: impl Fn(u32) -> bool) -> Result<u32, EdgeTpuError> {
        for _ in 0..REGISTER_POLL_LIMIT {
            let value = self.read_csr32(reg)?;
            if done(value) {
                return Ok(value);
            }
            self.clock.relax();
        }
        error!("CSR {:#x} did not settle", reg);
        Err(EdgeTpuError::InitTimeout)
    }

    fn poll_csr64(&self, reg: u32, done: impl Fn(u64) -> bool) -> Result<u64, EdgeTpuError> {
        for _ in 0..REGISTER_POLL_LIMIT {
            let value = self.read_csr64(reg)?;
            if done(value) {
                return Ok(value);
            }
            self.clock.relax();
        }
        error!("CSR {:#x} did not settle", reg);
        Err(EdgeTpuError::InitTimeout)
    }

    fn delay(&self, duration: Duration) {
        let deadline = self.clock.now() + duration;
        while self.clock.now() < deadline {
            self.clock.relax();
        }
    }

    fn read_scu_ctrl_3(&self) -> Result<ScuCtrl3, EdgeTpuError> {
        Ok(ScuCtrl3::from_bytes(self.read_csr32(SCU_CTRL_3)?.to_ne_bytes()))
    }

    /// Brings the chip out of reset at |mode| and starts the cores.
    pub fn initialize(&self, mode: PerformanceMode) -> Result<(), EdgeTpuError> {
        trace!("initialize {:?}", mode);

        // Check the chip id and that a scratch register holds a write.
        let omc0_00 = Omc000::from_bytes(self.read_csr32(OMC0_00)?.to_ne_bytes());
        if omc0_00.chip_id() as u32 != CHIP_ID {
            error!("Unexpected chip id {:#x}", omc0_00.chip_id());
            return Err(EdgeTpuError::ChipIdMismatch);
        }
        let omc0_00 = omc0_00.with_test_reg0(0xaa);
        self.write_csr32(OMC0_00, u32::from_ne_bytes(omc0_00.into_bytes()))?;
        let omc0_00 = Omc000::from_bytes(self.read_csr32(OMC0_00)?.to_ne_bytes());
        if omc0_00.test_reg0() != 0xaa {
            error!("Scratch register readback {:#x}", omc0_00.test_reg0());
            return Err(EdgeTpuError::RegisterTestFailed);
        }

        // Leave the inactive PHY modes.
        let scu_ctrl_0 = ScuCtrl0::from_bytes(self.read_csr32(SCU_CTRL_0)?.to_ne_bytes())
            .with_rg_pcie_inact_phy_mode(0)
            .with_rg_usb_inact_phy_mode(0);
        self.write_csr32(SCU_CTRL_0, u32::from_ne_bytes(scu_ctrl_0.into_bytes()))?;

        // Disable clock gating while we reconfigure.
        let scu_ctrl_2 = ScuCtrl2::from_bytes(self.read_csr32(SCU_CTRL_2)?.to_ne_bytes())
            .with_rg_gated_gcb(0x2);
        self.write_csr32(SCU_CTRL_2, u32::from_ne_bytes(scu_ctrl_2.into_bytes()))?;

        // Go into reset, if we're not there.
        let scu_ctrl_3 = self.read_scu_ctrl_3()?;
        if scu_ctrl_3.rg_force_sleep() != FORCE_SLEEP_ENTER {
            let scu_ctrl_3 = scu_ctrl_3.with_rg_force_sleep(FORCE_SLEEP_ENTER);
            self.write_csr32(SCU_CTRL_3, u32::from_ne_bytes(scu_ctrl_3.into_bytes()))?;
            self.poll_csr32(SCU_CTRL_3, |v| {
                ScuCtrl3::from_bytes(v.to_ne_bytes()).cur_pwr_state() == PWR_STATE_SLEEP
            })?;
            self.write_csr32(GCBB_CREDIT0, 0xf)?;
            self.write_csr32(GCBB_CREDIT0, 0)?;
        }

        // Select clocks for the performance mode and exit reset.
        let clocks = mode.clock_rates();
        let scu_ctrl_3 = self
            .read_scu_ctrl_3()?
            .with_rg_force_sleep(FORCE_SLEEP_EXIT)
            .with_gcb_clock_rate(clocks.gcb)
            .with_axi_clock_rate(clocks.axi)
            .with_usb_8051_clock_rate(clocks.usb_8051);
        self.write_csr32(SCU_CTRL_3, u32::from_ne_bytes(scu_ctrl_3.into_bytes()))?;
        self.poll_csr32(SCU_CTRL_3, |v| {
            ScuCtrl3::from_bytes(v.to_ne_bytes()).cur_pwr_state() == PWR_STATE_RUN
        })?;

        // A known register reads back zero once reset has been exited.
        self.poll_csr64(SCALAR_CORE_RUN_CONTROL, |v| v == 0)?;

        let idle = IdleRegister::from_bytes(IdleRegister::RESET_VALUE.to_ne_bytes())
            .with_disable_idle(false)
            .with_counter(1);
        self.write_csr64(IDLE_REGISTER, u64::from_ne_bytes(idle.into_bytes()))?;

        self.broadcast_to_tiles()?;
        let deep_sleep = DeepSleep::new()
            .with_to_sleep_delay(2)
            .with_to_wake_delay(30);
        self.write_csr64(DEEP_SLEEP, u64::from_ne_bytes(deep_sleep.into_bytes()))?;

        // Re-enable clock gating.
        let scu_ctrl_2 = ScuCtrl2::from_bytes(self.read_csr32(SCU_CTRL_2)?.to_ne_bytes())
            .with_rg_gated_gcb(1);
        self.write_csr32(SCU_CTRL_2, u32::from_ne_bytes(scu_ctrl_2.into_bytes()))?;

        // Single bulk-out endpoint; events on their own endpoint.
        self.write_csr64(DESCR_EP, 0xf0)?;
        self.write_csr64(MULTI_BO_EP, 0)?;
        self.write_csr64(OUTFEED_CHUNK_LENGTH, 0x20)?;

        self.enable_tempsense()?;
        self.run_control(RunControl::MoveToRun)?;
        info!("Edge TPU up at {:?}", mode);
        Ok(())
    }

    fn enable_tempsense(&self) -> Result<(), EdgeTpuError> {
        let omc0_d0 = Omc0D0::from_bytes(self.read_csr32(OMC0_D0)?.to_ne_bytes())
            .with_clk_en(true)
            .with_adr(0xc)
            .with_tref(0)
            .with_tslope(0)
            .with_t_setting(0);
        self.write_csr32(OMC0_D0, u32::from_ne_bytes(omc0_d0.into_bytes()))?;

        let omc0_d8 = Omc0D8::from_bytes(self.read_csr32(OMC0_D8)?.to_ne_bytes())
            .with_enbg(true)
            .with_envr(true)
            .with_enad(true);
        self.write_csr32(OMC0_D8, u32::from_ne_bytes(omc0_d8.into_bytes()))?;

        self.delay(TEMPSENSE_SETTLE_TIME);

        let omc0_dc = Omc0DC::from_bytes(self.read_csr32(OMC0_DC)?.to_ne_bytes())
            .with_enthmc(true);
        self.write_csr32(OMC0_DC, u32::from_ne_bytes(omc0_dc.into_bytes()))
    }

    // Tile writes are only ordered after tileconfig0 reads back.
    fn broadcast_to_tiles(&self) -> Result<(), EdgeTpuError> {
        let broadcast = u64::from_ne_bytes(TileConfig::broadcast().into_bytes());
        self.write_csr64(TILECONFIG0, broadcast)?;
        self.poll_csr64(TILECONFIG0, |v| v == broadcast).map(|_| ())
    }

    /// Moves the scalar core and every tile to |state|.
    pub fn run_control(&self, state: RunControl) -> Result<(), EdgeTpuError> {
        let value = u64::from(state);
        for reg in SCALAR_CORE_RUN_CONTROLS {
            self.write_csr64(reg, value)?;
        }
        self.broadcast_to_tiles()?;
        for reg in TILE_RUN_CONTROLS {
            self.write_csr64(reg, value)?;
        }
        Ok(())
    }

    /// Junction temperature in degrees Celsius.
    pub fn temperature(&self) -> Result<f32, EdgeTpuError> {
        let omc0_dc = Omc0DC::from_bytes(self.read_csr32(OMC0_DC)?.to_ne_bytes());
        Ok(temperature_from_raw(omc0_dc.data()))
    }

    fn bulk_out(&self, data: &[u8]) -> Result<(), EdgeTpuError> {
        for chunk in data.chunks(self.max_chunk) {
            self.transfer(|done| self.usb.bulk_out(BULK_OUT_ENDPOINT, chunk.to_vec(), done))?;
        }
        Ok(())
    }

    fn send(&self, tag: DescriptorTag, data: &[u8]) -> Result<(), EdgeTpuError> {
        let length = u32::try_from(data.len()).map_err(|_| EdgeTpuError::TransferFailed)?;
        trace!("send {:?} {} bytes", tag, length);
        self.bulk_out(&bulk_header(tag, length)).map_err(|e| {
            error!("{:?} header failed: {:?}", tag, e);
            e
        })?;
        self.bulk_out(data).map_err(|e| {
            error!("{:?} payload failed: {:?}", tag, e);
            e
        })
    }

    pub fn send_parameters(&self, data: &[u8]) -> Result<(), EdgeTpuError> {
        self.send(DescriptorTag::Parameters, data)
    }

    pub fn send_inputs(&self, data: &[u8]) -> Result<(), EdgeTpuError> {
        self.send(DescriptorTag::InputActivations, data)
    }

    pub fn send_instructions(&self, data: &[u8]) -> Result<(), EdgeTpuError> {
        self.send(DescriptorTag::Instructions, data)
    }

    /// Fills |output| from the bulk-in endpoint. Short reads are continued.
    pub fn get_outputs(&self, output: &mut [u8]) -> Result<(), EdgeTpuError> {
        let mut offset = 0;
        while offset < output.len() {
            let length = self.max_chunk.min(output.len() - offset);
            let data = self.transfer(|done| self.usb.bulk_in(BULK_IN_ENDPOINT, length, done))?;
            if data.is_empty() {
                error!("Empty read at {} of {}", offset, output.len());
                return Err(EdgeTpuError::TransferFailed);
            }
            let received = data.len().min(length);
            output[offset..offset + received].copy_from_slice(&data[..received]);
            offset += received;
        }
        Ok(())
    }

    /// Waits for the completion event of the current inference.
    pub fn read_event(&self) -> Result<Event, EdgeTpuError> {
        let data = self.transfer(|done| self.usb.bulk_in(EVENT_IN_ENDPOINT, EVENT_SIZE, done))?;
        let event = Event::from_bytes(&data).ok_or(EdgeTpuError::TransferFailed)?;
        trace!("event {:x?}", event);
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_hex::assert_eq_hex;
    use fake_edgetpu::{FakeEdgeTpu, StdClock};

    fn driver(fake: &Arc<FakeEdgeTpu>) -> TpuDriver {
        TpuDriver::new(
            fake.clone(),
            Arc::new(StdClock::new()),
            DEFAULT_TRANSFER_TIMEOUT,
            MAX_BULK_CHUNK,
        )
    }

    #[test]
    fn header_layout() {
        let header = bulk_header(DescriptorTag::Parameters, 0x1234);
        assert_eq!(header, [0x34, 0x12, 0, 0, 2, 0, 0, 0]);
    }

    #[test]
    fn event_layout() {
        let mut bytes = [0u8; EVENT_SIZE];
        bytes[..8].copy_from_slice(&0x1000u64.to_le_bytes());
        bytes[8..12].copy_from_slice(&64u32.to_le_bytes());
        bytes[12] = 0xf4;
        let event = Event::from_bytes(&bytes).unwrap();
        assert_eq_hex!(event.address, 0x1000);
        assert_eq!(event.length, 64);
        assert_eq!(event.tag, 4);
        assert!(Event::from_bytes(&bytes[..8]).is_none());
    }

    #[test]
    fn csr_round_trip() {
        let fake = FakeEdgeTpu::new();
        let driver = driver(&fake);
        driver.write_csr64(DESCR_EP, 0xf0).unwrap();
        assert_eq_hex!(driver.read_csr64(DESCR_EP).unwrap(), 0xf0);
        assert_eq_hex!(driver.read_csr32(OMC0_00).unwrap() >> 16, CHIP_ID);
    }

    #[test]
    fn initialize_brings_chip_up() {
        let fake = FakeEdgeTpu::new();
        let driver = driver(&fake);
        driver.initialize(PerformanceMode::Max).unwrap();

        let scu_ctrl_3 = ScuCtrl3::from_bytes(fake.csr32(SCU_CTRL_3).to_ne_bytes());
        assert_eq!(scu_ctrl_3.cur_pwr_state(), PWR_STATE_RUN);
        assert_eq!(scu_ctrl_3.gcb_clock_rate(), 3);
        assert_eq!(scu_ctrl_3.axi_clock_rate(), 1);
        assert_eq_hex!(fake.csr64(TILECONFIG0), 0x7f);
        assert_eq_hex!(fake.csr64(OUTFEED_CHUNK_LENGTH), 0x20);
        assert_eq!(fake.csr64(SCALAR_CORE_RUN_CONTROL), u64::from(RunControl::MoveToRun));
        assert_eq!(fake.csr64(MESH_BUS3_RUN_CONTROL), u64::from(RunControl::MoveToRun));
        assert!(Omc0DC::from_bytes(fake.csr32(OMC0_DC).to_ne_bytes()).enthmc());
    }

    #[test]
    fn initialize_rejects_foreign_chip() {
        let fake = FakeEdgeTpu::new();
        fake.set_csr32(OMC0_00, 0x0123_0000);
        assert_eq!(
            driver(&fake).initialize(PerformanceMode::High),
            Err(EdgeTpuError::ChipIdMismatch)
        );
    }

    #[test]
    fn payloads_are_chunked() {
        let fake = FakeEdgeTpu::new();
        let driver = driver(&fake);
        let params = alloc::vec![0x5a; MAX_BULK_CHUNK * 2 + 10];
        driver.send_parameters(&params).unwrap();

        let stats = fake.stats();
        // One header plus three payload chunks.
        assert_eq!(stats.bulk_out_transfers, 4);
        assert_eq!(stats.parameter_bytes, params.len());
        assert_eq!(stats.parameter_transfers, 1);
    }

    #[test]
    fn outputs_and_event() {
        let fake = FakeEdgeTpu::new();
        let driver = driver(&fake);
        driver.send_inputs(&[1, 2, 3, 4]).unwrap();
        let mut output = [0u8; 4];
        driver.get_outputs(&mut output).unwrap();
        assert_eq!(output, fake.expected_output(&[1, 2, 3, 4], 4).as_slice());
        assert!(driver.read_event().is_ok());
    }

    #[test]
    fn failed_transfer_is_reported() {
        let fake = FakeEdgeTpu::new();
        let driver = driver(&fake);
        fake.fail_next_bulk_out();
        assert_eq!(driver.send_inputs(&[0; 16]), Err(EdgeTpuError::TransferFailed));
        assert!(driver.send_inputs(&[0; 16]).is_ok());
    }

    #[test]
    fn lost_completion_times_out() {
        let fake = FakeEdgeTpu::new();
        let driver = TpuDriver::new(
            fake.clone(),
            Arc::new(StdClock::new()),
            Duration::from_millis(5),
            MAX_BULK_CHUNK,
        );
        fake.drop_next_completion();
        assert_eq!(driver.read_csr32(OMC0_00), Err(EdgeTpuError::Timeout));
    }

    #[test]
    fn temperature_from_sensor() {
        let fake = FakeEdgeTpu::new();
        let driver = driver(&fake);
        fake.set_raw_temperature(500);
        assert!((driver.temperature().unwrap() - 41.05).abs() < 1e-3);
    }
}
