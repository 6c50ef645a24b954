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

// fake-edgetpu is an in-memory stand-in for a USB-attached Edge TPU, its
// power rail and the RTOS clock. It models just enough of the chip for the
// driver to bring it up and for inferences to produce deterministic output.

use edgetpu_interface::*;
use edgetpu_shared::*;
use log::trace;
use spin::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// The few CSRs with side effects.
const OMC0_00: u32 = 0x1a000;
const OMC0_DC: u32 = 0x1a0dc;
const SCU_CTRL_3: u32 = 0x1a318;

const CUR_PWR_STATE_SHIFT: u32 = 8;
const FORCE_SLEEP_SHIFT: u32 = 22;
const OMC0_DC_DATA_SHIFT: u32 = 16;

// Reset value of omc0_dc's sensor field, roughly 40C.
const DEFAULT_RAW_TEMPERATURE: u16 = 500;

/// Counters observable by tests.
#[derive(Clone, Debug, Default)]
pub struct FakeStats {
    pub control_transfers: usize,
    pub bulk_out_transfers: usize,
    pub bulk_in_transfers: usize,
    pub instruction_transfers: usize,
    pub input_transfers: usize,
    pub parameter_transfers: usize,
    pub parameter_bytes: usize,
    pub events: usize,
    /// Checksum of every parameter payload, in transfer order.
    pub parameter_log: Vec<u32>,
    /// Every completed bulk-out payload and event read, in order.
    pub transfer_log: Vec<TransferRecord>,
    /// Control or bulk-in transfers that arrived while a bulk-out payload
    /// was still outstanding.
    pub interleaved: usize,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransferRecord {
    /// A descriptor and the checksum of its payload.
    Payload(DescriptorTag, u32),
    Event,
}

/// Sum of the bytes of a parameter payload as recorded in parameter_log.
pub fn checksum(data: &[u8]) -> u32 { data.iter().fold(0u32, |sum, b| sum.wrapping_add(*b as u32)) }

#[derive(Default)]
struct Stream {
    tag: Option<DescriptorTag>,
    remaining: usize,
    payload: Vec<u8>,
}

#[derive(Default)]
struct FakeState {
    csrs: BTreeMap<u32, u64>,
    stream: Stream,
    last_input: Vec<u8>,
    output_offset: usize,
    stats: FakeStats,
    fail_bulk_outs: usize,
    fail_bulk_ins: usize,
    drop_completions: usize,
    disconnected: bool,
}
impl FakeState {
    fn reset_chip(&mut self) {
        self.csrs.clear();
        self.csrs.insert(OMC0_00, (CHIP_ID as u64) << 16);
        self.csrs.insert(
            OMC0_DC,
            (DEFAULT_RAW_TEMPERATURE as u64) << OMC0_DC_DATA_SHIFT,
        );
        self.stream = Stream::default();
        self.last_input.clear();
        self.output_offset = 0;
    }

    fn write_csr(&mut self, reg: u32, value: u64) {
        let value = if reg == SCU_CTRL_3 {
            // The power state follows rg_force_sleep immediately.
            let force_sleep = (value >> FORCE_SLEEP_SHIFT) & 0x3;
            let cur_pwr_state = match force_sleep {
                0x3 => 0x2,
                0x2 => 0x0,
                _ => (value >> CUR_PWR_STATE_SHIFT) & 0x3,
            };
            (value & !(0x3 << CUR_PWR_STATE_SHIFT)) | (cur_pwr_state << CUR_PWR_STATE_SHIFT)
        } else {
            value
        };
        self.csrs.insert(reg, value);
    }

    fn finish_payload(&mut self, tag: DescriptorTag) {
        let payload = core::mem::take(&mut self.stream.payload);
        self.stats
            .transfer_log
            .push(TransferRecord::Payload(tag, checksum(&payload)));
        match tag {
            DescriptorTag::Instructions => self.stats.instruction_transfers += 1,
            DescriptorTag::InputActivations => {
                self.stats.input_transfers += 1;
                self.last_input = payload;
                self.output_offset = 0;
            }
            DescriptorTag::Parameters => {
                self.stats.parameter_transfers += 1;
                self.stats.parameter_bytes += payload.len();
                self.stats.parameter_log.push(checksum(&payload));
            }
            _ => {}
        }
        self.stream.tag = None;
    }

    fn check_stream_closed(&mut self) {
        if self.stream.tag.is_some() {
            self.stats.interleaved += 1;
        }
    }

    // Headers and payloads arrive as separate bulk-out transfers.
    fn bulk_out(&mut self, data: &[u8]) {
        match self.stream.tag {
            None => {
                let mut length = [0u8; 4];
                length.copy_from_slice(&data[..4]);
                let tag = DescriptorTag::try_from(data[4] & 0xf).unwrap_or(DescriptorTag::Interrupt0);
                self.stream.tag = Some(tag);
                self.stream.remaining = u32::from_le_bytes(length) as usize;
                if self.stream.remaining == 0 {
                    self.finish_payload(tag);
                }
            }
            Some(tag) => {
                let length = data.len().min(self.stream.remaining);
                self.stream.payload.extend_from_slice(&data[..length]);
                self.stream.remaining -= length;
                if self.stream.remaining == 0 {
                    self.finish_payload(tag);
                }
            }
        }
    }
}

/// Output byte at |position| for an inference over |input|.
fn output_byte(input: &[u8], position: usize) -> u8 {
    if input.is_empty() {
        position as u8
    } else {
        input[position % input.len()] ^ 0xa5
    }
}

pub struct FakeEdgeTpu {
    state: Mutex<FakeState>,
    async_completions: bool,
}
impl FakeEdgeTpu {
    pub fn new() -> Arc<Self> { Self::build(false) }

    /// Completions are delivered from a separate thread after a short delay.
    pub fn new_async() -> Arc<Self> { Self::build(true) }

    fn build(async_completions: bool) -> Arc<Self> {
        let mut state = FakeState::default();
        state.reset_chip();
        Arc::new(FakeEdgeTpu {
            state: Mutex::new(state),
            async_completions,
        })
    }

    /// Returns the chip to its power-on register state.
    pub fn reset(&self) { self.state.lock().reset_chip(); }

    pub fn csr32(&self, reg: u32) -> u32 { self.csr64(reg) as u32 }
    pub fn csr64(&self, reg: u32) -> u64 { *self.state.lock().csrs.get(&reg).unwrap_or(&0) }
    pub fn set_csr32(&self, reg: u32, value: u32) { self.state.lock().csrs.insert(reg, value as u64); }

    pub fn set_raw_temperature(&self, raw: u16) {
        let mut state = self.state.lock();
        let value = state.csrs.get(&OMC0_DC).copied().unwrap_or(0);
        let value = (value & !(0x3ff << OMC0_DC_DATA_SHIFT)) | ((raw as u64) << OMC0_DC_DATA_SHIFT);
        state.csrs.insert(OMC0_DC, value);
    }

    pub fn stats(&self) -> FakeStats { self.state.lock().stats.clone() }

    /// What the fake returns for |length| output bytes after |input|.
    pub fn expected_output(&self, input: &[u8], length: usize) -> Vec<u8> {
        (0..length).map(|i| output_byte(input, i)).collect()
    }

    pub fn fail_next_bulk_out(&self) { self.state.lock().fail_bulk_outs += 1; }
    pub fn fail_next_bulk_in(&self) { self.state.lock().fail_bulk_ins += 1; }
    pub fn drop_next_completion(&self) { self.state.lock().drop_completions += 1; }
    pub fn set_disconnected(&self, disconnected: bool) { self.state.lock().disconnected = disconnected; }

    fn complete(&self, done: TransferCallback, result: TransferResult) {
        {
            let mut state = self.state.lock();
            if state.drop_completions > 0 {
                state.drop_completions -= 1;
                return;
            }
        }
        if self.async_completions {
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_micros(200));
                done(result);
            });
        } else {
            done(result);
        }
    }

    fn check_connected(&self) -> Result<(), EdgeTpuError> {
        if self.state.lock().disconnected {
            Err(EdgeTpuError::NotConnected)
        } else {
            Ok(())
        }
    }
}

impl UsbHostEdgeTpu for FakeEdgeTpu {
    fn control(
        &self,
        setup: SetupPacket,
        data: Vec<u8>,
        done: TransferCallback,
    ) -> Result<(), EdgeTpuError> {
        self.check_connected()?;
        let reg = setup.value as u32 | ((setup.index as u32) << 16);
        let length = setup.length as usize;
        let result = {
            let mut state = self.state.lock();
            state.stats.control_transfers += 1;
            state.check_stream_closed();
            if setup.is_read() {
                let value = *state.csrs.get(&reg).unwrap_or(&0);
                TransferResult::completed(value.to_le_bytes()[..length.min(8)].to_vec())
            } else {
                let mut bytes = [0u8; 8];
                let n = data.len().min(8);
                bytes[..n].copy_from_slice(&data[..n]);
                let value = u64::from_le_bytes(bytes);
                let value = if length == 4 {
                    // 32-bit writes leave the upper half alone.
                    let old = *state.csrs.get(&reg).unwrap_or(&0);
                    (old & !0xffff_ffff) | (value & 0xffff_ffff)
                } else {
                    value
                };
                state.write_csr(reg, value);
                TransferResult::completed(Vec::new())
            }
        };
        trace!("fake control {:#x} {:?}", reg, setup.request_type);
        self.complete(done, result);
        Ok(())
    }

    fn bulk_out(
        &self,
        endpoint: u8,
        data: Vec<u8>,
        done: TransferCallback,
    ) -> Result<(), EdgeTpuError> {
        self.check_connected()?;
        assert_eq!(endpoint, BULK_OUT_ENDPOINT);
        let result = {
            let mut state = self.state.lock();
            state.stats.bulk_out_transfers += 1;
            if state.fail_bulk_outs > 0 {
                state.fail_bulk_outs -= 1;
                // The device drops whatever was in flight.
                state.stream = Stream::default();
                TransferResult::failed(TransferStatus::Stalled)
            } else {
                state.bulk_out(&data);
                TransferResult::completed(Vec::new())
            }
        };
        self.complete(done, result);
        Ok(())
    }

    fn bulk_in(
        &self,
        endpoint: u8,
        length: usize,
        done: TransferCallback,
    ) -> Result<(), EdgeTpuError> {
        self.check_connected()?;
        let result = {
            let mut state = self.state.lock();
            state.stats.bulk_in_transfers += 1;
            state.check_stream_closed();
            if state.fail_bulk_ins > 0 {
                state.fail_bulk_ins -= 1;
                TransferResult::failed(TransferStatus::Failed)
            } else if endpoint == EVENT_IN_ENDPOINT {
                state.stats.events += 1;
                state.stats.transfer_log.push(TransferRecord::Event);
                let mut event = vec![0u8; EVENT_SIZE];
                event[12] = DescriptorTag::Interrupt0.into();
                TransferResult::completed(event)
            } else {
                let start = state.output_offset;
                let data: Vec<u8> = (start..start + length)
                    .map(|p| output_byte(&state.last_input, p))
                    .collect();
                state.output_offset += length;
                TransferResult::completed(data)
            }
        };
        self.complete(done, result);
        Ok(())
    }
}

/// Power rail that counts transitions and resets the attached chip on
/// power-up.
pub struct FakePower {
    device: Option<Arc<FakeEdgeTpu>>,
    power_ons: AtomicUsize,
    power_offs: AtomicUsize,
    fail_power_on: Mutex<bool>,
}
impl FakePower {
    pub fn new(device: Option<Arc<FakeEdgeTpu>>) -> Arc<Self> {
        Arc::new(FakePower {
            device,
            power_ons: AtomicUsize::new(0),
            power_offs: AtomicUsize::new(0),
            fail_power_on: Mutex::new(false),
        })
    }
    pub fn power_ons(&self) -> usize { self.power_ons.load(Ordering::SeqCst) }
    pub fn power_offs(&self) -> usize { self.power_offs.load(Ordering::SeqCst) }
    pub fn set_fail_power_on(&self, fail: bool) { *self.fail_power_on.lock() = fail; }
}
impl PowerControl for FakePower {
    fn set_power(&self, enable: bool) -> Result<(), EdgeTpuError> {
        if enable {
            if *self.fail_power_on.lock() {
                return Err(EdgeTpuError::PowerFailed);
            }
            if let Some(device) = &self.device {
                device.reset();
            }
            self.power_ons.fetch_add(1, Ordering::SeqCst);
        } else {
            self.power_offs.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// SystemClock backed by std::time.
pub struct StdClock {
    epoch: Instant,
}
impl StdClock {
    pub fn new() -> Self { StdClock { epoch: Instant::now() } }
}
impl Default for StdClock {
    fn default() -> Self { Self::new() }
}
impl SystemClock for StdClock {
    fn now(&self) -> Duration { self.epoch.elapsed() }
    fn relax(&self) { std::thread::yield_now() }
}

/// A TfLiteNode over owned tensors.
#[derive(Clone, Debug, Default)]
pub struct FakeNode {
    pub inputs: Vec<Vec<u8>>,
    pub outputs: Vec<Vec<u8>>,
}
impl FakeNode {
    pub fn new(input: &[u8], output_sizes: &[usize]) -> Self {
        FakeNode {
            inputs: vec![input.to_vec()],
            outputs: output_sizes.iter().map(|size| vec![0u8; *size]).collect(),
        }
    }
}
impl TfLiteNode for FakeNode {
    fn inputs(&self) -> usize { self.inputs.len() }
    fn input(&self, index: usize) -> Option<&[u8]> { self.inputs.get(index).map(|t| t.as_slice()) }
    fn outputs(&self) -> usize { self.outputs.len() }
    fn output_mut(&mut self, index: usize) -> Option<&mut [u8]> {
        self.outputs.get_mut(index).map(|t| t.as_mut_slice())
    }
}
