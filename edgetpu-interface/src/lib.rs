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

// Contracts between the Edge TPU core and its collaborators: the USB host
// stack, the power rail, the RTOS clock and the TFLite-Micro interpreter.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::time::Duration;
use edgetpu_shared::PackageId;
use num_enum::{FromPrimitive, IntoPrimitive};

/// Return codes from the Edge TPU api's.
#[repr(usize)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, FromPrimitive, IntoPrimitive)]
pub enum EdgeTpuError {
    Success = 0,
    DeviceUnavailable,
    NotConnected,
    PowerFailed,
    ChipIdMismatch,
    RegisterTestFailed,
    InitTimeout,
    InvalidPackage,
    NoInferenceExecutable,
    NoSuchPackage,
    NoContext,
    InvalidTensor,
    TransferFailed,
    Timeout,
    SerializeFailed,
    DeserializeFailed,
    #[default]
    UnknownError,
}
impl From<EdgeTpuError> for Result<(), EdgeTpuError> {
    fn from(err: EdgeTpuError) -> Result<(), EdgeTpuError> {
        if err == EdgeTpuError::Success {
            Ok(())
        } else {
            Err(err)
        }
    }
}

/// Status returned to the interpreter from op callbacks.
#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TfLiteStatus {
    Ok = 0,
    Error = 1,
}
impl From<Result<(), EdgeTpuError>> for TfLiteStatus {
    fn from(result: Result<(), EdgeTpuError>) -> TfLiteStatus {
        match result {
            Ok(()) => TfLiteStatus::Ok,
            Err(_) => TfLiteStatus::Error,
        }
    }
}

bitflags::bitflags! {
    /// bmRequestType of a USB setup packet. Recipient "device" and type
    /// "standard" are the zero encodings.
    pub struct RequestType: u8 {
        const DEVICE_TO_HOST = 0b1000_0000;
        const CLASS          = 0b0010_0000;
        const VENDOR         = 0b0100_0000;
        const INTERFACE      = 0b0000_0001;
        const ENDPOINT       = 0b0000_0010;
    }
}

/// A USB control request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SetupPacket {
    pub request_type: RequestType,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}
impl SetupPacket {
    pub fn is_read(&self) -> bool { self.request_type.contains(RequestType::DEVICE_TO_HOST) }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransferStatus {
    Completed,
    Stalled,
    Failed,
    Disconnected,
}

/// Outcome of one transfer as reported by the USB host stack. For reads
/// |data| holds the bytes received.
#[derive(Debug)]
pub struct TransferResult {
    pub status: TransferStatus,
    pub data: Vec<u8>,
}
impl TransferResult {
    pub fn completed(data: Vec<u8>) -> Self {
        Self {
            status: TransferStatus::Completed,
            data,
        }
    }
    pub fn failed(status: TransferStatus) -> Self {
        Self {
            status,
            data: Vec::new(),
        }
    }
    pub fn is_ok(&self) -> bool { self.status == TransferStatus::Completed }
}

/// Invoked exactly once when a submitted transfer finishes, possibly from
/// another task or an interrupt context.
pub type TransferCallback = Box<dyn FnOnce(TransferResult) + Send>;

/// The USB host instance bound to an enumerated accelerator. Submission
/// errors are returned synchronously; completion arrives via |done|.
pub trait UsbHostEdgeTpu: Send + Sync {
    fn control(
        &self,
        setup: SetupPacket,
        data: Vec<u8>,
        done: TransferCallback,
    ) -> Result<(), EdgeTpuError>;
    fn bulk_out(&self, endpoint: u8, data: Vec<u8>, done: TransferCallback)
        -> Result<(), EdgeTpuError>;
    fn bulk_in(&self, endpoint: u8, length: usize, done: TransferCallback)
        -> Result<(), EdgeTpuError>;
}

/// The accelerator's power rail (PMIC enable plus power-good).
pub trait PowerControl: Send + Sync {
    fn set_power(&self, enable: bool) -> Result<(), EdgeTpuError>;
}

/// Monotonic time source of the RTOS.
pub trait SystemClock: Send + Sync {
    fn now(&self) -> Duration;
    // Called while busy-waiting; an RTOS port yields or delays here.
    fn relax(&self) { core::hint::spin_loop() }
}

/// The view of a TfLiteNode available to a custom op: flat byte buffers
/// for each input and output tensor.
pub trait TfLiteNode {
    fn inputs(&self) -> usize;
    fn input(&self, index: usize) -> Option<&[u8]>;
    fn outputs(&self) -> usize;
    fn output_mut(&mut self, index: usize) -> Option<&mut [u8]>;
}

/// Callbacks of a TFLite-Micro custom op registration. |user_data| is the
/// value returned from init and is handed back on every later call.
pub trait CustomOp: Send + Sync {
    fn init(&self, buffer: &[u8]) -> Option<PackageId>;
    fn free(&self, user_data: Option<PackageId>);
    fn prepare(&self, user_data: Option<PackageId>, node: &dyn TfLiteNode) -> TfLiteStatus;
    fn invoke(&self, user_data: Option<PackageId>, node: &mut dyn TfLiteNode) -> TfLiteStatus;
}
