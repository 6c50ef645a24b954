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

// Data structures used throughout the Edge TPU implementation that do not
// depend on the USB transport or the executable format.

use core::fmt;
use core::time::Duration;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;

/// Name under which models compiled for the accelerator embed their op.
pub const CUSTOM_OP_NAME: &str = "edgetpu-custom-op";

/// Number of parameter sets that may be resident on-chip at once.
pub const PARAMETER_CACHE_SLOTS: usize = 2;
const_assert!(PARAMETER_CACHE_SLOTS > 0);

/// USB identity of the accelerator once its firmware is running.
pub const EDGETPU_VID: u16 = 0x18d1;
pub const EDGETPU_PID: u16 = 0x9302;

pub const BULK_OUT_ENDPOINT: u8 = 1;
pub const BULK_IN_ENDPOINT: u8 = 1;
pub const EVENT_IN_ENDPOINT: u8 = 2;
pub const INTERRUPT_IN_ENDPOINT: u8 = 3;

/// Largest payload handed to the transport in one bulk transfer.
pub const MAX_BULK_CHUNK: usize = 32 * 1024;
/// Size of the header preceding every bulk-out payload.
pub const BULK_HEADER_SIZE: usize = 8;
/// Size of the completion record read from the event endpoint.
pub const EVENT_SIZE: usize = 16;
const_assert!(MAX_BULK_CHUNK >= BULK_HEADER_SIZE && MAX_BULK_CHUNK >= EVENT_SIZE);

pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_millis(200);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Identifier returned by the accelerator's omc0_00 register.
pub const CHIP_ID: u32 = 0x89a;

/// Clock-speed setting applied when the accelerator is powered on.
#[repr(u8)]
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    PartialEq,
    Deserialize,
    Serialize,
    IntoPrimitive,
    TryFromPrimitive,
)]
pub enum PerformanceMode {
    Low = 0,
    Medium,
    #[default]
    High,
    Max,
}

/// Clock rates programmed into scu_ctrl_3 for a performance mode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ClockRates {
    pub gcb: u8,
    pub axi: u8,
    pub usb_8051: u8,
}

impl PerformanceMode {
    // Encodings for scu_ctrl_3: gcb {0: 63MHz, 1: 125MHz, 2: 250MHz,
    // 3: 500MHz}, axi {0: 125MHz, 1: 250MHz}, usb_8051 {0: 250MHz, 1: 500MHz}.
    pub fn clock_rates(&self) -> ClockRates {
        match self {
            PerformanceMode::Low => ClockRates { gcb: 0, axi: 0, usb_8051: 0 },
            PerformanceMode::Medium => ClockRates { gcb: 1, axi: 0, usb_8051: 1 },
            PerformanceMode::High => ClockRates { gcb: 2, axi: 0, usb_8051: 1 },
            PerformanceMode::Max => ClockRates { gcb: 3, axi: 1, usb_8051: 1 },
        }
    }
}

/// Role of a compiled executable inside a package.
#[repr(i16)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
pub enum ExecutableType {
    StandAlone = 0,
    ParameterCaching = 1,
    ExecutionOnly = 2,
}
impl ExecutableType {
    pub fn is_inference(&self) -> bool { *self != ExecutableType::ParameterCaching }
}

/// Tag carried in the header of every bulk-out transfer and in events.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
pub enum DescriptorTag {
    Instructions = 0,
    InputActivations = 1,
    Parameters = 2,
    OutputActivations = 3,
    Interrupt0 = 4,
    Interrupt1 = 5,
    Interrupt2 = 6,
    Interrupt3 = 7,
}

/// What a DMA descriptor hint moves.
#[repr(i16)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
pub enum Description {
    OutputActivation = 0,
    InputActivation = 1,
    Parameter = 2,
    Scratch = 3,
}

/// Element type of an input or output layer.
#[repr(i16)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
pub enum DataType {
    FixedPoint8 = 0,
    FixedPoint16 = 1,
    SignedFixedPoint32 = 2,
    Bfloat = 3,
    Half = 4,
    Single = 5,
    SignedFixedPoint8 = 6,
    SignedFixedPoint16 = 7,
}
impl DataType {
    /// Size of one element in bytes.
    pub fn size(&self) -> usize {
        match self {
            DataType::FixedPoint8 | DataType::SignedFixedPoint8 => 1,
            DataType::FixedPoint16
            | DataType::SignedFixedPoint16
            | DataType::Bfloat
            | DataType::Half => 2,
            DataType::SignedFixedPoint32 | DataType::Single => 4,
        }
    }

    // NB: SignedFixedPoint32 is transferred as-is; only the narrow signed
    // types are biased by the hardware.
    pub fn is_signed(&self) -> bool {
        matches!(self, DataType::SignedFixedPoint8 | DataType::SignedFixedPoint16)
    }
}

/// Run state written to the core and tile run-control registers.
#[repr(u64)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
pub enum RunControl {
    MoveToIdle = 0,
    MoveToRun = 1,
    MoveToHalt = 2,
    MoveToSingleStep = 3,
}

/// Handle to a registered package. The generation guards against a slot
/// being reused after the package it named was released.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct PackageId {
    pub index: usize,
    pub generation: u32,
}
impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "pkg{}.{}", self.index, self.generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_mode_is_high() {
        assert_eq!(PerformanceMode::default(), PerformanceMode::High);
        assert_eq!(u8::from(PerformanceMode::Max), 3);
        assert!(PerformanceMode::try_from(4u8).is_err());
    }

    #[test]
    fn clock_rates_scale_with_mode() {
        let max = PerformanceMode::Max.clock_rates();
        assert_eq!(max, ClockRates { gcb: 3, axi: 1, usb_8051: 1 });
        let low = PerformanceMode::Low.clock_rates();
        assert_eq!(low, ClockRates { gcb: 0, axi: 0, usb_8051: 0 });
    }

    #[test]
    fn data_type_sizes() {
        assert_eq!(DataType::FixedPoint8.size(), 1);
        assert_eq!(DataType::SignedFixedPoint16.size(), 2);
        assert_eq!(DataType::Single.size(), 4);
        assert!(DataType::SignedFixedPoint8.is_signed());
        assert!(!DataType::SignedFixedPoint32.is_signed());
        assert!(DataType::try_from(8i16).is_err());
    }

    #[test]
    fn executable_roles() {
        assert!(ExecutableType::StandAlone.is_inference());
        assert!(ExecutableType::ExecutionOnly.is_inference());
        assert!(!ExecutableType::ParameterCaching.is_inference());
    }
}
