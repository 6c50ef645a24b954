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

// CSR offsets and layouts for the Beagle (USB) Edge TPU.

use modular_bitfield::prelude::*;

// Apex (misc chip) registers.
pub const OMC0_00: u32 = 0x1a000;
pub const OMC0_D0: u32 = 0x1a0d0;
pub const OMC0_D8: u32 = 0x1a0d8;
pub const OMC0_DC: u32 = 0x1a0dc;

// System control unit.
pub const SCU_CTRL_0: u32 = 0x1a30c;
pub const SCU_CTRL_2: u32 = 0x1a314;
pub const SCU_CTRL_3: u32 = 0x1a318;

// Clock bridge.
pub const GCBB_CREDIT0: u32 = 0x1907c;

pub const IDLE_REGISTER: u32 = 0x4a000;
pub const TILECONFIG0: u32 = 0x48788;

// USB block.
pub const OUTFEED_CHUNK_LENGTH: u32 = 0x4c058;
pub const DESCR_EP: u32 = 0x4c148;
pub const MULTI_BO_EP: u32 = 0x4c160;

// Scalar core run controls.
pub const SCALAR_CORE_RUN_CONTROL: u32 = 0x44018;
pub const AV_DATA_POP_RUN_CONTROL: u32 = 0x44158;
pub const PARAMETER_POP_RUN_CONTROL: u32 = 0x44198;
pub const INFEED_RUN_CONTROL: u32 = 0x441d8;
pub const OUTFEED_RUN_CONTROL: u32 = 0x44218;

pub const SCALAR_CORE_RUN_CONTROLS: [u32; 5] = [
    SCALAR_CORE_RUN_CONTROL,
    AV_DATA_POP_RUN_CONTROL,
    PARAMETER_POP_RUN_CONTROL,
    INFEED_RUN_CONTROL,
    OUTFEED_RUN_CONTROL,
];

// Tile registers; writes are broadcast according to tileconfig0.
pub const DEEP_SLEEP: u32 = 0x42020;
pub const OP_RUN_CONTROL: u32 = 0x420c0;
pub const WIDE_TO_NARROW_RUN_CONTROL: u32 = 0x42110;
pub const NARROW_TO_WIDE_RUN_CONTROL: u32 = 0x42150;
pub const RING_BUS_CONSUMER0_RUN_CONTROL: u32 = 0x42190;
pub const RING_BUS_CONSUMER1_RUN_CONTROL: u32 = 0x421d0;
pub const RING_BUS_PRODUCER_RUN_CONTROL: u32 = 0x42210;
pub const MESH_BUS0_RUN_CONTROL: u32 = 0x42250;
pub const MESH_BUS1_RUN_CONTROL: u32 = 0x42298;
pub const MESH_BUS2_RUN_CONTROL: u32 = 0x422e0;
pub const MESH_BUS3_RUN_CONTROL: u32 = 0x42328;

pub const TILE_RUN_CONTROLS: [u32; 10] = [
    OP_RUN_CONTROL,
    NARROW_TO_WIDE_RUN_CONTROL,
    WIDE_TO_NARROW_RUN_CONTROL,
    RING_BUS_CONSUMER0_RUN_CONTROL,
    RING_BUS_CONSUMER1_RUN_CONTROL,
    RING_BUS_PRODUCER_RUN_CONTROL,
    MESH_BUS0_RUN_CONTROL,
    MESH_BUS1_RUN_CONTROL,
    MESH_BUS2_RUN_CONTROL,
    MESH_BUS3_RUN_CONTROL,
];

#[bitfield]
pub struct Omc000 {
    pub test_reg0: B8,
    #[skip]
    _unused0: B8,
    pub chip_id: B12,
    #[skip]
    _unused1: B4,
}

#[bitfield]
pub struct Omc0D0 {
    pub tref: B4,
    pub tslope: B4,
    pub t_setting: B4,
    pub adr: B4,
    pub clk_en: bool,
    #[skip]
    _unused: B15,
}

#[bitfield]
pub struct Omc0D8 {
    pub enbg: bool,
    pub envr: bool,
    pub enad: bool,
    #[skip]
    _unused: B29,
}

#[bitfield]
pub struct Omc0DC {
    pub enthmc: bool,
    #[skip]
    _unused0: B15,
    pub data: B10, // NB: raw thermal sensor reading
    #[skip]
    _unused1: B6,
}

#[bitfield]
pub struct ScuCtrl0 {
    #[skip]
    _unused0: B4,
    pub rg_pcie_inact_phy_mode: B3,
    pub rg_usb_inact_phy_mode: B3,
    #[skip]
    _unused1: B22,
}

#[bitfield]
pub struct ScuCtrl2 {
    #[skip]
    _unused0: B18,
    pub rg_gated_gcb: B2,
    #[skip]
    _unused1: B12,
}

#[bitfield]
pub struct ScuCtrl3 {
    #[skip]
    _unused0: B8,
    pub cur_pwr_state: B2,
    #[skip]
    _unused1: B12,
    pub rg_force_sleep: B2,
    #[skip]
    _unused2: B2,
    pub gcb_clock_rate: B2,
    pub axi_clock_rate: B1,
    pub usb_8051_clock_rate: B1,
    #[skip]
    _unused3: B2,
}

#[bitfield]
pub struct IdleRegister {
    pub counter: B31,
    pub disable_idle: bool,
    #[skip]
    _unused: B32,
}
impl IdleRegister {
    pub const RESET_VALUE: u64 = 0x9000;
}

#[bitfield]
pub struct TileConfig {
    pub tile: B7,
    #[skip]
    _unused: B57,
}
impl TileConfig {
    // All tiles; 7 tile bits on Beagle.
    pub fn broadcast() -> Self { TileConfig::new().with_tile(0x7f) }
}

#[bitfield]
pub struct DeepSleep {
    pub to_sleep_delay: B8,
    pub to_wake_delay: B8,
    pub narrow_mem_deep_sleep: bool,
    pub wide_mem_deep_sleep: bool,
    #[skip]
    _unused: B46,
}

// Power states reported in scu_ctrl_3.cur_pwr_state.
pub const PWR_STATE_RUN: u8 = 0x0;
pub const PWR_STATE_SLEEP: u8 = 0x2;
// Values for scu_ctrl_3.rg_force_sleep.
pub const FORCE_SLEEP_EXIT: u8 = 0x2;
pub const FORCE_SLEEP_ENTER: u8 = 0x3;

/// Converts a raw omc0_dc reading to degrees Celsius.
pub fn temperature_from_raw(data: u16) -> f32 {
    let millis = (662 - data as i32) * 250 + 550;
    millis as f32 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_hex::assert_eq_hex;

    #[test]
    fn omc0_00_layout() {
        let reg = Omc000::from_bytes((0x089a_0000u32 | 0x55).to_ne_bytes());
        assert_eq_hex!(reg.chip_id(), 0x89a);
        assert_eq_hex!(reg.test_reg0(), 0x55);

        let reg = reg.with_test_reg0(0xaa);
        assert_eq_hex!(u32::from_ne_bytes(reg.into_bytes()), 0x089a_00aa);
    }

    #[test]
    fn scu_ctrl_3_layout() {
        let clocks = edgetpu_shared::PerformanceMode::Max.clock_rates();
        let reg = ScuCtrl3::new()
            .with_rg_force_sleep(FORCE_SLEEP_EXIT)
            .with_gcb_clock_rate(clocks.gcb)
            .with_axi_clock_rate(clocks.axi)
            .with_usb_8051_clock_rate(clocks.usb_8051);
        assert_eq_hex!(u32::from_ne_bytes(reg.into_bytes()), 0x3c80_0000);

        let reg = ScuCtrl3::from_bytes(0x0000_0200u32.to_ne_bytes());
        assert_eq_hex!(reg.cur_pwr_state(), PWR_STATE_SLEEP);
    }

    #[test]
    fn omc0_dc_layout() {
        let reg = Omc0DC::new().with_enthmc(true).with_data(0x1f4);
        assert_eq_hex!(u32::from_ne_bytes(reg.into_bytes()), 0x01f4_0001);
    }

    #[test]
    fn tile_config_broadcast() {
        assert_eq_hex!(u64::from_ne_bytes(TileConfig::broadcast().into_bytes()), 0x7f);
    }

    #[test]
    fn idle_register_enable() {
        let reg = IdleRegister::from_bytes(IdleRegister::RESET_VALUE.to_ne_bytes())
            .with_disable_idle(false)
            .with_counter(1);
        assert_eq_hex!(u64::from_ne_bytes(reg.into_bytes()), 0x1);
    }

    #[test]
    fn temperature_conversion() {
        // (662 - 500) * 250 + 550 = 41050 mC
        assert!((temperature_from_raw(500) - 41.05).abs() < 1e-3);
        assert!((temperature_from_raw(662) - 0.55).abs() < 1e-3);
    }
}
