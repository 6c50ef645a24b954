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

//! Flatbuffer tables of the darwinn executable format, written in the shape
//! flatc generates. Field slots follow the compiler's schema; fields the
//! runtime never reads are left out but keep their slot numbers. Accessors
//! assume the buffer was checked with flatbuffers::root (which runs the
//! verifiers below) before use.
//!
//! table Package {
//!   min_runtime_version: int;               // 0
//!   serialized_multi_executable: [ubyte];   // 1
//! }
//! table MultiExecutable { serialized_executables: [string]; }
//! table Executable {
//!   version: int;                           // 0
//!   name: string;                           // 1
//!   serialized_model: [ubyte];              // 2
//!   batch_size: int;                        // 3
//!   scratch_size_bytes: int;                // 4
//!   instruction_bitstreams: [InstructionBitstream];
//!   parameters: [ubyte];                    // 6
//!   dma_hints: DmaHints;                    // 7
//!   input_layers: [Layer];                  // 8
//!   output_layers: [Layer];                 // 9
//!   chip: string;                           // 10
//!   estimated_cycles: int;                  // 11
//!   parameter_caching_token: ulong;         // 12
//!   type: ExecutableType (short);           // 13
//! }
//! table InstructionBitstream { bitstream: [ubyte]; field_offsets: [FieldOffset]; }
//! table DmaHints { hints: [DmaHint]; fully_deterministic: bool; }
//! union AnyHint { DmaDescriptorHint, InstructionHint, InterruptHint, FenceHint }
//! table DmaHint { any_hint: AnyHint; direction: short; }
//! table DmaDescriptorHint { meta: Meta; offset_in_bytes: int; size_in_bytes: int; }
//! table Meta { desc: short; batch: int; name: string; position: short; }
//! table InstructionHint { instruction_chunk_index: int; }
//! union AnyLayer { OutputLayer, InputLayer }
//! table Layer {
//!   name: string; size_bytes: int; y_dim: int; x_dim: int; z_dim: int;
//!   numerics: NumericsConstants; data_type: short; any_layer: AnyLayer;
//!   execution_count_per_inference: int = 1; cache_on_dram: bool;
//! }
//! table OutputLayer { layout: OutputLayout; }
//! table OutputLayout {
//!   y_coordinate_to_linear_tile_id_map: [int];
//!   x_coordinate_to_linear_tile_id_map: [int];
//!   linearized_tile_byte_offset: [int];
//!   x_coordinate_to_local_byte_offset: [int];
//!   y_coordinate_to_local_y_offset: [int];
//!   x_coordinate_to_local_y_row_size: [int];
//! }

use flatbuffers::{
    FlatBufferBuilder, Follow, ForwardsUOffset, InvalidFlatbuffer, Table, VOffsetT, Vector,
    Verifiable, Verifier, WIPOffset,
};

type Bytes<'a> = ForwardsUOffset<Vector<'a, u8>>;
type Ints<'a> = ForwardsUOffset<Vector<'a, i32>>;
type Tables<'a, T> = ForwardsUOffset<Vector<'a, ForwardsUOffset<T>>>;
// NB: executables are stored as strings but hold binary flatbuffers; they
// share the [ubyte] wire form, which skips the UTF-8 check.
type ByteStrings<'a> = ForwardsUOffset<Vector<'a, ForwardsUOffset<Vector<'a, u8>>>>;

// Field n of a table lives at vtable offset 4 + 2n.
const fn field(n: VOffsetT) -> VOffsetT { 4 + 2 * n }

// AnyHint union tags.
pub const ANY_HINT_NONE: u8 = 0;
pub const ANY_HINT_DMA_DESCRIPTOR_HINT: u8 = 1;
pub const ANY_HINT_INSTRUCTION_HINT: u8 = 2;
pub const ANY_HINT_INTERRUPT_HINT: u8 = 3;
pub const ANY_HINT_FENCE_HINT: u8 = 4;

// AnyLayer union tags.
pub const ANY_LAYER_NONE: u8 = 0;
pub const ANY_LAYER_OUTPUT_LAYER: u8 = 1;
pub const ANY_LAYER_INPUT_LAYER: u8 = 2;

macro_rules! table {
    ($name:ident) => {
        #[derive(Copy, Clone, PartialEq)]
        pub struct $name<'a> {
            pub _tab: Table<'a>,
        }
        impl<'a> Follow<'a> for $name<'a> {
            type Inner = $name<'a>;
            #[inline]
            unsafe fn follow(buf: &'a [u8], loc: usize) -> Self::Inner {
                Self {
                    _tab: Table::new(buf, loc),
                }
            }
        }
        impl<'a> $name<'a> {
            #[inline]
            pub fn init_from_table(table: Table<'a>) -> Self { $name { _tab: table } }
        }
    };
}

table!(Package);
impl<'a> Package<'a> {
    pub const VT_MIN_RUNTIME_VERSION: VOffsetT = field(0);
    pub const VT_SERIALIZED_MULTI_EXECUTABLE: VOffsetT = field(1);

    pub fn min_runtime_version(&self) -> i32 {
        unsafe {
            self._tab
                .get::<i32>(Self::VT_MIN_RUNTIME_VERSION, Some(0))
                .unwrap_or(0)
        }
    }
    pub fn serialized_multi_executable(&self) -> Option<Vector<'a, u8>> {
        unsafe { self._tab.get::<Bytes>(Self::VT_SERIALIZED_MULTI_EXECUTABLE, None) }
    }
}
impl Verifiable for Package<'_> {
    fn run_verifier(v: &mut Verifier, pos: usize) -> Result<(), InvalidFlatbuffer> {
        v.visit_table(pos)?
            .visit_field::<i32>("min_runtime_version", Self::VT_MIN_RUNTIME_VERSION, false)?
            .visit_field::<Bytes>(
                "serialized_multi_executable",
                Self::VT_SERIALIZED_MULTI_EXECUTABLE,
                false,
            )?
            .finish();
        Ok(())
    }
}

table!(MultiExecutable);
impl<'a> MultiExecutable<'a> {
    pub const VT_SERIALIZED_EXECUTABLES: VOffsetT = field(0);

    pub fn serialized_executables(
        &self,
    ) -> Option<Vector<'a, ForwardsUOffset<Vector<'a, u8>>>> {
        unsafe { self._tab.get::<ByteStrings>(Self::VT_SERIALIZED_EXECUTABLES, None) }
    }
}
impl Verifiable for MultiExecutable<'_> {
    fn run_verifier(v: &mut Verifier, pos: usize) -> Result<(), InvalidFlatbuffer> {
        v.visit_table(pos)?
            .visit_field::<ByteStrings>(
                "serialized_executables",
                Self::VT_SERIALIZED_EXECUTABLES,
                false,
            )?
            .finish();
        Ok(())
    }
}

table!(Executable);
impl<'a> Executable<'a> {
    pub const VT_VERSION: VOffsetT = field(0);
    pub const VT_NAME: VOffsetT = field(1);
    pub const VT_SERIALIZED_MODEL: VOffsetT = field(2);
    pub const VT_BATCH_SIZE: VOffsetT = field(3);
    pub const VT_SCRATCH_SIZE_BYTES: VOffsetT = field(4);
    pub const VT_INSTRUCTION_BITSTREAMS: VOffsetT = field(5);
    pub const VT_PARAMETERS: VOffsetT = field(6);
    pub const VT_DMA_HINTS: VOffsetT = field(7);
    pub const VT_INPUT_LAYERS: VOffsetT = field(8);
    pub const VT_OUTPUT_LAYERS: VOffsetT = field(9);
    pub const VT_CHIP: VOffsetT = field(10);
    pub const VT_ESTIMATED_CYCLES: VOffsetT = field(11);
    pub const VT_PARAMETER_CACHING_TOKEN: VOffsetT = field(12);
    pub const VT_TYPE_: VOffsetT = field(13);

    pub fn version(&self) -> i32 {
        unsafe { self._tab.get::<i32>(Self::VT_VERSION, Some(0)).unwrap_or(0) }
    }
    pub fn name(&self) -> Option<&'a str> {
        unsafe { self._tab.get::<ForwardsUOffset<&str>>(Self::VT_NAME, None) }
    }
    pub fn batch_size(&self) -> i32 {
        unsafe { self._tab.get::<i32>(Self::VT_BATCH_SIZE, Some(0)).unwrap_or(0) }
    }
    pub fn scratch_size_bytes(&self) -> i32 {
        unsafe {
            self._tab
                .get::<i32>(Self::VT_SCRATCH_SIZE_BYTES, Some(0))
                .unwrap_or(0)
        }
    }
    pub fn instruction_bitstreams(
        &self,
    ) -> Option<Vector<'a, ForwardsUOffset<InstructionBitstream<'a>>>> {
        unsafe {
            self._tab
                .get::<Tables<InstructionBitstream>>(Self::VT_INSTRUCTION_BITSTREAMS, None)
        }
    }
    pub fn parameters(&self) -> Option<Vector<'a, u8>> {
        unsafe { self._tab.get::<Bytes>(Self::VT_PARAMETERS, None) }
    }
    pub fn dma_hints(&self) -> Option<DmaHints<'a>> {
        unsafe { self._tab.get::<ForwardsUOffset<DmaHints>>(Self::VT_DMA_HINTS, None) }
    }
    pub fn input_layers(&self) -> Option<Vector<'a, ForwardsUOffset<Layer<'a>>>> {
        unsafe { self._tab.get::<Tables<Layer>>(Self::VT_INPUT_LAYERS, None) }
    }
    pub fn output_layers(&self) -> Option<Vector<'a, ForwardsUOffset<Layer<'a>>>> {
        unsafe { self._tab.get::<Tables<Layer>>(Self::VT_OUTPUT_LAYERS, None) }
    }
    pub fn chip(&self) -> Option<&'a str> {
        unsafe { self._tab.get::<ForwardsUOffset<&str>>(Self::VT_CHIP, None) }
    }
    pub fn estimated_cycles(&self) -> i32 {
        unsafe {
            self._tab
                .get::<i32>(Self::VT_ESTIMATED_CYCLES, Some(0))
                .unwrap_or(0)
        }
    }
    pub fn parameter_caching_token(&self) -> u64 {
        unsafe {
            self._tab
                .get::<u64>(Self::VT_PARAMETER_CACHING_TOKEN, Some(0))
                .unwrap_or(0)
        }
    }
    pub fn type_(&self) -> i16 {
        unsafe { self._tab.get::<i16>(Self::VT_TYPE_, Some(0)).unwrap_or(0) }
    }
}
impl Verifiable for Executable<'_> {
    fn run_verifier(v: &mut Verifier, pos: usize) -> Result<(), InvalidFlatbuffer> {
        v.visit_table(pos)?
            .visit_field::<i32>("version", Self::VT_VERSION, false)?
            .visit_field::<ForwardsUOffset<&str>>("name", Self::VT_NAME, false)?
            .visit_field::<Bytes>("serialized_model", Self::VT_SERIALIZED_MODEL, false)?
            .visit_field::<i32>("batch_size", Self::VT_BATCH_SIZE, false)?
            .visit_field::<i32>("scratch_size_bytes", Self::VT_SCRATCH_SIZE_BYTES, false)?
            .visit_field::<Tables<InstructionBitstream>>(
                "instruction_bitstreams",
                Self::VT_INSTRUCTION_BITSTREAMS,
                false,
            )?
            .visit_field::<Bytes>("parameters", Self::VT_PARAMETERS, false)?
            .visit_field::<ForwardsUOffset<DmaHints>>("dma_hints", Self::VT_DMA_HINTS, false)?
            .visit_field::<Tables<Layer>>("input_layers", Self::VT_INPUT_LAYERS, false)?
            .visit_field::<Tables<Layer>>("output_layers", Self::VT_OUTPUT_LAYERS, false)?
            .visit_field::<ForwardsUOffset<&str>>("chip", Self::VT_CHIP, false)?
            .visit_field::<i32>("estimated_cycles", Self::VT_ESTIMATED_CYCLES, false)?
            .visit_field::<u64>(
                "parameter_caching_token",
                Self::VT_PARAMETER_CACHING_TOKEN,
                false,
            )?
            .visit_field::<i16>("type_", Self::VT_TYPE_, false)?
            .finish();
        Ok(())
    }
}

table!(InstructionBitstream);
impl<'a> InstructionBitstream<'a> {
    pub const VT_BITSTREAM: VOffsetT = field(0);

    pub fn bitstream(&self) -> Option<Vector<'a, u8>> {
        unsafe { self._tab.get::<Bytes>(Self::VT_BITSTREAM, None) }
    }
}
impl Verifiable for InstructionBitstream<'_> {
    fn run_verifier(v: &mut Verifier, pos: usize) -> Result<(), InvalidFlatbuffer> {
        v.visit_table(pos)?
            .visit_field::<Bytes>("bitstream", Self::VT_BITSTREAM, false)?
            .finish();
        Ok(())
    }
}

table!(DmaHints);
impl<'a> DmaHints<'a> {
    pub const VT_HINTS: VOffsetT = field(0);
    pub const VT_FULLY_DETERMINISTIC: VOffsetT = field(1);

    pub fn hints(&self) -> Option<Vector<'a, ForwardsUOffset<DmaHint<'a>>>> {
        unsafe { self._tab.get::<Tables<DmaHint>>(Self::VT_HINTS, None) }
    }
    pub fn fully_deterministic(&self) -> bool {
        unsafe {
            self._tab
                .get::<bool>(Self::VT_FULLY_DETERMINISTIC, Some(false))
                .unwrap_or(false)
        }
    }
}
impl Verifiable for DmaHints<'_> {
    fn run_verifier(v: &mut Verifier, pos: usize) -> Result<(), InvalidFlatbuffer> {
        v.visit_table(pos)?
            .visit_field::<Tables<DmaHint>>("hints", Self::VT_HINTS, false)?
            .visit_field::<bool>("fully_deterministic", Self::VT_FULLY_DETERMINISTIC, false)?
            .finish();
        Ok(())
    }
}

table!(DmaHint);
impl<'a> DmaHint<'a> {
    pub const VT_ANY_HINT_TYPE: VOffsetT = field(0);
    pub const VT_ANY_HINT: VOffsetT = field(1);
    pub const VT_DIRECTION: VOffsetT = field(2);

    pub fn any_hint_type(&self) -> u8 {
        unsafe {
            self._tab
                .get::<u8>(Self::VT_ANY_HINT_TYPE, Some(ANY_HINT_NONE))
                .unwrap_or(ANY_HINT_NONE)
        }
    }
    pub fn any_hint(&self) -> Option<Table<'a>> {
        unsafe { self._tab.get::<ForwardsUOffset<Table<'a>>>(Self::VT_ANY_HINT, None) }
    }
    pub fn any_hint_as_dma_descriptor_hint(&self) -> Option<DmaDescriptorHint<'a>> {
        if self.any_hint_type() == ANY_HINT_DMA_DESCRIPTOR_HINT {
            self.any_hint().map(DmaDescriptorHint::init_from_table)
        } else {
            None
        }
    }
    pub fn any_hint_as_instruction_hint(&self) -> Option<InstructionHint<'a>> {
        if self.any_hint_type() == ANY_HINT_INSTRUCTION_HINT {
            self.any_hint().map(InstructionHint::init_from_table)
        } else {
            None
        }
    }
}
impl Verifiable for DmaHint<'_> {
    fn run_verifier(v: &mut Verifier, pos: usize) -> Result<(), InvalidFlatbuffer> {
        v.visit_table(pos)?
            .visit_union::<u8, _>(
                "any_hint_type",
                Self::VT_ANY_HINT_TYPE,
                "any_hint",
                Self::VT_ANY_HINT,
                false,
                |key, v, pos| match key {
                    ANY_HINT_DMA_DESCRIPTOR_HINT => v
                        .verify_union_variant::<ForwardsUOffset<DmaDescriptorHint>>(
                            "AnyHint::DmaDescriptorHint",
                            pos,
                        ),
                    ANY_HINT_INSTRUCTION_HINT => v
                        .verify_union_variant::<ForwardsUOffset<InstructionHint>>(
                            "AnyHint::InstructionHint",
                            pos,
                        ),
                    // Interrupt and fence hints carry nothing the host acts on.
                    ANY_HINT_INTERRUPT_HINT | ANY_HINT_FENCE_HINT => v
                        .verify_union_variant::<ForwardsUOffset<OpaqueTable>>(
                            "AnyHint::Other",
                            pos,
                        ),
                    _ => Ok(()),
                },
            )?
            .visit_field::<i16>("direction", Self::VT_DIRECTION, false)?
            .finish();
        Ok(())
    }
}

table!(DmaDescriptorHint);
impl<'a> DmaDescriptorHint<'a> {
    pub const VT_META: VOffsetT = field(0);
    pub const VT_OFFSET_IN_BYTES: VOffsetT = field(1);
    pub const VT_SIZE_IN_BYTES: VOffsetT = field(2);

    pub fn meta(&self) -> Option<Meta<'a>> {
        unsafe { self._tab.get::<ForwardsUOffset<Meta>>(Self::VT_META, None) }
    }
    pub fn offset_in_bytes(&self) -> i32 {
        unsafe { self._tab.get::<i32>(Self::VT_OFFSET_IN_BYTES, Some(0)).unwrap_or(0) }
    }
    pub fn size_in_bytes(&self) -> i32 {
        unsafe { self._tab.get::<i32>(Self::VT_SIZE_IN_BYTES, Some(0)).unwrap_or(0) }
    }
}
impl Verifiable for DmaDescriptorHint<'_> {
    fn run_verifier(v: &mut Verifier, pos: usize) -> Result<(), InvalidFlatbuffer> {
        v.visit_table(pos)?
            .visit_field::<ForwardsUOffset<Meta>>("meta", Self::VT_META, false)?
            .visit_field::<i32>("offset_in_bytes", Self::VT_OFFSET_IN_BYTES, false)?
            .visit_field::<i32>("size_in_bytes", Self::VT_SIZE_IN_BYTES, false)?
            .finish();
        Ok(())
    }
}

table!(Meta);
impl<'a> Meta<'a> {
    pub const VT_DESC: VOffsetT = field(0);
    pub const VT_BATCH: VOffsetT = field(1);
    pub const VT_NAME: VOffsetT = field(2);
    pub const VT_POSITION: VOffsetT = field(3);

    pub fn desc(&self) -> i16 {
        unsafe { self._tab.get::<i16>(Self::VT_DESC, Some(0)).unwrap_or(0) }
    }
    pub fn batch(&self) -> i32 {
        unsafe { self._tab.get::<i32>(Self::VT_BATCH, Some(0)).unwrap_or(0) }
    }
    pub fn name(&self) -> Option<&'a str> {
        unsafe { self._tab.get::<ForwardsUOffset<&str>>(Self::VT_NAME, None) }
    }
}
impl Verifiable for Meta<'_> {
    fn run_verifier(v: &mut Verifier, pos: usize) -> Result<(), InvalidFlatbuffer> {
        v.visit_table(pos)?
            .visit_field::<i16>("desc", Self::VT_DESC, false)?
            .visit_field::<i32>("batch", Self::VT_BATCH, false)?
            .visit_field::<ForwardsUOffset<&str>>("name", Self::VT_NAME, false)?
            .visit_field::<i16>("position", Self::VT_POSITION, false)?
            .finish();
        Ok(())
    }
}

table!(InstructionHint);
impl<'a> InstructionHint<'a> {
    pub const VT_INSTRUCTION_CHUNK_INDEX: VOffsetT = field(0);

    pub fn instruction_chunk_index(&self) -> i32 {
        unsafe {
            self._tab
                .get::<i32>(Self::VT_INSTRUCTION_CHUNK_INDEX, Some(0))
                .unwrap_or(0)
        }
    }
}
impl Verifiable for InstructionHint<'_> {
    fn run_verifier(v: &mut Verifier, pos: usize) -> Result<(), InvalidFlatbuffer> {
        v.visit_table(pos)?
            .visit_field::<i32>(
                "instruction_chunk_index",
                Self::VT_INSTRUCTION_CHUNK_INDEX,
                false,
            )?
            .finish();
        Ok(())
    }
}

// A union member whose fields are never read; only its bounds are checked.
table!(OpaqueTable);
impl Verifiable for OpaqueTable<'_> {
    fn run_verifier(v: &mut Verifier, pos: usize) -> Result<(), InvalidFlatbuffer> {
        v.visit_table(pos)?.finish();
        Ok(())
    }
}

table!(Layer);
impl<'a> Layer<'a> {
    pub const VT_NAME: VOffsetT = field(0);
    pub const VT_SIZE_BYTES: VOffsetT = field(1);
    pub const VT_Y_DIM: VOffsetT = field(2);
    pub const VT_X_DIM: VOffsetT = field(3);
    pub const VT_Z_DIM: VOffsetT = field(4);
    pub const VT_NUMERICS: VOffsetT = field(5);
    pub const VT_DATA_TYPE: VOffsetT = field(6);
    pub const VT_ANY_LAYER_TYPE: VOffsetT = field(7);
    pub const VT_ANY_LAYER: VOffsetT = field(8);
    pub const VT_EXECUTION_COUNT_PER_INFERENCE: VOffsetT = field(9);
    pub const VT_CACHE_ON_DRAM: VOffsetT = field(10);

    pub fn name(&self) -> Option<&'a str> {
        unsafe { self._tab.get::<ForwardsUOffset<&str>>(Self::VT_NAME, None) }
    }
    pub fn size_bytes(&self) -> i32 {
        unsafe { self._tab.get::<i32>(Self::VT_SIZE_BYTES, Some(0)).unwrap_or(0) }
    }
    pub fn y_dim(&self) -> i32 {
        unsafe { self._tab.get::<i32>(Self::VT_Y_DIM, Some(0)).unwrap_or(0) }
    }
    pub fn x_dim(&self) -> i32 {
        unsafe { self._tab.get::<i32>(Self::VT_X_DIM, Some(0)).unwrap_or(0) }
    }
    pub fn z_dim(&self) -> i32 {
        unsafe { self._tab.get::<i32>(Self::VT_Z_DIM, Some(0)).unwrap_or(0) }
    }
    pub fn data_type(&self) -> i16 {
        unsafe { self._tab.get::<i16>(Self::VT_DATA_TYPE, Some(0)).unwrap_or(0) }
    }
    pub fn any_layer_type(&self) -> u8 {
        unsafe {
            self._tab
                .get::<u8>(Self::VT_ANY_LAYER_TYPE, Some(ANY_LAYER_NONE))
                .unwrap_or(ANY_LAYER_NONE)
        }
    }
    pub fn any_layer(&self) -> Option<Table<'a>> {
        unsafe { self._tab.get::<ForwardsUOffset<Table<'a>>>(Self::VT_ANY_LAYER, None) }
    }
    pub fn any_layer_as_output_layer(&self) -> Option<OutputLayer<'a>> {
        if self.any_layer_type() == ANY_LAYER_OUTPUT_LAYER {
            self.any_layer().map(OutputLayer::init_from_table)
        } else {
            None
        }
    }
    pub fn execution_count_per_inference(&self) -> i32 {
        unsafe {
            self._tab
                .get::<i32>(Self::VT_EXECUTION_COUNT_PER_INFERENCE, Some(1))
                .unwrap_or(1)
        }
    }
}
impl Verifiable for Layer<'_> {
    fn run_verifier(v: &mut Verifier, pos: usize) -> Result<(), InvalidFlatbuffer> {
        v.visit_table(pos)?
            .visit_field::<ForwardsUOffset<&str>>("name", Self::VT_NAME, false)?
            .visit_field::<i32>("size_bytes", Self::VT_SIZE_BYTES, false)?
            .visit_field::<i32>("y_dim", Self::VT_Y_DIM, false)?
            .visit_field::<i32>("x_dim", Self::VT_X_DIM, false)?
            .visit_field::<i32>("z_dim", Self::VT_Z_DIM, false)?
            .visit_field::<ForwardsUOffset<OpaqueTable>>("numerics", Self::VT_NUMERICS, false)?
            .visit_field::<i16>("data_type", Self::VT_DATA_TYPE, false)?
            .visit_union::<u8, _>(
                "any_layer_type",
                Self::VT_ANY_LAYER_TYPE,
                "any_layer",
                Self::VT_ANY_LAYER,
                false,
                |key, v, pos| match key {
                    ANY_LAYER_OUTPUT_LAYER => v
                        .verify_union_variant::<ForwardsUOffset<OutputLayer>>(
                            "AnyLayer::OutputLayer",
                            pos,
                        ),
                    ANY_LAYER_INPUT_LAYER => v
                        .verify_union_variant::<ForwardsUOffset<OpaqueTable>>(
                            "AnyLayer::InputLayer",
                            pos,
                        ),
                    _ => Ok(()),
                },
            )?
            .visit_field::<i32>(
                "execution_count_per_inference",
                Self::VT_EXECUTION_COUNT_PER_INFERENCE,
                false,
            )?
            .visit_field::<bool>("cache_on_dram", Self::VT_CACHE_ON_DRAM, false)?
            .finish();
        Ok(())
    }
}

table!(OutputLayer);
impl<'a> OutputLayer<'a> {
    pub const VT_LAYOUT: VOffsetT = field(0);

    pub fn layout(&self) -> Option<OutputLayout<'a>> {
        unsafe { self._tab.get::<ForwardsUOffset<OutputLayout>>(Self::VT_LAYOUT, None) }
    }
}
impl Verifiable for OutputLayer<'_> {
    fn run_verifier(v: &mut Verifier, pos: usize) -> Result<(), InvalidFlatbuffer> {
        v.visit_table(pos)?
            .visit_field::<ForwardsUOffset<OutputLayout>>("layout", Self::VT_LAYOUT, false)?
            .finish();
        Ok(())
    }
}

table!(OutputLayout);
impl<'a> OutputLayout<'a> {
    pub const VT_Y_COORDINATE_TO_LINEAR_TILE_ID_MAP: VOffsetT = field(0);
    pub const VT_X_COORDINATE_TO_LINEAR_TILE_ID_MAP: VOffsetT = field(1);
    pub const VT_LINEARIZED_TILE_BYTE_OFFSET: VOffsetT = field(2);
    pub const VT_X_COORDINATE_TO_LOCAL_BYTE_OFFSET: VOffsetT = field(3);
    pub const VT_Y_COORDINATE_TO_LOCAL_Y_OFFSET: VOffsetT = field(4);
    pub const VT_X_COORDINATE_TO_LOCAL_Y_ROW_SIZE: VOffsetT = field(5);

    fn ints(&self, slot: VOffsetT) -> Option<Vector<'a, i32>> {
        unsafe { self._tab.get::<Ints>(slot, None) }
    }
    pub fn x_coordinate_to_linear_tile_id_map(&self) -> Option<Vector<'a, i32>> {
        self.ints(Self::VT_X_COORDINATE_TO_LINEAR_TILE_ID_MAP)
    }
    pub fn y_coordinate_to_linear_tile_id_map(&self) -> Option<Vector<'a, i32>> {
        self.ints(Self::VT_Y_COORDINATE_TO_LINEAR_TILE_ID_MAP)
    }
    pub fn linearized_tile_byte_offset(&self) -> Option<Vector<'a, i32>> {
        self.ints(Self::VT_LINEARIZED_TILE_BYTE_OFFSET)
    }
    pub fn x_coordinate_to_local_byte_offset(&self) -> Option<Vector<'a, i32>> {
        self.ints(Self::VT_X_COORDINATE_TO_LOCAL_BYTE_OFFSET)
    }
    pub fn y_coordinate_to_local_y_offset(&self) -> Option<Vector<'a, i32>> {
        self.ints(Self::VT_Y_COORDINATE_TO_LOCAL_Y_OFFSET)
    }
    pub fn x_coordinate_to_local_y_row_size(&self) -> Option<Vector<'a, i32>> {
        self.ints(Self::VT_X_COORDINATE_TO_LOCAL_Y_ROW_SIZE)
    }
}
impl Verifiable for OutputLayout<'_> {
    fn run_verifier(v: &mut Verifier, pos: usize) -> Result<(), InvalidFlatbuffer> {
        v.visit_table(pos)?
            .visit_field::<Ints>(
                "y_coordinate_to_linear_tile_id_map",
                Self::VT_Y_COORDINATE_TO_LINEAR_TILE_ID_MAP,
                true,
            )?
            .visit_field::<Ints>(
                "x_coordinate_to_linear_tile_id_map",
                Self::VT_X_COORDINATE_TO_LINEAR_TILE_ID_MAP,
                true,
            )?
            .visit_field::<Ints>(
                "linearized_tile_byte_offset",
                Self::VT_LINEARIZED_TILE_BYTE_OFFSET,
                true,
            )?
            .visit_field::<Ints>(
                "x_coordinate_to_local_byte_offset",
                Self::VT_X_COORDINATE_TO_LOCAL_BYTE_OFFSET,
                true,
            )?
            .visit_field::<Ints>(
                "y_coordinate_to_local_y_offset",
                Self::VT_Y_COORDINATE_TO_LOCAL_Y_OFFSET,
                true,
            )?
            .visit_field::<Ints>(
                "x_coordinate_to_local_y_row_size",
                Self::VT_X_COORDINATE_TO_LOCAL_Y_ROW_SIZE,
                true,
            )?
            .finish();
        Ok(())
    }
}


// Table writers, one per table, taking already-serialized children.

fn finish_table<'a, T>(
    fbb: &mut FlatBufferBuilder<'a>,
    start: WIPOffset<flatbuffers::TableUnfinishedWIPOffset>,
) -> WIPOffset<T> {
    let o = fbb.end_table(start);
    WIPOffset::new(o.value())
}

/// Writes |bytes| with the wire form of a flatbuffer string: a length
/// prefix and a trailing NUL that the length does not count.
pub fn create_byte_string<'a>(
    fbb: &mut FlatBufferBuilder<'a>,
    bytes: &[u8],
) -> WIPOffset<Vector<'a, u8>> {
    fbb.start_vector::<u8>(bytes.len() + 1);
    fbb.push(0u8);
    for b in bytes.iter().rev() {
        fbb.push(*b);
    }
    fbb.end_vector::<u8>(bytes.len())
}

pub fn create_package<'a>(
    fbb: &mut FlatBufferBuilder<'a>,
    min_runtime_version: i32,
    serialized_multi_executable: WIPOffset<Vector<'a, u8>>,
) -> WIPOffset<Package<'a>> {
    let start = fbb.start_table();
    fbb.push_slot_always::<WIPOffset<_>>(
        Package::VT_SERIALIZED_MULTI_EXECUTABLE,
        serialized_multi_executable,
    );
    fbb.push_slot::<i32>(Package::VT_MIN_RUNTIME_VERSION, min_runtime_version, 0);
    finish_table(fbb, start)
}

pub fn create_multi_executable<'a>(
    fbb: &mut FlatBufferBuilder<'a>,
    serialized_executables: WIPOffset<Vector<'a, ForwardsUOffset<Vector<'a, u8>>>>,
) -> WIPOffset<MultiExecutable<'a>> {
    let start = fbb.start_table();
    fbb.push_slot_always::<WIPOffset<_>>(
        MultiExecutable::VT_SERIALIZED_EXECUTABLES,
        serialized_executables,
    );
    finish_table(fbb, start)
}

pub struct ExecutableArgs<'a> {
    pub version: i32,
    pub name: Option<WIPOffset<&'a str>>,
    pub chip: Option<WIPOffset<&'a str>>,
    pub type_: i16,
    pub parameter_caching_token: u64,
    pub instruction_bitstreams:
        Option<WIPOffset<Vector<'a, ForwardsUOffset<InstructionBitstream<'a>>>>>,
    pub parameters: Option<WIPOffset<Vector<'a, u8>>>,
    pub dma_hints: Option<WIPOffset<DmaHints<'a>>>,
    pub input_layers: Option<WIPOffset<Vector<'a, ForwardsUOffset<Layer<'a>>>>>,
    pub output_layers: Option<WIPOffset<Vector<'a, ForwardsUOffset<Layer<'a>>>>>,
}

pub fn create_executable<'a>(
    fbb: &mut FlatBufferBuilder<'a>,
    args: &ExecutableArgs<'a>,
) -> WIPOffset<Executable<'a>> {
    let start = fbb.start_table();
    // NB: widest scalars first, as flatc orders them.
    fbb.push_slot::<u64>(
        Executable::VT_PARAMETER_CACHING_TOKEN,
        args.parameter_caching_token,
        0,
    );
    if let Some(x) = args.chip {
        fbb.push_slot_always::<WIPOffset<_>>(Executable::VT_CHIP, x);
    }
    if let Some(x) = args.output_layers {
        fbb.push_slot_always::<WIPOffset<_>>(Executable::VT_OUTPUT_LAYERS, x);
    }
    if let Some(x) = args.input_layers {
        fbb.push_slot_always::<WIPOffset<_>>(Executable::VT_INPUT_LAYERS, x);
    }
    if let Some(x) = args.dma_hints {
        fbb.push_slot_always::<WIPOffset<_>>(Executable::VT_DMA_HINTS, x);
    }
    if let Some(x) = args.parameters {
        fbb.push_slot_always::<WIPOffset<_>>(Executable::VT_PARAMETERS, x);
    }
    if let Some(x) = args.instruction_bitstreams {
        fbb.push_slot_always::<WIPOffset<_>>(Executable::VT_INSTRUCTION_BITSTREAMS, x);
    }
    if let Some(x) = args.name {
        fbb.push_slot_always::<WIPOffset<_>>(Executable::VT_NAME, x);
    }
    fbb.push_slot::<i32>(Executable::VT_VERSION, args.version, 0);
    fbb.push_slot::<i16>(Executable::VT_TYPE_, args.type_, 0);
    finish_table(fbb, start)
}

pub fn create_instruction_bitstream<'a>(
    fbb: &mut FlatBufferBuilder<'a>,
    bitstream: WIPOffset<Vector<'a, u8>>,
) -> WIPOffset<InstructionBitstream<'a>> {
    let start = fbb.start_table();
    fbb.push_slot_always::<WIPOffset<_>>(InstructionBitstream::VT_BITSTREAM, bitstream);
    finish_table(fbb, start)
}

pub fn create_dma_hints<'a>(
    fbb: &mut FlatBufferBuilder<'a>,
    hints: WIPOffset<Vector<'a, ForwardsUOffset<DmaHint<'a>>>>,
    fully_deterministic: bool,
) -> WIPOffset<DmaHints<'a>> {
    let start = fbb.start_table();
    fbb.push_slot_always::<WIPOffset<_>>(DmaHints::VT_HINTS, hints);
    fbb.push_slot::<bool>(DmaHints::VT_FULLY_DETERMINISTIC, fully_deterministic, false);
    finish_table(fbb, start)
}

/// A DmaHint holding |any_hint|, whose union tag is |any_hint_type|.
pub fn create_dma_hint<'a, T>(
    fbb: &mut FlatBufferBuilder<'a>,
    any_hint_type: u8,
    any_hint: WIPOffset<T>,
) -> WIPOffset<DmaHint<'a>> {
    let start = fbb.start_table();
    fbb.push_slot_always::<WIPOffset<_>>(DmaHint::VT_ANY_HINT, any_hint);
    fbb.push_slot::<u8>(DmaHint::VT_ANY_HINT_TYPE, any_hint_type, ANY_HINT_NONE);
    finish_table(fbb, start)
}

pub fn create_dma_descriptor_hint<'a>(
    fbb: &mut FlatBufferBuilder<'a>,
    meta: WIPOffset<Meta<'a>>,
    offset_in_bytes: i32,
    size_in_bytes: i32,
) -> WIPOffset<DmaDescriptorHint<'a>> {
    let start = fbb.start_table();
    fbb.push_slot::<i32>(DmaDescriptorHint::VT_SIZE_IN_BYTES, size_in_bytes, 0);
    fbb.push_slot::<i32>(DmaDescriptorHint::VT_OFFSET_IN_BYTES, offset_in_bytes, 0);
    fbb.push_slot_always::<WIPOffset<_>>(DmaDescriptorHint::VT_META, meta);
    finish_table(fbb, start)
}

pub fn create_meta<'a>(
    fbb: &mut FlatBufferBuilder<'a>,
    desc: i16,
    name: Option<WIPOffset<&'a str>>,
) -> WIPOffset<Meta<'a>> {
    let start = fbb.start_table();
    if let Some(x) = name {
        fbb.push_slot_always::<WIPOffset<_>>(Meta::VT_NAME, x);
    }
    fbb.push_slot::<i16>(Meta::VT_DESC, desc, 0);
    finish_table(fbb, start)
}

pub fn create_instruction_hint<'a>(
    fbb: &mut FlatBufferBuilder<'a>,
    instruction_chunk_index: i32,
) -> WIPOffset<InstructionHint<'a>> {
    let start = fbb.start_table();
    fbb.push_slot::<i32>(
        InstructionHint::VT_INSTRUCTION_CHUNK_INDEX,
        instruction_chunk_index,
        0,
    );
    finish_table(fbb, start)
}

pub struct LayerArgs<'a> {
    pub name: WIPOffset<&'a str>,
    pub size_bytes: i32,
    pub y_dim: i32,
    pub x_dim: i32,
    pub z_dim: i32,
    pub data_type: i16,
    pub execution_count_per_inference: i32,
    pub output_layer: Option<WIPOffset<OutputLayer<'a>>>,
}

pub fn create_layer<'a>(
    fbb: &mut FlatBufferBuilder<'a>,
    args: &LayerArgs<'a>,
) -> WIPOffset<Layer<'a>> {
    let start = fbb.start_table();
    fbb.push_slot::<i32>(
        Layer::VT_EXECUTION_COUNT_PER_INFERENCE,
        args.execution_count_per_inference,
        1,
    );
    if let Some(x) = args.output_layer {
        fbb.push_slot_always::<WIPOffset<_>>(Layer::VT_ANY_LAYER, x);
    }
    fbb.push_slot::<i32>(Layer::VT_Z_DIM, args.z_dim, 0);
    fbb.push_slot::<i32>(Layer::VT_X_DIM, args.x_dim, 0);
    fbb.push_slot::<i32>(Layer::VT_Y_DIM, args.y_dim, 0);
    fbb.push_slot::<i32>(Layer::VT_SIZE_BYTES, args.size_bytes, 0);
    fbb.push_slot_always::<WIPOffset<_>>(Layer::VT_NAME, args.name);
    fbb.push_slot::<i16>(Layer::VT_DATA_TYPE, args.data_type, 0);
    if args.output_layer.is_some() {
        fbb.push_slot::<u8>(Layer::VT_ANY_LAYER_TYPE, ANY_LAYER_OUTPUT_LAYER, ANY_LAYER_NONE);
    }
    finish_table(fbb, start)
}

pub fn create_output_layer<'a>(
    fbb: &mut FlatBufferBuilder<'a>,
    layout: WIPOffset<OutputLayout<'a>>,
) -> WIPOffset<OutputLayer<'a>> {
    let start = fbb.start_table();
    fbb.push_slot_always::<WIPOffset<_>>(OutputLayer::VT_LAYOUT, layout);
    finish_table(fbb, start)
}

pub struct OutputLayoutArgs<'a> {
    pub x_coordinate_to_linear_tile_id_map: WIPOffset<Vector<'a, i32>>,
    pub y_coordinate_to_linear_tile_id_map: WIPOffset<Vector<'a, i32>>,
    pub linearized_tile_byte_offset: WIPOffset<Vector<'a, i32>>,
    pub x_coordinate_to_local_byte_offset: WIPOffset<Vector<'a, i32>>,
    pub y_coordinate_to_local_y_offset: WIPOffset<Vector<'a, i32>>,
    pub x_coordinate_to_local_y_row_size: WIPOffset<Vector<'a, i32>>,
}

pub fn create_output_layout<'a>(
    fbb: &mut FlatBufferBuilder<'a>,
    args: &OutputLayoutArgs<'a>,
) -> WIPOffset<OutputLayout<'a>> {
    let start = fbb.start_table();
    fbb.push_slot_always::<WIPOffset<_>>(
        OutputLayout::VT_X_COORDINATE_TO_LOCAL_Y_ROW_SIZE,
        args.x_coordinate_to_local_y_row_size,
    );
    fbb.push_slot_always::<WIPOffset<_>>(
        OutputLayout::VT_Y_COORDINATE_TO_LOCAL_Y_OFFSET,
        args.y_coordinate_to_local_y_offset,
    );
    fbb.push_slot_always::<WIPOffset<_>>(
        OutputLayout::VT_X_COORDINATE_TO_LOCAL_BYTE_OFFSET,
        args.x_coordinate_to_local_byte_offset,
    );
    fbb.push_slot_always::<WIPOffset<_>>(
        OutputLayout::VT_LINEARIZED_TILE_BYTE_OFFSET,
        args.linearized_tile_byte_offset,
    );
    fbb.push_slot_always::<WIPOffset<_>>(
        OutputLayout::VT_Y_COORDINATE_TO_LINEAR_TILE_ID_MAP,
        args.y_coordinate_to_linear_tile_id_map,
    );
    fbb.push_slot_always::<WIPOffset<_>>(
        OutputLayout::VT_X_COORDINATE_TO_LINEAR_TILE_ID_MAP,
        args.x_coordinate_to_linear_tile_id_map,
    );
    finish_table(fbb, start)
}
