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

//! Assembles packages in the format the compiler emits. Host tooling uses
//! this to wrap executables, tests use it to produce fixtures.

use crate::envelope::{encode_envelope, EnvelopeEntry, CHIP_KEY, EXECUTABLE_KEY, VERSION_KEY};
use crate::schema;
use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;
use edgetpu_shared::{DataType, Description, ExecutableType};
use flatbuffers::{FlatBufferBuilder, WIPOffset};

const DEFAULT_CHIP: &str = "beagle";
const ENVELOPE_VERSION: u32 = 1;
const MIN_RUNTIME_VERSION: i32 = 13;

#[derive(Clone, Debug, Default)]
pub struct TileLayoutSpec {
    pub x_tile: Vec<i32>,
    pub y_tile: Vec<i32>,
    pub tile_offset: Vec<i32>,
    pub x_local_offset: Vec<i32>,
    pub y_local_offset: Vec<i32>,
    pub row_size: Vec<i32>,
}

#[derive(Clone, Debug)]
pub struct LayerSpec {
    pub name: String,
    pub y_dim: i32,
    pub x_dim: i32,
    pub z_dim: i32,
    pub data_type: DataType,
    pub executions: i32,
    // Defaults to the dense size of one execution.
    pub size_bytes: Option<i32>,
    pub layout: Option<TileLayoutSpec>,
}
impl LayerSpec {
    /// A one-dimensional layer of |z_dim| unsigned bytes.
    pub fn vector(name: &str, z_dim: i32) -> Self {
        LayerSpec {
            name: name.to_string(),
            y_dim: 1,
            x_dim: 1,
            z_dim,
            data_type: DataType::FixedPoint8,
            executions: 1,
            size_bytes: None,
            layout: None,
        }
    }

    pub fn dims(mut self, y_dim: i32, x_dim: i32, z_dim: i32) -> Self {
        self.y_dim = y_dim;
        self.x_dim = x_dim;
        self.z_dim = z_dim;
        self
    }

    pub fn data_type(mut self, data_type: DataType) -> Self {
        self.data_type = data_type;
        self
    }

    pub fn executions(mut self, executions: i32) -> Self {
        self.executions = executions;
        self
    }

    pub fn size_bytes(mut self, size_bytes: i32) -> Self {
        self.size_bytes = Some(size_bytes);
        self
    }

    pub fn layout(mut self, layout: TileLayoutSpec) -> Self {
        self.layout = Some(layout);
        self
    }

    fn size(&self) -> i32 {
        self.size_bytes.unwrap_or(
            self.y_dim * self.x_dim * self.z_dim * self.data_type.size() as i32,
        )
    }
}

#[derive(Clone, Debug)]
pub enum HintSpec {
    Instructions(i32),
    Parameters { offset: i32, size: i32 },
    Inputs { name: String, offset: i32, size: i32 },
    Outputs { name: String, offset: i32, size: i32 },
}

/// Describes one executable. Unless |hints| is set, the hints stream every
/// bitstream, then the parameters, then each input and output in full.
#[derive(Clone, Debug)]
pub struct ExecutableSpec {
    pub name: String,
    pub executable_type: i16,
    pub parameter_caching_token: u64,
    pub bitstreams: Vec<Vec<u8>>,
    pub parameters: Vec<u8>,
    pub inputs: Vec<LayerSpec>,
    pub outputs: Vec<LayerSpec>,
    pub hints: Option<Vec<HintSpec>>,
    pub extra_hints: Vec<HintSpec>,
}
impl ExecutableSpec {
    fn with_type(executable_type: ExecutableType) -> Self {
        ExecutableSpec {
            name: String::new(),
            executable_type: executable_type.into(),
            parameter_caching_token: 0,
            bitstreams: vec![vec![0xb0; 16]],
            parameters: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            hints: None,
            extra_hints: Vec::new(),
        }
    }

    pub fn inference() -> Self { Self::with_type(ExecutableType::StandAlone) }

    pub fn execution_only(token: u64) -> Self {
        let mut spec = Self::with_type(ExecutableType::ExecutionOnly);
        spec.parameter_caching_token = token;
        spec
    }

    pub fn parameter_caching(token: u64, parameters: &[u8]) -> Self {
        let mut spec = Self::with_type(ExecutableType::ParameterCaching);
        spec.parameter_caching_token = token;
        spec.parameters = parameters.to_vec();
        spec
    }

    pub fn parameters(mut self, parameters: &[u8]) -> Self {
        self.parameters = parameters.to_vec();
        self
    }

    pub fn input(mut self, layer: LayerSpec) -> Self {
        self.inputs.push(layer);
        self
    }

    pub fn output(mut self, layer: LayerSpec) -> Self {
        self.outputs.push(layer);
        self
    }

    /// Appends an output hint after the generated ones.
    pub fn output_hint(mut self, name: &str, offset: i32, size: i32) -> Self {
        self.extra_hints.push(HintSpec::Outputs {
            name: name.to_string(),
            offset,
            size,
        });
        self
    }

    fn default_hints(&self) -> Vec<HintSpec> {
        let mut hints: Vec<HintSpec> = (0..self.bitstreams.len() as i32)
            .map(HintSpec::Instructions)
            .collect();
        if !self.parameters.is_empty() {
            hints.push(HintSpec::Parameters {
                offset: 0,
                size: self.parameters.len() as i32,
            });
        }
        hints.extend(self.inputs.iter().map(|l| HintSpec::Inputs {
            name: l.name.clone(),
            offset: 0,
            size: l.size() * l.executions,
        }));
        hints.extend(self.outputs.iter().map(|l| HintSpec::Outputs {
            name: l.name.clone(),
            offset: 0,
            size: l.size() * l.executions,
        }));
        hints
    }

    /// Serializes the executable flatbuffer.
    pub fn build(&self) -> Vec<u8> {
        let mut fbb = FlatBufferBuilder::new();

        let bitstreams: Vec<_> = self
            .bitstreams
            .iter()
            .map(|b| {
                let bitstream = fbb.create_vector(b.as_slice());
                schema::create_instruction_bitstream(&mut fbb, bitstream)
            })
            .collect();
        let bitstreams = fbb.create_vector(&bitstreams);
        let parameters = fbb.create_vector(self.parameters.as_slice());

        let mut hints = self.hints.clone().unwrap_or_else(|| self.default_hints());
        hints.extend(self.extra_hints.iter().cloned());
        let hints: Vec<_> = hints.iter().map(|h| create_hint(&mut fbb, h)).collect();
        let hints = fbb.create_vector(&hints);
        let dma_hints = schema::create_dma_hints(&mut fbb, hints, true);

        let inputs: Vec<_> = self.inputs.iter().map(|l| create_layer(&mut fbb, l)).collect();
        let inputs = fbb.create_vector(&inputs);
        let outputs: Vec<_> = self.outputs.iter().map(|l| create_layer(&mut fbb, l)).collect();
        let outputs = fbb.create_vector(&outputs);

        let name = fbb.create_string(&self.name);
        let chip = fbb.create_string(DEFAULT_CHIP);
        let executable = schema::create_executable(
            &mut fbb,
            &schema::ExecutableArgs {
                version: 1,
                name: Some(name),
                chip: Some(chip),
                type_: self.executable_type,
                parameter_caching_token: self.parameter_caching_token,
                instruction_bitstreams: Some(bitstreams),
                parameters: Some(parameters),
                dma_hints: Some(dma_hints),
                input_layers: Some(inputs),
                output_layers: Some(outputs),
            },
        );
        fbb.finish(executable, None);
        fbb.finished_data().to_vec()
    }
}

fn create_hint<'a>(fbb: &mut FlatBufferBuilder<'a>, hint: &HintSpec) -> WIPOffset<schema::DmaHint<'a>> {
    let (desc, name, offset, size) = match hint {
        HintSpec::Instructions(chunk) => {
            let instruction = schema::create_instruction_hint(fbb, *chunk);
            return schema::create_dma_hint(
                fbb,
                schema::ANY_HINT_INSTRUCTION_HINT,
                instruction,
            );
        }
        HintSpec::Parameters { offset, size } => (Description::Parameter, None, *offset, *size),
        HintSpec::Inputs { name, offset, size } => {
            (Description::InputActivation, Some(name), *offset, *size)
        }
        HintSpec::Outputs { name, offset, size } => {
            (Description::OutputActivation, Some(name), *offset, *size)
        }
    };
    let name = name.map(|n| fbb.create_string(n));
    let meta = schema::create_meta(fbb, desc.into(), name);
    let descriptor = schema::create_dma_descriptor_hint(fbb, meta, offset, size);
    schema::create_dma_hint(fbb, schema::ANY_HINT_DMA_DESCRIPTOR_HINT, descriptor)
}

fn create_layer<'a>(fbb: &mut FlatBufferBuilder<'a>, layer: &LayerSpec) -> WIPOffset<schema::Layer<'a>> {
    let output_layer = layer.layout.as_ref().map(|l| {
        let args = schema::OutputLayoutArgs {
            x_coordinate_to_linear_tile_id_map: fbb.create_vector(&l.x_tile),
            y_coordinate_to_linear_tile_id_map: fbb.create_vector(&l.y_tile),
            linearized_tile_byte_offset: fbb.create_vector(&l.tile_offset),
            x_coordinate_to_local_byte_offset: fbb.create_vector(&l.x_local_offset),
            y_coordinate_to_local_y_offset: fbb.create_vector(&l.y_local_offset),
            x_coordinate_to_local_y_row_size: fbb.create_vector(&l.row_size),
        };
        let layout = schema::create_output_layout(fbb, &args);
        schema::create_output_layer(fbb, layout)
    });
    let name = fbb.create_string(&layer.name);
    schema::create_layer(
        fbb,
        &schema::LayerArgs {
            name,
            size_bytes: layer.size(),
            y_dim: layer.y_dim,
            x_dim: layer.x_dim,
            z_dim: layer.z_dim,
            data_type: layer.data_type.into(),
            execution_count_per_inference: layer.executions,
            output_layer,
        },
    )
}

/// Wraps serialized executables into the custom-op initializer buffer.
#[derive(Default)]
pub struct PackageBuilder {
    chip: Option<String>,
    executables: Vec<Vec<u8>>,
}
impl PackageBuilder {
    pub fn new() -> Self { Self::default() }

    pub fn chip(mut self, chip: &str) -> Self {
        self.chip = Some(chip.to_string());
        self
    }

    /// Adds an already-serialized executable flatbuffer.
    pub fn executable(mut self, executable: Vec<u8>) -> Self {
        self.executables.push(executable);
        self
    }

    pub fn add(self, spec: &ExecutableSpec) -> Self { self.executable(spec.build()) }

    /// The Package flatbuffer, holding the nested MultiExecutable.
    pub fn build_package(&self) -> Vec<u8> {
        let mut fbb = FlatBufferBuilder::new();
        let serialized: Vec<_> = self
            .executables
            .iter()
            .map(|e| schema::create_byte_string(&mut fbb, e))
            .collect();
        let serialized = fbb.create_vector(&serialized);
        let multi_executable = schema::create_multi_executable(&mut fbb, serialized);
        fbb.finish(multi_executable, None);
        let multi_executable = fbb.finished_data().to_vec();

        let mut fbb = FlatBufferBuilder::new();
        let serialized = fbb.create_vector(multi_executable.as_slice());
        let package = schema::create_package(&mut fbb, MIN_RUNTIME_VERSION, serialized);
        fbb.finish(package, None);
        fbb.finished_data().to_vec()
    }

    /// The complete envelope handed to the custom op's init.
    pub fn build(&self) -> Vec<u8> {
        let package = self.build_package();
        encode_envelope(&[
            (VERSION_KEY, EnvelopeEntry::UInt(ENVELOPE_VERSION)),
            (CHIP_KEY, EnvelopeEntry::String(self.chip.as_deref().unwrap_or(DEFAULT_CHIP))),
            (EXECUTABLE_KEY, EnvelopeEntry::Blob(&package)),
        ])
    }
}
