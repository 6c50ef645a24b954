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

//! One compiled accelerator program. The flatbuffer is verified and copied
//! into owned form once; invoking it walks the DMA hints in order.

use crate::schema;
use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;
use edgetpu_driver::TpuDriver;
use edgetpu_interface::{EdgeTpuError, TfLiteNode};
use edgetpu_shared::{DataType, Description, ExecutableType};
use log::{error, trace, warn};

fn to_usize(value: i32) -> Result<usize, EdgeTpuError> {
    usize::try_from(value).map_err(|_| EdgeTpuError::InvalidPackage)
}

fn to_usizes(values: Option<flatbuffers::Vector<i32>>) -> Result<Vec<usize>, EdgeTpuError> {
    values
        .ok_or(EdgeTpuError::InvalidPackage)?
        .iter()
        .map(to_usize)
        .collect()
}

// Copies |len| bytes between two buffers; any overrun means the tensor the
// caller handed us does not match the layer.
fn copy_bytes(
    dest: &mut [u8],
    dest_offset: usize,
    src: &[u8],
    src_offset: usize,
    len: usize,
) -> Result<(), EdgeTpuError> {
    let from = src
        .get(src_offset..src_offset + len)
        .ok_or(EdgeTpuError::InvalidTensor)?;
    dest.get_mut(dest_offset..dest_offset + len)
        .ok_or(EdgeTpuError::InvalidTensor)?
        .copy_from_slice(from);
    Ok(())
}

/// Shape and element type of an input or output layer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LayerShape {
    pub name: String,
    pub size_bytes: usize,
    pub x_dim: usize,
    pub y_dim: usize,
    pub z_dim: usize,
    pub data_type: DataType,
    pub executions: usize,
}
impl LayerShape {
    fn from_layer(layer: &schema::Layer) -> Result<Self, EdgeTpuError> {
        Ok(LayerShape {
            name: layer.name().unwrap_or_default().to_string(),
            size_bytes: to_usize(layer.size_bytes())?,
            x_dim: to_usize(layer.x_dim())?,
            y_dim: to_usize(layer.y_dim())?,
            z_dim: to_usize(layer.z_dim())?,
            data_type: DataType::try_from(layer.data_type())
                .map_err(|_| EdgeTpuError::InvalidPackage)?,
            executions: to_usize(layer.execution_count_per_inference())?.max(1),
        })
    }

    pub fn elements(&self) -> usize { self.x_dim * self.y_dim * self.z_dim }

    /// Bytes of real data produced over all executions.
    pub fn actual_size_bytes(&self) -> usize {
        self.elements() * self.data_type.size() * self.executions
    }

    /// Bytes the device transfers, including per-execution padding.
    pub fn padded_size_bytes(&self) -> usize { self.size_bytes * self.executions }

    /// Flips the most significant bit of every element. Elements are little
    /// endian so that is the last byte of each.
    pub fn transform_signed(&self, buffer: &mut [u8]) {
        if !self.data_type.is_signed() {
            return;
        }
        let size = self.data_type.size();
        for element in buffer.chunks_exact_mut(size).take(self.elements()) {
            element[size - 1] ^= 0x80;
        }
    }
}

/// Maps from output coordinates to the tiled layout the device writes.
/// Offsets from the maps are in elements.
#[derive(Clone, Debug)]
struct TileLayout {
    x_tile: Vec<usize>,
    y_tile: Vec<usize>,
    tile_offset: Vec<usize>,
    x_local_offset: Vec<usize>,
    y_local_offset: Vec<usize>,
    row_size: Vec<usize>,
    // Widths of consecutive runs of x coordinates that share a tile.
    tile_widths: Vec<usize>,
    z_bytes_padded: usize,
}
impl TileLayout {
    fn new(layout: &schema::OutputLayout, shape: &LayerShape) -> Result<Self, EdgeTpuError> {
        let mut tiles = TileLayout {
            x_tile: to_usizes(layout.x_coordinate_to_linear_tile_id_map())?,
            y_tile: to_usizes(layout.y_coordinate_to_linear_tile_id_map())?,
            tile_offset: to_usizes(layout.linearized_tile_byte_offset())?,
            x_local_offset: to_usizes(layout.x_coordinate_to_local_byte_offset())?,
            y_local_offset: to_usizes(layout.y_coordinate_to_local_y_offset())?,
            row_size: to_usizes(layout.x_coordinate_to_local_y_row_size())?,
            tile_widths: Vec::new(),
            z_bytes_padded: 0,
        };
        let x_maps = [&tiles.x_tile, &tiles.x_local_offset, &tiles.row_size];
        let y_maps = [&tiles.y_tile, &tiles.y_local_offset];
        if shape.x_dim == 0
            || shape.y_dim == 0
            || x_maps.iter().any(|m| m.len() != shape.x_dim)
            || y_maps.iter().any(|m| m.len() != shape.y_dim)
        {
            return Err(EdgeTpuError::InvalidPackage);
        }
        let max_x = tiles.x_tile.iter().max().copied().unwrap_or(0);
        let max_y = tiles.y_tile.iter().max().copied().unwrap_or(0);
        if max_x + max_y >= tiles.tile_offset.len() {
            return Err(EdgeTpuError::InvalidPackage);
        }

        let mut run_start = 0;
        for x in 1..shape.x_dim {
            if tiles.x_tile[x] != tiles.x_tile[x - 1] {
                tiles.tile_widths.push(x - run_start);
                run_start = x;
            }
        }
        tiles.tile_widths.push(shape.x_dim - run_start);

        // The stride between neighbouring x (or y, for a single column)
        // gives the padded depth of one position.
        let origin = tiles.index(0, 0);
        let next = if shape.x_dim > 1 {
            tiles.index(0, 1)
        } else {
            tiles.index(1, 0)
        };
        tiles.z_bytes_padded = next
            .checked_sub(origin)
            .ok_or(EdgeTpuError::InvalidPackage)?
            * shape.data_type.size();
        Ok(tiles)
    }

    // Element index of (y, x, 0) in the device buffer.
    fn index(&self, y: usize, x: usize) -> usize {
        let tile = self.y_tile[y] + self.x_tile[x];
        self.tile_offset[tile] + self.y_local_offset[y] * self.row_size[x] + self.x_local_offset[x]
    }
}

/// An output layer with the buffer the device writes it into.
#[derive(Clone, Debug)]
pub struct OutputLayer {
    shape: LayerShape,
    layout: Option<TileLayout>,
    buffer: Vec<u8>,
}
impl OutputLayer {
    fn new(layer: &schema::Layer) -> Result<Self, EdgeTpuError> {
        let shape = LayerShape::from_layer(layer)?;
        let layout = if shape.x_dim == 1 && shape.y_dim == 1 {
            None
        } else {
            let layout = layer
                .any_layer_as_output_layer()
                .and_then(|l| l.layout())
                .ok_or_else(|| {
                    error!("Output layer {} has no layout", shape.name);
                    EdgeTpuError::InvalidPackage
                })?;
            Some(TileLayout::new(&layout, &shape)?)
        };
        let buffer = vec![0u8; shape.padded_size_bytes()];
        Ok(OutputLayer {
            shape,
            layout,
            buffer,
        })
    }

    pub fn shape(&self) -> &LayerShape { &self.shape }
    pub fn buffer(&self) -> &[u8] { &self.buffer }

    /// Copies the device layout in the layer buffer into the dense
    /// y-major order of |dest|.
    pub fn relayout(&self, dest: &mut [u8]) -> Result<(), EdgeTpuError> {
        let shape = &self.shape;
        let data_type_size = shape.data_type.size();
        let z_bytes = shape.z_dim * data_type_size;
        let src = self.buffer.as_slice();

        let Some(tiles) = &self.layout else {
            let executions = shape.executions;
            let padded = shape.padded_size_bytes();
            let actual = shape.actual_size_bytes();
            if executions == 1 || padded == actual {
                return copy_bytes(dest, 0, src, 0, z_bytes * executions);
            }
            // Drop the padding at the end of each execution.
            let stride = z_bytes + padded.saturating_sub(actual) / executions;
            for i in 0..executions {
                copy_bytes(dest, i * z_bytes, src, i * stride, z_bytes)?;
            }
            return Ok(());
        };

        let mut written = 0;
        for y in 0..shape.y_dim {
            let mut tile_start = 0;
            for width in &tiles.tile_widths {
                let source = tiles.index(y, tile_start) * data_type_size;
                for local_x in 0..*width {
                    copy_bytes(
                        dest,
                        written,
                        src,
                        source + local_x * tiles.z_bytes_padded,
                        z_bytes,
                    )?;
                    written += z_bytes;
                }
                tile_start += width;
            }
        }
        Ok(())
    }

    /// Undoes the signed bias on a relaid-out output.
    pub fn transform_signed(&self, buffer: &mut [u8]) {
        if buffer.len() < self.shape.actual_size_bytes() {
            warn!(
                "Output for {} is {} bytes, need {}",
                self.shape.name,
                buffer.len(),
                self.shape.actual_size_bytes()
            );
            return;
        }
        self.shape.transform_signed(buffer);
    }
}

/// One transfer from the executable's DMA hints.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DmaStep {
    Instructions { chunk: usize },
    Parameters { offset: usize, size: usize },
    // |layer| indexes the input layers; an unnamed input reads tensor 0.
    Inputs { layer: Option<usize>, offset: usize, size: usize },
    Outputs { layer: usize, offset: usize, size: usize },
}

pub struct EdgeTpuExecutable {
    version: i32,
    name: String,
    chip: String,
    executable_type: ExecutableType,
    parameter_caching_token: u64,
    bitstreams: Vec<Vec<u8>>,
    parameters: Vec<u8>,
    steps: Vec<DmaStep>,
    fully_deterministic: bool,
    input_layers: Vec<LayerShape>,
    output_layers: Vec<OutputLayer>,
    scratch: Vec<u8>,
}
impl EdgeTpuExecutable {
    /// Verifies the flatbuffer in |bytes| and decodes it.
    pub fn new(bytes: &[u8]) -> Result<Self, EdgeTpuError> {
        let executable = flatbuffers::root::<schema::Executable>(bytes).map_err(|e| {
            error!("Executable failed verification: {:?}", e);
            EdgeTpuError::InvalidPackage
        })?;
        let executable_type = ExecutableType::try_from(executable.type_()).map_err(|_| {
            error!("Unknown executable type {}", executable.type_());
            EdgeTpuError::InvalidPackage
        })?;

        let bitstreams: Vec<Vec<u8>> = executable
            .instruction_bitstreams()
            .map(|v| {
                v.iter()
                    .map(|b| b.bitstream().map(|s| s.bytes().to_vec()).unwrap_or_default())
                    .collect()
            })
            .unwrap_or_default();
        let parameters = executable
            .parameters()
            .map(|p| p.bytes().to_vec())
            .unwrap_or_default();
        let input_layers = match executable.input_layers() {
            Some(layers) => layers
                .iter()
                .map(|l| LayerShape::from_layer(&l))
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };
        let output_layers = match executable.output_layers() {
            Some(layers) => layers
                .iter()
                .map(|l| OutputLayer::new(&l))
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };

        let mut this = EdgeTpuExecutable {
            version: executable.version(),
            name: executable.name().unwrap_or_default().to_string(),
            chip: executable.chip().unwrap_or_default().to_string(),
            executable_type,
            parameter_caching_token: executable.parameter_caching_token(),
            bitstreams,
            parameters,
            steps: Vec::new(),
            fully_deterministic: false,
            input_layers,
            output_layers,
            scratch: Vec::new(),
        };
        if let Some(hints) = executable.dma_hints() {
            this.fully_deterministic = hints.fully_deterministic();
            if let Some(list) = hints.hints() {
                for hint in list.iter() {
                    if let Some(step) = this.decode_hint(&hint)? {
                        this.steps.push(step);
                    }
                }
            }
        }
        trace!(
            "Executable {} {:?}: {} steps, {} inputs, {} outputs",
            this.name,
            this.executable_type,
            this.steps.len(),
            this.input_layers.len(),
            this.output_layers.len()
        );
        Ok(this)
    }

    fn decode_hint(&self, hint: &schema::DmaHint) -> Result<Option<DmaStep>, EdgeTpuError> {
        if let Some(descriptor) = hint.any_hint_as_dma_descriptor_hint() {
            let Some(meta) = descriptor.meta() else {
                return Err(EdgeTpuError::InvalidPackage);
            };
            let offset = to_usize(descriptor.offset_in_bytes())?;
            let size = to_usize(descriptor.size_in_bytes())?;
            let name = meta.name().unwrap_or_default();
            let step = match Description::try_from(meta.desc()) {
                Ok(Description::Parameter) => {
                    if offset + size > self.parameters.len() {
                        error!("Parameter hint {}+{} overruns parameters", offset, size);
                        return Err(EdgeTpuError::InvalidPackage);
                    }
                    DmaStep::Parameters { offset, size }
                }
                Ok(Description::InputActivation) => DmaStep::Inputs {
                    layer: self.input_layers.iter().position(|l| l.name == name),
                    offset,
                    size,
                },
                Ok(Description::OutputActivation) => {
                    let Some(layer) = self.output_layers.iter().position(|l| l.shape.name == name)
                    else {
                        error!("Executable does not have output layer {}", name);
                        return Err(EdgeTpuError::InvalidPackage);
                    };
                    if offset + size > self.output_layers[layer].buffer.len() {
                        error!("Output hint {}+{} overruns layer {}", offset, size, name);
                        return Err(EdgeTpuError::InvalidPackage);
                    }
                    DmaStep::Outputs {
                        layer,
                        offset,
                        size,
                    }
                }
                Ok(Description::Scratch) | Err(_) => return Ok(None),
            };
            return Ok(Some(step));
        }
        if let Some(instruction) = hint.any_hint_as_instruction_hint() {
            let chunk = to_usize(instruction.instruction_chunk_index())?;
            if chunk >= self.bitstreams.len() {
                error!("Instruction hint names missing chunk {}", chunk);
                return Err(EdgeTpuError::InvalidPackage);
            }
            return Ok(Some(DmaStep::Instructions { chunk }));
        }
        Ok(None)
    }

    pub fn version(&self) -> i32 { self.version }
    pub fn name(&self) -> &str { &self.name }
    pub fn chip(&self) -> &str { &self.chip }
    pub fn executable_type(&self) -> ExecutableType { self.executable_type }
    pub fn parameter_caching_token(&self) -> u64 { self.parameter_caching_token }
    pub fn instruction_bitstreams(&self) -> &[Vec<u8>] { &self.bitstreams }
    pub fn parameters(&self) -> &[u8] { &self.parameters }
    pub fn steps(&self) -> &[DmaStep] { &self.steps }
    pub fn fully_deterministic(&self) -> bool { self.fully_deterministic }
    pub fn input_layers(&self) -> &[LayerShape] { &self.input_layers }
    pub fn output_layers(&self) -> &[OutputLayer] { &self.output_layers }

    /// Runs the program: streams every hinted transfer, waits for the
    /// completion event and relayouts the outputs into |node|.
    pub fn invoke(
        &mut self,
        driver: &TpuDriver,
        node: &mut dyn TfLiteNode,
    ) -> Result<(), EdgeTpuError> {
        // Node input currently biased into scratch.
        let mut staged: Option<usize> = None;

        for step in &self.steps {
            match *step {
                DmaStep::Instructions { chunk } => {
                    driver.send_instructions(&self.bitstreams[chunk])?;
                }
                DmaStep::Parameters { offset, size } => {
                    driver.send_parameters(&self.parameters[offset..offset + size])?;
                }
                DmaStep::Inputs {
                    layer,
                    offset,
                    size,
                } => {
                    let index = layer.unwrap_or(0);
                    let input = node.input(index).ok_or_else(|| {
                        error!("Missing input tensor {}", index);
                        EdgeTpuError::InvalidTensor
                    })?;
                    let shape = layer.map(|l| &self.input_layers[l]);
                    let data = match shape {
                        Some(shape) if shape.data_type.is_signed() => {
                            if staged != Some(index) {
                                self.scratch.clear();
                                self.scratch.extend_from_slice(input);
                                shape.transform_signed(&mut self.scratch);
                                staged = Some(index);
                            }
                            self.scratch.as_slice()
                        }
                        _ => input,
                    };
                    let data = data.get(offset..offset + size).ok_or_else(|| {
                        error!("Input {} too small for {}+{}", index, offset, size);
                        EdgeTpuError::InvalidTensor
                    })?;
                    driver.send_inputs(data)?;
                }
                DmaStep::Outputs {
                    layer,
                    offset,
                    size,
                } => {
                    let buffer = &mut self.output_layers[layer].buffer;
                    driver.get_outputs(&mut buffer[offset..offset + size])?;
                }
            }
        }

        driver.read_event()?;

        if self.output_layers.is_empty() {
            return Ok(());
        }
        for i in 0..node.outputs() {
            let layer = self.output_layers.get(i).ok_or_else(|| {
                error!("No output layer for tensor {}", i);
                EdgeTpuError::InvalidTensor
            })?;
            let dest = node.output_mut(i).ok_or(EdgeTpuError::InvalidTensor)?;
            layer.relayout(dest)?;
            layer.transform_signed(dest);
        }
        Ok(())
    }
}
