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

use crate::envelope::{FlexMap, CHIP_KEY, EXECUTABLE_KEY};
use crate::executable::EdgeTpuExecutable;
use crate::schema;
use edgetpu_interface::EdgeTpuError;
use edgetpu_shared::ExecutableType;
use log::{error, trace};

/// The executables compiled for one model: the one that runs inferences
/// and, optionally, the one that loads its cached parameters.
pub struct EdgeTpuPackage {
    inference: EdgeTpuExecutable,
    parameter_caching: Option<EdgeTpuExecutable>,
}
impl EdgeTpuPackage {
    pub fn new(
        inference: EdgeTpuExecutable,
        parameter_caching: Option<EdgeTpuExecutable>,
    ) -> Self {
        EdgeTpuPackage {
            inference,
            parameter_caching,
        }
    }

    /// Decodes the custom-op initializer |buffer|.
    pub fn from_buffer(buffer: &[u8]) -> Result<Self, EdgeTpuError> {
        let map = FlexMap::root(buffer).ok_or_else(|| {
            error!("Custom op data is not a flexbuffer map");
            EdgeTpuError::InvalidPackage
        })?;
        let package_bytes = map
            .get(EXECUTABLE_KEY)
            .and_then(|v| v.as_bytes())
            .ok_or_else(|| {
                error!("Custom op data has no executable");
                EdgeTpuError::InvalidPackage
            })?;
        if let Some(chip) = map.get(CHIP_KEY).and_then(|v| v.as_bytes()) {
            trace!("Package compiled for {:?}", core::str::from_utf8(chip));
        }

        let package = flatbuffers::root::<schema::Package>(package_bytes).map_err(|e| {
            error!("Package failed verification: {:?}", e);
            EdgeTpuError::InvalidPackage
        })?;
        trace!("Package needs runtime {}", package.min_runtime_version());
        let multi_bytes = package.serialized_multi_executable().ok_or_else(|| {
            error!("Package has no executables");
            EdgeTpuError::InvalidPackage
        })?;
        let multi_executable = flatbuffers::root::<schema::MultiExecutable>(multi_bytes.bytes())
            .map_err(|e| {
                error!("MultiExecutable failed verification: {:?}", e);
                EdgeTpuError::InvalidPackage
            })?;

        let mut inference = None;
        let mut parameter_caching = None;
        if let Some(serialized) = multi_executable.serialized_executables() {
            for data in serialized.iter() {
                let executable = EdgeTpuExecutable::new(data.bytes())?;
                // The last executable of each kind wins.
                match executable.executable_type() {
                    ExecutableType::ParameterCaching => parameter_caching = Some(executable),
                    ExecutableType::StandAlone | ExecutableType::ExecutionOnly => {
                        inference = Some(executable)
                    }
                }
            }
        }
        let inference = inference.ok_or_else(|| {
            error!("Package has no inference executable");
            EdgeTpuError::NoInferenceExecutable
        })?;
        Ok(EdgeTpuPackage::new(inference, parameter_caching))
    }

    pub fn inference(&self) -> &EdgeTpuExecutable { &self.inference }
    pub fn inference_mut(&mut self) -> &mut EdgeTpuExecutable { &mut self.inference }

    pub fn parameter_caching(&self) -> Option<&EdgeTpuExecutable> {
        self.parameter_caching.as_ref()
    }
    pub fn parameter_caching_mut(&mut self) -> Option<&mut EdgeTpuExecutable> {
        self.parameter_caching.as_mut()
    }

    /// Token identifying the parameters this package caches on-chip.
    pub fn parameter_caching_token(&self) -> Option<u64> {
        self.parameter_caching.as_ref().map(|e| e.parameter_caching_token())
    }
}
