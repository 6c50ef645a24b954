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

//! Edge TPU packages: the flexbuffer envelope handed to the custom op, the
//! flatbuffer executables inside it, and running those executables
//! through a TpuDriver.

extern crate alloc;

pub mod builder;
pub mod envelope;
pub mod executable;
pub mod package;
pub mod schema;

pub use executable::{DmaStep, EdgeTpuExecutable, LayerShape, OutputLayer};
pub use package::EdgeTpuPackage;
