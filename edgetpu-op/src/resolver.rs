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

//! A minimal stand-in for the interpreter side of the custom-op contract:
//! a fixed-size table of named ops and the per-node init/prepare/invoke/free
//! sequence the interpreter drives.

use alloc::sync::Arc;
use edgetpu_interface::{CustomOp, TfLiteNode, TfLiteStatus};
use edgetpu_shared::PackageId;
use log::error;

type Registration = (&'static str, Arc<dyn CustomOp>);

pub struct OpResolver<const N: usize> {
    ops: [Option<Registration>; N],
}
impl<const N: usize> OpResolver<N> {
    pub fn new() -> Self {
        // NB: The repeat operand requires a const item.
        const INIT_NONE: Option<Registration> = None;
        OpResolver {
            ops: [INIT_NONE; N],
        }
    }

    /// Adds |op| under |name|. Fails on a duplicate name or a full table.
    pub fn add_custom(&mut self, name: &'static str, op: Arc<dyn CustomOp>) -> TfLiteStatus {
        if self.find(name).is_some() {
            error!("Op {} already registered", name);
            return TfLiteStatus::Error;
        }
        match self.ops.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some((name, op));
                TfLiteStatus::Ok
            }
            None => {
                error!("No room for op {}", name);
                TfLiteStatus::Error
            }
        }
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn CustomOp>> {
        self.ops
            .iter()
            .flatten()
            .find(|(n, _)| *n == name)
            .map(|(_, op)| op.clone())
    }

    pub fn len(&self) -> usize { self.ops.iter().flatten().count() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}
impl<const N: usize> Default for OpResolver<N> {
    fn default() -> Self { Self::new() }
}

/// One node's use of a custom op. Dropping it frees the op's user data.
pub struct OpInstance {
    op: Arc<dyn CustomOp>,
    user_data: Option<PackageId>,
    prepared: bool,
}
impl OpInstance {
    /// Runs the op's init over the node's initializer |buffer|.
    pub fn new(op: Arc<dyn CustomOp>, buffer: &[u8]) -> Self {
        let user_data = op.init(buffer);
        OpInstance {
            op,
            user_data,
            prepared: false,
        }
    }

    pub fn user_data(&self) -> Option<PackageId> { self.user_data }

    pub fn prepare(&mut self, node: &dyn TfLiteNode) -> TfLiteStatus {
        let status = self.op.prepare(self.user_data, node);
        self.prepared = status == TfLiteStatus::Ok;
        status
    }

    pub fn invoke(&mut self, node: &mut dyn TfLiteNode) -> TfLiteStatus {
        if !self.prepared {
            error!("Invoke before a successful prepare");
            return TfLiteStatus::Error;
        }
        self.op.invoke(self.user_data, node)
    }
}
impl Drop for OpInstance {
    fn drop(&mut self) { self.op.free(self.user_data.take()); }
}
