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

//! The "edgetpu-custom-op" TFLite-Micro kernel. Each model's compiled
//! accelerator program arrives as the op's initializer buffer; the op keeps
//! the manager's package id as its user data.

extern crate alloc;

use alloc::sync::Arc;
use edgetpu_interface::{CustomOp, TfLiteNode, TfLiteStatus};
use edgetpu_manager::EdgeTpuManager;
use edgetpu_shared::{PackageId, CUSTOM_OP_NAME};
use log::{error, trace, warn};

pub mod resolver;
pub use resolver::{OpInstance, OpResolver};

pub struct EdgeTpuOp {
    manager: Arc<EdgeTpuManager>,
}
impl EdgeTpuOp {
    pub fn new(manager: Arc<EdgeTpuManager>) -> Self { EdgeTpuOp { manager } }
}
impl CustomOp for EdgeTpuOp {
    fn init(&self, buffer: &[u8]) -> Option<PackageId> {
        match self.manager.register_package(buffer) {
            Ok(id) => {
                trace!("init -> {}", id);
                Some(id)
            }
            Err(e) => {
                error!("Failed to register package: {:?}", e);
                None
            }
        }
    }

    fn free(&self, user_data: Option<PackageId>) {
        if let Some(id) = user_data {
            if let Err(e) = self.manager.release_package(id) {
                warn!("free of {} failed: {:?}", id, e);
            }
        }
    }

    fn prepare(&self, user_data: Option<PackageId>, _node: &dyn TfLiteNode) -> TfLiteStatus {
        match user_data {
            Some(_) => TfLiteStatus::Ok,
            None => TfLiteStatus::Error,
        }
    }

    fn invoke(&self, user_data: Option<PackageId>, node: &mut dyn TfLiteNode) -> TfLiteStatus {
        match user_data {
            Some(id) => self.manager.invoke(id, node),
            None => TfLiteStatus::Error,
        }
    }
}

/// Adds the Edge TPU op to |resolver| under CUSTOM_OP_NAME.
pub fn register_custom_op<const N: usize>(
    resolver: &mut OpResolver<N>,
    manager: Arc<EdgeTpuManager>,
) -> TfLiteStatus {
    resolver.add_custom(CUSTOM_OP_NAME, Arc::new(EdgeTpuOp::new(manager)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;
    use edgetpu_executable::builder::{ExecutableSpec, LayerSpec, PackageBuilder};
    use edgetpu_manager::{EdgeTpuConfig, PowerRail};
    use fake_edgetpu::{FakeEdgeTpu, FakeNode, FakePower, StdClock};

    fn setup() -> (Arc<FakeEdgeTpu>, Arc<EdgeTpuManager>, OpResolver<4>) {
        let device = FakeEdgeTpu::new();
        let power = FakePower::new(Some(device.clone()));
        let config = EdgeTpuConfig {
            connect_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let manager = EdgeTpuManager::new(
            PowerRail::new(power),
            Arc::new(StdClock::new()),
            config,
        );
        manager.notify_connected(Some(device.clone()));
        let mut resolver = OpResolver::new();
        assert_eq!(register_custom_op(&mut resolver, manager.clone()), TfLiteStatus::Ok);
        (device, manager, resolver)
    }

    fn model() -> Vec<u8> {
        PackageBuilder::new()
            .add(&ExecutableSpec::parameter_caching(9, &[1, 2, 3]))
            .add(
                &ExecutableSpec::execution_only(9)
                    .input(LayerSpec::vector("in", 4))
                    .output(LayerSpec::vector("out", 4)),
            )
            .build()
    }

    #[test]
    fn resolver_rejects_duplicates() {
        let (_device, manager, mut resolver) = setup();
        assert_eq!(resolver.len(), 1);
        assert_eq!(
            register_custom_op(&mut resolver, manager.clone()),
            TfLiteStatus::Error
        );
        assert!(resolver.find(CUSTOM_OP_NAME).is_some());
        assert!(resolver.find("other").is_none());
    }

    #[test]
    fn resolver_full() {
        let (_device, manager, _) = setup();
        let mut resolver: OpResolver<1> = OpResolver::new();
        let op: Arc<dyn CustomOp> = Arc::new(EdgeTpuOp::new(manager));
        assert_eq!(resolver.add_custom("a", op.clone()), TfLiteStatus::Ok);
        assert_eq!(resolver.add_custom("b", op), TfLiteStatus::Error);
    }

    #[test]
    fn end_to_end_invoke() {
        let (device, manager, resolver) = setup();
        let _context = manager.open_default().unwrap();
        let buffer = model();
        let op = resolver.find(CUSTOM_OP_NAME).unwrap();

        let mut instance = OpInstance::new(op, &buffer);
        let mut node = FakeNode::new(&[1, 2, 3, 4], &[4]);
        assert_eq!(instance.prepare(&node), TfLiteStatus::Ok);
        for _ in 0..3 {
            assert_eq!(instance.invoke(&mut node), TfLiteStatus::Ok);
            assert_eq!(node.outputs[0], device.expected_output(&[1, 2, 3, 4], 4));
        }
        assert_eq!(device.stats().parameter_transfers, 1);
    }

    #[test]
    fn bad_model_fails_prepare() {
        let (_device, manager, resolver) = setup();
        let _context = manager.open_default().unwrap();
        let op = resolver.find(CUSTOM_OP_NAME).unwrap();
        let mut instance = OpInstance::new(op, b"not a model");
        assert_eq!(instance.user_data(), None);
        let mut node = FakeNode::new(&[0; 4], &[4]);
        assert_eq!(instance.prepare(&node), TfLiteStatus::Error);
        assert_eq!(instance.invoke(&mut node), TfLiteStatus::Error);
    }

    #[test]
    fn invoke_without_device_fails() {
        let (_device, _manager, resolver) = setup();
        let buffer = model();
        let op = resolver.find(CUSTOM_OP_NAME).unwrap();
        let mut instance = OpInstance::new(op, &buffer);
        let mut node = FakeNode::new(&[0; 4], &[4]);
        assert_eq!(instance.prepare(&node), TfLiteStatus::Ok);
        assert_eq!(instance.invoke(&mut node), TfLiteStatus::Error);
    }

    #[test]
    fn interpreters_share_and_free_packages() {
        let (_device, manager, resolver) = setup();
        let _context = manager.open_default().unwrap();
        let op = resolver.find(CUSTOM_OP_NAME).unwrap();
        let buffer = model();

        for _ in 0..5 {
            // Two interpreters built over the same model.
            let a = OpInstance::new(op.clone(), &buffer);
            let b = OpInstance::new(op.clone(), &buffer);
            assert_eq!(a.user_data(), b.user_data());
            assert_eq!(manager.statistics().live_packages, 1);
            drop(a);
            assert_eq!(manager.statistics().live_packages, 1);
            drop(b);
            assert_eq!(manager.statistics().live_packages, 0);
        }
    }
}
