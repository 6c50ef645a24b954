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

//! Multiplexes one Edge TPU across every interpreter in the system. The
//! manager owns the driver, the registered packages and the parameter
//! cache; an EdgeTpuContext keeps the accelerator powered for as long as
//! any task holds one.

extern crate alloc;

use alloc::sync::{Arc, Weak};
use edgetpu_driver::TpuDriver;
use edgetpu_executable::EdgeTpuPackage;
use edgetpu_interface::*;
use edgetpu_shared::*;
use log::{error, info, trace, warn};
use spin::{Mutex, MutexGuard};

pub mod cache;
pub mod config;
pub mod power;
pub mod registry;

use cache::{CacheLookup, ParameterCache};
pub use config::EdgeTpuConfig;
pub use power::PowerRail;
use registry::PackageRegistry;

/// Counters reported by EdgeTpuManager::statistics.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ManagerStatistics {
    pub power_ups: u32,
    pub power_downs: u32,
    pub parameter_transfers: u32,
    pub cache_hits: u32,
    pub invokes: u32,
    pub invoke_failures: u32,
    pub live_packages: usize,
}

/// The accelerator is powered and claimed while any clone of this is
/// alive. Obtained from EdgeTpuManager::open_device.
pub struct EdgeTpuContext {
    manager: Arc<EdgeTpuManager>,
    session: u64,
    mode: PerformanceMode,
}
impl EdgeTpuContext {
    /// Mode the accelerator was brought up in.
    pub fn mode(&self) -> PerformanceMode { self.mode }
}
impl Drop for EdgeTpuContext {
    fn drop(&mut self) { self.manager.close_session(self.session); }
}

struct ManagerState {
    driver: Option<TpuDriver>,
    context: Weak<EdgeTpuContext>,
    // Identifies the power cycle a context belongs to.
    session: u64,
    powered: bool,
    registry: PackageRegistry,
    cache: ParameterCache,
    statistics: ManagerStatistics,
}

pub struct EdgeTpuManager {
    config: EdgeTpuConfig,
    power: Arc<PowerRail>,
    clock: Arc<dyn SystemClock>,
    // NB: separate from |state| so the USB host stack can attach while
    // open_device holds the state lock waiting for it.
    usb: Mutex<Option<Arc<dyn UsbHostEdgeTpu>>>,
    state: Mutex<ManagerState>,
}
impl EdgeTpuManager {
    pub fn new(
        power: Arc<PowerRail>,
        clock: Arc<dyn SystemClock>,
        config: EdgeTpuConfig,
    ) -> Arc<Self> {
        Arc::new(EdgeTpuManager {
            config,
            power,
            clock,
            usb: Mutex::new(None),
            state: Mutex::new(ManagerState {
                driver: None,
                context: Weak::new(),
                session: 0,
                powered: false,
                registry: PackageRegistry::new(),
                cache: ParameterCache::new(),
                statistics: ManagerStatistics::default(),
            }),
        })
    }

    /// A manager configured from the persisted form of EdgeTpuConfig.
    pub fn from_stored_config(
        power: Arc<PowerRail>,
        clock: Arc<dyn SystemClock>,
        stored: Option<&[u8]>,
    ) -> Arc<Self> {
        Self::new(power, clock, EdgeTpuConfig::load(stored))
    }

    pub fn config(&self) -> &EdgeTpuConfig { &self.config }

    // NB: an invoke holds the state for a whole inference; waiters yield
    // through the clock so a preempted holder gets to run.
    fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        loop {
            if let Some(guard) = self.state.try_lock() {
                return guard;
            }
            self.clock.relax();
        }
    }

    /// Attach/detach notification from the USB host stack.
    pub fn notify_connected(&self, usb: Option<Arc<dyn UsbHostEdgeTpu>>) {
        info!("Edge TPU {}", if usb.is_some() { "attached" } else { "detached" });
        *self.usb.lock() = usb;
    }

    fn wait_for_device(&self) -> Option<Arc<dyn UsbHostEdgeTpu>> {
        let deadline = self.clock.now() + self.config.connect_timeout;
        loop {
            if let Some(usb) = self.usb.lock().clone() {
                return Some(usb);
            }
            if self.clock.now() >= deadline {
                return None;
            }
            self.clock.relax();
        }
    }

    /// Returns the live context, or powers up and initializes the
    /// accelerator at |mode| and returns a new one. |mode| is ignored when
    /// a context is already live.
    pub fn open_device(
        self: &Arc<Self>,
        mode: PerformanceMode,
    ) -> Result<Arc<EdgeTpuContext>, EdgeTpuError> {
        let mut state = self.lock_state();
        if let Some(context) = state.context.upgrade() {
            return Ok(context);
        }
        if state.powered {
            // The last owner is still inside Drop; finish the teardown for
            // it so its close_session finds a newer session.
            trace!("Completing teardown of session {}", state.session);
            self.teardown(&mut state);
        }

        if let Err(e) = self.power.acquire() {
            error!("Edge TPU power on failed: {:?}", e);
            return Err(EdgeTpuError::DeviceUnavailable);
        }
        let Some(usb) = self.wait_for_device() else {
            error!("Edge TPU did not enumerate");
            self.power.release();
            return Err(EdgeTpuError::DeviceUnavailable);
        };
        let driver = TpuDriver::new(
            usb,
            self.clock.clone(),
            self.config.transfer_timeout,
            self.config.max_bulk_chunk,
        );
        if let Err(e) = driver.initialize(mode) {
            error!("Edge TPU initialize failed: {:?}", e);
            self.power.release();
            return Err(EdgeTpuError::DeviceUnavailable);
        }

        state.session += 1;
        state.powered = true;
        state.driver = Some(driver);
        state.cache.invalidate();
        state.statistics.power_ups += 1;
        let context = Arc::new(EdgeTpuContext {
            manager: self.clone(),
            session: state.session,
            mode,
        });
        state.context = Arc::downgrade(&context);
        info!("Edge TPU open, session {} mode {:?}", state.session, mode);
        Ok(context)
    }

    /// open_device with the configured default mode.
    pub fn open_default(self: &Arc<Self>) -> Result<Arc<EdgeTpuContext>, EdgeTpuError> {
        self.open_device(self.config.default_mode)
    }

    fn close_session(&self, session: u64) {
        let mut state = self.lock_state();
        if state.powered && state.session == session {
            self.teardown(&mut state);
        }
    }

    fn teardown(&self, state: &mut ManagerState) {
        state.driver = None;
        state.powered = false;
        // Power loss wipes the on-chip parameters.
        state.cache.invalidate();
        self.power.release();
        state.statistics.power_downs += 1;
        info!("Edge TPU closed, session {}", state.session);
    }

    /// Parses the custom-op initializer |buffer|, or takes another
    /// reference to the package already registered for it.
    pub fn register_package(&self, buffer: &[u8]) -> Result<PackageId, EdgeTpuError> {
        let key = buffer.as_ptr() as usize;
        self.lock_state()
            .registry
            .register(key, || EdgeTpuPackage::from_buffer(buffer))
    }

    /// Drops one reference to |id|; the last one frees the package.
    pub fn release_package(&self, id: PackageId) -> Result<(), EdgeTpuError> {
        let mut state = self.lock_state();
        if state.registry.release(id)? {
            state.cache.evict(id);
        }
        Ok(())
    }

    /// Runs package |id| over |node|'s tensors.
    pub fn invoke(&self, id: PackageId, node: &mut dyn TfLiteNode) -> TfLiteStatus {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        state.statistics.invokes += 1;
        let result = Self::invoke_locked(state, id, node);
        if let Err(e) = result {
            warn!("Invoke of {} failed: {:?}", id, e);
            state.statistics.invoke_failures += 1;
        }
        result.into()
    }

    fn invoke_locked(
        state: &mut ManagerState,
        id: PackageId,
        node: &mut dyn TfLiteNode,
    ) -> Result<(), EdgeTpuError> {
        let driver = state.driver.as_ref().ok_or(EdgeTpuError::NoContext)?;
        let package = state.registry.get_mut(id)?;

        match package.parameter_caching_token() {
            Some(token) => match state.cache.lookup(id, token) {
                CacheLookup::Hit => state.statistics.cache_hits += 1,
                CacheLookup::Miss { slot } => {
                    if let Some(executable) = package.parameter_caching_mut() {
                        executable.invoke(driver, node)?;
                    }
                    state.cache.install(slot, id, token);
                    state.statistics.parameter_transfers += 1;
                }
            },
            // Running a package without cached parameters overwrites
            // whatever was resident.
            None => state.cache.invalidate(),
        }

        package.inference_mut().invoke(driver, node)
    }

    /// Junction temperature in Celsius, if the accelerator is powered.
    pub fn get_temperature(&self) -> Option<f32> {
        let state = self.lock_state();
        let driver = state.driver.as_ref()?;
        match driver.temperature() {
            Ok(temperature) => Some(temperature),
            Err(e) => {
                warn!("Temperature read failed: {:?}", e);
                None
            }
        }
    }

    pub fn statistics(&self) -> ManagerStatistics {
        let state = self.lock_state();
        ManagerStatistics {
            live_packages: state.registry.len(),
            ..state.statistics
        }
    }

    pub fn debug_state(&self) {
        let state = self.lock_state();
        if state.powered {
            info!(target: "", "Edge TPU powered, session {}", state.session);
        } else {
            info!(target: "", "Edge TPU off");
        }
        info!(target: "", "USB {}", if self.usb.lock().is_some() { "attached" } else { "detached" });
        state.registry.debug_state();
        state.cache.debug_state();
        info!(target: "", "{:?}", state.statistics);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;
    use edgetpu_executable::builder::{ExecutableSpec, LayerSpec, PackageBuilder};
    use fake_edgetpu::{checksum, FakeEdgeTpu, FakeNode, FakePower, StdClock, TransferRecord};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Fixture {
        device: Arc<FakeEdgeTpu>,
        power: Arc<FakePower>,
        manager: Arc<EdgeTpuManager>,
    }

    fn fixture_with(device: Arc<FakeEdgeTpu>) -> Fixture {
        let power = FakePower::new(Some(device.clone()));
        let config = EdgeTpuConfig {
            connect_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let manager = EdgeTpuManager::new(
            PowerRail::new(power.clone()),
            Arc::new(StdClock::new()),
            config,
        );
        manager.notify_connected(Some(device.clone()));
        Fixture {
            device,
            power,
            manager,
        }
    }

    fn fixture() -> Fixture { fixture_with(FakeEdgeTpu::new()) }

    fn inference_only() -> Vec<u8> {
        PackageBuilder::new()
            .add(
                &ExecutableSpec::inference()
                    .parameters(&[9, 9, 9])
                    .input(LayerSpec::vector("in", 4))
                    .output(LayerSpec::vector("out", 4)),
            )
            .build()
    }

    fn cached(token: u64, parameters: &[u8]) -> Vec<u8> {
        PackageBuilder::new()
            .add(&ExecutableSpec::parameter_caching(token, parameters))
            .add(
                &ExecutableSpec::execution_only(token)
                    .input(LayerSpec::vector("in", 4))
                    .output(LayerSpec::vector("out", 4)),
            )
            .build()
    }

    fn run(manager: &EdgeTpuManager, id: PackageId, input: &[u8]) -> (TfLiteStatus, Vec<u8>) {
        let mut node = FakeNode::new(input, &[4]);
        let status = manager.invoke(id, &mut node);
        (status, node.outputs[0].clone())
    }

    #[test]
    fn single_live_context() {
        let f = fixture();
        let a = f.manager.open_device(PerformanceMode::High).unwrap();
        let b = f.manager.open_device(PerformanceMode::Low).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.mode(), PerformanceMode::High);
        assert_eq!(f.power.power_ons(), 1);
        assert_eq!(f.manager.statistics().power_ups, 1);
    }

    #[test]
    fn power_down_on_last_release() {
        let f = fixture();
        let a = f.manager.open_device(PerformanceMode::High).unwrap();
        let b = a.clone();
        drop(a);
        assert_eq!(f.power.power_offs(), 0);
        drop(b);
        assert_eq!(f.power.power_offs(), 1);

        let _c = f.manager.open_default().unwrap();
        assert_eq!(f.power.power_ons(), 2);
        assert_eq!(f.power.power_offs(), 1);
        let stats = f.manager.statistics();
        assert_eq!((stats.power_ups, stats.power_downs), (2, 1));
    }

    #[test]
    fn late_drop_after_reopen_is_ignored() {
        let f = fixture();
        let first = f.manager.open_default().unwrap();
        let session = first.session;
        // Simulate the last owner being mid-drop: the weak ref is dead but
        // close_session has not run yet.
        core::mem::forget(first);
        f.manager.state.lock().context = Weak::new();

        let _second = f.manager.open_default().unwrap();
        assert_eq!(f.power.power_offs(), 1);
        f.manager.close_session(session);
        assert_eq!(f.power.power_offs(), 1);
        assert_eq!(f.power.power_ons(), 2);
    }

    #[test]
    fn open_fails_without_device() {
        let f = fixture();
        f.manager.notify_connected(None);
        assert_eq!(
            f.manager.open_default().err(),
            Some(EdgeTpuError::DeviceUnavailable)
        );
        // The rail was released again.
        assert_eq!(f.power.power_ons(), 1);
        assert_eq!(f.power.power_offs(), 1);
    }

    #[test]
    fn open_fails_when_power_fails() {
        let f = fixture();
        f.power.set_fail_power_on(true);
        assert_eq!(
            f.manager.open_default().err(),
            Some(EdgeTpuError::DeviceUnavailable)
        );
        assert_eq!(f.power.power_offs(), 0);
        f.power.set_fail_power_on(false);
        assert!(f.manager.open_default().is_ok());
    }

    #[test]
    fn open_fails_when_device_drops_off() {
        let f = fixture();
        f.device.set_disconnected(true);
        assert_eq!(
            f.manager.open_default().err(),
            Some(EdgeTpuError::DeviceUnavailable)
        );
        assert_eq!(f.power.power_offs(), 1);
    }

    #[test]
    fn invoke_without_context_fails() {
        let f = fixture();
        let buffer = inference_only();
        let id = f.manager.register_package(&buffer).unwrap();
        assert_eq!(run(&f.manager, id, &[1, 2, 3, 4]).0, TfLiteStatus::Error);

        let context = f.manager.open_default().unwrap();
        assert_eq!(run(&f.manager, id, &[1, 2, 3, 4]).0, TfLiteStatus::Ok);
        drop(context);
        assert_eq!(run(&f.manager, id, &[1, 2, 3, 4]).0, TfLiteStatus::Error);
        assert_eq!(f.manager.statistics().invoke_failures, 2);
    }

    #[test]
    fn repeated_invokes_are_deterministic() {
        let f = fixture();
        let _context = f.manager.open_default().unwrap();
        let buffer = inference_only();
        let id = f.manager.register_package(&buffer).unwrap();
        let input = [10, 20, 30, 40];
        let results: Vec<_> = (0..3).map(|_| run(&f.manager, id, &input)).collect();
        for (status, output) in &results {
            assert_eq!(*status, TfLiteStatus::Ok);
            assert_eq!(*output, results[0].1);
        }
        assert_eq!(results[0].1, f.device.expected_output(&input, 4));
        // Stand-alone parameters go with every inference.
        assert_eq!(f.device.stats().parameter_transfers, 3);
    }

    #[test]
    fn cache_hit_avoids_retransfer() {
        let f = fixture();
        let _context = f.manager.open_default().unwrap();
        let buffer = cached(1, &[1, 2, 3]);
        let id = f.manager.register_package(&buffer).unwrap();
        assert_eq!(run(&f.manager, id, &[0; 4]).0, TfLiteStatus::Ok);
        assert_eq!(run(&f.manager, id, &[0; 4]).0, TfLiteStatus::Ok);
        assert_eq!(f.device.stats().parameter_transfers, 1);
        let stats = f.manager.statistics();
        assert_eq!((stats.parameter_transfers, stats.cache_hits), (1, 1));
    }

    #[test]
    fn round_robin_of_three_packages_retransfers() {
        let f = fixture();
        let _context = f.manager.open_default().unwrap();
        let buffers = [cached(1, &[1]), cached(1, &[2]), cached(1, &[3])];
        let ids: Vec<_> = buffers
            .iter()
            .map(|b| f.manager.register_package(b).unwrap())
            .collect();
        for _ in 0..3 {
            for id in &ids {
                assert_eq!(run(&f.manager, *id, &[0; 4]).0, TfLiteStatus::Ok);
            }
        }
        // Every call transferred, and always the caller's own parameters.
        let log = f.device.stats().parameter_log;
        assert_eq!(log, [1, 2, 3, 1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn two_packages_fit_in_the_cache() {
        let f = fixture();
        let _context = f.manager.open_default().unwrap();
        let a = cached(5, &[1]);
        let b = cached(5, &[2]);
        let a = f.manager.register_package(&a).unwrap();
        let b = f.manager.register_package(&b).unwrap();
        for _ in 0..3 {
            run(&f.manager, a, &[0; 4]);
            run(&f.manager, b, &[0; 4]);
        }
        assert_eq!(f.device.stats().parameter_log, [1, 2]);
    }

    #[test]
    fn package_without_caching_invalidates() {
        let f = fixture();
        let _context = f.manager.open_default().unwrap();
        let a = cached(5, &[1]);
        let plain = inference_only();
        let a = f.manager.register_package(&a).unwrap();
        let plain = f.manager.register_package(&plain).unwrap();
        run(&f.manager, a, &[0; 4]);
        run(&f.manager, plain, &[0; 4]);
        run(&f.manager, a, &[0; 4]);
        let log = f.device.stats().parameter_log;
        assert_eq!(log, [1, 27, 1]);
    }

    #[test]
    fn failure_leaves_manager_usable() {
        let f = fixture();
        let _context = f.manager.open_default().unwrap();
        let a = cached(1, &[1, 1]);
        let b = inference_only();
        let a = f.manager.register_package(&a).unwrap();
        let b = f.manager.register_package(&b).unwrap();

        // Fail the first transfer of the caching run.
        f.device.fail_next_bulk_out();
        assert_eq!(run(&f.manager, a, &[0; 4]).0, TfLiteStatus::Error);
        assert_eq!(run(&f.manager, a, &[0; 4]).0, TfLiteStatus::Ok);
        assert_eq!(f.device.stats().parameter_transfers, 1);

        f.device.fail_next_bulk_in();
        assert_eq!(run(&f.manager, b, &[0; 4]).0, TfLiteStatus::Error);
        assert_eq!(run(&f.manager, b, &[5, 6, 7, 8]).0, TfLiteStatus::Ok);
        assert_eq!(f.manager.statistics().live_packages, 2);
    }

    #[test]
    fn timeout_is_an_error() {
        let f = fixture();
        let _context = f.manager.open_default().unwrap();
        let buffer = inference_only();
        let id = f.manager.register_package(&buffer).unwrap();
        f.device.drop_next_completion();
        assert_eq!(run(&f.manager, id, &[0; 4]).0, TfLiteStatus::Error);
        assert_eq!(run(&f.manager, id, &[0; 4]).0, TfLiteStatus::Ok);
    }

    #[test]
    fn reopen_retransfers_parameters() {
        let f = fixture();
        let buffer = cached(3, &[4, 4]);
        let id = f.manager.register_package(&buffer).unwrap();

        let context = f.manager.open_default().unwrap();
        assert_eq!(run(&f.manager, id, &[0; 4]).0, TfLiteStatus::Ok);
        drop(context);
        let _context = f.manager.open_default().unwrap();
        assert_eq!(run(&f.manager, id, &[0; 4]).0, TfLiteStatus::Ok);
        assert_eq!(f.manager.statistics().parameter_transfers, 2);
        assert_eq!(f.device.stats().parameter_log, [8, 8]);
    }

    #[test]
    fn no_leak_across_load_unload_cycles() {
        let f = fixture();
        let _context = f.manager.open_default().unwrap();
        for i in 0..10u8 {
            let buffer = cached(1, &[i]);
            let id = f.manager.register_package(&buffer).unwrap();
            assert_eq!(run(&f.manager, id, &[i; 4]).0, TfLiteStatus::Ok);
            f.manager.release_package(id).unwrap();
            assert_eq!(f.manager.statistics().live_packages, 0);
            assert_eq!(f.manager.release_package(id), Err(EdgeTpuError::NoSuchPackage));
            assert_eq!(run(&f.manager, id, &[i; 4]).0, TfLiteStatus::Error);
        }
    }

    #[test]
    fn shared_buffer_is_refcounted() {
        let f = fixture();
        let buffer = inference_only();
        let a = f.manager.register_package(&buffer).unwrap();
        let b = f.manager.register_package(&buffer).unwrap();
        assert_eq!(a, b);
        f.manager.release_package(a).unwrap();
        assert_eq!(f.manager.statistics().live_packages, 1);
        f.manager.release_package(b).unwrap();
        assert_eq!(f.manager.statistics().live_packages, 0);
    }

    #[test]
    fn invalid_package_is_rejected() {
        let f = fixture();
        assert_eq!(
            f.manager.register_package(b"garbage!").err(),
            Some(EdgeTpuError::InvalidPackage)
        );
        assert_eq!(f.manager.statistics().live_packages, 0);
    }

    #[test]
    fn temperature_needs_context() {
        let f = fixture();
        assert_eq!(f.manager.get_temperature(), None);
        let context = f.manager.open_default().unwrap();
        f.device.set_raw_temperature(662);
        let t = f.manager.get_temperature().unwrap();
        assert!((t - 0.55).abs() < 1e-3);
        drop(context);
        assert_eq!(f.manager.get_temperature(), None);
        // Reading never powered the device.
        assert_eq!(f.power.power_ons(), 1);
    }

    #[test]
    fn asynchronous_completions() {
        let f = fixture_with(FakeEdgeTpu::new_async());
        let _context = f.manager.open_default().unwrap();
        let buffer = cached(2, &[7, 7]);
        let id = f.manager.register_package(&buffer).unwrap();
        let (status, output) = run(&f.manager, id, &[1, 2, 3, 4]);
        assert_eq!(status, TfLiteStatus::Ok);
        assert_eq!(output, f.device.expected_output(&[1, 2, 3, 4], 4));
    }

    #[test]
    fn concurrent_open_and_close() {
        let f = fixture();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let manager = f.manager.clone();
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        let context = manager.open_default().unwrap();
                        drop(context);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(f.power.power_ons(), f.power.power_offs());
        let stats = f.manager.statistics();
        assert_eq!(stats.power_ups, stats.power_downs);
        assert!(f.manager.get_temperature().is_none());
    }

    // Caching package |k| of a shared token: instructions [k; 16] to load
    // parameters [k; 8], then instructions [k | 0x80; 16] to infer.
    fn tagged(k: u8) -> Vec<u8> {
        let mut caching = ExecutableSpec::parameter_caching(5, &[k; 8]);
        caching.bitstreams = vec![vec![k; 16]];
        let mut inference = ExecutableSpec::execution_only(5)
            .input(LayerSpec::vector("in", 4))
            .output(LayerSpec::vector("out", 4));
        inference.bitstreams = vec![vec![k | 0x80; 16]];
        PackageBuilder::new().add(&caching).add(&inference).build()
    }

    #[test]
    fn concurrent_invokes_are_serialized() {
        const TASKS: u8 = 4;
        const ROUNDS: usize = 10;
        let f = fixture();
        let _context = f.manager.open_default().unwrap();
        let buffers: Vec<Vec<u8>> = (1..=TASKS).map(tagged).collect();
        let ids: Vec<PackageId> = buffers
            .iter()
            .map(|b| f.manager.register_package(b).unwrap())
            .collect();

        let stop = Arc::new(AtomicBool::new(false));
        let poller = {
            let manager = f.manager.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    assert!(manager.get_temperature().is_some());
                    std::thread::yield_now();
                }
            })
        };
        let tasks: Vec<_> = ids
            .iter()
            .zip(1..=TASKS)
            .map(|(&id, k)| {
                let manager = f.manager.clone();
                let device = f.device.clone();
                std::thread::spawn(move || {
                    for _ in 0..ROUNDS {
                        let mut node = FakeNode::new(&[k; 4], &[4]);
                        assert_eq!(manager.invoke(id, &mut node), TfLiteStatus::Ok);
                        assert_eq!(node.outputs[0], device.expected_output(&[k; 4], 4));
                    }
                })
            })
            .collect();
        for t in tasks {
            t.join().unwrap();
        }
        stop.store(true, Ordering::SeqCst);
        poller.join().unwrap();

        let stats = f.device.stats();
        assert_eq!(stats.interleaved, 0);
        // Split the device traffic into one run per event. A parameter load
        // must be immediately followed by an inference of the same package.
        let runs: Vec<&[TransferRecord]> = stats
            .transfer_log
            .split(|r| *r == TransferRecord::Event)
            .filter(|run| !run.is_empty())
            .collect();
        let load = |k: u8| {
            [
                TransferRecord::Payload(DescriptorTag::Instructions, checksum(&[k; 16])),
                TransferRecord::Payload(DescriptorTag::Parameters, checksum(&[k; 8])),
            ]
        };
        let infer = |k: u8| {
            [
                TransferRecord::Payload(DescriptorTag::Instructions, checksum(&[k | 0x80; 16])),
                TransferRecord::Payload(DescriptorTag::InputActivations, checksum(&[k; 4])),
            ]
        };
        let mut loads = 0;
        let mut inferences = 0;
        let mut pending_load = None;
        for run in runs {
            if let Some(k) = (1..=TASKS).find(|&k| run == load(k)) {
                assert_eq!(pending_load, None, "two parameter loads in a row");
                pending_load = Some(k);
                loads += 1;
            } else if let Some(k) = (1..=TASKS).find(|&k| run == infer(k)) {
                if let Some(loaded) = pending_load.take() {
                    assert_eq!(loaded, k, "parameters of {} ran before {}", loaded, k);
                }
                inferences += 1;
            } else {
                panic!("unexpected transfers {:?}", run);
            }
        }
        assert_eq!(pending_load, None);
        assert_eq!(inferences, TASKS as usize * ROUNDS);
        assert_eq!(loads, f.manager.statistics().parameter_transfers as usize);
        assert_eq!(stats.parameter_transfers, loads);
    }

    struct CountingClock {
        inner: StdClock,
        relaxes: AtomicUsize,
    }
    impl SystemClock for CountingClock {
        fn now(&self) -> Duration { self.inner.now() }
        fn relax(&self) {
            self.relaxes.fetch_add(1, Ordering::SeqCst);
            self.inner.relax();
        }
    }

    #[test]
    fn contended_state_waits_through_clock() {
        let device = FakeEdgeTpu::new();
        let clock = Arc::new(CountingClock {
            inner: StdClock::new(),
            relaxes: AtomicUsize::new(0),
        });
        let manager = EdgeTpuManager::new(
            PowerRail::new(FakePower::new(Some(device.clone()))),
            clock.clone(),
            EdgeTpuConfig::default(),
        );
        manager.notify_connected(Some(device));
        let _context = manager.open_default().unwrap();

        let guard = manager.state.lock();
        let before = clock.relaxes.load(Ordering::SeqCst);
        let waiter = {
            let manager = manager.clone();
            std::thread::spawn(move || manager.get_temperature())
        };
        while clock.relaxes.load(Ordering::SeqCst) == before {
            std::thread::yield_now();
        }
        drop(guard);
        assert!(waiter.join().unwrap().is_some());
    }

    #[test]
    fn stored_config_is_applied() {
        let config = EdgeTpuConfig {
            connect_timeout: Duration::from_millis(5),
            default_mode: PerformanceMode::Low,
            ..Default::default()
        };
        let mut buf = [0u8; 64];
        let stored = config.to_slice(&mut buf).unwrap();
        let device = FakeEdgeTpu::new();
        let manager = EdgeTpuManager::from_stored_config(
            PowerRail::new(FakePower::new(Some(device.clone()))),
            Arc::new(StdClock::new()),
            Some(stored),
        );
        assert_eq!(*manager.config(), config);
        manager.notify_connected(Some(device));
        assert_eq!(manager.open_default().unwrap().mode(), PerformanceMode::Low);

        let fallback = EdgeTpuManager::from_stored_config(
            PowerRail::new(FakePower::new(None)),
            Arc::new(StdClock::new()),
            Some(&[0xff, 0xff]),
        );
        assert_eq!(*fallback.config(), EdgeTpuConfig::default());
    }
}
