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

use alloc::sync::Arc;
use edgetpu_interface::{EdgeTpuError, PowerControl};
use log::{error, trace};
use spin::Mutex;

/// Reference-counted claim on the accelerator's power rail. The rail is
/// enabled by the first user and disabled when the last one releases it.
pub struct PowerRail {
    control: Arc<dyn PowerControl>,
    users: Mutex<usize>,
}
impl PowerRail {
    pub fn new(control: Arc<dyn PowerControl>) -> Arc<Self> {
        Arc::new(PowerRail {
            control,
            users: Mutex::new(0),
        })
    }

    pub fn acquire(&self) -> Result<(), EdgeTpuError> {
        let mut users = self.users.lock();
        if *users == 0 {
            self.control.set_power(true)?;
            trace!("Power on");
        }
        *users += 1;
        Ok(())
    }

    pub fn release(&self) {
        let mut users = self.users.lock();
        match *users {
            0 => error!("Power released with no users"),
            1 => {
                if let Err(e) = self.control.set_power(false) {
                    error!("Power off failed: {:?}", e);
                }
                trace!("Power off");
                *users = 0;
            }
            _ => *users -= 1,
        }
    }

    pub fn users(&self) -> usize { *self.users.lock() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fake_edgetpu::FakePower;

    #[test]
    fn first_and_last_user_switch_power() {
        let fake = FakePower::new(None);
        let rail = PowerRail::new(fake.clone());
        rail.acquire().unwrap();
        rail.acquire().unwrap();
        assert_eq!(fake.power_ons(), 1);
        rail.release();
        assert_eq!(fake.power_offs(), 0);
        rail.release();
        assert_eq!(fake.power_offs(), 1);
        assert_eq!(rail.users(), 0);

        // Unbalanced release is ignored.
        rail.release();
        assert_eq!(fake.power_offs(), 1);
    }

    #[test]
    fn failed_power_on_takes_no_claim() {
        let fake = FakePower::new(None);
        let rail = PowerRail::new(fake.clone());
        fake.set_fail_power_on(true);
        assert_eq!(rail.acquire(), Err(EdgeTpuError::PowerFailed));
        assert_eq!(rail.users(), 0);
        fake.set_fail_power_on(false);
        rail.acquire().unwrap();
        assert_eq!(fake.power_ons(), 1);
    }
}
