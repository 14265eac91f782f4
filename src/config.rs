/*
 * Copyright 2026 Google LLC All Rights Reserved.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::{net::SocketAddr, time::Duration};

/// Process-wide configuration, read once at startup.
#[derive(Clone, Debug, clap::Args)]
#[command(next_help_heading = "Controller Options")]
pub struct Config {
    /// Amount of workers processing the controller's work queue.
    #[clap(long = "workers", env = "AGON_WORKERS", default_value_t = 64)]
    pub workers: usize,

    /// Seconds between full re-enqueues of every cached set.
    #[clap(
        long = "resync-seconds",
        env = "AGON_RESYNC_SECONDS",
        default_value_t = 30
    )]
    pub resync_seconds: u64,

    /// The address the health and metrics endpoint binds.
    #[clap(
        long = "admin-address",
        env = "AGON_ADMIN_ADDRESS",
        default_value = "[::]:8080"
    )]
    pub admin_address: SocketAddr,

    /// The address the admission webhook endpoint binds.
    #[clap(
        long = "webhook-address",
        env = "AGON_WEBHOOK_ADDRESS",
        default_value = "[::]:8081"
    )]
    pub webhook_address: SocketAddr,

    /// The namespace to watch. Watches every namespace when unset.
    #[clap(long = "namespace", env = "AGON_NAMESPACE")]
    pub namespace: Option<String>,
}

impl Config {
    /// Ensures the configuration is runnable.
    pub fn validate(&self) -> crate::Result<()> {
        if self.workers == 0 {
            eyre::bail!("at least one worker is required");
        }
        if self.resync_seconds == 0 {
            eyre::bail!("the resync period must not be zero");
        }
        Ok(())
    }

    pub fn resync(&self) -> Duration {
        Duration::from_secs(self.resync_seconds)
    }
}
