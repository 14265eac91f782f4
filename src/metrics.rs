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

use once_cell::sync::Lazy;
use prometheus::{
    core::Collector, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts,
    Registry,
};

const SUBSYSTEM: &str = "gameserversets";
pub(crate) const FLEET_NAME_LABEL: &str = "fleet_name";
pub(crate) const RESULT_LABEL: &str = "result";

/// Returns the process-wide metrics [`Registry`].
pub fn registry() -> &'static Registry {
    static REGISTRY: Lazy<Registry> =
        Lazy::new(|| Registry::new_custom(Some("agon".into()), None).unwrap());

    &REGISTRY
}

/// Registers the collector with the process registry, returning it for
/// storage in a static.
pub fn register<T: Collector + Clone + 'static>(collector: T) -> T {
    registry().register(Box::new(collector.clone())).unwrap();
    collector
}

pub fn opts(name: &str, subsystem: &str, description: &str) -> Opts {
    Opts::new(name, description).subsystem(subsystem)
}

pub fn histogram_opts(
    name: &str,
    subsystem: &str,
    description: &str,
    buckets: Vec<f64>,
) -> HistogramOpts {
    HistogramOpts {
        common_opts: opts(name, subsystem, description),
        buckets,
    }
}

pub(crate) fn enqueues_total(fleet_name: &str) -> IntCounter {
    static ENQUEUES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
        register(
            IntCounterVec::new(
                opts(
                    "controller_enqueues_total",
                    SUBSYSTEM,
                    "number of controller enqueues per fleet",
                ),
                &[FLEET_NAME_LABEL],
            )
            .unwrap(),
        )
    });

    ENQUEUES_TOTAL.with_label_values(&[fleet_name])
}

pub(crate) fn dequeues_total(fleet_name: &str) -> IntCounter {
    static DEQUEUES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
        register(
            IntCounterVec::new(
                opts(
                    "controller_dequeues_total",
                    SUBSYSTEM,
                    "number of controller dequeues per fleet",
                ),
                &[FLEET_NAME_LABEL],
            )
            .unwrap(),
        )
    });

    DEQUEUES_TOTAL.with_label_values(&[fleet_name])
}

pub(crate) fn sync_duration_millis(result: &str) -> Histogram {
    static SYNC_DURATION_MILLIS: Lazy<HistogramVec> = Lazy::new(|| {
        let mut buckets = vec![0.0, 1.0, 5.0, 10.0, 50.0];
        buckets.extend((1..=10).map(|n| f64::from(n) * 100.0));
        buckets.extend((2..=10).map(|n| f64::from(n) * 1000.0));

        register(
            HistogramVec::new(
                histogram_opts(
                    "sync_time_millis",
                    SUBSYSTEM,
                    "distribution of sync time in milliseconds",
                    buckets,
                ),
                &[RESULT_LABEL],
            )
            .unwrap(),
        )
    });

    SYNC_DURATION_MILLIS.with_label_values(&[result])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_once() {
        enqueues_total("test").inc();
        enqueues_total("test").inc();
        dequeues_total("test").inc();
        sync_duration_millis("ok").observe(42.0);

        assert_eq!(enqueues_total("test").get(), 2);
        assert_eq!(dequeues_total("test").get(), 1);
        assert_eq!(sync_duration_millis("ok").get_sample_count(), 1);
    }
}
