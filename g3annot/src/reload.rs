/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::asn::AsnAnnotator;
use crate::geo::GeoAnnotator;
use crate::site::SiteAnnotator;

/// Bounds for the randomized reload schedule. The inter-reload interval
/// is exponentially distributed with the given mean, clamped to
/// [min, max], so reload timing carries no memory of the last reload.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ReloadConfig {
    pub(crate) min: Duration,
    pub(crate) mean: Duration,
    pub(crate) max: Duration,
}

impl ReloadConfig {
    fn next_interval(&self) -> Duration {
        let u: f64 = rand::rng().random();
        // inverse-CDF sample of Exp(1); u is in [0, 1)
        let exp = -(1.0 - u).ln();
        self.mean.mul_f64(exp).clamp(self.min, self.max)
    }
}

/// Drive every annotator's reload on the memoryless schedule until
/// cancellation. Failed reloads already keep their prior snapshot, so
/// one bad tick costs nothing but the fetch.
pub(crate) async fn run_reload_loop(
    config: ReloadConfig,
    asn: Arc<AsnAnnotator>,
    geo: Arc<GeoAnnotator>,
    site: Arc<SiteAnnotator>,
    quit: CancellationToken,
) {
    loop {
        let wait = config.next_interval();
        debug!("next dataset reload in {wait:?}");
        tokio::select! {
            biased;

            _ = quit.cancelled() => break,
            _ = tokio::time::sleep(wait) => {
                asn.reload().await;
                geo.reload().await;
                site.reload().await;
            }
        }
    }
}
