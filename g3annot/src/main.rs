/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use anyhow::{Context, anyhow};
use log::error;

fn main() -> anyhow::Result<()> {
    let Some(proc_args) =
        g3annot::opts::parse_clap().context("failed to parse command line options")?
    else {
        return Ok(());
    };

    // set up process logger early, only proc args is used inside
    let _log_guard = g3annot::logger::setup(proc_args.verbose_level)
        .map_err(|e| anyhow!("failed to set up process logger: {e}"))?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;
    match rt.block_on(g3annot::run(proc_args)) {
        Ok(()) => Ok(()),
        Err(e) => {
            error!("{e:?}");
            Err(e)
        }
    }
}
