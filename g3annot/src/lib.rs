/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::sync::Arc;

use anyhow::{Context, anyhow};
use log::info;
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

mod build;

pub mod logger;

pub mod opts;
use opts::ProcArgs;

mod annotate;
mod asn;
mod event;
mod frontend;
mod geo;
mod rawfile;
mod reload;
mod site;
mod stat;

use annotate::Annotator;

pub async fn run(proc_args: ProcArgs) -> anyhow::Result<()> {
    let quit = CancellationToken::new();
    register_signals(quit.clone())?;

    let stats = Arc::new(stat::DaemonStats::new());

    let maxmind_src = rawfile::from_url(&proc_args.maxmind_url, &stats.dataset)
        .context(format!("invalid maxmind.url {}", proc_args.maxmind_url))?;
    let rv4_src = rawfile::from_url(&proc_args.routeview_v4_url, &stats.dataset)
        .context(format!("invalid routeview-v4.url {}", proc_args.routeview_v4_url))?;
    let rv6_src = rawfile::from_url(&proc_args.routeview_v6_url, &stats.dataset)
        .context(format!("invalid routeview-v6.url {}", proc_args.routeview_v6_url))?;
    let asname_src = rawfile::from_url(&proc_args.asname_url, &stats.dataset)
        .context(format!("invalid asname.url {}", proc_args.asname_url))?;
    let siteinfo_src = rawfile::from_url(&proc_args.siteinfo_url, &stats.dataset)
        .context(format!("invalid siteinfo.url {}", proc_args.siteinfo_url))?;

    // resolve this node's site identity first: a virtual site extends
    // the local-IP set, which must be frozen before annotators start
    let site_snapshot = site::SiteAnnotator::load(&siteinfo_src, &proc_args.hostname)
        .await
        .context(format!(
            "could not load site inventory from {}",
            proc_args.siteinfo_url
        ))?;
    let mut local_ips =
        annotate::local_interface_ips().context("could not read local interface addresses")?;
    local_ips.extend(site_snapshot.public_addrs());
    let local_ips = Arc::new(local_ips);
    info!("local IP set: {local_ips:?}");

    let site = Arc::new(site::SiteAnnotator::new(
        siteinfo_src,
        proc_args.hostname.clone(),
        site_snapshot,
        local_ips.clone(),
    ));
    let asn = Arc::new(
        asn::AsnAnnotator::new(
            rv4_src,
            rv6_src,
            asname_src,
            local_ips.clone(),
            stats.routeview.clone(),
        )
        .await
        .context(format!(
            "could not load RouteViews data from {} / {}",
            proc_args.routeview_v4_url, proc_args.routeview_v6_url
        ))?,
    );
    let geo = Arc::new(
        geo::GeoAnnotator::new(maxmind_src, local_ips.clone())
            .await
            .context(format!(
                "could not load MaxMind data from {}",
                proc_args.maxmind_url
            ))?,
    );

    let annotators: Vec<Arc<dyn Annotator>> = vec![asn.clone(), geo.clone(), site.clone()];
    let (handler, worker) = event::new(
        proc_args.event_buffer_size,
        annotators,
        Box::new(event::FsStore::new(&proc_args.datadir)),
        stats.handler.clone(),
    );

    let frontend = frontend::AnnotationFrontend::new(
        &proc_args.ipservice_sock,
        Some(asn.clone()),
        Some(geo.clone()),
        stats.frontend.clone(),
    )
    .map_err(|e| {
        anyhow!(
            "could not bind annotation socket {}: {e}",
            proc_args.ipservice_sock.display()
        )
    })?;

    let metrics_listener = TcpListener::bind(proc_args.metrics_addr)
        .await
        .context(format!(
            "could not bind metrics address {}",
            proc_args.metrics_addr
        ))?;

    let reload_config = reload::ReloadConfig {
        min: proc_args.reload_min,
        mean: proc_args.reload_time,
        max: proc_args.reload_max,
    };

    info!("{} {} started", build::PKG_NAME, build::VERSION);

    let tasks = vec![
        tokio::spawn(event::run_event_listener(
            proc_args.event_socket.clone(),
            handler,
            stats.source.clone(),
            quit.clone(),
        )),
        tokio::spawn(worker.into_running(quit.clone())),
        tokio::spawn(reload::run_reload_loop(
            reload_config,
            asn,
            geo,
            site,
            quit.clone(),
        )),
        tokio::spawn(frontend.into_running(quit.clone())),
        tokio::spawn(stat::run_metrics_server(
            metrics_listener,
            stats.clone(),
            quit.clone(),
        )),
    ];

    for task in tasks {
        let _ = task.await;
    }
    info!("shut down cleanly");
    Ok(())
}

fn register_signals(quit: CancellationToken) -> anyhow::Result<()> {
    let mut int_sig = signal(SignalKind::interrupt())
        .map_err(|e| anyhow!("failed to create SIGINT listener: {e}"))?;
    let int_quit = quit.clone();
    tokio::spawn(async move {
        if int_sig.recv().await.is_some() {
            info!("got quit signal");
            int_quit.cancel();
        }
    });

    let mut term_sig = signal(SignalKind::terminate())
        .map_err(|e| anyhow!("failed to create SIGTERM listener: {e}"))?;
    tokio::spawn(async move {
        if term_sig.recv().await.is_some() {
            info!("got offline signal");
            quit.cancel();
        }
    });

    Ok(())
}
