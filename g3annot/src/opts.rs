/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, anyhow};
use clap::{Arg, ArgAction, ArgMatches, Command, ValueHint, value_parser};

const GLOBAL_ARG_VERSION: &str = "version";
const GLOBAL_ARG_VERBOSE: &str = "verbose";

const ARG_DATADIR: &str = "datadir";
const ARG_HOSTNAME: &str = "hostname";
const ARG_HOSTNAME_FILE: &str = "hostname-file";
const ARG_MAXMIND_URL: &str = "maxmind.url";
const ARG_ROUTEVIEW_V4_URL: &str = "routeview-v4.url";
const ARG_ROUTEVIEW_V6_URL: &str = "routeview-v6.url";
const ARG_ASNAME_URL: &str = "asname.url";
const ARG_SITEINFO_URL: &str = "siteinfo.url";
const ARG_EVENT_BUFFER_SIZE: &str = "eventbuffersize";
const ARG_RELOAD_MIN: &str = "reloadmin";
const ARG_RELOAD_TIME: &str = "reloadtime";
const ARG_RELOAD_MAX: &str = "reloadmax";
const ARG_IPSERVICE_SOCK: &str = "ipservice.sock";
const ARG_EVENT_SOCKET: &str = "tcpinfo.eventsocket";
const ARG_METRICS_ADDR: &str = "prometheusx.listen-address";

#[derive(Debug)]
pub struct ProcArgs {
    pub verbose_level: u8,
    pub datadir: PathBuf,
    pub hostname: String,
    pub maxmind_url: String,
    pub routeview_v4_url: String,
    pub routeview_v6_url: String,
    pub asname_url: String,
    pub siteinfo_url: String,
    pub event_buffer_size: usize,
    pub reload_min: Duration,
    pub reload_time: Duration,
    pub reload_max: Duration,
    pub ipservice_sock: PathBuf,
    pub event_socket: PathBuf,
    pub metrics_addr: SocketAddr,
}

fn url_arg(id: &'static str, env: &'static str, help: &'static str) -> Arg {
    Arg::new(id)
        .help(help)
        .num_args(1)
        .value_name("URL")
        .value_hint(ValueHint::Url)
        .env(env)
        .long(id)
}

fn duration_arg(id: &'static str, env: &'static str, help: &'static str) -> Arg {
    Arg::new(id)
        .help(help)
        .num_args(1)
        .value_name("DURATION")
        .env(env)
        .long(id)
}

fn build_cli_args() -> Command {
    Command::new(crate::build::PKG_NAME)
        .disable_version_flag(true)
        .arg(
            Arg::new(GLOBAL_ARG_VERSION)
                .help("Show version")
                .num_args(0)
                .action(ArgAction::SetTrue)
                .short('V')
                .long(GLOBAL_ARG_VERSION),
        )
        .arg(
            Arg::new(GLOBAL_ARG_VERBOSE)
                .help("Show more log, can be used multiple times")
                .action(ArgAction::Count)
                .short('v')
                .long(GLOBAL_ARG_VERBOSE),
        )
        .arg(
            Arg::new(ARG_DATADIR)
                .help("Directory to write the per-UUID annotation files in")
                .num_args(1)
                .value_name("DIR")
                .value_hint(ValueHint::DirPath)
                .value_parser(value_parser!(PathBuf))
                .env("DATADIR")
                .long(ARG_DATADIR)
                .default_value("."),
        )
        .arg(
            Arg::new(ARG_HOSTNAME)
                .help("Canonical hostname of this node, as listed in the site inventory")
                .num_args(1)
                .value_name("HOSTNAME")
                .env("HOSTNAME")
                .long(ARG_HOSTNAME),
        )
        .arg(
            Arg::new(ARG_HOSTNAME_FILE)
                .help("File to read the canonical hostname from, if the hostname flag is unset")
                .num_args(1)
                .value_name("FILE")
                .value_hint(ValueHint::FilePath)
                .value_parser(value_parser!(PathBuf))
                .env("HOSTNAME_FILE")
                .long(ARG_HOSTNAME_FILE),
        )
        .arg(url_arg(
            ARG_MAXMIND_URL,
            "MAXMIND_URL",
            "URL of the MaxMind City tarball. Accepted schemes: gs://bucket/object and file:path",
        ))
        .arg(url_arg(
            ARG_ROUTEVIEW_V4_URL,
            "ROUTEVIEW_V4_URL",
            "URL of the RouteViews IPv4 prefix2as file. gs: and file: schemes accepted",
        ))
        .arg(url_arg(
            ARG_ROUTEVIEW_V6_URL,
            "ROUTEVIEW_V6_URL",
            "URL of the RouteViews IPv6 prefix2as file. gs: and file: schemes accepted",
        ))
        .arg(url_arg(
            ARG_ASNAME_URL,
            "ASNAME_URL",
            "URL of the IPinfo AS-name CSV. gs: and file: schemes accepted",
        ))
        .arg(url_arg(
            ARG_SITEINFO_URL,
            "SITEINFO_URL",
            "URL of the site inventory annotations JSON. gs: and file: schemes accepted",
        ))
        .arg(
            Arg::new(ARG_EVENT_BUFFER_SIZE)
                .help("How many flow events to buffer before dropping them")
                .num_args(1)
                .value_name("COUNT")
                .value_parser(value_parser!(usize))
                .env("EVENTBUFFERSIZE")
                .long(ARG_EVENT_BUFFER_SIZE)
                .default_value("1000"),
        )
        .arg(duration_arg(
            ARG_RELOAD_MIN,
            "RELOADMIN",
            "Minimum time to wait between reloads of backing data",
        ))
        .arg(duration_arg(
            ARG_RELOAD_TIME,
            "RELOADTIME",
            "Expected time to wait between reloads of backing data",
        ))
        .arg(duration_arg(
            ARG_RELOAD_MAX,
            "RELOADMAX",
            "Maximum time to wait between reloads of backing data",
        ))
        .arg(
            Arg::new(ARG_IPSERVICE_SOCK)
                .help("Unix domain socket path for the local annotation service")
                .num_args(1)
                .value_name("PATH")
                .value_hint(ValueHint::FilePath)
                .value_parser(value_parser!(PathBuf))
                .env("IPSERVICE_SOCK")
                .long(ARG_IPSERVICE_SOCK)
                .default_value("ipservice.sock"),
        )
        .arg(
            Arg::new(ARG_EVENT_SOCKET)
                .help("Unix domain socket path the flow event source listens on")
                .num_args(1)
                .value_name("PATH")
                .value_hint(ValueHint::FilePath)
                .value_parser(value_parser!(PathBuf))
                .env("TCPINFO_EVENTSOCKET")
                .long(ARG_EVENT_SOCKET),
        )
        .arg(
            Arg::new(ARG_METRICS_ADDR)
                .help("Listen address for the prometheus metrics handler")
                .num_args(1)
                .value_name("ADDR")
                .env("PROMETHEUSX_LISTEN_ADDRESS")
                .long(ARG_METRICS_ADDR)
                .default_value("127.0.0.1:9990"),
        )
}

fn get_duration(args: &ArgMatches, id: &str, default: Duration) -> anyhow::Result<Duration> {
    let Some(v) = args.get_one::<String>(id) else {
        return Ok(default);
    };
    if let Ok(d) = humanize_rs::duration::parse(v) {
        Ok(d)
    } else if let Ok(secs) = u64::from_str(v) {
        Ok(Duration::from_secs(secs))
    } else {
        Err(anyhow!("invalid {id} value {v}"))
    }
}

fn get_required_string(args: &ArgMatches, id: &str) -> anyhow::Result<String> {
    args.get_one::<String>(id)
        .cloned()
        .ok_or_else(|| anyhow!("no {id} value set"))
}

fn get_hostname(args: &ArgMatches) -> anyhow::Result<String> {
    if let Some(hostname) = args.get_one::<String>(ARG_HOSTNAME) {
        if !hostname.is_empty() {
            return Ok(hostname.clone());
        }
    }
    if let Some(file) = args.get_one::<PathBuf>(ARG_HOSTNAME_FILE) {
        let content = std::fs::read_to_string(file)
            .map_err(|e| anyhow!("failed to read hostname file {}: {e}", file.display()))?;
        let hostname = content.trim();
        if !hostname.is_empty() {
            return Ok(hostname.to_string());
        }
    }
    Err(anyhow!("no hostname or hostname-file value set"))
}

pub fn parse_clap() -> anyhow::Result<Option<ProcArgs>> {
    parse_matches(build_cli_args().get_matches())
}

fn parse_matches(args: ArgMatches) -> anyhow::Result<Option<ProcArgs>> {
    if args.get_flag(GLOBAL_ARG_VERSION) {
        crate::build::print_version();
        return Ok(None);
    }

    let reload_min = get_duration(&args, ARG_RELOAD_MIN, Duration::from_secs(3600))?;
    let reload_time = get_duration(&args, ARG_RELOAD_TIME, Duration::from_secs(5 * 3600))?;
    let reload_max = get_duration(&args, ARG_RELOAD_MAX, Duration::from_secs(24 * 3600))?;
    if reload_min > reload_time || reload_time > reload_max {
        return Err(anyhow!(
            "reload durations must satisfy reloadmin <= reloadtime <= reloadmax, got {reload_min:?} / {reload_time:?} / {reload_max:?}"
        ));
    }

    let metrics_addr = args
        .get_one::<String>(ARG_METRICS_ADDR)
        .map(|s| SocketAddr::from_str(s))
        .transpose()
        .context("invalid metrics listen address")?
        .ok_or_else(|| anyhow!("no metrics listen address set"))?;

    let proc_args = ProcArgs {
        verbose_level: args.get_count(GLOBAL_ARG_VERBOSE),
        datadir: args
            .get_one::<PathBuf>(ARG_DATADIR)
            .cloned()
            .unwrap_or_else(|| PathBuf::from(".")),
        hostname: get_hostname(&args)?,
        maxmind_url: get_required_string(&args, ARG_MAXMIND_URL)?,
        routeview_v4_url: get_required_string(&args, ARG_ROUTEVIEW_V4_URL)?,
        routeview_v6_url: get_required_string(&args, ARG_ROUTEVIEW_V6_URL)?,
        asname_url: get_required_string(&args, ARG_ASNAME_URL)?,
        siteinfo_url: get_required_string(&args, ARG_SITEINFO_URL)?,
        event_buffer_size: args
            .get_one::<usize>(ARG_EVENT_BUFFER_SIZE)
            .copied()
            .unwrap_or(1000),
        reload_min,
        reload_time,
        reload_max,
        ipservice_sock: args
            .get_one::<PathBuf>(ARG_IPSERVICE_SOCK)
            .cloned()
            .unwrap_or_else(|| PathBuf::from("ipservice.sock")),
        event_socket: args
            .get_one::<PathBuf>(ARG_EVENT_SOCKET)
            .cloned()
            .ok_or_else(|| anyhow!("no tcpinfo.eventsocket value set"))?,
        metrics_addr,
    };

    Ok(Some(proc_args))
}
