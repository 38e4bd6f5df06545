use bytes::BytesMut;
use clap::Parser;
use std::collections::HashSet;
use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

use dns_recursor::Resolver;

mod settings;

use settings::Settings;

/// Accept datagrams, hand each one to a fresh task, and send the
/// responses back out over the same socket via a channel.
async fn listen_udp_task(resolver: Resolver, socket: UdpSocket) {
    let (tx, mut rx) = mpsc::channel::<(Vec<u8>, SocketAddr)>(32);
    let mut buf = vec![0u8; 512];

    loop {
        tokio::select! {
            Ok((size, peer)) = socket.recv_from(&mut buf) => {
                tracing::debug!(?peer, "UDP request");
                let bytes = BytesMut::from(&buf[..size]);
                let reply = tx.clone();
                let resolver = resolver.clone();
                tokio::spawn(async move {
                    if let Some(response) = resolver.handle(bytes.as_ref()).await {
                        if let Err(error) = reply.send((response, peer)).await {
                            tracing::debug!(?peer, ?error, "response channel closed");
                        }
                    }
                });
            }

            Some((response, peer)) = rx.recv() => {
                if let Err(error) = socket.send_to(&response, peer).await {
                    tracing::debug!(?peer, ?error, "UDP send error");
                }
            }
        }
    }
}

/// Log cache statistics every `interval`, sweeping out expired
/// entries as it goes.
async fn cache_stats_task(resolver: Resolver, interval: Duration) {
    loop {
        sleep(interval).await;
        let expired = resolver.cache().prune();
        let stats = resolver.cache().stats();
        tracing::info!(
            hits = %stats.hits,
            misses = %stats.misses,
            evictions = %stats.evictions,
            entries = %stats.entries,
            approximate_weight = %stats.approximate_weight,
            %expired,
            "cache stats"
        );
    }
}

async fn shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(error) => {
            tracing::error!(?error, "could not subscribe to SIGTERM");
            process::exit(1);
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => (),
        _ = sigterm.recv() => (),
    }
}

fn begin_logging() {
    let log_format = if let Ok(var) = env::var("RUST_LOG_FORMAT") {
        let mut set = HashSet::new();
        for s in var.split(',') {
            set.insert(s.to_string());
        }
        set
    } else {
        HashSet::new()
    };

    let logger = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(!log_format.contains("no-ansi"));

    if log_format.contains("json") {
        if log_format.contains("no-time") {
            logger.json().without_time().init();
        } else {
            logger.json().init();
        }
    } else if log_format.contains("pretty") {
        if log_format.contains("no-time") {
            logger.pretty().without_time().init();
        } else {
            logger.pretty().init();
        }
    } else if log_format.contains("compact") {
        if log_format.contains("no-time") {
            logger.compact().without_time().init();
        } else {
            logger.compact().init();
        }
    } else if log_format.contains("no-time") {
        logger.without_time().init();
    } else {
        logger.init();
    }
}

// the doc comments for this struct turn into the CLI help text
#[derive(Debug, Clone, Parser)]
/// A recursive DNS resolver.
///
/// recursord answers queries over UDP by walking the DNS hierarchy
/// itself, starting from the root nameservers, and caches positive
/// answers under TTL, entry-count, and memory bounds.
///
/// Settings are read from an optional properties file and from
/// RECURSORD_-prefixed environment variables; see the settings module
/// for the key list.  It speaks UDP only: no zone hosting, no
/// DNSSEC, no TCP fallback.
struct Args {
    /// Interface to listen on
    #[clap(short, long, value_parser, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    interface: IpAddr,

    /// Port to listen on
    #[clap(short, long, value_parser, default_value_t = 53)]
    port: u16,

    /// Path to a properties (INI) settings file
    #[clap(short, long, value_parser)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    begin_logging();

    let filename = args.config.as_ref().map(|p| p.to_string_lossy().into_owned());
    let settings = match Settings::new(filename.as_deref()) {
        Ok(settings) => settings,
        Err(error) => {
            tracing::error!(%error, "could not load settings");
            process::exit(1);
        }
    };

    let stats_interval = settings.stats_interval();
    let config = match settings.to_config() {
        Ok(config) => config,
        Err(error) => {
            tracing::error!(%error, "invalid configuration");
            process::exit(1);
        }
    };

    let resolver = Resolver::new(config);

    tracing::info!(interface = %args.interface, port = %args.port, "binding DNS UDP socket");
    let udp = match UdpSocket::bind((args.interface, args.port)).await {
        Ok(socket) => socket,
        Err(error) => {
            tracing::error!(?error, "could not bind DNS UDP socket");
            process::exit(1);
        }
    };

    tokio::spawn(listen_udp_task(resolver.clone(), udp));
    if let Some(interval) = stats_interval {
        tokio::spawn(cache_stats_task(resolver.clone(), interval));
    }

    shutdown_signal().await;
    tracing::info!("shutting down");
    resolver.shutdown();
}
