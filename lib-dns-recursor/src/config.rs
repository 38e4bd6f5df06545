use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Resolver configuration, fixed at startup.  The resolver and the
/// cache take a copy at construction; there is no process-wide
/// mutable state.
#[derive(Debug, Clone)]
pub struct Config {
    /// Where every iterative walk starts.  Defaults to the thirteen
    /// root nameservers.
    pub root_servers: Vec<IpAddr>,

    /// The port remote nameservers are queried on.  This is always 53
    /// in production, but tests point it at scripted nameservers on
    /// ephemeral ports.
    pub upstream_port: u16,

    /// How long to wait for any single nameserver to respond.
    pub timeout: Duration,

    /// How deep a single resolution may go, counting referral hops
    /// and alias / nameserver-address sub-resolutions.
    pub max_depth: usize,

    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// Hard bound on the number of cached entries.
    pub max_entries: usize,

    /// Bound on the approximate total weight of the cache, in octets.
    pub max_memory_bytes: usize,

    /// Answers whose minimum TTL is below this are not cached at all.
    pub min_ttl: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_servers: root_hints(),
            upstream_port: 53,
            timeout: Duration::from_millis(5000),
            max_depth: 16,
            cache: CacheConfig::default(),
        }
    }
}

impl Config {
    /// Upper bound on the duration of one whole resolution: every hop
    /// may block for up to `timeout`, and there are at most
    /// `max_depth` hops.
    pub fn overall_deadline(&self) -> Duration {
        #[allow(clippy::cast_possible_truncation)]
        let hops = self.max_depth.max(1) as u32;
        self.timeout * hops
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_memory_bytes: 10 * 1024 * 1024,
            min_ttl: 10,
        }
    }
}

/// The thirteen root nameservers, `a.root-servers.net` through
/// `m.root-servers.net`.
pub fn root_hints() -> Vec<IpAddr> {
    [
        Ipv4Addr::new(198, 41, 0, 4),
        Ipv4Addr::new(170, 247, 170, 2),
        Ipv4Addr::new(192, 33, 4, 12),
        Ipv4Addr::new(199, 7, 91, 13),
        Ipv4Addr::new(192, 203, 230, 10),
        Ipv4Addr::new(192, 5, 5, 241),
        Ipv4Addr::new(192, 112, 36, 4),
        Ipv4Addr::new(198, 97, 190, 53),
        Ipv4Addr::new(192, 36, 148, 17),
        Ipv4Addr::new(192, 58, 128, 30),
        Ipv4Addr::new(193, 0, 14, 129),
        Ipv4Addr::new(199, 7, 83, 42),
        Ipv4Addr::new(202, 12, 27, 33),
    ]
    .into_iter()
    .map(IpAddr::V4)
    .collect()
}
