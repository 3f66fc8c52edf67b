//! Address resolution for the probe target.
//!
//! IP literals are used as-is. Host names are resolved to A/AAAA records with
//! hickory using the system resolver configuration, falling back to the
//! library defaults when none can be read.

use std::net::{IpAddr, SocketAddr};

use hickory_resolver::config::{LookupIpStrategy, ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::{system_conf, Resolver};
use tracing::{debug, instrument, warn};

use crate::config::AddressFamily;
use crate::error::ProbeError;

impl AddressFamily {
    /// Whether `ip` belongs to this family.
    pub fn matches(&self, ip: &IpAddr) -> bool {
        match self {
            Self::Any => true,
            Self::Ipv4 => ip.is_ipv4(),
            Self::Ipv6 => ip.is_ipv6(),
        }
    }

    fn lookup_strategy(&self) -> LookupIpStrategy {
        match self {
            Self::Any => LookupIpStrategy::Ipv4AndIpv6,
            Self::Ipv4 => LookupIpStrategy::Ipv4Only,
            Self::Ipv6 => LookupIpStrategy::Ipv6Only,
        }
    }
}

/// Resolves a host and port into candidate socket addresses.
pub struct AddressResolver {
    config: ResolverConfig,
    opts: ResolverOpts,
}

impl Default for AddressResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressResolver {
    /// Create a resolver from the system DNS configuration.
    pub fn new() -> Self {
        match system_conf::read_system_conf() {
            Ok((config, opts)) => Self { config, opts },
            Err(e) => {
                warn!(error = %e, "Failed to read system DNS configuration, using defaults");
                Self::with_config(ResolverConfig::default(), ResolverOpts::default())
            }
        }
    }

    /// Create a resolver with custom configuration.
    pub fn with_config(config: ResolverConfig, opts: ResolverOpts) -> Self {
        Self { config, opts }
    }

    /// Resolve `host` to socket addresses on `port`, keeping resolver order.
    #[instrument(skip(self), name = "dns.resolve")]
    pub async fn resolve(
        &self,
        host: &str,
        port: u16,
        family: AddressFamily,
    ) -> Result<Vec<SocketAddr>, ProbeError> {
        let host = host.trim();
        // Bracketed IPv6 literals are accepted as well
        let literal = host.trim_start_matches('[').trim_end_matches(']');

        if let Ok(ip) = literal.parse::<IpAddr>() {
            if !family.matches(&ip) {
                return Err(ProbeError::AddressResolution {
                    host: host.to_string(),
                    message: format!("{} does not match address family {:?}", ip, family),
                });
            }
            return Ok(vec![SocketAddr::new(ip, port)]);
        }

        let mut opts = self.opts.clone();
        opts.ip_strategy = family.lookup_strategy();

        let resolver = Resolver::builder_with_config(self.config.clone(), TokioConnectionProvider::default())
            .with_options(opts)
            .build();

        let response = resolver
            .lookup_ip(host)
            .await
            .map_err(|e| ProbeError::AddressResolution {
                host: host.to_string(),
                message: e.to_string(),
            })?;

        let addrs = filter_family(response.iter(), port, family);
        if addrs.is_empty() {
            return Err(ProbeError::AddressResolution {
                host: host.to_string(),
                message: format!("no {:?} addresses found", family),
            });
        }

        debug!(
            host = %host,
            port = port,
            count = addrs.len(),
            "Resolved host to {} addresses",
            addrs.len()
        );

        Ok(addrs)
    }
}

fn filter_family(
    ips: impl IntoIterator<Item = IpAddr>,
    port: u16,
    family: AddressFamily,
) -> Vec<SocketAddr> {
    ips.into_iter()
        .filter(|ip| family.matches(ip))
        .map(|ip| SocketAddr::new(ip, port))
        .collect()
}
