//! SSRF protection for webhook destinations.
//!
//! [`UrlGuard::validate`] runs before a request is built: it parses the URL,
//! checks the scheme, and resolves the host, rejecting any address in a
//! private, loopback, link-local, CGNAT or unspecified range.
//! [`GuardedResolver`] is installed as the HTTP client's DNS resolver and
//! repeats the address check at dial time, so a name that re-resolves to an
//! internal address between validation and connect is still refused.
//!
//! Both share one override flag, flipped by
//! [`UrlGuard::set_allow_private`] for non-production setups.

use std::{
    net::{IpAddr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use tracing::warn;
use url::Url;

use crate::error::{DeliveryError, Result};

/// Validates destinations against internal address ranges.
#[derive(Debug, Clone, Default)]
pub struct UrlGuard {
    allow_private: Arc<AtomicBool>,
}

impl UrlGuard {
    /// Creates a guard; `allow_private` disables address checks.
    pub fn new(allow_private: bool) -> Self {
        Self { allow_private: Arc::new(AtomicBool::new(allow_private)) }
    }

    /// Toggles the internal-address override.
    pub fn set_allow_private(&self, allow: bool) {
        self.allow_private.store(allow, Ordering::Release);
    }

    /// Returns true if internal destinations are currently allowed.
    pub fn allows_private(&self) -> bool {
        self.allow_private.load(Ordering::Acquire)
    }

    /// Returns a DNS resolver sharing this guard's override flag.
    pub fn resolver(&self) -> GuardedResolver {
        GuardedResolver { allow_private: self.allow_private.clone() }
    }

    /// Parses `raw` and checks scheme and host without resolving.
    ///
    /// # Errors
    ///
    /// Returns `InvalidUrl` for unparseable URLs or non-HTTP schemes and
    /// `UnsafeDestination` for internal IP literals or hostnames.
    pub fn check_syntax(&self, raw: &str) -> Result<Url> {
        let url = Url::parse(raw).map_err(|e| DeliveryError::invalid_url(raw, e.to_string()))?;

        match url.scheme() {
            "http" | "https" => {},
            scheme => {
                return Err(DeliveryError::invalid_url(raw, format!("unsupported scheme {scheme}")))
            },
        }

        let host = match url.host() {
            Some(host) => host,
            None => return Err(DeliveryError::invalid_url(raw, "missing host")),
        };

        if self.allows_private() {
            return Ok(url);
        }

        match host {
            url::Host::Ipv4(v4) => check_ip(raw, IpAddr::V4(v4))?,
            url::Host::Ipv6(v6) => check_ip(raw, IpAddr::V6(v6))?,
            url::Host::Domain(domain) => {
                if is_internal_hostname(domain) {
                    return Err(DeliveryError::unsafe_destination(
                        raw,
                        format!("{domain} is an internal hostname"),
                    ));
                }
            },
        }

        Ok(url)
    }

    /// Fully validates `raw`, resolving its host.
    ///
    /// # Errors
    ///
    /// Everything [`check_syntax`](Self::check_syntax) rejects, plus
    /// `UnsafeDestination` if any resolved address is internal and
    /// `NetworkError` if resolution fails.
    pub async fn validate(&self, raw: &str) -> Result<Url> {
        let url = self.check_syntax(raw)?;
        if self.allows_private() {
            return Ok(url);
        }

        if let Some(url::Host::Domain(domain)) = url.host() {
            let port = url.port_or_known_default().unwrap_or(443);
            let addrs = tokio::net::lookup_host((domain, port))
                .await
                .map_err(|e| DeliveryError::network(format!("dns lookup for {domain}: {e}")))?;

            let mut resolved = false;
            for addr in addrs {
                resolved = true;
                check_ip(raw, addr.ip())?;
            }
            if !resolved {
                return Err(DeliveryError::network(format!("{domain} resolved to no addresses")));
            }
        }

        Ok(url)
    }
}

fn check_ip(raw: &str, ip: IpAddr) -> Result<()> {
    if is_internal_ip(&ip) {
        return Err(DeliveryError::unsafe_destination(raw, format!("{ip} is an internal address")));
    }
    Ok(())
}

fn is_internal_hostname(host: &str) -> bool {
    let lower = host.trim_end_matches('.').to_ascii_lowercase();
    lower == "localhost"
        || lower.ends_with(".localhost")
        || lower.ends_with(".internal")
        || lower.ends_with(".local")
}

/// Returns true for addresses webhooks must never reach.
pub fn is_internal_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
        },
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_internal_ip(&IpAddr::V4(mapped));
            }
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
        },
    }
}

/// DNS resolver that drops internal addresses at connect time.
#[derive(Debug, Clone)]
pub struct GuardedResolver {
    allow_private: Arc<AtomicBool>,
}

impl Resolve for GuardedResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let allow_private = self.allow_private.load(Ordering::Acquire);
        Box::pin(async move {
            let host = name.as_str().to_string();
            let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), 0)).await?.collect();

            if allow_private {
                return Ok(Box::new(addrs.into_iter()) as Addrs);
            }

            let total = addrs.len();
            let safe: Vec<SocketAddr> =
                addrs.into_iter().filter(|addr| !is_internal_ip(&addr.ip())).collect();

            if safe.is_empty() {
                warn!(host = %host, resolved = total, "refusing to dial internal address");
                let err: Box<dyn std::error::Error + Send + Sync> =
                    format!("{host} resolves only to internal addresses").into();
                return Err(err);
            }

            Ok(Box::new(safe.into_iter()) as Addrs)
        })
    }
}
