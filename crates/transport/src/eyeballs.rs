//! Happy-Eyeballs transport selection.
//!
//! In `auto` mode H3 (UDP) and H2 (TCP + TLS with ALPN) attempts race, H3
//! getting a short head start; within each protocol IPv6 leads and IPv4
//! follows after the family delay. The first attempt to complete its
//! handshake wins and every loser is aborted promptly so no handshake state
//! (tickets included) survives from a losing attempt. Explicit protocol or
//! family preferences disable the racing dimension they pin down.
//!
//! The attempt plan itself is a pure function of the resolved addresses and
//! the preference, which is where the policy gets its tests.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

use crate::error::{TransportError, TransportErrorKind, TransportResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreferredProtocol {
    Auto,
    H1,
    H2,
    H3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreferredFamily {
    Auto,
    V4,
    V6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn of(addr: &SocketAddr) -> Self {
        if addr.is_ipv6() {
            IpFamily::V6
        } else {
            IpFamily::V4
        }
    }
}

/// Protocol actually negotiated by the winning attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiatedProtocol {
    H3,
    H2,
    H1,
}

impl NegotiatedProtocol {
    pub fn label(self) -> &'static str {
        match self {
            NegotiatedProtocol::H3 => "h3",
            NegotiatedProtocol::H2 => "h2",
            NegotiatedProtocol::H1 => "http/1.1",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportPreference {
    pub protocol: PreferredProtocol,
    pub family: PreferredFamily,
    /// Head start H3 gets over the TCP-based attempts in auto mode.
    pub h3_head_start: Duration,
    /// Delay before the second address family joins the race.
    pub family_delay: Duration,
}

impl Default for TransportPreference {
    fn default() -> Self {
        Self {
            protocol: PreferredProtocol::Auto,
            family: PreferredFamily::Auto,
            h3_head_start: Duration::from_millis(250),
            family_delay: Duration::from_millis(250),
        }
    }
}

/// One planned connection attempt: which protocol, where, and how long to
/// hold it back relative to the start of the race.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub protocol: NegotiatedProtocol,
    pub addr: SocketAddr,
    pub delay: Duration,
}

/// Resolve a host over both address families.
pub async fn resolve(host: &str, port: u16) -> TransportResult<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|err| {
            TransportError::new(
                TransportErrorKind::DnsFailure,
                format!("resolving '{host}': {err}"),
            )
            .with_source(err)
        })?
        .collect();
    if addrs.is_empty() {
        return Err(TransportError::new(
            TransportErrorKind::DnsFailure,
            format!("'{host}' resolved to no addresses"),
        ));
    }
    Ok(addrs)
}

/// Build the race plan for the given addresses and preference.
pub fn build_attempt_plan(addrs: &[SocketAddr], pref: &TransportPreference) -> Vec<Attempt> {
    let mut v6: Vec<SocketAddr> = addrs.iter().copied().filter(SocketAddr::is_ipv6).collect();
    let mut v4: Vec<SocketAddr> = addrs.iter().copied().filter(SocketAddr::is_ipv4).collect();

    // An explicit family preference removes the other family entirely.
    match pref.family {
        PreferredFamily::V4 => v6.clear(),
        PreferredFamily::V6 => v4.clear(),
        PreferredFamily::Auto => {}
    }

    // (address, family delay): IPv6 leads, IPv4 joins after the delay. If
    // only one family resolved there is nothing to stagger.
    let mut ordered: Vec<(SocketAddr, Duration)> = Vec::new();
    let stagger = if !v6.is_empty() && !v4.is_empty() {
        pref.family_delay
    } else {
        Duration::ZERO
    };
    for addr in &v6 {
        ordered.push((*addr, Duration::ZERO));
    }
    for addr in &v4 {
        ordered.push((*addr, stagger));
    }
    if ordered.is_empty() {
        return Vec::new();
    }

    let mut plan = Vec::new();
    match pref.protocol {
        PreferredProtocol::H3 => {
            for (addr, delay) in &ordered {
                plan.push(Attempt {
                    protocol: NegotiatedProtocol::H3,
                    addr: *addr,
                    delay: *delay,
                });
            }
        }
        PreferredProtocol::H2 | PreferredProtocol::H1 => {
            let protocol = if pref.protocol == PreferredProtocol::H2 {
                NegotiatedProtocol::H2
            } else {
                NegotiatedProtocol::H1
            };
            for (addr, delay) in &ordered {
                plan.push(Attempt {
                    protocol,
                    addr: *addr,
                    delay: *delay,
                });
            }
        }
        PreferredProtocol::Auto => {
            for (addr, delay) in &ordered {
                plan.push(Attempt {
                    protocol: NegotiatedProtocol::H3,
                    addr: *addr,
                    delay: *delay,
                });
            }
            for (addr, delay) in &ordered {
                plan.push(Attempt {
                    protocol: NegotiatedProtocol::H2,
                    addr: *addr,
                    delay: *delay + pref.h3_head_start,
                });
            }
        }
    }

    plan.sort_by_key(|attempt| attempt.delay);
    plan
}

/// ALPN identifiers offered on the TCP leg.
fn tcp_alpn(protocol: NegotiatedProtocol) -> Vec<Vec<u8>> {
    match protocol {
        NegotiatedProtocol::H2 => vec![b"h2".to_vec()],
        NegotiatedProtocol::H1 => vec![b"http/1.1".to_vec()],
        NegotiatedProtocol::H3 => Vec::new(),
    }
}

/// Run one TCP + TLS attempt (the H2/H1 leg of the race).
pub(crate) async fn connect_tcp_tls(
    addr: SocketAddr,
    host: &str,
    mut tls: rustls::ClientConfig,
    protocol: NegotiatedProtocol,
) -> TransportResult<TlsStream<TcpStream>> {
    tls.alpn_protocols = tcp_alpn(protocol);
    let tcp = TcpStream::connect(addr).await.map_err(|err| {
        TransportError::new(
            TransportErrorKind::HandshakeFailure,
            format!("tcp connect {addr}: {err}"),
        )
        .with_source(err)
    })?;
    let server_name = rustls::pki_types::ServerName::try_from(host.to_string()).map_err(|_| {
        TransportError::new(
            TransportErrorKind::HandshakeFailure,
            format!("'{host}' is not a valid server name"),
        )
    })?;
    let connector = tokio_rustls::TlsConnector::from(std::sync::Arc::new(tls));
    connector.connect(server_name, tcp).await.map_err(|err| {
        TransportError::new(
            TransportErrorKind::HandshakeFailure,
            format!("tls handshake with {addr}: {err}"),
        )
        .with_source(err)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v6(port: u16) -> SocketAddr {
        format!("[2001:db8::1]:{port}").parse().unwrap()
    }

    fn v4(port: u16) -> SocketAddr {
        format!("192.0.2.1:{port}").parse().unwrap()
    }

    #[test]
    fn auto_plan_races_h3_and_h2_with_head_start() {
        let pref = TransportPreference::default();
        let plan = build_attempt_plan(&[v6(443), v4(443)], &pref);
        assert_eq!(plan.len(), 4);

        // First attempt: H3 over IPv6, immediately.
        assert_eq!(plan[0].protocol, NegotiatedProtocol::H3);
        assert!(plan[0].addr.is_ipv6());
        assert_eq!(plan[0].delay, Duration::ZERO);

        // The H2 leg never starts before the head start elapses.
        for attempt in plan.iter().filter(|a| a.protocol == NegotiatedProtocol::H2) {
            assert!(attempt.delay >= pref.h3_head_start);
        }
        // IPv4 never starts before the family delay elapses.
        for attempt in plan.iter().filter(|a| a.addr.is_ipv4()) {
            assert!(attempt.delay >= pref.family_delay);
        }
    }

    #[test]
    fn explicit_protocol_disables_protocol_racing() {
        let pref = TransportPreference {
            protocol: PreferredProtocol::H3,
            ..TransportPreference::default()
        };
        let plan = build_attempt_plan(&[v6(443), v4(443)], &pref);
        assert!(plan.iter().all(|a| a.protocol == NegotiatedProtocol::H3));
    }

    #[test]
    fn explicit_family_drops_the_other_family() {
        let pref = TransportPreference {
            family: PreferredFamily::V4,
            ..TransportPreference::default()
        };
        let plan = build_attempt_plan(&[v6(443), v4(443)], &pref);
        assert!(!plan.is_empty());
        assert!(plan.iter().all(|a| a.addr.is_ipv4()));
        // With a single family in play nothing is staggered by family.
        assert!(plan.iter().any(|a| a.delay == Duration::ZERO));
    }

    #[test]
    fn single_family_hosts_are_not_staggered() {
        let pref = TransportPreference {
            protocol: PreferredProtocol::H3,
            ..TransportPreference::default()
        };
        let plan = build_attempt_plan(&[v4(443)], &pref);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].delay, Duration::ZERO);
    }

    #[test]
    fn h1_preference_plans_http1_alpn() {
        let pref = TransportPreference {
            protocol: PreferredProtocol::H1,
            ..TransportPreference::default()
        };
        let plan = build_attempt_plan(&[v4(443)], &pref);
        assert_eq!(plan[0].protocol, NegotiatedProtocol::H1);
        assert_eq!(tcp_alpn(NegotiatedProtocol::H1), vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn plan_is_sorted_by_delay() {
        let plan = build_attempt_plan(&[v6(443), v4(443)], &TransportPreference::default());
        for pair in plan.windows(2) {
            assert!(pair[0].delay <= pair[1].delay);
        }
    }

    #[tokio::test]
    async fn unresolvable_host_is_a_dns_failure() {
        let err = resolve("definitely-not-a-real-host.invalid", 443)
            .await
            .unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::DnsFailure);
    }
}
