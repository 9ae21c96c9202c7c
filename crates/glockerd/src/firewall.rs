//! Firewall reconciliation
//!
//! Addresses are resolved first, then all tagged rules are dropped and
//! reinstalled in one pass. Entries that fail to resolve are skipped for
//! this cycle.

use crate::state::StateStore;
use crate::system::{DnsResolver, Firewall};
use glocker_common::{GlockerError, Resource, Result};
use std::collections::BTreeSet;
use std::net::IpAddr;
use tracing::{debug, info, warn};

/// Addresses to reject for `domains`. IP literals are taken as-is.
pub async fn resolve_all(resolver: &dyn DnsResolver, domains: &[String]) -> BTreeSet<IpAddr> {
    let mut addrs = BTreeSet::new();
    for domain in domains {
        if let Ok(ip) = domain.parse::<IpAddr>() {
            addrs.insert(ip);
            continue;
        }
        match resolver.resolve(domain).await {
            Ok(found) => {
                debug!(domain = %domain, count = found.len(), "Resolved");
                addrs.extend(found);
            }
            Err(e) => warn!(domain = %domain, "Skipping firewall entry: {}", e),
        }
    }
    addrs
}

/// Replace every tagged rule with one reject rule per resolved address.
/// Returns the tagged rule count afterwards.
pub async fn reconcile(
    domains: &[String],
    resolver: &dyn DnsResolver,
    firewall: &dyn Firewall,
    store: &StateStore,
) -> Result<usize> {
    let addrs = resolve_all(resolver, domains).await;

    store.begin_write();
    let result = install(&addrs, firewall).await;
    let count = match firewall.count_tagged().await {
        Ok(n) => n,
        Err(e) => {
            warn!("Could not count firewall rules: {}", e);
            0
        }
    };
    store.finish_firewall(count);

    let failed = result?;
    if failed > 0 {
        return Err(GlockerError::mutation(
            Resource::Firewall,
            format!("{} of {} reject rules failed to install", failed, addrs.len()),
        ));
    }
    info!("Firewall updated: {} addresses rejected", addrs.len());
    Ok(count)
}

/// Returns how many rules failed
async fn install(addrs: &BTreeSet<IpAddr>, firewall: &dyn Firewall) -> Result<usize> {
    let removed = firewall.clear_tagged().await?;
    debug!("Cleared {} tagged firewall rules", removed);
    let mut failed = 0;
    for addr in addrs {
        if let Err(e) = firewall.reject(*addr).await {
            warn!("Failed to add reject rule for {}: {}", addr, e);
            failed += 1;
        }
    }
    Ok(failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::fake::{FakeFirewall, FakeResolver};

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_resolution_failure_is_skipped() {
        let resolver = FakeResolver::default();
        resolver.answer("a.com", vec![ip("93.184.216.34"), ip("2606:2800:220:1::1")]);
        resolver.fail("down.com");
        let firewall = FakeFirewall::default();
        let store = StateStore::new();

        let domains = vec!["a.com".to_string(), "down.com".to_string(), "10.0.0.9".to_string()];
        let count = reconcile(&domains, &resolver, &firewall, &store).await.unwrap();
        assert_eq!(count, 3);
        assert!(firewall.rules().contains(&ip("10.0.0.9")));
        assert!(!resolver.calls().contains(&"10.0.0.9".to_string()));
        assert_eq!(store.with_baseline(|b| b.trusted.firewall_rules), 3);
    }

    #[tokio::test]
    async fn test_reinstall_is_idempotent() {
        let resolver = FakeResolver::default();
        resolver.answer("a.com", vec![ip("1.2.3.4")]);
        let firewall = FakeFirewall::default();
        let store = StateStore::new();
        let domains = vec!["a.com".to_string()];

        reconcile(&domains, &resolver, &firewall, &store).await.unwrap();
        reconcile(&domains, &resolver, &firewall, &store).await.unwrap();
        assert_eq!(firewall.rules(), vec![ip("1.2.3.4")]);
    }

    #[tokio::test]
    async fn test_reject_failure_reported_and_baseline_settled() {
        let resolver = FakeResolver::default();
        resolver.answer("a.com", vec![ip("1.2.3.4")]);
        let firewall = FakeFirewall::default();
        firewall.set_fail_reject(true);
        let store = StateStore::new();

        let err = reconcile(&["a.com".to_string()], &resolver, &firewall, &store)
            .await
            .unwrap_err();
        assert!(matches!(err, GlockerError::ResourceMutation { .. }));
        assert!(store.with_baseline(|b| b.is_settled()));
    }
}
