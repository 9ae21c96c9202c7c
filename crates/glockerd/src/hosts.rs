//! Hosts file managed section
//!
//! Blocked domains resolve to loopback through a section bounded by two
//! marker lines at the end of the hosts file. Everything outside the
//! markers is left byte-for-byte as found.

use crate::state::StateStore;
use crate::system::ImmutableFlag;
use crate::tamper::{self, HashScope};
use glocker_common::{GlockerError, Resource, Result};
use std::net::IpAddr;
use std::path::Path;
use tracing::{debug, info, warn};

pub const SECTION_START: &str = "### GLOCKER START ###";
pub const SECTION_END: &str = "### GLOCKER END ###";

/// Marker lines plus four loopback records per domain. IP literals are
/// skipped; they only make sense as firewall entries.
pub fn render_section(domains: &[String]) -> String {
    let mut out = String::new();
    out.push_str(SECTION_START);
    out.push('\n');
    for domain in domains {
        if domain.parse::<IpAddr>().is_ok() {
            continue;
        }
        out.push_str(&format!("127.0.0.1 {}\n", domain));
        out.push_str(&format!("127.0.0.1 www.{}\n", domain));
        out.push_str(&format!("::1 {}\n", domain));
        out.push_str(&format!("::1 www.{}\n", domain));
    }
    out.push_str(SECTION_END);
    out.push('\n');
    out
}

/// Byte ranges of the managed section, end exclusive and including the
/// end marker's newline. An unterminated section runs to end of file.
fn section_bounds(content: &str) -> Option<(usize, usize)> {
    let mut offset = 0;
    let mut start = None;
    for line in content.split_inclusive('\n') {
        let trimmed = line.trim();
        if let Some(s) = start {
            if trimmed == SECTION_END {
                return Some((s, offset + line.len()));
            }
        } else if trimmed == SECTION_START {
            start = Some(offset);
        }
        offset += line.len();
    }
    start.map(|s| (s, content.len()))
}

/// The managed section text (markers included), empty if absent
pub fn managed_section(content: &str) -> &str {
    match section_bounds(content) {
        Some((start, end)) => &content[start..end],
        None => "",
    }
}

/// `content` with the managed section removed
pub fn strip_section(content: &str) -> String {
    match section_bounds(content) {
        Some((start, end)) => {
            let mut out = String::with_capacity(content.len());
            out.push_str(&content[..start]);
            out.push_str(&content[end..]);
            out
        }
        None => content.to_string(),
    }
}

/// Replace the managed section with one for `domains`. Idempotent.
pub fn apply_section(content: &str, domains: &[String]) -> String {
    let mut out = strip_section(content);
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&render_section(domains));
    out
}

async fn read_hosts(path: &Path) -> Result<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(s) => Ok(s),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(GlockerError::mutation(
            Resource::Hosts,
            format!("reading {}: {}", path.display(), e),
        )),
    }
}

/// Rewrite the hosts file so its managed section blocks exactly `domains`.
///
/// Returns false if the file already matched. The tamper baseline is
/// advanced to whatever is on disk afterwards, success or not.
pub async fn reconcile(
    path: &Path,
    domains: &[String],
    immutable: &dyn ImmutableFlag,
    store: &StateStore,
) -> Result<bool> {
    let current = read_hosts(path).await?;
    let desired = apply_section(&current, domains);
    if desired == current {
        debug!("Hosts file already up to date");
        return Ok(false);
    }

    store.begin_write();
    let result = write_guarded(path, &desired, immutable, true).await;
    store.finish_write(tamper::fingerprint(path, HashScope::ManagedSection).await);

    result?;
    info!("Hosts file updated: {} domains blocked", domains.len());
    Ok(true)
}

/// Clear immutability, write, then restore it if `relock`
async fn write_guarded(
    path: &Path,
    content: &str,
    immutable: &dyn ImmutableFlag,
    relock: bool,
) -> Result<()> {
    if let Err(e) = immutable.set_immutable(path, false).await {
        debug!("Could not clear immutable flag on {}: {}", path.display(), e);
    }
    let written = tokio::fs::write(path, content).await.map_err(|e| {
        GlockerError::mutation(Resource::Hosts, format!("writing {}: {}", path.display(), e))
    });
    if relock {
        if let Err(e) = immutable.set_immutable(path, true).await {
            warn!("Could not set immutable flag on {}: {}", path.display(), e);
        }
    }
    written
}

/// Remove the managed section and leave the file mutable
pub async fn remove_section(path: &Path, immutable: &dyn ImmutableFlag) -> Result<bool> {
    let current = read_hosts(path).await?;
    let stripped = strip_section(&current);
    if let Err(e) = immutable.set_immutable(path, false).await {
        debug!("Could not clear immutable flag on {}: {}", path.display(), e);
    }
    if stripped == current {
        return Ok(false);
    }
    write_guarded(path, &stripped, immutable, false).await?;
    info!("Removed glocker section from {}", path.display());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::fake::FakeImmutable;
    use tempfile::TempDir;

    const BASE: &str = "127.0.0.1 localhost\n::1 localhost\n# keep me\n";

    fn domains(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_four_lines_per_domain() {
        let section = render_section(&domains(&["example.com"]));
        assert_eq!(
            section,
            "### GLOCKER START ###\n\
             127.0.0.1 example.com\n\
             127.0.0.1 www.example.com\n\
             ::1 example.com\n\
             ::1 www.example.com\n\
             ### GLOCKER END ###\n"
        );
    }

    #[test]
    fn test_ip_literals_not_in_hosts() {
        let section = render_section(&domains(&["10.1.2.3", "a.com"]));
        assert!(!section.contains("10.1.2.3"));
        assert!(section.contains("127.0.0.1 a.com"));
    }

    #[test]
    fn test_apply_preserves_outside_and_is_idempotent() {
        let once = apply_section(BASE, &domains(&["a.com", "b.com"]));
        assert!(once.starts_with(BASE));
        let twice = apply_section(&once, &domains(&["a.com", "b.com"]));
        assert_eq!(once, twice);
    }

    #[test]
    fn test_section_in_the_middle_is_replaced() {
        let content = format!("{}{}# trailing\n", BASE, render_section(&domains(&["old.com"])));
        let updated = apply_section(&content, &domains(&["new.com"]));
        assert!(!updated.contains("old.com"));
        assert!(updated.contains("# trailing\n"));
        assert_eq!(strip_section(&updated), format!("{}# trailing\n", BASE));
    }

    #[test]
    fn test_no_trailing_newline() {
        let updated = apply_section("127.0.0.1 localhost", &domains(&["a.com"]));
        assert!(updated.starts_with("127.0.0.1 localhost\n### GLOCKER START ###\n"));
    }

    #[test]
    fn test_unterminated_section_runs_to_eof() {
        let content = format!("{}{}\n127.0.0.1 a.com\n", BASE, SECTION_START);
        assert_eq!(strip_section(&content), BASE);
    }

    #[tokio::test]
    async fn test_reconcile_twice_is_byte_identical() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hosts");
        tokio::fs::write(&path, BASE).await.unwrap();
        let immutable = FakeImmutable::default();
        let store = StateStore::new();
        let blocked = domains(&["example.com"]);

        assert!(reconcile(&path, &blocked, &immutable, &store).await.unwrap());
        let first = tokio::fs::read(&path).await.unwrap();
        assert!(!reconcile(&path, &blocked, &immutable, &store).await.unwrap());
        let second = tokio::fs::read(&path).await.unwrap();
        assert_eq!(first, second);
        assert!(immutable.is_immutable(&path));

        // Baseline tracks the managed section just written
        let expected = tamper::fingerprint(&path, HashScope::ManagedSection).await;
        let trusted = store.with_baseline(|b| b.trusted.files.get(&path).cloned());
        assert_eq!(trusted, Some(expected));
    }

    #[tokio::test]
    async fn test_remove_section_leaves_mutable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hosts");
        tokio::fs::write(&path, apply_section(BASE, &domains(&["a.com"])))
            .await
            .unwrap();
        let immutable = FakeImmutable::default();
        assert!(remove_section(&path, &immutable).await.unwrap());
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), BASE);
        assert!(!immutable.is_immutable(&path));
    }
}
