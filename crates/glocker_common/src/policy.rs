//! Policy evaluation
//!
//! Pure function of config, time and exceptions. No I/O.

use crate::config::Config;
use crate::exception::ExceptionSet;
use crate::schedule::any_matches;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashSet;
use tracing::debug;

/// What the resources should look like right now
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyDecision {
    /// Blocked domains in config order, deduplicated
    pub blocked: Vec<String>,
    pub sudo_allowed: bool,
}

impl PolicyDecision {
    pub fn is_blocked(&self, domain: &str) -> bool {
        self.blocked.iter().any(|d| d.eq_ignore_ascii_case(domain))
    }
}

/// Evaluate `config` at `now` (in the zone whose weekday and wall time apply).
///
/// Exception expiry is checked against the same instant in UTC.
pub fn evaluate<Tz: TimeZone>(
    config: &Config,
    now: &DateTime<Tz>,
    exceptions: &ExceptionSet,
) -> PolicyDecision {
    let now_utc = now.with_timezone(&Utc);
    let mut seen = HashSet::new();
    let mut blocked = Vec::new();

    for domain in &config.domains {
        let key = domain.name.to_ascii_lowercase();
        if seen.contains(&key) {
            continue;
        }

        if !domain.absolute && exceptions.is_excepted(&domain.name, now_utc) {
            if domain.log_blocking {
                debug!(domain = %domain.name, "Temporarily unblocked");
            }
            continue;
        }

        let is_blocked = domain.always_block
            || domain.time_windows.is_empty()
            || any_matches(&domain.time_windows, now);

        if is_blocked {
            if domain.log_blocking {
                debug!(domain = %domain.name, "Blocked");
            }
            seen.insert(key);
            blocked.push(domain.name.clone());
        }
    }

    // Fail closed: no matching window means no sudo
    let sudo_allowed = any_matches(&config.sudoers.time_allowed, now);

    PolicyDecision {
        blocked,
        sudo_allowed,
    }
}
