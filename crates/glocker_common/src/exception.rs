//! Temporary exceptions
//!
//! Exceptions live in a map keyed by domain plus a time-ordered index, so
//! expiry is a scan from the front of the index rather than one timer per
//! exception.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// A time-boxed removal of one domain from the blocked set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemporaryException {
    pub domain: String,
    pub reason: String,
    pub granted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TemporaryException {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Whole minutes left, rounded up
    pub fn remaining_minutes(&self, now: DateTime<Utc>) -> i64 {
        let secs = (self.expires_at - now).num_seconds();
        if secs <= 0 {
            0
        } else {
            (secs + 59) / 60
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ExceptionSet {
    by_domain: HashMap<String, TemporaryException>,
    by_expiry: BTreeSet<(DateTime<Utc>, String)>,
}

impl ExceptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the exception for `exception.domain`
    pub fn insert(&mut self, exception: TemporaryException) -> Option<TemporaryException> {
        let key = exception.domain.to_ascii_lowercase();
        let previous = self.by_domain.remove(&key);
        if let Some(prev) = &previous {
            self.by_expiry.remove(&(prev.expires_at, key.clone()));
        }
        self.by_expiry.insert((exception.expires_at, key.clone()));
        self.by_domain.insert(key, exception);
        previous
    }

    pub fn cancel(&mut self, domain: &str) -> Option<TemporaryException> {
        let key = domain.to_ascii_lowercase();
        let removed = self.by_domain.remove(&key)?;
        self.by_expiry.remove(&(removed.expires_at, key));
        Some(removed)
    }

    /// Drop every exception with `expires_at <= now`, earliest first
    pub fn expire(&mut self, now: DateTime<Utc>) -> Vec<TemporaryException> {
        let mut expired = Vec::new();
        while let Some((at, _)) = self.by_expiry.first() {
            if *at > now {
                break;
            }
            if let Some((_, key)) = self.by_expiry.pop_first() {
                if let Some(exception) = self.by_domain.remove(&key) {
                    expired.push(exception);
                }
            }
        }
        expired
    }

    /// True only while the exception is unexpired
    pub fn is_excepted(&self, domain: &str, now: DateTime<Utc>) -> bool {
        self.get(domain).map(|e| e.is_active(now)).unwrap_or(false)
    }

    pub fn get(&self, domain: &str) -> Option<&TemporaryException> {
        self.by_domain.get(&domain.to_ascii_lowercase())
    }

    /// Exceptions ordered by expiry
    pub fn iter(&self) -> impl Iterator<Item = &TemporaryException> {
        self.by_expiry
            .iter()
            .filter_map(|(_, key)| self.by_domain.get(key))
    }

    pub fn next_expiry(&self) -> Option<DateTime<Utc>> {
        self.by_expiry.first().map(|(at, _)| *at)
    }

    pub fn len(&self) -> usize {
        self.by_domain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_domain.is_empty()
    }
}
