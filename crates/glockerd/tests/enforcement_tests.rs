//! Enforcement cycle tests
//!
//! Drive full reconciliation cycles against temp files and fake
//! collaborators, with a manual clock standing in for wall time.

mod common;

use chrono::{Duration, Weekday};
use common::{Harness, HOSTS_BASE};
use glocker_common::{ClockTime, Command, Domain, Resource, TimeWindow};
use glockerd::commands;
use glockerd::hosts::{managed_section, SECTION_END, SECTION_START};
use glockerd::run_cycle;

const ALLOWED: &str = "alice ALL=(ALL) ALL";
const BLOCKED: &str = "# alice ALL=(ALL) ALL";
const SUDOERS: &str = "Defaults env_reset\nroot ALL=(ALL) ALL\nalice ALL=(ALL) ALL\n";

fn window(start: (u32, u32), end: (u32, u32)) -> TimeWindow {
    TimeWindow::new(
        ClockTime::new(start.0, start.1).unwrap(),
        ClockTime::new(end.0, end.1).unwrap(),
        vec![Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri],
    )
}

fn with_sudoers(h: &Harness) {
    std::fs::write(h.ctx.config().sudoers.path.clone(), SUDOERS).unwrap();
}

fn sudoers_config(config: &mut glocker_common::Config, dir: &tempfile::TempDir) {
    config.sudoers.enabled = true;
    config.sudoers.user = "alice".to_string();
    config.sudoers.allowed_sudoers_line = ALLOWED.to_string();
    config.sudoers.blocked_sudoers_line = BLOCKED.to_string();
    config.sudoers.path = dir.path().join("sudoers");
    config.sudoers.backup_path = dir.path().join("sudoers.glocker.backup");
}

// ============================================================================
// Test: End to end block, unblock, expiry
// ============================================================================

#[tokio::test]
async fn test_unblock_then_automatic_reblock() {
    let h = Harness::new(|_, _| {});

    let report = run_cycle(&h.ctx).await;
    assert!(report.is_clean());
    assert_eq!(report.decision.blocked, vec!["example.com".to_string()]);

    let hosts = h.hosts();
    assert!(hosts.starts_with(HOSTS_BASE));
    assert_eq!(
        managed_section(&hosts),
        format!(
            "{}\n127.0.0.1 example.com\n127.0.0.1 www.example.com\n::1 example.com\n::1 www.example.com\n{}\n",
            SECTION_START, SECTION_END
        )
    );
    assert_eq!(h.fakes.firewall.rules().len(), 1);

    let unblock = Command::parse("unblock:example.com:work").unwrap();
    commands::precheck(&h.ctx, &unblock).unwrap();
    commands::execute(&h.ctx, unblock).await.unwrap();

    let blocked = h.ctx.store.runtime().last_decision.unwrap().blocked;
    assert!(blocked.is_empty());
    assert!(!h.hosts().contains("example.com"));
    assert!(h.fakes.firewall.rules().is_empty());

    // One minute short of expiry: still open
    h.clock.advance(Duration::minutes(29));
    assert!(run_cycle(&h.ctx).await.decision.blocked.is_empty());

    h.clock.advance(Duration::minutes(1));
    let report = run_cycle(&h.ctx).await;
    assert_eq!(report.restored, vec!["example.com".to_string()]);
    assert_eq!(report.decision.blocked, vec!["example.com".to_string()]);
    assert!(h.hosts().contains("127.0.0.1 www.example.com"));
    assert_eq!(h.fakes.firewall.rules().len(), 1);
}

#[tokio::test]
async fn test_second_cycle_leaves_hosts_byte_identical() {
    let h = Harness::new(|_, _| {});
    run_cycle(&h.ctx).await;
    let first = std::fs::read(&h.ctx.config().hosts_path).unwrap();
    run_cycle(&h.ctx).await;
    let second = std::fs::read(&h.ctx.config().hosts_path).unwrap();
    assert_eq!(first, second);
}

// ============================================================================
// Test: Schedules and absolute domains
// ============================================================================

#[tokio::test]
async fn test_time_window_blocks_only_inside() {
    let h = Harness::new(|config, _| {
        config.domains.push(Domain {
            always_block: false,
            time_windows: vec![window((9, 0), (17, 0))],
            ..Domain::always("news.example")
        });
    });

    let blocked = run_cycle(&h.ctx).await.decision.blocked;
    assert!(blocked.contains(&"news.example".to_string()));

    h.clock.advance(Duration::hours(9));
    let blocked = run_cycle(&h.ctx).await.decision.blocked;
    assert!(!blocked.contains(&"news.example".to_string()));
    assert!(blocked.contains(&"example.com".to_string()));
    assert!(!h.hosts().contains("news.example"));
}

#[tokio::test]
async fn test_absolute_domain_cannot_be_unblocked() {
    let h = Harness::new(|config, _| {
        config.domains.push(Domain {
            absolute: true,
            ..Domain::always("casino.example")
        });
    });

    let cmd = Command::parse("unblock:casino.example:work").unwrap();
    assert!(commands::precheck(&h.ctx, &cmd).is_err());
    assert!(commands::execute(&h.ctx, cmd).await.is_err());
    assert!(h.ctx.store.exceptions_snapshot().is_empty());

    let blocked = run_cycle(&h.ctx).await.decision.blocked;
    assert!(blocked.contains(&"casino.example".to_string()));
}

// ============================================================================
// Test: Sudoers
// ============================================================================

#[tokio::test]
async fn test_sudoers_follows_allowed_window() {
    let h = Harness::new(|config, dir| {
        sudoers_config(config, dir);
        config.sudoers.time_allowed = vec![window((8, 0), (10, 0))];
    });
    with_sudoers(&h);
    let path = h.ctx.config().sudoers.path.clone();

    assert!(run_cycle(&h.ctx).await.sudo_applied);
    assert!(std::fs::read_to_string(&path)
        .unwrap()
        .contains("alice ALL=(ALL) ALL # GLOCKER-MANAGED\n"));

    h.clock.advance(Duration::hours(2));
    assert!(!run_cycle(&h.ctx).await.sudo_applied);
    assert!(std::fs::read_to_string(&path)
        .unwrap()
        .contains("# alice ALL=(ALL) ALL # GLOCKER-MANAGED\n"));
}

#[tokio::test]
async fn test_rejected_sudoers_candidate_is_isolated() {
    let h = Harness::new(|config, dir| sudoers_config(config, dir));
    with_sudoers(&h);
    h.fakes.validator.set_rejecting(true);
    let path = h.ctx.config().sudoers.path.clone();

    let report = run_cycle(&h.ctx).await;
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].0, Resource::Sudoers);

    // Live file untouched, other resources still applied
    assert_eq!(std::fs::read_to_string(&path).unwrap(), SUDOERS);
    assert!(h.hosts().contains("127.0.0.1 example.com"));
    assert_eq!(h.fakes.firewall.rules().len(), 1);
}

#[tokio::test]
async fn test_lock_forces_blocked_line_until_window_changes() {
    let h = Harness::new(|config, dir| {
        sudoers_config(config, dir);
        config.sudoers.time_allowed = vec![window((8, 0), (10, 0))];
    });
    with_sudoers(&h);
    let path = h.ctx.config().sudoers.path.clone();

    assert!(run_cycle(&h.ctx).await.sudo_applied);
    commands::execute(&h.ctx, Command::Lock).await.unwrap();
    assert!(std::fs::read_to_string(&path)
        .unwrap()
        .contains("# alice ALL=(ALL) ALL # GLOCKER-MANAGED"));
    assert!(!run_cycle(&h.ctx).await.sudo_applied);

    // Window closes, lock released; next morning sudo comes back
    h.clock.advance(Duration::hours(2));
    assert!(!run_cycle(&h.ctx).await.sudo_applied);
    assert!(h.ctx.store.runtime().sudo_lock.is_none());
    h.clock.advance(Duration::hours(22));
    assert!(run_cycle(&h.ctx).await.sudo_applied);
}

// ============================================================================
// Test: Firewall
// ============================================================================

#[tokio::test]
async fn test_unresolvable_domain_does_not_fail_cycle() {
    let h = Harness::new(|config, _| {
        config.domains.push(Domain::always("gone.example"));
        config.domains.push(Domain::always("203.0.113.7"));
    });
    h.fakes.resolver.fail("gone.example");

    let report = run_cycle(&h.ctx).await;
    assert!(report.is_clean());
    let rules = h.fakes.firewall.rules();
    assert_eq!(rules.len(), 2);
    assert!(rules.contains(&"203.0.113.7".parse().unwrap()));
    assert!(h.hosts().contains("127.0.0.1 gone.example"));
    assert!(!h.hosts().contains("203.0.113.7"));
}

#[tokio::test]
async fn test_block_command_persists_and_applies() {
    let h = Harness::new(|_, _| {});
    commands::execute(
        &h.ctx,
        Command::parse("block:reddit.com").unwrap(),
    )
    .await
    .unwrap();

    assert!(h.hosts().contains("127.0.0.1 reddit.com"));
    let saved = std::fs::read_to_string(h.path("config.yaml")).unwrap();
    assert!(saved.contains("reddit.com"));
}

// ============================================================================
// Test: Nothing is re-applied after uninstall
// ============================================================================

#[tokio::test]
async fn test_cycles_after_uninstall_leave_system_restored() {
    let h = Harness::new(|_, _| {});
    run_cycle(&h.ctx).await;
    assert!(h.hosts().contains("example.com"));
    assert_eq!(h.fakes.firewall.rules().len(), 1);

    glockerd::uninstall::run(&h.ctx, "moving machines").await;
    assert_eq!(h.hosts(), HOSTS_BASE);
    assert!(h.fakes.firewall.rules().is_empty());

    let report = run_cycle(&h.ctx).await;
    assert!(!report.enforced);
    commands::execute(
        &h.ctx,
        Command::Block {
            domains: vec!["new.example".to_string()],
        },
    )
    .await
    .unwrap();

    assert_eq!(h.hosts(), HOSTS_BASE);
    assert!(h.fakes.firewall.rules().is_empty());
}
