//! Panic mode tests

mod common;

use chrono::Duration;
use common::{eventually, Harness};
use glockerd::panic::{self, PanicState};
use std::sync::Arc;

#[tokio::test]
async fn test_early_wake_suspends_again_until_deadline() {
    let h = Harness::new(|config, _| {
        config.panic_command = "systemctl suspend".to_string();
    });
    let suspender = Arc::clone(&h.fakes.suspender);

    let deadline = panic::enter(&h.ctx, 10).await;
    assert_eq!(deadline, common::start() + Duration::minutes(10));
    assert!(eventually(2, || suspender.suspends() == 1).await);

    h.fakes.wake.wake();
    assert!(eventually(2, || suspender.suspends() == 2).await);
    assert_eq!(
        h.ctx.store.panic_state(),
        PanicState::Suspended {
            deadline,
            wake_count: 1
        }
    );

    // Past the deadline the controller stands down on its next poll
    h.clock.advance(Duration::minutes(10));
    let ctx = Arc::clone(&h.ctx);
    assert!(eventually(3, || !ctx.store.panic_state().is_active()).await);
    assert_eq!(suspender.suspends(), 2);
    assert!(h
        .fakes
        .notifier
        .sent()
        .iter()
        .any(|n| n.message == "Panic mode ended"));
}

#[tokio::test]
async fn test_reentering_never_shortens_deadline() {
    let h = Harness::new(|_, _| {});

    let first = panic::enter(&h.ctx, 30).await;
    let second = panic::enter(&h.ctx, 5).await;
    assert_eq!(first, second);

    let longer = panic::enter(&h.ctx, 60).await;
    assert_eq!(longer, common::start() + Duration::minutes(60));
    assert_eq!(h.ctx.store.panic_state().deadline(), Some(longer));

    // Only one controller loop, so only one initial suspend
    let suspender = Arc::clone(&h.fakes.suspender);
    assert!(eventually(1, || suspender.suspends() >= 1).await);
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(suspender.suspends(), 1);
}

#[tokio::test]
async fn test_suspend_does_not_wait_for_notifier() {
    let h = Harness::new(|_, _| {});
    h.fakes.notifier.set_delay(std::time::Duration::from_secs(3));
    let suspender = Arc::clone(&h.fakes.suspender);

    let ctx = Arc::clone(&h.ctx);
    let entering = tokio::spawn(async move { panic::enter(&ctx, 10).await });

    assert!(eventually(1, || suspender.suspends() == 1).await);
    assert!(!entering.is_finished());
}
