//! Sudoers management
//!
//! Exactly one line in the sudoers file is ours, tagged with
//! `# GLOCKER-MANAGED`. Every write goes to a temporary file, passes the
//! syntax validator, and only then replaces the live file by rename. A
//! candidate that fails validation never touches the live file.

use crate::state::StateStore;
use crate::system::SyntaxValidator;
use crate::tamper::{self, HashScope};
use glocker_common::{GlockerError, Resource, Result, SudoersConfig};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const MANAGED_TAG: &str = "# GLOCKER-MANAGED";

const SUDOERS_MODE: u32 = 0o440;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SudoersOutcome {
    Unchanged,
    Updated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    FromBackup,
    Patched,
}

fn mutation(msg: String) -> GlockerError {
    GlockerError::mutation(Resource::Sudoers, msg)
}

/// Candidate file with the user's line replaced by `target` plus the tag.
///
/// The first tagged line or unmanaged line for `user` becomes the managed
/// line; any further matches are dropped. Appended if nothing matches.
pub fn render(current: &str, user: &str, target: &str) -> String {
    let managed = format!("{} {}", target, MANAGED_TAG);
    let owned = format!("{} ", user);
    let commented = format!("# {} ", user);

    let body = current.strip_suffix('\n').unwrap_or(current);
    let mut lines: Vec<&str> = Vec::new();
    let mut placed = false;

    if !body.is_empty() {
        for line in body.split('\n') {
            let trimmed = line.trim();
            let ours = line.contains(MANAGED_TAG)
                || trimmed.starts_with(&owned)
                || trimmed.starts_with(&commented);
            if ours {
                if !placed {
                    lines.push(&managed);
                    placed = true;
                }
                continue;
            }
            lines.push(line);
        }
    }
    if !placed {
        lines.push(&managed);
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

async fn set_mode(path: &Path) -> Result<()> {
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(SUDOERS_MODE))
        .await
        .map_err(|e| mutation(format!("chmod {}: {}", path.display(), e)))
}

/// Validate `content` at a temporary path and rename it over `path`
async fn commit(
    path: &Path,
    content: &[u8],
    validator: &dyn SyntaxValidator,
    store: &StateStore,
) -> Result<()> {
    let tmp = tmp_path(path);
    tokio::fs::write(&tmp, content)
        .await
        .map_err(|e| mutation(format!("writing {}: {}", tmp.display(), e)))?;
    set_mode(&tmp).await?;

    if let Err(e) = validator.validate(&tmp).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }

    store.begin_write();
    let renamed = tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| mutation(format!("replacing {}: {}", path.display(), e)));
    let moded = match &renamed {
        Ok(()) => set_mode(path).await,
        Err(_) => Ok(()),
    };
    store.finish_write(tamper::fingerprint(path, HashScope::WholeFile).await);

    if renamed.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    renamed?;
    moded
}

/// Snapshot the pristine sudoers file once, before the first managed write
pub async fn ensure_backup(cfg: &SudoersConfig) -> Result<bool> {
    if tokio::fs::try_exists(&cfg.backup_path).await.unwrap_or(false) {
        return Ok(false);
    }
    tokio::fs::copy(&cfg.path, &cfg.backup_path)
        .await
        .map_err(|e| mutation(format!("backing up {}: {}", cfg.path.display(), e)))?;
    set_mode(&cfg.backup_path).await?;
    info!("Saved sudoers backup to {}", cfg.backup_path.display());
    Ok(true)
}

/// Install the allowed or blocked line for `cfg.user`
pub async fn reconcile(
    cfg: &SudoersConfig,
    allowed: bool,
    validator: &dyn SyntaxValidator,
    store: &StateStore,
) -> Result<SudoersOutcome> {
    ensure_backup(cfg).await?;

    let current = tokio::fs::read_to_string(&cfg.path)
        .await
        .map_err(|e| mutation(format!("reading {}: {}", cfg.path.display(), e)))?;
    let target = if allowed {
        &cfg.allowed_sudoers_line
    } else {
        &cfg.blocked_sudoers_line
    };
    let candidate = render(&current, &cfg.user, target);
    if candidate == current {
        debug!("Sudoers already up to date (allowed={})", allowed);
        return Ok(SudoersOutcome::Unchanged);
    }

    commit(&cfg.path, candidate.as_bytes(), validator, store).await?;
    info!(
        "Sudoers updated: access {} for {}",
        if allowed { "allowed" } else { "blocked" },
        cfg.user
    );
    Ok(SudoersOutcome::Updated)
}

/// Put sudoers back: the backup if it still validates, otherwise the
/// managed line switched to the allowed line. The backup is removed after.
pub async fn restore(
    cfg: &SudoersConfig,
    validator: &dyn SyntaxValidator,
    store: &StateStore,
) -> Result<RestoreOutcome> {
    let outcome = match tokio::fs::read(&cfg.backup_path).await {
        Ok(pristine) => match commit(&cfg.path, &pristine, validator, store).await {
            Ok(()) => RestoreOutcome::FromBackup,
            Err(e) => {
                warn!("Sudoers backup rejected ({}), patching managed line instead", e);
                patch_allowed(cfg, validator, store).await?
            }
        },
        Err(e) => {
            debug!("No sudoers backup ({}), patching managed line", e);
            patch_allowed(cfg, validator, store).await?
        }
    };

    if let Err(e) = tokio::fs::remove_file(&cfg.backup_path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Could not remove {}: {}", cfg.backup_path.display(), e);
        }
    }
    info!("Sudoers restored ({:?})", outcome);
    Ok(outcome)
}

async fn patch_allowed(
    cfg: &SudoersConfig,
    validator: &dyn SyntaxValidator,
    store: &StateStore,
) -> Result<RestoreOutcome> {
    let current = tokio::fs::read_to_string(&cfg.path)
        .await
        .map_err(|e| mutation(format!("reading {}: {}", cfg.path.display(), e)))?;
    let candidate = render(&current, &cfg.user, &cfg.allowed_sudoers_line);
    if candidate != current {
        commit(&cfg.path, candidate.as_bytes(), validator, store).await?;
    }
    Ok(RestoreOutcome::Patched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::fake::FakeValidator;
    use tempfile::TempDir;

    const ALLOWED: &str = "alice ALL=(ALL) ALL";
    const BLOCKED: &str = "# alice ALL=(ALL) ALL";
    const BASE: &str = "Defaults env_reset\nroot ALL=(ALL) ALL\nalice ALL=(ALL) ALL\n";

    fn cfg(dir: &TempDir) -> SudoersConfig {
        SudoersConfig {
            enabled: true,
            user: "alice".to_string(),
            allowed_sudoers_line: ALLOWED.to_string(),
            blocked_sudoers_line: BLOCKED.to_string(),
            time_allowed: Vec::new(),
            path: dir.path().join("sudoers"),
            backup_path: dir.path().join("sudoers.glocker.backup"),
        }
    }

    #[test]
    fn test_render_replaces_user_line() {
        let out = render(BASE, "alice", BLOCKED);
        assert_eq!(
            out,
            "Defaults env_reset\nroot ALL=(ALL) ALL\n# alice ALL=(ALL) ALL # GLOCKER-MANAGED\n"
        );
        // Second pass finds the tagged line
        assert_eq!(render(&out, "alice", BLOCKED), out);
        let allowed = render(&out, "alice", ALLOWED);
        assert!(allowed.ends_with("alice ALL=(ALL) ALL # GLOCKER-MANAGED\n"));
    }

    #[test]
    fn test_render_appends_when_absent() {
        let out = render("root ALL=(ALL) ALL\n", "alice", ALLOWED);
        assert_eq!(out, "root ALL=(ALL) ALL\nalice ALL=(ALL) ALL # GLOCKER-MANAGED\n");
        assert_eq!(render("", "alice", ALLOWED), "alice ALL=(ALL) ALL # GLOCKER-MANAGED\n");
    }

    #[test]
    fn test_render_collapses_duplicates() {
        let content = "alice ALL=(ALL) ALL\n# alice ALL=(ALL) ALL\n";
        let out = render(content, "alice", BLOCKED);
        assert_eq!(out.matches(MANAGED_TAG).count(), 1);
    }

    #[test]
    fn test_render_ignores_other_users() {
        let out = render("alicex ALL=(ALL) ALL\n", "alice", ALLOWED);
        assert!(out.starts_with("alicex ALL=(ALL) ALL\n"));
    }

    #[tokio::test]
    async fn test_failed_validation_leaves_file_untouched() {
        let dir = TempDir::new().unwrap();
        let cfg = cfg(&dir);
        tokio::fs::write(&cfg.path, BASE).await.unwrap();
        let before = tokio::fs::read(&cfg.path).await.unwrap();

        let validator = FakeValidator::default();
        validator.set_rejecting(true);
        let store = StateStore::new();

        let err = reconcile(&cfg, false, &validator, &store).await.unwrap_err();
        assert!(matches!(err, GlockerError::ResourceMutation { .. }));
        assert_eq!(tokio::fs::read(&cfg.path).await.unwrap(), before);
        assert!(!tmp_path(&cfg.path).exists());
        assert!(store.with_baseline(|b| b.is_settled()));
    }

    #[tokio::test]
    async fn test_reconcile_writes_and_backs_up_once() {
        let dir = TempDir::new().unwrap();
        let cfg = cfg(&dir);
        tokio::fs::write(&cfg.path, BASE).await.unwrap();
        let validator = FakeValidator::default();
        let store = StateStore::new();

        assert_eq!(
            reconcile(&cfg, false, &validator, &store).await.unwrap(),
            SudoersOutcome::Updated
        );
        let mode = std::fs::metadata(&cfg.path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o440);
        assert_eq!(tokio::fs::read_to_string(&cfg.backup_path).await.unwrap(), BASE);

        assert_eq!(
            reconcile(&cfg, false, &validator, &store).await.unwrap(),
            SudoersOutcome::Unchanged
        );
        reconcile(&cfg, true, &validator, &store).await.unwrap();
        // Backup still holds the pristine file
        assert_eq!(tokio::fs::read_to_string(&cfg.backup_path).await.unwrap(), BASE);
    }

    #[tokio::test]
    async fn test_restore_from_backup() {
        let dir = TempDir::new().unwrap();
        let cfg = cfg(&dir);
        tokio::fs::write(&cfg.path, BASE).await.unwrap();
        let validator = FakeValidator::default();
        let store = StateStore::new();
        reconcile(&cfg, false, &validator, &store).await.unwrap();

        assert_eq!(
            restore(&cfg, &validator, &store).await.unwrap(),
            RestoreOutcome::FromBackup
        );
        assert_eq!(tokio::fs::read_to_string(&cfg.path).await.unwrap(), BASE);
        assert!(!cfg.backup_path.exists());
    }

    #[tokio::test]
    async fn test_restore_without_backup_patches() {
        let dir = TempDir::new().unwrap();
        let cfg = cfg(&dir);
        tokio::fs::write(
            &cfg.path,
            "root ALL=(ALL) ALL\n# alice ALL=(ALL) ALL # GLOCKER-MANAGED\n",
        )
        .await
        .unwrap();
        let validator = FakeValidator::default();
        let store = StateStore::new();

        assert_eq!(
            restore(&cfg, &validator, &store).await.unwrap(),
            RestoreOutcome::Patched
        );
        assert_eq!(
            tokio::fs::read_to_string(&cfg.path).await.unwrap(),
            "root ALL=(ALL) ALL\nalice ALL=(ALL) ALL # GLOCKER-MANAGED\n"
        );
    }
}
