//! Collaborators backed by real system tools

use super::{
    CommandLauncher, DnsResolver, Firewall, ImmutableFlag, Notification, Notifier, ProcessControl,
    ProcessInfo, ServiceProbe, Suspender, SyntaxValidator, WakeSource, FIREWALL_TAG,
};
use crate::notifier::render_argv;
use async_trait::async_trait;
use glocker_common::{GlockerError, Resource, Result};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::net::IpAddr;
use std::path::Path;
use std::process::Output;
use std::time::{Duration, Instant, SystemTime};
use tokio::process::Command;
use tracing::{debug, warn};

async fn run(program: &str, args: &[&str]) -> Result<Output> {
    Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| GlockerError::TransientExternal(format!("{}: {}", program, e)))
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

/// Resolves through `dig` so the managed hosts section cannot answer
pub struct DigResolver;

#[async_trait]
impl DnsResolver for DigResolver {
    async fn resolve(&self, domain: &str) -> Result<Vec<IpAddr>> {
        let mut addrs = Vec::new();
        let mut failures = 0;
        for record in ["A", "AAAA"] {
            match run("dig", &["+short", domain, record]).await {
                Ok(output) if output.status.success() => {
                    // CNAME targets come back as names; keep only addresses
                    addrs.extend(
                        String::from_utf8_lossy(&output.stdout)
                            .lines()
                            .filter_map(|line| line.trim().parse::<IpAddr>().ok()),
                    );
                }
                Ok(output) => {
                    failures += 1;
                    debug!(domain, record, "dig failed: {}", stderr_of(&output));
                }
                Err(e) => {
                    failures += 1;
                    debug!(domain, record, "dig failed: {}", e);
                }
            }
        }
        if failures == 2 {
            return Err(GlockerError::TransientExternal(format!(
                "could not resolve {}",
                domain
            )));
        }
        Ok(addrs)
    }
}

/// iptables for IPv4, ip6tables for IPv6, OUTPUT chain only
pub struct IptablesFirewall;

const FAMILIES: [&str; 2] = ["iptables", "ip6tables"];

impl IptablesFirewall {
    async fn tagged_rules(program: &str) -> Result<Vec<String>> {
        let output = run(program, &["-S", "OUTPUT"]).await?;
        if !output.status.success() {
            return Err(GlockerError::mutation(
                Resource::Firewall,
                format!("{} -S OUTPUT: {}", program, stderr_of(&output)),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|line| line.starts_with("-A ") && line.contains(FIREWALL_TAG))
            .map(|line| line.to_string())
            .collect())
    }
}

#[async_trait]
impl Firewall for IptablesFirewall {
    async fn clear_tagged(&self) -> Result<usize> {
        let mut removed = 0;
        for program in FAMILIES {
            for rule in Self::tagged_rules(program).await? {
                let mut args: Vec<&str> = rule.split_whitespace().collect();
                args[0] = "-D";
                let output = run(program, &args).await?;
                if output.status.success() {
                    removed += 1;
                } else {
                    warn!("{} failed to delete rule '{}': {}", program, rule, stderr_of(&output));
                }
            }
        }
        Ok(removed)
    }

    async fn reject(&self, addr: IpAddr) -> Result<()> {
        let (program, reject_with) = match addr {
            IpAddr::V4(_) => ("iptables", "icmp-host-unreachable"),
            IpAddr::V6(_) => ("ip6tables", "icmp6-adm-prohibited"),
        };
        let dest = addr.to_string();
        let output = run(
            program,
            &[
                "-I", "OUTPUT", "-d", &dest, "-m", "comment", "--comment", FIREWALL_TAG, "-j",
                "REJECT", "--reject-with", reject_with,
            ],
        )
        .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(GlockerError::mutation(
                Resource::Firewall,
                format!("{} reject {}: {}", program, dest, stderr_of(&output)),
            ))
        }
    }

    async fn count_tagged(&self) -> Result<usize> {
        let mut count = 0;
        for program in FAMILIES {
            count += Self::tagged_rules(program).await?.len();
        }
        Ok(count)
    }
}

/// `visudo -c -f <path>`
pub struct Visudo;

#[async_trait]
impl SyntaxValidator for Visudo {
    async fn validate(&self, path: &Path) -> Result<()> {
        let path_str = path.to_string_lossy();
        let output = run("visudo", &["-c", "-f", &path_str]).await?;
        if output.status.success() {
            Ok(())
        } else {
            let mut detail = stderr_of(&output);
            if detail.is_empty() {
                detail = String::from_utf8_lossy(&output.stdout).trim().to_string();
            }
            Err(GlockerError::mutation(
                Resource::Sudoers,
                format!("validation failed for {}: {}", path.display(), detail),
            ))
        }
    }
}

/// `chattr +i` / `chattr -i`
pub struct Chattr;

#[async_trait]
impl ImmutableFlag for Chattr {
    async fn set_immutable(&self, path: &Path, immutable: bool) -> Result<()> {
        let flag = if immutable { "+i" } else { "-i" };
        let path_str = path.to_string_lossy();
        let output = run("chattr", &[flag, &path_str]).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(GlockerError::TransientExternal(format!(
                "chattr {} {}: {}",
                flag,
                path.display(),
                stderr_of(&output)
            )))
        }
    }
}

/// `systemctl is-active <unit>`
pub struct Systemctl;

#[async_trait]
impl ServiceProbe for Systemctl {
    async fn is_active(&self, service: &str) -> bool {
        match run("systemctl", &["is-active", service]).await {
            Ok(output) => String::from_utf8_lossy(&output.stdout).trim() == "active",
            Err(_) => false,
        }
    }
}

pub struct ProcessLauncher;

#[async_trait]
impl CommandLauncher for ProcessLauncher {
    async fn launch(&self, command: &str, env: &[(String, String)]) -> Result<()> {
        let mut parts = command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| GlockerError::TransientExternal("empty command".to_string()))?;
        let status = Command::new(program)
            .args(parts)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .status()
            .await
            .map_err(|e| GlockerError::TransientExternal(format!("{}: {}", program, e)))?;
        if status.success() {
            Ok(())
        } else {
            Err(GlockerError::TransientExternal(format!(
                "{} exited with {}",
                program, status
            )))
        }
    }
}

/// Runs the configured notification command with placeholders filled in
pub struct CommandNotifier;

#[async_trait]
impl Notifier for CommandNotifier {
    async fn notify(&self, template: &str, note: &Notification) -> Result<()> {
        let argv = render_argv(template, note);
        let Some((program, args)) = argv.split_first() else {
            debug!(title = %note.title, "No notification command configured");
            return Ok(());
        };
        let status = Command::new(program)
            .args(args)
            .env("DISPLAY", ":0")
            .status()
            .await
            .map_err(|e| GlockerError::TransientExternal(format!("{}: {}", program, e)))?;
        if status.success() {
            Ok(())
        } else {
            Err(GlockerError::TransientExternal(format!(
                "{} exited with {}",
                program, status
            )))
        }
    }
}

/// Runs the configured panic (suspend) command
pub struct CommandSuspender;

#[async_trait]
impl Suspender for CommandSuspender {
    async fn suspend(&self, command: &str) -> Result<()> {
        if command.trim().is_empty() {
            warn!("Panic mode active but no panic_command configured");
            return Ok(());
        }
        ProcessLauncher.launch(command, &[]).await
    }
}

/// Detects resume by the wall clock jumping ahead of the monotonic clock,
/// which does not advance while the machine is suspended
pub struct ClockJumpWake {
    poll: Duration,
    threshold: Duration,
}

impl Default for ClockJumpWake {
    fn default() -> Self {
        Self {
            poll: Duration::from_secs(1),
            threshold: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl WakeSource for ClockJumpWake {
    async fn wait_for_wake(&self, max: Duration) -> bool {
        let started = Instant::now();
        while started.elapsed() < max {
            let mono = Instant::now();
            let wall = SystemTime::now();
            tokio::time::sleep(self.poll).await;
            let mono_elapsed = mono.elapsed();
            let wall_elapsed = wall.elapsed().unwrap_or(Duration::ZERO);
            if wall_elapsed > mono_elapsed + self.threshold {
                debug!(
                    "Wall clock jumped {:?} ahead, treating as resume",
                    wall_elapsed - mono_elapsed
                );
                return true;
            }
        }
        false
    }
}

/// How long a terminated process gets before SIGKILL
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Process table from `ps`, signals through nix
pub struct PsProcesses;

/// Parse `ps -eo pid=,args=` output
pub fn parse_ps(stdout: &str) -> Vec<ProcessInfo> {
    stdout
        .lines()
        .filter_map(|line| {
            let line = line.trim_start();
            let (pid, args) = line.split_once(char::is_whitespace)?;
            let pid = pid.parse().ok()?;
            let args = args.trim();
            let program = args.split_whitespace().next()?;
            // Kernel threads show up as `[name]`
            let name = if program.starts_with('[') {
                args.trim_matches(|c| c == '[' || c == ']').to_string()
            } else {
                Path::new(program)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| program.to_string())
            };
            Some(ProcessInfo {
                pid,
                name,
                command_line: args.to_string(),
            })
        })
        .collect()
}

#[async_trait]
impl ProcessControl for PsProcesses {
    async fn list(&self) -> Result<Vec<ProcessInfo>> {
        let output = run("ps", &["-eo", "pid=,args="]).await?;
        if !output.status.success() {
            return Err(GlockerError::TransientExternal(format!(
                "ps: {}",
                stderr_of(&output)
            )));
        }
        Ok(parse_ps(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn terminate(&self, pid: u32) -> Result<()> {
        let pid = i32::try_from(pid)
            .map(Pid::from_raw)
            .map_err(|_| GlockerError::TransientExternal(format!("invalid pid {}", pid)))?;
        signal::kill(pid, Signal::SIGTERM)
            .map_err(|e| GlockerError::TransientExternal(format!("kill {}: {}", pid, e)))?;

        tokio::spawn(async move {
            tokio::time::sleep(KILL_GRACE).await;
            // Signal 0 only checks for existence
            if signal::kill(pid, None).is_ok() {
                if let Err(e) = signal::kill(pid, Signal::SIGKILL) {
                    debug!("kill -9 {}: {}", pid, e);
                }
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ps() {
        let out = "    1 /sbin/init splash\n 4242 /usr/bin/steam -silent\n  77 [kworker/0:1]\n\n";
        let procs = parse_ps(out);
        assert_eq!(procs.len(), 3);
        assert_eq!(procs[0].pid, 1);
        assert_eq!(procs[0].name, "init");
        assert_eq!(procs[1].name, "steam");
        assert_eq!(procs[1].command_line, "/usr/bin/steam -silent");
        assert_eq!(procs[2].name, "kworker/0:1");
    }
}
