//! Confirmation gate for destructive client actions
//!
//! An anti-impulsivity control, not a security boundary: the user types a
//! challenge back and then waits out a delay before the request is sent.

use crate::client::{send_command, Reply};
use crate::config::Config;
use crate::protocol::Command;
use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::info;

pub trait ConfirmationGate: Send + Sync {
    /// Text shown to the user
    fn challenge(&self) -> String;

    fn accepts(&self, input: &str) -> bool;

    /// Wait after a correct answer
    fn delay(&self) -> Duration;
}

const QUOTES: &[&str] = &[
    "The game is afoot.",
    "You see, but you do not observe.",
    "Lord, what fools these mortals be!",
    "The course of true love never did run smooth.",
    "The little things are infinitely the most important.",
    "There is nothing more deceptive than an obvious fact.",
    "We are such stuff as dreams are made on, and our little life is rounded with a sleep.",
    "When you have eliminated the impossible, whatever remains, however improbable, must be the truth.",
];

/// Requires a quote to be typed back exactly
#[derive(Debug, Clone)]
pub struct QuoteGate {
    quote: String,
    delay: Duration,
}

impl QuoteGate {
    pub fn new(quote: impl Into<String>, delay: Duration) -> Self {
        Self {
            quote: quote.into(),
            delay,
        }
    }

    /// A random built-in quote
    pub fn random(delay: Duration) -> Self {
        Self::random_with(&mut rand::thread_rng(), delay)
    }

    pub fn random_with<R: Rng + ?Sized>(rng: &mut R, delay: Duration) -> Self {
        let quote = QUOTES.choose(rng).copied().unwrap_or(QUOTES[0]);
        Self::new(quote, delay)
    }
}

impl ConfirmationGate for QuoteGate {
    /// Two words per line, so the quote cannot be pasted back in one go
    fn challenge(&self) -> String {
        let words: Vec<&str> = self.quote.split_whitespace().collect();
        words
            .chunks(2)
            .map(|pair| pair.join(" "))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn accepts(&self, input: &str) -> bool {
        input.trim_end_matches(['\r', '\n']) == self.quote
    }

    fn delay(&self) -> Duration {
        self.delay
    }
}

/// Accepts anything immediately (dev mode)
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenGate;

impl ConfirmationGate for OpenGate {
    fn challenge(&self) -> String {
        String::new()
    }

    fn accepts(&self, _input: &str) -> bool {
        true
    }

    fn delay(&self) -> Duration {
        Duration::ZERO
    }
}

/// Gate for `config`: open in dev mode, otherwise a quote plus `mindful_delay`
pub fn gate_for(config: &Config) -> Box<dyn ConfirmationGate> {
    if config.dev {
        Box::new(OpenGate)
    } else {
        Box::new(QuoteGate::random(Duration::from_secs(config.mindful_delay)))
    }
}

/// Prompt until the gate accepts, then wait out its delay.
///
/// Returns the number of attempts. Fails if input ends first.
pub async fn pass_gate<R, W>(gate: &dyn ConfirmationGate, input: &mut R, output: &mut W) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let challenge = gate.challenge();
    let mut attempts = 0;

    if !challenge.is_empty() {
        loop {
            let prompt = format!(
                "Type the following quote exactly as shown:\n\n{}\n\nType here: ",
                challenge
            );
            output.write_all(prompt.as_bytes()).await?;
            output.flush().await?;

            let mut line = String::new();
            let n = input
                .read_line(&mut line)
                .await
                .context("Failed to read confirmation")?;
            if n == 0 {
                anyhow::bail!("Confirmation aborted");
            }
            attempts += 1;
            if gate.accepts(&line) {
                break;
            }
            output
                .write_all(b"\nThat doesn't match exactly. Please try again.\n\n")
                .await?;
        }
    }

    let delay = gate.delay();
    if !delay.is_zero() {
        let msg = format!(
            "Waiting {} seconds before proceeding...\n",
            delay.as_secs_f32().ceil() as u64
        );
        output.write_all(msg.as_bytes()).await?;
        output.flush().await?;
        tokio::time::sleep(delay).await;
    }
    Ok(attempts)
}

/// Pass the gate on stdin/stdout and send `uninstall:<reason>`
pub async fn confirmed_uninstall(
    gate: &dyn ConfirmationGate,
    socket: &Path,
    reason: &str,
) -> Result<Reply> {
    let mut stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    pass_gate(gate, &mut stdin, &mut stdout).await?;

    info!(reason, "Sending uninstall request");
    send_command(
        socket,
        &Command::Uninstall {
            reason: reason.to_string(),
        },
    )
    .await
}
