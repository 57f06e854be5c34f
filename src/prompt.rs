use std::io::{BufRead, Write};

use async_trait::async_trait;

/// Yes/no question put to the operator.
#[async_trait]
pub trait Confirm: Send + Sync {
    async fn confirm(&self, question: &str) -> bool;
}

/// Interactive prompt on the controlling terminal. Ctrl+C, EOF and anything
/// other than `y`/`yes` count as "no".
pub struct TerminalConfirm;

#[async_trait]
impl Confirm for TerminalConfirm {
    async fn confirm(&self, question: &str) -> bool {
        let question = question.to_string();
        let read = tokio::task::spawn_blocking(move || {
            let mut stderr = std::io::stderr();
            write!(stderr, "{question} [y/N] ").ok();
            stderr.flush().ok();
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line).ok()?;
            Some(line)
        });
        tokio::select! {
            answer = read => matches!(
                answer.ok().flatten().map(|l| l.trim().to_ascii_lowercase()).as_deref(),
                Some("y") | Some("yes")
            ),
            _ = tokio::signal::ctrl_c() => {
                eprintln!();
                false
            }
        }
    }
}

/// Fixed answer, for `--yes`/`--no-rollback` and non-interactive runs.
pub struct FixedAnswer(pub bool);

#[async_trait]
impl Confirm for FixedAnswer {
    async fn confirm(&self, question: &str) -> bool {
        tracing::info!(answer = self.0, "{question}");
        self.0
    }
}
