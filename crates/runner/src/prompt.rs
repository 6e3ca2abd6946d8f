use std::io::Write;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;

use kt_common::amount::FixedPointAmount;
use kt_engine::ledger::{InputBounds, UserInteraction};

/// Line-based operator prompt on stdin/stdout.
pub struct TerminalPrompt {
    lines: Mutex<Lines<BufReader<Stdin>>>,
}

impl TerminalPrompt {
    pub fn new() -> Self {
        Self {
            lines: Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
        }
    }

    async fn ask(&self, prompt: &str) -> Option<String> {
        print!("{prompt} ");
        if let Err(e) = std::io::stdout().flush() {
            tracing::warn!(error = %e, "Failed to flush prompt");
        }

        match self.lines.lock().await.next_line().await {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read operator input");
                None
            }
        }
    }
}

impl Default for TerminalPrompt {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UserInteraction for TerminalPrompt {
    async fn confirm(&self, prompt: &str) -> bool {
        self.ask(&format!("{prompt} [y/N]"))
            .await
            .is_some_and(|answer| is_yes(&answer))
    }

    async fn numeric_input(&self, prompt: &str, bounds: InputBounds) -> Option<FixedPointAmount> {
        loop {
            let answer = self.ask(prompt).await?;
            if answer.trim().is_empty() {
                return None;
            }
            match parse_amount(&answer) {
                Some(value) => return Some(value),
                None => println!("Not a number, enter a value in {bounds} or leave empty to abort"),
            }
        }
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

/// Accepts a trailing `%` so ratios can be typed as shown.
fn parse_amount(answer: &str) -> Option<FixedPointAmount> {
    answer.trim().trim_end_matches('%').trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirmation_answers() {
        assert!(is_yes("y"));
        assert!(is_yes(" YES\n"));
        assert!(!is_yes(""));
        assert!(!is_yes("no"));
    }

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount("270%"), "270".parse::<FixedPointAmount>().ok());
        assert_eq!(parse_amount(" -12.5 "), "-12.5".parse::<FixedPointAmount>().ok());
        assert_eq!(parse_amount("abc"), None);
    }
}
