//! Terminal answers for operator prompts.

use homecare_core::prompt::Prompt;
use std::io::{self, BufRead, Write};

/// Asks on stdout and reads the answer from stdin.
///
/// With `assume_yes` every confirmation is answered with yes without asking.
pub struct TerminalPrompt {
    assume_yes: bool,
}

impl TerminalPrompt {
    pub fn new(assume_yes: bool) -> Self {
        Self { assume_yes }
    }

    fn read_line(&self, message: &str) -> Option<String> {
        print!("{message} ");
        io::stdout().flush().ok()?;
        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim().to_owned()),
        }
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.to_lowercase().as_str(), "j" | "ja" | "y" | "yes")
}

impl Prompt for TerminalPrompt {
    fn confirm(&mut self, message: &str) -> bool {
        if self.assume_yes {
            println!("{message} [j/N] j");
            return true;
        }
        self.read_line(&format!("{message} [j/N]"))
            .is_some_and(|answer| is_yes(&answer))
    }

    fn ask_date(&mut self, message: &str) -> Option<String> {
        self.read_line(message).filter(|answer| !answer.is_empty())
    }
}
