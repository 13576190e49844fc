//! Operator prompts.
//!
//! Some workflows need a decision from the operator halfway through: restoring a record
//! that already exists, or accepting a suggested end date. Core code asks through the
//! [`Prompt`] trait and never knows whether a terminal, a test or a GUI answers.

/// What the operator is being asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    /// A yes/no question.
    Confirm,
    /// A free-text date entry.
    DateEntry,
}

/// State of a [`PromptSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptState {
    Idle,
    Prompting(PromptKind),
    Confirmed,
    Cancelled,
}

/// Answers operator questions.
pub trait Prompt {
    /// Asks a yes/no question. `true` means yes.
    fn confirm(&mut self, message: &str) -> bool;

    /// Asks for a date in free text. `None` means the operator cancelled.
    fn ask_date(&mut self, message: &str) -> Option<String>;
}

/// Drives a [`Prompt`] and records where the conversation stands.
pub struct PromptSession<'a> {
    prompt: &'a mut dyn Prompt,
    state: PromptState,
}

impl<'a> PromptSession<'a> {
    pub fn new(prompt: &'a mut dyn Prompt) -> Self {
        Self {
            prompt,
            state: PromptState::Idle,
        }
    }

    pub fn state(&self) -> &PromptState {
        &self.state
    }

    pub fn confirm(&mut self, message: &str) -> bool {
        self.state = PromptState::Prompting(PromptKind::Confirm);
        let answer = self.prompt.confirm(message);
        self.state = if answer {
            PromptState::Confirmed
        } else {
            PromptState::Cancelled
        };
        answer
    }

    pub fn ask_date(&mut self, message: &str) -> Option<String> {
        self.state = PromptState::Prompting(PromptKind::DateEntry);
        let answer = self.prompt.ask_date(message);
        self.state = match answer {
            Some(_) => PromptState::Confirmed,
            None => PromptState::Cancelled,
        };
        answer
    }
}

/// Says yes to everything and never enters a date.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoConfirm;

impl Prompt for AutoConfirm {
    fn confirm(&mut self, _message: &str) -> bool {
        true
    }

    fn ask_date(&mut self, _message: &str) -> Option<String> {
        None
    }
}

/// Says no to everything and never enters a date.
#[derive(Debug, Default, Clone, Copy)]
pub struct Decline;

impl Prompt for Decline {
    fn confirm(&mut self, _message: &str) -> bool {
        false
    }

    fn ask_date(&mut self, _message: &str) -> Option<String> {
        None
    }
}

/// Replays scripted answers, then declines. Used by tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct Scripted {
    pub confirms: std::collections::VecDeque<bool>,
    pub dates: std::collections::VecDeque<Option<String>>,
    pub asked: Vec<String>,
}

#[cfg(test)]
impl Prompt for Scripted {
    fn confirm(&mut self, message: &str) -> bool {
        self.asked.push(message.to_owned());
        self.confirms.pop_front().unwrap_or(false)
    }

    fn ask_date(&mut self, message: &str) -> Option<String> {
        self.asked.push(message.to_owned());
        self.dates.pop_front().flatten()
    }
}
