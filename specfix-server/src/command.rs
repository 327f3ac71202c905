/// Recognizing trigger commands in pull request comments.
use std::fmt;

pub const DEFAULT_COMMANDS: &str = "/fix-spec,/retry-spec";

/// Comment bodies that start a repair. Matching is on the whole trimmed
/// comment, case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFilter {
    commands: Vec<String>,
}

impl CommandFilter {
    pub fn new<I, S>(commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut normalized: Vec<String> = Vec::new();
        for command in commands {
            let command = normalize(command.as_ref());
            if !command.is_empty() && !normalized.contains(&command) {
                normalized.push(command);
            }
        }
        Self {
            commands: normalized,
        }
    }

    /// Parse a comma separated list such as `/fix-spec, /retry-spec`.
    pub fn parse(list: &str) -> Self {
        Self::new(list.split(','))
    }

    pub fn matches(&self, comment: &str) -> bool {
        let comment = normalize(comment);
        self.commands.iter().any(|command| *command == comment)
    }

    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl Default for CommandFilter {
    fn default() -> Self {
        Self::parse(DEFAULT_COMMANDS)
    }
}

impl fmt::Display for CommandFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.commands.join(", "))
    }
}

fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}
