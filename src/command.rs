//! Client commands as received on the control connection

use std::fmt;

/// One FTP command line split into its verb and raw argument.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    verb: String,
    argument: String,
}

impl Command {
    pub fn new(verb: impl AsRef<str>, argument: impl Into<String>) -> Self {
        Self { verb: verb.as_ref().to_ascii_uppercase(), argument: argument.into() }
    }

    /// Split a decoded line (without line terminator) at the first space.
    pub fn parse(line: &str) -> Self {
        let line = line.trim_start();
        match line.split_once(' ') {
            Some((verb, argument)) => Self::new(verb, argument),
            None => Self::new(line, String::new()),
        }
    }

    pub fn verb(&self) -> &str {
        &self.verb
    }

    pub fn argument(&self) -> &str {
        &self.argument
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never log passwords
        match self.verb.as_str() {
            "PASS" => write!(f, "PASS **********"),
            _ if self.argument.is_empty() => write!(f, "{}", self.verb),
            _ => write!(f, "{} {}", self.verb, self.argument),
        }
    }
}
