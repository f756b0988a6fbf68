use super::{convert, Command, CommandValue};
use crate::error::CommandError;

/// Which form of a command a string matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    /// The set form, possibly carrying a value.
    Set,
    /// The query form.
    Query,
    /// Neither form.
    None,
}

/// Result of matching a string against a [`Command`].
#[derive(Debug, Clone)]
pub struct CommandMatch<'a> {
    command: &'a Command,
    kind: MatchKind,
    value: Option<String>,
}

impl<'a> CommandMatch<'a> {
    pub(super) fn new(command: &'a Command, kind: MatchKind, value: Option<String>) -> Self {
        Self {
            command,
            kind,
            value,
        }
    }

    /// The command that was matched against.
    pub fn command(&self) -> &'a Command {
        self.command
    }

    /// How the string matched.
    pub fn kind(&self) -> MatchKind {
        self.kind
    }

    /// Whether either form matched.
    pub fn is_match(&self) -> bool {
        self.kind != MatchKind::None
    }

    /// Whether the string was the query form.
    pub fn is_query(&self) -> bool {
        self.kind == MatchKind::Query
    }

    /// Decode a value.
    ///
    /// Without a response, a set match yields the value embedded in the matched
    /// string (converted with `set_conv`), or `None` for a set command that carries
    /// no value. With a response, a query match decodes it against `resp_regex` and
    /// `resp_conv`; a response that does not match yields `None`. Every other
    /// combination yields `None`.
    pub fn parse(&self, resp: Option<&str>) -> Result<Option<CommandValue>, CommandError> {
        match (self.kind, resp) {
            (MatchKind::Set, None) => self
                .value
                .as_deref()
                .map(|raw| convert(self.command.set_conv(), raw))
                .transpose(),
            (MatchKind::Query, Some(resp)) => {
                let raw = match self.command.resp_regex() {
                    Some(re) => match re.captures(resp) {
                        Some(caps) => caps.get(1).or_else(|| caps.get(0)).map(|m| m.as_str()),
                        None => return Ok(None),
                    },
                    None => Some(resp),
                };
                raw.map(|raw| convert(self.command.resp_conv(), raw))
                    .transpose()
            }
            _ => Ok(None),
        }
    }
}
