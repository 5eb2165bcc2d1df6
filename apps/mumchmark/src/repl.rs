//! Operator line parsing. Pure and synchronous; nothing here touches the fleet.

use std::{collections::BTreeSet, path::PathBuf};

use shared::{
    domain::{ChannelId, ClientId},
    protocol::TargetSelection,
};
use thiserror::Error;

pub const HELP: &str = "\
commands:
  spawn <n>                    connect n more clients
  t | text [selection] [body]  send a text message (default body from config)
  a | audio [selection] [path] play an audio file (default path from config)
  stop [selection]             stop audio playback
  status                       show the fleet
  help                         show this help
  q | quit                     disconnect everyone and exit
selection:
  all | <n> (0 = all) | first:<n> | ids:<a,b,..> | channel:<id>";

/// Target as typed by the operator. A bare amount is checked against the live
/// fleet before it becomes a selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionSpec {
    Amount(usize),
    Exact(TargetSelection),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    Spawn(usize),
    Text {
        selection: SelectionSpec,
        body: Option<String>,
    },
    Audio {
        selection: SelectionSpec,
        source: Option<PathBuf>,
    },
    Stop {
        selection: SelectionSpec,
    },
    Status,
    Help,
    Quit,
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandParseError {
    #[error("unknown command '{0}', try 'help'")]
    UnknownCommand(String),
    #[error("'{0}' needs {1}")]
    MissingArgument(&'static str, &'static str),
    #[error("invalid number '{0}'")]
    InvalidNumber(String),
    #[error("invalid selection '{0}'")]
    InvalidSelection(String),
    #[error("amount {requested} exceeds the {live} live clients")]
    AmountTooLarge { requested: usize, live: usize },
}

pub fn parse_command(line: &str) -> Result<OperatorCommand, CommandParseError> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    match word.to_ascii_lowercase().as_str() {
        "" => Ok(OperatorCommand::Empty),
        "q" | "quit" | "exit" => Ok(OperatorCommand::Quit),
        "h" | "help" | "?" => Ok(OperatorCommand::Help),
        "s" | "status" => Ok(OperatorCommand::Status),
        "spawn" => {
            if rest.is_empty() {
                return Err(CommandParseError::MissingArgument("spawn", "a client count"));
            }
            Ok(OperatorCommand::Spawn(parse_number(rest)?))
        }
        "t" | "text" => {
            let (selection, body) = split_selection(rest)?;
            Ok(OperatorCommand::Text {
                selection,
                body: body.map(str::to_string),
            })
        }
        "a" | "audio" => {
            let (selection, source) = split_selection(rest)?;
            Ok(OperatorCommand::Audio {
                selection,
                source: source.map(PathBuf::from),
            })
        }
        "stop" => {
            let (selection, extra) = split_selection(rest)?;
            match extra {
                Some(extra) => Err(CommandParseError::InvalidSelection(extra.to_string())),
                None => Ok(OperatorCommand::Stop { selection }),
            }
        }
        other => Err(CommandParseError::UnknownCommand(other.to_string())),
    }
}

/// Takes a leading selection token off `rest`. Without one the whole fleet is
/// targeted and `rest` is left for the argument.
fn split_selection(rest: &str) -> Result<(SelectionSpec, Option<&str>), CommandParseError> {
    let (token, tail) = match rest.split_once(char::is_whitespace) {
        Some((token, tail)) => (token, tail.trim()),
        None => (rest, ""),
    };
    if token.is_empty() {
        return Ok((SelectionSpec::Amount(0), None));
    }
    match parse_selection(token) {
        Ok(selection) => Ok((selection, non_empty(tail))),
        // Explicit prefixes are never message text.
        Err(err) if token.contains(':') && looks_like_selection(token) => Err(err),
        Err(_) => Ok((SelectionSpec::Amount(0), non_empty(rest))),
    }
}

fn non_empty(value: &str) -> Option<&str> {
    Some(value).filter(|value| !value.is_empty())
}

fn looks_like_selection(token: &str) -> bool {
    ["first:", "ids:", "channel:"]
        .iter()
        .any(|prefix| token.to_ascii_lowercase().starts_with(prefix))
}

pub fn parse_selection(token: &str) -> Result<SelectionSpec, CommandParseError> {
    let lowered = token.trim().to_ascii_lowercase();
    if lowered == "all" {
        return Ok(SelectionSpec::Exact(TargetSelection::All));
    }
    if lowered.chars().all(|c| c.is_ascii_digit()) && !lowered.is_empty() {
        return Ok(SelectionSpec::Amount(parse_number(&lowered)?));
    }

    let invalid = || CommandParseError::InvalidSelection(token.to_string());
    let (kind, value) = lowered.split_once(':').ok_or_else(invalid)?;
    match kind {
        "first" => Ok(SelectionSpec::Exact(TargetSelection::FirstN(parse_number(
            value,
        )?))),
        "channel" => Ok(SelectionSpec::Exact(TargetSelection::InChannel(ChannelId(
            parse_number(value)?,
        )))),
        "ids" => {
            let ids = value
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(|id| parse_number(id).map(ClientId))
                .collect::<Result<BTreeSet<_>, _>>()?;
            if ids.is_empty() {
                return Err(invalid());
            }
            Ok(SelectionSpec::Exact(TargetSelection::Ids(ids)))
        }
        _ => Err(invalid()),
    }
}

fn parse_number<T: std::str::FromStr>(raw: &str) -> Result<T, CommandParseError> {
    raw.trim()
        .parse()
        .map_err(|_| CommandParseError::InvalidNumber(raw.to_string()))
}

impl SelectionSpec {
    /// Amount `0` is the whole fleet; an amount beyond the live fleet is refused
    /// rather than silently clamped.
    pub fn resolve(self, live: usize) -> Result<TargetSelection, CommandParseError> {
        match self {
            Self::Exact(selection) => Ok(selection),
            Self::Amount(0) => Ok(TargetSelection::All),
            Self::Amount(requested) if requested > live => {
                Err(CommandParseError::AmountTooLarge { requested, live })
            }
            Self::Amount(requested) => Ok(TargetSelection::FirstN(requested)),
        }
    }
}

#[cfg(test)]
#[path = "tests/repl_tests.rs"]
mod tests;
