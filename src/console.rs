//! Terminal output sink and input-line parsing.
//!
//! The session logic talks to a [`Console`] trait so tests can capture
//! output; the binaries install [`StdioConsole`] and run the blocking stdin
//! loop themselves, feeding each line through [`parse_line`].

use crate::protocol::{ClientId, HOST_ID};

/// Where chat output goes. One call per displayed line.
pub trait Console: Send + Sync {
    /// Local status lines (connection progress, errors shown to the user).
    fn info(&self, line: &str);
    /// Room-wide notices: joins, leaves, kills, host shutdown.
    fn system(&self, line: &str);
    /// A private message addressed to this participant.
    fn private_msg(&self, from: ClientId, text: &str);
    /// A broadcast from another participant (or the local echo of our own).
    fn broadcast_msg(&self, from: ClientId, text: &str);
}

/// Prints tagged lines to stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdioConsole;

impl Console for StdioConsole {
    fn info(&self, line: &str) {
        println!("-- {line}");
    }

    fn system(&self, line: &str) {
        println!("** {line}");
    }

    fn private_msg(&self, from: ClientId, text: &str) {
        println!("[{}] (private) {text}", participant(from));
    }

    fn broadcast_msg(&self, from: ClientId, text: &str) {
        println!("[{}] {text}", participant(from));
    }
}

fn participant(id: ClientId) -> String {
    if id == HOST_ID {
        "host".to_owned()
    } else {
        format!("client {id}")
    }
}

/// One parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Broadcast(String),
    Private { to: ClientId, text: String },
    Quit,
}

/// Parses a raw input line.
///
/// `/quit` leaves the chat, `@<id> <text>` sends a private message, any
/// other non-empty line is a broadcast. Returns `None` for blank lines and
/// private messages with no body.
#[must_use]
pub fn parse_line(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if line == "/quit" {
        return Some(Command::Quit);
    }
    if let Some(rest) = line.strip_prefix('@') {
        let (target, text) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
        if let Ok(to) = target.parse::<ClientId>() {
            let text = text.trim();
            if text.is_empty() {
                return None;
            }
            return Some(Command::Private {
                to,
                text: text.to_owned(),
            });
        }
        // Not a valid target, treat the whole line as chat text.
    }
    Some(Command::Broadcast(line.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_broadcast() {
        assert_eq!(
            parse_line("hello there"),
            Some(Command::Broadcast("hello there".into()))
        );
    }

    #[test]
    fn at_prefix_is_private() {
        assert_eq!(
            parse_line("@7 psst"),
            Some(Command::Private {
                to: 7,
                text: "psst".into()
            })
        );
    }

    #[test]
    fn quit_command() {
        assert_eq!(parse_line("  /quit "), Some(Command::Quit));
    }

    #[test]
    fn blank_and_bodyless_lines_are_dropped() {
        assert_eq!(parse_line("   "), None);
        assert_eq!(parse_line("@3"), None);
        assert_eq!(parse_line("@3   "), None);
    }

    #[test]
    fn invalid_target_falls_back_to_broadcast() {
        assert_eq!(
            parse_line("@bob hi"),
            Some(Command::Broadcast("@bob hi".into()))
        );
    }

    #[test]
    fn private_to_host_parses() {
        assert_eq!(
            parse_line("@0 hi host"),
            Some(Command::Private {
                to: 0,
                text: "hi host".into()
            })
        );
    }
}
