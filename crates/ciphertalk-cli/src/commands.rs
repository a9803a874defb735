//! Input line parsing and execution.
//!
//! A line starting with `/` is a command; anything else is broadcast.

use anyhow::Result;
use ciphertalk_client::ChatClient;

const USAGE: &str = "commands: /users, /whisper <user> <message>, /exit";

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Broadcast(String),
    Users,
    Whisper { user: String, message: String },
    Exit,
    /// Blank line; nothing to do.
    Nothing,
    /// Unparseable command, with a hint for the user.
    Invalid(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Command::Nothing;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Command::Broadcast(line.to_string());
        };

        let (name, args) = match rest.split_once(char::is_whitespace) {
            Some((name, args)) => (name, args.trim_start()),
            None => (rest, ""),
        };
        match name.to_ascii_lowercase().as_str() {
            "users" | "getusers" => Command::Users,
            "exit" | "quit" => Command::Exit,
            "whisper" | "w" => match args.split_once(char::is_whitespace) {
                Some((user, message)) if !message.trim().is_empty() => Command::Whisper {
                    user: user.to_string(),
                    message: message.to_string(),
                },
                _ => Command::Invalid("usage: /whisper <user> <message>".to_string()),
            },
            other => Command::Invalid(format!("unknown command /{other}; {USAGE}")),
        }
    }

    /// Run against `client`. Returns `false` when the session should end.
    pub async fn execute(self, client: &ChatClient) -> Result<bool> {
        match self {
            Command::Broadcast(text) => client.broadcast_message(&text).await?,
            Command::Users => {
                let users = client.get_users().await?;
                println!("* online: {}", users.join(", "));
            }
            Command::Whisper { user, message } => {
                client.whisper(&user, &message).await?;
                println!("* whispered to {user}");
            }
            Command::Exit => return Ok(false),
            Command::Nothing => {}
            Command::Invalid(hint) => eprintln!("{hint}"),
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_broadcast() {
        assert_eq!(
            Command::parse("hello there\n"),
            Command::Broadcast("hello there".into())
        );
    }

    #[test]
    fn blank_lines_do_nothing() {
        assert_eq!(Command::parse("   \r\n"), Command::Nothing);
    }

    #[test]
    fn parses_commands() {
        assert_eq!(Command::parse("/users"), Command::Users);
        assert_eq!(Command::parse("/EXIT"), Command::Exit);
        assert_eq!(
            Command::parse("/whisper bob  see you at noon"),
            Command::Whisper {
                user: "bob".into(),
                message: " see you at noon".into()
            }
        );
    }

    #[test]
    fn whisper_needs_user_and_message() {
        assert!(matches!(Command::parse("/whisper"), Command::Invalid(_)));
        assert!(matches!(Command::parse("/whisper bob"), Command::Invalid(_)));
        assert!(matches!(Command::parse("/whisper bob   "), Command::Invalid(_)));
    }

    #[test]
    fn unknown_command_is_invalid() {
        match Command::parse("/dance now") {
            Command::Invalid(hint) => assert!(hint.contains("/dance")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
