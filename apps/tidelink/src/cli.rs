use clap::{Args, Parser, builder::BoolishValueParser};
use std::path::PathBuf;

use crate::config::{DEFAULT_RELAY_URL, TransportKind};
use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "tidelink",
    about = "Peer-to-peer chat over a relay-negotiated data channel",
    author,
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = "TIDELINK_RELAY_URL",
        default_value = DEFAULT_RELAY_URL,
        help = "WebSocket URL of the signaling relay"
    )]
    pub relay_url: String,

    #[arg(
        long,
        env = "TIDELINK_USER",
        value_name = "IDENTITY",
        help = "Identity to register with the relay"
    )]
    pub user: String,

    #[arg(long, value_name = "IDENTITY", help = "Peer to call once registered")]
    pub peer: Option<String>,

    #[arg(
        long,
        value_enum,
        env = "TIDELINK_TRANSPORT",
        default_value_t = TransportKind::Rtc,
        help = "Peer transport implementation"
    )]
    pub transport: TransportKind,

    #[arg(
        long = "no-stun",
        env = "TIDELINK_DISABLE_STUN",
        num_args = 0..=1,
        default_missing_value = "true",
        value_parser = BoolishValueParser::new(),
        value_name = "BOOL",
        help = "Skip the public STUN/TURN servers (host candidates only)"
    )]
    pub no_stun: Option<bool>,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "TIDELINK_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "TIDELINK_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

/// One line typed at the chat prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Call(String),
    Hangup,
    Status,
    Quit,
    Say(String),
    Empty,
}

impl ChatCommand {
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(ChatCommand::Empty);
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Ok(ChatCommand::Say(line.to_string()));
        };
        let mut parts = rest.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("call"), Some(peer)) => Ok(ChatCommand::Call(peer.to_string())),
            (Some("call"), None) => Err("usage: /call <peer>".into()),
            (Some("hangup"), _) => Ok(ChatCommand::Hangup),
            (Some("status"), _) => Ok(ChatCommand::Status),
            (Some("quit") | Some("exit"), _) => Ok(ChatCommand::Quit),
            (Some(other), _) => Err(format!("unknown command /{other}")),
            (None, _) => Err("empty command".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_chat_commands() {
        assert_eq!(
            ChatCommand::parse("/call bob").unwrap(),
            ChatCommand::Call("bob".into())
        );
        assert_eq!(ChatCommand::parse(" /hangup ").unwrap(), ChatCommand::Hangup);
        assert_eq!(ChatCommand::parse("/quit").unwrap(), ChatCommand::Quit);
        assert_eq!(
            ChatCommand::parse("hello there").unwrap(),
            ChatCommand::Say("hello there".into())
        );
        assert_eq!(ChatCommand::parse("   ").unwrap(), ChatCommand::Empty);
        assert!(ChatCommand::parse("/call").is_err());
        assert!(ChatCommand::parse("/dance").is_err());
    }

    #[test]
    fn cli_defaults() {
        let cli = Cli::try_parse_from(["tidelink", "--user", "alice"]).unwrap();
        assert_eq!(cli.relay_url, DEFAULT_RELAY_URL);
        assert_eq!(cli.transport, TransportKind::Rtc);
        assert!(cli.peer.is_none());

        let cli = Cli::try_parse_from([
            "tidelink",
            "--user",
            "alice",
            "--peer",
            "bob",
            "--transport",
            "sim",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(cli.peer.as_deref(), Some("bob"));
        assert_eq!(cli.transport, TransportKind::Sim);
        assert_eq!(cli.logging.to_config().level, LogLevel::Debug);
    }
}
