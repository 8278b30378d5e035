use std::io::IsTerminal;
use std::time::{SystemTime, UNIX_EPOCH};

use chanmux_mux::ChannelId;
use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

use crate::message::TextMessage;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// Which way a printed message travelled.
#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Received,
    Echoed,
}

#[derive(Serialize)]
struct MessageOutput<'a> {
    direction: Direction,
    connection: &'a str,
    channel: u64,
    seq: u64,
    text: &'a str,
    timestamp: String,
}

pub fn print_message(
    direction: Direction,
    connection: &str,
    channel: ChannelId,
    message: &TextMessage,
    format: OutputFormat,
) {
    match format {
        OutputFormat::Json => {
            let out = MessageOutput {
                direction,
                connection,
                channel: channel.0,
                seq: message.seq,
                text: &message.text,
                timestamp: now_unix_seconds(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["CONNECTION", "CHANNEL", "SEQ", "TEXT"])
                .add_row(vec![
                    connection.to_string(),
                    channel.to_string(),
                    message.seq.to_string(),
                    message.text.clone(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "{} connection={} channel={} seq={} text={}",
                match direction {
                    Direction::Received => "<-",
                    Direction::Echoed => "->",
                },
                connection,
                channel,
                message.seq,
                message.text
            );
        }
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
