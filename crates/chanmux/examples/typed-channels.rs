//! Two typed channels over one in-process connection.
//!
//! Run with:
//!   cargo run --example typed-channels

use std::sync::mpsc;
use std::time::Duration;

use chanmux::mux::{
    AcceptAll, Channel, Connection, Handler, MuxError, Multiplexer, Payload, RequestError, Side,
};
use chanmux::transport::DuplexStream;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Command {
    action: String,
}

impl Payload for Command {
    const TAG: &'static str = "example.command";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Telemetry {
    cpu: f32,
}

impl Payload for Telemetry {
    const TAG: &'static str = "example.telemetry";
}

/// Only accepts commands that announce themselves with an initial payload.
struct Commands;

impl Handler for Commands {
    type Payload = Command;

    fn new_channel_requested(
        &self,
        channel: &Channel<Command>,
        initial: Option<Command>,
    ) -> Result<(), RequestError> {
        let Some(hello) = initial else {
            return Err(RequestError::declined("send a hello command first"));
        };
        eprintln!("[server] command channel {} opened by {:?}", channel.id(), hello.action);
        let reply = channel.clone();
        channel.add_listener(move |command: &Command| {
            eprintln!("[server] command: {}", command.action);
            let _ = reply.send(&Command {
                action: format!("done: {}", command.action),
            });
        });
        Ok(())
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (left, right) = DuplexStream::pair()?;
    let client = Connection::new(left, Side::Client)?;
    let server = Connection::new(right, Side::Server)?;

    let server_mux = Multiplexer::attach(&server);
    server_mux.add_handler(Commands);
    server_mux.add_handler(AcceptAll::<Telemetry>::new());
    let client_mux = Multiplexer::attach(&client);

    server.start()?;
    client.start()?;

    let timeout = Duration::from_secs(4);

    match client_mux.establish_new_channel::<Command>(timeout) {
        Err(MuxError::Declined { reason, .. }) => {
            eprintln!("[client] declined as expected: {reason:?}");
        }
        other => eprintln!("[client] unexpected result: {other:?}"),
    }

    let hello = Command {
        action: "hello".to_string(),
    };
    let commands = client_mux.establish_new_channel_with(Some(&hello), timeout)?;
    let (tx, rx) = mpsc::channel();
    commands.add_listener(move |reply: &Command| {
        let _ = tx.send(reply.action.clone());
    });
    commands.send(&Command {
        action: "restart".to_string(),
    })?;
    eprintln!("[client] reply: {}", rx.recv_timeout(timeout)?);

    let telemetry = client_mux.establish_new_channel::<Telemetry>(timeout)?;
    telemetry.send(&Telemetry { cpu: 0.42 })?;
    eprintln!(
        "[client] channels open: {:?}, server sees {:?}",
        client_mux.channel_ids(),
        server_mux.channel_ids()
    );

    commands.close()?;
    telemetry.close()?;
    client.close(timeout)?;
    server.close(timeout)?;
    Ok(())
}
