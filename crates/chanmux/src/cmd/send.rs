use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::Duration;

use chanmux_mux::{connect_with, Channel, Multiplexer};
use tracing::debug;

use crate::cmd::{connect_options, parse_duration, SendArgs};
use crate::exit::{
    connection_error, mux_error, CliError, CliResult, DATA_INVALID, SUCCESS, TIMEOUT,
    TRANSPORT_ERROR,
};
use crate::message::TextMessage;
use crate::output::{print_message, Direction, OutputFormat};

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;

    let connection = connect_with(&args.path, &connect_options(args.secure, Some(timeout)))
        .map_err(|err| connection_error("connect failed", err))?;
    let mux = Multiplexer::attach(&connection);
    connection
        .start()
        .map_err(|err| connection_error("connection failed to start", err))?;

    let result = exchange(&mux, &args.texts, timeout, format);

    if let Err(err) = connection.close(timeout) {
        debug!(error = %err, "connection did not close cleanly");
    }
    result
}

fn exchange(
    mux: &Multiplexer,
    texts: &[String],
    timeout: Duration,
    format: OutputFormat,
) -> CliResult<i32> {
    let channel = mux
        .establish_new_channel::<TextMessage>(timeout)
        .map_err(|err| mux_error("open channel failed", err))?;

    let (tx, rx) = mpsc::channel();
    channel.add_listener(move |message: &TextMessage| {
        let _ = tx.send(message.clone());
    });

    let connection = mux.connection().name().to_string();
    for (seq, text) in texts.iter().enumerate() {
        let message = TextMessage {
            seq: seq as u64,
            text: text.clone(),
        };
        channel
            .send(&message)
            .map_err(|err| mux_error("send failed", err))?;
        let echo = wait_for_echo(&rx, &channel, &message, timeout)?;
        print_message(Direction::Echoed, &connection, channel.id(), &echo, format);
    }

    channel
        .close()
        .map_err(|err| mux_error("close failed", err))?;
    Ok(SUCCESS)
}

fn wait_for_echo(
    replies: &Receiver<TextMessage>,
    channel: &Channel<TextMessage>,
    sent: &TextMessage,
    timeout: Duration,
) -> CliResult<TextMessage> {
    match replies.recv_timeout(timeout) {
        Ok(echo) if echo.seq == sent.seq => Ok(echo),
        Ok(echo) => Err(CliError::new(
            DATA_INVALID,
            format!("echo out of order: expected seq {}, got {}", sent.seq, echo.seq),
        )),
        Err(RecvTimeoutError::Timeout) if channel.is_closed() => Err(CliError::new(
            TRANSPORT_ERROR,
            "channel closed before the echo arrived",
        )),
        Err(RecvTimeoutError::Timeout) => Err(CliError::new(
            TIMEOUT,
            format!("no echo within {timeout:?}"),
        )),
        Err(RecvTimeoutError::Disconnected) => Err(CliError::new(
            TRANSPORT_ERROR,
            "channel closed before the echo arrived",
        )),
    }
}
