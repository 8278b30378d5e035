use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chanmux_mux::{
    Channel, ChannelId, Connection, ConnectionError, Handler, Multiplexer, MuxListener,
    RequestError,
};
use tracing::{info, warn};

use crate::cmd::{connect_options, ListenArgs};
use crate::exit::{connection_error, io_error, CliError, CliResult, SUCCESS};
use crate::message::TextMessage;
use crate::output::{print_message, Direction, OutputFormat};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

enum Event {
    Connected(Connection),
    Message {
        connection: String,
        channel: ChannelId,
        message: TextMessage,
    },
    AcceptFailed(ConnectionError),
}

/// Echoes every message back on the channel it arrived on.
struct Echo {
    connection: String,
    events: Sender<Event>,
}

impl Handler for Echo {
    type Payload = TextMessage;

    fn new_channel_requested(
        &self,
        channel: &Channel<TextMessage>,
        _initial: Option<TextMessage>,
    ) -> Result<(), RequestError> {
        let id = channel.id();
        let reply = channel.clone();
        let events = self.events.clone();
        let connection = self.connection.clone();
        channel.add_listener(move |message: &TextMessage| {
            if let Err(err) = reply.send(message) {
                warn!(channel_id = %id, error = %err, "echo failed");
            }
            let _ = events.send(Event::Message {
                connection: connection.clone(),
                channel: id,
                message: message.clone(),
            });
        });
        info!(connection = %self.connection, channel_id = %id, "text channel opened");
        Ok(())
    }

    fn channel_closed(&self, channel: &Channel<TextMessage>) {
        info!(connection = %self.connection, channel_id = %channel.id(), "text channel closed");
    }
}

pub fn run(args: ListenArgs, format: OutputFormat) -> CliResult<i32> {
    let listener = MuxListener::bind(&args.path)
        .map_err(|err| connection_error("bind failed", err))?
        .with_options(connect_options(args.secure, None));

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let (events_tx, events_rx) = mpsc::channel();
    thread::Builder::new()
        .name("chanmux-accept".to_string())
        .spawn(move || accept_loop(listener, events_tx))
        .map_err(|err| io_error("failed to start accept loop", err))?;

    let mut connections = Vec::new();
    let mut printed = 0usize;

    let result = loop {
        if !running.load(Ordering::SeqCst) {
            break Ok(SUCCESS);
        }
        match events_rx.recv_timeout(POLL_INTERVAL) {
            Ok(Event::Connected(connection)) => connections.push(connection),
            Ok(Event::Message {
                connection,
                channel,
                message,
            }) => {
                print_message(Direction::Received, &connection, channel, &message, format);
                printed = printed.saturating_add(1);
                if args.count.is_some_and(|count| printed >= count) {
                    break Ok(SUCCESS);
                }
            }
            Ok(Event::AcceptFailed(err)) => break Err(connection_error("accept failed", err)),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break Ok(SUCCESS),
        }
    };

    for connection in &connections {
        if let Err(err) = connection.close(CLOSE_TIMEOUT) {
            warn!(connection = %connection.name(), error = %err, "close failed");
        }
    }
    result
}

fn accept_loop(listener: MuxListener, events: Sender<Event>) {
    loop {
        let connection = match listener.accept() {
            Ok(connection) => connection,
            Err(ConnectionError::Transport(err)) => {
                let _ = events.send(Event::AcceptFailed(ConnectionError::Transport(err)));
                return;
            }
            Err(err) => {
                warn!(error = %err, "connection setup failed");
                continue;
            }
        };

        let mux = Multiplexer::attach(&connection);
        mux.add_handler(Echo {
            connection: connection.name().to_string(),
            events: events.clone(),
        });
        if let Err(err) = connection.start() {
            warn!(connection = %connection.name(), error = %err, "failed to start connection");
            continue;
        }
        if events.send(Event::Connected(connection)).is_err() {
            return;
        }
    }
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| {
        CliError::new(
            crate::exit::INTERNAL,
            format!("signal handler setup failed: {err}"),
        )
    })
}
