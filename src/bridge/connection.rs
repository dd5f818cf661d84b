// ABOUTME: Carabiner session supervisor and read loop
// ABOUTME: Connect/disconnect, watchdog, writer task, inbound dispatch

use super::state::Connection;
use super::Bridge;
use crate::error::Error;
use crate::protocol::{self, Command, Event};
use crate::Result;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// How long to wait for the TCP connect to the daemon.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a single read may block before the stop condition is re-checked.
const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// How soon after connect the daemon's first status push must have arrived.
const FIRST_STATUS_TIMEOUT: Duration = Duration::from_secs(1);

/// Read buffer size; Carabiner messages are far smaller.
const READ_BUFFER_BYTES: usize = 1024;

/// Shared form of the connection-failure callback.
type FailureHandler = Arc<dyn Fn(&str) + Send + Sync>;

impl Bridge {
    /// Queue a command line for the current session's writer task.
    pub(crate) fn send_command(&self, command: &Command) -> Result<()> {
        let tx = self
            .shared
            .state
            .read()
            .connection
            .as_ref()
            .map(|connection| connection.tx.clone())
            .ok_or_else(|| Error::Connection("not connected to a Carabiner daemon".into()))?;
        log::debug!("Sending to Carabiner: {command}");
        tx.send(command.to_line())
            .map_err(|_| Error::Connection("the Carabiner session is shutting down".into()))
    }

    /// Establish a session with the Carabiner daemon.
    ///
    /// Returns `true` if a session is (already) established. Connection
    /// problems are never returned as errors; `on_failure` receives a
    /// human-readable message instead, both for the connect phase and for
    /// the first-status watchdog. A panicking `on_failure` is caught and
    /// logged.
    pub async fn connect<F>(&self, on_failure: F) -> bool
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        if self.is_active() {
            return true;
        }
        let on_failure: FailureHandler = Arc::new(on_failure);
        let port = self.shared.state.read().port;
        let address = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        let stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                report_failure(
                    &on_failure,
                    &format!("Unable to connect to Carabiner daemon at {address}: {e}"),
                );
                return false;
            }
            Err(_) => {
                report_failure(
                    &on_failure,
                    &format!(
                        "Unable to connect to Carabiner daemon at {address}: timed out after {}s",
                        CONNECT_TIMEOUT.as_secs()
                    ),
                );
                return false;
            }
        };
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let run_id = {
            let mut state = self.shared.state.write();
            if state.connection.is_some() {
                // A concurrent connect won the race; keep its session
                None
            } else {
                state.last_run_id += 1;
                state.connection = Some(Connection {
                    run_id: state.last_run_id,
                    tx,
                });
                Some(state.last_run_id)
            }
        };
        let Some(run_id) = run_id else {
            return true;
        };
        log::info!("Connected to Carabiner daemon at {address} (session {run_id})");
        tokio::spawn(write_loop(writer, rx));
        tokio::spawn(self.clone().read_loop(reader, run_id));
        tokio::spawn(self.clone().watchdog(run_id, on_failure));
        true
    }

    /// Tear down the current session, if any.
    ///
    /// Cooperative: this clears the connection record; the read loop
    /// notices the mismatch within its read timeout and exits, closing the
    /// socket and notifying disconnection listeners.
    pub fn disconnect(&self) {
        let had_session = {
            let mut state = self.shared.state.write();
            let had_session = state.connection.take().is_some();
            if had_session {
                state.link_bpm = None;
                state.link_peers = None;
            }
            had_session
        };
        if had_session {
            log::info!("Disconnecting from Carabiner daemon");
        }
    }

    /// Abandon the session unless the daemon proved itself alive in time.
    async fn watchdog(self, run_id: u64, on_failure: FailureHandler) {
        tokio::time::sleep(FIRST_STATUS_TIMEOUT).await;
        let (current_run_id, have_status) = {
            let state = self.shared.state.read();
            (
                state.connection.as_ref().map(|c| c.run_id),
                state.link_bpm.is_some(),
            )
        };
        if current_run_id != Some(run_id) {
            // The session is already gone, or a reconnect replaced it
            return;
        }
        if have_status {
            for command in [Command::Version, Command::EnableStartStopSync] {
                if let Err(e) = self.send_command(&command) {
                    log::warn!("Failed to send {command} after connect: {e}");
                }
            }
        } else {
            report_failure(
                &on_failure,
                "Did not receive expected initial status from the Carabiner daemon; disconnecting.",
            );
            self.disconnect();
        }
    }

    async fn read_loop(self, mut reader: OwnedReadHalf, run_id: u64) {
        let mut buffer = [0u8; READ_BUFFER_BYTES];
        let mut pending = String::new();
        let mut unexpected = false;
        loop {
            if !self.session_is(run_id) {
                break;
            }
            match timeout(READ_TIMEOUT, reader.read(&mut buffer)).await {
                // Timeout tick: go back and re-check the stop condition
                Err(_) => continue,
                Ok(Ok(0)) => {
                    // Only a close while the session is still ours counts as
                    // the peer closing first; after a local disconnect the
                    // daemon's close is just the echo of our own
                    unexpected = self.session_is(run_id);
                    if unexpected {
                        log::info!("Carabiner daemon closed the connection");
                    }
                    break;
                }
                Ok(Ok(count)) => match std::str::from_utf8(&buffer[..count]) {
                    Ok(chunk) => {
                        pending.push_str(chunk);
                        let (events, consumed) = protocol::decode(&pending);
                        pending.drain(..consumed);
                        for event in events {
                            self.handle_event(event);
                        }
                    }
                    Err(e) => {
                        log::warn!("Dropping non-UTF-8 data from Carabiner: {e}");
                        pending.clear();
                    }
                },
                Ok(Err(e)) => log::warn!("Error reading from Carabiner: {e}"),
            }
        }
        let owned_teardown = {
            let mut state = self.shared.state.write();
            match &state.connection {
                Some(connection) if connection.run_id == run_id => {
                    state.connection = None;
                    state.link_bpm = None;
                    state.link_peers = None;
                    true
                }
                _ => false,
            }
        };
        // Dropping our half closes the socket for reading; the writer task
        // exits once the session's sender is gone and its queue drains
        drop(reader);
        if owned_teardown {
            log::info!("Carabiner session {run_id} ended (peer closed: {unexpected})");
        }
        self.shared.disconnection_listeners.notify(&unexpected);
    }

    fn session_is(&self, run_id: u64) -> bool {
        self.shared
            .state
            .read()
            .connection
            .as_ref()
            .map(|connection| connection.run_id)
            == Some(run_id)
    }

    pub(crate) fn handle_event(&self, event: Event) {
        log::debug!("Received from Carabiner: {event:?}");
        match event {
            Event::Status { bpm, peers } => self.handle_status(bpm, peers),
            Event::BeatAtTime { beat, when } => self.handle_beat_response(beat, when),
            Event::PhaseAtTime { phase, when } => self.handle_phase_response(phase, when),
            Event::Version(version) => self.handle_version(&version),
            Event::Unsupported(command) => self.handle_unsupported(&command),
        }
    }

    fn handle_status(&self, bpm: f64, peers: u64) {
        {
            let mut state = self.shared.state.write();
            state.link_bpm = Some(bpm);
            state.link_peers = Some(peers);
        }
        self.maintain_tempo();
        self.notify_status();
    }

    fn handle_version(&self, version: &str) {
        log::info!("Connected to Carabiner daemon version {version}");
        if version == "1.1.0" {
            self.warn_bad_version(
                "Carabiner must be upgraded to at least version 1.1.1 to support start/stop sync.",
            );
        }
    }

    fn handle_unsupported(&self, command: &str) {
        if command == "enable-start-stop-sync" {
            self.warn_bad_version(
                "Carabiner must be upgraded to at least version 1.1.1 to support start/stop sync.",
            );
        } else {
            log::error!("Carabiner does not recognize our command: {command}");
        }
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = rx.recv().await {
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            log::warn!("Error writing to Carabiner: {e}");
            break;
        }
        if let Err(e) = writer.flush().await {
            log::warn!("Error flushing to Carabiner: {e}");
            break;
        }
    }
}

fn report_failure(on_failure: &FailureHandler, message: &str) {
    log::warn!("{message}");
    if catch_unwind(AssertUnwindSafe(|| on_failure(message))).is_err() {
        log::error!("Connection failure handler panicked");
    }
}
