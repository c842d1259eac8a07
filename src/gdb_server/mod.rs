//! The GDB RSP server: listening socket, session lifecycle and the
//! stop-event wait loop.

use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use crate::controller::{Event, EventBus, TargetControllerService};
use crate::error::Error;
use crate::target::{Breakpoint, BreakpointKind, TargetState};

pub mod connection;
pub mod handlers;
pub mod packet;
pub mod parser;
pub mod session;

pub use connection::{Connection, ReadOutcome, WakeHandle};

use handlers::{HandlerOutcome, PacketHandler};
use parser::parse_packet;
use session::DebugSession;

/// How long one idle pass of the packet loop blocks before the event
/// subscription is drained.
const IDLE_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Poll granularity while a stop reply is outstanding.
const STOP_WAIT_POLL: Duration = Duration::from_millis(20);

const SIGINT: u8 = 0x02;
const SIGTRAP: u8 = 0x05;

pub struct GdbServer {
    service: TargetControllerService,
    events: Arc<EventBus>,
    bind_address: String,
    /// Suspend the controller when a debug session ends, releasing the
    /// probe for other software.
    release_post_session: bool,
}

impl GdbServer {
    pub fn new(
        service: TargetControllerService,
        events: Arc<EventBus>,
        bind_address: String,
        release_post_session: bool,
    ) -> Self {
        Self {
            service,
            events,
            bind_address,
            release_post_session,
        }
    }

    /// Accept debugger connections forever; one client at a time.
    pub fn run(&self, wake: WakeHandle) -> Result<(), Error> {
        let listener = TcpListener::bind(&self.bind_address).map_err(|error| {
            Error::Config(crate::error::ConfigError::Invalid(format!(
                "failed to bind {}: {error}",
                self.bind_address
            )))
        })?;

        log::info!("GDB server listening on {}", self.bind_address);
        self.serve_listener(listener, wake)
    }

    /// Accept connections on an already-bound listener.
    pub fn serve_listener(&self, listener: TcpListener, wake: WakeHandle) -> Result<(), Error> {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    if let Err(error) = self.serve_client(stream, wake.clone()) {
                        log::error!("Debug session ended with an error - {error}");
                    }
                }
                Err(error) => {
                    log::error!("Failed to accept a connection - {error}");
                }
            }
        }

        Ok(())
    }

    fn serve_client(&self, stream: TcpStream, wake: WakeHandle) -> Result<(), Error> {
        let mut connection = Connection::new(stream, wake)?;
        log::info!("Accepted connection from {}", connection.peer());

        // The controller may be suspended after a previous session.
        self.service.resume()?;

        let descriptor = self.service.get_descriptor()?;
        let mut session = DebugSession::new(descriptor)?;
        let events = self.events.subscribe();

        let result = self.session_loop(&mut connection, &mut session, &events);

        self.teardown(&mut session);
        log::info!("Debug session with {} ended", connection.peer());

        result
    }

    fn session_loop(
        &self,
        connection: &mut Connection,
        session: &mut DebugSession,
        events: &Receiver<Arc<Event>>,
    ) -> Result<(), Error> {
        loop {
            match connection.read_packet(Some(IDLE_READ_TIMEOUT))? {
                ReadOutcome::TimedOut => {
                    // Nothing from the client; discard events published
                    // outside a stop wait.
                    while events.try_recv().is_ok() {}
                    continue;
                }
                ReadOutcome::Interrupted => return Ok(()),
                ReadOutcome::Packet(raw) => {
                    let command = parse_packet(&raw);
                    log::debug!("Handling {command:?}");

                    // Stale events must not satisfy a stop wait that
                    // this command is about to start.
                    while events.try_recv().is_ok() {}

                    let outcome = PacketHandler::new(&self.service, session).handle(command);

                    match outcome {
                        HandlerOutcome::Reply(payload) => connection.write_packet(&payload)?,
                        HandlerOutcome::WaitForStop => {
                            self.wait_for_stop(connection, session, events)?
                        }
                        HandlerOutcome::Detach => {
                            connection.write_packet(b"OK")?;

                            if self.release_post_session {
                                if let Err(error) = self.service.suspend() {
                                    log::error!(
                                        "Failed to suspend the target controller - {error}"
                                    );
                                }
                            }

                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// A continue/step/interrupt is in flight: hold the reply until the
    /// target stops, while staying responsive to further interrupts.
    fn wait_for_stop(
        &self,
        connection: &mut Connection,
        session: &mut DebugSession,
        events: &Receiver<Arc<Event>>,
    ) -> Result<(), Error> {
        loop {
            match events.recv_timeout(STOP_WAIT_POLL) {
                Ok(event) => {
                    if let Event::TargetStateChanged(TargetState::Stopped) = *event {
                        return self.send_stop_reply(connection, session);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    // Querying the state forces an event poll on the
                    // controller side, and covers a target that was
                    // already stopped when the wait began.
                    if matches!(self.service.get_target_state(), Ok(TargetState::Stopped)) {
                        return self.send_stop_reply(connection, session);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::Precondition(
                        "the event bus is no longer running".into(),
                    ))
                }
            }

            // The client may interrupt the wait with 0x03 (or hang up).
            match connection.read_packet(Some(Duration::from_millis(1)))? {
                ReadOutcome::Packet(raw) if raw.is_interrupt() => {
                    log::debug!("Client interrupted execution");
                    self.service.stop()?;
                    session.interrupt_requested = true;
                }
                ReadOutcome::Packet(raw) => {
                    log::warn!(
                        "Ignoring packet received while waiting for the target to stop: {}",
                        String::from_utf8_lossy(&raw.data)
                    );
                }
                ReadOutcome::Interrupted => return Ok(()),
                ReadOutcome::TimedOut => {}
            }
        }
    }

    fn send_stop_reply(
        &self,
        connection: &mut Connection,
        session: &mut DebugSession,
    ) -> Result<(), Error> {
        let signal = if session.interrupt_requested {
            SIGINT
        } else {
            SIGTRAP
        };
        session.interrupt_requested = false;

        connection.write_packet(format!("S{signal:02x}").as_bytes())
    }

    /// Remove session-owned breakpoints from the target; the client is
    /// gone and nothing will ever clear them otherwise.
    fn teardown(&self, session: &mut DebugSession) {
        if session.breakpoints.is_empty() {
            return;
        }

        if let Err(error) = self.service.stop() {
            log::warn!("Failed to stop the target during session teardown - {error}");
            return;
        }

        for (&address, _) in std::mem::take(&mut session.breakpoints).iter() {
            let breakpoint = Breakpoint {
                address,
                kind: BreakpointKind::Software,
            };

            if let Err(error) = self.service.remove_breakpoint(breakpoint) {
                log::warn!("Failed to clear breakpoint at 0x{address:x} - {error}");
            }
        }
    }
}
