//! The target controller: single owner of the debug probe and target.
//!
//! One thread consumes typed commands from a queue strictly in
//! submission order, checks lifecycle and target-state preconditions
//! before dispatch, and publishes state changes on the event bus
//! before the causing command's reply is sent.

use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{Builder, JoinHandle};
use std::time::Duration;

use crate::error::Error;
use crate::target::avr8::Avr8;
use crate::target::{AddressRange, TargetState};

pub mod commands;
pub mod events;
pub mod service;

pub use commands::{CommandEnvelope, TargetCommand, TargetResponse};
pub use events::{Event, EventBus};
pub use service::TargetControllerService;

/// How often the controller polls the target for asynchronous stops
/// while its queue is idle.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Inactive,
    Active,
    Suspended,
}

pub struct TargetController {
    target: Avr8,
    queue: Receiver<CommandEnvelope>,
    events: Arc<EventBus>,
    state: ControllerState,
    last_target_state: TargetState,
}

impl TargetController {
    /// Build a controller around a target. Returns the controller and
    /// the queue endpoint used to construct service handles.
    pub fn new(target: Avr8, events: Arc<EventBus>) -> (Self, Sender<CommandEnvelope>) {
        let (sender, receiver) = channel();

        (
            Self {
                target,
                queue: receiver,
                events,
                state: ControllerState::Inactive,
                last_target_state: TargetState::Unknown,
            },
            sender,
        )
    }

    pub fn spawn(self) -> JoinHandle<()> {
        Builder::new()
            .name("target-controller".into())
            .spawn(move || self.run())
            .expect("failed to spawn the target controller thread")
    }

    pub fn run(mut self) {
        log::debug!("Target controller thread started");

        loop {
            match self.queue.recv_timeout(IDLE_POLL_INTERVAL) {
                Ok(envelope) => {
                    let shutdown = matches!(envelope.command, TargetCommand::Shutdown);

                    log::debug!(
                        "Processing {} command (id: {})",
                        envelope.command.name(),
                        envelope.id
                    );

                    let result = self.dispatch(envelope.command);

                    if let Err(error) = &result {
                        log::error!("Command failed - {error}");
                        self.events.publish(Event::TargetControllerErrorOccurred {
                            message: error.to_string(),
                        });
                    }

                    // Replies to callers that gave up waiting go nowhere.
                    let _ = envelope.reply.send(result);

                    if shutdown {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => self.poll_target_state(),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if self.state == ControllerState::Active {
            if let Err(error) = self.deactivate() {
                log::error!("Failed to deactivate the target on shutdown - {error}");
            }
        }

        log::debug!("Target controller thread stopped");
    }

    /// Detect asynchronous RUNNING -> STOPPED transitions (breakpoint
    /// hits) while no commands are queued.
    fn poll_target_state(&mut self) {
        if self.state != ControllerState::Active
            || self.last_target_state != TargetState::Running
        {
            return;
        }

        match self.target.get_state() {
            Ok(state) => self.note_target_state(state),
            Err(error) => log::warn!("Failed to poll target state - {error}"),
        }
    }

    fn note_target_state(&mut self, state: TargetState) {
        if state != self.last_target_state {
            self.last_target_state = state;
            self.events.publish(Event::TargetStateChanged(state));
        }
    }

    fn check_preconditions(&mut self, command: &TargetCommand) -> Result<(), Error> {
        if command.requires_active() && self.state != ControllerState::Active {
            return Err(Error::Precondition(format!(
                "the {} command requires an active target controller (currently {:?})",
                command.name(),
                self.state
            )));
        }

        if command.requires_stopped_target() {
            let state = self.target.get_state()?;
            self.note_target_state(state);

            if state != TargetState::Stopped {
                return Err(Error::Precondition(format!(
                    "the {} command requires a stopped target (currently {state:?})",
                    command.name()
                )));
            }
        }

        if command.requires_debug_mode() && self.target.programming_mode_enabled() {
            return Err(Error::Precondition(format!(
                "the {} command is not available while programming mode is enabled",
                command.name()
            )));
        }

        Ok(())
    }

    fn dispatch(&mut self, command: TargetCommand) -> Result<TargetResponse, Error> {
        self.check_preconditions(&command)?;

        match command {
            TargetCommand::GetControllerState => Ok(TargetResponse::ControllerState(self.state)),
            TargetCommand::Resume => {
                self.resume()?;
                Ok(TargetResponse::Ok)
            }
            TargetCommand::Suspend => {
                self.suspend()?;
                Ok(TargetResponse::Ok)
            }
            TargetCommand::Shutdown => Ok(TargetResponse::Ok),
            TargetCommand::GetDescriptor => {
                Ok(TargetResponse::Descriptor(self.target.descriptor()))
            }
            TargetCommand::GetTargetState => {
                let state = self.target.get_state()?;
                self.note_target_state(state);
                Ok(TargetResponse::TargetState(state))
            }
            TargetCommand::Stop => {
                self.target.stop()?;
                self.note_target_state(TargetState::Stopped);
                Ok(TargetResponse::Ok)
            }
            TargetCommand::Continue {
                from_address,
                to_address,
            } => {
                if let Some(address) = from_address {
                    self.target.set_program_counter(address)?;
                }
                self.target.run(to_address)?;
                self.note_target_state(TargetState::Running);
                Ok(TargetResponse::Ok)
            }
            TargetCommand::Step { from_address } => {
                if let Some(address) = from_address {
                    self.target.set_program_counter(address)?;
                }
                self.target.step()?;
                self.note_target_state(TargetState::Running);
                Ok(TargetResponse::Ok)
            }
            TargetCommand::Reset => {
                self.target.reset()?;
                self.events.publish(Event::TargetReset);
                self.note_target_state(TargetState::Stopped);
                Ok(TargetResponse::Ok)
            }
            TargetCommand::ReadRegisters(descriptors) => {
                let registers = self.target.read_registers(descriptors)?;
                Ok(TargetResponse::Registers(registers))
            }
            TargetCommand::WriteRegisters(registers) => {
                self.target.write_registers(registers)?;
                self.events.publish(Event::RegistersWritten);
                Ok(TargetResponse::Ok)
            }
            TargetCommand::ReadMemory {
                memory_type,
                start_address,
                bytes,
                excluded_ranges,
            } => {
                let buffer =
                    self.target
                        .read_memory(memory_type, start_address, bytes, &excluded_ranges)?;
                Ok(TargetResponse::Memory(buffer))
            }
            TargetCommand::WriteMemory {
                memory_type,
                start_address,
                buffer,
            } => {
                let bytes = buffer.len() as u32;
                self.target.write_memory(memory_type, start_address, &buffer)?;

                if bytes > 0 {
                    self.events.publish(Event::MemoryWritten {
                        memory_type,
                        range: AddressRange::new(start_address, start_address + bytes - 1),
                    });
                }
                Ok(TargetResponse::Ok)
            }
            TargetCommand::EraseMemory { memory_type } => {
                self.target.erase_memory(memory_type)?;
                Ok(TargetResponse::Ok)
            }
            TargetCommand::SetBreakpoint(breakpoint) => {
                self.target.set_breakpoint(breakpoint)?;
                Ok(TargetResponse::Ok)
            }
            TargetCommand::RemoveBreakpoint(breakpoint) => {
                self.target.remove_breakpoint(breakpoint)?;
                Ok(TargetResponse::Ok)
            }
            TargetCommand::GetProgramCounter => {
                let pc = self.target.get_program_counter()?;
                Ok(TargetResponse::ProgramCounter(pc))
            }
            TargetCommand::SetProgramCounter(address) => {
                self.target.set_program_counter(address)?;
                Ok(TargetResponse::Ok)
            }
            TargetCommand::GetStackPointer => {
                let sp = self.target.get_stack_pointer()?;
                Ok(TargetResponse::StackPointer(sp))
            }
            TargetCommand::GetPinStates { variant_id } => {
                let states = self.target.get_pin_states(variant_id)?;
                Ok(TargetResponse::PinStates(states))
            }
            TargetCommand::SetPinState { pin, state } => {
                self.target.set_pin_state(&pin, state)?;
                Ok(TargetResponse::Ok)
            }
            TargetCommand::EnableProgrammingMode => {
                self.target.enable_programming_mode()?;
                self.events.publish(Event::ProgrammingModeEnabled);
                Ok(TargetResponse::Ok)
            }
            TargetCommand::DisableProgrammingMode => {
                self.target.disable_programming_mode()?;
                self.events.publish(Event::ProgrammingModeDisabled);
                Ok(TargetResponse::Ok)
            }
        }
    }

    fn resume(&mut self) -> Result<(), Error> {
        if self.state == ControllerState::Active {
            return Ok(());
        }

        match self.target.activate() {
            Ok(()) => {
                self.state = ControllerState::Active;
                self.last_target_state = TargetState::Stopped;
                self.events.publish(Event::TargetControllerResumed {
                    descriptor: self.target.descriptor(),
                });
                Ok(())
            }
            Err(error) => {
                self.state = ControllerState::Suspended;
                Err(error)
            }
        }
    }

    fn suspend(&mut self) -> Result<(), Error> {
        if self.state != ControllerState::Active {
            return Ok(());
        }

        self.deactivate()?;
        self.state = ControllerState::Suspended;
        self.events.publish(Event::TargetControllerSuspended);
        Ok(())
    }

    fn deactivate(&mut self) -> Result<(), Error> {
        if self.target.programming_mode_enabled() {
            if let Err(error) = self.target.disable_programming_mode() {
                log::warn!("Failed to disable programming mode during deactivation - {error}");
            }
        }

        self.target.deactivate()
    }
}
