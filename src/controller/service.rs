//! The request/reply handle used by controller clients.
//!
//! Cheap to clone; every operation submits a [`CommandEnvelope`] to
//! the controller queue and blocks on a one-shot reply channel, with a
//! timeout.

use std::collections::BTreeMap;
use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;
use crate::target::{
    AddressRange, Breakpoint, MemoryAddress, MemoryType, PinDescriptor, PinState, ProgramCounter,
    Register, RegisterDescriptor, StackPointer, TargetDescriptor, TargetState,
};

use super::commands::{CommandEnvelope, TargetCommand, TargetResponse};
use super::ControllerState;

pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct TargetControllerService {
    queue: Sender<CommandEnvelope>,
    default_timeout: Duration,
}

impl TargetControllerService {
    pub fn new(queue: Sender<CommandEnvelope>) -> Self {
        Self {
            queue,
            default_timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }

    pub fn set_default_timeout(&mut self, timeout: Duration) {
        self.default_timeout = timeout;
    }

    fn submit_with_timeout(
        &self,
        command: TargetCommand,
        timeout: Duration,
    ) -> Result<TargetResponse, Error> {
        let name = command.name();
        let (reply_sender, reply_receiver) = channel();
        let envelope = CommandEnvelope::new(command, reply_sender);

        log::debug!("Submitting {name} command (id: {})", envelope.id);

        self.queue.send(envelope).map_err(|_| {
            Error::Precondition("the target controller is no longer running".into())
        })?;

        match reply_receiver.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout("a target controller reply")),
            Err(RecvTimeoutError::Disconnected) => Err(Error::Precondition(
                "the target controller is no longer running".into(),
            )),
        }
    }

    fn submit(&self, command: TargetCommand) -> Result<TargetResponse, Error> {
        self.submit_with_timeout(command, self.default_timeout)
    }

    fn unexpected(response: TargetResponse) -> Error {
        Error::protocol(
            format!("unexpected response from the target controller: {response:?}"),
            None,
        )
    }

    // --- lifecycle ------------------------------------------------------

    pub fn get_controller_state(&self) -> Result<ControllerState, Error> {
        match self.submit(TargetCommand::GetControllerState)? {
            TargetResponse::ControllerState(state) => Ok(state),
            other => Err(Self::unexpected(other)),
        }
    }

    pub fn is_in_service(&self) -> bool {
        matches!(self.get_controller_state(), Ok(ControllerState::Active))
    }

    pub fn resume(&self) -> Result<(), Error> {
        match self.submit(TargetCommand::Resume)? {
            TargetResponse::Ok => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    pub fn suspend(&self) -> Result<(), Error> {
        match self.submit(TargetCommand::Suspend)? {
            TargetResponse::Ok => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    pub fn shutdown(&self) -> Result<(), Error> {
        match self.submit(TargetCommand::Shutdown)? {
            TargetResponse::Ok => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    pub fn get_descriptor(&self) -> Result<Arc<TargetDescriptor>, Error> {
        match self.submit(TargetCommand::GetDescriptor)? {
            TargetResponse::Descriptor(descriptor) => Ok(descriptor),
            other => Err(Self::unexpected(other)),
        }
    }

    // --- execution ------------------------------------------------------

    pub fn get_target_state(&self) -> Result<TargetState, Error> {
        match self.submit(TargetCommand::GetTargetState)? {
            TargetResponse::TargetState(state) => Ok(state),
            other => Err(Self::unexpected(other)),
        }
    }

    pub fn stop(&self) -> Result<(), Error> {
        match self.submit(TargetCommand::Stop)? {
            TargetResponse::Ok => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    pub fn continue_execution(
        &self,
        from_address: Option<MemoryAddress>,
        to_address: Option<MemoryAddress>,
    ) -> Result<(), Error> {
        match self.submit(TargetCommand::Continue {
            from_address,
            to_address,
        })? {
            TargetResponse::Ok => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    pub fn step(&self, from_address: Option<MemoryAddress>) -> Result<(), Error> {
        match self.submit(TargetCommand::Step { from_address })? {
            TargetResponse::Ok => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    pub fn reset(&self) -> Result<(), Error> {
        match self.submit(TargetCommand::Reset)? {
            TargetResponse::Ok => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    // --- registers ------------------------------------------------------

    pub fn read_registers(
        &self,
        descriptors: Vec<RegisterDescriptor>,
    ) -> Result<Vec<Register>, Error> {
        match self.submit(TargetCommand::ReadRegisters(descriptors))? {
            TargetResponse::Registers(registers) => Ok(registers),
            other => Err(Self::unexpected(other)),
        }
    }

    pub fn write_registers(&self, registers: Vec<Register>) -> Result<(), Error> {
        match self.submit(TargetCommand::WriteRegisters(registers))? {
            TargetResponse::Ok => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    // --- memory ---------------------------------------------------------

    pub fn read_memory(
        &self,
        memory_type: MemoryType,
        start_address: MemoryAddress,
        bytes: u32,
        excluded_ranges: Vec<AddressRange>,
    ) -> Result<Vec<u8>, Error> {
        match self.submit(TargetCommand::ReadMemory {
            memory_type,
            start_address,
            bytes,
            excluded_ranges,
        })? {
            TargetResponse::Memory(buffer) => Ok(buffer),
            other => Err(Self::unexpected(other)),
        }
    }

    pub fn write_memory(
        &self,
        memory_type: MemoryType,
        start_address: MemoryAddress,
        buffer: Vec<u8>,
    ) -> Result<(), Error> {
        match self.submit(TargetCommand::WriteMemory {
            memory_type,
            start_address,
            buffer,
        })? {
            TargetResponse::Ok => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    /// Memory erase operations can take a long time on large parts, so
    /// the reply window is widened.
    pub fn erase_memory(&self, memory_type: MemoryType) -> Result<(), Error> {
        let timeout = self.default_timeout.max(Duration::from_secs(120));
        match self.submit_with_timeout(TargetCommand::EraseMemory { memory_type }, timeout)? {
            TargetResponse::Ok => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    // --- breakpoints ----------------------------------------------------

    pub fn set_breakpoint(&self, breakpoint: Breakpoint) -> Result<(), Error> {
        match self.submit(TargetCommand::SetBreakpoint(breakpoint))? {
            TargetResponse::Ok => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    pub fn remove_breakpoint(&self, breakpoint: Breakpoint) -> Result<(), Error> {
        match self.submit(TargetCommand::RemoveBreakpoint(breakpoint))? {
            TargetResponse::Ok => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    // --- program counter / stack pointer --------------------------------

    pub fn get_program_counter(&self) -> Result<ProgramCounter, Error> {
        match self.submit(TargetCommand::GetProgramCounter)? {
            TargetResponse::ProgramCounter(pc) => Ok(pc),
            other => Err(Self::unexpected(other)),
        }
    }

    pub fn set_program_counter(&self, address: MemoryAddress) -> Result<(), Error> {
        match self.submit(TargetCommand::SetProgramCounter(address))? {
            TargetResponse::Ok => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    pub fn get_stack_pointer(&self) -> Result<StackPointer, Error> {
        match self.submit(TargetCommand::GetStackPointer)? {
            TargetResponse::StackPointer(sp) => Ok(sp),
            other => Err(Self::unexpected(other)),
        }
    }

    // --- pins -----------------------------------------------------------

    pub fn get_pin_states(&self, variant_id: u32) -> Result<BTreeMap<u32, PinState>, Error> {
        match self.submit(TargetCommand::GetPinStates { variant_id })? {
            TargetResponse::PinStates(states) => Ok(states),
            other => Err(Self::unexpected(other)),
        }
    }

    pub fn set_pin_state(&self, pin: PinDescriptor, state: PinState) -> Result<(), Error> {
        match self.submit(TargetCommand::SetPinState { pin, state })? {
            TargetResponse::Ok => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    // --- programming mode -----------------------------------------------

    pub fn enable_programming_mode(&self) -> Result<(), Error> {
        match self.submit(TargetCommand::EnableProgrammingMode)? {
            TargetResponse::Ok => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    pub fn disable_programming_mode(&self) -> Result<(), Error> {
        match self.submit(TargetCommand::DisableProgrammingMode)? {
            TargetResponse::Ok => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }
}
