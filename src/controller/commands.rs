//! Typed controller commands and the envelope they travel in.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use crate::error::Error;
use crate::target::{
    AddressRange, Breakpoint, MemoryAddress, MemoryType, PinDescriptor, PinState, ProgramCounter,
    Register, RegisterDescriptor, StackPointer, TargetDescriptor, TargetState,
};

use super::ControllerState;

static NEXT_COMMAND_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
pub enum TargetCommand {
    GetControllerState,
    Resume,
    Suspend,
    GetDescriptor,
    GetTargetState,
    Stop,
    Continue {
        from_address: Option<MemoryAddress>,
        to_address: Option<MemoryAddress>,
    },
    Step {
        from_address: Option<MemoryAddress>,
    },
    Reset,
    ReadRegisters(Vec<RegisterDescriptor>),
    WriteRegisters(Vec<Register>),
    ReadMemory {
        memory_type: MemoryType,
        start_address: MemoryAddress,
        bytes: u32,
        excluded_ranges: Vec<AddressRange>,
    },
    WriteMemory {
        memory_type: MemoryType,
        start_address: MemoryAddress,
        buffer: Vec<u8>,
    },
    EraseMemory {
        memory_type: MemoryType,
    },
    SetBreakpoint(Breakpoint),
    RemoveBreakpoint(Breakpoint),
    GetProgramCounter,
    SetProgramCounter(MemoryAddress),
    GetStackPointer,
    GetPinStates {
        variant_id: u32,
    },
    SetPinState {
        pin: PinDescriptor,
        state: PinState,
    },
    EnableProgrammingMode,
    DisableProgrammingMode,
    Shutdown,
}

impl TargetCommand {
    pub fn name(&self) -> &'static str {
        match self {
            TargetCommand::GetControllerState => "GetControllerState",
            TargetCommand::Resume => "Resume",
            TargetCommand::Suspend => "Suspend",
            TargetCommand::GetDescriptor => "GetDescriptor",
            TargetCommand::GetTargetState => "GetTargetState",
            TargetCommand::Stop => "Stop",
            TargetCommand::Continue { .. } => "Continue",
            TargetCommand::Step { .. } => "Step",
            TargetCommand::Reset => "Reset",
            TargetCommand::ReadRegisters(_) => "ReadRegisters",
            TargetCommand::WriteRegisters(_) => "WriteRegisters",
            TargetCommand::ReadMemory { .. } => "ReadMemory",
            TargetCommand::WriteMemory { .. } => "WriteMemory",
            TargetCommand::EraseMemory { .. } => "EraseMemory",
            TargetCommand::SetBreakpoint(_) => "SetBreakpoint",
            TargetCommand::RemoveBreakpoint(_) => "RemoveBreakpoint",
            TargetCommand::GetProgramCounter => "GetProgramCounter",
            TargetCommand::SetProgramCounter(_) => "SetProgramCounter",
            TargetCommand::GetStackPointer => "GetStackPointer",
            TargetCommand::GetPinStates { .. } => "GetPinStates",
            TargetCommand::SetPinState { .. } => "SetPinState",
            TargetCommand::EnableProgrammingMode => "EnableProgrammingMode",
            TargetCommand::DisableProgrammingMode => "DisableProgrammingMode",
            TargetCommand::Shutdown => "Shutdown",
        }
    }

    /// Commands that touch the target require the controller to be in
    /// its active state. State queries and lifecycle transitions are
    /// answered in any state.
    pub fn requires_active(&self) -> bool {
        !matches!(
            self,
            TargetCommand::GetControllerState
                | TargetCommand::Resume
                | TargetCommand::Suspend
                | TargetCommand::Shutdown
        )
    }

    pub fn requires_stopped_target(&self) -> bool {
        matches!(
            self,
            TargetCommand::Continue { .. }
                | TargetCommand::Step { .. }
                | TargetCommand::ReadRegisters(_)
                | TargetCommand::WriteRegisters(_)
                | TargetCommand::ReadMemory { .. }
                | TargetCommand::WriteMemory { .. }
                | TargetCommand::EraseMemory { .. }
                | TargetCommand::SetBreakpoint(_)
                | TargetCommand::RemoveBreakpoint(_)
                | TargetCommand::GetProgramCounter
                | TargetCommand::SetProgramCounter(_)
                | TargetCommand::GetStackPointer
                | TargetCommand::GetPinStates { .. }
                | TargetCommand::SetPinState { .. }
                | TargetCommand::EnableProgrammingMode
        )
    }

    /// Commands that are rejected while programming mode is enabled.
    pub fn requires_debug_mode(&self) -> bool {
        match self {
            TargetCommand::Continue { .. }
            | TargetCommand::Step { .. }
            | TargetCommand::SetBreakpoint(_)
            | TargetCommand::RemoveBreakpoint(_)
            | TargetCommand::ReadRegisters(_)
            | TargetCommand::WriteRegisters(_)
            | TargetCommand::GetProgramCounter
            | TargetCommand::SetProgramCounter(_)
            | TargetCommand::GetStackPointer
            | TargetCommand::GetPinStates { .. }
            | TargetCommand::SetPinState { .. } => true,
            TargetCommand::ReadMemory { memory_type, .. }
            | TargetCommand::WriteMemory { memory_type, .. } => *memory_type == MemoryType::Ram,
            _ => false,
        }
    }
}

#[derive(Debug)]
pub enum TargetResponse {
    Ok,
    ControllerState(ControllerState),
    TargetState(TargetState),
    Descriptor(Arc<TargetDescriptor>),
    Registers(Vec<Register>),
    Memory(Vec<u8>),
    ProgramCounter(ProgramCounter),
    StackPointer(StackPointer),
    PinStates(BTreeMap<u32, PinState>),
}

/// One request to the controller: a typed command plus the one-shot
/// reply channel the caller blocks on.
pub struct CommandEnvelope {
    pub id: u64,
    pub command: TargetCommand,
    pub reply: Sender<Result<TargetResponse, Error>>,
}

impl CommandEnvelope {
    pub fn new(command: TargetCommand, reply: Sender<Result<TargetResponse, Error>>) -> Self {
        Self {
            id: NEXT_COMMAND_ID.fetch_add(1, Ordering::Relaxed),
            command,
            reply,
        }
    }
}
