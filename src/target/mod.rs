//! Generic target data model.
//!
//! Everything in here is descriptor data: immutable once a target
//! descriptor has been constructed by a [`provider::DescriptorProvider`].
//! The AVR8 behaviour lives in [`avr8`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

pub mod avr8;
pub mod parameters;
pub mod provider;

pub use parameters::{Avr8Parameters, FuseBitsDescriptor, FuseType, IspParameters};

pub type MemoryAddress = u32;
pub type MemorySize = u32;
pub type MemoryBuffer = Vec<u8>;
pub type ProgramCounter = u32;
pub type StackPointer = u32;

/// The three-byte AVR device signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(pub [u8; 3]);

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02x}{:02x}{:02x}", self.0[0], self.0[1], self.0[2])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    Mega,
    Tiny,
    Xmega,
    Da,
    Db,
    Dd,
    Ea,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PhysicalInterface {
    DebugWire,
    Jtag,
    Pdi,
    Updi,
    Isp,
}

impl fmt::Display for PhysicalInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhysicalInterface::DebugWire => write!(f, "debugWire"),
            PhysicalInterface::Jtag => write!(f, "JTAG"),
            PhysicalInterface::Pdi => write!(f, "PDI"),
            PhysicalInterface::Updi => write!(f, "UPDI"),
            PhysicalInterface::Isp => write!(f, "ISP"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    Flash,
    Ram,
    Eeprom,
    Fuses,
    Other,
}

/// Inclusive address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AddressRange {
    pub start: MemoryAddress,
    pub end: MemoryAddress,
}

impl AddressRange {
    pub fn new(start: MemoryAddress, end: MemoryAddress) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, address: MemoryAddress) -> bool {
        address >= self.start && address <= self.end
    }

    pub fn contains_range(&self, other: &AddressRange) -> bool {
        self.start <= other.start && self.end >= other.end
    }

    pub fn intersects(&self, other: &AddressRange) -> bool {
        other.start <= self.end && other.end >= self.start
    }

    pub fn len(&self) -> MemorySize {
        self.end - self.start + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryAccess {
    pub readable: bool,
    pub writeable: bool,
    /// Writable without an active programming session.
    pub writeable_during_debug: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryDescriptor {
    pub memory_type: MemoryType,
    pub address_range: AddressRange,
    pub access: MemoryAccess,
    pub page_size: Option<MemorySize>,
}

impl MemoryDescriptor {
    pub fn size(&self) -> MemorySize {
        self.address_range.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RegisterType {
    GeneralPurpose,
    ProgramCounter,
    StackPointer,
    Status,
    Port,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegisterDescriptor {
    pub register_type: RegisterType,
    /// Address in the data space. The program counter has no address;
    /// it is accessed through a dedicated debug-interface command.
    pub start_address: Option<MemoryAddress>,
    pub size: MemorySize,
    pub name: String,
    #[serde(default)]
    pub group: Option<String>,
    pub readable: bool,
    pub writable: bool,
}

/// A register value paired with its descriptor.
///
/// Values are held MSB-first; the AVR stores multi-byte registers
/// LSB-first in the data space and the debug interface performs the
/// reversal at the read/write boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Register {
    pub descriptor: RegisterDescriptor,
    pub value: Vec<u8>,
}

impl Register {
    pub fn new(descriptor: RegisterDescriptor, value: Vec<u8>) -> Self {
        Self { descriptor, value }
    }
}

/// Execution state of the target MCU.
///
/// Owned and mutated only by the AVR8 debug interface. `Running` can
/// only become `Stopped` through a decoded Break event; `Stopped` only
/// becomes `Running` through an explicit run/step/run-to command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Unknown,
    Stopped,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BreakpointKind {
    Software,
    Hardware,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Breakpoint {
    pub address: MemoryAddress,
    pub kind: BreakpointKind,
}

/// Pad-level GPIO description, keyed by pad name from the variant's
/// pin list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PadDescriptor {
    pub name: String,
    pub gpio_pin_number: Option<u8>,
    pub ddr_address: Option<MemoryAddress>,
    pub port_address: Option<MemoryAddress>,
    pub input_address: Option<MemoryAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinDescriptor {
    pub number: u32,
    pub pad_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    pub id: u32,
    pub name: String,
    pub pins: Vec<PinDescriptor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinDirection {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinLevel {
    Low,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PinState {
    pub direction: Option<PinDirection>,
    pub level: Option<PinLevel>,
}

/// Everything the pipeline needs to know about one AVR device.
///
/// Immutable after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetDescriptor {
    pub name: String,
    pub signature: Signature,
    pub family: Option<Family>,
    pub physical_interfaces: BTreeSet<PhysicalInterface>,
    pub memories: BTreeMap<MemoryType, MemoryDescriptor>,
    pub registers: BTreeMap<RegisterType, Vec<RegisterDescriptor>>,
    #[serde(default)]
    pub variants: Vec<Variant>,
    #[serde(default)]
    pub pads: BTreeMap<String, PadDescriptor>,
    pub parameters: Avr8Parameters,
}

impl TargetDescriptor {
    pub fn memory(&self, memory_type: MemoryType) -> Option<&MemoryDescriptor> {
        self.memories.get(&memory_type)
    }

    pub fn registers_of_type(&self, register_type: RegisterType) -> &[RegisterDescriptor] {
        self.registers
            .get(&register_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn variant(&self, id: u32) -> Option<&Variant> {
        self.variants.iter().find(|variant| variant.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_range_containment() {
        let range = AddressRange::new(0x100, 0x1ff);

        assert!(range.contains(0x100));
        assert!(range.contains(0x1ff));
        assert!(!range.contains(0x200));
        assert_eq!(range.len(), 0x100);
    }

    #[test]
    fn address_range_intersection() {
        let range = AddressRange::new(0x100, 0x1ff);

        assert!(range.intersects(&AddressRange::new(0x1f0, 0x210)));
        assert!(range.intersects(&AddressRange::new(0x000, 0x100)));
        assert!(!range.intersects(&AddressRange::new(0x200, 0x300)));
    }

    #[test]
    fn signature_formats_as_hex() {
        assert_eq!(Signature([0x1e, 0x95, 0x0f]).to_string(), "0x1e950f");
    }
}
