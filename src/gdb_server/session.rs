//! Per-client debug session state and the GDB view of the target.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::Error;
use crate::target::{
    BreakpointKind, MemoryAddress, MemoryType, RegisterDescriptor, RegisterType, TargetDescriptor,
};

/// avr-gdb places the three AVR address spaces at fixed offsets within
/// one flat address space.
pub const SRAM_ADDRESS_MASK: u32 = 0x0080_0000;
pub const EEPROM_ADDRESS_MASK: u32 = 0x0081_0000;

/// Map a GDB flat address onto a memory type and a type-local address.
pub fn memory_type_from_gdb_address(address: u32) -> (MemoryType, MemoryAddress) {
    if address & EEPROM_ADDRESS_MASK == EEPROM_ADDRESS_MASK {
        (MemoryType::Eeprom, address & !EEPROM_ADDRESS_MASK)
    } else if address & SRAM_ADDRESS_MASK == SRAM_ADDRESS_MASK {
        (MemoryType::Ram, address & !SRAM_ADDRESS_MASK)
    } else {
        (MemoryType::Flash, address)
    }
}

/// One GDB register slot: its number, its wire size, and the target
/// register behind it.
#[derive(Debug, Clone)]
pub struct GdbRegister {
    pub number: u16,
    pub size: u32,
    pub target: RegisterDescriptor,
}

/// The fixed avr-gdb register numbering: r0..r31 in slots 0 through
/// 31, SREG in 32, SP in 33 and PC in 34.
#[derive(Debug, Clone)]
pub struct GdbTargetDescriptor {
    pub target: Arc<TargetDescriptor>,
    pub registers: Vec<GdbRegister>,
}

impl GdbTargetDescriptor {
    pub fn new(target: Arc<TargetDescriptor>) -> Result<Self, Error> {
        let mut registers = Vec::with_capacity(35);

        let mut general_purpose: Vec<RegisterDescriptor> = target
            .registers_of_type(RegisterType::GeneralPurpose)
            .to_vec();
        general_purpose.sort_by_key(|descriptor| descriptor.start_address);

        if general_purpose.len() != 32 {
            return Err(Error::DeviceInit(format!(
                "expected 32 general purpose registers, the device description provides {}",
                general_purpose.len()
            )));
        }

        for (number, descriptor) in general_purpose.into_iter().enumerate() {
            registers.push(GdbRegister {
                number: number as u16,
                size: 1,
                target: descriptor,
            });
        }

        let status = target
            .registers_of_type(RegisterType::Status)
            .first()
            .cloned()
            .ok_or_else(|| Error::DeviceInit("missing status register descriptor".into()))?;
        registers.push(GdbRegister {
            number: 32,
            size: 1,
            target: status,
        });

        let stack_pointer = target
            .registers_of_type(RegisterType::StackPointer)
            .first()
            .cloned()
            .ok_or_else(|| Error::DeviceInit("missing stack pointer register descriptor".into()))?;
        registers.push(GdbRegister {
            number: 33,
            size: 2,
            target: stack_pointer,
        });

        let program_counter = target
            .registers_of_type(RegisterType::ProgramCounter)
            .first()
            .cloned()
            .ok_or_else(|| Error::DeviceInit("missing program counter descriptor".into()))?;
        registers.push(GdbRegister {
            number: 34,
            size: 4,
            target: program_counter,
        });

        Ok(Self { target, registers })
    }

    pub fn register(&self, number: u16) -> Option<&GdbRegister> {
        self.registers
            .iter()
            .find(|register| register.number == number)
    }

    pub fn number_for(&self, descriptor: &RegisterDescriptor) -> Option<u16> {
        self.registers
            .iter()
            .find(|register| &register.target == descriptor)
            .map(|register| register.number)
    }

    /// The target description XML served through
    /// `qXfer:features:read:target.xml`.
    pub fn target_xml(&self) -> String {
        let mut xml = String::with_capacity(2048);
        xml.push_str(
            "<?xml version=\"1.0\"?>\n\
             <!DOCTYPE target SYSTEM \"gdb-target.dtd\">\n\
             <target version=\"1.0\">\n\
             <architecture>avr</architecture>\n\
             <feature name=\"org.gnu.gdb.avr.cpu\">\n",
        );

        for register in &self.registers {
            let (name, reg_type): (&str, &str) = match register.number {
                32 => ("SREG", "int8"),
                33 => ("SP", "data_ptr"),
                34 => ("PC", "code_ptr"),
                _ => (&register.target.name, "int8"),
            };

            xml.push_str(&format!(
                "<reg name=\"{name}\" bitsize=\"{}\" type=\"{reg_type}\"/>\n",
                register.size * 8
            ));
        }

        xml.push_str("</feature>\n</target>\n");
        xml
    }
}

/// Accumulated `vFlashWrite` data, keyed and merged by flash address.
#[derive(Debug, Default)]
pub struct FlashProgramming {
    pub erase_requested: bool,
    pub buffers: BTreeMap<MemoryAddress, Vec<u8>>,
}

impl FlashProgramming {
    pub fn record_write(&mut self, address: MemoryAddress, data: &[u8]) {
        // GDB streams contiguous chunks; merge them so each flash
        // region is written in one service call.
        if let Some((&start, buffer)) = self.buffers.iter_mut().next_back() {
            if start + buffer.len() as u32 == address {
                buffer.extend_from_slice(data);
                return;
            }
        }

        self.buffers.insert(address, data.to_vec());
    }

    pub fn clear(&mut self) {
        self.erase_requested = false;
        self.buffers.clear();
    }
}

/// Mutable per-connection state.
pub struct DebugSession {
    pub descriptor: GdbTargetDescriptor,
    pub breakpoints: BTreeMap<MemoryAddress, BreakpointKind>,
    pub flash: FlashProgramming,
    /// Set when the client interrupted execution; the next stop reply
    /// carries SIGINT instead of SIGTRAP.
    pub interrupt_requested: bool,
}

impl DebugSession {
    pub fn new(target: Arc<TargetDescriptor>) -> Result<Self, Error> {
        Ok(Self {
            descriptor: GdbTargetDescriptor::new(target)?,
            breakpoints: BTreeMap::new(),
            flash: FlashProgramming::default(),
            interrupt_requested: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gdb_address_mapping() {
        assert_eq!(
            memory_type_from_gdb_address(0x0000_0100),
            (MemoryType::Flash, 0x100)
        );
        assert_eq!(
            memory_type_from_gdb_address(0x0080_0100),
            (MemoryType::Ram, 0x100)
        );
        assert_eq!(
            memory_type_from_gdb_address(0x0081_0000),
            (MemoryType::Eeprom, 0x0000)
        );
        assert_eq!(
            memory_type_from_gdb_address(0x0081_0004),
            (MemoryType::Eeprom, 0x0004)
        );
    }

    #[test]
    fn contiguous_flash_writes_merge() {
        let mut flash = FlashProgramming::default();
        flash.record_write(0x0, &[1, 2, 3, 4]);
        flash.record_write(0x4, &[5, 6]);
        flash.record_write(0x100, &[7]);

        assert_eq!(flash.buffers.len(), 2);
        assert_eq!(flash.buffers[&0x0], vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(flash.buffers[&0x100], vec![7]);
    }
}
