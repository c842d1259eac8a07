//! AVR8 target façade.
//!
//! Presents the uniform target abstraction on top of the EDBG AVR8
//! debug interface, using the target descriptor for validation and
//! register/memory composition. Also home to the DWEN/OCDEN fuse
//! management procedures, which are the only paths that rewrite fuse
//! bytes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;
use crate::probe::edbg::{EdbgAvr8Interface, ProgramMemorySection};
use crate::target::{
    AddressRange, Breakpoint, BreakpointKind, MemoryAddress, MemoryType, PhysicalInterface,
    PinDescriptor, PinDirection, PinLevel, PinState, ProgramCounter, Register, RegisterDescriptor,
    RegisterType, StackPointer, TargetDescriptor, TargetState,
};

/// Session-level AVR8 configuration, from the project file.
#[derive(Debug, Clone)]
pub struct Avr8Config {
    pub physical_interface: PhysicalInterface,
    pub manage_dwen_fuse: bool,
    pub manage_ocden_fuse: bool,
    pub cycle_target_power_post_dwen_update: bool,
    pub target_power_cycle_delay: Duration,
    pub disable_debug_wire_on_deactivate: bool,
    pub preserve_eeprom: bool,
}

impl Default for Avr8Config {
    fn default() -> Self {
        Self {
            physical_interface: PhysicalInterface::Updi,
            manage_dwen_fuse: false,
            manage_ocden_fuse: false,
            cycle_target_power_post_dwen_update: true,
            target_power_cycle_delay: Duration::from_millis(250),
            disable_debug_wire_on_deactivate: false,
            preserve_eeprom: true,
        }
    }
}

pub struct Avr8 {
    descriptor: Arc<TargetDescriptor>,
    interface: EdbgAvr8Interface,
    config: Avr8Config,
    /// Whether the connected probe exposes an AVRISP side channel.
    has_isp_interface: bool,
    activated: bool,
    programming_mode: bool,
}

impl Avr8 {
    pub fn new(
        descriptor: Arc<TargetDescriptor>,
        interface: EdbgAvr8Interface,
        config: Avr8Config,
        has_isp_interface: bool,
    ) -> Self {
        Self {
            descriptor,
            interface,
            config,
            has_isp_interface,
            activated: false,
            programming_mode: false,
        }
    }

    pub fn descriptor(&self) -> Arc<TargetDescriptor> {
        Arc::clone(&self.descriptor)
    }

    pub fn is_activated(&self) -> bool {
        self.activated
    }

    // --- activation -----------------------------------------------------

    pub fn activate(&mut self) -> Result<(), Error> {
        if self.activated {
            return Ok(());
        }

        if !self
            .descriptor
            .physical_interfaces
            .contains(&self.config.physical_interface)
        {
            // Device descriptions have been known to under-report, so
            // this is a warning rather than a hard failure.
            log::warn!(
                "The selected target ({}) does not list support for the {} physical interface - \
                 activation will likely fail",
                self.descriptor.name,
                self.config.physical_interface
            );
        }

        self.interface.init()?;

        if let Err(error) = self.interface.activate() {
            if !error.is_debug_wire_activation_failure() {
                return Err(error);
            }

            // debugWire bring-up failed: the DWEN fuse may need
            // programming through the ISP side channel.
            if !self.config.manage_dwen_fuse {
                return Err(Error::DeviceInit(
                    "failed to activate the debugWire physical interface - check the target \
                     connection and DWEN fuse bit, or enable DWEN fuse management"
                        .into(),
                ));
            }

            log::warn!(
                "Failed to activate the debugWire physical interface - attempting to access the \
                 target via the ISP interface for DWEN fuse inspection"
            );
            self.update_dwen_fuse(true).map_err(|error| {
                Error::DeviceInit(format!(
                    "failed to access or update the DWEN fuse bit via the ISP interface - {error}"
                ))
            })?;

            if self.config.cycle_target_power_post_dwen_update {
                log::info!("Cycling target power");
                if !self
                    .interface
                    .cycle_target_power(self.config.target_power_cycle_delay)?
                {
                    log::warn!("The connected probe cannot control target power - skipping");
                }
            }

            log::info!("Retrying debugWire physical interface activation");
            self.interface.activate()?;
        }

        if self.config.physical_interface == PhysicalInterface::Jtag
            && self.config.manage_ocden_fuse
        {
            log::debug!("Attempting OCDEN fuse bit management");
            self.update_ocden_fuse(true)?;
        }

        self.activated = true;
        self.interface.reset()?;

        // The signature read from the device must match the device
        // description, or we are talking to the wrong chip.
        let signature = self.interface.get_device_id()?;
        if signature != self.descriptor.signature {
            return Err(Error::Integrity(format!(
                "target signature mismatch: the device reports {signature} but the device \
                 description for \"{}\" declares {}",
                self.descriptor.name, self.descriptor.signature
            )));
        }

        Ok(())
    }

    pub fn deactivate(&mut self) -> Result<(), Error> {
        if self.stop().is_err() {
            log::warn!("Failed to halt the target ahead of deactivation");
        }

        if self.config.physical_interface == PhysicalInterface::Jtag
            && self.config.manage_ocden_fuse
        {
            log::debug!("Attempting OCDEN fuse bit management");
            if let Err(error) = self.update_ocden_fuse(false) {
                log::error!("Failed to clear the OCDEN fuse bit - {error}");
            }
        }

        self.interface.deactivate()?;
        self.activated = false;
        Ok(())
    }

    // --- run control ----------------------------------------------------

    pub fn run(&mut self, to_address: Option<MemoryAddress>) -> Result<(), Error> {
        match to_address {
            Some(address) => self.interface.run_to(address),
            None => self.interface.run(),
        }
    }

    pub fn stop(&mut self) -> Result<(), Error> {
        self.interface.stop()
    }

    pub fn step(&mut self) -> Result<(), Error> {
        self.interface.step()
    }

    pub fn reset(&mut self) -> Result<(), Error> {
        self.interface.reset()
    }

    pub fn get_state(&mut self) -> Result<TargetState, Error> {
        self.interface.get_target_state()
    }

    // --- breakpoints ----------------------------------------------------

    pub fn set_breakpoint(&mut self, breakpoint: Breakpoint) -> Result<(), Error> {
        match breakpoint.kind {
            BreakpointKind::Software => self.interface.set_software_breakpoint(breakpoint.address),
            BreakpointKind::Hardware => self.interface.set_hardware_breakpoint(breakpoint.address),
        }
    }

    pub fn remove_breakpoint(&mut self, breakpoint: Breakpoint) -> Result<(), Error> {
        match breakpoint.kind {
            BreakpointKind::Software => {
                self.interface.clear_software_breakpoint(breakpoint.address)
            }
            BreakpointKind::Hardware => {
                self.interface.clear_hardware_breakpoint(breakpoint.address)
            }
        }
    }

    pub fn clear_all_breakpoints(&mut self) -> Result<(), Error> {
        self.interface.clear_all_breakpoints()
    }

    // --- registers ------------------------------------------------------

    /// Read a set of registers.
    ///
    /// Descriptors are grouped by register type and each group is
    /// served by a single covering memory read, which keeps a
    /// full-register refresh down to a handful of probe transactions.
    pub fn read_registers(
        &mut self,
        descriptors: Vec<RegisterDescriptor>,
    ) -> Result<Vec<Register>, Error> {
        let mut output = Vec::with_capacity(descriptors.len());
        let mut by_type: BTreeMap<RegisterType, Vec<RegisterDescriptor>> = BTreeMap::new();

        for descriptor in descriptors {
            if descriptor.register_type == RegisterType::ProgramCounter {
                output.push(self.program_counter_register(descriptor)?);
                continue;
            }

            if descriptor.start_address.is_none() {
                log::debug!(
                    "Skipping register read in the absence of a start address: {}",
                    descriptor.name
                );
                continue;
            }

            by_type
                .entry(descriptor.register_type)
                .or_default()
                .push(descriptor);
        }

        for (register_type, group) in by_type {
            let start = group
                .iter()
                .map(|d| d.start_address.unwrap())
                .min()
                .unwrap();
            let end = group
                .iter()
                .map(|d| d.start_address.unwrap() + d.size - 1)
                .max()
                .unwrap();
            let size = end - start + 1;

            let buffer = self.interface.read_register_memory(
                register_type == RegisterType::GeneralPurpose,
                start,
                size,
            )?;

            if buffer.len() != size as usize {
                return Err(Error::protocol(
                    format!(
                        "short read over register address range 0x{start:04x}-0x{end:04x}: \
                         expected {size} bytes, got {}",
                        buffer.len()
                    ),
                    None,
                ));
            }

            for descriptor in group {
                let offset = (descriptor.start_address.unwrap() - start) as usize;
                // Multi-byte AVR registers live LSB-first in the data
                // space; register values are carried MSB-first.
                let mut value = buffer[offset..offset + descriptor.size as usize].to_vec();
                value.reverse();

                output.push(Register::new(descriptor, value));
            }
        }

        Ok(output)
    }

    pub fn write_registers(&mut self, registers: Vec<Register>) -> Result<(), Error> {
        for register in registers {
            if register.descriptor.register_type == RegisterType::ProgramCounter {
                let mut bytes = register.value.clone();
                if bytes.len() > 4 {
                    return Err(Error::InvalidArgument(
                        "program counter value exceeds four bytes".into(),
                    ));
                }
                while bytes.len() < 4 {
                    bytes.insert(0, 0x00);
                }

                let pc = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                self.set_program_counter(pc)?;
                continue;
            }

            let descriptor = &register.descriptor;
            let mut value = register.value.clone();

            if value.is_empty() {
                return Err(Error::InvalidArgument(
                    "cannot write an empty register value".into(),
                ));
            }

            if value.len() > descriptor.size as usize {
                return Err(Error::InvalidArgument(format!(
                    "value for register {} exceeds its declared size of {} bytes",
                    descriptor.name, descriptor.size
                )));
            }

            while value.len() < descriptor.size as usize {
                value.insert(0, 0x00);
            }

            // Back to LSB-first for the data space.
            value.reverse();

            let address = descriptor.start_address.ok_or_else(|| {
                Error::InvalidArgument(format!("register {} has no address", descriptor.name))
            })?;

            self.interface.write_register_memory(
                descriptor.register_type == RegisterType::GeneralPurpose,
                address,
                &value,
            )?;
        }

        Ok(())
    }

    fn program_counter_register(
        &mut self,
        descriptor: RegisterDescriptor,
    ) -> Result<Register, Error> {
        let pc = self.get_program_counter()?;
        Ok(Register::new(descriptor, pc.to_be_bytes().to_vec()))
    }

    pub fn get_program_counter(&mut self) -> Result<ProgramCounter, Error> {
        self.interface.get_program_counter()
    }

    pub fn set_program_counter(&mut self, address: ProgramCounter) -> Result<(), Error> {
        self.interface.set_program_counter(address)
    }

    pub fn get_stack_pointer(&mut self) -> Result<StackPointer, Error> {
        let descriptor = self
            .descriptor
            .registers_of_type(RegisterType::StackPointer)
            .first()
            .cloned()
            .ok_or_else(|| Error::DeviceInit("missing stack pointer register descriptor".into()))?;

        let register = self
            .read_registers(vec![descriptor])?
            .into_iter()
            .next()
            .ok_or_else(|| Error::DeviceInit("failed to read the stack pointer".into()))?;

        let mut stack_pointer: u32 = 0;
        for byte in register.value.iter().take(4) {
            stack_pointer = (stack_pointer << 8) | u32::from(*byte);
        }

        Ok(stack_pointer)
    }

    // --- memory ---------------------------------------------------------

    fn validate_access(
        &self,
        memory_type: MemoryType,
        address: MemoryAddress,
        bytes: u32,
    ) -> Result<(), Error> {
        let descriptor = self.descriptor.memory(memory_type).ok_or_else(|| {
            Error::InvalidArgument(format!("target has no {memory_type:?} memory"))
        })?;

        // RAM is validated from address zero: the data space maps
        // registers and peripherals below the SRAM segment, and the
        // debugger is allowed to touch them.
        let start = if memory_type == MemoryType::Ram {
            0
        } else {
            descriptor.address_range.start
        };

        if bytes == 0 {
            return Ok(());
        }

        if address < start || address + bytes - 1 > descriptor.address_range.end {
            return Err(Error::InvalidArgument(format!(
                "requested access to 0x{address:04x}..0x{:04x} is outside the target's \
                 {memory_type:?} range",
                address + bytes - 1
            )));
        }

        Ok(())
    }

    pub fn read_memory(
        &mut self,
        memory_type: MemoryType,
        address: MemoryAddress,
        bytes: u32,
        excluded_ranges: &[AddressRange],
    ) -> Result<Vec<u8>, Error> {
        self.validate_access(memory_type, address, bytes)?;

        if bytes == 0 {
            return Ok(Vec::new());
        }

        self.interface
            .read_memory(memory_type, address, bytes, excluded_ranges)
    }

    pub fn write_memory(
        &mut self,
        memory_type: MemoryType,
        address: MemoryAddress,
        buffer: &[u8],
    ) -> Result<(), Error> {
        self.validate_access(memory_type, address, buffer.len() as u32)?;

        if memory_type == MemoryType::Flash && !self.programming_mode {
            return Err(Error::Precondition(
                "flash writes require an active programming session".into(),
            ));
        }

        if buffer.is_empty() {
            return Ok(());
        }

        self.interface.write_memory(memory_type, address, buffer)
    }

    pub fn erase_memory(&mut self, memory_type: MemoryType) -> Result<(), Error> {
        match memory_type {
            MemoryType::Flash => {
                if self.config.physical_interface == PhysicalInterface::DebugWire {
                    // debugWire flash is rewritten in place during
                    // programming; there is nothing to erase up front.
                    return Ok(());
                }

                self.interface.erase_program_memory(None)
            }
            MemoryType::Ram | MemoryType::Eeprom => {
                // Probes are not required to support erasing these;
                // an erased-pattern fill is equivalent.
                let descriptor = self.descriptor.memory(memory_type).ok_or_else(|| {
                    Error::InvalidArgument(format!("target has no {memory_type:?} memory"))
                })?;
                let start = descriptor.address_range.start;
                let size = descriptor.size();

                self.write_memory(memory_type, start, &vec![0xFF; size as usize])
            }
            _ => Err(Error::InvalidArgument(format!(
                "cannot erase {memory_type:?} memory"
            ))),
        }
    }

    pub fn erase_program_memory_section(
        &mut self,
        section: ProgramMemorySection,
    ) -> Result<(), Error> {
        self.interface.erase_program_memory(Some(section))
    }

    // --- pins -----------------------------------------------------------

    pub fn get_pin_states(&mut self, variant_id: u32) -> Result<BTreeMap<u32, PinState>, Error> {
        let variant = self
            .descriptor
            .variant(variant_id)
            .ok_or_else(|| Error::InvalidArgument("invalid target variant id".into()))?
            .clone();

        let mut output = BTreeMap::new();
        // One read per distinct port register rather than one per pin.
        let mut cached_bytes: BTreeMap<MemoryAddress, u8> = BTreeMap::new();

        for pin in &variant.pins {
            let Some(pad) = self.descriptor.pads.get(&pin.pad_name).cloned() else {
                continue;
            };
            let Some(pin_number) = pad.gpio_pin_number else {
                continue;
            };

            let mut read_byte = |target: &mut Self, address: MemoryAddress| -> Result<u8, Error> {
                if let Some(&byte) = cached_bytes.get(&address) {
                    return Ok(byte);
                }
                let byte = target.read_memory(MemoryType::Ram, address, 1, &[])?[0];
                cached_bytes.insert(address, byte);
                Ok(byte)
            };

            let mut state = PinState::default();

            if let Some(ddr_address) = pad.ddr_address {
                let ddr = read_byte(self, ddr_address)?;
                let output_direction = ddr & (1 << pin_number) != 0;
                state.direction = Some(if output_direction {
                    PinDirection::Output
                } else {
                    PinDirection::Input
                });

                if output_direction {
                    if let Some(port_address) = pad.port_address {
                        let port = read_byte(self, port_address)?;
                        state.level = Some(if port & (1 << pin_number) != 0 {
                            PinLevel::High
                        } else {
                            PinLevel::Low
                        });
                    }
                } else if let Some(input_address) = pad.input_address {
                    let input = read_byte(self, input_address)?;
                    state.level = Some(if input & (1 << pin_number) != 0 {
                        PinLevel::High
                    } else {
                        PinLevel::Low
                    });
                }
            }

            output.insert(pin.number, state);
        }

        Ok(output)
    }

    pub fn set_pin_state(&mut self, pin: &PinDescriptor, state: PinState) -> Result<(), Error> {
        let pad = self
            .descriptor
            .pads
            .get(&pin.pad_name)
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("unknown pad \"{}\"", pin.pad_name)))?;

        let direction = state
            .direction
            .ok_or_else(|| Error::InvalidArgument("missing pin direction".into()))?;

        let (Some(pin_number), Some(ddr_address), Some(port_address)) =
            (pad.gpio_pin_number, pad.ddr_address, pad.port_address)
        else {
            return Err(Error::InvalidArgument(format!(
                "pad \"{}\" does not describe a controllable GPIO",
                pad.name
            )));
        };

        // Pins switched to input are always driven low to avoid
        // enabling the pull-up unintentionally.
        let level = if direction == PinDirection::Input {
            Some(PinLevel::Low)
        } else {
            state.level
        };

        let ddr = self.read_memory(MemoryType::Ram, ddr_address, 1, &[])?[0];
        let ddr_bit_set = ddr & (1 << pin_number) != 0;
        if ddr_bit_set != (direction == PinDirection::Output) {
            let new_ddr = if direction == PinDirection::Output {
                ddr | (1 << pin_number)
            } else {
                ddr & !(1 << pin_number)
            };
            self.write_memory(MemoryType::Ram, ddr_address, &[new_ddr])?;
        }

        if let Some(level) = level {
            let port = self.read_memory(MemoryType::Ram, port_address, 1, &[])?[0];
            let port_bit_set = port & (1 << pin_number) != 0;
            if port_bit_set != (level == PinLevel::High) {
                let new_port = if level == PinLevel::High {
                    port | (1 << pin_number)
                } else {
                    port & !(1 << pin_number)
                };
                self.write_memory(MemoryType::Ram, port_address, &[new_port])?;
            }
        }

        Ok(())
    }

    // --- programming mode -----------------------------------------------

    pub fn enable_programming_mode(&mut self) -> Result<(), Error> {
        self.interface.enable_programming_mode()?;
        self.programming_mode = true;
        Ok(())
    }

    pub fn disable_programming_mode(&mut self) -> Result<(), Error> {
        self.interface.disable_programming_mode()?;
        self.programming_mode = false;
        Ok(())
    }

    pub fn programming_mode_enabled(&self) -> bool {
        self.programming_mode
    }

    // --- fuse management ------------------------------------------------

    /// Program or clear the DWEN fuse bit through the ISP side channel.
    ///
    /// A wrong fuse write can permanently lock the device out of both
    /// serial programming and debugWire, so the update only proceeds
    /// when every one of the following holds:
    ///
    /// 1. the signature read over ISP matches the device description;
    /// 2. the SPIEN fuse bit reads as programmed - it must be, since
    ///    the ISP link is alive, so an unprogrammed reading means the
    ///    description's fuse layout cannot be trusted;
    /// 3. the DWEN bit is not already at the requested value;
    /// 4. every lock bit is cleared.
    ///
    /// After programming, the fuse byte is read back and verified.
    pub fn update_dwen_fuse(&mut self, enable: bool) -> Result<(), Error> {
        if !self.has_isp_interface {
            return Err(Error::DeviceInit(
                "the connected probe does not provide an ISP interface".into(),
            ));
        }

        if !self
            .descriptor
            .physical_interfaces
            .contains(&PhysicalInterface::DebugWire)
        {
            return Err(Error::DeviceInit(
                "target does not support the debugWire physical interface".into(),
            ));
        }

        let dwen = self.descriptor.parameters.dwen_fuse.ok_or_else(|| {
            Error::DeviceInit("no DWEN bit field in the device description".into())
        })?;
        let spien = self.descriptor.parameters.spien_fuse.ok_or_else(|| {
            Error::DeviceInit("no SPIEN bit field in the device description".into())
        })?;
        let expected_signature = self.descriptor.signature;

        log::warn!(
            "Updating the DWEN fuse bit - this operation rewrites target fuses and is \
             potentially destructive"
        );

        let mut isp = self.interface.isp();

        log::info!("Initiating ISP interface");
        isp.activate()?;

        let result = (|| {
            log::info!("Reading target signature via ISP");
            let signature = isp.get_device_id()?;
            if signature != expected_signature {
                return Err(Error::Integrity(format!(
                    "target signature mismatch over ISP: expected {expected_signature}, \
                     read {signature}"
                )));
            }
            log::info!("Target signature confirmed: {signature}");

            // A set bit means the fuse is cleared; a cleared bit means
            // it is programmed.
            let dwen_byte = isp.read_fuse(dwen.fuse_type)?;
            let spien_byte = if spien.fuse_type == dwen.fuse_type {
                dwen_byte
            } else {
                isp.read_fuse(spien.fuse_type)?
            };

            if spien_byte & spien.bit_mask != 0 {
                // We are talking to the target over SPI right now, so
                // SPIEN cannot actually be unprogrammed. The fuse
                // layout in the device description is wrong, and the
                // DWEN data cannot be trusted either.
                return Err(Error::Integrity(
                    "the SPIEN fuse bit reads as unprogrammed, which is impossible over a live \
                     ISP connection - refusing to touch the DWEN fuse"
                        .into(),
                ));
            }
            log::info!("Current SPIEN fuse bit value confirmed");

            if (dwen_byte & dwen.bit_mask == 0) == enable {
                log::debug!("DWEN fuse bit already at the desired value - nothing to update");
                return Ok(());
            }

            let lock_byte = isp.read_lock_byte()?;
            if lock_byte != 0xFF {
                return Err(Error::Integrity(
                    "at least one lock bit is set - updating the DWEN fuse bit could render \
                     the target unreachable"
                        .into(),
                ));
            }
            log::info!("Cleared lock bits confirmed");

            let new_value = if enable {
                dwen_byte & !dwen.bit_mask
            } else {
                dwen_byte | dwen.bit_mask
            };

            log::warn!("Updating DWEN fuse bit");
            isp.program_fuse(dwen.fuse_type, new_value)?;

            log::debug!("Verifying DWEN fuse bit");
            if isp.read_fuse(dwen.fuse_type)? != new_value {
                return Err(Error::Integrity(
                    "DWEN fuse byte verification failed after programming".into(),
                ));
            }

            log::info!("DWEN fuse bit updated");
            Ok(())
        })();

        let deactivation = isp.deactivate();
        result?;
        deactivation
    }

    /// Program or clear the OCDEN fuse bit through the debug interface.
    ///
    /// Uses the same guard structure as the DWEN update, with JTAGEN in
    /// the SPIEN role: the JTAGEN fuse must read as programmed, since a
    /// live JTAG session could not exist otherwise.
    pub fn update_ocden_fuse(&mut self, enable: bool) -> Result<(), Error> {
        if !self
            .descriptor
            .physical_interfaces
            .contains(&PhysicalInterface::Jtag)
        {
            return Err(Error::DeviceInit(
                "target does not support the JTAG physical interface".into(),
            ));
        }

        let ocden = self.descriptor.parameters.ocden_fuse.ok_or_else(|| {
            Error::DeviceInit("no OCDEN bit field in the device description".into())
        })?;
        let jtagen = self.descriptor.parameters.jtagen_fuse.ok_or_else(|| {
            Error::DeviceInit("no JTAGEN bit field in the device description".into())
        })?;

        let expected_signature = self.descriptor.signature;
        let signature = self.interface.get_device_id()?;
        if signature != expected_signature {
            return Err(Error::Integrity(format!(
                "target signature mismatch: expected {expected_signature}, read {signature}"
            )));
        }

        self.interface.enable_programming_mode()?;

        let result = (|| {
            let ocden_address = ocden.fuse_type.byte_address();
            let jtagen_address = jtagen.fuse_type.byte_address();

            let ocden_byte =
                self.interface
                    .read_memory(MemoryType::Fuses, ocden_address, 1, &[])?[0];
            let jtagen_byte = if jtagen_address == ocden_address {
                ocden_byte
            } else {
                self.interface
                    .read_memory(MemoryType::Fuses, jtagen_address, 1, &[])?[0]
            };

            log::debug!("OCDEN fuse byte value (before update): 0x{ocden_byte:02x}");

            if jtagen_byte & jtagen.bit_mask != 0 {
                // JTAGEN must be programmed for this session to exist
                // at all; the fuse layout data is suspect.
                return Err(Error::Integrity(
                    "the JTAGEN fuse bit reads as unprogrammed, which is impossible over a live \
                     JTAG connection - refusing to touch the OCDEN fuse"
                        .into(),
                ));
            }

            if (ocden_byte & ocden.bit_mask == 0) == enable {
                log::debug!("OCDEN fuse bit already at the desired value - nothing to update");
                return Ok(());
            }

            let new_value = if enable {
                ocden_byte & !ocden.bit_mask
            } else {
                ocden_byte | ocden.bit_mask
            };

            log::warn!("Updating OCDEN fuse bit");
            self.interface
                .write_memory(MemoryType::Fuses, ocden_address, &[new_value])?;

            log::debug!("Verifying OCDEN fuse bit");
            let read_back =
                self.interface
                    .read_memory(MemoryType::Fuses, ocden_address, 1, &[])?[0];
            if read_back != new_value {
                return Err(Error::Integrity(
                    "OCDEN fuse byte verification failed after programming".into(),
                ));
            }

            log::info!("OCDEN fuse bit updated");
            Ok(())
        })();

        let leave = self.interface.disable_programming_mode();
        result?;
        leave
    }
}
