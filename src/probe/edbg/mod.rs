//! EDBG vendor protocol: framing plus the AVR8 debug interface.
//!
//! [`EdbgSession`] owns the wire transport and speaks the EDBG frame
//! envelope (SOF, sequence number, sub-protocol). [`EdbgAvr8Interface`]
//! sits on top and implements the AVR8-generic protocol state machine:
//! configuration variants, parameter push, activation ordering, memory
//! translation with alignment/chunking/masking, and event-driven target
//! state tracking.

use std::collections::BTreeSet;
use std::thread;
use std::time::{Duration, Instant};

use scroll::{Pread, LE};

use crate::error::Error;
use crate::probe::{TransportError, WireTransport};
use crate::target::avr8::Avr8Config;
use crate::target::{
    AddressRange, Avr8Parameters, Family, MemoryAddress, MemorySize, MemoryType, PhysicalInterface,
    Signature, TargetState,
};

pub mod avr8;
pub mod isp;

use avr8::{command, parameters, Event, Memtype, Response, SubProtocol};

pub const EDBG_SOF: u8 = 0x0E;

/// Delay applied after a reset Break event. EDBG tools reject commands
/// issued immediately after reset with an illegal-state error.
const POST_RESET_DELAY: Duration = Duration::from_millis(250);

/// How long to wait for a Break event before giving up.
const STOP_EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Non-payload bytes in a memory access command; used to size requests
/// so a single access never spans more than two HID reports.
const MEMORY_COMMAND_OVERHEAD: usize = 30;

/// An open EDBG session: the transport plus sequence-number state.
pub struct EdbgSession {
    transport: Box<dyn WireTransport>,
    sequence: u16,
}

impl EdbgSession {
    pub fn new(transport: Box<dyn WireTransport>) -> Self {
        Self {
            transport,
            sequence: 0,
        }
    }

    pub fn report_size(&self) -> usize {
        self.transport.report_size()
    }

    pub fn set_target_power(&mut self, on: bool) -> Result<(), TransportError> {
        self.transport.set_target_power(on)
    }

    /// Send one sub-protocol command and return the response payload,
    /// with the envelope verified and stripped.
    pub fn send_command(
        &mut self,
        sub_protocol: SubProtocol,
        payload: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let mut frame: Vec<u8> = vec![
            EDBG_SOF,
            0x00,
            (self.sequence & 0xff) as u8,
            (self.sequence >> 8) as u8,
            sub_protocol as u8,
        ];
        frame.extend_from_slice(payload);

        log::trace!("EDBG > {:02x?}", frame);
        let response = self.transport.send_frame(&frame)?;
        log::trace!("EDBG < {:02x?}", response);

        if response.first() != Some(&EDBG_SOF) {
            return Err(Error::protocol("wrong SOF byte in EDBG response", None));
        }

        let sequence = response
            .pread_with::<u16>(1, LE)
            .map_err(|_| Error::protocol("truncated EDBG response", None))?;
        if sequence != self.sequence {
            return Err(Error::protocol(
                format!(
                    "EDBG sequence mismatch: sent {}, received {}",
                    self.sequence, sequence
                ),
                None,
            ));
        }

        self.sequence = self.sequence.wrapping_add(1);
        Ok(response[4..].to_vec())
    }

    /// Send one AVR8-generic command frame and decode the response.
    pub fn send_avr8(&mut self, command_frame: &[u8]) -> Result<Response, Error> {
        let payload = self.send_command(SubProtocol::Avr8Generic, command_frame)?;
        Response::parse(&payload)
    }

    /// Send one AVRISP command frame, returning the raw response.
    pub fn send_isp(&mut self, command_frame: &[u8]) -> Result<Vec<u8>, Error> {
        self.send_command(SubProtocol::AvrIsp, command_frame)
    }

    /// Poll for one pending AVR event.
    pub fn poll_avr_event(&mut self) -> Result<Option<Event>, Error> {
        let raw = match self.transport.poll_event()? {
            Some(raw) => raw,
            None => return Ok(None),
        };

        if raw.first() != Some(&EDBG_SOF) || raw.len() < 5 {
            return Err(Error::protocol("malformed EDBG event frame", None));
        }

        // SOF + sequence + sub-protocol
        Ok(Some(avr8::parse_event(&raw[4..])?))
    }
}

/// The flavour of the AVR8-generic command set for one (family,
/// physical interface) pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigVariant {
    None,
    DebugWire,
    MegaJtag,
    Xmega,
    Updi,
}

/// Program-memory sections an erase request can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramMemorySection {
    Application,
    Boot,
}

/// Resolve the configuration variant for a family and physical
/// interface.
///
/// Without a family, JTAG is ambiguous (megaAVR vs XMEGA) and cannot be
/// resolved.
pub fn resolve_config_variant(
    family: Option<Family>,
    interface: PhysicalInterface,
) -> Option<ConfigVariant> {
    match family {
        Some(Family::Mega) | Some(Family::Tiny) => match interface {
            PhysicalInterface::Jtag => Some(ConfigVariant::MegaJtag),
            PhysicalInterface::DebugWire => Some(ConfigVariant::DebugWire),
            PhysicalInterface::Updi => Some(ConfigVariant::Updi),
            _ => None,
        },
        Some(Family::Xmega) => match interface {
            PhysicalInterface::Jtag | PhysicalInterface::Pdi => Some(ConfigVariant::Xmega),
            _ => None,
        },
        Some(Family::Da) | Some(Family::Db) | Some(Family::Dd) | Some(Family::Ea) => {
            match interface {
                PhysicalInterface::Updi => Some(ConfigVariant::Updi),
                _ => None,
            }
        }
        None => match interface {
            PhysicalInterface::DebugWire => Some(ConfigVariant::DebugWire),
            PhysicalInterface::Pdi => Some(ConfigVariant::Xmega),
            PhysicalInterface::Updi => Some(ConfigVariant::Updi),
            _ => None,
        },
    }
}

/// The AVR8 debug protocol state machine.
pub struct EdbgAvr8Interface {
    session: EdbgSession,
    config: Avr8Config,
    parameters: Avr8Parameters,
    variant: ConfigVariant,
    target_state: TargetState,
    physical_activated: bool,
    attached: bool,
    programming_mode: bool,
    /// Use driver-side split reads instead of the masked-read command.
    avoid_masked_read: bool,
    /// Re-activate the JTAG physical interface after leaving
    /// programming mode. Some megaAVR JTAG targets lose OCD control
    /// otherwise.
    reactivate_jtag_post_programming: bool,
}

impl EdbgAvr8Interface {
    pub fn new(
        transport: Box<dyn WireTransport>,
        config: Avr8Config,
        family: Option<Family>,
        parameters: Avr8Parameters,
    ) -> Result<Self, Error> {
        let variant =
            resolve_config_variant(family, config.physical_interface).ok_or_else(|| {
                Error::DeviceInit(format!(
                    "failed to resolve a configuration variant for the {} physical interface - \
                     the selected interface is not supported by this family, or the family is \
                     too ambiguous for it",
                    config.physical_interface
                ))
            })?;

        if parameters.stack_pointer_address.is_none() {
            return Err(Error::DeviceInit(
                "missing stack pointer register address".into(),
            ));
        }

        if parameters.status_register_address.is_none() {
            return Err(Error::DeviceInit(
                "missing status register address".into(),
            ));
        }

        Ok(Self {
            session: EdbgSession::new(transport),
            config,
            parameters,
            variant,
            target_state: TargetState::Unknown,
            physical_activated: false,
            attached: false,
            programming_mode: false,
            avoid_masked_read: false,
            reactivate_jtag_post_programming: true,
        })
    }

    pub fn variant(&self) -> ConfigVariant {
        self.variant
    }

    pub fn programming_mode_enabled(&self) -> bool {
        self.programming_mode
    }

    /// Access the AVRISP side channel on the same probe session.
    pub fn isp(&mut self) -> isp::EdbgAvrIspInterface<'_> {
        isp::EdbgAvrIspInterface::new(&mut self.session, self.parameters.isp.clone())
    }

    pub fn cycle_target_power(&mut self, hold: Duration) -> Result<bool, Error> {
        match self.session.set_target_power(false) {
            Ok(()) => {}
            Err(TransportError::Unsupported) => return Ok(false),
            Err(other) => return Err(other.into()),
        }

        log::debug!("Holding target power off for ~{} ms", hold.as_millis());
        thread::sleep(hold);
        self.session.set_target_power(true)?;
        thread::sleep(hold);
        Ok(true)
    }

    // --- parameter push -------------------------------------------------

    fn set_parameter(&mut self, parameter: avr8::Parameter, value: &[u8]) -> Result<(), Error> {
        log::debug!(
            "Setting AVR8 EDBG parameter (context: 0x{:02x}, id: 0x{:02x}, value: {:02x?})",
            parameter.context as u8,
            parameter.id,
            value
        );
        self.session
            .send_avr8(&command::set_parameter(parameter, value))?
            .expect_ok("set parameter")
    }

    fn set_parameter_u8(&mut self, parameter: avr8::Parameter, value: u8) -> Result<(), Error> {
        self.set_parameter(parameter, &[value])
    }

    fn set_parameter_u16(&mut self, parameter: avr8::Parameter, value: u16) -> Result<(), Error> {
        self.set_parameter(parameter, &value.to_le_bytes())
    }

    fn set_parameter_u32(&mut self, parameter: avr8::Parameter, value: u32) -> Result<(), Error> {
        self.set_parameter(parameter, &value.to_le_bytes())
    }

    /// Push the configuration, physical-interface and device parameter
    /// blocks. Must run before activation.
    pub fn init(&mut self) -> Result<(), Error> {
        if self.variant == ConfigVariant::Xmega {
            // Default PDI clock to 4MHz
            self.set_parameter_u16(parameters::PDI_CLOCK_SPEED, 4000)?;
        }

        if self.variant == ConfigVariant::Updi {
            // Default UPDI clock to 1.8MHz, high-voltage activation off
            self.set_parameter_u16(parameters::PDI_CLOCK_SPEED, 1800)?;
            self.set_parameter_u8(parameters::ENABLE_HIGH_VOLTAGE_UPDI, 0)?;
        }

        if self.variant == ConfigVariant::MegaJtag {
            // Default clock for megaAVR debugging is 200KHz
            self.set_parameter_u16(parameters::MEGA_DEBUG_CLOCK, 200)?;
            self.set_parameter_u32(parameters::JTAG_DAISY_CHAIN_SETTINGS, 0)?;
        }

        let variant_value = match self.variant {
            ConfigVariant::None => avr8::VariantValue::None,
            ConfigVariant::DebugWire => avr8::VariantValue::DebugWire,
            ConfigVariant::MegaJtag => avr8::VariantValue::MegaJtag,
            ConfigVariant::Xmega => avr8::VariantValue::Xmega,
            ConfigVariant::Updi => avr8::VariantValue::Updi,
        };
        self.set_parameter_u8(parameters::CONFIG_VARIANT, variant_value as u8)?;
        self.set_parameter_u8(
            parameters::CONFIG_FUNCTION,
            avr8::FunctionValue::Debugging as u8,
        )?;

        let physical = match self.config.physical_interface {
            PhysicalInterface::Jtag => avr8::PhysicalInterfaceId::Jtag,
            PhysicalInterface::DebugWire => avr8::PhysicalInterfaceId::DebugWire,
            PhysicalInterface::Pdi => avr8::PhysicalInterfaceId::Pdi,
            PhysicalInterface::Updi => avr8::PhysicalInterfaceId::Updi,
            PhysicalInterface::Isp => {
                return Err(Error::DeviceInit(
                    "the ISP interface cannot host a debug session".into(),
                ))
            }
        };
        self.set_parameter_u8(parameters::PHYSICAL_INTERFACE, physical as u8)?;

        match self.variant {
            ConfigVariant::DebugWire | ConfigVariant::MegaJtag => {
                self.set_debug_wire_and_jtag_parameters()
            }
            ConfigVariant::Xmega => self.set_pdi_parameters(),
            ConfigVariant::Updi => self.set_updi_parameters(),
            ConfigVariant::None => Ok(()),
        }
    }

    fn set_debug_wire_and_jtag_parameters(&mut self) -> Result<(), Error> {
        let params = self.parameters.clone();

        if let Some(value) = params.flash_page_size {
            self.set_parameter_u16(parameters::DEVICE_FLASH_PAGE_SIZE, value as u16)?;
        }

        if let Some(value) = params.flash_size {
            self.set_parameter_u32(parameters::DEVICE_FLASH_SIZE, value)?;
        }

        if let Some(value) = params.flash_start {
            self.set_parameter_u32(parameters::DEVICE_FLASH_BASE, value)?;
        }

        if let Some(value) = params.ram_start {
            self.set_parameter_u16(parameters::DEVICE_SRAM_START, value as u16)?;
        }

        if let Some(value) = params.eeprom_size {
            self.set_parameter_u16(parameters::DEVICE_EEPROM_SIZE, value as u16)?;
        }

        if let Some(value) = params.eeprom_page_size {
            self.set_parameter_u8(parameters::DEVICE_EEPROM_PAGE_SIZE, value)?;
        }

        if let Some(value) = params.ocd_revision {
            self.set_parameter_u8(parameters::DEVICE_OCD_REVISION, value)?;
        }

        if let Some(value) = params.ocd_data_register {
            self.set_parameter_u8(parameters::DEVICE_OCD_DATA_REGISTER, value as u8)?;
        }

        if let Some(value) = params.spmcsr_address {
            self.set_parameter_u8(parameters::DEVICE_SPMCR_REGISTER, value as u8)?;
        }

        if let Some(value) = params.boot_section_start {
            self.set_parameter_u32(parameters::DEVICE_BOOT_START_ADDR, value)?;
        }

        // Registers in the mapped I/O segment are addressed relative to
        // the segment base on the wire.
        let mapped_io_start = params.mapped_io_start.unwrap_or(0);

        if let Some(value) = params.osccal_address {
            self.set_parameter_u8(parameters::DEVICE_OSCCAL_ADDR, (value - mapped_io_start) as u8)?;
        }

        if let Some(value) = params.eearl_address {
            self.set_parameter_u8(parameters::DEVICE_EEARL_ADDR, (value - mapped_io_start) as u8)?;
        }

        if let Some(value) = params.eearh_address {
            self.set_parameter_u8(parameters::DEVICE_EEARH_ADDR, (value - mapped_io_start) as u8)?;
        }

        if let Some(value) = params.eecr_address {
            self.set_parameter_u8(parameters::DEVICE_EECR_ADDR, (value - mapped_io_start) as u8)?;
        }

        if let Some(value) = params.eedr_address {
            self.set_parameter_u8(parameters::DEVICE_EEDR_ADDR, (value - mapped_io_start) as u8)?;
        }

        Ok(())
    }

    fn set_pdi_parameters(&mut self) -> Result<(), Error> {
        let params = self.parameters.clone();

        let required = |value: Option<u32>, name: &str| {
            value.ok_or_else(|| Error::DeviceInit(format!("missing required parameter: {name}")))
        };

        let app_offset = required(params.app_section_pdi_offset, "APPL_BASE_ADDR")?;
        let boot_offset = required(params.boot_section_pdi_offset, "BOOT_BASE_ADDR")?;
        let app_size = required(params.app_section_size, "APPLICATION_BYTES")?;
        let boot_size = required(params.boot_section_size, "BOOT_BYTES")?;
        let eeprom_offset = required(params.eeprom_pdi_offset, "EEPROM_BASE_ADDR")?;
        let fuse_offset = required(params.fuse_pdi_offset, "FUSE_BASE_ADDR")?;
        let lock_offset = required(params.lock_pdi_offset, "LOCKBIT_BASE_ADDR")?;
        let user_sig_offset = required(params.user_signature_pdi_offset, "USER_SIGN_BASE_ADDR")?;
        let prod_sig_offset = required(params.product_signature_pdi_offset, "PROD_SIGN_BASE_ADDR")?;
        let data_offset = required(params.ram_pdi_offset, "DATA_BASE_ADDR")?;
        let flash_page_size = required(params.flash_page_size, "FLASH_PAGE_BYTES")?;
        let eeprom_size = required(params.eeprom_size, "EEPROM_SIZE")?;
        let eeprom_page_size = params
            .eeprom_page_size
            .ok_or_else(|| Error::DeviceInit("missing required parameter: EEPROM_PAGE_SIZE".into()))?;
        let nvm_base = required(params.nvm_module_base, "NVM_BASE")?;
        let mcu_base = required(params.mcu_module_base, "SIGNATURE_OFFSET")?;

        self.set_parameter_u32(parameters::DEVICE_XMEGA_APPL_BASE_ADDR, app_offset)?;
        self.set_parameter_u32(parameters::DEVICE_XMEGA_BOOT_BASE_ADDR, boot_offset)?;
        self.set_parameter_u32(parameters::DEVICE_XMEGA_EEPROM_BASE_ADDR, eeprom_offset)?;
        self.set_parameter_u32(parameters::DEVICE_XMEGA_FUSE_BASE_ADDR, fuse_offset)?;
        self.set_parameter_u32(parameters::DEVICE_XMEGA_LOCKBIT_BASE_ADDR, lock_offset)?;
        self.set_parameter_u32(parameters::DEVICE_XMEGA_USER_SIGN_BASE_ADDR, user_sig_offset)?;
        self.set_parameter_u32(parameters::DEVICE_XMEGA_PROD_SIGN_BASE_ADDR, prod_sig_offset)?;
        self.set_parameter_u32(parameters::DEVICE_XMEGA_DATA_BASE_ADDR, data_offset)?;
        self.set_parameter_u32(parameters::DEVICE_XMEGA_APPLICATION_BYTES, app_size)?;
        self.set_parameter_u16(parameters::DEVICE_XMEGA_BOOT_BYTES, boot_size as u16)?;
        self.set_parameter_u16(parameters::DEVICE_XMEGA_FLASH_PAGE_BYTES, flash_page_size as u16)?;
        self.set_parameter_u16(parameters::DEVICE_XMEGA_EEPROM_SIZE, eeprom_size as u16)?;
        self.set_parameter_u8(parameters::DEVICE_XMEGA_EEPROM_PAGE_SIZE, eeprom_page_size)?;
        self.set_parameter_u16(parameters::DEVICE_XMEGA_NVM_BASE, nvm_base as u16)?;
        self.set_parameter_u16(parameters::DEVICE_XMEGA_SIGNATURE_OFFSET, mcu_base as u16)?;

        Ok(())
    }

    fn set_updi_parameters(&mut self) -> Result<(), Error> {
        let params = self.parameters.clone();

        if params.signature_segment_start.is_none() {
            return Err(Error::DeviceInit(
                "missing required parameter: SIGNATURE_BASE_ADDR".into(),
            ));
        }

        let eeprom_page_size = params.eeprom_page_size.ok_or_else(|| {
            Error::DeviceInit("missing required parameter: UPDI_EEPROM_PAGE_SIZE".into())
        })?;

        if let Some(base) = params.program_memory_updi_start {
            // The UPDI program-memory base parameter is only two bytes
            // wide; the third byte travels in a separate MSB parameter.
            self.set_parameter_u16(parameters::DEVICE_UPDI_PROGMEM_BASE_ADDR, base as u16)?;
            self.set_parameter_u8(parameters::DEVICE_UPDI_PROGMEM_BASE_ADDR_MSB, (base >> 16) as u8)?;
        }

        if let Some(page_size) = params.flash_page_size {
            // Same split as the program-memory base.
            self.set_parameter_u8(parameters::DEVICE_UPDI_FLASH_PAGE_SIZE, page_size as u8)?;
            self.set_parameter_u8(
                parameters::DEVICE_UPDI_FLASH_PAGE_SIZE_MSB,
                (page_size >> 8) as u8,
            )?;
        }

        self.set_parameter_u8(parameters::DEVICE_UPDI_EEPROM_PAGE_SIZE, eeprom_page_size)?;

        if let Some(value) = params.nvm_module_base {
            self.set_parameter_u16(parameters::DEVICE_UPDI_NVMCTRL_ADDR, value as u16)?;
        }

        if let Some(value) = params.ocd_module_address {
            self.set_parameter_u16(parameters::DEVICE_UPDI_OCD_ADDR, value as u16)?;
        }

        if let Some(value) = params.flash_size {
            self.set_parameter_u32(parameters::DEVICE_UPDI_FLASH_SIZE, value)?;
        }

        if let Some(value) = params.eeprom_size {
            self.set_parameter_u16(parameters::DEVICE_UPDI_EEPROM_SIZE, value as u16)?;
        }

        if let Some(value) = params.eeprom_start {
            self.set_parameter_u16(parameters::DEVICE_UPDI_EEPROM_BASE_ADDR, value as u16)?;
        }

        if let Some(value) = params.signature_segment_start {
            self.set_parameter_u16(parameters::DEVICE_UPDI_SIG_BASE_ADDR, value as u16)?;
        }

        if let Some(value) = params.fuse_segment_start {
            self.set_parameter_u16(parameters::DEVICE_UPDI_FUSE_BASE_ADDR, value as u16)?;
        }

        if let Some(value) = params.fuse_segment_size {
            self.set_parameter_u16(parameters::DEVICE_UPDI_FUSE_SIZE, value as u16)?;
        }

        if let Some(value) = params.lockbits_segment_start {
            self.set_parameter_u16(parameters::DEVICE_UPDI_LOCK_BASE_ADDR, value as u16)?;
        }

        self.set_parameter_u8(
            parameters::DEVICE_UPDI_24_BIT_ADDRESSING_ENABLE,
            (params.program_memory_updi_start.unwrap_or(0) > 0xFFFF) as u8,
        )?;

        Ok(())
    }

    // --- activation -----------------------------------------------------

    fn activate_physical(&mut self, apply_external_reset: bool) -> Result<(), Error> {
        let response = self
            .session
            .send_avr8(&command::activate_physical(apply_external_reset))?;

        if let Response::Failed(code) = response {
            if !apply_external_reset {
                // Try again with external reset applied
                log::debug!(
                    "Failed to activate physical interface - retrying with external reset applied"
                );
                return self.activate_physical(true);
            }

            if self.config.physical_interface == PhysicalInterface::DebugWire
                && code.indicates_debug_wire_failure()
            {
                return Err(Error::DebugWirePhysical(
                    "check the target connection - if the target was recently programmed via \
                     ISP, the DWEN fuse may need updating"
                        .into(),
                ));
            }

            return Err(Error::protocol(
                "AVR8 activate physical interface command failed",
                Some(code),
            ));
        }

        self.physical_activated = true;
        Ok(())
    }

    fn deactivate_physical(&mut self) -> Result<(), Error> {
        self.session
            .send_avr8(&command::deactivate_physical())?
            .expect_ok("deactivate physical")?;
        self.physical_activated = false;
        Ok(())
    }

    fn attach(&mut self) -> Result<(), Error> {
        // megaAVR JTAG targets time out when the break-after-attach
        // flag is set, but usually halt anyway shortly after attach.
        let break_after_attach = self.variant != ConfigVariant::MegaJtag;

        self.session
            .send_avr8(&command::attach(break_after_attach))?
            .expect_ok("attach")?;
        self.attached = true;

        if let Err(error) = self.wait_for_stopped_event() {
            log::warn!("Execution on the target could not be halted post attach - {error}");
        }

        Ok(())
    }

    fn detach(&mut self) -> Result<(), Error> {
        self.session
            .send_avr8(&command::detach())?
            .expect_ok("detach")?;
        self.attached = false;
        Ok(())
    }

    /// Bring the physical interface up and attach to the OCD module.
    ///
    /// A debugWire activation failure with one of the two fuse-related
    /// codes surfaces as [`Error::DebugWirePhysical`] so the caller can
    /// run the DWEN update procedure and retry.
    pub fn activate(&mut self) -> Result<(), Error> {
        if !self.physical_activated {
            self.activate_physical(false)?;
        }

        if !self.attached {
            self.attach()?;
        }

        Ok(())
    }

    pub fn deactivate(&mut self) -> Result<(), Error> {
        if self.attached {
            if self.config.physical_interface == PhysicalInterface::DebugWire
                && self.config.disable_debug_wire_on_deactivate
            {
                match self.disable_debug_wire() {
                    Ok(()) => log::warn!(
                        "Disabled debugWire on the target - this is temporary - the debugWire \
                         module has relinquished the RESET pin until the next power cycle"
                    ),
                    // Failing to disable debugWire never blocks deactivation.
                    Err(error) => log::error!("Failed to disable debugWire - {error}"),
                }
            }

            self.clear_all_breakpoints()?;
            self.detach()?;
        }

        if self.physical_activated {
            self.deactivate_physical()?;
        }

        Ok(())
    }

    fn disable_debug_wire(&mut self) -> Result<(), Error> {
        self.session
            .send_avr8(&command::disable_debug_wire())?
            .expect_ok("disable debugWire")
    }

    // --- run control ----------------------------------------------------

    pub fn stop(&mut self) -> Result<(), Error> {
        self.session
            .send_avr8(&command::stop())?
            .expect_ok("stop")?;

        if self.target_state == TargetState::Running {
            self.target_state = TargetState::Stopping;
            self.wait_for_stopped_event()?;
        }

        self.target_state = TargetState::Stopped;
        Ok(())
    }

    pub fn run(&mut self) -> Result<(), Error> {
        self.clear_events()?;
        self.session.send_avr8(&command::run())?.expect_ok("run")?;
        self.target_state = TargetState::Running;
        Ok(())
    }

    pub fn run_to(&mut self, byte_address: MemoryAddress) -> Result<(), Error> {
        self.clear_events()?;
        self.session
            .send_avr8(&command::run_to(byte_address / 2))?
            .expect_ok("run-to")?;
        self.target_state = TargetState::Running;
        Ok(())
    }

    pub fn step(&mut self) -> Result<(), Error> {
        self.clear_events()?;
        self.session
            .send_avr8(&command::step())?
            .expect_ok("step")?;
        self.target_state = TargetState::Running;
        Ok(())
    }

    pub fn reset(&mut self) -> Result<(), Error> {
        self.session
            .send_avr8(&command::reset())?
            .expect_ok("reset")?;

        self.wait_for_stopped_event()
            .map_err(|_| Error::DeviceInit("missing stopped event after target reset".into()))?;

        // EDBG tools reject commands issued too quickly after a reset,
        // even after the break event has arrived.
        thread::sleep(POST_RESET_DELAY);
        Ok(())
    }

    // --- program counter ------------------------------------------------

    /// Read the program counter, as a byte address.
    pub fn get_program_counter(&mut self) -> Result<MemoryAddress, Error> {
        if self.target_state != TargetState::Stopped {
            self.stop()?;
        }

        let response = self.session.send_avr8(&command::pc_read())?;
        match response {
            // The EDBG protocol works in word addresses.
            Response::Pc(word_address) => Ok(word_address * 2),
            Response::Failed(code) => Err(Error::protocol("AVR8 read PC command failed", Some(code))),
            other => Err(Error::protocol(
                format!("unexpected response to AVR8 read PC command: {other:?}"),
                None,
            )),
        }
    }

    /// Write the program counter. Takes a byte address.
    pub fn set_program_counter(&mut self, byte_address: MemoryAddress) -> Result<(), Error> {
        if self.target_state != TargetState::Stopped {
            self.stop()?;
        }

        self.session
            .send_avr8(&command::pc_write(byte_address / 2))?
            .expect_ok("write PC")
    }

    // --- device id ------------------------------------------------------

    pub fn get_device_id(&mut self) -> Result<Signature, Error> {
        if self.variant == ConfigVariant::Updi {
            // The UPDI 'get device ID' command returns a fixed "AVR "
            // string instead of the signature, so read the signature
            // bytes from the signature segment instead.
            let base = self.parameters.signature_segment_start.ok_or_else(|| {
                Error::DeviceInit("missing signature segment start address".into())
            })?;

            let data = self.read_memory_raw(Memtype::Sram, base, 3, &BTreeSet::new())?;
            return Ok(Signature([data[0], data[1], data[2]]));
        }

        let data = self
            .session
            .send_avr8(&command::get_device_id())?
            .expect_data("get device ID")?;
        let id = data
            .pread_with::<u32>(0, LE)
            .map_err(|_| Error::protocol("truncated device ID response", None))?;

        Ok(Signature([
            ((id >> 16) & 0xff) as u8,
            ((id >> 8) & 0xff) as u8,
            (id & 0xff) as u8,
        ]))
    }

    // --- registers ------------------------------------------------------

    /// Read a block of register storage.
    ///
    /// General-purpose registers live in the register file on XMEGA and
    /// UPDI targets; everything else is read through the data space.
    /// SRAM reads exclude the OCD data register - the probe rejects
    /// plain reads that touch it with an invalid-address error, so its
    /// presence forces the masked-read path.
    pub fn read_register_memory(
        &mut self,
        general_purpose: bool,
        address: MemoryAddress,
        bytes: MemorySize,
    ) -> Result<Vec<u8>, Error> {
        let memtype = if general_purpose
            && matches!(self.variant, ConfigVariant::Xmega | ConfigVariant::Updi)
        {
            Memtype::Regfile
        } else {
            Memtype::Sram
        };

        let mut excluded = BTreeSet::new();
        if memtype == Memtype::Sram {
            if let Some(ocd_data_register) = self.parameters.ocd_data_register {
                excluded
                    .insert(ocd_data_register + self.parameters.mapped_io_start.unwrap_or(0));
            }
        }

        self.read_memory_raw(memtype, address, bytes, &excluded)
    }

    /// Write one register's storage. `value` must already be LSB-first.
    pub fn write_register_memory(
        &mut self,
        general_purpose: bool,
        address: MemoryAddress,
        value: &[u8],
    ) -> Result<(), Error> {
        let memtype = if general_purpose
            && matches!(self.variant, ConfigVariant::Xmega | ConfigVariant::Updi)
        {
            Memtype::Regfile
        } else {
            Memtype::Sram
        };

        self.write_memory_raw(memtype, address, value)
    }

    // --- breakpoints ----------------------------------------------------

    pub fn set_software_breakpoint(&mut self, address: MemoryAddress) -> Result<(), Error> {
        self.session
            .send_avr8(&command::set_software_breakpoints(&[address]))?
            .expect_ok("set software breakpoint")
    }

    pub fn clear_software_breakpoint(&mut self, address: MemoryAddress) -> Result<(), Error> {
        self.session
            .send_avr8(&command::clear_software_breakpoints(&[address]))?
            .expect_ok("clear software breakpoint")
    }

    pub fn set_hardware_breakpoint(&mut self, address: MemoryAddress) -> Result<(), Error> {
        self.session
            .send_avr8(&command::set_hardware_breakpoints(&[address]))?
            .expect_ok("set hardware breakpoint")
    }

    pub fn clear_hardware_breakpoint(&mut self, address: MemoryAddress) -> Result<(), Error> {
        self.session
            .send_avr8(&command::clear_hardware_breakpoints(&[address]))?
            .expect_ok("clear hardware breakpoint")
    }

    pub fn clear_all_breakpoints(&mut self) -> Result<(), Error> {
        self.session
            .send_avr8(&command::clear_all_software_breakpoints())?
            .expect_ok("clear all software breakpoints")
    }

    // --- programming mode -----------------------------------------------

    pub fn enable_programming_mode(&mut self) -> Result<(), Error> {
        if self.programming_mode {
            return Ok(());
        }

        self.session
            .send_avr8(&command::enter_programming_mode())?
            .expect_ok("enter programming mode")?;
        self.programming_mode = true;
        Ok(())
    }

    pub fn disable_programming_mode(&mut self) -> Result<(), Error> {
        if !self.programming_mode {
            return Ok(());
        }

        self.session
            .send_avr8(&command::leave_programming_mode())?
            .expect_ok("leave programming mode")?;
        self.programming_mode = false;

        if self.variant == ConfigVariant::MegaJtag && self.reactivate_jtag_post_programming {
            self.deactivate_physical()?;
            self.attached = false;
            self.activate()?;
        }

        Ok(())
    }

    // --- events and state -----------------------------------------------

    fn clear_events(&mut self) -> Result<(), Error> {
        while self.session.poll_avr_event()?.is_some() {}
        Ok(())
    }

    fn wait_for_stopped_event(&mut self) -> Result<(), Error> {
        let deadline = Instant::now() + STOP_EVENT_TIMEOUT;

        loop {
            if let Some(Event::Break { .. }) = self.session.poll_avr_event()? {
                self.target_state = TargetState::Stopped;
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(Error::Timeout("a break event from the target"));
            }

            thread::sleep(Duration::from_millis(10));
        }
    }

    /// Current target state.
    ///
    /// A stopped target cannot resume without an explicit command from
    /// this interface, so the probe is only queried while we believe the
    /// target is running.
    pub fn get_target_state(&mut self) -> Result<TargetState, Error> {
        if self.target_state != TargetState::Stopped {
            if let Some(Event::Break { .. }) = self.session.poll_avr_event()? {
                self.target_state = TargetState::Stopped;
            } else if self.target_state == TargetState::Unknown {
                self.target_state = TargetState::Running;
            }
        }

        Ok(self.target_state)
    }

    // --- memory ---------------------------------------------------------

    /// Map a generic memory type onto the wire memory type, rebasing
    /// the address where the wire type is section-relative.
    fn translate_memory(
        &self,
        memory_type: MemoryType,
        address: MemoryAddress,
        writing: bool,
    ) -> Result<(Memtype, MemoryAddress), Error> {
        match memory_type {
            MemoryType::Ram => Ok((Memtype::Sram, address)),
            MemoryType::Flash => match self.variant {
                ConfigVariant::DebugWire | ConfigVariant::Updi => Ok((Memtype::FlashPage, address)),
                ConfigVariant::MegaJtag => {
                    if writing || self.programming_mode {
                        Ok((Memtype::FlashPage, address))
                    } else {
                        Ok((Memtype::Spm, address))
                    }
                }
                ConfigVariant::Xmega => {
                    let boot_start = self.parameters.boot_section_start.ok_or_else(|| {
                        Error::DeviceInit("missing boot section start address".into())
                    })?;

                    if address >= boot_start {
                        // Boot-section accesses are relative to the boot
                        // section base.
                        Ok((Memtype::BootFlash, address - boot_start))
                    } else {
                        let app_start = self.parameters.app_section_start.unwrap_or(0);
                        Ok((Memtype::ApplFlash, address - app_start))
                    }
                }
                ConfigVariant::None => Err(Error::DeviceInit(
                    "no configuration variant resolved".into(),
                )),
            },
            MemoryType::Eeprom => {
                let memtype = match self.variant {
                    ConfigVariant::Updi | ConfigVariant::Xmega if writing => Memtype::EepromAtomic,
                    ConfigVariant::MegaJtag if self.programming_mode => Memtype::EepromPage,
                    _ => Memtype::Eeprom,
                };

                if self.variant == ConfigVariant::Xmega {
                    // XMEGA EEPROM accesses are relative to the EEPROM
                    // segment base.
                    let eeprom_start = self.parameters.eeprom_start.unwrap_or(0);
                    Ok((memtype, address - eeprom_start))
                } else {
                    Ok((memtype, address))
                }
            }
            MemoryType::Fuses => {
                if self.variant == ConfigVariant::DebugWire {
                    Err(Error::InvalidArgument(
                        "fuses are not accessible via the debugWire interface".into(),
                    ))
                } else {
                    Ok((Memtype::Fuses, address))
                }
            }
            MemoryType::Other => Err(Error::InvalidArgument(
                "unsupported memory type".into(),
            )),
        }
    }

    fn alignment(&self, memtype: Memtype) -> Option<MemorySize> {
        match memtype {
            Memtype::FlashPage | Memtype::Spm | Memtype::ApplFlash | Memtype::BootFlash => {
                self.parameters.flash_page_size
            }
            Memtype::EepromAtomic | Memtype::EepromPage => {
                self.parameters.eeprom_page_size.map(MemorySize::from)
            }
            _ => None,
        }
    }

    fn align_address(&self, memtype: Memtype, address: MemoryAddress) -> MemoryAddress {
        match self.alignment(memtype) {
            Some(alignment) if alignment > 1 => address - (address % alignment),
            _ => address,
        }
    }

    fn align_bytes(&self, memtype: Memtype, bytes: MemorySize) -> MemorySize {
        match self.alignment(memtype) {
            Some(alignment) if alignment > 1 => bytes.div_ceil(alignment) * alignment,
            _ => bytes,
        }
    }

    /// The largest single read/write the probe will take for a memory
    /// type.
    fn max_access_size(&self, memtype: Memtype) -> MemorySize {
        match memtype {
            Memtype::FlashPage | Memtype::ApplFlash | Memtype::BootFlash => {
                self.parameters.flash_page_size.unwrap_or(256)
            }
            Memtype::Spm if self.variant == ConfigVariant::MegaJtag => {
                self.parameters.flash_page_size.unwrap_or(256)
            }
            Memtype::EepromAtomic | Memtype::EepromPage => {
                MemorySize::from(self.parameters.eeprom_page_size.unwrap_or(4))
            }
            _ => {
                // EDBG tools corrupt data when a single access spans
                // more than two report packets in either direction.
                ((self.session.report_size() - MEMORY_COMMAND_OVERHEAD) * 2) as MemorySize
            }
        }
    }

    /// Read target memory with generic addressing.
    pub fn read_memory(
        &mut self,
        memory_type: MemoryType,
        address: MemoryAddress,
        bytes: MemorySize,
        excluded_ranges: &[AddressRange],
    ) -> Result<Vec<u8>, Error> {
        if self.programming_mode && memory_type == MemoryType::Ram {
            return Err(Error::Precondition(
                "cannot access RAM while programming mode is enabled".into(),
            ));
        }

        if bytes == 0 {
            return Ok(Vec::new());
        }

        let (memtype, address) = self.translate_memory(memory_type, address, false)?;

        let end = address + bytes - 1;
        let mut excluded: BTreeSet<MemoryAddress> = excluded_ranges
            .iter()
            .filter(|range| range.start <= end && range.end >= address)
            .flat_map(|range| range.start.max(address)..=range.end.min(end))
            .collect();

        // SRAM reads always carry the OCD data register as an excluded
        // address. The probe excludes it on its own, but only the
        // masked-read command tolerates the address at all, so passing
        // it forces that path.
        if memtype == Memtype::Sram {
            if let Some(ocd_data_register) = self.parameters.ocd_data_register {
                excluded.insert(
                    ocd_data_register + self.parameters.mapped_io_start.unwrap_or(0),
                );
            }
        }

        self.read_memory_raw(memtype, address, bytes, &excluded)
    }

    fn read_memory_raw(
        &mut self,
        memtype: Memtype,
        address: MemoryAddress,
        bytes: MemorySize,
        excluded: &BTreeSet<MemoryAddress>,
    ) -> Result<Vec<u8>, Error> {
        if !excluded.is_empty() && (self.avoid_masked_read || memtype != Memtype::Sram) {
            // Driver-side masked read: split into plain reads around
            // each excluded address, filling excluded bytes with 0x00.
            let mut output = Vec::with_capacity(bytes as usize);
            let end = address + bytes - 1;
            let mut segment_start = address;

            for &excluded_address in excluded {
                if excluded_address < address || excluded_address > end {
                    continue;
                }

                let segment_len = excluded_address - segment_start;
                if segment_len > 0 {
                    output.extend(self.read_memory_raw(
                        memtype,
                        segment_start,
                        segment_len,
                        &BTreeSet::new(),
                    )?);
                }

                output.push(0x00);
                segment_start = excluded_address + 1;
            }

            if segment_start <= end {
                output.extend(self.read_memory_raw(
                    memtype,
                    segment_start,
                    end - segment_start + 1,
                    &BTreeSet::new(),
                )?);
            }

            return Ok(output);
        }

        let aligned_address = self.align_address(memtype, address);
        let aligned_bytes = self.align_bytes(memtype, bytes + (address - aligned_address));

        if aligned_address != address || aligned_bytes != bytes {
            let buffer = self.read_memory_raw(memtype, aligned_address, aligned_bytes, excluded)?;
            let offset = (address - aligned_address) as usize;
            return Ok(buffer[offset..offset + bytes as usize].to_vec());
        }

        let max = self.max_access_size(memtype);
        if bytes > max {
            let mut output = Vec::with_capacity(bytes as usize);

            while (output.len() as MemorySize) < bytes {
                let chunk = (bytes - output.len() as MemorySize).min(max);
                let chunk_excluded: BTreeSet<MemoryAddress> = excluded
                    .iter()
                    .copied()
                    .filter(|&a| {
                        a >= address + output.len() as MemorySize
                            && a < address + output.len() as MemorySize + chunk
                    })
                    .collect();
                output.extend(self.read_memory_raw(
                    memtype,
                    address + output.len() as MemorySize,
                    chunk,
                    &chunk_excluded,
                )?);
            }

            return Ok(output);
        }

        let frame = if excluded.is_empty() {
            command::read_memory(memtype, address, bytes)
        } else {
            let mask: Vec<u8> = (address..address + bytes)
                .map(|a| !excluded.contains(&a) as u8)
                .collect();
            command::read_memory_masked(memtype, address, &mask)
        };

        let data = self.session.send_avr8(&frame)?.expect_data("read memory")?;

        if data.len() != bytes as usize {
            return Err(Error::protocol(
                format!(
                    "unexpected number of bytes returned from probe: expected {bytes}, got {}",
                    data.len()
                ),
                None,
            ));
        }

        Ok(data)
    }

    /// Write target memory with generic addressing.
    pub fn write_memory(
        &mut self,
        memory_type: MemoryType,
        address: MemoryAddress,
        buffer: &[u8],
    ) -> Result<(), Error> {
        if self.programming_mode && memory_type == MemoryType::Ram {
            return Err(Error::Precondition(
                "cannot access RAM while programming mode is enabled".into(),
            ));
        }

        let (memtype, address) = self.translate_memory(memory_type, address, true)?;
        self.write_memory_raw(memtype, address, buffer)
    }

    fn write_memory_raw(
        &mut self,
        memtype: Memtype,
        address: MemoryAddress,
        buffer: &[u8],
    ) -> Result<(), Error> {
        let bytes = buffer.len() as MemorySize;

        let aligned_address = self.align_address(memtype, address);
        let aligned_bytes = self.align_bytes(memtype, bytes + (address - aligned_address));

        if aligned_address != address || aligned_bytes != bytes {
            // Widen to the page boundaries: read the surrounding data,
            // overlay the new bytes, write the whole aligned range.
            // EEPROM_ATOMIC is write-only, so the merge read goes
            // through the plain EEPROM type.
            let read_memtype = if memtype == Memtype::EepromAtomic {
                Memtype::Eeprom
            } else {
                memtype
            };

            let mut aligned_buffer =
                self.read_memory_raw(read_memtype, aligned_address, aligned_bytes, &BTreeSet::new())?;

            let offset = (address - aligned_address) as usize;
            aligned_buffer[offset..offset + buffer.len()].copy_from_slice(buffer);

            return self.write_memory_raw(memtype, aligned_address, &aligned_buffer);
        }

        let max = self.max_access_size(memtype);
        if bytes > max {
            let mut written = 0;

            while written < bytes {
                let chunk = (bytes - written).min(max) as usize;
                self.write_memory_raw(
                    memtype,
                    address + written,
                    &buffer[written as usize..written as usize + chunk],
                )?;
                written += chunk as MemorySize;
            }

            return Ok(());
        }

        self.session
            .send_avr8(&command::write_memory(memtype, address, buffer))?
            .expect_ok("write memory")
    }

    // --- erase ----------------------------------------------------------

    pub fn erase_program_memory(
        &mut self,
        section: Option<ProgramMemorySection>,
    ) -> Result<(), Error> {
        if self.variant == ConfigVariant::DebugWire {
            // The EDBG erase command does not work over debugWire -
            // write an erased pattern over the whole flash range
            // instead.
            let start = self
                .parameters
                .flash_start
                .ok_or_else(|| Error::DeviceInit("missing flash start address".into()))?;
            let size = self
                .parameters
                .flash_size
                .ok_or_else(|| Error::DeviceInit("missing flash size".into()))?;

            return self.write_memory(MemoryType::Flash, start, &vec![0xFF; size as usize]);
        }

        if self.variant == ConfigVariant::Xmega {
            // PDI targets can erase flash without touching EEPROM.
            if section.is_none() || section == Some(ProgramMemorySection::Boot) {
                self.session
                    .send_avr8(&command::erase(avr8::EraseMode::Boot, 0))?
                    .expect_ok("erase boot section")?;
            }

            if section.is_none() || section == Some(ProgramMemorySection::Application) {
                self.session
                    .send_avr8(&command::erase(avr8::EraseMode::Application, 0))?
                    .expect_ok("erase application section")?;
            }

            return Ok(());
        }

        // JTAG and UPDI targets only support a whole-chip erase, which
        // takes EEPROM with it.
        let eeprom_snapshot = if self.config.preserve_eeprom {
            log::debug!("Capturing EEPROM contents ahead of chip erase");
            let start = self
                .parameters
                .eeprom_start
                .ok_or_else(|| Error::DeviceInit("missing EEPROM start address".into()))?;
            let size = self
                .parameters
                .eeprom_size
                .ok_or_else(|| Error::DeviceInit("missing EEPROM size".into()))?;

            Some((start, self.read_memory(MemoryType::Eeprom, start, size, &[])?))
        } else {
            log::warn!("EEPROM will be erased along with program memory");
            None
        };

        self.session
            .send_avr8(&command::erase(avr8::EraseMode::Chip, 0))?
            .expect_ok("chip erase")?;

        if let Some((start, snapshot)) = eeprom_snapshot {
            log::debug!("Restoring EEPROM contents");
            self.write_memory(MemoryType::Eeprom, start, &snapshot)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_table_matches_specification() {
        use ConfigVariant::*;
        use PhysicalInterface::*;

        let cases = [
            (Some(Family::Mega), Jtag, Some(MegaJtag)),
            (Some(Family::Mega), PhysicalInterface::DebugWire, Some(ConfigVariant::DebugWire)),
            (Some(Family::Mega), PhysicalInterface::Updi, Some(ConfigVariant::Updi)),
            (Some(Family::Tiny), Jtag, Some(MegaJtag)),
            (Some(Family::Tiny), PhysicalInterface::DebugWire, Some(ConfigVariant::DebugWire)),
            (Some(Family::Tiny), PhysicalInterface::Updi, Some(ConfigVariant::Updi)),
            (Some(Family::Xmega), Jtag, Some(Xmega)),
            (Some(Family::Xmega), Pdi, Some(Xmega)),
            (Some(Family::Da), PhysicalInterface::Updi, Some(ConfigVariant::Updi)),
            (Some(Family::Db), PhysicalInterface::Updi, Some(ConfigVariant::Updi)),
            (Some(Family::Dd), PhysicalInterface::Updi, Some(ConfigVariant::Updi)),
            (Some(Family::Ea), PhysicalInterface::Updi, Some(ConfigVariant::Updi)),
        ];

        for (family, interface, expected) in cases {
            assert_eq!(
                resolve_config_variant(family, interface),
                expected,
                "({family:?}, {interface:?})"
            );
        }
    }

    #[test]
    fn variant_resolution_outside_table_is_none() {
        assert_eq!(
            resolve_config_variant(Some(Family::Xmega), PhysicalInterface::DebugWire),
            None
        );
        assert_eq!(
            resolve_config_variant(Some(Family::Da), PhysicalInterface::Jtag),
            None
        );
        assert_eq!(
            resolve_config_variant(Some(Family::Mega), PhysicalInterface::Isp),
            None
        );
    }

    #[test]
    fn ambiguous_jtag_is_rejected_without_family() {
        assert_eq!(resolve_config_variant(None, PhysicalInterface::Jtag), None);
        assert_eq!(
            resolve_config_variant(None, PhysicalInterface::DebugWire),
            Some(ConfigVariant::DebugWire)
        );
        assert_eq!(
            resolve_config_variant(None, PhysicalInterface::Pdi),
            Some(ConfigVariant::Xmega)
        );
        assert_eq!(
            resolve_config_variant(None, PhysicalInterface::Updi),
            Some(ConfigVariant::Updi)
        );
    }
}
