//! AVR8-generic command, response and event codec.
//!
//! Frame layout (inside the EDBG envelope): one command id byte, one
//! version byte (always zero), then the command-specific payload.
//! Responses start with a response id byte and a version byte.

use enum_primitive_derive::Primitive;
use num_traits::FromPrimitive;
use scroll::{Pread, Pwrite, LE};

use crate::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Primitive)]
pub enum SubProtocol {
    Discovery = 0x00,
    Housekeeping = 0x01,
    AvrIsp = 0x11,
    Avr8Generic = 0x12,
    Avr32Generic = 0x13,
    Tpi = 0x14,
    EdbgCtrl = 0x20,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandId {
    Query = 0x00,              // Capability discovery
    Set = 0x01,                // Set parameters
    Get = 0x02,                // Get parameters
    ActivatePhysical = 0x10,   // Connect physically
    DeactivatePhysical = 0x11, // Disconnect physically
    GetId = 0x12,              // Read the device ID
    Attach = 0x13,             // Attach to OCD module
    Detach = 0x14,             // Detach from OCD module
    ProgModeEnter = 0x15,      // Enter programming mode
    ProgModeLeave = 0x16,      // Leave programming mode
    DisableDebugWire = 0x17,   // Disable the debugWire interface
    Erase = 0x20,              // Erase the chip or a section
    MemoryRead = 0x21,         // Read memory
    MemoryReadMasked = 0x22,   // Read memory through a mask
    MemoryWrite = 0x23,        // Write memory
    Reset = 0x30,              // Reset the MCU
    Stop = 0x31,               // Stop the MCU
    Run = 0x32,                // Resume execution
    RunTo = 0x33,              // Resume with a hardware breakpoint
    Step = 0x34,               // Single step
    PcRead = 0x35,             // Read PC
    PcWrite = 0x36,            // Write PC
    HwBreakSet = 0x40,         // Set hardware breakpoints
    HwBreakClear = 0x41,       // Clear hardware breakpoints
    SwBreakSet = 0x43,         // Set software breakpoints
    SwBreakClear = 0x44,       // Clear software breakpoints
    SwBreakClearAll = 0x45,    // Clear all software breakpoints
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Primitive)]
pub enum ResponseId {
    Ok = 0x80,     // All OK
    List = 0x81,   // List of items returned
    Pc = 0x83,     // PC value returned
    Data = 0x84,   // Data returned
    Failed = 0xA0, // Command failed to execute
}

/// Failure codes carried by a FAILED response.
#[allow(dead_code)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Primitive)]
pub enum FailureCode {
    Ok = 0x00,                   // All OK
    DwPhyError = 0x10,           // debugWire physical error
    JtagmInitError = 0x11,       // JTAGM failed to initialise
    JtagmError = 0x12,           // JTAGM did something strange
    JtagError = 0x13,            // JTAG low level error
    JtagmVersion = 0x14,         // Unsupported version of JTAGM
    JtagmTimeout = 0x15,         // JTAG master timed out
    JtagBitBangerTimeout = 0x16, // JTAG bit banger timed out
    ParityError = 0x17,          // Parity error in received data
    EbError = 0x18,              // Did not receive EMPTY byte
    PdiTimeout = 0x19,           // PDI physical timed out
    Collision = 0x1A,            // Collision on physical level
    PdiEnable = 0x1B,            // PDI enable failed
    NoDeviceFound = 0x20,        // No device found
    ClockError = 0x21,           // Failure when increasing baud
    NoTargetPower = 0x22,        // Target power not detected
    NotAttached = 0x23,          // Must run attach command first
    DaisyChainTooLong = 0x24,    // Devices > 31
    DaisyChainConfig = 0x25,     // Configured device bits do not add up
    InvalidPhysicalState = 0x31, // Physical not activated
    IllegalState = 0x32,         // Illegal run / stopped state
    InvalidConfig = 0x33,        // Invalid config for activate phy
    InvalidMemtype = 0x34,       // Not a valid memtype
    InvalidSize = 0x35,          // Too many or too few bytes
    InvalidAddress = 0x36,       // Asked for a bad address
    InvalidAlignment = 0x37,     // Asked for badly aligned data
    IllegalMemoryRange = 0x38,   // Address not within legal range
    IllegalValue = 0x39,         // Illegal value given
    IllegalId = 0x3A,            // Illegal target ID
    InvalidClockSpeed = 0x3B,    // Clock value out of range
    Timeout = 0x3C,              // A timeout occurred
    IllegalOcdStatus = 0x3D,     // Read an illegal OCD status
    NvmEnable = 0x40,            // NVM failed to be enabled
    NvmDisable = 0x41,           // NVM failed to be disabled
    CsError = 0x42,              // Illegal control/status bits
    CrcFailure = 0x43,           // CRC mismatch
    OcdLocked = 0x44,            // Failed to enable OCD
    NoOcdControl = 0x50,         // Device is not under control
    PcReadFailed = 0x60,         // Error when reading PC
    RegisterReadFailed = 0x61,   // Error when reading register
    ReadError = 0x70,            // Error while reading
    WriteError = 0x71,           // Error while writing
    WriteTimeout = 0x72,         // Timeout while writing
    IllegalBreakpoint = 0x80,    // Invalid breakpoint configuration
    TooManyBreakpoints = 0x81,   // Not enough available resources
    NotSupported = 0x90,         // This feature is not available
    NotImplemented = 0x91,       // Command has not been implemented
    Unknown = 0xFF,              // Disaster
}

impl FailureCode {
    /// The two activation failures that justify DWEN fuse management
    /// on a debugWire target.
    pub fn indicates_debug_wire_failure(self) -> bool {
        matches!(self, FailureCode::DwPhyError | FailureCode::OcdLocked)
    }
}

/// Memory type identifiers on the AVR8-generic wire.
#[allow(dead_code)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Primitive)]
pub enum Memtype {
    Sram = 0x20,         // SRAM
    Eeprom = 0x22,       // EEPROM, byte access
    Spm = 0xA0,          // Flash via SPM, debug sessions on megaAVR JTAG
    FlashPage = 0xB0,    // Flash, page access
    EepromPage = 0xB1,   // EEPROM, page access
    Fuses = 0xB2,        // Fuse bytes
    Lockbits = 0xB3,     // Lock bits
    Signature = 0xB4,    // Device signature
    Osccal = 0xB5,       // Oscillator calibration
    Regfile = 0xB8,      // Register file
    ApplFlash = 0xC0,    // Application section flash
    BootFlash = 0xC1,    // Boot section flash
    EepromAtomic = 0xC4, // EEPROM page with auto-erase (write only)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EraseMode {
    Chip = 0x00,
    Application = 0x01,
    Boot = 0x02,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Context {
    Config = 0x00,
    Physical = 0x01,
    Device = 0x02,
    Options = 0x03,
    Session = 0x04,
}

/// An EDBG parameter slot: a set/get context plus an id within it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Parameter {
    pub context: Context,
    pub id: u8,
}

impl Parameter {
    const fn new(context: Context, id: u8) -> Self {
        Self { context, id }
    }
}

pub mod parameters {
    //! The parameter slots pushed during interface initialisation.

    use super::{Context, Parameter};

    pub const CONFIG_VARIANT: Parameter = Parameter::new(Context::Config, 0x00);
    pub const CONFIG_FUNCTION: Parameter = Parameter::new(Context::Config, 0x01);

    pub const PHYSICAL_INTERFACE: Parameter = Parameter::new(Context::Physical, 0x00);
    pub const JTAG_DAISY_CHAIN_SETTINGS: Parameter = Parameter::new(Context::Physical, 0x01);
    pub const MEGA_DEBUG_CLOCK: Parameter = Parameter::new(Context::Physical, 0x21);
    pub const PDI_CLOCK_SPEED: Parameter = Parameter::new(Context::Physical, 0x31);

    pub const ENABLE_HIGH_VOLTAGE_UPDI: Parameter = Parameter::new(Context::Options, 0x06);

    // Device context: debugWire and megaAVR JTAG
    pub const DEVICE_FLASH_PAGE_SIZE: Parameter = Parameter::new(Context::Device, 0x00);
    pub const DEVICE_FLASH_SIZE: Parameter = Parameter::new(Context::Device, 0x02);
    pub const DEVICE_FLASH_BASE: Parameter = Parameter::new(Context::Device, 0x06);
    pub const DEVICE_BOOT_START_ADDR: Parameter = Parameter::new(Context::Device, 0x0A);
    pub const DEVICE_SRAM_START: Parameter = Parameter::new(Context::Device, 0x0E);
    pub const DEVICE_EEPROM_SIZE: Parameter = Parameter::new(Context::Device, 0x10);
    pub const DEVICE_EEPROM_PAGE_SIZE: Parameter = Parameter::new(Context::Device, 0x12);
    pub const DEVICE_OCD_REVISION: Parameter = Parameter::new(Context::Device, 0x13);
    pub const DEVICE_OCD_DATA_REGISTER: Parameter = Parameter::new(Context::Device, 0x18);
    pub const DEVICE_EEARL_ADDR: Parameter = Parameter::new(Context::Device, 0x19);
    pub const DEVICE_EEARH_ADDR: Parameter = Parameter::new(Context::Device, 0x1A);
    pub const DEVICE_EECR_ADDR: Parameter = Parameter::new(Context::Device, 0x1B);
    pub const DEVICE_EEDR_ADDR: Parameter = Parameter::new(Context::Device, 0x1C);
    pub const DEVICE_SPMCR_REGISTER: Parameter = Parameter::new(Context::Device, 0x1D);
    pub const DEVICE_OSCCAL_ADDR: Parameter = Parameter::new(Context::Device, 0x1E);

    // Device context: XMEGA (PDI)
    pub const DEVICE_XMEGA_APPL_BASE_ADDR: Parameter = Parameter::new(Context::Device, 0x20);
    pub const DEVICE_XMEGA_BOOT_BASE_ADDR: Parameter = Parameter::new(Context::Device, 0x24);
    pub const DEVICE_XMEGA_EEPROM_BASE_ADDR: Parameter = Parameter::new(Context::Device, 0x28);
    pub const DEVICE_XMEGA_FUSE_BASE_ADDR: Parameter = Parameter::new(Context::Device, 0x2C);
    pub const DEVICE_XMEGA_LOCKBIT_BASE_ADDR: Parameter = Parameter::new(Context::Device, 0x30);
    pub const DEVICE_XMEGA_USER_SIGN_BASE_ADDR: Parameter = Parameter::new(Context::Device, 0x34);
    pub const DEVICE_XMEGA_PROD_SIGN_BASE_ADDR: Parameter = Parameter::new(Context::Device, 0x38);
    pub const DEVICE_XMEGA_DATA_BASE_ADDR: Parameter = Parameter::new(Context::Device, 0x3C);
    pub const DEVICE_XMEGA_APPLICATION_BYTES: Parameter = Parameter::new(Context::Device, 0x40);
    pub const DEVICE_XMEGA_BOOT_BYTES: Parameter = Parameter::new(Context::Device, 0x44);
    pub const DEVICE_XMEGA_NVM_BASE: Parameter = Parameter::new(Context::Device, 0x46);
    pub const DEVICE_XMEGA_SIGNATURE_OFFSET: Parameter = Parameter::new(Context::Device, 0x48);
    pub const DEVICE_XMEGA_FLASH_PAGE_BYTES: Parameter = Parameter::new(Context::Device, 0x4A);
    pub const DEVICE_XMEGA_EEPROM_SIZE: Parameter = Parameter::new(Context::Device, 0x4C);
    pub const DEVICE_XMEGA_EEPROM_PAGE_SIZE: Parameter = Parameter::new(Context::Device, 0x4E);

    // Device context: UPDI
    pub const DEVICE_UPDI_PROGMEM_BASE_ADDR: Parameter = Parameter::new(Context::Device, 0x50);
    pub const DEVICE_UPDI_FLASH_PAGE_SIZE: Parameter = Parameter::new(Context::Device, 0x52);
    pub const DEVICE_UPDI_EEPROM_PAGE_SIZE: Parameter = Parameter::new(Context::Device, 0x53);
    pub const DEVICE_UPDI_NVMCTRL_ADDR: Parameter = Parameter::new(Context::Device, 0x54);
    pub const DEVICE_UPDI_OCD_ADDR: Parameter = Parameter::new(Context::Device, 0x56);
    pub const DEVICE_UPDI_FLASH_SIZE: Parameter = Parameter::new(Context::Device, 0x58);
    pub const DEVICE_UPDI_EEPROM_SIZE: Parameter = Parameter::new(Context::Device, 0x5C);
    pub const DEVICE_UPDI_EEPROM_BASE_ADDR: Parameter = Parameter::new(Context::Device, 0x5E);
    pub const DEVICE_UPDI_SIG_BASE_ADDR: Parameter = Parameter::new(Context::Device, 0x60);
    pub const DEVICE_UPDI_FUSE_BASE_ADDR: Parameter = Parameter::new(Context::Device, 0x62);
    pub const DEVICE_UPDI_FUSE_SIZE: Parameter = Parameter::new(Context::Device, 0x64);
    pub const DEVICE_UPDI_LOCK_BASE_ADDR: Parameter = Parameter::new(Context::Device, 0x66);
    pub const DEVICE_UPDI_PROGMEM_BASE_ADDR_MSB: Parameter = Parameter::new(Context::Device, 0x68);
    pub const DEVICE_UPDI_FLASH_PAGE_SIZE_MSB: Parameter = Parameter::new(Context::Device, 0x69);
    pub const DEVICE_UPDI_24_BIT_ADDRESSING_ENABLE: Parameter =
        Parameter::new(Context::Device, 0x6A);
}

/// CONFIG_VARIANT values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VariantValue {
    Loopback = 0x00,  // Dummy device
    DebugWire = 0x01, // tinyAVR or megaAVR with debugWire
    MegaJtag = 0x02,  // megaAVR with JTAG
    Xmega = 0x03,     // AVR XMEGA
    Updi = 0x05,      // AVR devices with UPDI
    None = 0xFF,      // No device
}

/// CONFIG_FUNCTION values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FunctionValue {
    None = 0x00,
    Programming = 0x01,
    Debugging = 0x02,
}

/// PHYSICAL_INTERFACE values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhysicalInterfaceId {
    None = 0x00,
    Jtag = 0x04,
    DebugWire = 0x05,
    Pdi = 0x06,
    Updi = 0x08,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Primitive)]
pub enum EventId {
    Break = 0x40,
    Idr = 0x41,
}

/// A decoded asynchronous AVR event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// The target has stopped. Carries the program counter as a word
    /// address and the break cause.
    Break { pc: u32, cause: u8 },
    /// An event we do not decode.
    Other { id: u8 },
}

/// A decoded AVR8-generic response frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Ok,
    List(Vec<u8>),
    Pc(u32),
    Data(Vec<u8>),
    Failed(FailureCode),
}

impl Response {
    pub fn parse(frame: &[u8]) -> Result<Self, Error> {
        if frame.len() < 2 {
            return Err(Error::protocol("truncated AVR8 response frame", None));
        }

        let id = ResponseId::from_u8(frame[0]).ok_or_else(|| {
            Error::protocol(format!("unknown AVR8 response id 0x{:02x}", frame[0]), None)
        })?;

        match id {
            ResponseId::Ok => Ok(Response::Ok),
            ResponseId::List => Ok(Response::List(frame[2..].to_vec())),
            ResponseId::Pc => {
                let pc = frame
                    .pread_with::<u32>(2, LE)
                    .map_err(|_| Error::protocol("truncated PC response", None))?;
                Ok(Response::Pc(pc))
            }
            ResponseId::Data => Ok(Response::Data(frame[2..].to_vec())),
            ResponseId::Failed => {
                let code = frame
                    .get(2)
                    .and_then(|byte| FailureCode::from_u8(*byte))
                    .unwrap_or(FailureCode::Unknown);
                Ok(Response::Failed(code))
            }
        }
    }

    /// Unwrap an OK response, mapping FAILED to a protocol error.
    pub fn expect_ok(self, what: &str) -> Result<(), Error> {
        match self {
            Response::Ok => Ok(()),
            Response::Failed(code) => Err(Error::protocol(
                format!("AVR8 {what} command failed"),
                Some(code),
            )),
            other => Err(Error::protocol(
                format!("unexpected response to AVR8 {what} command: {other:?}"),
                None,
            )),
        }
    }

    pub fn expect_data(self, what: &str) -> Result<Vec<u8>, Error> {
        match self {
            Response::Data(data) => Ok(data),
            Response::Failed(code) => Err(Error::protocol(
                format!("AVR8 {what} command failed"),
                Some(code),
            )),
            other => Err(Error::protocol(
                format!("unexpected response to AVR8 {what} command: {other:?}"),
                None,
            )),
        }
    }
}

/// Decode one raw event frame (SOF and sequence already stripped).
pub fn parse_event(payload: &[u8]) -> Result<Event, Error> {
    let id = *payload
        .first()
        .ok_or_else(|| Error::protocol("empty AVR event frame", None))?;

    match EventId::from_u8(id) {
        Some(EventId::Break) => {
            let pc = payload
                .pread_with::<u32>(1, LE)
                .map_err(|_| Error::protocol("truncated AVR break event", None))?;
            let cause = payload.get(5).copied().unwrap_or(0);
            Ok(Event::Break { pc, cause })
        }
        _ => Ok(Event::Other { id }),
    }
}

/// Builders for command frames (command id + version + payload).
pub mod command {
    use super::*;

    fn frame(id: CommandId, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + data.len());
        out.push(id as u8);
        out.push(0x00);
        out.extend_from_slice(data);
        out
    }

    pub fn set_parameter(parameter: Parameter, value: &[u8]) -> Vec<u8> {
        let mut data = vec![parameter.context as u8, parameter.id, value.len() as u8];
        data.extend_from_slice(value);
        frame(CommandId::Set, &data)
    }

    pub fn get_parameter(parameter: Parameter, size: u8) -> Vec<u8> {
        frame(
            CommandId::Get,
            &[parameter.context as u8, parameter.id, size],
        )
    }

    pub fn activate_physical(apply_external_reset: bool) -> Vec<u8> {
        frame(CommandId::ActivatePhysical, &[apply_external_reset as u8])
    }

    pub fn deactivate_physical() -> Vec<u8> {
        frame(CommandId::DeactivatePhysical, &[])
    }

    pub fn get_device_id() -> Vec<u8> {
        frame(CommandId::GetId, &[])
    }

    pub fn attach(break_after_attach: bool) -> Vec<u8> {
        frame(CommandId::Attach, &[break_after_attach as u8])
    }

    pub fn detach() -> Vec<u8> {
        frame(CommandId::Detach, &[])
    }

    pub fn enter_programming_mode() -> Vec<u8> {
        frame(CommandId::ProgModeEnter, &[])
    }

    pub fn leave_programming_mode() -> Vec<u8> {
        frame(CommandId::ProgModeLeave, &[])
    }

    pub fn disable_debug_wire() -> Vec<u8> {
        frame(CommandId::DisableDebugWire, &[])
    }

    pub fn erase(mode: EraseMode, address: u32) -> Vec<u8> {
        let mut data = [0u8; 5];
        data[0] = mode as u8;
        data.pwrite_with(address, 1, LE).unwrap();
        frame(CommandId::Erase, &data)
    }

    pub fn read_memory(memtype: Memtype, address: u32, bytes: u32) -> Vec<u8> {
        let mut data = [0u8; 9];
        data[0] = memtype as u8;
        data.pwrite_with(address, 1, LE).unwrap();
        data.pwrite_with(bytes, 5, LE).unwrap();
        frame(CommandId::MemoryRead, &data)
    }

    /// Masked read: one mask byte per address, zero meaning "do not
    /// access, return 0x00".
    pub fn read_memory_masked(memtype: Memtype, address: u32, mask: &[u8]) -> Vec<u8> {
        let mut data = vec![0u8; 9];
        data[0] = memtype as u8;
        data.pwrite_with(address, 1, LE).unwrap();
        data.pwrite_with(mask.len() as u32, 5, LE).unwrap();
        data.extend_from_slice(mask);
        frame(CommandId::MemoryReadMasked, &data)
    }

    pub fn write_memory(memtype: Memtype, address: u32, bytes: &[u8]) -> Vec<u8> {
        let mut data = vec![0u8; 10];
        data[0] = memtype as u8;
        data.pwrite_with(address, 1, LE).unwrap();
        data.pwrite_with(bytes.len() as u32, 5, LE).unwrap();
        // data[9]: write first, reply after
        data.extend_from_slice(bytes);
        frame(CommandId::MemoryWrite, &data)
    }

    pub fn reset() -> Vec<u8> {
        // level 1: reset and stop
        frame(CommandId::Reset, &[0x01])
    }

    pub fn stop() -> Vec<u8> {
        // level 1: stop immediately
        frame(CommandId::Stop, &[0x01])
    }

    pub fn run() -> Vec<u8> {
        frame(CommandId::Run, &[])
    }

    pub fn run_to(word_address: u32) -> Vec<u8> {
        let mut data = [0u8; 4];
        data.pwrite_with(word_address, 0, LE).unwrap();
        frame(CommandId::RunTo, &data)
    }

    pub fn step() -> Vec<u8> {
        // level 1 (instruction), mode 1 (step into)
        frame(CommandId::Step, &[0x01, 0x01])
    }

    pub fn pc_read() -> Vec<u8> {
        frame(CommandId::PcRead, &[])
    }

    pub fn pc_write(word_address: u32) -> Vec<u8> {
        let mut data = [0u8; 4];
        data.pwrite_with(word_address, 0, LE).unwrap();
        frame(CommandId::PcWrite, &data)
    }

    fn breakpoint_frame(id: CommandId, addresses: &[u32]) -> Vec<u8> {
        let mut data = Vec::with_capacity(addresses.len() * 4);
        for address in addresses {
            data.extend_from_slice(&address.to_le_bytes());
        }
        frame(id, &data)
    }

    pub fn set_software_breakpoints(addresses: &[u32]) -> Vec<u8> {
        breakpoint_frame(CommandId::SwBreakSet, addresses)
    }

    pub fn clear_software_breakpoints(addresses: &[u32]) -> Vec<u8> {
        breakpoint_frame(CommandId::SwBreakClear, addresses)
    }

    pub fn clear_all_software_breakpoints() -> Vec<u8> {
        frame(CommandId::SwBreakClearAll, &[])
    }

    pub fn set_hardware_breakpoints(addresses: &[u32]) -> Vec<u8> {
        breakpoint_frame(CommandId::HwBreakSet, addresses)
    }

    pub fn clear_hardware_breakpoints(addresses: &[u32]) -> Vec<u8> {
        breakpoint_frame(CommandId::HwBreakClear, addresses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_memory_frame_layout() {
        let frame = command::read_memory(Memtype::Sram, 0x100, 16);

        assert_eq!(frame[0], CommandId::MemoryRead as u8);
        assert_eq!(frame[1], 0x00);
        assert_eq!(frame[2], Memtype::Sram as u8);
        assert_eq!(&frame[3..7], &0x100u32.to_le_bytes());
        assert_eq!(&frame[7..11], &16u32.to_le_bytes());
    }

    #[test]
    fn write_memory_frame_carries_payload_after_header() {
        let frame = command::write_memory(Memtype::FlashPage, 0x80, &[0xAA, 0xBB]);

        assert_eq!(frame[0], CommandId::MemoryWrite as u8);
        assert_eq!(frame[2], Memtype::FlashPage as u8);
        assert_eq!(&frame[3..7], &0x80u32.to_le_bytes());
        assert_eq!(&frame[7..11], &2u32.to_le_bytes());
        assert_eq!(frame[11], 0x00);
        assert_eq!(&frame[12..], &[0xAA, 0xBB]);
    }

    #[test]
    fn parses_failed_response_with_code() {
        let response = Response::parse(&[0xA0, 0x00, 0x10]).unwrap();
        assert_eq!(response, Response::Failed(FailureCode::DwPhyError));
    }

    #[test]
    fn parses_pc_response() {
        let mut frame = vec![0x83, 0x00];
        frame.extend_from_slice(&0x200u32.to_le_bytes());
        assert_eq!(Response::parse(&frame).unwrap(), Response::Pc(0x200));
    }

    #[test]
    fn parses_break_event() {
        let mut payload = vec![EventId::Break as u8];
        payload.extend_from_slice(&0x40u32.to_le_bytes());
        payload.push(0x01);

        assert_eq!(
            parse_event(&payload).unwrap(),
            Event::Break { pc: 0x40, cause: 0x01 }
        );
    }

    #[test]
    fn unknown_event_ids_are_preserved() {
        assert_eq!(parse_event(&[0x41, 0x00]).unwrap(), Event::Other { id: 0x41 });
    }
}
