//! AVR8 address and layout parameters.
//!
//! These originate in the device description and are pushed to the
//! probe as EDBG device parameters during initialisation. Which subset
//! is required depends on the configuration variant; the debug
//! interface validates presence when it assembles its parameter block.

use serde::{Deserialize, Serialize};

use super::{MemoryAddress, MemorySize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Avr8Parameters {
    // Flash / SRAM / EEPROM layout (debugWire, JTAG, UPDI)
    pub flash_start: Option<MemoryAddress>,
    pub flash_size: Option<MemorySize>,
    pub flash_page_size: Option<MemorySize>,
    pub ram_start: Option<MemoryAddress>,
    pub ram_size: Option<MemorySize>,
    pub eeprom_start: Option<MemoryAddress>,
    pub eeprom_size: Option<MemorySize>,
    pub eeprom_page_size: Option<u8>,

    pub boot_section_start: Option<MemoryAddress>,
    pub boot_section_size: Option<MemorySize>,
    pub app_section_start: Option<MemoryAddress>,
    pub app_section_size: Option<MemorySize>,

    // OCD plumbing (debugWire / megaAVR JTAG)
    pub ocd_revision: Option<u8>,
    pub ocd_data_register: Option<MemoryAddress>,
    pub spmcsr_address: Option<MemoryAddress>,
    pub osccal_address: Option<MemoryAddress>,
    pub eearl_address: Option<MemoryAddress>,
    pub eearh_address: Option<MemoryAddress>,
    pub eecr_address: Option<MemoryAddress>,
    pub eedr_address: Option<MemoryAddress>,
    /// Start of the mapped I/O segment. Subtracted from the
    /// OSCCAL/EEARL/EEARH/EECR/EEDR addresses before they are sent as
    /// device parameters.
    pub mapped_io_start: Option<MemoryAddress>,

    // PDI (XMEGA) offsets
    pub app_section_pdi_offset: Option<MemoryAddress>,
    pub boot_section_pdi_offset: Option<MemoryAddress>,
    pub eeprom_pdi_offset: Option<MemoryAddress>,
    pub fuse_pdi_offset: Option<MemoryAddress>,
    pub lock_pdi_offset: Option<MemoryAddress>,
    pub user_signature_pdi_offset: Option<MemoryAddress>,
    pub product_signature_pdi_offset: Option<MemoryAddress>,
    pub ram_pdi_offset: Option<MemoryAddress>,

    // UPDI
    pub program_memory_updi_start: Option<MemoryAddress>,
    pub nvm_module_base: Option<MemoryAddress>,
    pub ocd_module_address: Option<MemoryAddress>,
    pub mcu_module_base: Option<MemoryAddress>,

    // Fuse / lock / signature segments
    pub signature_segment_start: Option<MemoryAddress>,
    pub fuse_segment_start: Option<MemoryAddress>,
    pub fuse_segment_size: Option<MemorySize>,
    pub lockbits_segment_start: Option<MemoryAddress>,

    // Register file & CPU registers
    pub gp_register_start: Option<MemoryAddress>,
    pub stack_pointer_address: Option<MemoryAddress>,
    pub stack_pointer_size: Option<MemorySize>,
    pub status_register_address: Option<MemoryAddress>,
    pub status_register_size: Option<MemorySize>,

    // Fuse bit layout, used by the DWEN/OCDEN management procedures
    pub dwen_fuse: Option<FuseBitsDescriptor>,
    pub spien_fuse: Option<FuseBitsDescriptor>,
    pub ocden_fuse: Option<FuseBitsDescriptor>,
    pub jtagen_fuse: Option<FuseBitsDescriptor>,

    pub isp: IspParameters,
}

/// The fuse byte an AVR fuse bit lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FuseType {
    Low,
    High,
    Extended,
}

impl FuseType {
    /// Byte offset of this fuse within the FUSES memory segment.
    pub fn byte_address(self) -> MemoryAddress {
        match self {
            FuseType::Low => 0,
            FuseType::High => 1,
            FuseType::Extended => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuseBitsDescriptor {
    pub fuse_type: FuseType,
    pub bit_mask: u8,
}

/// Timing parameters for the ISP (SPI) side channel.
///
/// Defaults match the values shipped in device description files for
/// the classic megaAVR parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IspParameters {
    pub enter_prog_mode_timeout: u8,
    pub enter_prog_mode_stab_delay: u8,
    pub enter_prog_mode_cmd_exe_delay: u8,
    pub enter_prog_mode_sync_loops: u8,
    pub enter_prog_mode_byte_delay: u8,
    pub enter_prog_mode_poll_value: u8,
    pub enter_prog_mode_poll_index: u8,
    pub leave_prog_mode_pre_delay: u8,
    pub leave_prog_mode_post_delay: u8,
    pub read_fuse_poll_index: u8,
    pub read_signature_poll_index: u8,
    pub read_lock_poll_index: u8,
}

impl Default for IspParameters {
    fn default() -> Self {
        Self {
            enter_prog_mode_timeout: 200,
            enter_prog_mode_stab_delay: 100,
            enter_prog_mode_cmd_exe_delay: 25,
            enter_prog_mode_sync_loops: 32,
            enter_prog_mode_byte_delay: 0,
            enter_prog_mode_poll_value: 0x53,
            enter_prog_mode_poll_index: 3,
            leave_prog_mode_pre_delay: 1,
            leave_prog_mode_post_delay: 1,
            read_fuse_poll_index: 4,
            read_signature_poll_index: 4,
            read_lock_poll_index: 4,
        }
    }
}
