//! Behavioural tests for the AVR8 debug interface and target façade,
//! driven against the simulated probe.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use avr_gdb_server::probe::edbg::EdbgAvr8Interface;
use avr_gdb_server::probe::fake::{FakeProbe, FakeState};
use avr_gdb_server::target::avr8::{Avr8, Avr8Config};
use avr_gdb_server::target::provider::atmega328p;
use avr_gdb_server::target::{
    Family, MemoryType, PhysicalInterface, RegisterType, TargetDescriptor,
};

fn debug_wire_config() -> Avr8Config {
    Avr8Config {
        physical_interface: PhysicalInterface::DebugWire,
        manage_dwen_fuse: false,
        target_power_cycle_delay: Duration::from_millis(1),
        ..Avr8Config::default()
    }
}

fn updi_descriptor() -> TargetDescriptor {
    let mut descriptor = atmega328p();
    descriptor.family = Some(Family::Da);
    descriptor.physical_interfaces = BTreeSet::from([PhysicalInterface::Updi]);
    descriptor.parameters.signature_segment_start = Some(0x1100);
    descriptor
}

fn build_target(
    descriptor: TargetDescriptor,
    config: Avr8Config,
) -> (Avr8, Arc<Mutex<FakeState>>) {
    let descriptor = Arc::new(descriptor);
    let probe = FakeProbe::from_descriptor(&descriptor);
    let state = probe.state();

    let interface = EdbgAvr8Interface::new(
        Box::new(probe),
        config.clone(),
        descriptor.family,
        descriptor.parameters.clone(),
    )
    .unwrap();

    (Avr8::new(descriptor, interface, config, true), state)
}

fn activated_target(config: Avr8Config) -> (Avr8, Arc<Mutex<FakeState>>) {
    let (mut target, state) = build_target(atmega328p(), config);
    target.activate().unwrap();
    (target, state)
}

#[test]
fn activation_validates_the_device_signature() {
    let (mut target, state) = build_target(atmega328p(), debug_wire_config());
    state.lock().unwrap().signature = [0x1E, 0x95, 0x14];

    let error = target.activate().unwrap_err();
    assert!(error.to_string().contains("signature mismatch"));
}

#[test]
fn program_counter_round_trips_through_word_conversion() {
    let (mut target, _state) = activated_target(debug_wire_config());

    for address in [0u32, 2, 0x100, 0x200, 0x7FFE] {
        target.set_program_counter(address).unwrap();
        assert_eq!(target.get_program_counter().unwrap(), address);
    }
}

#[test]
fn unaligned_flash_write_is_widened_to_the_page() {
    let (mut target, state) = activated_target(debug_wire_config());

    target.enable_programming_mode().unwrap();
    target.write_memory(MemoryType::Flash, 0x81, &[0xAA]).unwrap();
    target.disable_programming_mode().unwrap();

    let state = state.lock().unwrap();
    assert_eq!(state.flash[0x81], 0xAA);
    // The rest of the page was read back and rewritten unchanged
    assert_eq!(state.flash[0x80], 0xFF);
    assert_eq!(state.flash[0xFF], 0xFF);
}

#[test]
fn flash_writes_require_a_programming_session() {
    let (mut target, _state) = activated_target(debug_wire_config());

    let error = target
        .write_memory(MemoryType::Flash, 0x00, &[0x00; 2])
        .unwrap_err();
    assert!(error.to_string().contains("programming"));
}

#[test]
fn ram_access_is_rejected_during_programming_mode() {
    let (mut target, _state) = activated_target(debug_wire_config());

    target.enable_programming_mode().unwrap();
    assert!(target.read_memory(MemoryType::Ram, 0x100, 4, &[]).is_err());
    assert!(target
        .write_memory(MemoryType::Ram, 0x100, &[0x00])
        .is_err());
    target.disable_programming_mode().unwrap();

    assert!(target.read_memory(MemoryType::Ram, 0x100, 4, &[]).is_ok());
}

#[test]
fn out_of_range_accesses_are_rejected() {
    let (mut target, _state) = activated_target(debug_wire_config());

    // Flash ends at 0x7FFF
    assert!(target
        .read_memory(MemoryType::Flash, 0x7F80, 0x100, &[])
        .is_err());
    // RAM is validated from zero to allow mapped I/O access
    assert!(target.read_memory(MemoryType::Ram, 0x20, 4, &[]).is_ok());
    assert!(target.read_memory(MemoryType::Ram, 0x8F0, 0x20, &[]).is_err());
}

#[test]
fn large_ram_reads_are_chunked_to_the_report_budget() {
    let (mut target, state) = activated_target(debug_wire_config());

    let before = state.lock().unwrap().memory_transactions;
    let buffer = target.read_memory(MemoryType::Ram, 0x100, 2000, &[]).unwrap();
    let after = state.lock().unwrap().memory_transactions;

    assert_eq!(buffer.len(), 2000);
    // (512 - 30) * 2 = 964 bytes per transaction
    assert_eq!(after - before, 2000u32.div_ceil(964));
}

#[test]
fn ram_read_spanning_the_ocd_data_register_masks_it() {
    let (mut target, state) = activated_target(debug_wire_config());

    {
        let mut state = state.lock().unwrap();
        for address in 0x40..0x60usize {
            state.data[address] = address as u8;
        }
    }

    // 0x51 is the mapped OCD data register; a plain read of this range
    // would be rejected by the probe.
    let buffer = target.read_memory(MemoryType::Ram, 0x40, 0x20, &[]).unwrap();

    assert_eq!(buffer.len(), 0x20);
    assert_eq!(buffer[0x51 - 0x40], 0x00);
    assert_eq!(buffer[0x50 - 0x40], 0x50);
    assert_eq!(buffer[0x52 - 0x40], 0x52);
}

#[test]
fn register_reads_are_grouped_per_register_type() {
    let (mut target, state) = activated_target(debug_wire_config());

    {
        let mut state = state.lock().unwrap();
        for register in 0..32usize {
            state.data[register] = register as u8;
        }
        state.data[0x5D] = 0x34; // SPL
        state.data[0x5E] = 0x12; // SPH
        state.data[0x5F] = 0x42; // SREG
        state.pc_word = 0x80;
    }

    let descriptor = target.descriptor();
    let mut descriptors = Vec::new();
    for register_type in [
        RegisterType::GeneralPurpose,
        RegisterType::Status,
        RegisterType::StackPointer,
        RegisterType::ProgramCounter,
    ] {
        descriptors.extend(descriptor.registers_of_type(register_type).to_vec());
    }
    assert_eq!(descriptors.len(), 35);

    let before = state.lock().unwrap().memory_transactions;
    let registers = target.read_registers(descriptors).unwrap();
    let after = state.lock().unwrap().memory_transactions;

    assert_eq!(registers.len(), 35);
    // One covering read per register type; the PC travels out of band.
    assert!(after - before <= 3);

    let r17 = registers.iter().find(|r| r.descriptor.name == "r17").unwrap();
    assert_eq!(r17.value, vec![17]);

    // Values are MSB-first
    let sp = registers.iter().find(|r| r.descriptor.name == "SP").unwrap();
    assert_eq!(sp.value, vec![0x12, 0x34]);

    let pc = registers.iter().find(|r| r.descriptor.name == "PC").unwrap();
    assert_eq!(pc.value, vec![0x00, 0x00, 0x01, 0x00]);

    assert_eq!(target.get_stack_pointer().unwrap(), 0x1234);
}

#[test]
fn dwen_update_aborts_on_signature_mismatch() {
    let (mut target, state) = build_target(atmega328p(), debug_wire_config());
    state.lock().unwrap().signature = [0x00, 0x01, 0x02];

    assert!(target.update_dwen_fuse(true).is_err());
    assert!(state.lock().unwrap().fuse_writes.is_empty());
}

#[test]
fn dwen_update_aborts_when_spien_reads_unprogrammed() {
    let (mut target, state) = build_target(atmega328p(), debug_wire_config());
    // SPIEN (bit 5) reads as unprogrammed: the fuse layout data is bad
    state.lock().unwrap().fuses[1] = 0xF9;

    assert!(target.update_dwen_fuse(true).is_err());
    assert!(state.lock().unwrap().fuse_writes.is_empty());
}

#[test]
fn dwen_update_aborts_when_lock_bits_are_set() {
    let (mut target, state) = build_target(atmega328p(), debug_wire_config());
    {
        let mut state = state.lock().unwrap();
        state.fuses[1] = 0xD9; // DWEN unprogrammed, update required
        state.lock_byte = 0xAA;
    }

    assert!(target.update_dwen_fuse(true).is_err());
    assert!(state.lock().unwrap().fuse_writes.is_empty());
}

#[test]
fn dwen_update_short_circuits_at_the_desired_value() {
    let (mut target, state) = build_target(atmega328p(), debug_wire_config());
    // DWEN already programmed
    state.lock().unwrap().fuses[1] = 0x99;

    target.update_dwen_fuse(true).unwrap();
    assert!(state.lock().unwrap().fuse_writes.is_empty());
}

#[test]
fn debug_wire_activation_failure_triggers_dwen_recovery() {
    let config = Avr8Config {
        manage_dwen_fuse: true,
        ..debug_wire_config()
    };
    let (mut target, state) = build_target(atmega328p(), config);

    {
        let mut state = state.lock().unwrap();
        // Both the plain and the external-reset activation attempts fail
        state.remaining_activation_failures = 2;
        state.fuses[1] = 0xD9; // DWEN unprogrammed
    }

    target.activate().unwrap();

    let state = state.lock().unwrap();
    assert_eq!(state.fuse_writes, vec![(1, 0x99)]);
    assert_eq!(state.fuses[1], 0x99);
    assert_eq!(state.power_cycles, 1);
    assert!(state.physical_activated);
    assert!(state.attached);
}

#[test]
fn updi_chip_erase_preserves_eeprom() {
    let config = Avr8Config {
        physical_interface: PhysicalInterface::Updi,
        ..Avr8Config::default()
    };
    let (mut target, state) = build_target(updi_descriptor(), config);
    target.activate().unwrap();

    state.lock().unwrap().eeprom[..4].copy_from_slice(&[1, 2, 3, 4]);

    target.enable_programming_mode().unwrap();
    target.erase_memory(MemoryType::Flash).unwrap();
    target.disable_programming_mode().unwrap();

    let state = state.lock().unwrap();
    assert_eq!(&state.eeprom[..4], &[1, 2, 3, 4]);
    assert!(state.flash.iter().all(|&byte| byte == 0xFF));
}

#[test]
fn updi_chip_erase_without_preservation_loses_eeprom() {
    let config = Avr8Config {
        physical_interface: PhysicalInterface::Updi,
        preserve_eeprom: false,
        ..Avr8Config::default()
    };
    let (mut target, state) = build_target(updi_descriptor(), config);
    target.activate().unwrap();

    state.lock().unwrap().eeprom[..4].copy_from_slice(&[1, 2, 3, 4]);

    target.enable_programming_mode().unwrap();
    target.erase_memory(MemoryType::Flash).unwrap();
    target.disable_programming_mode().unwrap();

    assert!(state.lock().unwrap().eeprom.iter().all(|&byte| byte == 0xFF));
}

#[test]
fn updi_eeprom_write_merges_into_atomic_pages() {
    let config = Avr8Config {
        physical_interface: PhysicalInterface::Updi,
        ..Avr8Config::default()
    };
    let (mut target, state) = build_target(updi_descriptor(), config);
    target.activate().unwrap();

    target.write_memory(MemoryType::Eeprom, 1, &[0xAB]).unwrap();

    let state = state.lock().unwrap();
    assert_eq!(state.eeprom[1], 0xAB);
    assert_eq!(state.eeprom[0], 0xFF);
    assert_eq!(state.eeprom[2], 0xFF);
}

#[test]
fn eeprom_erase_is_an_erased_pattern_fill() {
    let (mut target, state) = activated_target(debug_wire_config());

    state.lock().unwrap().eeprom[..8].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
    target.erase_memory(MemoryType::Eeprom).unwrap();

    assert!(state.lock().unwrap().eeprom.iter().all(|&byte| byte == 0xFF));
}

#[test]
fn memory_write_read_round_trip() {
    let (mut target, _state) = activated_target(debug_wire_config());

    let pattern: Vec<u8> = (0..64).map(|value| value as u8 ^ 0x5A).collect();
    target
        .write_memory(MemoryType::Ram, 0x180, &pattern)
        .unwrap();
    assert_eq!(
        target.read_memory(MemoryType::Ram, 0x180, 64, &[]).unwrap(),
        pattern
    );

    target
        .write_memory(MemoryType::Eeprom, 0x10, &pattern)
        .unwrap();
    assert_eq!(
        target
            .read_memory(MemoryType::Eeprom, 0x10, 64, &[])
            .unwrap(),
        pattern
    );
}
