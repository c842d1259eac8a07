//! Target descriptor providers.
//!
//! Device description parsing is deliberately behind this contract:
//! the pipeline only ever sees a finished [`TargetDescriptor`].
//! Descriptors are served either from the built-in device table or
//! from a YAML device specification file with the same shape.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, Error};

use super::{
    AddressRange, Avr8Parameters, Family, FuseBitsDescriptor, FuseType, MemoryAccess,
    MemoryDescriptor, MemoryType, PadDescriptor, PhysicalInterface, PinDescriptor,
    RegisterDescriptor, RegisterType, Signature, TargetDescriptor, Variant,
};

pub trait DescriptorProvider {
    fn descriptor(&self, target_name: &str) -> Result<TargetDescriptor, Error>;
}

/// Serves descriptors from YAML device specification files named
/// `<target>.yaml` under a spec directory.
pub struct YamlDescriptorProvider {
    directory: PathBuf,
}

impl YamlDescriptorProvider {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }
}

impl DescriptorProvider for YamlDescriptorProvider {
    fn descriptor(&self, target_name: &str) -> Result<TargetDescriptor, Error> {
        let path = self.directory.join(format!("{target_name}.yaml"));
        load_descriptor_file(&path)
    }
}

pub fn load_descriptor_file(path: &Path) -> Result<TargetDescriptor, Error> {
    let file = File::open(path).map_err(|error| {
        Error::Config(ConfigError::Invalid(format!(
            "failed to open device specification {}: {error}",
            path.display()
        )))
    })?;

    let descriptor: TargetDescriptor = serde_yaml::from_reader(file).map_err(ConfigError::Parse)?;
    Ok(descriptor)
}

/// Serves the devices compiled into the binary.
#[derive(Default)]
pub struct BuiltinDescriptorProvider;

impl DescriptorProvider for BuiltinDescriptorProvider {
    fn descriptor(&self, target_name: &str) -> Result<TargetDescriptor, Error> {
        match target_name {
            "atmega328p" => Ok(atmega328p()),
            _ => Err(Error::Config(ConfigError::Invalid(format!(
                "unknown target \"{target_name}\" - provide a device specification file"
            )))),
        }
    }
}

/// The ATmega328P: the classic debugWire + ISP part. Also the fixture
/// every test in this crate debugs against.
pub fn atmega328p() -> TargetDescriptor {
    let mut memories = BTreeMap::new();
    memories.insert(
        MemoryType::Flash,
        MemoryDescriptor {
            memory_type: MemoryType::Flash,
            address_range: AddressRange::new(0x0000, 0x7FFF),
            access: MemoryAccess {
                readable: true,
                writeable: true,
                writeable_during_debug: false,
            },
            page_size: Some(128),
        },
    );
    memories.insert(
        MemoryType::Ram,
        MemoryDescriptor {
            memory_type: MemoryType::Ram,
            address_range: AddressRange::new(0x0100, 0x08FF),
            access: MemoryAccess {
                readable: true,
                writeable: true,
                writeable_during_debug: true,
            },
            page_size: None,
        },
    );
    memories.insert(
        MemoryType::Eeprom,
        MemoryDescriptor {
            memory_type: MemoryType::Eeprom,
            address_range: AddressRange::new(0x0000, 0x03FF),
            access: MemoryAccess {
                readable: true,
                writeable: true,
                writeable_during_debug: true,
            },
            page_size: Some(4),
        },
    );
    memories.insert(
        MemoryType::Fuses,
        MemoryDescriptor {
            memory_type: MemoryType::Fuses,
            address_range: AddressRange::new(0x0000, 0x0002),
            access: MemoryAccess {
                readable: true,
                writeable: true,
                writeable_during_debug: false,
            },
            page_size: None,
        },
    );

    let mut registers: BTreeMap<RegisterType, Vec<RegisterDescriptor>> = BTreeMap::new();

    // The 32 general purpose registers are not part of any device
    // description; every AVR8 maps them at the bottom of the data
    // space.
    registers.insert(
        RegisterType::GeneralPurpose,
        (0u32..32)
            .map(|index| RegisterDescriptor {
                register_type: RegisterType::GeneralPurpose,
                start_address: Some(index),
                size: 1,
                name: format!("r{index}"),
                group: Some("general purpose cpu".into()),
                readable: true,
                writable: true,
            })
            .collect(),
    );

    registers.insert(
        RegisterType::StackPointer,
        vec![RegisterDescriptor {
            register_type: RegisterType::StackPointer,
            start_address: Some(0x5D),
            size: 2,
            name: "SP".into(),
            group: Some("CPU".into()),
            readable: true,
            writable: true,
        }],
    );

    registers.insert(
        RegisterType::Status,
        vec![RegisterDescriptor {
            register_type: RegisterType::Status,
            start_address: Some(0x5F),
            size: 1,
            name: "SREG".into(),
            group: Some("CPU".into()),
            readable: true,
            writable: true,
        }],
    );

    registers.insert(
        RegisterType::ProgramCounter,
        vec![RegisterDescriptor {
            register_type: RegisterType::ProgramCounter,
            start_address: None,
            size: 4,
            name: "PC".into(),
            group: Some("CPU".into()),
            readable: true,
            writable: true,
        }],
    );

    let mut pads = BTreeMap::new();
    for pin in 0u8..6 {
        pads.insert(
            format!("pb{pin}"),
            PadDescriptor {
                name: format!("pb{pin}"),
                gpio_pin_number: Some(pin),
                ddr_address: Some(0x24),
                port_address: Some(0x25),
                input_address: Some(0x23),
            },
        );
    }

    let variants = vec![Variant {
        id: 0,
        name: "ATmega328P-PU".into(),
        pins: (0u32..6)
            .map(|index| PinDescriptor {
                number: 14 + index,
                pad_name: format!("pb{index}"),
            })
            .collect(),
    }];

    TargetDescriptor {
        name: "atmega328p".into(),
        signature: Signature([0x1E, 0x95, 0x0F]),
        family: Some(Family::Mega),
        physical_interfaces: BTreeSet::from([PhysicalInterface::DebugWire, PhysicalInterface::Isp]),
        memories,
        registers,
        variants,
        pads,
        parameters: Avr8Parameters {
            flash_start: Some(0x0000),
            flash_size: Some(0x8000),
            flash_page_size: Some(128),
            ram_start: Some(0x0100),
            ram_size: Some(0x0800),
            eeprom_start: Some(0x0000),
            eeprom_size: Some(0x0400),
            eeprom_page_size: Some(4),
            ocd_revision: Some(1),
            ocd_data_register: Some(0x31),
            spmcsr_address: Some(0x57),
            osccal_address: Some(0x66),
            eearl_address: Some(0x41),
            eearh_address: Some(0x42),
            eecr_address: Some(0x3F),
            eedr_address: Some(0x40),
            mapped_io_start: Some(0x20),
            gp_register_start: Some(0x0000),
            stack_pointer_address: Some(0x5D),
            stack_pointer_size: Some(2),
            status_register_address: Some(0x5F),
            status_register_size: Some(1),
            dwen_fuse: Some(FuseBitsDescriptor {
                fuse_type: FuseType::High,
                bit_mask: 0x40,
            }),
            spien_fuse: Some(FuseBitsDescriptor {
                fuse_type: FuseType::High,
                bit_mask: 0x20,
            }),
            ..Avr8Parameters::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_provider_serves_atmega328p() {
        let descriptor = BuiltinDescriptorProvider.descriptor("atmega328p").unwrap();

        assert_eq!(descriptor.signature, Signature([0x1E, 0x95, 0x0F]));
        assert_eq!(
            descriptor
                .registers_of_type(RegisterType::GeneralPurpose)
                .len(),
            32
        );
        assert!(descriptor.memory(MemoryType::Flash).is_some());
    }

    #[test]
    fn builtin_provider_rejects_unknown_targets() {
        assert!(BuiltinDescriptorProvider.descriptor("atmega4809").is_err());
    }

    #[test]
    fn descriptor_survives_yaml_round_trip() {
        let descriptor = atmega328p();
        let yaml = serde_yaml::to_string(&descriptor).unwrap();
        let restored: TargetDescriptor = serde_yaml::from_str(&yaml).unwrap();

        assert_eq!(restored.signature, descriptor.signature);
        assert_eq!(restored.memories, descriptor.memories);
        assert_eq!(restored.registers, descriptor.registers);
        assert_eq!(restored.parameters, descriptor.parameters);
    }
}
