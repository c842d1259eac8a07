//! Packet handlers: typed command packets against the controller
//! service.
//!
//! Every handler catches failures at its own boundary; a failed target
//! operation becomes an `E01` reply rather than a dead session.

use serde_json::json;

use crate::controller::TargetControllerService;
use crate::error::Error;
use crate::target::{Breakpoint, BreakpointKind, MemoryType, Register};

use super::packet::encode_hex;
use super::parser::CommandPacket;
use super::session::{memory_type_from_gdb_address, DebugSession};

const ERROR_REPLY: &[u8] = b"E01";
const OK_REPLY: &[u8] = b"OK";

/// Announced to the client in `qSupported`.
const MAX_PACKET_SIZE: usize = 0x10000;

/// What the connection loop should do after a packet was handled.
#[derive(Debug)]
pub enum HandlerOutcome {
    /// Send this payload.
    Reply(Vec<u8>),
    /// The reply is deferred until the target stops.
    WaitForStop,
    /// Send `OK` and end the session.
    Detach,
}

pub struct PacketHandler<'a> {
    service: &'a TargetControllerService,
    session: &'a mut DebugSession,
}

impl<'a> PacketHandler<'a> {
    pub fn new(service: &'a TargetControllerService, session: &'a mut DebugSession) -> Self {
        Self { service, session }
    }

    pub fn handle(&mut self, command: CommandPacket) -> HandlerOutcome {
        let result = self.dispatch(command);

        match result {
            Ok(outcome) => outcome,
            Err(error) => {
                log::error!("Failed to handle packet - {error}");
                HandlerOutcome::Reply(ERROR_REPLY.to_vec())
            }
        }
    }

    fn dispatch(&mut self, command: CommandPacket) -> Result<HandlerOutcome, Error> {
        let outcome = match command {
            CommandPacket::Supported => {
                let features = format!(
                    "PacketSize={MAX_PACKET_SIZE:x};qXfer:features:read+;swbreak+;hwbreak+"
                );
                HandlerOutcome::Reply(features.into_bytes())
            }

            CommandPacket::Attached => HandlerOutcome::Reply(b"1".to_vec()),

            CommandPacket::FeaturesRead {
                annex,
                offset,
                length,
            } => {
                if annex != b"target.xml" {
                    return Err(Error::InvalidArgument(format!(
                        "unknown features annex \"{}\"",
                        String::from_utf8_lossy(&annex)
                    )));
                }

                let xml = self.session.descriptor.target_xml();
                let xml = xml.as_bytes();
                let offset = offset as usize;

                let mut reply = Vec::new();
                if offset >= xml.len() {
                    reply.push(b'l');
                } else {
                    let end = xml.len().min(offset + length as usize);
                    reply.push(if end == xml.len() { b'l' } else { b'm' });
                    reply.extend_from_slice(&xml[offset..end]);
                }

                HandlerOutcome::Reply(reply)
            }

            CommandPacket::Monitor(line) => self.handle_monitor(&line)?,

            CommandPacket::HaltReason => HandlerOutcome::Reply(b"S05".to_vec()),

            CommandPacket::ReadRegisters => self.handle_read_registers(None)?,
            CommandPacket::ReadRegister(number) => self.handle_read_registers(Some(number))?,

            CommandPacket::WriteRegisters(image) => self.handle_write_registers(&image)?,
            CommandPacket::WriteRegister { number, value } => {
                self.handle_write_register(number, &value)?
            }

            CommandPacket::ReadMemory { address, length } => {
                let (memory_type, local_address) = memory_type_from_gdb_address(address);
                let absolute = self.to_absolute(memory_type, local_address)?;

                let buffer = self
                    .service
                    .read_memory(memory_type, absolute, length, Vec::new())?;
                HandlerOutcome::Reply(encode_hex(&buffer).into_bytes())
            }

            CommandPacket::WriteMemory {
                address,
                length,
                data,
            } => {
                if data.len() as u32 != length {
                    return Err(Error::InvalidArgument(
                        "memory write data does not match the declared length".into(),
                    ));
                }

                let (memory_type, local_address) = memory_type_from_gdb_address(address);

                if memory_type == MemoryType::Flash {
                    // Program memory is written through the vFlash
                    // packets; a client resorting to `M` has gone off
                    // the rails.
                    return Err(Error::InvalidArgument(
                        "flash cannot be written through the M packet".into(),
                    ));
                }

                if data.is_empty() {
                    return Ok(HandlerOutcome::Reply(OK_REPLY.to_vec()));
                }

                let absolute = self.to_absolute(memory_type, local_address)?;
                self.service.write_memory(memory_type, absolute, data)?;
                HandlerOutcome::Reply(OK_REPLY.to_vec())
            }

            CommandPacket::FlashErase { address, length } => {
                let (memory_type, _) = memory_type_from_gdb_address(address);
                if memory_type != MemoryType::Flash {
                    return Err(Error::InvalidArgument(
                        "vFlashErase outside the flash address space".into(),
                    ));
                }

                log::debug!(
                    "Flash erase requested for 0x{address:x}..0x{:x}",
                    address + length
                );
                self.session.flash.erase_requested = true;
                HandlerOutcome::Reply(OK_REPLY.to_vec())
            }

            CommandPacket::FlashWrite { address, data } => {
                let (memory_type, local_address) = memory_type_from_gdb_address(address);
                if memory_type != MemoryType::Flash {
                    return Err(Error::InvalidArgument(
                        "vFlashWrite outside the flash address space".into(),
                    ));
                }

                self.session.flash.record_write(local_address, &data);
                HandlerOutcome::Reply(OK_REPLY.to_vec())
            }

            CommandPacket::FlashDone => self.handle_flash_done()?,

            CommandPacket::InsertBreakpoint { kind, address } => {
                // Everything is routed through software breakpoints;
                // the requested kind is kept for the session's
                // bookkeeping. See the hardware-breakpoint note in
                // DESIGN.md.
                self.service.set_breakpoint(Breakpoint {
                    address,
                    kind: BreakpointKind::Software,
                })?;
                self.session.breakpoints.insert(address, kind);
                HandlerOutcome::Reply(OK_REPLY.to_vec())
            }

            CommandPacket::RemoveBreakpoint { kind: _, address } => {
                self.service.remove_breakpoint(Breakpoint {
                    address,
                    kind: BreakpointKind::Software,
                })?;
                self.session.breakpoints.remove(&address);
                HandlerOutcome::Reply(OK_REPLY.to_vec())
            }

            CommandPacket::Continue { address } => {
                self.service.continue_execution(address, None)?;
                HandlerOutcome::WaitForStop
            }

            CommandPacket::Step { address } => {
                self.service.step(address)?;
                HandlerOutcome::WaitForStop
            }

            CommandPacket::VContQuery => HandlerOutcome::Reply(b"vCont;c;C;s;S".to_vec()),

            CommandPacket::VCont { step } => {
                if step {
                    self.service.step(None)?;
                } else {
                    self.service.continue_execution(None, None)?;
                }
                HandlerOutcome::WaitForStop
            }

            CommandPacket::Detach => HandlerOutcome::Detach,

            CommandPacket::SetThread => HandlerOutcome::Reply(OK_REPLY.to_vec()),

            CommandPacket::InterruptExecution => {
                self.service.stop()?;
                self.session.interrupt_requested = true;
                HandlerOutcome::WaitForStop
            }

            CommandPacket::Unsupported => HandlerOutcome::Reply(Vec::new()),
        };

        Ok(outcome)
    }

    /// EEPROM addresses travel in relative form; everything else is
    /// already absolute.
    fn to_absolute(&self, memory_type: MemoryType, address: u32) -> Result<u32, Error> {
        if memory_type != MemoryType::Eeprom {
            return Ok(address);
        }

        let descriptor = self
            .session
            .descriptor
            .target
            .memory(MemoryType::Eeprom)
            .ok_or_else(|| Error::InvalidArgument("target has no EEPROM".into()))?;

        Ok(descriptor.address_range.start + address)
    }

    fn handle_monitor(&mut self, line: &[u8]) -> Result<HandlerOutcome, Error> {
        let reply = match line {
            b"version" => {
                format!("{} v{}\n", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
            }
            b"version-machine" => {
                let version = env!("CARGO_PKG_VERSION");
                let mut parts = version.split('.');
                json!({
                    "version": version,
                    "components": {
                        "major": parts.next().unwrap_or("0"),
                        "minor": parts.next().unwrap_or("0"),
                        "patch": parts.next().unwrap_or("0"),
                    },
                })
                .to_string()
            }
            b"reset" => {
                log::warn!("Resetting target");
                self.service.reset()?;
                "Target reset complete - use the 'continue' command to begin execution.\n"
                    .to_string()
            }
            b"help" => "Supported monitor commands:\n\
                        \x20 version          - print the server version\n\
                        \x20 version-machine  - print the server version as JSON\n\
                        \x20 reset            - reset the target and leave it stopped\n"
                .to_string(),
            _ => return Ok(HandlerOutcome::Reply(Vec::new())),
        };

        Ok(HandlerOutcome::Reply(
            encode_hex(reply.as_bytes()).into_bytes(),
        ))
    }

    fn handle_read_registers(&mut self, number: Option<u16>) -> Result<HandlerOutcome, Error> {
        let slots: Vec<_> = match number {
            Some(number) => {
                let register = self.session.descriptor.register(number).ok_or_else(|| {
                    Error::InvalidArgument(format!("unknown GDB register number {number}"))
                })?;
                vec![register.clone()]
            }
            None => self.session.descriptor.registers.clone(),
        };

        let descriptors = slots.iter().map(|slot| slot.target.clone()).collect();
        let mut values = self.service.read_registers(descriptors)?;

        let mut reply = String::new();
        for slot in &slots {
            let position = values
                .iter()
                .position(|register| register.descriptor == slot.target)
                .ok_or_else(|| {
                    Error::protocol(
                        format!(
                            "register {} missing from the read response",
                            slot.target.name
                        ),
                        None,
                    )
                })?;
            let register = values.remove(position);

            // Values arrive MSB-first; the wire wants LSB-first padded
            // to the slot's declared size.
            let mut bytes = register.value;
            bytes.reverse();
            bytes.resize(slot.size as usize, 0x00);

            reply.push_str(&encode_hex(&bytes));
        }

        Ok(HandlerOutcome::Reply(reply.into_bytes()))
    }

    fn handle_write_registers(&mut self, image: &[u8]) -> Result<HandlerOutcome, Error> {
        let expected: usize = self
            .session
            .descriptor
            .registers
            .iter()
            .map(|slot| slot.size as usize)
            .sum();

        if image.len() != expected {
            return Err(Error::InvalidArgument(format!(
                "register image holds {} bytes, expected {expected}",
                image.len()
            )));
        }

        let mut registers = Vec::with_capacity(self.session.descriptor.registers.len());
        let mut offset = 0usize;

        for slot in &self.session.descriptor.registers {
            let mut value = image[offset..offset + slot.size as usize].to_vec();
            offset += slot.size as usize;

            // Wire order is LSB-first
            value.reverse();
            registers.push(Register::new(slot.target.clone(), value));
        }

        self.service.write_registers(registers)?;
        Ok(HandlerOutcome::Reply(OK_REPLY.to_vec()))
    }

    fn handle_write_register(
        &mut self,
        number: u16,
        value: &[u8],
    ) -> Result<HandlerOutcome, Error> {
        let slot = self
            .session
            .descriptor
            .register(number)
            .ok_or_else(|| {
                Error::InvalidArgument(format!("unknown GDB register number {number}"))
            })?
            .clone();

        if value.len() > slot.size as usize {
            return Err(Error::InvalidArgument(format!(
                "value exceeds register size of {} bytes",
                slot.size
            )));
        }

        let mut bytes = value.to_vec();
        bytes.resize(slot.size as usize, 0x00);
        bytes.reverse();

        self.service
            .write_registers(vec![Register::new(slot.target, bytes)])?;
        Ok(HandlerOutcome::Reply(OK_REPLY.to_vec()))
    }

    fn handle_flash_done(&mut self) -> Result<HandlerOutcome, Error> {
        log::info!("Programming target flash");

        self.service.enable_programming_mode()?;

        let result: Result<(), Error> = (|| {
            if self.session.flash.erase_requested {
                self.service.erase_memory(MemoryType::Flash)?;
            }

            for (address, buffer) in std::mem::take(&mut self.session.flash.buffers) {
                self.service.write_memory(MemoryType::Flash, address, buffer)?;
            }

            Ok(())
        })();

        let disable_result = self.service.disable_programming_mode();
        self.session.flash.clear();

        result?;
        disable_result?;

        log::info!("Flash programming complete");
        Ok(HandlerOutcome::Reply(OK_REPLY.to_vec()))
    }
}
