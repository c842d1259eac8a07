//! A simulated EDBG probe and AVR target.
//!
//! Implements [`WireTransport`] over an in-memory MCU model: data
//! space, flash, EEPROM, fuses, run state and a pending-event queue.
//! It backs the `simulator` tool kind for offline bring-up and is the
//! harness behind most of the crate's behavioural tests. The model
//! enforces the same quirks a real EDBG tool does: paged memory types
//! demand page-aligned page-sized accesses, and plain SRAM reads that
//! touch the OCD data register are rejected.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};

use scroll::{Pread, LE};

use crate::target::TargetDescriptor;

use super::edbg::avr8::{CommandId, FailureCode, Memtype, ResponseId, SubProtocol};
use super::edbg::EDBG_SOF;
use super::{TransportError, WireTransport};

const DATA_SPACE_SIZE: usize = 0x1200;

pub struct FakeState {
    pub report_size: usize,

    /// The whole data space: registers, I/O, SRAM.
    pub data: Vec<u8>,
    pub flash: Vec<u8>,
    pub eeprom: Vec<u8>,
    pub fuses: [u8; 3],
    pub lock_byte: u8,
    pub signature: [u8; 3],

    pub flash_page: u32,
    pub eeprom_page: u32,
    /// Mapped address the probe refuses to read without a mask.
    pub ocd_data_register: Option<u32>,

    pub pc_word: u32,
    pub running: bool,
    pub physical_activated: bool,
    pub attached: bool,
    pub programming_mode: bool,
    pub isp_active: bool,

    pub software_breakpoints: BTreeSet<u32>,
    pub hardware_breakpoints: BTreeSet<u32>,

    /// Remaining ActivatePhysical attempts to fail, for exercising the
    /// DWEN recovery path.
    pub remaining_activation_failures: u32,
    pub activation_failure_code: FailureCode,

    pub power_on: bool,
    pub power_cycles: u32,

    /// Every fuse byte write, ISP or memtype, in order.
    pub fuse_writes: Vec<(u8, u8)>,
    /// Count of memory read/write command frames received.
    pub memory_transactions: u32,

    events: VecDeque<Vec<u8>>,
    event_sequence: u16,
}

impl FakeState {
    fn push_break_event(&mut self) {
        let mut frame = vec![
            EDBG_SOF,
            (self.event_sequence & 0xff) as u8,
            (self.event_sequence >> 8) as u8,
            SubProtocol::Avr8Generic as u8,
            0x40, // break event
        ];
        frame.extend_from_slice(&self.pc_word.to_le_bytes());
        frame.push(0x01); // program break
        self.events.push_back(frame);
        self.event_sequence = self.event_sequence.wrapping_add(1);
    }

    fn read_slice<'a>(storage: &'a [u8], address: u32, bytes: u32) -> Result<&'a [u8], FailureCode> {
        let start = address as usize;
        let end = start + bytes as usize;
        storage.get(start..end).ok_or(FailureCode::InvalidAddress)
    }

    fn write_slice(storage: &mut [u8], address: u32, data: &[u8]) -> Result<(), FailureCode> {
        let start = address as usize;
        let end = start + data.len();
        storage
            .get_mut(start..end)
            .ok_or(FailureCode::InvalidAddress)?
            .copy_from_slice(data);
        Ok(())
    }

    fn check_page_access(&self, page: u32, address: u32, bytes: u32) -> Result<(), FailureCode> {
        if address % page != 0 || bytes % page != 0 {
            return Err(FailureCode::InvalidAlignment);
        }
        if bytes != page {
            // One page per transaction
            return Err(FailureCode::InvalidSize);
        }
        Ok(())
    }

    fn read_memory(&self, memtype: u8, address: u32, bytes: u32) -> Result<Vec<u8>, FailureCode> {
        match memtype {
            t if t == Memtype::Sram as u8 => {
                if let Some(ocd) = self.ocd_data_register {
                    if address <= ocd && ocd < address + bytes {
                        return Err(FailureCode::InvalidAddress);
                    }
                }
                Self::read_slice(&self.data, address, bytes).map(<[u8]>::to_vec)
            }
            t if t == Memtype::Regfile as u8 => {
                Self::read_slice(&self.data, address, bytes).map(<[u8]>::to_vec)
            }
            t if t == Memtype::Eeprom as u8 => {
                Self::read_slice(&self.eeprom, address, bytes).map(<[u8]>::to_vec)
            }
            t if t == Memtype::EepromPage as u8 => {
                self.check_page_access(self.eeprom_page, address, bytes)?;
                Self::read_slice(&self.eeprom, address, bytes).map(<[u8]>::to_vec)
            }
            t if t == Memtype::FlashPage as u8
                || t == Memtype::Spm as u8
                || t == Memtype::ApplFlash as u8
                || t == Memtype::BootFlash as u8 =>
            {
                self.check_page_access(self.flash_page, address, bytes)?;
                Self::read_slice(&self.flash, address, bytes).map(<[u8]>::to_vec)
            }
            t if t == Memtype::Fuses as u8 => {
                Self::read_slice(&self.fuses, address, bytes).map(<[u8]>::to_vec)
            }
            t if t == Memtype::Lockbits as u8 => Ok(vec![self.lock_byte; bytes as usize]),
            t if t == Memtype::Signature as u8 => {
                Self::read_slice(&self.signature, address, bytes).map(<[u8]>::to_vec)
            }
            _ => Err(FailureCode::InvalidMemtype),
        }
    }

    fn write_memory(&mut self, memtype: u8, address: u32, data: &[u8]) -> Result<(), FailureCode> {
        let bytes = data.len() as u32;

        match memtype {
            t if t == Memtype::Sram as u8 || t == Memtype::Regfile as u8 => {
                Self::write_slice(&mut self.data, address, data)
            }
            t if t == Memtype::Eeprom as u8 => Self::write_slice(&mut self.eeprom, address, data),
            t if t == Memtype::EepromPage as u8 || t == Memtype::EepromAtomic as u8 => {
                self.check_page_access(self.eeprom_page, address, bytes)?;
                Self::write_slice(&mut self.eeprom, address, data)
            }
            t if t == Memtype::FlashPage as u8
                || t == Memtype::Spm as u8
                || t == Memtype::ApplFlash as u8
                || t == Memtype::BootFlash as u8 =>
            {
                self.check_page_access(self.flash_page, address, bytes)?;
                Self::write_slice(&mut self.flash, address, data)
            }
            t if t == Memtype::Fuses as u8 => {
                for (offset, value) in data.iter().enumerate() {
                    self.fuse_writes.push((address as u8 + offset as u8, *value));
                }
                Self::write_slice(&mut self.fuses, address, data)
            }
            _ => Err(FailureCode::InvalidMemtype),
        }
    }
}

pub struct FakeProbe {
    state: Arc<Mutex<FakeState>>,
}

impl FakeProbe {
    /// Model a target from its descriptor.
    pub fn from_descriptor(descriptor: &TargetDescriptor) -> Self {
        let parameters = &descriptor.parameters;

        let mut state = FakeState {
            report_size: 512,
            data: vec![0; DATA_SPACE_SIZE],
            flash: vec![0xFF; parameters.flash_size.unwrap_or(0x8000) as usize],
            eeprom: vec![0xFF; parameters.eeprom_size.unwrap_or(0x400) as usize],
            fuses: [0xFF, 0x99, 0xFF],
            lock_byte: 0xFF,
            signature: descriptor.signature.0,
            flash_page: parameters.flash_page_size.unwrap_or(128),
            eeprom_page: u32::from(parameters.eeprom_page_size.unwrap_or(4)),
            ocd_data_register: parameters
                .ocd_data_register
                .map(|register| register + parameters.mapped_io_start.unwrap_or(0)),
            pc_word: 0,
            running: false,
            physical_activated: false,
            attached: false,
            programming_mode: false,
            isp_active: false,
            software_breakpoints: BTreeSet::new(),
            hardware_breakpoints: BTreeSet::new(),
            remaining_activation_failures: 0,
            activation_failure_code: FailureCode::DwPhyError,
            power_on: true,
            power_cycles: 0,
            fuse_writes: Vec::new(),
            memory_transactions: 0,
            events: VecDeque::new(),
            event_sequence: 0,
        };

        // UPDI parts expose the signature row in the data space.
        if let Some(base) = parameters.signature_segment_start {
            let base = base as usize;
            if base + 3 <= state.data.len() {
                state.data[base..base + 3].copy_from_slice(&state.signature);
            }
        }

        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Shared handle onto the simulated target, for test assertions
    /// and scripted failures.
    pub fn state(&self) -> Arc<Mutex<FakeState>> {
        Arc::clone(&self.state)
    }

    fn respond(sequence: u16, sub_protocol: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![
            EDBG_SOF,
            (sequence & 0xff) as u8,
            (sequence >> 8) as u8,
            sub_protocol,
        ];
        frame.extend_from_slice(payload);
        frame
    }

    fn avr8_response(id: ResponseId, data: &[u8]) -> Vec<u8> {
        let mut payload = vec![id as u8, 0x00];
        payload.extend_from_slice(data);
        payload
    }

    fn avr8_failed(code: FailureCode) -> Vec<u8> {
        vec![ResponseId::Failed as u8, 0x00, code as u8]
    }

    fn handle_avr8(state: &mut FakeState, command: u8, data: &[u8]) -> Vec<u8> {
        let ok = Self::avr8_response(ResponseId::Ok, &[]);

        match command {
            c if c == CommandId::Set as u8 || c == CommandId::Query as u8 => ok,
            c if c == CommandId::Get as u8 => {
                let size = data.get(2).copied().unwrap_or(0) as usize;
                Self::avr8_response(ResponseId::Data, &vec![0u8; size])
            }
            c if c == CommandId::ActivatePhysical as u8 => {
                if state.remaining_activation_failures > 0 {
                    state.remaining_activation_failures -= 1;
                    return Self::avr8_failed(state.activation_failure_code);
                }
                state.physical_activated = true;
                ok
            }
            c if c == CommandId::DeactivatePhysical as u8 => {
                state.physical_activated = false;
                ok
            }
            c if c == CommandId::GetId as u8 => {
                let id = (u32::from(state.signature[0]) << 16)
                    | (u32::from(state.signature[1]) << 8)
                    | u32::from(state.signature[2]);
                Self::avr8_response(ResponseId::Data, &id.to_le_bytes())
            }
            c if c == CommandId::Attach as u8 => {
                state.attached = true;
                state.running = false;
                state.push_break_event();
                ok
            }
            c if c == CommandId::Detach as u8 => {
                state.attached = false;
                ok
            }
            c if c == CommandId::ProgModeEnter as u8 => {
                if !state.physical_activated {
                    return Self::avr8_failed(FailureCode::InvalidPhysicalState);
                }
                state.programming_mode = true;
                ok
            }
            c if c == CommandId::ProgModeLeave as u8 => {
                state.programming_mode = false;
                ok
            }
            c if c == CommandId::DisableDebugWire as u8 => ok,
            c if c == CommandId::Erase as u8 => {
                state.flash.fill(0xFF);
                if data.first() == Some(&0x00) {
                    // Chip erase takes EEPROM with it
                    state.eeprom.fill(0xFF);
                }
                ok
            }
            c if c == CommandId::MemoryRead as u8 => {
                state.memory_transactions += 1;
                let memtype = data[0];
                let address: u32 = data.pread_with(1, LE).unwrap();
                let bytes: u32 = data.pread_with(5, LE).unwrap();

                match state.read_memory(memtype, address, bytes) {
                    Ok(buffer) => Self::avr8_response(ResponseId::Data, &buffer),
                    Err(code) => Self::avr8_failed(code),
                }
            }
            c if c == CommandId::MemoryReadMasked as u8 => {
                state.memory_transactions += 1;
                let memtype = data[0];
                let address: u32 = data.pread_with(1, LE).unwrap();
                let bytes: u32 = data.pread_with(5, LE).unwrap();
                let mask = &data[9..9 + bytes as usize];

                let mut buffer = Vec::with_capacity(bytes as usize);
                for offset in 0..bytes {
                    if mask[offset as usize] == 0 {
                        buffer.push(0x00);
                    } else {
                        // The probe itself skips the OCD data register,
                        // so the per-byte reads bypass that rejection.
                        match state.read_memory(
                            if memtype == Memtype::Sram as u8 {
                                Memtype::Regfile as u8
                            } else {
                                memtype
                            },
                            address + offset,
                            1,
                        ) {
                            Ok(byte) => buffer.push(byte[0]),
                            Err(code) => return Self::avr8_failed(code),
                        }
                    }
                }

                Self::avr8_response(ResponseId::Data, &buffer)
            }
            c if c == CommandId::MemoryWrite as u8 => {
                state.memory_transactions += 1;
                let memtype = data[0];
                let address: u32 = data.pread_with(1, LE).unwrap();
                let bytes: u32 = data.pread_with(5, LE).unwrap();
                let payload = data[10..10 + bytes as usize].to_vec();

                match state.write_memory(memtype, address, &payload) {
                    Ok(()) => ok,
                    Err(code) => Self::avr8_failed(code),
                }
            }
            c if c == CommandId::Reset as u8 => {
                state.pc_word = 0;
                state.running = false;
                state.push_break_event();
                ok
            }
            c if c == CommandId::Stop as u8 => {
                if state.running {
                    state.running = false;
                    state.push_break_event();
                }
                ok
            }
            c if c == CommandId::Run as u8 => {
                if let Some(&breakpoint) = state.software_breakpoints.iter().next() {
                    // Simulation: the target hits the first breakpoint
                    // immediately.
                    state.pc_word = breakpoint / 2;
                    state.running = false;
                    state.push_break_event();
                } else {
                    state.running = true;
                }
                ok
            }
            c if c == CommandId::RunTo as u8 => {
                let word_address: u32 = data.pread_with(0, LE).unwrap();
                state.pc_word = word_address;
                state.running = false;
                state.push_break_event();
                ok
            }
            c if c == CommandId::Step as u8 => {
                state.pc_word += 1;
                state.running = false;
                state.push_break_event();
                ok
            }
            c if c == CommandId::PcRead as u8 => {
                Self::avr8_response(ResponseId::Pc, &state.pc_word.to_le_bytes())
            }
            c if c == CommandId::PcWrite as u8 => {
                state.pc_word = data.pread_with(0, LE).unwrap();
                ok
            }
            c if c == CommandId::SwBreakSet as u8 => {
                for chunk in data.chunks_exact(4) {
                    state
                        .software_breakpoints
                        .insert(chunk.pread_with(0, LE).unwrap());
                }
                ok
            }
            c if c == CommandId::SwBreakClear as u8 => {
                for chunk in data.chunks_exact(4) {
                    let address: u32 = chunk.pread_with(0, LE).unwrap();
                    state.software_breakpoints.remove(&address);
                }
                ok
            }
            c if c == CommandId::SwBreakClearAll as u8 => {
                state.software_breakpoints.clear();
                ok
            }
            c if c == CommandId::HwBreakSet as u8 => {
                for chunk in data.chunks_exact(4) {
                    state
                        .hardware_breakpoints
                        .insert(chunk.pread_with(0, LE).unwrap());
                }
                ok
            }
            c if c == CommandId::HwBreakClear as u8 => {
                for chunk in data.chunks_exact(4) {
                    let address: u32 = chunk.pread_with(0, LE).unwrap();
                    state.hardware_breakpoints.remove(&address);
                }
                ok
            }
            _ => Self::avr8_failed(FailureCode::NotImplemented),
        }
    }

    fn handle_isp(state: &mut FakeState, frame: &[u8]) -> Vec<u8> {
        let command = frame[0];
        let ok = |data: &[u8]| {
            let mut payload = vec![command, 0x00];
            payload.extend_from_slice(data);
            payload
        };

        match command {
            0x10 => {
                state.isp_active = true;
                ok(&[])
            }
            0x11 => {
                state.isp_active = false;
                ok(&[])
            }
            // Read signature: SPI instruction 0x30, byte index at [4]
            0x1B => {
                let index = frame[4] as usize;
                ok(&[state.signature[index.min(2)]])
            }
            // Read fuse: the SPI instruction selects the byte
            0x18 => {
                let byte = match (frame[2], frame[3]) {
                    (0x50, 0x00) => state.fuses[0],
                    (0x58, 0x08) => state.fuses[1],
                    (0x50, 0x08) => state.fuses[2],
                    _ => return vec![command, 0xC0],
                };
                ok(&[byte])
            }
            // Read lock bits
            0x1A => ok(&[state.lock_byte]),
            // Program fuse
            0x17 => {
                let index = match frame[2] {
                    0xA0 => 0u8,
                    0xA8 => 1,
                    0xA4 => 2,
                    _ => return vec![command, 0xC0],
                };
                let value = frame[4];
                state.fuse_writes.push((index, value));
                state.fuses[index as usize] = value;
                ok(&[])
            }
            _ => vec![command, 0xC0],
        }
    }
}

impl WireTransport for FakeProbe {
    fn send_frame(&mut self, frame: &[u8]) -> Result<Vec<u8>, TransportError> {
        let mut state = self.state.lock().unwrap();

        if frame.len() < 7 || frame[0] != EDBG_SOF {
            return Err(TransportError::Io("malformed EDBG frame".into()));
        }

        let sequence: u16 = frame.pread_with(2, LE).unwrap();
        let sub_protocol = frame[4];

        let payload = match sub_protocol {
            s if s == SubProtocol::Avr8Generic as u8 => {
                Self::handle_avr8(&mut state, frame[5], &frame[7..])
            }
            s if s == SubProtocol::AvrIsp as u8 => Self::handle_isp(&mut state, &frame[5..]),
            _ => vec![0xA0, 0x00, FailureCode::NotImplemented as u8],
        };

        Ok(Self::respond(sequence, sub_protocol, &payload))
    }

    fn poll_event(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        Ok(self.state.lock().unwrap().events.pop_front())
    }

    fn report_size(&self) -> usize {
        self.state.lock().unwrap().report_size
    }

    fn set_target_power(&mut self, on: bool) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if on && !state.power_on {
            state.power_cycles += 1;
        }
        state.power_on = on;
        Ok(())
    }
}
