//! AVRISP sub-protocol interface.
//!
//! The ISP (SPI) side channel is only used for fuse inspection and
//! programming when a debugWire session cannot be brought up. Commands
//! carry the raw four-byte SPI instruction the probe should clock out,
//! plus the poll index at which the interesting byte appears in the
//! SPI return stream.

use crate::error::Error;
use crate::target::{FuseType, IspParameters, Signature};

use super::EdbgSession;

// AVRISP command ids
const CMD_ENTER_PROGMODE_ISP: u8 = 0x10;
const CMD_LEAVE_PROGMODE_ISP: u8 = 0x11;
const CMD_PROGRAM_FUSE_ISP: u8 = 0x17;
const CMD_READ_FUSE_ISP: u8 = 0x18;
const CMD_READ_LOCK_ISP: u8 = 0x1A;
const CMD_READ_SIGNATURE_ISP: u8 = 0x1B;

const STATUS_CMD_OK: u8 = 0x00;

/// A borrow of the probe session, speaking the AVRISP sub-protocol.
pub struct EdbgAvrIspInterface<'a> {
    session: &'a mut EdbgSession,
    parameters: IspParameters,
}

impl<'a> EdbgAvrIspInterface<'a> {
    pub(super) fn new(session: &'a mut EdbgSession, parameters: IspParameters) -> Self {
        Self {
            session,
            parameters,
        }
    }

    fn transact(&mut self, frame: &[u8], what: &str) -> Result<Vec<u8>, Error> {
        let response = self.session.send_isp(frame)?;

        if response.first() != Some(&frame[0]) {
            return Err(Error::protocol(
                format!("unexpected command echo in ISP {what} response"),
                None,
            ));
        }

        if response.get(1) != Some(&STATUS_CMD_OK) {
            return Err(Error::protocol(format!("ISP {what} command failed"), None));
        }

        Ok(response[2..].to_vec())
    }

    /// Enable programming mode on the probe, activating the physical
    /// SPI between probe and target.
    pub fn activate(&mut self) -> Result<(), Error> {
        let p = &self.parameters;
        let frame = [
            CMD_ENTER_PROGMODE_ISP,
            p.enter_prog_mode_timeout,
            p.enter_prog_mode_stab_delay,
            p.enter_prog_mode_cmd_exe_delay,
            p.enter_prog_mode_sync_loops,
            p.enter_prog_mode_byte_delay,
            p.enter_prog_mode_poll_value,
            p.enter_prog_mode_poll_index,
            // The SPI "programming enable" instruction
            0xAC,
            0x53,
            0x00,
            0x00,
        ];

        self.transact(&frame, "enter programming mode")?;
        Ok(())
    }

    pub fn deactivate(&mut self) -> Result<(), Error> {
        let frame = [
            CMD_LEAVE_PROGMODE_ISP,
            self.parameters.leave_prog_mode_pre_delay,
            self.parameters.leave_prog_mode_post_delay,
        ];

        self.transact(&frame, "leave programming mode")?;
        Ok(())
    }

    /// Read the three-byte device signature, one byte per command.
    pub fn get_device_id(&mut self) -> Result<Signature, Error> {
        let mut signature = [0u8; 3];
        for (index, byte) in signature.iter_mut().enumerate() {
            *byte = self.read_signature_byte(index as u8)?;
        }

        Ok(Signature(signature))
    }

    fn read_signature_byte(&mut self, address: u8) -> Result<u8, Error> {
        let frame = [
            CMD_READ_SIGNATURE_ISP,
            self.parameters.read_signature_poll_index,
            0x30,
            0x00,
            address,
            0x00,
        ];

        let data = self.transact(&frame, "read signature")?;
        data.first()
            .copied()
            .ok_or_else(|| Error::protocol("empty ISP read signature response", None))
    }

    pub fn read_fuse(&mut self, fuse_type: FuseType) -> Result<u8, Error> {
        let spi: [u8; 4] = match fuse_type {
            FuseType::Low => [0x50, 0x00, 0x00, 0x00],
            FuseType::High => [0x58, 0x08, 0x00, 0x00],
            FuseType::Extended => [0x50, 0x08, 0x00, 0x00],
        };

        let frame = [
            CMD_READ_FUSE_ISP,
            self.parameters.read_fuse_poll_index,
            spi[0],
            spi[1],
            spi[2],
            spi[3],
        ];

        let data = self.transact(&frame, "read fuse")?;
        data.first()
            .copied()
            .ok_or_else(|| Error::protocol("empty ISP read fuse response", None))
    }

    pub fn read_lock_byte(&mut self) -> Result<u8, Error> {
        let frame = [
            CMD_READ_LOCK_ISP,
            self.parameters.read_lock_poll_index,
            0x58,
            0x00,
            0x00,
            0x00,
        ];

        let data = self.transact(&frame, "read lock bits")?;
        data.first()
            .copied()
            .ok_or_else(|| Error::protocol("empty ISP read lock bits response", None))
    }

    pub fn program_fuse(&mut self, fuse_type: FuseType, value: u8) -> Result<(), Error> {
        let instruction: u8 = match fuse_type {
            FuseType::Low => 0xA0,
            FuseType::High => 0xA8,
            FuseType::Extended => 0xA4,
        };

        let frame = [CMD_PROGRAM_FUSE_ISP, 0xAC, instruction, 0x00, value];
        self.transact(&frame, "program fuse")?;
        Ok(())
    }
}
