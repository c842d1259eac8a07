//! Typed parsing of decoded RSP packet payloads.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::char,
    combinator::{map, opt, rest, value},
    sequence::{preceded, separated_pair},
    IResult,
};

use crate::target::BreakpointKind;

use super::packet::{decode_hex, RawPacket, INTERRUPT_BYTE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandPacket {
    /// `qSupported` - feature negotiation
    Supported,
    /// `qAttached`
    Attached,
    /// `qXfer:features:read:<annex>:<offset>,<length>`
    FeaturesRead {
        annex: Vec<u8>,
        offset: u32,
        length: u32,
    },
    /// `qRcmd,<hex>` - monitor command, hex decoded
    Monitor(Vec<u8>),
    /// `?`
    HaltReason,
    /// `g`
    ReadRegisters,
    /// `G<hex>` - raw register image, already hex decoded
    WriteRegisters(Vec<u8>),
    /// `p<n>`
    ReadRegister(u16),
    /// `P<n>=<hex>` - value bytes in wire (LSB first) order
    WriteRegister { number: u16, value: Vec<u8> },
    /// `m<addr>,<len>`
    ReadMemory { address: u32, length: u32 },
    /// `M<addr>,<len>:<hex>`
    WriteMemory {
        address: u32,
        length: u32,
        data: Vec<u8>,
    },
    /// `vFlashErase:<addr>,<len>`
    FlashErase { address: u32, length: u32 },
    /// `vFlashWrite:<addr>:<binary>`
    FlashWrite { address: u32, data: Vec<u8> },
    /// `vFlashDone`
    FlashDone,
    /// `Z<type>,<addr>,<kind>`
    InsertBreakpoint { kind: BreakpointKind, address: u32 },
    /// `z<type>,<addr>,<kind>`
    RemoveBreakpoint { kind: BreakpointKind, address: u32 },
    /// `c[addr]`
    Continue { address: Option<u32> },
    /// `s[addr]`
    Step { address: Option<u32> },
    /// `vCont?`
    VContQuery,
    /// `vCont;<action>...` - only the first action is honoured
    VCont { step: bool },
    /// `D`
    Detach,
    /// `H<op><thread>` - acknowledged, not acted upon
    SetThread,
    /// The 0x03 interrupt byte
    InterruptExecution,
    /// Anything we do not implement; answered with the empty response
    Unsupported,
}

pub fn parse_packet(packet: &RawPacket) -> CommandPacket {
    if packet.data == [INTERRUPT_BYTE] {
        return CommandPacket::InterruptExecution;
    }

    match command_packet(&packet.data) {
        Ok((_, command)) => command,
        Err(_) => CommandPacket::Unsupported,
    }
}

fn command_packet(input: &[u8]) -> IResult<&[u8], CommandPacket> {
    alt((
        alt((
            supported,
            attached,
            features_read,
            monitor,
            halt_reason,
            read_registers,
            write_registers,
            read_register,
            write_register,
            read_memory,
            write_memory,
        )),
        alt((
            flash_erase,
            flash_write,
            flash_done,
            insert_breakpoint,
            remove_breakpoint,
            vcont_query,
            vcont,
            continue_packet,
            step_packet,
            detach,
            set_thread,
        )),
    ))(input)
}

fn is_hex_digit(byte: u8) -> bool {
    byte.is_ascii_hexdigit()
}

fn hex_u32(input: &[u8]) -> IResult<&[u8], u32> {
    let (input, digits) = take_while1(is_hex_digit)(input)?;
    let text = std::str::from_utf8(digits).expect("hex digits are ASCII");
    match u32::from_str_radix(text, 16) {
        Ok(number) => Ok((input, number)),
        Err(_) => Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::TooLarge,
        ))),
    }
}

fn hex_u16(input: &[u8]) -> IResult<&[u8], u16> {
    let (input, number) = hex_u32(input)?;
    if number > u16::MAX as u32 {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::TooLarge,
        )));
    }
    Ok((input, number as u16))
}

fn hex_data(input: &[u8]) -> IResult<&[u8], Vec<u8>> {
    let (input, digits) = rest(input)?;
    match decode_hex(digits) {
        Ok(data) => Ok((input, data)),
        Err(_) => Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::HexDigit,
        ))),
    }
}

fn supported(input: &[u8]) -> IResult<&[u8], CommandPacket> {
    let (input, _) = tag("qSupported")(input)?;
    let _ = input;
    Ok((&[], CommandPacket::Supported))
}

fn attached(input: &[u8]) -> IResult<&[u8], CommandPacket> {
    let (input, _) = tag("qAttached")(input)?;
    let _ = input;
    Ok((&[], CommandPacket::Attached))
}

fn features_read(input: &[u8]) -> IResult<&[u8], CommandPacket> {
    let (input, _) = tag("qXfer:features:read:")(input)?;
    let (input, annex) = take_while1(|byte| byte != b':')(input)?;
    let (input, _) = char(':')(input)?;
    let (input, (offset, length)) = separated_pair(hex_u32, char(','), hex_u32)(input)?;

    Ok((
        input,
        CommandPacket::FeaturesRead {
            annex: annex.to_vec(),
            offset,
            length,
        },
    ))
}

fn monitor(input: &[u8]) -> IResult<&[u8], CommandPacket> {
    let (input, _) = tag("qRcmd,")(input)?;
    let (input, line) = hex_data(input)?;
    Ok((input, CommandPacket::Monitor(line)))
}

fn halt_reason(input: &[u8]) -> IResult<&[u8], CommandPacket> {
    value(CommandPacket::HaltReason, char('?'))(input)
}

fn read_registers(input: &[u8]) -> IResult<&[u8], CommandPacket> {
    let (input, _) = char('g')(input)?;
    if !input.is_empty() {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Eof,
        )));
    }
    Ok((input, CommandPacket::ReadRegisters))
}

fn write_registers(input: &[u8]) -> IResult<&[u8], CommandPacket> {
    let (input, _) = char('G')(input)?;
    map(hex_data, CommandPacket::WriteRegisters)(input)
}

fn read_register(input: &[u8]) -> IResult<&[u8], CommandPacket> {
    let (input, _) = char('p')(input)?;
    map(hex_u16, CommandPacket::ReadRegister)(input)
}

fn write_register(input: &[u8]) -> IResult<&[u8], CommandPacket> {
    let (input, _) = char('P')(input)?;
    let (input, number) = hex_u16(input)?;
    let (input, _) = char('=')(input)?;
    let (input, bytes) = hex_data(input)?;

    Ok((
        input,
        CommandPacket::WriteRegister {
            number,
            value: bytes,
        },
    ))
}

fn read_memory(input: &[u8]) -> IResult<&[u8], CommandPacket> {
    let (input, _) = char('m')(input)?;
    let (input, (address, length)) = separated_pair(hex_u32, char(','), hex_u32)(input)?;

    Ok((input, CommandPacket::ReadMemory { address, length }))
}

fn write_memory(input: &[u8]) -> IResult<&[u8], CommandPacket> {
    let (input, _) = char('M')(input)?;
    let (input, (address, length)) = separated_pair(hex_u32, char(','), hex_u32)(input)?;
    let (input, _) = char(':')(input)?;
    let (input, data) = hex_data(input)?;

    Ok((
        input,
        CommandPacket::WriteMemory {
            address,
            length,
            data,
        },
    ))
}

fn flash_erase(input: &[u8]) -> IResult<&[u8], CommandPacket> {
    let (input, _) = tag("vFlashErase:")(input)?;
    let (input, (address, length)) = separated_pair(hex_u32, char(','), hex_u32)(input)?;

    Ok((input, CommandPacket::FlashErase { address, length }))
}

fn flash_write(input: &[u8]) -> IResult<&[u8], CommandPacket> {
    let (input, _) = tag("vFlashWrite:")(input)?;
    let (input, address) = hex_u32(input)?;
    let (input, _) = char(':')(input)?;
    let (input, data) = rest(input)?;

    Ok((
        input,
        CommandPacket::FlashWrite {
            address,
            data: data.to_vec(),
        },
    ))
}

fn flash_done(input: &[u8]) -> IResult<&[u8], CommandPacket> {
    value(CommandPacket::FlashDone, tag("vFlashDone"))(input)
}

fn breakpoint_kind(input: &[u8]) -> IResult<&[u8], BreakpointKind> {
    alt((
        value(BreakpointKind::Software, char('0')),
        value(BreakpointKind::Hardware, char('1')),
    ))(input)
}

fn insert_breakpoint(input: &[u8]) -> IResult<&[u8], CommandPacket> {
    let (input, _) = char('Z')(input)?;
    let (input, kind) = breakpoint_kind(input)?;
    let (input, _) = char(',')(input)?;
    let (input, address) = hex_u32(input)?;
    let (input, _) = char(',')(input)?;
    let (input, _kind_field) = hex_u32(input)?;

    Ok((input, CommandPacket::InsertBreakpoint { kind, address }))
}

fn remove_breakpoint(input: &[u8]) -> IResult<&[u8], CommandPacket> {
    let (input, _) = char('z')(input)?;
    let (input, kind) = breakpoint_kind(input)?;
    let (input, _) = char(',')(input)?;
    let (input, address) = hex_u32(input)?;
    let (input, _) = char(',')(input)?;
    let (input, _kind_field) = hex_u32(input)?;

    Ok((input, CommandPacket::RemoveBreakpoint { kind, address }))
}

fn continue_packet(input: &[u8]) -> IResult<&[u8], CommandPacket> {
    let (input, _) = char('c')(input)?;
    let (input, address) = opt(hex_u32)(input)?;

    Ok((input, CommandPacket::Continue { address }))
}

fn step_packet(input: &[u8]) -> IResult<&[u8], CommandPacket> {
    let (input, _) = char('s')(input)?;
    let (input, address) = opt(hex_u32)(input)?;

    Ok((input, CommandPacket::Step { address }))
}

fn vcont_query(input: &[u8]) -> IResult<&[u8], CommandPacket> {
    value(CommandPacket::VContQuery, tag("vCont?"))(input)
}

fn vcont(input: &[u8]) -> IResult<&[u8], CommandPacket> {
    let (input, action) =
        preceded(tag("vCont;"), alt((char('c'), char('s'), char('C'), char('S'))))(input)?;

    Ok((
        input,
        CommandPacket::VCont {
            step: matches!(action, 's' | 'S'),
        },
    ))
}

fn detach(input: &[u8]) -> IResult<&[u8], CommandPacket> {
    let (input, _) = char('D')(input)?;
    Ok((input, CommandPacket::Detach))
}

fn set_thread(input: &[u8]) -> IResult<&[u8], CommandPacket> {
    let (input, _) = char('H')(input)?;
    let _ = input;
    Ok((&[], CommandPacket::SetThread))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(data: &[u8]) -> CommandPacket {
        parse_packet(&RawPacket::new(data.to_vec()))
    }

    #[test]
    fn parse_simple_packets() {
        let cases: &[(&[u8], CommandPacket)] = &[
            (b"?", CommandPacket::HaltReason),
            (b"g", CommandPacket::ReadRegisters),
            (b"D", CommandPacket::Detach),
            (b"qSupported:multiprocess+", CommandPacket::Supported),
            (b"qAttached", CommandPacket::Attached),
            (b"vCont?", CommandPacket::VContQuery),
            (b"vCont;c", CommandPacket::VCont { step: false }),
            (b"vCont;s:1", CommandPacket::VCont { step: true }),
            (b"vFlashDone", CommandPacket::FlashDone),
            (b"Hg0", CommandPacket::SetThread),
            (b"c", CommandPacket::Continue { address: None }),
            (b"s", CommandPacket::Step { address: None }),
            (b"c200", CommandPacket::Continue { address: Some(0x200) }),
        ];

        for (input, expected) in cases {
            assert_eq!(parse(input), *expected, "{}", String::from_utf8_lossy(input));
        }
    }

    #[test]
    fn parse_read_memory() {
        assert_eq!(
            parse(b"m100,10"),
            CommandPacket::ReadMemory {
                address: 0x100,
                length: 0x10,
            }
        );
    }

    #[test]
    fn parse_write_memory() {
        assert_eq!(
            parse(b"M0,1:ab"),
            CommandPacket::WriteMemory {
                address: 0,
                length: 1,
                data: vec![0xAB],
            }
        );
    }

    #[test]
    fn parse_registers() {
        assert_eq!(parse(b"p22"), CommandPacket::ReadRegister(0x22));
        assert_eq!(
            parse(b"P21=cd01"),
            CommandPacket::WriteRegister {
                number: 0x21,
                value: vec![0xCD, 0x01],
            }
        );
    }

    #[test]
    fn parse_breakpoints() {
        assert_eq!(
            parse(b"Z0,200,2"),
            CommandPacket::InsertBreakpoint {
                kind: BreakpointKind::Software,
                address: 0x200,
            }
        );
        assert_eq!(
            parse(b"z1,274,0"),
            CommandPacket::RemoveBreakpoint {
                kind: BreakpointKind::Hardware,
                address: 0x274,
            }
        );
        // Watchpoints are not implemented
        assert_eq!(parse(b"Z2,100,2"), CommandPacket::Unsupported);
    }

    #[test]
    fn parse_monitor_command() {
        assert_eq!(
            parse(b"qRcmd,7265736574"),
            CommandPacket::Monitor(b"reset".to_vec())
        );
    }

    #[test]
    fn parse_features_read() {
        assert_eq!(
            parse(b"qXfer:features:read:target.xml:0,ffb"),
            CommandPacket::FeaturesRead {
                annex: b"target.xml".to_vec(),
                offset: 0,
                length: 0xffb,
            }
        );
    }

    #[test]
    fn parse_flash_packets() {
        assert_eq!(
            parse(b"vFlashErase:0,200"),
            CommandPacket::FlashErase {
                address: 0,
                length: 0x200,
            }
        );
        assert_eq!(
            parse(b"vFlashWrite:80:\x01\x02\x03"),
            CommandPacket::FlashWrite {
                address: 0x80,
                data: vec![1, 2, 3],
            }
        );
    }

    #[test]
    fn parse_interrupt() {
        assert_eq!(parse(&[0x03]), CommandPacket::InterruptExecution);
    }

    #[test]
    fn unknown_packets_are_unsupported() {
        assert_eq!(parse(b"qTStatus"), CommandPacket::Unsupported);
        assert_eq!(parse(b"!"), CommandPacket::Unsupported);
    }
}
