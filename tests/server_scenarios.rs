//! End-to-end scenarios: a GDB client speaking RSP over a real socket,
//! through the controller, down to the simulated probe.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use avr_gdb_server::controller::{EventBus, TargetController, TargetControllerService};
use avr_gdb_server::gdb_server::{GdbServer, WakeHandle};
use avr_gdb_server::probe::edbg::EdbgAvr8Interface;
use avr_gdb_server::probe::fake::{FakeProbe, FakeState};
use avr_gdb_server::target::avr8::{Avr8, Avr8Config};
use avr_gdb_server::target::provider::atmega328p;
use avr_gdb_server::target::{MemoryType, PhysicalInterface};

/// A minimal RSP client.
struct Client {
    stream: TcpStream,
}

impl Client {
    fn connect(address: SocketAddr) -> Self {
        let stream = TcpStream::connect(address).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        Self { stream }
    }

    fn send_packet(&mut self, payload: &[u8]) {
        let mut escaped = Vec::with_capacity(payload.len());
        for &byte in payload {
            if matches!(byte, b'$' | b'#' | b'}' | b'*') {
                escaped.push(b'}');
                escaped.push(byte ^ 0x20);
            } else {
                escaped.push(byte);
            }
        }

        let checksum = escaped
            .iter()
            .fold(0u8, |sum, byte| sum.wrapping_add(*byte));

        let mut frame = vec![b'$'];
        frame.extend_from_slice(&escaped);
        frame.push(b'#');
        frame.extend_from_slice(format!("{checksum:02x}").as_bytes());

        self.stream.write_all(&frame).unwrap();

        // The server acks every valid packet
        assert_eq!(self.read_byte(), b'+');
    }

    fn send_interrupt(&mut self) {
        self.stream.write_all(&[0x03]).unwrap();
    }

    fn read_byte(&mut self) -> u8 {
        let mut byte = [0u8; 1];
        self.stream.read_exact(&mut byte).unwrap();
        byte[0]
    }

    fn recv_reply(&mut self) -> Vec<u8> {
        // Skip to the packet start
        loop {
            if self.read_byte() == b'$' {
                break;
            }
        }

        let mut body = Vec::new();
        loop {
            match self.read_byte() {
                b'#' => break,
                byte => body.push(byte),
            }
        }

        // Consume the checksum digits and ack
        let _ = (self.read_byte(), self.read_byte());
        self.stream.write_all(&[b'+']).unwrap();

        // Undo escaping
        let mut payload = Vec::with_capacity(body.len());
        let mut index = 0;
        while index < body.len() {
            if body[index] == b'}' {
                payload.push(body[index + 1] ^ 0x20);
                index += 2;
            } else {
                payload.push(body[index]);
                index += 1;
            }
        }

        payload
    }

    fn transact(&mut self, payload: &[u8]) -> Vec<u8> {
        self.send_packet(payload);
        self.recv_reply()
    }
}

fn start_pipeline() -> (Client, Arc<Mutex<FakeState>>, TargetControllerService) {
    let descriptor = Arc::new(atmega328p());
    let probe = FakeProbe::from_descriptor(&descriptor);
    let probe_state = probe.state();

    let config = Avr8Config {
        physical_interface: PhysicalInterface::DebugWire,
        ..Avr8Config::default()
    };

    let interface = EdbgAvr8Interface::new(
        Box::new(probe),
        config.clone(),
        descriptor.family,
        descriptor.parameters.clone(),
    )
    .unwrap();
    let target = Avr8::new(Arc::clone(&descriptor), interface, config, true);

    let events = Arc::new(EventBus::new());
    let (controller, queue) = TargetController::new(target, Arc::clone(&events));
    controller.spawn();

    let service = TargetControllerService::new(queue);
    service.resume().unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();

    let server = GdbServer::new(service.clone(), events, address.to_string(), false);
    thread::spawn(move || {
        let _ = server.serve_listener(listener, WakeHandle::new());
    });

    (Client::connect(address), probe_state, service)
}

#[test]
fn supported_query_announces_features() {
    let (mut client, _state, _service) = start_pipeline();

    let reply = client.transact(b"qSupported:multiprocess+;xmlRegisters=i386");
    let reply = String::from_utf8(reply).unwrap();

    assert!(reply.contains("PacketSize="));
    assert!(reply.contains("qXfer:features:read+"));
    assert!(reply.contains("swbreak+"));
    assert!(reply.contains("hwbreak+"));
}

#[test]
fn target_description_xml_is_served() {
    let (mut client, _state, _service) = start_pipeline();

    let reply = client.transact(b"qXfer:features:read:target.xml:0,4000");
    assert_eq!(reply[0], b'l');

    let xml = String::from_utf8(reply[1..].to_vec()).unwrap();
    assert!(xml.contains("org.gnu.gdb.avr.cpu"));
    assert!(xml.contains("<reg name=\"r31\""));
    assert!(xml.contains("<reg name=\"PC\" bitsize=\"32\""));
}

#[test]
fn unknown_packets_get_the_empty_response() {
    let (mut client, _state, _service) = start_pipeline();

    assert_eq!(client.transact(b"qTStatus"), b"");
    assert_eq!(client.transact(b"Hg0"), b"OK");
    assert_eq!(client.transact(b"?"), b"S05");
}

#[test]
fn read_ram_over_rsp() {
    let (mut client, state, _service) = start_pipeline();

    {
        let mut state = state.lock().unwrap();
        for offset in 0..16usize {
            state.data[0x100 + offset] = offset as u8 * 3;
        }
    }

    // SRAM lives at GDB offset 0x800000
    let reply = client.transact(b"m800100,10");
    let expected: String = (0..16u8).map(|b| format!("{:02x}", b * 3)).collect();
    assert_eq!(String::from_utf8(reply).unwrap(), expected);
}

#[test]
fn write_one_eeprom_byte_over_rsp() {
    let (mut client, state, _service) = start_pipeline();

    // EEPROM addresses are client-relative at GDB offset 0x810000
    assert_eq!(client.transact(b"M810000,1:ab"), b"OK");
    assert_eq!(state.lock().unwrap().eeprom[0], 0xAB);
}

#[test]
fn writing_flash_through_m_packets_is_rejected() {
    let (mut client, _state, _service) = start_pipeline();

    assert_eq!(client.transact(b"M100,2:aabb"), b"E01");
}

#[test]
fn read_all_registers_over_rsp() {
    let (mut client, state, _service) = start_pipeline();

    {
        let mut state = state.lock().unwrap();
        state.data[17] = 0x42; // r17
        state.data[0x5D] = 0x34;
        state.data[0x5E] = 0x12;
        state.data[0x5F] = 0x80;
    }

    let reply = client.transact(b"g");
    // 32 x r + SREG + 2-byte SP + 4-byte PC = 39 bytes
    assert_eq!(reply.len(), 78);

    let hex = String::from_utf8(reply).unwrap();
    assert_eq!(&hex[17 * 2..17 * 2 + 2], "42");
    assert_eq!(&hex[32 * 2..33 * 2], "80"); // SREG
    assert_eq!(&hex[33 * 2..35 * 2], "3412"); // SP, LSB first
}

#[test]
fn write_one_register_over_rsp() {
    let (mut client, state, _service) = start_pipeline();

    // P21=SP (GDB register 0x21 = 33), value LSB first
    assert_eq!(client.transact(b"P21=cd01"), b"OK");

    let state = state.lock().unwrap();
    assert_eq!(state.data[0x5D], 0xCD);
    assert_eq!(state.data[0x5E], 0x01);
}

#[test]
fn breakpoint_and_continue_reports_sigtrap() {
    let (mut client, state, _service) = start_pipeline();

    assert_eq!(client.transact(b"Z0,200,2"), b"OK");
    assert!(state
        .lock()
        .unwrap()
        .software_breakpoints
        .contains(&0x200));

    // The simulated target hits the breakpoint immediately
    assert_eq!(client.transact(b"c"), b"S05");

    assert_eq!(client.transact(b"z0,200,2"), b"OK");
    assert!(state.lock().unwrap().software_breakpoints.is_empty());
}

#[test]
fn step_reports_sigtrap() {
    let (mut client, _state, _service) = start_pipeline();

    assert_eq!(client.transact(b"s"), b"S05");
    assert_eq!(client.transact(b"vCont;s"), b"S05");
}

#[test]
fn interrupt_while_running_reports_sigint() {
    let (mut client, state, _service) = start_pipeline();

    // No breakpoints: the target keeps running
    client.send_packet(b"c");
    thread::sleep(Duration::from_millis(100));
    assert!(state.lock().unwrap().running);

    client.send_interrupt();
    assert_eq!(client.recv_reply(), b"S02");
    assert!(!state.lock().unwrap().running);
}

#[test]
fn flash_a_512_byte_image() {
    let (mut client, state, _service) = start_pipeline();

    let image: Vec<u8> = (0..512u32).map(|value| (value & 0xFF) as u8).collect();

    assert_eq!(client.transact(b"vFlashErase:0,200"), b"OK");

    let mut write_packet = b"vFlashWrite:0:".to_vec();
    write_packet.extend_from_slice(&image);
    assert_eq!(client.transact(&write_packet), b"OK");

    assert_eq!(client.transact(b"vFlashDone"), b"OK");

    let state = state.lock().unwrap();
    assert_eq!(&state.flash[..512], &image[..]);
    assert_eq!(state.flash[512], 0xFF);
    // Programming mode was entered and left again
    assert!(!state.programming_mode);
}

#[test]
fn monitor_commands() {
    let (mut client, _state, _service) = start_pipeline();

    let version = client.transact(&monitor_packet(b"version"));
    let version = String::from_utf8(hex::decode(version).unwrap()).unwrap();
    assert!(version.contains("avr-gdb-server"));

    let machine = client.transact(&monitor_packet(b"version-machine"));
    let machine = String::from_utf8(hex::decode(machine).unwrap()).unwrap();
    let json: serde_json::Value = serde_json::from_str(&machine).unwrap();
    assert!(json["version"].is_string());

    let reset = client.transact(&monitor_packet(b"reset"));
    let reset = String::from_utf8(hex::decode(reset).unwrap()).unwrap();
    assert!(reset.contains("reset complete"));

    // Unrecognised monitor commands get the empty response
    assert_eq!(client.transact(&monitor_packet(b"juggle")), b"");
}

#[test]
fn detach_ends_the_session() {
    let (mut client, _state, service) = start_pipeline();

    assert_eq!(client.transact(b"D"), b"OK");

    // The controller stays in service for the next client
    thread::sleep(Duration::from_millis(50));
    assert!(service.is_in_service());
}

#[test]
fn programming_mode_gates_debug_commands() {
    let (_client, _state, service) = start_pipeline();

    service.enable_programming_mode().unwrap();

    assert!(service.continue_execution(None, None).is_err());
    assert!(service
        .read_memory(MemoryType::Ram, 0x100, 4, vec![])
        .is_err());
    // EEPROM stays reachable for the preserve-and-restore flow
    assert!(service
        .read_memory(MemoryType::Eeprom, 0, 4, vec![])
        .is_ok());

    service.disable_programming_mode().unwrap();
    assert!(service
        .read_memory(MemoryType::Ram, 0x100, 4, vec![])
        .is_ok());
}

#[test]
fn suspended_controller_rejects_target_commands() {
    let (_client, _state, service) = start_pipeline();

    service.suspend().unwrap();
    assert!(service.stop().is_err());
    assert!(!service.is_in_service());

    service.resume().unwrap();
    assert!(service.stop().is_ok());
}

fn monitor_packet(line: &[u8]) -> Vec<u8> {
    let mut packet = b"qRcmd,".to_vec();
    packet.extend_from_slice(hex::encode(line).as_bytes());
    packet
}
