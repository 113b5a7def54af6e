//! # PEMF Device Simulator
//!
//! Simulates the serial side of a PEMF device closely enough to drive the
//! bridge without hardware: it echoes every echoed byte, answers the identify
//! request with its signature and serial number, and keeps whatever the host
//! stores (name field, program size, rows, running row).
//!
//! Faults can be injected to exercise the bridge's failure paths.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::link::{Connection, Connector, LinkError};
use crate::registry::{
    DeviceType, PayloadLength, CMD_IDENTIFY, CMD_NAME, CMD_PROGRAM, CMD_RUN, CMD_WRITE_ROW,
};
use crate::trace::Operation;

// Receive-side parser state.
#[derive(Debug, Clone, PartialEq)]
enum RxState {
    Command,
    Fixed { command: u8, buf: Vec<u8>, remaining: usize },
    Raw { command: u8, terminator: u8, buf: Vec<u8> },
}

/// Faults to inject into the device's responses.
#[derive(Debug, Clone, Default)]
pub struct Faults {
    // Zero-based index of the write whose echo is corrupted.
    pub corrupt_echo_at: Option<usize>,
    // Number of writes answered before the device goes quiet.
    pub silent_after: Option<usize>,
    // Identify response byte to send instead of the variant's signature.
    pub signature_override: Option<u8>,
}

/// State of one simulated device.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    pub device_type: DeviceType,
    pub serial_number: String,
    pub faults: Faults,
    // --- What the host has stored ---
    pub name: Vec<u8>,
    pub program_size: Option<u32>,
    pub rows: Vec<Vec<u8>>,
    // Every run argument received, in order.
    pub runs: Vec<u32>,
    // --- Internal state ---
    state: RxState,
    writes_seen: usize,
}

impl SimulatedDevice {
    /// Creates a device of the given variant. The serial number is padded or
    /// cut to the variant's serial length.
    pub fn new(device_type: DeviceType, serial_number: &str) -> Self {
        let len = device_type.profile().serial_len;
        let mut serial: String = serial_number.chars().take(len).collect();
        while serial.len() < len {
            serial.push('0');
        }
        Self {
            device_type,
            serial_number: serial,
            faults: Faults::default(),
            name: Vec::new(),
            program_size: None,
            rows: Vec::new(),
            runs: Vec::new(),
            state: RxState::Command,
            writes_seen: 0,
        }
    }

    pub fn with_faults(mut self, faults: Faults) -> Self {
        self.faults = faults;
        self
    }

    /// The row the device is currently playing.
    pub fn running_row(&self) -> Option<u32> {
        self.runs.last().copied()
    }

    /// Processes one byte from the host and returns the device's response.
    pub fn receive(&mut self, byte: u8) -> Vec<u8> {
        let write_index = self.writes_seen;
        self.writes_seen += 1;
        if self.faults.silent_after.is_some_and(|n| write_index >= n) {
            return Vec::new();
        }

        let (echoed, mut reply) = self.parse(byte);
        let mut response = Vec::new();
        if echoed {
            let corrupt = self.faults.corrupt_echo_at == Some(write_index);
            response.push(if corrupt { byte ^ 0xFF } else { byte });
        }
        response.append(&mut reply);
        response
    }

    // Returns whether the byte is echoed, plus any reply that follows the echo.
    fn parse(&mut self, byte: u8) -> (bool, Vec<u8>) {
        match std::mem::replace(&mut self.state, RxState::Command) {
            RxState::Command => {
                let commands = self.device_type.profile().commands;
                match commands.get(byte).map(|spec| spec.payload) {
                    Some(PayloadLength::Fixed(0)) | None => {}
                    Some(PayloadLength::Fixed(n)) => {
                        self.state = RxState::Fixed {
                            command: byte,
                            buf: Vec::with_capacity(n),
                            remaining: n,
                        };
                    }
                    Some(PayloadLength::UntilTerminator(terminator)) => {
                        self.state = RxState::Raw {
                            command: byte,
                            terminator,
                            buf: Vec::new(),
                        };
                    }
                }
                (true, Vec::new())
            }
            RxState::Fixed {
                command,
                mut buf,
                remaining,
            } => {
                buf.push(byte);
                if remaining > 1 {
                    self.state = RxState::Fixed {
                        command,
                        buf,
                        remaining: remaining - 1,
                    };
                } else {
                    self.complete(command, buf);
                }
                (true, Vec::new())
            }
            RxState::Raw {
                command,
                terminator,
                mut buf,
            } => {
                if byte != terminator {
                    buf.push(byte);
                    self.state = RxState::Raw {
                        command,
                        terminator,
                        buf,
                    };
                    return (false, Vec::new());
                }
                (true, self.complete(command, buf))
            }
        }
    }

    // Applies a fully received command; returns the reply, if any.
    fn complete(&mut self, command: u8, payload: Vec<u8>) -> Vec<u8> {
        match command {
            CMD_NAME => self.name = payload,
            CMD_PROGRAM => self.program_size = Some(be_arg(&payload)),
            CMD_RUN => self.runs.push(be_arg(&payload)),
            CMD_WRITE_ROW => self.rows.push(payload),
            CMD_IDENTIFY => {
                let signature = self
                    .faults
                    .signature_override
                    .unwrap_or(self.device_type.profile().signature);
                let mut reply = vec![signature];
                reply.extend_from_slice(self.serial_number.as_bytes());
                return reply;
            }
            _ => {}
        }
        Vec::new()
    }
}

fn be_arg(payload: &[u8]) -> u32 {
    let mut bytes = [0u8; 4];
    let n = payload.len().min(4);
    bytes[4 - n..].copy_from_slice(&payload[payload.len() - n..]);
    u32::from_be_bytes(bytes)
}

// Shared between a link and the test that inspects it.
#[derive(Debug)]
struct SimState {
    device: SimulatedDevice,
    rx: VecDeque<u8>,
    capture: Vec<Operation>,
    tick: u64,
    timeout: Duration,
}

impl SimState {
    fn record(&mut self, op: Operation) {
        self.capture.push(op.at(self.tick, self.tick));
        self.tick += 1;
    }
}

/// Cloneable handle onto a simulated device and everything it has seen.
#[derive(Debug, Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    pub fn new(device: SimulatedDevice) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                device,
                rx: VecDeque::new(),
                capture: Vec::new(),
                tick: 0,
                timeout: Duration::ZERO,
            })),
        }
    }

    /// Snapshot of the device state.
    pub fn device(&self) -> SimulatedDevice {
        self.state.lock().device.clone()
    }

    /// Every link operation so far, as a capture would record it.
    pub fn capture(&self) -> Vec<Operation> {
        self.state.lock().capture.clone()
    }

    pub fn clear_capture(&self) {
        self.state.lock().capture.clear();
    }

    pub fn last_timeout(&self) -> Duration {
        self.state.lock().timeout
    }

    pub fn set_faults(&self, faults: Faults) {
        self.state.lock().device.faults = faults;
    }

    /// Opens a link onto this device.
    pub fn link(&self) -> SimulatedLink {
        SimulatedLink {
            handle: self.clone(),
        }
    }
}

/// A [`Connection`] onto a [`SimulatedDevice`]. Reads never block: an empty
/// receive buffer is an immediate timeout.
#[derive(Debug)]
pub struct SimulatedLink {
    handle: SimHandle,
}

impl Connection for SimulatedLink {
    fn write_byte(&mut self, byte: u8) -> Result<(), LinkError> {
        let mut state = self.handle.state.lock();
        state.record(Operation::write(byte));
        let response = state.device.receive(byte);
        state.rx.extend(response);
        Ok(())
    }

    fn read_byte(&mut self) -> Result<u8, LinkError> {
        let mut state = self.handle.state.lock();
        let byte = state.rx.pop_front().ok_or(LinkError::Timeout)?;
        state.record(Operation::read(byte));
        Ok(byte)
    }

    fn purge(&mut self) -> Result<(), LinkError> {
        let mut state = self.handle.state.lock();
        state.rx.clear();
        state.record(Operation::purge());
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), LinkError> {
        let mut state = self.handle.state.lock();
        state.timeout = timeout;
        state.record(Operation::set_timeouts());
        Ok(())
    }
}

/// Serves simulated devices under port names.
#[derive(Debug, Clone, Default)]
pub struct SimConnector {
    ports: HashMap<String, SimHandle>,
}

impl SimConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches `device` at `port` and returns a handle for inspection.
    pub fn attach(&mut self, port: &str, device: SimulatedDevice) -> SimHandle {
        let handle = SimHandle::new(device);
        self.ports.insert(port.to_owned(), handle.clone());
        handle
    }
}

impl Connector for SimConnector {
    fn open(&self, port: &str) -> Result<Box<dyn Connection>, LinkError> {
        match self.ports.get(port) {
            Some(handle) => Ok(Box::new(handle.link())),
            None => Err(LinkError::Open {
                port: port.to_owned(),
                source: serialport::Error::new(
                    serialport::ErrorKind::NoDevice,
                    "no simulated device attached",
                ),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(device: &mut SimulatedDevice, bytes: &[u8]) -> Vec<u8> {
        bytes.iter().flat_map(|&b| device.receive(b)).collect()
    }

    #[test]
    fn serial_is_fitted_to_variant_length() {
        assert_eq!(SimulatedDevice::new(DeviceType::Em27, "12").serial_number, "120000");
        assert_eq!(
            SimulatedDevice::new(DeviceType::Mr72, "ABCDEFGHIJK").serial_number,
            "ABCDEFGH"
        );
    }

    #[test]
    fn identify_replies_with_signature_and_serial() {
        let mut device = SimulatedDevice::new(DeviceType::Mr772, "SN00012345");
        let response = feed(&mut device, &[b'i', 0x7F]);
        assert_eq!(response, b"i\x7FGSN00012345".to_vec());
    }

    #[test]
    fn name_field_is_stored_after_54_bytes() {
        let mut device = SimulatedDevice::new(DeviceType::Mr72, "1");
        let mut bytes = vec![b'I'];
        bytes.extend(std::iter::repeat(b'x').take(54));
        let response = feed(&mut device, &bytes);
        assert_eq!(response, bytes);
        assert_eq!(device.name, vec![b'x'; 54]);
    }

    #[test]
    fn row_payload_is_raw_and_terminated() {
        let mut device = SimulatedDevice::new(DeviceType::Mr72, "1");
        let response = feed(&mut device, b"W12,5V");
        assert_eq!(response, b"WV".to_vec());
        assert_eq!(device.rows, vec![b"12,5".to_vec()]);
    }

    #[test]
    fn run_argument_is_big_endian() {
        let mut device = SimulatedDevice::new(DeviceType::Mr72, "1");
        feed(&mut device, &[b'R', 0, 0, 1, 2]);
        assert_eq!(device.running_row(), Some(258));
    }

    #[test]
    fn corrupt_echo_fault() {
        let mut device = SimulatedDevice::new(DeviceType::Mr72, "1").with_faults(Faults {
            corrupt_echo_at: Some(1),
            ..Faults::default()
        });
        assert_eq!(feed(&mut device, &[b'R', 0x00]), vec![b'R', 0xFF]);
    }

    #[test]
    fn silent_fault_drops_responses() {
        let handle = SimHandle::new(SimulatedDevice::new(DeviceType::Mr72, "1").with_faults(
            Faults {
                silent_after: Some(0),
                ..Faults::default()
            },
        ));
        let mut link = handle.link();
        link.write_byte(b'R').unwrap();
        assert!(matches!(link.read_byte(), Err(LinkError::Timeout)));
    }

    #[test]
    fn link_records_capture() {
        let handle = SimHandle::new(SimulatedDevice::new(DeviceType::Mr72, "1"));
        let mut link = handle.link();
        link.purge().unwrap();
        link.write_byte(b'i').unwrap();
        assert_eq!(link.read_byte().unwrap(), b'i');
        let actions: Vec<_> = handle.capture().into_iter().map(|op| op.to_string()).collect();
        assert_eq!(actions, vec!["PURGE", "WRITE 0x69", "READ 0x69"]);
    }

    #[test]
    fn connector_rejects_unknown_port() {
        let connector = SimConnector::new();
        assert!(matches!(
            connector.open("/dev/nothing"),
            Err(LinkError::Open { .. })
        ));
    }
}
