// Feetech STS3215 serial protocol
//
// Protocol is similar to Dynamixel Protocol 1.0:
// Packet format: [0xFF, 0xFF, ID, Length, Instruction, Params..., Checksum]
// Status format: [0xFF, 0xFF, ID, Length, Error, Params..., Checksum]

use serialport::SerialPort;
use std::io::{Read, Write};
use std::time::Duration;
use tracing::{debug, trace};

/// Default serial configuration for Feetech servos
pub const DEFAULT_BAUDRATE: u32 = 1_000_000;
pub const DEFAULT_TIMEOUT_MS: u64 = 20;

/// Encoder steps per output shaft revolution
pub const STEPS_PER_REVOLUTION: u16 = 4096;

/// Largest magnitude the sign-magnitude velocity register can hold
pub const MAX_VELOCITY_MAGNITUDE: i16 = 0x7FFF;

const HEADER: [u8; 2] = [0xFF, 0xFF];

#[repr(u8)]
#[derive(Debug, Clone, Copy)]
enum Instruction {
    Ping = 0x01,
    Read = 0x02,
    Write = 0x03,
}

/// Register addresses for STS3215
#[repr(u8)]
#[derive(Debug, Clone, Copy)]
pub enum Register {
    ModelNumber = 3,      // 2 bytes, read-only
    OperatingMode = 33,   // 1 byte: 0=position, 1=velocity, 2=PWM, 3=step
    TorqueEnable = 40,    // 1 byte: 0=off, 1=on
    GoalPosition = 42,    // 2 bytes
    GoalVelocity = 46,    // 2 bytes (sign-magnitude, velocity mode)
    Lock = 55,            // 1 byte: 0=unlocked, 1=locked
    PresentPosition = 56, // 2 bytes, read-only
    PresentVelocity = 58, // 2 bytes, read-only (sign-magnitude)
}

/// Operating modes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OperatingMode {
    Position = 0,
    Velocity = 1,
}

/// Error types for Feetech communication
#[derive(Debug, thiserror::Error)]
pub enum FeetechError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid response from servo {id}: {reason}")]
    InvalidResponse { id: u8, reason: String },

    #[error("Checksum mismatch for servo {id}")]
    ChecksumMismatch { id: u8 },

    #[error("Servo {id} returned error status: 0x{status:02X}")]
    ServoError { id: u8, status: u8 },

    #[error("Timeout waiting for response from servo {id}")]
    Timeout { id: u8 },
}

pub type Result<T> = std::result::Result<T, FeetechError>;

/// Checksum over everything after the header
fn checksum(data: &[u8]) -> u8 {
    let sum: u32 = data.iter().map(|&b| b as u32).sum();
    !(sum as u8)
}

fn build_packet(id: u8, instruction: Instruction, params: &[u8]) -> Vec<u8> {
    let length = (params.len() + 2) as u8; // params + instruction + checksum
    let mut packet = Vec::with_capacity(6 + params.len());

    packet.extend_from_slice(&HEADER);
    packet.push(id);
    packet.push(length);
    packet.push(instruction as u8);
    packet.extend_from_slice(params);
    packet.push(checksum(&packet[2..]));

    packet
}

/// Servo bus over any byte stream; a serial port in production
pub struct FeetechBus<P = Box<dyn SerialPort>> {
    port: P,
}

impl FeetechBus {
    /// Open a serial connection to the servo bus
    pub fn open(port_name: &str) -> Result<Self> {
        Self::open_with_baudrate(port_name, DEFAULT_BAUDRATE)
    }

    pub fn open_with_baudrate(port_name: &str, baudrate: u32) -> Result<Self> {
        let port = serialport::new(port_name, baudrate)
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .open()?;

        Ok(Self { port })
    }
}

impl<P: Read + Write> FeetechBus<P> {
    pub fn new(port: P) -> Self {
        Self { port }
    }

    #[cfg(test)]
    pub(crate) fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Send an instruction and wait for the status packet, returning its parameters
    fn transact(&mut self, id: u8, instruction: Instruction, params: &[u8]) -> Result<Vec<u8>> {
        let packet = build_packet(id, instruction, params);
        trace!("-> servo {}: {:02X?}", id, packet);
        self.port.write_all(&packet)?;
        self.port.flush()?;
        self.read_status(id)
    }

    fn read_status(&mut self, expected_id: u8) -> Result<Vec<u8>> {
        let mut head = [0u8; 4];
        self.port.read_exact(&mut head).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                FeetechError::Timeout { id: expected_id }
            } else {
                FeetechError::Io(e)
            }
        })?;

        if head[..2] != HEADER {
            return Err(FeetechError::InvalidResponse {
                id: expected_id,
                reason: format!("Invalid header: {:02X?}", &head[..2]),
            });
        }

        let (id, length) = (head[2], head[3] as usize);
        if id != expected_id {
            return Err(FeetechError::InvalidResponse {
                id: expected_id,
                reason: format!("ID mismatch: got {}", id),
            });
        }
        if length < 2 {
            return Err(FeetechError::InvalidResponse {
                id,
                reason: format!("Length {} too short", length),
            });
        }

        // error + params + checksum
        let mut body = vec![0u8; length];
        self.port.read_exact(&mut body)?;

        let (payload, received) = body.split_at(length - 1);
        let mut summed = vec![id, length as u8];
        summed.extend_from_slice(payload);
        if checksum(&summed) != received[0] {
            return Err(FeetechError::ChecksumMismatch { id });
        }

        let status = payload[0];
        if status != 0 {
            return Err(FeetechError::ServoError { id, status });
        }

        Ok(payload[1..].to_vec())
    }

    /// Check whether a servo answers; a timeout means "not present"
    pub fn ping(&mut self, id: u8) -> Result<bool> {
        match self.transact(id, Instruction::Ping, &[]) {
            Ok(_) => Ok(true),
            Err(FeetechError::Timeout { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn read_register(&mut self, id: u8, register: Register, len: u8) -> Result<Vec<u8>> {
        let data = self.transact(id, Instruction::Read, &[register as u8, len])?;
        if data.len() < len as usize {
            return Err(FeetechError::InvalidResponse {
                id,
                reason: format!("Expected {} bytes, got {}", len, data.len()),
            });
        }
        Ok(data)
    }

    fn write_register(&mut self, id: u8, register: Register, value: &[u8]) -> Result<()> {
        let mut params = Vec::with_capacity(value.len() + 1);
        params.push(register as u8);
        params.extend_from_slice(value);
        debug!("Write servo {}: reg={:?}, bytes={:02X?}", id, register, value);
        self.transact(id, Instruction::Write, &params).map(|_| ())
    }

    pub fn read_u8(&mut self, id: u8, register: Register) -> Result<u8> {
        Ok(self.read_register(id, register, 1)?[0])
    }

    pub fn read_u16(&mut self, id: u8, register: Register) -> Result<u16> {
        let data = self.read_register(id, register, 2)?;
        Ok(u16::from_le_bytes([data[0], data[1]]))
    }

    pub fn write_u8(&mut self, id: u8, register: Register, value: u8) -> Result<()> {
        self.write_register(id, register, &[value])
    }

    pub fn write_u16(&mut self, id: u8, register: Register, value: u16) -> Result<()> {
        self.write_register(id, register, &value.to_le_bytes())
    }

    pub fn enable_torque(&mut self, id: u8) -> Result<()> {
        self.write_u8(id, Register::TorqueEnable, 1)?;
        self.write_u8(id, Register::Lock, 1)
    }

    pub fn disable_torque(&mut self, id: u8) -> Result<()> {
        self.write_u8(id, Register::TorqueEnable, 0)?;
        self.write_u8(id, Register::Lock, 0)
    }

    /// Set operating mode (torque must be disabled first)
    pub fn set_operating_mode(&mut self, id: u8, mode: OperatingMode) -> Result<()> {
        self.write_u8(id, Register::OperatingMode, mode as u8)
    }

    /// Goal velocity in steps/s (velocity mode)
    pub fn set_goal_velocity(&mut self, id: u8, velocity: i16) -> Result<()> {
        self.write_u16(id, Register::GoalVelocity, encode_sign_magnitude(velocity))
    }

    /// Goal position in steps, 0..4095 (position mode)
    pub fn set_goal_position(&mut self, id: u8, steps: u16) -> Result<()> {
        self.write_u16(id, Register::GoalPosition, steps % STEPS_PER_REVOLUTION)
    }

    /// Present shaft position in steps, 0..4095
    pub fn present_position(&mut self, id: u8) -> Result<u16> {
        Ok(self.read_u16(id, Register::PresentPosition)? % STEPS_PER_REVOLUTION)
    }

    pub fn present_velocity(&mut self, id: u8) -> Result<i16> {
        Ok(decode_sign_magnitude(self.read_u16(id, Register::PresentVelocity)?))
    }
}

/// Bit 15 = sign (1 = negative), bits 0-14 = magnitude
fn encode_sign_magnitude(value: i16) -> u16 {
    let magnitude = value.unsigned_abs().min(MAX_VELOCITY_MAGNITUDE as u16);
    if value < 0 { 0x8000 | magnitude } else { magnitude }
}

fn decode_sign_magnitude(raw: u16) -> i16 {
    let magnitude = (raw & 0x7FFF) as i16;
    if raw & 0x8000 != 0 { -magnitude } else { magnitude }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// In-memory port: replies are queued up front, writes are captured
    #[derive(Default)]
    pub(crate) struct MockPort {
        pub replies: VecDeque<u8>,
        pub written: Vec<u8>,
    }

    impl MockPort {
        pub fn queue_status(&mut self, id: u8, status: u8, params: &[u8]) {
            let length = (params.len() + 2) as u8;
            let mut packet = vec![0xFF, 0xFF, id, length, status];
            packet.extend_from_slice(params);
            packet.push(checksum(&packet[2..]));
            self.replies.extend(packet);
        }
    }

    impl Read for MockPort {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.replies.is_empty() {
                return Err(std::io::ErrorKind::TimedOut.into());
            }
            let n = buf.len().min(self.replies.len());
            for (slot, byte) in buf.iter_mut().zip(self.replies.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }
    }

    impl Write for MockPort {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_checksum() {
        // ID=1, Length=4, Instruction=WRITE, Addr=30, Data=0, 2
        // ~(1+4+3+30+0+2) = ~40 = 215
        assert_eq!(checksum(&[1u8, 4, 0x03, 30, 0, 2]), 215);
    }

    #[test]
    fn test_checksum_wraps_past_255() {
        assert_eq!(checksum(&[0xFF, 0xFF, 0x02]), !0x00);
    }

    #[test]
    fn test_sign_magnitude() {
        assert_eq!(encode_sign_magnitude(100), 100);
        assert_eq!(encode_sign_magnitude(-100), 0x8064);
        assert_eq!(encode_sign_magnitude(i16::MIN), 0xFFFF);
        assert_eq!(decode_sign_magnitude(0x8064), -100);
        assert_eq!(decode_sign_magnitude(0x0064), 100);
    }

    #[test]
    fn test_ping_packet_layout() {
        let packet = build_packet(1, Instruction::Ping, &[]);
        assert_eq!(packet, vec![0xFF, 0xFF, 1, 2, 0x01, !(1u8 + 2 + 1)]);
    }

    #[test]
    fn test_read_present_position() {
        let mut port = MockPort::default();
        port.queue_status(3, 0, &[0x34, 0x12]);
        let mut bus = FeetechBus::new(port);

        assert_eq!(bus.present_position(3).unwrap(), 0x1234 % STEPS_PER_REVOLUTION);
        // READ instruction for 2 bytes at PresentPosition
        assert_eq!(&bus.port.written[2..7], &[3, 4, 0x02, 56, 2]);
    }

    #[test]
    fn test_goal_velocity_is_sign_magnitude_on_the_wire() {
        let mut port = MockPort::default();
        port.queue_status(5, 0, &[]);
        let mut bus = FeetechBus::new(port);

        bus.set_goal_velocity(5, -300).unwrap();
        let encoded = encode_sign_magnitude(-300).to_le_bytes();
        assert_eq!(&bus.port.written[4..8], &[0x03, 46, encoded[0], encoded[1]]);
    }

    #[test]
    fn test_servo_error_status() {
        let mut port = MockPort::default();
        port.queue_status(2, 0x20, &[]);
        let mut bus = FeetechBus::new(port);

        assert!(matches!(
            bus.write_u8(2, Register::TorqueEnable, 1),
            Err(FeetechError::ServoError { id: 2, status: 0x20 })
        ));
    }

    #[test]
    fn test_checksum_mismatch_detected() {
        let mut port = MockPort::default();
        port.queue_status(4, 0, &[0x10, 0x00]);
        let last = port.replies.len() - 1;
        port.replies[last] ^= 0xFF;
        let mut bus = FeetechBus::new(port);

        assert!(matches!(
            bus.read_u16(4, Register::PresentPosition),
            Err(FeetechError::ChecksumMismatch { id: 4 })
        ));
    }

    #[test]
    fn test_ping_timeout_means_absent() {
        let mut bus = FeetechBus::new(MockPort::default());
        assert!(!bus.ping(9).unwrap());
    }
}
