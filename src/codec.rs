//! Binary wire protocol: framing, escaping, and the instruction enum.
//!
//! Bit-exact compatibility with existing firmware is required (spec §6) —
//! every encode/decode here mirrors `EDMOCommands.py`'s `EDMOPacket`
//! byte-for-byte, just expressed as free functions plus a `Framer` instead
//! of a handful of classmethods.

/// The six instructions the firmware understands. Anything else decodes to
/// `Invalid` and is dropped by callers (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Identify,
    SessionStart,
    GetTime,
    UpdateOscillator,
    SendMotorData,
    SendImuData,
    Invalid,
}

impl Instruction {
    pub fn to_byte(self) -> Option<u8> {
        match self {
            Instruction::Identify => Some(0),
            Instruction::SessionStart => Some(1),
            Instruction::GetTime => Some(2),
            Instruction::UpdateOscillator => Some(3),
            Instruction::SendMotorData => Some(4),
            Instruction::SendImuData => Some(5),
            Instruction::Invalid => None,
        }
    }

    pub fn from_byte(byte: u8) -> Instruction {
        match byte {
            0 => Instruction::Identify,
            1 => Instruction::SessionStart,
            2 => Instruction::GetTime,
            3 => Instruction::UpdateOscillator,
            4 => Instruction::SendMotorData,
            5 => Instruction::SendImuData,
            _ => Instruction::Invalid,
        }
    }
}

/// A decoded command: an instruction plus its (already unescaped) payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub instruction: Instruction,
    pub data: Vec<u8>,
}

impl Command {
    pub fn invalid() -> Self {
        Command {
            instruction: Instruction::Invalid,
            data: Vec::new(),
        }
    }
}

const HEADER: &[u8; 2] = b"ED";
const FOOTER: &[u8; 2] = b"MO";

/// Builds a framed packet: `"ED" ++ escape(instruction ++ payload) ++ "MO"`.
pub fn create(instruction: Instruction, payload: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(1 + payload.len());
    if let Some(byte) = instruction.to_byte() {
        data.push(byte);
    }
    data.extend_from_slice(payload);

    let escaped = escape(&data);

    let mut out = Vec::with_capacity(HEADER.len() + escaped.len() + FOOTER.len());
    out.extend_from_slice(HEADER);
    out.extend_from_slice(&escaped);
    out.extend_from_slice(FOOTER);
    out
}

pub fn from_command(command: &Command) -> Vec<u8> {
    create(command.instruction, &command.data)
}

/// Parses a framed packet. Anything without a valid header/footer pair, or
/// with an instruction byte outside 0..=5, decodes to `Command::invalid()`.
pub fn try_parse(packet: &[u8]) -> Command {
    if packet.len() < HEADER.len() + FOOTER.len()
        || !packet.starts_with(HEADER)
        || !packet.ends_with(FOOTER)
    {
        return Command::invalid();
    }

    let body = &packet[HEADER.len()..packet.len() - FOOTER.len()];
    if body.is_empty() {
        return Command::invalid();
    }

    let instruction = Instruction::from_byte(body[0]);
    let data = unescape(&body[1..]);

    Command { instruction, data }
}

/// Escapes `\`, `ED`, and `MO` inside a payload so they can't be mistaken
/// for the frame header/footer.
pub fn escape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &byte in data {
        match byte {
            b'\\' => out.extend_from_slice(b"\\\\"),
            _ => out.push(byte),
        }
    }

    // Escaping backslashes first keeps the header/footer replacements from
    // re-escaping backslashes they themselves introduce.
    let out = replace_sequence(&out, HEADER, b"E\\D");
    replace_sequence(&out, FOOTER, b"M\\O")
}

fn replace_sequence(data: &[u8], needle: &[u8; 2], replacement: &[u8; 3]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i..].starts_with(needle) {
            out.extend_from_slice(replacement);
            i += needle.len();
        } else {
            out.push(data[i]);
            i += 1;
        }
    }
    out
}

/// Removes escape backslashes, keeping the byte that follows each one
/// verbatim. A trailing lone backslash is dropped.
pub fn unescape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] == b'\\' {
            i += 1;
            if i >= data.len() {
                break;
            }
        }
        out.push(data[i]);
        i += 1;
    }
    out
}

/// Byte-stream framer: detects packet boundaries within a continuous stream
/// of bytes (used by the serial transport; UDP deals in whole datagrams and
/// doesn't need one).
///
/// Per spec §4.1 / §9 Open Question (c): while framing is inactive the
/// buffer is truncated to at most its last two bytes on every byte, so a
/// header that never arrives can't grow the buffer without bound.
#[derive(Debug, Default)]
pub struct Framer {
    buffer: Vec<u8>,
    active: bool,
}

impl Framer {
    pub fn new() -> Self {
        Framer {
            buffer: Vec::new(),
            active: false,
        }
    }

    /// Feeds one byte into the framer. Returns a completed frame's raw
    /// bytes (header through footer) when the footer is seen while active.
    pub fn push(&mut self, byte: u8) -> Option<Vec<u8>> {
        self.buffer.push(byte);

        if self.buffer.ends_with(HEADER) {
            self.buffer = HEADER.to_vec();
            self.active = true;
            return None;
        }

        if !self.active {
            if self.buffer.len() >= 2 {
                let tail_len = self.buffer.len().min(2);
                let start = self.buffer.len() - tail_len;
                self.buffer = self.buffer[start..].to_vec();
            }
            return None;
        }

        if self.buffer.ends_with(FOOTER) {
            self.active = false;
            let frame = std::mem::take(&mut self.buffer);
            return Some(frame);
        }

        None
    }

    /// Feeds a chunk of bytes, returning every completed frame within it.
    pub fn push_chunk(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        bytes.iter().filter_map(|&b| self.push(b)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn escape_unescape_known_sequences() {
        assert_eq!(unescape(&escape(b"ED")), b"ED");
        assert_eq!(unescape(&escape(b"MO")), b"MO");
        assert_eq!(unescape(&escape(b"\\")), b"\\");
        assert_eq!(unescape(&escape(b"a MO b ED c \\ d")), b"a MO b ED c \\ d");
    }

    #[test]
    fn create_and_parse_round_trip() {
        let payload = vec![1u8, 2, 3, 0xED, 0x4D, 0x4F];
        let packet = create(Instruction::UpdateOscillator, &payload);
        let parsed = try_parse(&packet);
        assert_eq!(parsed.instruction, Instruction::UpdateOscillator);
        assert_eq!(parsed.data, payload);
    }

    #[test]
    fn invalid_instruction_byte_yields_invalid() {
        // Header + an out-of-range instruction byte + footer.
        let mut packet = HEADER.to_vec();
        packet.push(42);
        packet.extend_from_slice(FOOTER);
        assert_eq!(try_parse(&packet).instruction, Instruction::Invalid);
    }

    #[test]
    fn malformed_packet_without_header_is_invalid() {
        assert_eq!(try_parse(b"garbage").instruction, Instruction::Invalid);
    }

    #[test]
    fn framer_recovers_escaped_mo_in_payload() {
        let payload = b"xx MO yy".to_vec();
        let packet = create(Instruction::SendImuData, &payload);

        let mut framer = Framer::new();
        let mut stream = b"\x00\x01garbage".to_vec();
        stream.extend_from_slice(&packet);
        stream.extend_from_slice(b"trailing noise");

        let frames = framer.push_chunk(&stream);
        assert_eq!(frames.len(), 1);
        let parsed = try_parse(&frames[0]);
        assert_eq!(parsed.instruction, Instruction::SendImuData);
        assert_eq!(parsed.data, payload);
    }

    proptest! {
        #[test]
        fn prop_unescape_inverts_escape(bytes: Vec<u8>) {
            prop_assert_eq!(unescape(&escape(&bytes)), bytes);
        }

        #[test]
        fn prop_create_parse_round_trip(payload: Vec<u8>) {
            let packet = create(Instruction::SendMotorData, &payload);
            let parsed = try_parse(&packet);
            prop_assert_eq!(parsed.instruction, Instruction::SendMotorData);
            prop_assert_eq!(parsed.data, payload);
        }
    }
}
