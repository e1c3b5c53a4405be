//! Oscillator parameter bag and angle/position derivation (spec §4.5 / §3).

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::{self, Cursor};

use crate::codec::{self, Instruction};

/// Scalar oscillator parameters plus the telemetry fields the robot echoes
/// back (`phase`, `output`). Mirrors `EDMOMotorState` in the original
/// source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotorState {
    pub freq: f32,
    pub amp: f32,
    pub offset: f32,
    pub phase_shift: f32,
    pub phase: f32,
    pub reverse: bool,
    pub orders: bool,
    pub output: i32,
}

impl Default for MotorState {
    fn default() -> Self {
        MotorState {
            freq: 0.0,
            amp: 0.0,
            offset: 90.0,
            phase_shift: 0.0,
            phase: 0.0,
            reverse: false,
            orders: false,
            output: -1,
        }
    }
}

impl MotorState {
    /// `(reverse ? -amp : amp) * sin(phase - phaseShift)`. The server never
    /// integrates `phase` itself — it's maintained by the robot and merely
    /// echoed back in telemetry.
    pub fn angle(&self) -> f32 {
        let signed_amp = if self.reverse { -self.amp } else { self.amp };
        signed_amp * (self.phase - self.phase_shift).sin()
    }

    /// Angle + offset clamped to [0, 180] then linearly mapped to the servo
    /// unit range [100, 454].
    pub fn position(&self) -> i32 {
        let constrained = (self.angle() + self.offset).clamp(0.0, 180.0);
        let (in_min, in_max, out_min, out_max) = (0.0f32, 180.0f32, 100.0f32, 454.0f32);
        (((constrained - in_min) * (out_max - out_min)) / (in_max - in_min) + out_min) as i32
    }

    pub fn to_row(&self, motor_id: u8) -> Vec<String> {
        vec![
            motor_id.to_string(),
            self.angle().to_string(),
            self.freq.to_string(),
            self.amp.to_string(),
            self.offset.to_string(),
            self.phase_shift.to_string(),
            self.phase.to_string(),
            self.output.to_string(),
        ]
    }
}

/// One motor slot: its canonical state plus the dirty bit that controls
/// whether it gets re-sent on the next tick.
#[derive(Debug, Clone)]
pub struct Motor {
    id: u8,
    state: MotorState,
    dirty: bool,
}

impl Motor {
    pub fn new(id: u8) -> Self {
        Motor {
            id,
            state: MotorState::default(),
            dirty: true,
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn state(&self) -> &MotorState {
        &self.state
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Parses a `TOKEN VALUE` player command and mutates the matching
    /// field. Unknown tokens (and malformed values) are silently ignored —
    /// spec §4.5 requires this to never surface an error to the player.
    pub fn apply_command(&mut self, text: &str) {
        let mut parts = text.split_whitespace();
        let (Some(token), Some(raw_value)) = (parts.next(), parts.next()) else {
            return;
        };
        let Ok(value) = raw_value.parse::<f32>() else {
            return;
        };

        match token {
            "amp" => self.state.amp = value,
            "off" => self.state.offset = value,
            "freq" => self.state.freq = value,
            "phb" => self.state.phase_shift = value,
            "rev" => self.state.reverse = value != 0.0,
            "ord" => self.state.orders = value != 0.0,
            _ => return,
        }

        self.dirty = true;
    }

    /// Serializes the current parameters as an `UPDATE_OSCILLATOR` packet
    /// and clears the dirty bit.
    pub fn take_dirty_command(&mut self) -> Option<Vec<u8>> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        Some(self.as_command())
    }

    pub fn as_command(&self) -> Vec<u8> {
        encode_update_oscillator(self.id, &self.state)
    }

    /// Overwrites the canonical state from a `SEND_MOTOR_DATA` telemetry
    /// frame (the fields a player never sets directly: `phase`, `output`).
    pub fn ingest_telemetry(&mut self, state: MotorState) {
        self.state = state;
    }
}

fn encode_update_oscillator(motor_id: u8, state: &MotorState) -> Vec<u8> {
    let mut payload = Vec::with_capacity(1 + 4 * 4 + 2 + 2);
    payload.push(motor_id);
    let _ = payload.write_f32::<LittleEndian>(state.freq);
    let _ = payload.write_f32::<LittleEndian>(state.amp);
    let _ = payload.write_f32::<LittleEndian>(state.offset);
    let _ = payload.write_f32::<LittleEndian>(state.phase_shift);
    let _ = payload.write_i16::<LittleEndian>(state.reverse as i16);
    let _ = payload.write_i16::<LittleEndian>(state.orders as i16);

    codec::create(Instruction::UpdateOscillator, &payload)
}

/// Decodes a `SEND_MOTOR_DATA` payload (the instruction byte already
/// stripped by the codec) into `(motor_id, state)`.
pub fn decode_motor_data(data: &[u8]) -> io::Result<(u8, MotorState)> {
    let mut cursor = Cursor::new(data);
    let id = cursor.read_u8()?;
    let freq = cursor.read_f32::<LittleEndian>()?;
    let amp = cursor.read_f32::<LittleEndian>()?;
    let offset = cursor.read_f32::<LittleEndian>()?;
    let phase_shift = cursor.read_f32::<LittleEndian>()?;
    let phase = cursor.read_f32::<LittleEndian>()?;
    let reverse = cursor.read_i16::<LittleEndian>()? != 0;
    let orders = cursor.read_i16::<LittleEndian>()? != 0;
    let output = cursor.read_i32::<LittleEndian>()?;

    Ok((
        id,
        MotorState {
            freq,
            amp,
            offset,
            phase_shift,
            phase,
            reverse,
            orders,
            output,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_command_sets_dirty_and_field() {
        let mut motor = Motor::new(0);
        motor.take_dirty_command(); // clear the initial dirty-on-construct bit
        motor.apply_command("freq 0.5");
        assert_eq!(motor.state().freq, 0.5);
        assert!(motor.is_dirty());
    }

    #[test]
    fn unknown_token_is_ignored() {
        let mut motor = Motor::new(0);
        motor.take_dirty_command();
        motor.apply_command("bogus 1.0");
        assert!(!motor.is_dirty());
    }

    #[test]
    fn scenario_s2_update_oscillator_byte_layout() {
        let mut motor = Motor::new(0);
        motor.take_dirty_command();
        motor.apply_command("freq 0.5");
        let packet = motor.take_dirty_command().unwrap();

        let parsed = codec::try_parse(&packet);
        assert_eq!(parsed.instruction, Instruction::UpdateOscillator);

        let mut cursor = Cursor::new(parsed.data.as_slice());
        assert_eq!(cursor.read_u8().unwrap(), 0);
        assert_eq!(cursor.read_f32::<LittleEndian>().unwrap(), 0.5f32);
        assert_eq!(cursor.read_f32::<LittleEndian>().unwrap(), 0.0f32); // amp
        assert_eq!(cursor.read_f32::<LittleEndian>().unwrap(), 90.0f32); // offset
        assert_eq!(cursor.read_f32::<LittleEndian>().unwrap(), 0.0f32); // phaseShift
        assert_eq!(cursor.read_i16::<LittleEndian>().unwrap(), 0); // reverse
        assert_eq!(cursor.read_i16::<LittleEndian>().unwrap(), 0); // orders
    }

    #[test]
    fn motor_data_round_trip() {
        let state = MotorState {
            freq: 1.5,
            amp: 90.0,
            offset: 90.0,
            phase_shift: 0.25,
            phase: 1.0,
            reverse: true,
            orders: false,
            output: 321,
        };

        let mut payload = vec![7u8];
        payload
            .write_f32::<LittleEndian>(state.freq)
            .unwrap();
        payload.write_f32::<LittleEndian>(state.amp).unwrap();
        payload.write_f32::<LittleEndian>(state.offset).unwrap();
        payload
            .write_f32::<LittleEndian>(state.phase_shift)
            .unwrap();
        payload.write_f32::<LittleEndian>(state.phase).unwrap();
        payload
            .write_i16::<LittleEndian>(state.reverse as i16)
            .unwrap();
        payload
            .write_i16::<LittleEndian>(state.orders as i16)
            .unwrap();
        payload.write_i32::<LittleEndian>(state.output).unwrap();

        let (id, decoded) = decode_motor_data(&payload).unwrap();
        assert_eq!(id, 7);
        assert_eq!(decoded, state);
    }
}
