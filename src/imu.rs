//! IMU telemetry decoding (`SEND_IMU_DATA`, spec §4.1 / §4.6).
//!
//! Five sensor records concatenated: acceleration, gyroscope, magnetic,
//! gravity, then rotation (which additionally carries a `real` component).

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{self, Cursor, Read};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuRecord {
    pub time: u32,
    pub status: u8,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RotationRecord {
    pub time: u32,
    pub status: u8,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub real: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuFrame {
    pub acceleration: ImuRecord,
    pub gyroscope: ImuRecord,
    pub magnetic: ImuRecord,
    pub gravity: ImuRecord,
    pub rotation: RotationRecord,
}

fn read_record(cursor: &mut Cursor<&[u8]>) -> io::Result<ImuRecord> {
    let time = cursor.read_u32::<LittleEndian>()?;
    let status = cursor.read_u8()?;
    let mut padding = [0u8; 3];
    cursor.read_exact(&mut padding)?;
    let x = cursor.read_f32::<LittleEndian>()?;
    let y = cursor.read_f32::<LittleEndian>()?;
    let z = cursor.read_f32::<LittleEndian>()?;
    Ok(ImuRecord { time, status, x, y, z })
}

fn read_rotation(cursor: &mut Cursor<&[u8]>) -> io::Result<RotationRecord> {
    let base = read_record(cursor)?;
    let real = cursor.read_f32::<LittleEndian>()?;
    Ok(RotationRecord {
        time: base.time,
        status: base.status,
        x: base.x,
        y: base.y,
        z: base.z,
        real,
    })
}

pub fn decode_imu_data(data: &[u8]) -> io::Result<ImuFrame> {
    let mut cursor = Cursor::new(data);
    Ok(ImuFrame {
        acceleration: read_record(&mut cursor)?,
        gyroscope: read_record(&mut cursor)?,
        magnetic: read_record(&mut cursor)?,
        gravity: read_record(&mut cursor)?,
        rotation: read_rotation(&mut cursor)?,
    })
}

impl ImuFrame {
    /// One row per sensor, matching the `imu` CSV channel's columns minus
    /// the logger-prepended `time`: `type, imutime, status, x, y, z, real`.
    pub fn to_log_rows(&self) -> Vec<Vec<String>> {
        let row = |name: &str, r: &ImuRecord, real: f32| {
            vec![
                name.to_string(),
                r.time.to_string(),
                r.status.to_string(),
                r.x.to_string(),
                r.y.to_string(),
                r.z.to_string(),
                real.to_string(),
            ]
        };

        vec![
            row("acceleration", &self.acceleration, 0.0),
            row("gyroscope", &self.gyroscope, 0.0),
            row("magnetic", &self.magnetic, 0.0),
            row("gravity", &self.gravity, 0.0),
            vec![
                "rotation".to_string(),
                self.rotation.time.to_string(),
                self.rotation.status.to_string(),
                self.rotation.x.to_string(),
                self.rotation.y.to_string(),
                self.rotation.z.to_string(),
                self.rotation.real.to_string(),
            ],
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;

    fn push_record(buf: &mut Vec<u8>, time: u32, status: u8, x: f32, y: f32, z: f32) {
        buf.write_u32::<LittleEndian>(time).unwrap();
        buf.write_u8(status).unwrap();
        buf.extend_from_slice(&[0u8; 3]);
        buf.write_f32::<LittleEndian>(x).unwrap();
        buf.write_f32::<LittleEndian>(y).unwrap();
        buf.write_f32::<LittleEndian>(z).unwrap();
    }

    #[test]
    fn decodes_five_records() {
        let mut buf = Vec::new();
        push_record(&mut buf, 1, 3, 1.0, 2.0, 3.0);
        push_record(&mut buf, 2, 3, 4.0, 5.0, 6.0);
        push_record(&mut buf, 3, 3, 7.0, 8.0, 9.0);
        push_record(&mut buf, 4, 3, 10.0, 11.0, 12.0);
        push_record(&mut buf, 5, 3, 13.0, 14.0, 15.0);
        buf.write_f32::<LittleEndian>(0.5).unwrap(); // rotation.real

        let frame = decode_imu_data(&buf).unwrap();
        assert_eq!(frame.acceleration.time, 1);
        assert_eq!(frame.rotation.time, 5);
        assert_eq!(frame.rotation.real, 0.5);

        let rows = frame.to_log_rows();
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[4][0], "rotation");
    }
}
