/*! Status buffer schemas.

Settings travel between the CP Plus and the iNet box as "status
buffers": fixed layout byte vectors with a shared ten byte preamble,
two identifier bytes selecting the schema, and bit packed fields.

Each schema is a static table of `(name, byte, bit, width, codec)`
entries; one decode and one encode routine walk the table. Only a
fraction of every buffer is understood. The rest must survive a
decode/modify/encode cycle bit for bit, so encoding always starts from
the last buffer received for the same schema family and overlays the
touched fields in place.
 */
use std::collections::BTreeMap;

use itertools::Itertools;
use log::{debug, warn};

/// Ten byte preamble shared by every status buffer, verbatim from a
/// capture of the reference device.
pub const PREAMBLE: [u8; 10] = [0x00, 0x1E, 0x00, 0x00, 0x22, 0xFF, 0xFF, 0xFF, 0x54, 0x01];

/// Decoded view of a buffer: field name to typed value.
pub type StatusMap = BTreeMap<&'static str, Value>;

/// A typed field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Plain unsigned integer.
    Uint(u32),
    /// Temperature in °C. 0.0 means "unset".
    Temp(f32),
    /// One name out of a fixed enumeration.
    Name(&'static str),
    /// Undecoded bytes, passed through.
    Bytes(Vec<u8>),
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Uint(v) => write!(f, "{v}"),
            Value::Temp(v) => write!(f, "{v:.1}"),
            Value::Name(v) => write!(f, "{v}"),
            Value::Bytes(v) => write!(f, "{}", v.iter().map(|b| format!("{b:02X}")).join(" ")),
        }
    }
}

/// Heating mode names, in raw value order.
pub const HEATING_MODES: &[&str] = &["off", "eco", "high"];

/// Energy selection names, in raw value order.
pub const ENERGY_MIXES: &[&str] = &["none", "gas", "electricity", "mix"];

/// Electric power levels in watts, in raw value order.
pub const EL_POWER_LEVELS: &[u16] = &[0, 900, 1800];

// Temperatures are tenths of a kelvin. The reference device uses 2731
// for 0 °C and raw 0 for "unset".
const TEMP_OFFSET: u32 = 2731;

/// Stateless bidirectional mapping between raw bits and a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Codec {
    /// Unsigned integer, least significant bits first.
    Uint,
    /// Temperature in tenths of a kelvin, 0 = unset.
    Temp,
    /// Raw value indexes a name table.
    Enum(&'static [&'static str]),
    /// Raw value indexes a numeric table.
    Lookup(&'static [u16]),
    /// Two digit BCD.
    Bcd,
    /// Pass-through bytes.
    Raw,
}

impl Codec {
    fn decode(&self, raw: u32, width: u8) -> Value {
        match self {
            Codec::Uint => Value::Uint(raw),
            Codec::Temp => {
                if raw == 0 {
                    Value::Temp(0.0)
                } else {
                    Value::Temp((raw as f32 - TEMP_OFFSET as f32) / 10.0)
                }
            }
            Codec::Enum(names) => match names.get(raw as usize) {
                Some(&name) => Value::Name(name),
                None => {
                    debug!("enum raw value {raw} out of range, keeping the number");
                    Value::Uint(raw)
                }
            },
            Codec::Lookup(vals) => match vals.get(raw as usize) {
                Some(&v) => Value::Uint(u32::from(v)),
                None => {
                    debug!("lookup raw value {raw} out of range, keeping the number");
                    Value::Uint(raw)
                }
            },
            Codec::Bcd => Value::Uint(10 * (raw >> 4) + (raw & 0x0F)),
            Codec::Raw => Value::Bytes(raw.to_le_bytes()[..usize::from(width / 8)].to_vec()),
        }
    }

    fn encode(&self, value: &Value) -> Option<u32> {
        match (self, value) {
            (Codec::Uint, Value::Uint(v)) => Some(*v),
            (Codec::Temp, Value::Temp(v)) => {
                if *v == 0.0 {
                    Some(0)
                } else {
                    Some((v * 10.0).round() as u32 + TEMP_OFFSET)
                }
            }
            (Codec::Enum(names), Value::Name(name)) => {
                names.iter().position(|n| n == name).map(|p| p as u32)
            }
            (Codec::Lookup(vals), Value::Uint(v)) => {
                vals.iter().position(|&t| u32::from(t) == *v).map(|p| p as u32)
            }
            (Codec::Bcd, Value::Uint(v)) => Some(((v / 10) << 4) | (v % 10)),
            (Codec::Raw, Value::Bytes(b)) => {
                let mut le = [0u8; 4];
                le[..b.len().min(4)].copy_from_slice(&b[..b.len().min(4)]);
                Some(u32::from_le_bytes(le))
            }
            _ => None,
        }
    }
}

/// One field of a status buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Field {
    /// Stable setting name.
    pub name: &'static str,
    /// Byte offset from the start of the buffer, preamble included.
    pub byte: usize,
    /// Bit offset within that byte, LSB first.
    pub bit: u8,
    /// Width in bits, up to 32. Fields cross byte boundaries LSB first.
    pub width: u8,
    /// Raw bits to value mapping.
    pub codec: Codec,
}

const fn field(name: &'static str, byte: usize, bit: u8, width: u8, codec: Codec) -> Field {
    Field {
        name,
        byte,
        bit,
        width,
        codec,
    }
}

/// Buffer families. Encoding starts from the last inbound buffer of the
/// same family, whatever its exact schema was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    /// Heater display and control buffers.
    Heater,
    /// Wall clock buffers.
    Clock,
    /// Device identity.
    Identity,
}

/// A status buffer layout.
#[derive(Debug, PartialEq)]
pub struct Schema {
    /// Short name used in logs and telemetry.
    pub name: &'static str,
    /// The two identifier bytes following the preamble.
    pub id: (u8, u8),
    /// Total buffer length in bytes.
    pub len: usize,
    /// Which snapshot encoding starts from.
    pub family: Family,
    /// Declared fields. Everything else is opaque and preserved.
    pub fields: &'static [Field],
}

/// "Display and control read": the master's full picture of the heater,
/// delivered via SID 0xBB.
pub static DISPLAY_STATUS: Schema = Schema {
    name: "display_status",
    id: (0x14, 0x33),
    len: 30,
    family: Family::Heater,
    fields: &[
        field("target_temp_room", 12, 0, 16, Codec::Temp),
        field("target_temp_water", 14, 0, 16, Codec::Temp),
        field("heating_mode", 16, 0, 8, Codec::Enum(HEATING_MODES)),
        field("energy_mix", 17, 0, 4, Codec::Enum(ENERGY_MIXES)),
        field("el_power_level", 17, 4, 4, Codec::Lookup(EL_POWER_LEVELS)),
        field("cur_temp_room", 18, 0, 16, Codec::Temp),
        field("cur_temp_water", 20, 0, 16, Codec::Temp),
        field("error_code", 22, 0, 16, Codec::Uint),
        field("fan_level", 24, 0, 4, Codec::Uint),
        field("operating_status", 24, 4, 4, Codec::Uint),
    ],
};

/// "Control write": the subset the iNet box may change, uploaded on
/// SID 0xBA. Field offsets deliberately match [`DISPLAY_STATUS`].
pub static CONTROL_WRITE: Schema = Schema {
    name: "control_write",
    id: (0x0C, 0x32),
    len: 30,
    family: Family::Heater,
    fields: &[
        field("target_temp_room", 12, 0, 16, Codec::Temp),
        field("target_temp_water", 14, 0, 16, Codec::Temp),
        field("heating_mode", 16, 0, 8, Codec::Enum(HEATING_MODES)),
        field("energy_mix", 17, 0, 4, Codec::Enum(ENERGY_MIXES)),
        field("el_power_level", 17, 4, 4, Codec::Lookup(EL_POWER_LEVELS)),
    ],
};

/// Wall clock write buffer.
pub static CLOCK_WRITE: Schema = Schema {
    name: "clock_write",
    id: (0x18, 0x32),
    len: 18,
    family: Family::Clock,
    fields: &[
        field("wall_time_hours", 12, 0, 8, Codec::Bcd),
        field("wall_time_minutes", 13, 0, 8, Codec::Bcd),
        field("wall_time_seconds", 14, 0, 8, Codec::Bcd),
    ],
};

/// Device identity, sent once by the master after power up.
pub static IDENTITY: Schema = Schema {
    name: "identity",
    id: (0x02, 0x33),
    len: 22,
    family: Family::Identity,
    fields: &[
        field("hardware_version_major", 12, 0, 8, Codec::Bcd),
        field("hardware_version_minor", 13, 0, 8, Codec::Bcd),
        field("software_version_major", 14, 0, 8, Codec::Bcd),
        field("software_version_minor", 15, 0, 8, Codec::Bcd),
        field("serial_number", 16, 0, 32, Codec::Uint),
        field("production_code", 20, 0, 16, Codec::Raw),
    ],
};

/// All known schemas.
pub static SCHEMAS: [&Schema; 4] = [&DISPLAY_STATUS, &CONTROL_WRITE, &CLOCK_WRITE, &IDENTITY];

/// Look up a schema by its identifier bytes.
#[must_use]
pub fn schema_for(id_a: u8, id_b: u8) -> Option<&'static Schema> {
    SCHEMAS.iter().copied().find(|s| s.id == (id_a, id_b))
}

fn read_bits(buf: &[u8], byte: usize, bit: u8, width: u8) -> u32 {
    let mut v = 0u32;
    for i in 0..u32::from(width) {
        let pos = byte * 8 + usize::from(bit) + i as usize;
        let b = (buf[pos / 8] >> (pos % 8)) & 1;
        v |= u32::from(b) << i;
    }
    v
}

fn write_bits(buf: &mut [u8], byte: usize, bit: u8, width: u8, value: u32) {
    for i in 0..u32::from(width) {
        let pos = byte * 8 + usize::from(bit) + i as usize;
        let mask = 1u8 << (pos % 8);
        if (value >> i) & 1 == 1 {
            buf[pos / 8] |= mask;
        } else {
            buf[pos / 8] &= !mask;
        }
    }
}

impl Schema {
    /// Does this schema declare the named field?
    #[must_use]
    pub fn has_field(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name == name)
    }

    /// Decode every declared field. `None` if the buffer is too short.
    #[must_use]
    pub fn decode(&self, buf: &[u8]) -> Option<StatusMap> {
        if buf.len() < self.len {
            warn!(
                "{} buffer too short: {} of {} bytes",
                self.name,
                buf.len(),
                self.len
            );
            return None;
        }
        Some(
            self.fields
                .iter()
                .map(|f| (f.name, f.codec.decode(read_bits(buf, f.byte, f.bit, f.width), f.width)))
                .collect(),
        )
    }

    /// Overlay the given values onto a buffer in place. Keys that are
    /// not fields of this schema are left for other schemas to claim.
    /// A value that does not fit its codec is skipped with a warning;
    /// validation is the caller's job and happens much earlier.
    pub fn overlay(&self, buf: &mut [u8], values: &StatusMap) {
        for f in self.fields {
            let Some(value) = values.get(f.name) else {
                continue;
            };
            match f.codec.encode(value) {
                Some(raw) => write_bits(buf, f.byte, f.bit, f.width, raw),
                None => warn!("{}: {value} does not encode, skipped", f.name),
            }
        }
    }
}

/// Last inbound buffer per family, plus buffer construction for upload.
#[derive(Default)]
pub struct Snapshots {
    bufs: BTreeMap<&'static str, Vec<u8>>,
}

fn family_key(family: Family) -> &'static str {
    match family {
        Family::Heater => "heater",
        Family::Clock => "clock",
        Family::Identity => "identity",
    }
}

impl Snapshots {
    /// Empty snapshot store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an inbound buffer as the family's latest snapshot.
    pub fn store(&mut self, schema: &Schema, buf: Vec<u8>) {
        if buf[..10] != PREAMBLE {
            warn!(
                "{} buffer carries an unexpected preamble: {}",
                schema.name,
                buf[..10].iter().map(|b| format!("{b:02X}")).join(" ")
            );
        }
        self.bufs.insert(family_key(schema.family), buf);
    }

    /// The buffer an upload for `schema` starts from: the family's
    /// snapshot, or a blank template if nothing was received yet.
    #[must_use]
    pub fn base_for(&self, schema: &'static Schema) -> Vec<u8> {
        let mut buf = match self.bufs.get(family_key(schema.family)) {
            Some(b) => {
                let mut b = b.clone();
                b.resize(schema.len, 0x00);
                b
            }
            None => {
                let mut b = vec![0u8; schema.len];
                b[..10].copy_from_slice(&PREAMBLE);
                b
            }
        };
        buf[10] = schema.id.0;
        buf[11] = schema.id.1;
        buf
    }

    /// Build the upload buffer for `schema`: family snapshot with the
    /// given values overlaid, every undeclared bit untouched.
    #[must_use]
    pub fn encode_write(&self, schema: &'static Schema, values: &StatusMap) -> Vec<u8> {
        let mut buf = self.base_for(schema);
        schema.overlay(&mut buf, values);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn display_buffer() -> Vec<u8> {
        let mut buf = vec![0u8; DISPLAY_STATUS.len];
        buf[..10].copy_from_slice(&PREAMBLE);
        buf[10] = 0x14;
        buf[11] = 0x33;
        let mut m = StatusMap::new();
        m.insert("target_temp_room", Value::Temp(18.0));
        m.insert("target_temp_water", Value::Temp(40.0));
        m.insert("heating_mode", Value::Name("high"));
        m.insert("energy_mix", Value::Name("gas"));
        m.insert("el_power_level", Value::Uint(0));
        m.insert("cur_temp_room", Value::Temp(17.5));
        m.insert("cur_temp_water", Value::Temp(33.0));
        m.insert("error_code", Value::Uint(0));
        m.insert("fan_level", Value::Uint(2));
        DISPLAY_STATUS.overlay(&mut buf, &m);
        // Bytes no field covers.
        buf[26] = 0xA5;
        buf[29] = 0x5A;
        buf
    }

    #[test]
    fn decode_display() {
        let m = DISPLAY_STATUS.decode(&display_buffer()).unwrap();
        assert_eq!(m["target_temp_room"], Value::Temp(18.0));
        assert_eq!(m["target_temp_water"], Value::Temp(40.0));
        assert_eq!(m["heating_mode"], Value::Name("high"));
        assert_eq!(m["energy_mix"], Value::Name("gas"));
        assert_eq!(m["el_power_level"], Value::Uint(0));
        assert_eq!(m["cur_temp_room"], Value::Temp(17.5));
        assert_eq!(m["fan_level"], Value::Uint(2));
    }

    #[test]
    fn temp_codec_is_exact() {
        for c in [0.0f32, 5.0, 17.5, 20.0, 30.0, 40.0, 60.0, 200.0] {
            let raw = Codec::Temp.encode(&Value::Temp(c)).unwrap();
            assert_eq!(Codec::Temp.decode(raw, 16), Value::Temp(c), "{c}");
        }
        assert_eq!(Codec::Temp.encode(&Value::Temp(0.0)), Some(0));
        assert_eq!(Codec::Temp.encode(&Value::Temp(20.0)), Some(2931));
    }

    #[test]
    fn overlay_preserves_unknown_bits() {
        let buf = display_buffer();
        let mut snaps = Snapshots::new();
        snaps.store(&DISPLAY_STATUS, buf.clone());

        let mut deltas = StatusMap::new();
        deltas.insert("target_temp_room", Value::Temp(20.0));
        deltas.insert("heating_mode", Value::Name("eco"));
        let out = snaps.encode_write(&CONTROL_WRITE, &deltas);

        assert_eq!(out.len(), CONTROL_WRITE.len);
        assert_eq!((out[10], out[11]), CONTROL_WRITE.id);
        // The two touched fields changed...
        let m = DISPLAY_STATUS.decode(&out).unwrap();
        assert_eq!(m["target_temp_room"], Value::Temp(20.0));
        assert_eq!(m["heating_mode"], Value::Name("eco"));
        // ...everything else, including bits no schema declares, did not.
        let before = DISPLAY_STATUS.decode(&buf).unwrap();
        assert_eq!(m["cur_temp_room"], before["cur_temp_room"]);
        assert_eq!(m["energy_mix"], before["energy_mix"]);
        assert_eq!(out[26], 0xA5);
        assert_eq!(out[29], 0x5A);
        for i in 0..out.len() {
            if !(10..=13).contains(&i) && i != 16 {
                assert_eq!(out[i], buf[i], "byte {i}");
            }
        }
    }

    #[test]
    fn encode_without_snapshot_uses_template() {
        let snaps = Snapshots::new();
        let mut values = StatusMap::new();
        values.insert("wall_time_hours", Value::Uint(13));
        values.insert("wall_time_minutes", Value::Uint(37));
        values.insert("wall_time_seconds", Value::Uint(9));
        let out = snaps.encode_write(&CLOCK_WRITE, &values);
        assert_eq!(out.len(), CLOCK_WRITE.len);
        assert_eq!(&out[..10], &PREAMBLE);
        assert_eq!((out[10], out[11]), (0x18, 0x32));
        assert_eq!(out[12], 0x13);
        assert_eq!(out[13], 0x37);
        assert_eq!(out[14], 0x09);
    }

    #[test]
    fn nibble_fields_share_a_byte() {
        let mut buf = vec![0u8; DISPLAY_STATUS.len];
        let mut m = StatusMap::new();
        m.insert("energy_mix", Value::Name("mix"));
        m.insert("el_power_level", Value::Uint(1800));
        DISPLAY_STATUS.overlay(&mut buf, &m);
        assert_eq!(buf[17], 0x23);
        let m = DISPLAY_STATUS.decode(&buf).unwrap();
        assert_eq!(m["energy_mix"], Value::Name("mix"));
        assert_eq!(m["el_power_level"], Value::Uint(1800));
    }

    #[test]
    fn schema_lookup() {
        assert_eq!(schema_for(0x14, 0x33).unwrap().name, "display_status");
        assert_eq!(schema_for(0x0C, 0x32).unwrap().name, "control_write");
        assert!(schema_for(0x00, 0x00).is_none());
    }

    #[test]
    fn identity_decode() {
        let mut buf = vec![0u8; IDENTITY.len];
        buf[..10].copy_from_slice(&PREAMBLE);
        buf[10] = 0x02;
        buf[11] = 0x33;
        buf[12] = 0x21; // hardware 21.05
        buf[13] = 0x05;
        buf[14] = 0x04; // software 4.01
        buf[15] = 0x01;
        buf[16..20].copy_from_slice(&123456u32.to_le_bytes());
        buf[20] = 0xDE;
        buf[21] = 0xAD;
        let m = IDENTITY.decode(&buf).unwrap();
        assert_eq!(m["hardware_version_major"], Value::Uint(21));
        assert_eq!(m["hardware_version_minor"], Value::Uint(5));
        assert_eq!(m["software_version_major"], Value::Uint(4));
        assert_eq!(m["software_version_minor"], Value::Uint(1));
        assert_eq!(m["serial_number"], Value::Uint(123456));
        assert_eq!(m["production_code"], Value::Bytes(vec![0xDE, 0xAD]));
    }
}
