//! Polymorphic synchronized value: a single typed slot inside a [`State`](crate::state::State)
//! that knows how to serialize itself and detect whether it changed since
//! the last time it was sent.

use crate::codec::{Reader, Writer};
use crate::error::NetworkResult;
use crate::proto::ValueType;

/// Width and signedness of an integer-backed value. Shared by plain
/// integers and the integer components of `Point2`/`Point3`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IntFormat {
    Sint8,
    Uint8,
    Sint16,
    Uint16,
    Sint32,
    Uint32,
    Sint64,
    Uint64,
}

impl IntFormat {
    fn write(&self, w: &mut Writer<'_>, value: i64) {
        match self {
            IntFormat::Sint8 => w.write_char(value as i8),
            IntFormat::Uint8 => w.write_byte(value as u8),
            IntFormat::Sint16 => w.write_short(value as i16),
            IntFormat::Uint16 => w.write_ushort(value as u16),
            IntFormat::Sint32 => w.write_int(value as i32),
            IntFormat::Uint32 => w.write_uint(value as u32),
            IntFormat::Sint64 => w.write_long(value),
            IntFormat::Uint64 => w.write_ulong(value as u64),
        }
    }

    fn read(&self, r: &mut Reader<'_>) -> NetworkResult<i64> {
        Ok(match self {
            IntFormat::Sint8 => r.read_char()? as i64,
            IntFormat::Uint8 => r.read_byte()? as i64,
            IntFormat::Sint16 => r.read_short()? as i64,
            IntFormat::Uint16 => r.read_ushort()? as i64,
            IntFormat::Sint32 => r.read_int()? as i64,
            IntFormat::Uint32 => r.read_uint()? as i64,
            IntFormat::Sint64 => r.read_long()?,
            IntFormat::Uint64 => r.read_ulong()? as i64,
        })
    }

    fn scalar_value_type(&self) -> ValueType {
        match self {
            IntFormat::Sint8 => ValueType::Sint8,
            IntFormat::Uint8 => ValueType::Uint8,
            IntFormat::Sint16 => ValueType::Sint16,
            IntFormat::Uint16 => ValueType::Uint16,
            IntFormat::Sint32 => ValueType::Sint32,
            IntFormat::Uint32 => ValueType::Uint32,
            IntFormat::Sint64 => ValueType::Sint64,
            IntFormat::Uint64 => ValueType::Uint64,
        }
    }

    fn point2_value_type(&self) -> ValueType {
        match self {
            IntFormat::Sint8 => ValueType::Point2S8,
            IntFormat::Uint8 => ValueType::Point2U8,
            IntFormat::Sint16 => ValueType::Point2S16,
            IntFormat::Uint16 => ValueType::Point2U16,
            IntFormat::Sint32 => ValueType::Point2S32,
            IntFormat::Uint32 => ValueType::Point2U32,
            IntFormat::Sint64 => ValueType::Point2S64,
            IntFormat::Uint64 => ValueType::Point2U64,
        }
    }

    fn point3_value_type(&self) -> ValueType {
        match self {
            IntFormat::Sint8 => ValueType::Point3S8,
            IntFormat::Uint8 => ValueType::Point3U8,
            IntFormat::Sint16 => ValueType::Point3S16,
            IntFormat::Uint16 => ValueType::Point3U16,
            IntFormat::Sint32 => ValueType::Point3S32,
            IntFormat::Uint32 => ValueType::Point3U32,
            IntFormat::Sint64 => ValueType::Point3S64,
            IntFormat::Uint64 => ValueType::Point3U64,
        }
    }
}

/// Precision of a float-backed vector/quaternion value.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FloatFormat {
    Float16,
    Float32,
    Float64,
}

impl FloatFormat {
    fn write(&self, w: &mut Writer<'_>, value: f64) {
        match self {
            FloatFormat::Float16 => w.write_float16(value as f32),
            FloatFormat::Float32 => w.write_float(value as f32),
            FloatFormat::Float64 => w.write_double(value),
        }
    }

    fn read(&self, r: &mut Reader<'_>) -> NetworkResult<f64> {
        Ok(match self {
            FloatFormat::Float16 => r.read_float16()? as f64,
            FloatFormat::Float32 => r.read_float()? as f64,
            FloatFormat::Float64 => r.read_double()?,
        })
    }
}

/// A 2-component tuple of arbitrary-width integers.
pub type Point2 = (i64, i64);
/// A 3-component tuple of arbitrary-width integers.
pub type Point3 = (i64, i64, i64);
/// A 2-component float vector, stored at full `f64` precision regardless
/// of wire precision.
pub type Vector2 = (f64, f64);
/// A 3-component float vector.
pub type Vector3 = (f64, f64, f64);
/// A quaternion, `(x, y, z, w)`.
pub type Quaternion = (f64, f64, f64, f64);

/// A single synchronized value. Holds both the current value and the
/// value last sent to the peer (`last`), so [`Value::update_value`] can
/// tell whether a resync is needed without the caller tracking dirtiness
/// itself.
#[derive(Debug, Clone)]
pub enum Value {
    Int { format: IntFormat, value: i64, last: i64 },
    Float16 { value: f32, last: f32 },
    Float32 { value: f32, last: f32 },
    Float64 { value: f64, last: f64 },
    String { value: String, last: String },
    Data { value: Vec<u8>, last: Vec<u8> },
    Point2 { format: IntFormat, value: Point2, last: Point2 },
    Point3 { format: IntFormat, value: Point3, last: Point3 },
    Vector2 { precision: FloatFormat, value: Vector2, last: Vector2 },
    Vector3 { precision: FloatFormat, value: Vector3, last: Vector3 },
    Quaternion { precision: FloatFormat, value: Quaternion, last: Quaternion },
}

impl Value {
    pub fn int(format: IntFormat, value: i64) -> Value {
        Value::Int { format, value, last: value }
    }

    pub fn float16(value: f32) -> Value {
        Value::Float16 { value, last: value }
    }

    pub fn float32(value: f32) -> Value {
        Value::Float32 { value, last: value }
    }

    pub fn float64(value: f64) -> Value {
        Value::Float64 { value, last: value }
    }

    pub fn string(value: impl Into<String>) -> Value {
        let value = value.into();
        let last = value.clone();
        Value::String { value, last }
    }

    pub fn data(value: Vec<u8>) -> Value {
        let last = value.clone();
        Value::Data { value, last }
    }

    pub fn point2(format: IntFormat, value: Point2) -> Value {
        Value::Point2 { format, value, last: value }
    }

    pub fn point3(format: IntFormat, value: Point3) -> Value {
        Value::Point3 { format, value, last: value }
    }

    pub fn vector2(precision: FloatFormat, value: Vector2) -> Value {
        Value::Vector2 { precision, value, last: value }
    }

    pub fn vector3(precision: FloatFormat, value: Vector3) -> Value {
        Value::Vector3 { precision, value, last: value }
    }

    pub fn quaternion(precision: FloatFormat, value: Quaternion) -> Value {
        Value::Quaternion { precision, value, last: value }
    }

    /// Builds a zero/empty-valued `Value` for `value_type`, used to decode
    /// a wire schema entry: the tag alone picks the variant and its
    /// format/precision, and the caller reads the actual initial value
    /// into the result with [`Value::read`].
    pub fn from_type(value_type: ValueType) -> Value {
        use ValueType::*;
        match value_type {
            Sint8 => Value::int(IntFormat::Sint8, 0),
            Uint8 => Value::int(IntFormat::Uint8, 0),
            Sint16 => Value::int(IntFormat::Sint16, 0),
            Uint16 => Value::int(IntFormat::Uint16, 0),
            Sint32 => Value::int(IntFormat::Sint32, 0),
            Uint32 => Value::int(IntFormat::Uint32, 0),
            Sint64 => Value::int(IntFormat::Sint64, 0),
            Uint64 => Value::int(IntFormat::Uint64, 0),
            Float16 => Value::float16(0.0),
            Float32 => Value::float32(0.0),
            Float64 => Value::float64(0.0),
            String => Value::string(""),
            Data => Value::data(Vec::new()),
            Point2S8 => Value::point2(IntFormat::Sint8, (0, 0)),
            Point2U8 => Value::point2(IntFormat::Uint8, (0, 0)),
            Point2S16 => Value::point2(IntFormat::Sint16, (0, 0)),
            Point2U16 => Value::point2(IntFormat::Uint16, (0, 0)),
            Point2S32 => Value::point2(IntFormat::Sint32, (0, 0)),
            Point2U32 => Value::point2(IntFormat::Uint32, (0, 0)),
            Point2S64 => Value::point2(IntFormat::Sint64, (0, 0)),
            Point2U64 => Value::point2(IntFormat::Uint64, (0, 0)),
            Point3S8 => Value::point3(IntFormat::Sint8, (0, 0, 0)),
            Point3U8 => Value::point3(IntFormat::Uint8, (0, 0, 0)),
            Point3S16 => Value::point3(IntFormat::Sint16, (0, 0, 0)),
            Point3U16 => Value::point3(IntFormat::Uint16, (0, 0, 0)),
            Point3S32 => Value::point3(IntFormat::Sint32, (0, 0, 0)),
            Point3U32 => Value::point3(IntFormat::Uint32, (0, 0, 0)),
            Point3S64 => Value::point3(IntFormat::Sint64, (0, 0, 0)),
            Point3U64 => Value::point3(IntFormat::Uint64, (0, 0, 0)),
            Vector2F16 => Value::vector2(FloatFormat::Float16, (0.0, 0.0)),
            Vector2F32 => Value::vector2(FloatFormat::Float32, (0.0, 0.0)),
            Vector2F64 => Value::vector2(FloatFormat::Float64, (0.0, 0.0)),
            Vector3F16 => Value::vector3(FloatFormat::Float16, (0.0, 0.0, 0.0)),
            Vector3F32 => Value::vector3(FloatFormat::Float32, (0.0, 0.0, 0.0)),
            Vector3F64 => Value::vector3(FloatFormat::Float64, (0.0, 0.0, 0.0)),
            QuaternionF16 => Value::quaternion(FloatFormat::Float16, (0.0, 0.0, 0.0, 0.0)),
            QuaternionF32 => Value::quaternion(FloatFormat::Float32, (0.0, 0.0, 0.0, 0.0)),
            QuaternionF64 => Value::quaternion(FloatFormat::Float64, (0.0, 0.0, 0.0, 0.0)),
        }
    }

    /// Whether `self` and `other` carry the same current value, used by
    /// `State::index_of`. Floats compare by bit pattern like
    /// `update_value` does, for the same NaN-stability reason.
    pub fn value_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Int { value: a, .. }, Value::Int { value: b, .. }) => a == b,
            (Value::Float16 { value: a, .. }, Value::Float16 { value: b, .. }) => a.to_bits() == b.to_bits(),
            (Value::Float32 { value: a, .. }, Value::Float32 { value: b, .. }) => a.to_bits() == b.to_bits(),
            (Value::Float64 { value: a, .. }, Value::Float64 { value: b, .. }) => a.to_bits() == b.to_bits(),
            (Value::String { value: a, .. }, Value::String { value: b, .. }) => a == b,
            (Value::Data { value: a, .. }, Value::Data { value: b, .. }) => a == b,
            (Value::Point2 { value: a, .. }, Value::Point2 { value: b, .. }) => a == b,
            (Value::Point3 { value: a, .. }, Value::Point3 { value: b, .. }) => a == b,
            (Value::Vector2 { value: a, .. }, Value::Vector2 { value: b, .. }) => {
                f64_bits(a.0) == f64_bits(b.0) && f64_bits(a.1) == f64_bits(b.1)
            }
            (Value::Vector3 { value: a, .. }, Value::Vector3 { value: b, .. }) => {
                f64_bits(a.0) == f64_bits(b.0) && f64_bits(a.1) == f64_bits(b.1) && f64_bits(a.2) == f64_bits(b.2)
            }
            (Value::Quaternion { value: a, .. }, Value::Quaternion { value: b, .. }) => {
                f64_bits(a.0) == f64_bits(b.0)
                    && f64_bits(a.1) == f64_bits(b.1)
                    && f64_bits(a.2) == f64_bits(b.2)
                    && f64_bits(a.3) == f64_bits(b.3)
            }
            _ => false,
        }
    }

    /// The wire tag this value serializes as.
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Int { format, .. } => format.scalar_value_type(),
            Value::Float16 { .. } => ValueType::Float16,
            Value::Float32 { .. } => ValueType::Float32,
            Value::Float64 { .. } => ValueType::Float64,
            Value::String { .. } => ValueType::String,
            Value::Data { .. } => ValueType::Data,
            Value::Point2 { format, .. } => format.point2_value_type(),
            Value::Point3 { format, .. } => format.point3_value_type(),
            Value::Vector2 { precision, .. } => match precision {
                FloatFormat::Float16 => ValueType::Vector2F16,
                FloatFormat::Float32 => ValueType::Vector2F32,
                FloatFormat::Float64 => ValueType::Vector2F64,
            },
            Value::Vector3 { precision, .. } => match precision {
                FloatFormat::Float16 => ValueType::Vector3F16,
                FloatFormat::Float32 => ValueType::Vector3F32,
                FloatFormat::Float64 => ValueType::Vector3F64,
            },
            Value::Quaternion { precision, .. } => match precision {
                FloatFormat::Float16 => ValueType::QuaternionF16,
                FloatFormat::Float32 => ValueType::QuaternionF32,
                FloatFormat::Float64 => ValueType::QuaternionF64,
            },
        }
    }

    /// Serializes the current value onto `writer`.
    pub fn write(&self, writer: &mut Writer<'_>) -> NetworkResult<()> {
        match self {
            Value::Int { format, value, .. } => {
                format.write(writer, *value);
                Ok(())
            }
            Value::Float16 { value, .. } => {
                writer.write_float16(*value);
                Ok(())
            }
            Value::Float32 { value, .. } => {
                writer.write_float(*value);
                Ok(())
            }
            Value::Float64 { value, .. } => {
                writer.write_double(*value);
                Ok(())
            }
            Value::String { value, .. } => writer.write_string16(value),
            Value::Data { value, .. } => {
                writer.write_ushort(value.len() as u16);
                writer.write_bytes(value);
                Ok(())
            }
            Value::Point2 { format, value, .. } => {
                format.write(writer, value.0);
                format.write(writer, value.1);
                Ok(())
            }
            Value::Point3 { format, value, .. } => {
                format.write(writer, value.0);
                format.write(writer, value.1);
                format.write(writer, value.2);
                Ok(())
            }
            Value::Vector2 { precision, value, .. } => {
                precision.write(writer, value.0);
                precision.write(writer, value.1);
                Ok(())
            }
            Value::Vector3 { precision, value, .. } => {
                precision.write(writer, value.0);
                precision.write(writer, value.1);
                precision.write(writer, value.2);
                Ok(())
            }
            Value::Quaternion { precision, value, .. } => {
                precision.write(writer, value.0);
                precision.write(writer, value.1);
                precision.write(writer, value.2);
                precision.write(writer, value.3);
                Ok(())
            }
        }
    }

    /// Replaces the current and last-sent value by reading a fresh one
    /// from `reader`, matching this value's own format/precision.
    pub fn read(&mut self, reader: &mut Reader<'_>) -> NetworkResult<()> {
        match self {
            Value::Int { format, value, last } => {
                *value = format.read(reader)?;
                *last = *value;
            }
            Value::Float16 { value, last } => {
                *value = reader.read_float16()?;
                *last = *value;
            }
            Value::Float32 { value, last } => {
                *value = reader.read_float()?;
                *last = *value;
            }
            Value::Float64 { value, last } => {
                *value = reader.read_double()?;
                *last = *value;
            }
            Value::String { value, last } => {
                *value = reader.read_string16()?;
                *last = value.clone();
            }
            Value::Data { value, last } => {
                let len = reader.read_ushort()? as usize;
                *value = reader.read_bytes(len)?.to_vec();
                *last = value.clone();
            }
            Value::Point2 { format, value, last } => {
                *value = (format.read(reader)?, format.read(reader)?);
                *last = *value;
            }
            Value::Point3 { format, value, last } => {
                *value = (format.read(reader)?, format.read(reader)?, format.read(reader)?);
                *last = *value;
            }
            Value::Vector2 { precision, value, last } => {
                *value = (precision.read(reader)?, precision.read(reader)?);
                *last = *value;
            }
            Value::Vector3 { precision, value, last } => {
                *value = (precision.read(reader)?, precision.read(reader)?, precision.read(reader)?);
                *last = *value;
            }
            Value::Quaternion { precision, value, last } => {
                *value = (
                    precision.read(reader)?,
                    precision.read(reader)?,
                    precision.read(reader)?,
                    precision.read(reader)?,
                );
                *last = *value;
            }
        }
        Ok(())
    }

    /// Checks whether the value changed since the last sync and, if so (or
    /// if `force` is set), snapshots it as the new baseline.
    ///
    /// Floats compare by bit pattern rather than by `==`: two `NaN`s with
    /// identical bits count as unchanged, where IEEE equality would always
    /// report a float `NaN` as different from itself and force a resend
    /// every tick.
    pub fn update_value(&mut self, force: bool) -> bool {
        match self {
            Value::Int { value, last, .. } => update_eq(value, last, force),
            Value::Float16 { value, last, .. } => update_f32(value, last, force),
            Value::Float32 { value, last, .. } => update_f32(value, last, force),
            Value::Float64 { value, last, .. } => update_f64(value, last, force),
            Value::String { value, last, .. } => update_eq(value, last, force),
            Value::Data { value, last, .. } => update_eq(value, last, force),
            Value::Point2 { value, last, .. } => update_eq(value, last, force),
            Value::Point3 { value, last, .. } => update_eq(value, last, force),
            Value::Vector2 { value, last, .. } => {
                let changed = force || f64_bits(value.0) != f64_bits(last.0) || f64_bits(value.1) != f64_bits(last.1);
                if changed {
                    *last = *value;
                }
                changed
            }
            Value::Vector3 { value, last, .. } => {
                let changed = force
                    || f64_bits(value.0) != f64_bits(last.0)
                    || f64_bits(value.1) != f64_bits(last.1)
                    || f64_bits(value.2) != f64_bits(last.2);
                if changed {
                    *last = *value;
                }
                changed
            }
            Value::Quaternion { value, last, .. } => {
                let changed = force
                    || f64_bits(value.0) != f64_bits(last.0)
                    || f64_bits(value.1) != f64_bits(last.1)
                    || f64_bits(value.2) != f64_bits(last.2)
                    || f64_bits(value.3) != f64_bits(last.3);
                if changed {
                    *last = *value;
                }
                changed
            }
        }
    }
}

#[inline]
fn update_eq<T: PartialEq + Clone>(value: &T, last: &mut T, force: bool) -> bool {
    let changed = force || *value != *last;
    if changed {
        *last = value.clone();
    }
    changed
}

#[inline]
fn update_f32(value: &f32, last: &mut f32, force: bool) -> bool {
    let changed = force || value.to_bits() != last.to_bits();
    if changed {
        *last = *value;
    }
    changed
}

#[inline]
fn update_f64(value: &f64, last: &mut f64, force: bool) -> bool {
    let changed = force || value.to_bits() != last.to_bits();
    if changed {
        *last = *value;
    }
    changed
}

#[inline]
fn f64_bits(v: f64) -> u64 {
    v.to_bits()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: &Value) -> Value {
        let mut buf = Vec::new();
        value.write(&mut Writer::new(&mut buf)).unwrap();

        let mut out = value.clone();
        out.read(&mut Reader::new(&buf)).unwrap();
        out
    }

    #[test]
    fn int_roundtrip_all_formats() {
        let cases = [
            (IntFormat::Sint8, -12i64),
            (IntFormat::Uint8, 200),
            (IntFormat::Sint16, -1000),
            (IntFormat::Uint16, 40000),
            (IntFormat::Sint32, -70000),
            (IntFormat::Uint32, 3_000_000_000),
            (IntFormat::Sint64, -5_000_000_000),
            (IntFormat::Uint64, 10_000_000_000),
        ];
        for (format, raw) in cases {
            let value = Value::int(format, raw);
            let out = roundtrip(&value);
            match out {
                Value::Int { value, .. } => assert_eq!(value, raw),
                _ => panic!("wrong variant"),
            }
        }
    }

    #[test]
    fn string_roundtrip() {
        let value = Value::string("hello");
        let out = roundtrip(&value);
        match out {
            Value::String { value, .. } => assert_eq!(value, "hello"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn data_roundtrip() {
        let value = Value::data(vec![1, 2, 3, 4]);
        let out = roundtrip(&value);
        match out {
            Value::Data { value, .. } => assert_eq!(value, vec![1, 2, 3, 4]),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn point3_roundtrip() {
        let value = Value::point3(IntFormat::Sint32, (-1, 2, -3));
        let out = roundtrip(&value);
        match out {
            Value::Point3 { value, .. } => assert_eq!(value, (-1, 2, -3)),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn vector3_f16_roundtrip_within_precision() {
        let value = Value::vector3(FloatFormat::Float16, (1.0, -2.0, 0.5));
        let out = roundtrip(&value);
        match out {
            Value::Vector3 { value, .. } => assert_eq!(value, (1.0, -2.0, 0.5)),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn update_value_detects_change_and_resets_baseline() {
        let mut value = Value::int(IntFormat::Sint32, 1);
        assert!(!value.update_value(false));
        if let Value::Int { value: v, .. } = &mut value {
            *v = 2;
        }
        assert!(value.update_value(false));
        assert!(!value.update_value(false));
    }

    #[test]
    fn update_value_force_always_reports_changed() {
        let mut value = Value::int(IntFormat::Sint32, 5);
        assert!(value.update_value(true));
    }

    #[test]
    fn update_value_float_uses_bit_pattern_for_nan() {
        let mut value = Value::float32(f32::NAN);
        // Same NaN bit pattern as the baseline: not considered changed.
        assert!(!value.update_value(false));
    }

    #[test]
    fn update_value_float_detects_different_nan_payloads() {
        let mut value = Value::float32(f32::NAN);
        if let Value::Float32 { value: v, .. } = &mut value {
            *v = f32::from_bits(f32::NAN.to_bits() ^ 1);
        }
        assert!(value.update_value(false));
    }

    #[test]
    fn from_type_then_read_reproduces_schema_entry() {
        let original = Value::int(IntFormat::Sint32, -42);
        let mut buf = Vec::new();
        original.write(&mut Writer::new(&mut buf)).unwrap();

        let mut decoded = Value::from_type(original.value_type());
        decoded.read(&mut Reader::new(&buf)).unwrap();
        assert!(decoded.value_equals(&original));
    }

    #[test]
    fn value_equals_ignores_type_mismatch() {
        let a = Value::int(IntFormat::Sint32, 5);
        let b = Value::string("5");
        assert!(!a.value_equals(&b));
    }

    #[test]
    fn value_equals_uses_bit_pattern_for_nan() {
        let a = Value::float32(f32::NAN);
        let b = Value::float32(f32::NAN);
        assert!(a.value_equals(&b));
    }

    #[test]
    fn value_type_matches_format() {
        assert_eq!(Value::int(IntFormat::Uint64, 0).value_type(), ValueType::Uint64);
        assert_eq!(
            Value::point2(IntFormat::Sint8, (0, 0)).value_type(),
            ValueType::Point2S8
        );
        assert_eq!(
            Value::vector3(FloatFormat::Float64, (0.0, 0.0, 0.0)).value_type(),
            ValueType::Vector3F64
        );
        assert_eq!(
            Value::quaternion(FloatFormat::Float32, (0.0, 0.0, 0.0, 1.0)).value_type(),
            ValueType::QuaternionF32
        );
    }
}
