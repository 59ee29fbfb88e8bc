//! Conversion between raw register words and engineering values.

use crate::registers::{DataType, RegisterTemplate};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    Integer(i64),
    Float(f64),
    State { code: i64, label: &'static str },
    /// A state register reported a code missing from its state table.
    UnknownState(i64),
}

impl Value {
    pub fn as_f64(&self) -> f64 {
        match *self {
            Value::Integer(n) => n as f64,
            Value::Float(n) => n,
            Value::State { code, .. } => code as f64,
            Value::UnknownState(code) => code as f64,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Value::Integer(n) => write!(f, "{n}"),
            Value::Float(n) => write!(f, "{n}"),
            Value::State { code: _, label } => f.write_str(label),
            Value::UnknownState(code) => write!(f, "unknown state {code}"),
        }
    }
}

impl serde::Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match *self {
            Value::Integer(n) => serializer.serialize_i64(n),
            Value::Float(n) => serializer.serialize_f64(n),
            Value::State { code: _, label } => serializer.serialize_str(label),
            Value::UnknownState(_) => serializer.serialize_none(),
        }
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum EncodeError {
    #[error("{0} cannot be written to a register")]
    NotFinite(f64),
    #[error("{value} (raw {raw}) does not fit into a {data_type} register")]
    OutOfRange { value: f64, raw: i64, data_type: DataType },
}

/// Combine register words into the integer they represent.
///
/// # Panics
///
/// If the number of words does not match the `data_type`.
pub fn raw_integer(raw: &[u16], data_type: DataType) -> i64 {
    assert_eq!(
        raw.len(),
        data_type.words(),
        "a {data_type} value is made of {} register words",
        data_type.words()
    );
    match data_type {
        DataType::U16 => i64::from(raw[0]),
        DataType::I16 => i64::from(raw[0] as i16),
        DataType::I32 => {
            let combined = (u32::from(raw[0]) << 16) | u32::from(raw[1]);
            i64::from(combined as i32)
        }
    }
}

/// Decode register words into a scaled numeric value.
///
/// Unscaled values stay integers. Scaled values are rounded to `precision` decimal places.
pub fn decode(raw: &[u16], data_type: DataType, scale: f64, precision: u8) -> Value {
    let integer = raw_integer(raw, data_type);
    if scale == 1.0 {
        return Value::Integer(integer);
    }
    Value::Float(round_to(integer as f64 * scale, precision))
}

/// Decode register words read for `template`, resolving state codes to their labels.
pub fn decode_template(raw: &[u16], template: &RegisterTemplate) -> Value {
    if template.states.is_some() {
        let code = raw_integer(raw, template.data_type);
        return match template.state_label(code) {
            Some(label) => Value::State { code, label },
            None => Value::UnknownState(code),
        };
    }
    decode(raw, template.data_type, template.scale, template.precision)
}

/// Encode an engineering value into the register words to write.
pub fn encode(value: f64, data_type: DataType, scale: f64) -> Result<Vec<u16>, EncodeError> {
    let scaled = (value / scale).round();
    if !scaled.is_finite() {
        return Err(EncodeError::NotFinite(value));
    }
    // Saturating cast; anything past the i64 range fails the checks below anyway.
    let raw = scaled as i64;
    let out_of_range = || EncodeError::OutOfRange { value, raw, data_type };
    Ok(match data_type {
        DataType::U16 => vec![u16::try_from(raw).map_err(|_| out_of_range())?],
        DataType::I16 => vec![i16::try_from(raw).map_err(|_| out_of_range())? as u16],
        DataType::I32 => {
            let raw = i32::try_from(raw).map_err(|_| out_of_range())? as u32;
            vec![(raw >> 16) as u16, raw as u16]
        }
    })
}

fn round_to(value: f64, precision: u8) -> f64 {
    let factor = 10f64.powi(i32::from(precision));
    (value * factor).round() / factor
}
