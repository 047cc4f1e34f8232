//! DBR-style type codes and value containers.
//!
//! Channel Access describes every payload by a numeric "DBR" type that combines a
//! basic data type with a metadata category. This module models both halves, the
//! translation between the typed and numeric representations used at the client
//! library boundary, and the value container passed around inside notifications.
//!
//! The basic types are enumerated in [`DbrBasicType`] and represented in
//! [`DbrValue`] - all numeric data types are signed, and most can represent
//! arrays:
//! - [`DbrValue::Char`] ([`Vec<i8>`])
//! - [`DbrValue::Int`] ([`Vec<i16>`])
//! - [`DbrValue::Long`] ([`Vec<i32>`])
//! - [`DbrValue::Float`] ([`Vec<f32>`])
//! - [`DbrValue::Double`] ([`Vec<f64>`])
//! - [`DbrValue::Enum`] ([`u16`]), an index into a list of up to sixteen label
//!   strings carried by [`CtrlMeta`].
//! - [`DbrValue::String`], natively a fixed `[u8; 40]` on the wire but
//!   represented here as [`Vec<String>`]. Strings are frequently implemented as
//!   Char waveforms in the wild, so [`DbrValue::convert_to`] covers that path.
//!
//! The five metadata categories are enumerated by [`DbrCategory`] and
//! represented by [`Dbr`]:
//! - [`Dbr::Basic`] - the plain data value, no metadata.
//! - [`Dbr::Status`] - alarm status and severity alongside the value.
//! - [`Dbr::Time`] - everything from Status plus a timestamp. This is the
//!   category used for ongoing subscription updates because it is the lightest
//!   one that still timestamps every value.
//! - [`Dbr::Control`] - the "extended" category: status, timestamp, units,
//!   precision, the four limit pairs, and enumeration labels. Used for the
//!   one-shot initial read so metadata is fetched exactly once.
//!
//! [`DbrType`] combines both halves and converts to and from the
//! `category * 7 + basic` integer encoding the protocol uses.

use num::cast::AsPrimitive;
use num::NumCast;
use std::str::FromStr;
use thiserror::Error;

/// Fixed field sizes from the wire representation. Metadata strings longer than
/// these will have been truncated by the client library before we see them.
pub const MAX_UNITS_SIZE: usize = 8;
pub const MAX_ENUM_STRING_SIZE: usize = 26;
pub const MAX_ENUM_STATES: usize = 16;

/// Basic DBR data types, independent of category
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DbrBasicType {
    String = 0,
    Int = 1,
    Float = 2,
    Enum = 3,
    Char = 4,
    Long = 5,
    Double = 6,
}

impl TryFrom<u16> for DbrBasicType {
    type Error = UnknownTypeCode;
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            x if x == Self::String as u16 => Ok(Self::String),
            x if x == Self::Int as u16 => Ok(Self::Int),
            x if x == Self::Float as u16 => Ok(Self::Float),
            x if x == Self::Enum as u16 => Ok(Self::Enum),
            x if x == Self::Char as u16 => Ok(Self::Char),
            x if x == Self::Long as u16 => Ok(Self::Long),
            x if x == Self::Double as u16 => Ok(Self::Double),
            _ => Err(UnknownTypeCode(value as i32)),
        }
    }
}

impl TryFrom<i32> for DbrBasicType {
    type Error = UnknownTypeCode;
    fn try_from(value: i32) -> Result<Self, Self::Error> {
        u16::try_from(value)
            .map_err(|_| UnknownTypeCode(value))?
            .try_into()
    }
}

/// A numeric type code that does not name any known DBR type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unknown DBR type code {0}")]
pub struct UnknownTypeCode(pub i32);

/// Categories of metadata that can accompany a value
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DbrCategory {
    Basic = 0,
    Status = 1,
    Time = 2,
    Graphics = 3,
    Control = 4,
}

impl TryFrom<u16> for DbrCategory {
    type Error = UnknownTypeCode;
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            x if x == Self::Basic as u16 => Ok(Self::Basic),
            x if x == Self::Status as u16 => Ok(Self::Status),
            x if x == Self::Time as u16 => Ok(Self::Time),
            x if x == Self::Graphics as u16 => Ok(Self::Graphics),
            x if x == Self::Control as u16 => Ok(Self::Control),
            _ => Err(UnknownTypeCode(value as i32)),
        }
    }
}

/// Represent and translate from ID every decorated `DBR_*_*` combination
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DbrType {
    pub basic_type: DbrBasicType,
    pub category: DbrCategory,
}

impl DbrType {
    pub fn new(basic_type: DbrBasicType, category: DbrCategory) -> Self {
        Self {
            basic_type,
            category,
        }
    }
}

impl TryFrom<u16> for DbrType {
    type Error = UnknownTypeCode;
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        if value < 35 {
            Ok(Self {
                basic_type: (value % 7).try_into()?,
                category: (value / 7).try_into()?,
            })
        } else {
            Err(UnknownTypeCode(value as i32))
        }
    }
}

impl From<DbrType> for u16 {
    fn from(value: DbrType) -> Self {
        value.category as u16 * 7 + value.basic_type as u16
    }
}

impl FromStr for DbrType {
    type Err = UnknownTypeCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_uppercase();
        let mut s: &str = &upper;
        if let Some(stripped) = s.strip_prefix("DBR_") {
            s = stripped;
        }
        let category = if let Some(split) = s.find('_') {
            let cats = &s[..split];
            s = &s[split + 1..];
            match cats {
                "BASIC" => DbrCategory::Basic,
                "STS" => DbrCategory::Status,
                "TIME" => DbrCategory::Time,
                "GR" => DbrCategory::Graphics,
                "CTRL" => DbrCategory::Control,
                _ => return Err(UnknownTypeCode(-1)),
            }
        } else {
            DbrCategory::Basic
        };
        let kind = match s {
            "STRING" => DbrBasicType::String,
            "INT" | "SHORT" => DbrBasicType::Int,
            "FLOAT" => DbrBasicType::Float,
            "ENUM" => DbrBasicType::Enum,
            "CHAR" => DbrBasicType::Char,
            "LONG" => DbrBasicType::Long,
            "DOUBLE" => DbrBasicType::Double,
            _ => return Err(UnknownTypeCode(-1)),
        };
        Ok(DbrType {
            basic_type: kind,
            category,
        })
    }
}

/// Look up the decorated type code for a basic type code and request category.
///
/// This is the raw form used at the client library boundary, where type codes
/// travel as plain integers. Returns `-1` when the basic code does not name a
/// known type; callers must treat `-1` as "incompatible, do not issue this
/// request".
pub fn dbr_type_code(basic: i32, category: DbrCategory) -> i32 {
    match DbrBasicType::try_from(basic) {
        Ok(basic) => category as i32 * 7 + basic as i32,
        Err(_) => -1,
    }
}

/// Alarm status and severity of a record
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Status {
    pub status: i16,
    pub severity: i16,
}

/// An EPICS-epoch timestamp as carried by Time and Control payloads
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TimeStamp {
    pub secs: u32,
    pub nsecs: u32,
}

/// Display metadata carried by the extended (Control) category
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CtrlMeta {
    pub units: String,
    pub precision: i16,
    /// Limit pairs are (lower, upper)
    pub display_limits: (f64, f64),
    pub alarm_limits: (f64, f64),
    pub warning_limits: (f64, f64),
    pub control_limits: (f64, f64),
    pub enum_states: Vec<String>,
}

/// Failure to convert a [`DbrValue`] between basic types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConvertError {
    #[error("value not representable in the target type")]
    NoConvert,
    #[error("conversion between these basic types is not supported")]
    Unsupported,
}

/// Actual data carried by a notification
#[derive(Clone, Debug, PartialEq)]
pub enum DbrValue {
    Enum(u16),
    String(Vec<String>),
    Char(Vec<i8>),
    Int(Vec<i16>),
    Long(Vec<i32>),
    Float(Vec<f32>),
    Double(Vec<f64>),
}

impl DbrValue {
    pub fn get_count(&self) -> usize {
        match self {
            DbrValue::Enum(_) => 1,
            DbrValue::String(val) => val.len(),
            DbrValue::Char(val) => val.len(),
            DbrValue::Int(val) => val.len(),
            DbrValue::Long(val) => val.len(),
            DbrValue::Float(val) => val.len(),
            DbrValue::Double(val) => val.len(),
        }
    }

    pub fn get_type(&self) -> DbrBasicType {
        match self {
            DbrValue::Enum(_) => DbrBasicType::Enum,
            DbrValue::String(_) => DbrBasicType::String,
            DbrValue::Char(_) => DbrBasicType::Char,
            DbrValue::Int(_) => DbrBasicType::Int,
            DbrValue::Long(_) => DbrBasicType::Long,
            DbrValue::Float(_) => DbrBasicType::Float,
            DbrValue::Double(_) => DbrBasicType::Double,
        }
    }

    /// Convert to another basic type, failing if any element is not
    /// representable in the target type.
    pub fn convert_to(&self, basic_type: DbrBasicType) -> Result<DbrValue, ConvertError> {
        /// Utility function so that we don't have to repeat the map iter conversion
        fn _try_convert_vec<T, U>(from: &[T]) -> Result<Vec<U>, ConvertError>
        where
            T: Copy + NumCast,
            U: NumCast,
        {
            from.iter()
                .map(|n| NumCast::from(*n).ok_or(ConvertError::NoConvert))
                .collect()
        }
        /// Convert a single-item string to a numeric array of its bytes
        fn _encode_string<T>(from: &Vec<String>) -> Result<Vec<T>, ConvertError>
        where
            T: Copy + 'static,
            u8: AsPrimitive<T>,
        {
            Ok(match from.as_slice() {
                [] => Vec::new(),
                [val] => val.as_bytes().iter().map(|c| c.as_()).collect(),
                _ => Err(ConvertError::NoConvert)?,
            })
        }

        Ok(match basic_type {
            DbrBasicType::Char => match self {
                DbrValue::Char(_val) => self.clone(),
                DbrValue::Int(val) => DbrValue::Char(_try_convert_vec(val)?),
                DbrValue::Long(val) => DbrValue::Char(_try_convert_vec(val)?),
                DbrValue::Float(val) => DbrValue::Char(_try_convert_vec(val)?),
                DbrValue::Double(val) => DbrValue::Char(_try_convert_vec(val)?),
                DbrValue::String(val) => DbrValue::Char(_encode_string(val)?),
                DbrValue::Enum(val) => {
                    DbrValue::Char(vec![NumCast::from(*val).ok_or(ConvertError::NoConvert)?])
                }
            },
            DbrBasicType::Int => match self {
                DbrValue::Char(val) => DbrValue::Int(_try_convert_vec(val)?),
                DbrValue::Int(_val) => self.clone(),
                DbrValue::Long(val) => DbrValue::Int(_try_convert_vec(val)?),
                DbrValue::Float(val) => DbrValue::Int(_try_convert_vec(val)?),
                DbrValue::Double(val) => DbrValue::Int(_try_convert_vec(val)?),
                DbrValue::String(val) => DbrValue::Int(_encode_string(val)?),
                DbrValue::Enum(val) => {
                    DbrValue::Int(vec![NumCast::from(*val).ok_or(ConvertError::NoConvert)?])
                }
            },
            DbrBasicType::Long => match self {
                DbrValue::Char(val) => DbrValue::Long(_try_convert_vec(val)?),
                DbrValue::Int(val) => DbrValue::Long(_try_convert_vec(val)?),
                DbrValue::Long(_val) => self.clone(),
                DbrValue::Float(val) => DbrValue::Long(_try_convert_vec(val)?),
                DbrValue::Double(val) => DbrValue::Long(_try_convert_vec(val)?),
                DbrValue::String(val) => DbrValue::Long(_encode_string(val)?),
                DbrValue::Enum(val) => {
                    DbrValue::Long(vec![NumCast::from(*val).ok_or(ConvertError::NoConvert)?])
                }
            },
            DbrBasicType::Float => match self {
                DbrValue::Char(val) => DbrValue::Float(_try_convert_vec(val)?),
                DbrValue::Int(val) => DbrValue::Float(_try_convert_vec(val)?),
                DbrValue::Long(val) => DbrValue::Float(_try_convert_vec(val)?),
                DbrValue::Float(_val) => self.clone(),
                DbrValue::Double(val) => DbrValue::Float(_try_convert_vec(val)?),
                DbrValue::String(val) => DbrValue::Float(_encode_string(val)?),
                DbrValue::Enum(val) => {
                    DbrValue::Float(vec![NumCast::from(*val).ok_or(ConvertError::NoConvert)?])
                }
            },
            DbrBasicType::Double => match self {
                DbrValue::Char(val) => DbrValue::Double(_try_convert_vec(val)?),
                DbrValue::Int(val) => DbrValue::Double(_try_convert_vec(val)?),
                DbrValue::Long(val) => DbrValue::Double(_try_convert_vec(val)?),
                DbrValue::Float(val) => DbrValue::Double(_try_convert_vec(val)?),
                DbrValue::Double(_val) => self.clone(),
                DbrValue::String(val) => DbrValue::Double(_encode_string(val)?),
                DbrValue::Enum(val) => {
                    DbrValue::Double(vec![NumCast::from(*val).ok_or(ConvertError::NoConvert)?])
                }
            },
            DbrBasicType::String => match self {
                DbrValue::String(_) => self.clone(),
                DbrValue::Char(val) => DbrValue::String(vec![String::from_utf8(
                    val.iter().map(|c| *c as u8).collect(),
                )
                .map_err(|_| ConvertError::NoConvert)?]),
                _ => return Err(ConvertError::Unsupported),
            },
            DbrBasicType::Enum => match self {
                DbrValue::Enum(_val) => self.clone(),
                _ => return Err(ConvertError::NoConvert),
            },
        })
    }
}

/// Implement conversions between a native type and a specific DbrValue kind
macro_rules! impl_dbrvalue_conversions_between {
    ($variant:ident, $typ:ty) => {
        impl From<Vec<$typ>> for DbrValue {
            fn from(value: Vec<$typ>) -> Self {
                DbrValue::$variant(value)
            }
        }
        impl From<&$typ> for DbrValue {
            fn from(value: &$typ) -> Self {
                DbrValue::$variant(vec![value.clone()])
            }
        }
        impl TryFrom<&DbrValue> for Vec<$typ> {
            type Error = ConvertError;
            fn try_from(value: &DbrValue) -> Result<Self, Self::Error> {
                Ok(match value.convert_to(DbrBasicType::$variant)? {
                    DbrValue::$variant(v) => v,
                    _ => unreachable!(),
                })
            }
        }
    };
}
impl_dbrvalue_conversions_between!(Char, i8);
impl_dbrvalue_conversions_between!(Int, i16);
impl_dbrvalue_conversions_between!(Long, i32);
impl_dbrvalue_conversions_between!(Float, f32);
impl_dbrvalue_conversions_between!(Double, f64);
impl_dbrvalue_conversions_between!(String, String);

macro_rules! impl_dbrvalue_copy_conversions_between {
    ($variant:ident, $typ:ty) => {
        impl From<$typ> for DbrValue {
            fn from(value: $typ) -> Self {
                DbrValue::$variant(vec![value])
            }
        }
    };
}
impl_dbrvalue_copy_conversions_between!(Char, i8);
impl_dbrvalue_copy_conversions_between!(Int, i16);
impl_dbrvalue_copy_conversions_between!(Long, i32);
impl_dbrvalue_copy_conversions_between!(Float, f32);
impl_dbrvalue_copy_conversions_between!(Double, f64);

/// Structured unit of exchange for a single notification
#[derive(Clone, Debug, PartialEq)]
pub enum Dbr {
    /// Value only, with no metadata
    Basic(DbrValue),
    /// Alarm status metadata alongside the record value
    Status { status: Status, value: DbrValue },
    /// Timestamp, alarm status, and value
    Time {
        status: Status,
        stamp: TimeStamp,
        value: DbrValue,
    },
    /// The extended category: full display metadata, fetched once per channel
    /// establishment rather than with every update
    Control {
        status: Status,
        stamp: TimeStamp,
        meta: CtrlMeta,
        value: DbrValue,
    },
}

impl Dbr {
    /// Retrieve the [`DbrValue`] contained by this DBR
    pub fn value(&self) -> &DbrValue {
        match self {
            Dbr::Basic(value) => value,
            Dbr::Status { value, .. } => value,
            Dbr::Time { value, .. } => value,
            Dbr::Control { value, .. } => value,
        }
    }

    pub fn take_value(self) -> DbrValue {
        match self {
            Dbr::Basic(value) => value,
            Dbr::Status { value, .. } => value,
            Dbr::Time { value, .. } => value,
            Dbr::Control { value, .. } => value,
        }
    }

    /// If a DBR category encoding alarm status, fetch that
    pub fn status(&self) -> Option<Status> {
        match self {
            Dbr::Basic(_) => None,
            Dbr::Status { status, .. } => Some(*status),
            Dbr::Time { status, .. } => Some(*status),
            Dbr::Control { status, .. } => Some(*status),
        }
    }

    /// If a DBR category carrying a timestamp, fetch that
    pub fn stamp(&self) -> Option<TimeStamp> {
        match self {
            Dbr::Time { stamp, .. } | Dbr::Control { stamp, .. } => Some(*stamp),
            _ => None,
        }
    }

    /// Display metadata, present on Control payloads only
    pub fn meta(&self) -> Option<&CtrlMeta> {
        match self {
            Dbr::Control { meta, .. } => Some(meta),
            _ => None,
        }
    }

    pub fn category(&self) -> DbrCategory {
        match self {
            Dbr::Basic(_) => DbrCategory::Basic,
            Dbr::Status { .. } => DbrCategory::Status,
            Dbr::Time { .. } => DbrCategory::Time,
            Dbr::Control { .. } => DbrCategory::Control,
        }
    }

    pub fn data_type(&self) -> DbrType {
        DbrType {
            basic_type: self.value().get_type(),
            category: self.category(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_conversions() {
        let v: DbrValue = vec![500i32].into();
        assert!(v.convert_to(DbrBasicType::Int).is_ok());
        assert!(v.convert_to(DbrBasicType::Char).is_err());

        let v: DbrValue = vec![500.23f32, 12.7f32].into();
        assert_eq!(v.get_count(), 2);
        let v = v.convert_to(DbrBasicType::Int).unwrap();
        assert_eq!(v, DbrValue::Int(vec![500, 12]));

        assert_eq!(
            DbrValue::Float(vec![455.9f32])
                .convert_to(DbrBasicType::Long)
                .unwrap(),
            DbrValue::Long(vec![455])
        );
    }

    #[test]
    fn string_to_char_roundtrip() {
        let s = DbrValue::String(vec!["a test string".to_string()]);
        let as_char = s.convert_to(DbrBasicType::Char).unwrap();
        let re_s = as_char.convert_to(DbrBasicType::String).unwrap();
        assert_eq!(s, re_s);
    }

    #[test]
    fn type_code_encoding() {
        let t = DbrType::new(DbrBasicType::Double, DbrCategory::Time);
        let code: u16 = t.into();
        assert_eq!(code, 20);
        assert_eq!(DbrType::try_from(20u16).unwrap(), t);

        let t = DbrType::new(DbrBasicType::Double, DbrCategory::Control);
        let code: u16 = t.into();
        assert_eq!(code, 34);
        assert!(DbrType::try_from(35u16).is_err());
    }

    #[test]
    fn raw_lookup_rejects_unknown_basic_type() {
        assert_eq!(dbr_type_code(99, DbrCategory::Status), -1);
        assert_eq!(dbr_type_code(-1, DbrCategory::Status), -1);
        assert_eq!(dbr_type_code(7, DbrCategory::Time), -1);
        assert_eq!(
            dbr_type_code(DbrBasicType::Double as i32, DbrCategory::Time),
            20
        );
        assert_eq!(
            dbr_type_code(DbrBasicType::Double as i32, DbrCategory::Control),
            34
        );
    }

    #[test]
    fn dbr_string_names() {
        assert_eq!(
            DbrType::new(DbrBasicType::Int, DbrCategory::Basic),
            "INT".parse().unwrap()
        );
        assert_eq!(
            DbrType::new(DbrBasicType::Int, DbrCategory::Status),
            "DBR_STS_INT".parse().unwrap()
        );
        assert_eq!(
            DbrType::new(DbrBasicType::Int, DbrCategory::Time),
            "TIME_INT".parse().unwrap()
        );
        assert_eq!(
            DbrType::new(DbrBasicType::Double, DbrCategory::Control),
            "DBR_CTRL_DOUBLE".parse().unwrap()
        );
        assert_eq!(
            DbrType::new(DbrBasicType::Int, DbrCategory::Basic),
            "SHORT".parse().unwrap()
        );
        assert!("DBR_BOGUS_INT".parse::<DbrType>().is_err());
    }

    #[test]
    fn payload_accessors() {
        let dbr = Dbr::Control {
            status: Status {
                status: 3,
                severity: 1,
            },
            stamp: TimeStamp {
                secs: 100,
                nsecs: 5,
            },
            meta: CtrlMeta {
                units: "mm".into(),
                precision: 3,
                ..Default::default()
            },
            value: 4.5f64.into(),
        };
        assert_eq!(dbr.status().unwrap().severity, 1);
        assert_eq!(dbr.stamp().unwrap().secs, 100);
        assert_eq!(dbr.meta().unwrap().units, "mm");
        assert_eq!(dbr.category(), DbrCategory::Control);
        let code: u16 = dbr.data_type().into();
        assert_eq!(code, 34);

        let dbr = Dbr::Basic(1i32.into());
        assert!(dbr.status().is_none());
        assert!(dbr.stamp().is_none());
        assert!(dbr.meta().is_none());
    }
}
