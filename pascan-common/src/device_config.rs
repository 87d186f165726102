//! Device description files
//!
//! A [`DeviceConfig`] is parsed from a TOML file and describes the object
//! dictionary of a device: its identity, the number of PDOs it supports,
//! and the application specific objects. The engine builds the standard
//! communication profile objects (error register, SYNC, TIME, EMCY,
//! heartbeat, identity and the PDO parameter objects) from the same
//! description.
//!
//! # An example TOML file
//!
//! ```toml
//! device_name = "flow-sensor"
//! heartbeat_period = 1000
//!
//! [identity]
//! vendor_id = 0xCAFE
//! product_code = 1032
//! revision_number = 1
//!
//! [pdos]
//! num_rpdo = 4
//! num_tpdo = 4
//!
//! [[objects]]
//! index = 0x2000
//! parameter_name = "Flow Rate"
//! object_type = "var"
//! data_type = "uint32"
//! access_type = "rw"
//! default_value = 0
//! low_limit = 0
//! high_limit = 100000
//! pdo_mapping = "tpdo"
//! ```
//!
//! Application objects should use indices in the 0x2000..=0x5FFF range;
//! the 0x1000 range belongs to the communication profile.

use serde::Deserialize;
use snafu::{ResultExt, Snafu};

use crate::values::{DataType, Value};

/// Error returned when a device description cannot be used
#[derive(Debug, Snafu)]
pub enum ConfigError {
    /// The TOML text could not be parsed
    #[snafu(display("Error parsing device config: {source}"))]
    Parse {
        /// The underlying TOML error
        source: toml::de::Error,
    },
    /// A value in the description does not fit its declared data type
    #[snafu(display("Bad value for object 0x{index:04X}sub{sub}"))]
    BadValue {
        /// The object index
        index: u16,
        /// The sub-index
        sub: u8,
    },
    /// A field combination in the description is inconsistent
    #[snafu(display("Inconsistent config for object 0x{index:04X}: {reason}"))]
    Inconsistent {
        /// The object index
        index: u16,
        /// What is wrong with it
        reason: String,
    },
}

/// A device description, parsed from TOML
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// Human readable device name (object 0x1008)
    pub device_name: Option<String>,
    /// Human readable hardware version (object 0x1009)
    pub hardware_version: Option<String>,
    /// Human readable software version (object 0x100A)
    pub software_version: Option<String>,
    /// Heartbeat producer period in milliseconds (object 0x1017)
    #[serde(default)]
    pub heartbeat_period: u16,
    /// Number of entries in the EMCY history (object 0x1003)
    #[serde(default = "default_emcy_history")]
    pub emcy_history_size: u8,
    /// COB-IDs of emergency producers to monitor (object 0x1028)
    #[serde(default)]
    pub emcy_consumers: Vec<u32>,
    /// The device identity (object 0x1018)
    pub identity: IdentityConfig,
    /// Number of supported PDOs
    #[serde(default)]
    pub pdos: PdoCountConfig,
    /// Application specific objects
    #[serde(default)]
    pub objects: Vec<ObjectConfig>,
}

fn default_emcy_history() -> u8 {
    8
}

impl DeviceConfig {
    /// Parse a device description from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).context(ParseSnafu)
    }
}

/// The 0x1018 identity object content
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct IdentityConfig {
    /// The vendor ID, assigned by CiA
    pub vendor_id: u32,
    /// The product code
    pub product_code: u32,
    /// The revision number
    pub revision_number: u32,
    /// The serial number; often written at run time instead
    #[serde(default)]
    pub serial_number: u32,
}

/// Number of PDOs the device supports
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct PdoCountConfig {
    /// Number of receive PDOs
    #[serde(default)]
    pub num_rpdo: u8,
    /// Number of transmit PDOs
    #[serde(default)]
    pub num_tpdo: u8,
}

/// The kind of an object in the dictionary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKindConfig {
    /// A single value, accessed at sub-index 0
    #[default]
    Var,
    /// A homogeneous array; sub-index 0 holds the element count
    Array,
    /// A heterogeneous record; sub-index 0 holds the highest sub-index
    Record,
    /// A large application data block
    Domain,
}

/// Access mode of a sub-object
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessConfig {
    /// Read-only
    #[default]
    Ro,
    /// Write-only
    Wo,
    /// Read-write
    Rw,
    /// Read-write on process input
    Rwr,
    /// Read-write on process output
    Rww,
    /// Read-only and never changed, even by the device itself
    Const,
}

/// PDO mapping permission of a sub-object
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PdoMappingConfig {
    /// Not mappable
    #[default]
    None,
    /// Mappable into transmit PDOs
    Tpdo,
    /// Mappable into receive PDOs
    Rpdo,
    /// Mappable in both directions
    Both,
}

impl PdoMappingConfig {
    /// Returns true unless mapping is forbidden entirely
    pub fn is_mappable(self) -> bool {
        self != PdoMappingConfig::None
    }
}

/// A typed data type name, e.g. `"uint32"`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataTypeConfig(pub DataType);

impl<'de> Deserialize<'de> for DataTypeConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        name.parse()
            .map(DataTypeConfig)
            .map_err(|_| serde::de::Error::custom(format!("unknown data type \"{name}\"")))
    }
}

/// A literal value in a device description
///
/// Converted to a typed [`Value`] once the target data type is known.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ValueConfig {
    /// A boolean literal
    Bool(bool),
    /// An integer literal
    Int(i64),
    /// A float literal
    Float(f64),
    /// A string literal
    Str(String),
}

impl ValueConfig {
    /// Convert to a typed value, if the literal fits the data type
    pub fn to_value(&self, ty: DataType) -> Option<Value> {
        use DataType::*;
        match (self, ty) {
            (ValueConfig::Bool(b), Boolean) => Some(Value::Boolean(*b)),
            (ValueConfig::Int(v), Boolean) => Some(Value::Boolean(*v != 0)),
            (ValueConfig::Int(v), Int8) => i8::try_from(*v).ok().map(Value::Int8),
            (ValueConfig::Int(v), Int16) => i16::try_from(*v).ok().map(Value::Int16),
            (ValueConfig::Int(v), Int24) => in_range(*v, ty).map(|v| Value::Int24(v as i32)),
            (ValueConfig::Int(v), Int32) => i32::try_from(*v).ok().map(Value::Int32),
            (ValueConfig::Int(v), Int40) => in_range(*v, ty).map(Value::Int40),
            (ValueConfig::Int(v), Int48) => in_range(*v, ty).map(Value::Int48),
            (ValueConfig::Int(v), Int56) => in_range(*v, ty).map(Value::Int56),
            (ValueConfig::Int(v), Int64) => Some(Value::Int64(*v)),
            (ValueConfig::Int(v), UInt8) => u8::try_from(*v).ok().map(Value::UInt8),
            (ValueConfig::Int(v), UInt16) => u16::try_from(*v).ok().map(Value::UInt16),
            (ValueConfig::Int(v), UInt24) => uin_range(*v, ty).map(|v| Value::UInt24(v as u32)),
            (ValueConfig::Int(v), UInt32) => u32::try_from(*v).ok().map(Value::UInt32),
            (ValueConfig::Int(v), UInt40) => uin_range(*v, ty).map(Value::UInt40),
            (ValueConfig::Int(v), UInt48) => uin_range(*v, ty).map(Value::UInt48),
            (ValueConfig::Int(v), UInt56) => uin_range(*v, ty).map(Value::UInt56),
            (ValueConfig::Int(v), UInt64) => u64::try_from(*v).ok().map(Value::UInt64),
            (ValueConfig::Int(v), Real32) => Some(Value::Real32(*v as f32)),
            (ValueConfig::Int(v), Real64) => Some(Value::Real64(*v as f64)),
            (ValueConfig::Float(v), Real32) => Some(Value::Real32(*v as f32)),
            (ValueConfig::Float(v), Real64) => Some(Value::Real64(*v)),
            (ValueConfig::Str(s), VisibleString) => Some(Value::VisibleString(s.clone())),
            (ValueConfig::Str(s), OctetString) => Some(Value::OctetString(s.bytes().collect())),
            (ValueConfig::Str(s), UnicodeString) => {
                Some(Value::UnicodeString(s.encode_utf16().collect()))
            }
            (ValueConfig::Int(v), TimeOfDay) => {
                u64::try_from(*v).ok().and_then(|secs| {
                    crate::values::TimeOfDay::from_unix_seconds(secs).map(Value::TimeOfDay)
                })
            }
            (ValueConfig::Int(v), TimeDiff) => u64::try_from(*v).ok().map(|ms| {
                Value::TimeDiff(crate::values::TimeOfDay::new(
                    (ms / 86_400_000) as u16,
                    (ms % 86_400_000) as u32,
                ))
            }),
            _ => None,
        }
    }
}

fn in_range(v: i64, ty: DataType) -> Option<i64> {
    let bits = ty.fixed_size().unwrap() * 8;
    let min = -(1i64 << (bits - 1));
    let max = (1i64 << (bits - 1)) - 1;
    (min..=max).contains(&v).then_some(v)
}

fn uin_range(v: i64, ty: DataType) -> Option<u64> {
    let bits = ty.fixed_size().unwrap() * 8;
    let max = (1u64 << bits) - 1;
    u64::try_from(v).ok().filter(|v| *v <= max)
}

/// An application object in the device description
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectConfig {
    /// The object index
    pub index: u16,
    /// Human readable object name
    pub parameter_name: Option<String>,
    /// Var, array, record or domain
    #[serde(default)]
    pub object_type: ObjectKindConfig,
    /// Element data type (vars, arrays and domains)
    pub data_type: Option<DataTypeConfig>,
    /// Access mode
    #[serde(default)]
    pub access_type: AccessConfig,
    /// Number of elements for arrays
    pub array_size: Option<u8>,
    /// Default value for vars
    pub default_value: Option<ValueConfig>,
    /// Default values for array elements
    pub default_values: Option<Vec<ValueConfig>>,
    /// Lowest accepted written value (basic types only)
    pub low_limit: Option<ValueConfig>,
    /// Highest accepted written value (basic types only)
    pub high_limit: Option<ValueConfig>,
    /// PDO mapping permission
    #[serde(default)]
    pub pdo_mapping: PdoMappingConfig,
    /// Include this object in persisted snapshots
    #[serde(default)]
    pub persist: bool,
    /// Sub-object descriptions for records
    #[serde(default)]
    pub subs: Vec<SubConfig>,
}

/// A record sub-object in the device description
#[derive(Debug, Clone, Deserialize)]
pub struct SubConfig {
    /// The sub-index
    pub sub_index: u8,
    /// Human readable name
    pub name: Option<String>,
    /// Element data type
    pub data_type: DataTypeConfig,
    /// Access mode
    #[serde(default)]
    pub access_type: AccessConfig,
    /// Default value
    pub default_value: Option<ValueConfig>,
    /// Lowest accepted written value
    pub low_limit: Option<ValueConfig>,
    /// Highest accepted written value
    pub high_limit: Option<ValueConfig>,
    /// PDO mapping permission
    #[serde(default)]
    pub pdo_mapping: PdoMappingConfig,
    /// Include this sub-object in persisted snapshots
    #[serde(default)]
    pub persist: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
        device_name = "flow-sensor"
        heartbeat_period = 1000

        [identity]
        vendor_id = 0xCAFE
        product_code = 1032
        revision_number = 1

        [pdos]
        num_rpdo = 2
        num_tpdo = 2

        [[objects]]
        index = 0x2000
        parameter_name = "Flow Rate"
        data_type = "uint32"
        access_type = "rw"
        default_value = 42
        low_limit = 0
        high_limit = 100000
        pdo_mapping = "tpdo"

        [[objects]]
        index = 0x2001
        parameter_name = "Label"
        data_type = "visible_string"
        access_type = "rw"
        default_value = "abcdefghij"

        [[objects]]
        index = 0x2002
        object_type = "record"
        parameter_name = "Calibration"

        [[objects.subs]]
        sub_index = 1
        data_type = "int16"
        access_type = "rw"
        default_value = -7
    "#;

    #[test]
    fn parse_example() {
        let config = DeviceConfig::from_toml_str(EXAMPLE).unwrap();
        assert_eq!(Some("flow-sensor"), config.device_name.as_deref());
        assert_eq!(1000, config.heartbeat_period);
        assert_eq!(0xCAFE, config.identity.vendor_id);
        assert_eq!(2, config.pdos.num_rpdo);
        assert_eq!(3, config.objects.len());

        let flow = &config.objects[0];
        assert_eq!(0x2000, flow.index);
        assert_eq!(Some(DataTypeConfig(DataType::UInt32)), flow.data_type);
        assert_eq!(AccessConfig::Rw, flow.access_type);
        assert_eq!(
            Some(Value::UInt32(42)),
            flow.default_value
                .as_ref()
                .and_then(|v| v.to_value(DataType::UInt32))
        );

        let record = &config.objects[2];
        assert_eq!(ObjectKindConfig::Record, record.object_type);
        assert_eq!(1, record.subs.len());
        assert_eq!(
            Some(Value::Int16(-7)),
            record.subs[0]
                .default_value
                .as_ref()
                .and_then(|v| v.to_value(DataType::Int16))
        );
    }

    #[test]
    fn literal_conversion_respects_ranges() {
        assert_eq!(None, ValueConfig::Int(300).to_value(DataType::UInt8));
        assert_eq!(
            Some(Value::Int24(-(1 << 23))),
            ValueConfig::Int(-(1 << 23)).to_value(DataType::Int24)
        );
        assert_eq!(None, ValueConfig::Int(1 << 24).to_value(DataType::UInt24));
        assert_eq!(
            Some(Value::Real32(1.5)),
            ValueConfig::Float(1.5).to_value(DataType::Real32)
        );
    }

    #[test]
    fn bad_type_name_is_rejected() {
        let text = r#"
            [identity]
            vendor_id = 1
            product_code = 1
            revision_number = 1

            [[objects]]
            index = 0x2000
            data_type = "uint31"
        "#;
        assert!(DeviceConfig::from_toml_str(text).is_err());
    }
}
