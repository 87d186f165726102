//! Dictionary construction from a device description
//!
//! Builds a [`Device`] from a [`DeviceConfig`]: the communication profile
//! objects the engine itself drives (error register, error history, SYNC,
//! TIME, EMCY, heartbeat, identity, PDO parameters) plus the application
//! objects listed in the description.

use pascan_common::constants::object_ids;
use pascan_common::device_config::{
    AccessConfig, ConfigError, DeviceConfig, ObjectConfig, ObjectKindConfig, PdoMappingConfig,
    ValueConfig,
};
use pascan_common::node_id::NodeId;
use pascan_common::values::{DataType, Value};

use crate::error::DeviceError;
use crate::od::{AccessType, Device, Object, ObjectCode, SubObject};
use pascan_common::constants::PDO_MAX_MAPPING_ENTRIES;
use pascan_common::messages::{encode_cob_id, CanId};

impl From<AccessConfig> for AccessType {
    fn from(value: AccessConfig) -> Self {
        match value {
            AccessConfig::Ro => AccessType::Ro,
            AccessConfig::Wo => AccessType::Wo,
            AccessConfig::Rw => AccessType::Rw,
            AccessConfig::Rwr => AccessType::Rwr,
            AccessConfig::Rww => AccessType::Rww,
            AccessConfig::Const => AccessType::Const,
        }
    }
}

/// Surface a construction failure on the object at `index`
fn object_error(index: u16, e: DeviceError) -> ConfigError {
    ConfigError::Inconsistent {
        index,
        reason: e.to_string(),
    }
}

fn convert_value(
    literal: Option<&ValueConfig>,
    ty: DataType,
    index: u16,
    sub: u8,
) -> Result<Value, ConfigError> {
    match literal {
        Some(literal) => literal
            .to_value(ty)
            .ok_or(ConfigError::BadValue { index, sub }),
        None => Ok(Value::default_of(ty)),
    }
}

fn convert_limit(
    literal: Option<&ValueConfig>,
    ty: DataType,
    index: u16,
    sub: u8,
) -> Result<Option<Value>, ConfigError> {
    literal
        .map(|l| l.to_value(ty).ok_or(ConfigError::BadValue { index, sub }))
        .transpose()
}

/// A standard read-write VAR object holding one value
fn rw_var(index: u16, name: &str, default: Value) -> Result<Object, DeviceError> {
    let mut obj = Object::new(index, ObjectCode::Var).with_name(name);
    obj.insert_sub(
        SubObject::new(0, default.data_type())
            .access(AccessType::Rw)
            .with_default(default)
            .persist(true),
    )?;
    Ok(obj)
}

/// A constant VAR object (version strings and similar)
fn const_var(index: u16, name: &str, default: Value) -> Result<Object, DeviceError> {
    let mut obj = Object::new(index, ObjectCode::Var).with_name(name);
    obj.insert_sub(
        SubObject::new(0, default.data_type())
            .access(AccessType::Const)
            .with_default(default),
    )?;
    Ok(obj)
}

fn identity_object(config: &DeviceConfig) -> Result<Object, DeviceError> {
    let mut obj = Object::new(object_ids::IDENTITY, ObjectCode::Record).with_name("Identity");
    obj.insert_sub(SubObject::new(0, DataType::UInt8).with_default(Value::UInt8(4)))?;
    let fields = [
        (1u8, "Vendor ID", config.identity.vendor_id),
        (2, "Product code", config.identity.product_code),
        (3, "Revision number", config.identity.revision_number),
        (4, "Serial number", config.identity.serial_number),
    ];
    for (sub, name, value) in fields {
        obj.insert_sub(
            SubObject::new(sub, DataType::UInt32)
                .with_name(name)
                .with_default(Value::UInt32(value)),
        )?;
    }
    Ok(obj)
}

fn error_history_object(size: u8) -> Result<Object, DeviceError> {
    let mut obj =
        Object::new(object_ids::ERROR_HISTORY, ObjectCode::Array).with_name("Pre-defined error field");
    obj.insert_sub(SubObject::new(0, DataType::UInt8).access(AccessType::Rw))?;
    for sub in 1..=size {
        obj.insert_sub(SubObject::new(sub, DataType::UInt32))?;
    }
    Ok(obj)
}

/// Default COB-ID value for a PDO communication object
///
/// The first four PDOs of each direction get the pre-defined connection
/// set IDs; later PDOs start out disabled.
fn default_pdo_cob(rpdo: bool, num: u8, node_id: NodeId) -> u32 {
    let base: u16 = if rpdo { 0x200 } else { 0x180 };
    match (num, node_id.assigned()) {
        (0..=3, Some(id)) => encode_cob_id(
            CanId::Std(base + num as u16 * 0x100 + id as u16),
            true,
            false,
        ),
        _ => encode_cob_id(CanId::Std(0), false, false),
    }
}

fn pdo_comm_object(rpdo: bool, num: u8, node_id: NodeId) -> Result<Object, DeviceError> {
    let index = if rpdo {
        object_ids::RPDO_COMM_BASE
    } else {
        object_ids::TPDO_COMM_BASE
    } + num as u16;
    let name = if rpdo {
        "RPDO communication parameter"
    } else {
        "TPDO communication parameter"
    };
    let mut obj = Object::new(index, ObjectCode::Record).with_name(name);
    let high_sub = if rpdo { 2u8 } else { 6 };
    obj.insert_sub(SubObject::new(0, DataType::UInt8).with_default(Value::UInt8(high_sub)))?;
    obj.insert_sub(
        SubObject::new(1, DataType::UInt32)
            .with_name("COB-ID")
            .access(AccessType::Rw)
            .with_default(Value::UInt32(default_pdo_cob(rpdo, num, node_id)))
            .persist(true),
    )?;
    obj.insert_sub(
        SubObject::new(2, DataType::UInt8)
            .with_name("Transmission type")
            .access(AccessType::Rw)
            .with_default(Value::UInt8(255))
            .persist(true),
    )?;
    if !rpdo {
        obj.insert_sub(
            SubObject::new(3, DataType::UInt16)
                .with_name("Inhibit time")
                .access(AccessType::Rw)
                .persist(true),
        )?;
        obj.insert_sub(
            SubObject::new(5, DataType::UInt16)
                .with_name("Event timer")
                .access(AccessType::Rw)
                .persist(true),
        )?;
        obj.insert_sub(
            SubObject::new(6, DataType::UInt8)
                .with_name("SYNC start value")
                .access(AccessType::Rw)
                .persist(true),
        )?;
    }
    Ok(obj)
}

fn pdo_mapping_object(rpdo: bool, num: u8) -> Result<Object, DeviceError> {
    let index = if rpdo {
        object_ids::RPDO_MAPPING_BASE
    } else {
        object_ids::TPDO_MAPPING_BASE
    } + num as u16;
    let name = if rpdo {
        "RPDO mapping parameter"
    } else {
        "TPDO mapping parameter"
    };
    let mut obj = Object::new(index, ObjectCode::Record).with_name(name);
    obj.insert_sub(
        SubObject::new(0, DataType::UInt8)
            .access(AccessType::Rw)
            .persist(true),
    )?;
    for sub in 1..=PDO_MAX_MAPPING_ENTRIES as u8 {
        obj.insert_sub(
            SubObject::new(sub, DataType::UInt32)
                .access(AccessType::Rw)
                .persist(true),
        )?;
    }
    Ok(obj)
}

fn application_object(config: &ObjectConfig) -> Result<Object, ConfigError> {
    let index = config.index;
    let name = config.parameter_name.as_deref().unwrap_or("");
    let access: AccessType = config.access_type.into();
    let mappable = config.pdo_mapping.is_mappable();

    let require_type = || {
        config
            .data_type
            .map(|t| t.0)
            .ok_or_else(|| ConfigError::Inconsistent {
                index,
                reason: "missing data_type".into(),
            })
    };
    let sub_error = |sub: u8, e: DeviceError| match e {
        DeviceError::InvalidParameter => ConfigError::Inconsistent {
            index,
            reason: format!("duplicate sub-index {sub}"),
        },
        e => object_error(index, e),
    };

    match config.object_type {
        ObjectKindConfig::Var | ObjectKindConfig::Domain => {
            let ty = match config.object_type {
                ObjectKindConfig::Domain => DataType::Domain,
                _ => require_type()?,
            };
            let code = if ty == DataType::Domain {
                ObjectCode::Domain
            } else {
                ObjectCode::Var
            };
            let mut obj = Object::new(index, code).with_name(name);
            obj.insert_sub(
                SubObject::new(0, ty)
                    .access(access)
                    .with_default(convert_value(config.default_value.as_ref(), ty, index, 0)?)
                    .limits(
                        convert_limit(config.low_limit.as_ref(), ty, index, 0)?,
                        convert_limit(config.high_limit.as_ref(), ty, index, 0)?,
                    )
                    .pdo_mappable(mappable)
                    .persist(config.persist),
            )
            .map_err(|e| object_error(index, e))?;
            Ok(obj)
        }
        ObjectKindConfig::Array => {
            let ty = require_type()?;
            let size = config.array_size.ok_or_else(|| ConfigError::Inconsistent {
                index,
                reason: "missing array_size".into(),
            })?;
            let mut obj = Object::new(index, ObjectCode::Array).with_name(name);
            obj.insert_sub(SubObject::new(0, DataType::UInt8).with_default(Value::UInt8(size)))
                .map_err(|e| object_error(index, e))?;
            for sub in 1..=size {
                let literal = config
                    .default_values
                    .as_ref()
                    .and_then(|v| v.get(sub as usize - 1))
                    .or(config.default_value.as_ref());
                obj.insert_sub(
                    SubObject::new(sub, ty)
                        .access(access)
                        .with_default(convert_value(literal, ty, index, sub)?)
                        .limits(
                            convert_limit(config.low_limit.as_ref(), ty, index, sub)?,
                            convert_limit(config.high_limit.as_ref(), ty, index, sub)?,
                        )
                        .pdo_mappable(mappable)
                        .persist(config.persist),
                )
                .map_err(|e| sub_error(sub, e))?;
            }
            Ok(obj)
        }
        ObjectKindConfig::Record => {
            let mut obj = Object::new(index, ObjectCode::Record).with_name(name);
            let high_sub = config.subs.iter().map(|s| s.sub_index).max().unwrap_or(0);
            obj.insert_sub(SubObject::new(0, DataType::UInt8).with_default(Value::UInt8(high_sub)))
                .map_err(|e| object_error(index, e))?;
            for sub_config in &config.subs {
                let sub = sub_config.sub_index;
                let ty = sub_config.data_type.0;
                obj.insert_sub(
                    SubObject::new(sub, ty)
                        .with_name(sub_config.name.as_deref().unwrap_or(""))
                        .access(sub_config.access_type.into())
                        .with_default(convert_value(
                            sub_config.default_value.as_ref(),
                            ty,
                            index,
                            sub,
                        )?)
                        .limits(
                            convert_limit(sub_config.low_limit.as_ref(), ty, index, sub)?,
                            convert_limit(sub_config.high_limit.as_ref(), ty, index, sub)?,
                        )
                        .pdo_mappable(sub_config.pdo_mapping != PdoMappingConfig::None)
                        .persist(sub_config.persist),
                )
                .map_err(|e| sub_error(sub, e))?;
            }
            Ok(obj)
        }
    }
}

/// Build a device with the full communication profile from a description
pub fn build_device(node_id: NodeId, config: &DeviceConfig) -> Result<Device, ConfigError> {
    let mut device = Device::new(node_id);
    device.set_identity(
        config.identity.vendor_id,
        config.identity.product_code,
        config.identity.revision_number,
    );

    let insert = |device: &mut Device, index: u16, obj: Result<Object, DeviceError>| {
        let obj = obj.map_err(|e| object_error(index, e))?;
        device
            .insert_object(obj)
            .map_err(|_| ConfigError::Inconsistent {
                index,
                reason: "duplicate object index".into(),
            })
    };

    // Communication profile
    let mut error_register = Object::new(object_ids::ERROR_REGISTER, ObjectCode::Var)
        .with_name("Error register");
    error_register
        .insert_sub(SubObject::new(0, DataType::UInt8))
        .map_err(|e| object_error(object_ids::ERROR_REGISTER, e))?;
    insert(&mut device, object_ids::ERROR_REGISTER, Ok(error_register))?;
    insert(
        &mut device,
        object_ids::ERROR_HISTORY,
        error_history_object(config.emcy_history_size),
    )?;
    insert(
        &mut device,
        object_ids::SYNC_COB_ID,
        rw_var(
            object_ids::SYNC_COB_ID,
            "COB-ID SYNC message",
            Value::UInt32(0x80),
        ),
    )?;
    insert(
        &mut device,
        object_ids::SYNC_PERIOD,
        rw_var(
            object_ids::SYNC_PERIOD,
            "Communication cycle period",
            Value::UInt32(0),
        ),
    )?;
    insert(
        &mut device,
        object_ids::SYNC_WINDOW,
        rw_var(
            object_ids::SYNC_WINDOW,
            "Synchronous window length",
            Value::UInt32(0),
        ),
    )?;
    if let Some(device_name) = &config.device_name {
        insert(
            &mut device,
            object_ids::DEVICE_NAME,
            const_var(
                object_ids::DEVICE_NAME,
                "Manufacturer device name",
                Value::VisibleString(device_name.clone()),
            ),
        )?;
    }
    if let Some(hw) = &config.hardware_version {
        insert(
            &mut device,
            object_ids::HARDWARE_VERSION,
            const_var(
                object_ids::HARDWARE_VERSION,
                "Manufacturer hardware version",
                Value::VisibleString(hw.clone()),
            ),
        )?;
    }
    if let Some(sw) = &config.software_version {
        insert(
            &mut device,
            object_ids::SOFTWARE_VERSION,
            const_var(
                object_ids::SOFTWARE_VERSION,
                "Manufacturer software version",
                Value::VisibleString(sw.clone()),
            ),
        )?;
    }
    insert(
        &mut device,
        object_ids::TIME_COB_ID,
        rw_var(
            object_ids::TIME_COB_ID,
            "COB-ID TIME message",
            Value::UInt32(0x100),
        ),
    )?;
    let mut high_res = Object::new(object_ids::HIGH_RES_TIMESTAMP, ObjectCode::Var)
        .with_name("High resolution time stamp");
    high_res
        .insert_sub(
            SubObject::new(0, DataType::UInt32)
                .access(AccessType::Rw)
                .pdo_mappable(true),
        )
        .map_err(|e| object_error(object_ids::HIGH_RES_TIMESTAMP, e))?;
    insert(&mut device, object_ids::HIGH_RES_TIMESTAMP, Ok(high_res))?;
    let emcy_cob = match node_id.assigned() {
        Some(id) => 0x80 + id as u32,
        None => encode_cob_id(CanId::Std(0x80), false, false),
    };
    insert(
        &mut device,
        object_ids::EMCY_COB_ID,
        rw_var(
            object_ids::EMCY_COB_ID,
            "COB-ID EMCY message",
            Value::UInt32(emcy_cob),
        ),
    )?;
    insert(
        &mut device,
        object_ids::EMCY_INHIBIT_TIME,
        rw_var(
            object_ids::EMCY_INHIBIT_TIME,
            "Inhibit time EMCY",
            Value::UInt16(0),
        ),
    )?;
    insert(
        &mut device,
        object_ids::HEARTBEAT_PRODUCER_TIME,
        rw_var(
            object_ids::HEARTBEAT_PRODUCER_TIME,
            "Producer heartbeat time",
            Value::UInt16(config.heartbeat_period),
        ),
    )?;
    insert(&mut device, object_ids::IDENTITY, identity_object(config))?;
    insert(
        &mut device,
        object_ids::SYNC_COUNTER_OVERFLOW,
        rw_var(
            object_ids::SYNC_COUNTER_OVERFLOW,
            "Synchronous counter overflow value",
            Value::UInt8(0),
        ),
    )?;
    if !config.emcy_consumers.is_empty() {
        let mut obj = Object::new(object_ids::EMCY_CONSUMER, ObjectCode::Array)
            .with_name("Emergency consumer object");
        obj.insert_sub(
            SubObject::new(0, DataType::UInt8)
                .with_default(Value::UInt8(config.emcy_consumers.len() as u8)),
        )
        .map_err(|e| object_error(object_ids::EMCY_CONSUMER, e))?;
        for (i, cob) in config.emcy_consumers.iter().enumerate() {
            obj.insert_sub(
                SubObject::new((i + 1) as u8, DataType::UInt32)
                    .access(AccessType::Rw)
                    .with_default(Value::UInt32(*cob))
                    .persist(true),
            )
            .map_err(|e| match e {
                DeviceError::InvalidParameter => ConfigError::Inconsistent {
                    index: object_ids::EMCY_CONSUMER,
                    reason: "too many consumer entries".into(),
                },
                e => object_error(object_ids::EMCY_CONSUMER, e),
            })?;
        }
        insert(&mut device, object_ids::EMCY_CONSUMER, Ok(obj))?;
    }

    // PDO parameter objects
    for num in 0..config.pdos.num_rpdo {
        insert(
            &mut device,
            object_ids::RPDO_COMM_BASE + num as u16,
            pdo_comm_object(true, num, node_id),
        )?;
        insert(
            &mut device,
            object_ids::RPDO_MAPPING_BASE + num as u16,
            pdo_mapping_object(true, num),
        )?;
    }
    for num in 0..config.pdos.num_tpdo {
        insert(
            &mut device,
            object_ids::TPDO_COMM_BASE + num as u16,
            pdo_comm_object(false, num, node_id),
        )?;
        insert(
            &mut device,
            object_ids::TPDO_MAPPING_BASE + num as u16,
            pdo_mapping_object(false, num),
        )?;
    }

    // Application objects
    for object_config in &config.objects {
        insert(
            &mut device,
            object_config.index,
            Ok(application_object(object_config)?),
        )?;
    }

    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
        device_name = "test-node"
        heartbeat_period = 1000

        [identity]
        vendor_id = 0xCAFE
        product_code = 1032
        revision_number = 2

        [pdos]
        num_rpdo = 2
        num_tpdo = 1

        [[objects]]
        index = 0x2000
        parameter_name = "Setpoint"
        data_type = "uint32"
        access_type = "rw"
        default_value = 5
        low_limit = 0
        high_limit = 1000
        pdo_mapping = "rpdo"

        [[objects]]
        index = 0x2001
        object_type = "array"
        data_type = "int16"
        access_type = "ro"
        array_size = 3
        default_values = [1, 2, 3]
        pdo_mapping = "tpdo"
    "#;

    #[test]
    fn builds_communication_profile() {
        let config = DeviceConfig::from_toml_str(CONFIG).unwrap();
        let device = build_device(NodeId::Assigned(5), &config).unwrap();

        assert_eq!(0xCAFE, device.read_u32(0x1018, 1).unwrap());
        assert_eq!(1032, device.read_u32(0x1018, 2).unwrap());
        assert_eq!(1000, device.read_u16(0x1017, 0).unwrap());
        assert_eq!(0x80, device.read_u32(0x1005, 0).unwrap());
        assert_eq!(0x85, device.read_u32(0x1014, 0).unwrap());
        // Default EMCY history of 8 entries plus the counter
        assert_eq!(9, device.object(0x1003).unwrap().sub_count());

        // Pre-defined connection set COB-IDs
        assert_eq!(0x205, device.read_u32(0x1400, 1).unwrap());
        assert_eq!(0x305, device.read_u32(0x1401, 1).unwrap());
        assert_eq!(0x185, device.read_u32(0x1800, 1).unwrap());

        let value = device.value(0x2000, 0).unwrap();
        assert_eq!(Value::UInt32(5), value);
        assert_eq!(Value::Int16(2), device.value(0x2001, 2).unwrap());
        assert_eq!(3, device.read_u8(0x2001, 0).unwrap());
    }

    #[test]
    fn unconfigured_node_disables_predefined_cobs() {
        let config = DeviceConfig::from_toml_str(CONFIG).unwrap();
        let device = build_device(NodeId::Unconfigured, &config).unwrap();
        let raw = device.read_u32(0x1400, 1).unwrap();
        assert_ne!(0, raw & pascan_common::constants::COB_ID_INVALID_BIT);
    }

    #[test]
    fn bad_default_value_is_reported() {
        let text = r#"
            [identity]
            vendor_id = 1
            product_code = 1
            revision_number = 1

            [[objects]]
            index = 0x2000
            data_type = "uint8"
            default_value = 4711
        "#;
        let config = DeviceConfig::from_toml_str(text).unwrap();
        assert!(matches!(
            build_device(NodeId::Assigned(1), &config),
            Err(ConfigError::BadValue {
                index: 0x2000,
                sub: 0
            })
        ));
    }

    #[test]
    fn duplicate_application_index_is_reported() {
        let text = r#"
            [identity]
            vendor_id = 1
            product_code = 1
            revision_number = 1

            [[objects]]
            index = 0x1017
            data_type = "uint16"
        "#;
        let config = DeviceConfig::from_toml_str(text).unwrap();
        assert!(matches!(
            build_device(NodeId::Assigned(1), &config),
            Err(ConfigError::Inconsistent { index: 0x1017, .. })
        ));
    }
}
