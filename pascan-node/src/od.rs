//! Object dictionary
//!
//! # Overview
//!
//! The object dictionary is the main mechanism of configuration and
//! communication for a node. Objects are addressed by a 16-bit index and
//! hold sub-objects addressed by an 8-bit sub-index; all SDO and PDO
//! traffic ultimately reads or writes sub-objects. Objects come in three
//! main varieties:
//!
//! - VAR: a single value, accessed at sub-index 0
//! - ARRAY: homogeneous elements; sub-index 0 is a u8 holding the element
//!   count
//! - RECORD: heterogeneous elements; sub-index 0 holds the highest
//!   implemented sub-index
//!
//! # Value storage
//!
//! Each [`Object`] owns one contiguous, packed byte buffer holding the
//! current values of all of its sub-objects. Every sub-object records the
//! offset of its slot; slots are aligned to the natural alignment of the
//! sub-object's data type. Inserting or removing a sub-object, or writing
//! an array value of a different length, rebuilds the buffer and rewires
//! the recorded offsets in one step. A failed allocation during the
//! rebuild leaves the object exactly as it was.
//!
//! Offsets are only valid until the next structural change; callers must
//! not hold on to them across mutating calls.
//!
//! # Indication hooks
//!
//! Every sub-object can carry a download and an upload hook, and the
//! [`Device`] carries a default pair used when a sub-object has none. The
//! built-in behavior (used when no hook is registered anywhere) decodes,
//! range-checks and commits on download, and encodes the current value on
//! upload. A hook fully replaces that behavior; hooks that want the
//! built-in effect plus side effects call [`Device::commit_download`]
//! themselves.

use std::collections::BTreeMap;
use std::rc::Rc;

use pascan_common::node_id::NodeId;
use pascan_common::sdo::AbortCode;
use pascan_common::values::{DataType, Value};

use crate::error::DeviceError;

/// The kind of an object in the dictionary
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectCode {
    Null = 0,
    Domain = 2,
    DefType = 5,
    DefStruct = 6,
    #[default]
    Var = 7,
    Array = 8,
    Record = 9,
}

impl TryFrom<u8> for ObjectCode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ObjectCode::Null),
            2 => Ok(ObjectCode::Domain),
            5 => Ok(ObjectCode::DefType),
            6 => Ok(ObjectCode::DefStruct),
            7 => Ok(ObjectCode::Var),
            8 => Ok(ObjectCode::Array),
            9 => Ok(ObjectCode::Record),
            _ => Err(()),
        }
    }
}

/// Access mode of a sub-object
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum AccessType {
    /// Read-only, and never changed, even internally by the device
    Const,
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
}

impl AccessType {
    /// Returns true if the sub-object may be read
    pub fn is_readable(self) -> bool {
        !matches!(self, AccessType::Wo)
    }

    /// Returns true if the sub-object may be written
    pub fn is_writable(self) -> bool {
        matches!(
            self,
            AccessType::Wo | AccessType::Rw | AccessType::Rwr | AccessType::Rww
        )
    }
}

/// Address of a sub-object in the dictionary
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubAddr {
    /// The object index
    pub index: u16,
    /// The sub-index
    pub sub: u8,
}

impl SubAddr {
    /// Create a new address
    pub fn new(index: u16, sub: u8) -> Self {
        Self { index, sub }
    }
}

/// Download indication hook
///
/// Receives the assembled download data and either installs it (returning
/// Ok) or rejects it with an abort code.
pub type DownloadHook = Rc<dyn Fn(&mut Device, SubAddr, &[u8]) -> Result<(), AbortCode>>;

/// Upload indication hook
///
/// Produces the bytes to serve for an upload of the sub-object.
pub type UploadHook = Rc<dyn Fn(&Device, SubAddr) -> Result<Vec<u8>, AbortCode>>;

/// A sub-object: one typed value slot within an object
pub struct SubObject {
    sub: u8,
    #[cfg(feature = "names")]
    name: String,
    data_type: DataType,
    access: AccessType,
    pdo_mappable: bool,
    persist: bool,
    low_limit: Option<Value>,
    high_limit: Option<Value>,
    default: Value,
    /// Slot in the parent object's packed storage; None until inserted
    offset: Option<usize>,
    /// Current encoded size of the value in the slot
    size: usize,
    download_hook: Option<DownloadHook>,
    upload_hook: Option<UploadHook>,
}

impl SubObject {
    /// Create a new sub-object holding the type default value
    pub fn new(sub: u8, data_type: DataType) -> Self {
        let default = Value::default_of(data_type);
        let size = default.size();
        Self {
            sub,
            #[cfg(feature = "names")]
            name: String::new(),
            data_type,
            access: AccessType::default(),
            pdo_mappable: false,
            persist: false,
            low_limit: None,
            high_limit: None,
            default,
            offset: None,
            size,
            download_hook: None,
            upload_hook: None,
        }
    }

    /// Set the access mode
    pub fn access(mut self, access: AccessType) -> Self {
        self.access = access;
        self
    }

    /// Set the human readable name
    #[cfg(feature = "names")]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the human readable name
    #[cfg(not(feature = "names"))]
    pub fn with_name(self, _name: impl Into<String>) -> Self {
        self
    }

    /// Set the default value, which becomes the initial current value
    ///
    /// The value must match the sub-object's data type.
    pub fn with_default(mut self, value: Value) -> Self {
        debug_assert_eq!(value.data_type(), self.data_type);
        self.size = value.size();
        self.default = value;
        self
    }

    /// Set the accepted value range (basic types only)
    pub fn limits(mut self, low: Option<Value>, high: Option<Value>) -> Self {
        self.low_limit = low;
        self.high_limit = high;
        self
    }

    /// Allow mapping this sub-object into PDOs
    pub fn pdo_mappable(mut self, mappable: bool) -> Self {
        self.pdo_mappable = mappable;
        self
    }

    /// Include this sub-object in persisted snapshots
    pub fn persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    /// Get the sub-index
    pub fn sub_index(&self) -> u8 {
        self.sub
    }

    /// Get the human readable name
    #[cfg(feature = "names")]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the data type
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Get the access mode
    pub fn access_type(&self) -> AccessType {
        self.access
    }

    /// Returns true if this sub-object may be mapped into a PDO
    pub fn is_pdo_mappable(&self) -> bool {
        self.pdo_mappable
    }

    /// Returns true if this sub-object is included in persisted snapshots
    pub fn is_persistent(&self) -> bool {
        self.persist
    }

    /// Get the lowest accepted written value
    pub fn low_limit(&self) -> Option<&Value> {
        self.low_limit.as_ref()
    }

    /// Get the highest accepted written value
    pub fn high_limit(&self) -> Option<&Value> {
        self.high_limit.as_ref()
    }

    /// Get the default value
    pub fn default_value(&self) -> &Value {
        &self.default
    }

    /// Offset of this sub-object's slot in the parent's packed storage
    ///
    /// Only valid until the next structural change of the parent object.
    pub fn offset(&self) -> Option<usize> {
        self.offset
    }

    /// Current encoded size of the value
    pub fn size(&self) -> usize {
        self.size
    }
}

fn align_up(offset: usize, align: usize) -> usize {
    (offset + align - 1) / align * align
}

/// An object: an ordered set of sub-objects plus their packed value buffer
pub struct Object {
    index: u16,
    #[cfg(feature = "names")]
    name: String,
    code: ObjectCode,
    subs: BTreeMap<u8, SubObject>,
    storage: Vec<u8>,
}

impl Object {
    /// Create a new empty object
    pub fn new(index: u16, code: ObjectCode) -> Self {
        Self {
            index,
            #[cfg(feature = "names")]
            name: String::new(),
            code,
            subs: BTreeMap::new(),
            storage: Vec::new(),
        }
    }

    /// Set the human readable name
    #[cfg(feature = "names")]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the human readable name
    #[cfg(not(feature = "names"))]
    pub fn with_name(self, _name: impl Into<String>) -> Self {
        self
    }

    /// Get the object index
    pub fn index(&self) -> u16 {
        self.index
    }

    /// Get the object code
    pub fn object_code(&self) -> ObjectCode {
        self.code
    }

    /// Get the human readable name
    #[cfg(feature = "names")]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of sub-objects
    pub fn sub_count(&self) -> usize {
        self.subs.len()
    }

    /// Iterate the sub-objects in sub-index order
    pub fn subs(&self) -> impl Iterator<Item = &SubObject> {
        self.subs.values()
    }

    /// Look up a sub-object
    pub fn find_sub(&self, sub: u8) -> Option<&SubObject> {
        self.subs.get(&sub)
    }

    fn find_sub_mut(&mut self, sub: u8) -> Option<&mut SubObject> {
        self.subs.get_mut(&sub)
    }

    /// Insert a sub-object
    ///
    /// Fails with [`DeviceError::InvalidParameter`] if the sub-index is
    /// already taken. On success the packed storage is rebuilt and the
    /// sub-object's default value becomes its current value.
    pub fn insert_sub(&mut self, sub: SubObject) -> Result<(), DeviceError> {
        let sub_index = sub.sub;
        if self.subs.contains_key(&sub_index) || sub.offset.is_some() {
            return Err(DeviceError::InvalidParameter);
        }
        self.subs.insert(sub_index, sub);
        if let Err(e) = self.rebuild_storage(None) {
            self.subs.remove(&sub_index);
            return Err(e);
        }
        Ok(())
    }

    /// Remove a sub-object, rebuilding the packed storage
    pub fn remove_sub(&mut self, sub: u8) -> Option<SubObject> {
        let mut removed = self.subs.remove(&sub)?;
        if let Err(e) = self.rebuild_storage(None) {
            // Allocation shrink failed; put the sub back untouched
            log::warn!("storage rebuild failed on remove: {e}");
            self.subs.insert(sub, removed);
            return None;
        }
        removed.offset = None;
        Some(removed)
    }

    /// Rebuild the packed value buffer
    ///
    /// Walks the sub-objects in sub-index order, aligning each slot to the
    /// data type's natural alignment. Current values are carried over from
    /// the old buffer; a sub-object without a slot gets its default value,
    /// and `pending` overrides the value of one sub-object (used for
    /// length-changing writes). The object is untouched if allocation
    /// fails.
    fn rebuild_storage(&mut self, pending: Option<(u8, &Value)>) -> Result<(), DeviceError> {
        let mut layout: Vec<(u8, usize, usize)> = Vec::new();
        let mut total = 0usize;
        for (idx, sub) in &self.subs {
            let size = match pending {
                Some((p, v)) if *idx == p => v.size(),
                _ => match sub.offset {
                    Some(_) => sub.size,
                    None => sub.default.size(),
                },
            };
            let offset = align_up(total, sub.data_type.alignment());
            layout.push((*idx, offset, size));
            total = offset + size;
        }

        let mut new_storage: Vec<u8> = Vec::new();
        new_storage
            .try_reserve_exact(total)
            .map_err(|_| DeviceError::OutOfMemory)?;
        new_storage.resize(total, 0);

        for &(idx, offset, size) in &layout {
            let sub = &self.subs[&idx];
            if let Some((p, v)) = pending {
                if idx == p {
                    let bytes = v.to_bytes();
                    new_storage[offset..offset + size].copy_from_slice(&bytes);
                    continue;
                }
            }
            match sub.offset {
                Some(old) => new_storage[offset..offset + size]
                    .copy_from_slice(&self.storage[old..old + sub.size]),
                None => {
                    let bytes = sub.default.to_bytes();
                    new_storage[offset..offset + size].copy_from_slice(&bytes);
                }
            }
        }

        self.storage = new_storage;
        for (idx, offset, size) in layout {
            // Unwrap: layout was built from the same map
            let sub = self.subs.get_mut(&idx).unwrap();
            sub.offset = Some(offset);
            sub.size = size;
        }
        Ok(())
    }

    /// Get the current raw bytes of a sub-object's value
    pub fn sub_bytes(&self, sub: u8) -> Result<&[u8], AbortCode> {
        let sub = self.subs.get(&sub).ok_or(AbortCode::NoSuchSubIndex)?;
        let offset = sub.offset.ok_or(AbortCode::GeneralError)?;
        Ok(&self.storage[offset..offset + sub.size])
    }

    /// Decode the current value of a sub-object
    pub fn value(&self, sub: u8) -> Result<Value, AbortCode> {
        let data_type = self
            .subs
            .get(&sub)
            .ok_or(AbortCode::NoSuchSubIndex)?
            .data_type;
        Value::decode(data_type, self.sub_bytes(sub)?)
    }

    /// Install a new current value, with type checking but no access or
    /// range checks
    ///
    /// A value whose encoded size differs from the current one triggers a
    /// storage rebuild.
    pub fn install_value(&mut self, sub: u8, value: Value) -> Result<(), AbortCode> {
        let entry = self.subs.get(&sub).ok_or(AbortCode::NoSuchSubIndex)?;
        if value.data_type() != entry.data_type {
            return Err(AbortCode::TypeMismatch);
        }
        match entry.offset {
            Some(offset) if value.size() == entry.size => {
                let bytes = value.to_bytes();
                self.storage[offset..offset + bytes.len()].copy_from_slice(&bytes);
                Ok(())
            }
            _ => self
                .rebuild_storage(Some((sub, &value)))
                .map_err(|_| AbortCode::OutOfMemory),
        }
    }

    /// Base pointer of the packed storage, for invariant checking
    pub fn storage_len(&self) -> usize {
        self.storage.len()
    }
}

/// A device: the dictionary root owning all objects
///
/// The device also carries the node ID and the identity values mirrored in
/// object 0x1018.
pub struct Device {
    node_id: NodeId,
    vendor_id: u32,
    product_code: u32,
    revision: u32,
    objects: BTreeMap<u16, Object>,
    default_download: Option<DownloadHook>,
    default_upload: Option<UploadHook>,
}

impl Device {
    /// Create a new device with an empty dictionary
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            vendor_id: 0,
            product_code: 0,
            revision: 0,
            objects: BTreeMap::new(),
            default_download: None,
            default_upload: None,
        }
    }

    /// Get the node ID
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Set the node ID
    pub fn set_node_id(&mut self, node_id: NodeId) {
        self.node_id = node_id;
    }

    /// Set the identity values mirrored in object 0x1018
    pub fn set_identity(&mut self, vendor_id: u32, product_code: u32, revision: u32) {
        self.vendor_id = vendor_id;
        self.product_code = product_code;
        self.revision = revision;
    }

    /// Get the vendor ID
    pub fn vendor_id(&self) -> u32 {
        self.vendor_id
    }

    /// Get the product code
    pub fn product_code(&self) -> u32 {
        self.product_code
    }

    /// Get the revision number
    pub fn revision(&self) -> u32 {
        self.revision
    }

    /// Insert an object; fails if the index is already taken
    pub fn insert_object(&mut self, object: Object) -> Result<(), DeviceError> {
        if self.objects.contains_key(&object.index) {
            return Err(DeviceError::InvalidParameter);
        }
        self.objects.insert(object.index, object);
        Ok(())
    }

    /// Remove an object
    pub fn remove_object(&mut self, index: u16) -> Option<Object> {
        self.objects.remove(&index)
    }

    /// Look up an object
    pub fn object(&self, index: u16) -> Option<&Object> {
        self.objects.get(&index)
    }

    /// Look up an object for mutation
    pub fn object_mut(&mut self, index: u16) -> Option<&mut Object> {
        self.objects.get_mut(&index)
    }

    /// Iterate all objects in index order
    pub fn objects(&self) -> impl Iterator<Item = &Object> {
        self.objects.values()
    }

    /// Look up a sub-object
    pub fn find_sub(&self, addr: SubAddr) -> Result<&SubObject, AbortCode> {
        self.objects
            .get(&addr.index)
            .ok_or(AbortCode::NoSuchObject)?
            .find_sub(addr.sub)
            .ok_or(AbortCode::NoSuchSubIndex)
    }

    /// Decode the current value of a sub-object (no access check)
    pub fn value(&self, index: u16, sub: u8) -> Result<Value, AbortCode> {
        self.objects
            .get(&index)
            .ok_or(AbortCode::NoSuchObject)?
            .value(sub)
    }

    /// Install a value directly, bypassing hooks and access/range checks
    pub fn set_value(&mut self, index: u16, sub: u8, value: Value) -> Result<(), AbortCode> {
        self.objects
            .get_mut(&index)
            .ok_or(AbortCode::NoSuchObject)?
            .install_value(sub, value)
    }

    /// Read a sub-object as a u8
    pub fn read_u8(&self, index: u16, sub: u8) -> Result<u8, AbortCode> {
        match self.value(index, sub)? {
            Value::UInt8(v) => Ok(v),
            Value::Boolean(v) => Ok(v as u8),
            _ => Err(AbortCode::TypeMismatch),
        }
    }

    /// Read a sub-object as a u16
    pub fn read_u16(&self, index: u16, sub: u8) -> Result<u16, AbortCode> {
        match self.value(index, sub)? {
            Value::UInt16(v) => Ok(v),
            _ => Err(AbortCode::TypeMismatch),
        }
    }

    /// Read a sub-object as a u32
    pub fn read_u32(&self, index: u16, sub: u8) -> Result<u32, AbortCode> {
        match self.value(index, sub)? {
            Value::UInt32(v) => Ok(v),
            _ => Err(AbortCode::TypeMismatch),
        }
    }

    /// Register a download hook on a sub-object
    pub fn set_download_hook(
        &mut self,
        addr: SubAddr,
        hook: DownloadHook,
    ) -> Result<(), DeviceError> {
        let sub = self
            .objects
            .get_mut(&addr.index)
            .and_then(|o| o.find_sub_mut(addr.sub))
            .ok_or(DeviceError::NotFound)?;
        sub.download_hook = Some(hook);
        Ok(())
    }

    /// Register an upload hook on a sub-object
    pub fn set_upload_hook(&mut self, addr: SubAddr, hook: UploadHook) -> Result<(), DeviceError> {
        let sub = self
            .objects
            .get_mut(&addr.index)
            .and_then(|o| o.find_sub_mut(addr.sub))
            .ok_or(DeviceError::NotFound)?;
        sub.upload_hook = Some(hook);
        Ok(())
    }

    /// Set the device-wide default download hook
    pub fn set_default_download_hook(&mut self, hook: Option<DownloadHook>) {
        self.default_download = hook;
    }

    /// Set the device-wide default upload hook
    pub fn set_default_upload_hook(&mut self, hook: Option<UploadHook>) {
        self.default_upload = hook;
    }

    /// Deliver a download indication: the access-checked write path
    ///
    /// The access check precedes all type checking. When a hook is
    /// registered on the sub-object (or a device default exists), it
    /// replaces the built-in decode / range-check / commit behavior.
    pub fn download(&mut self, addr: SubAddr, data: &[u8]) -> Result<(), AbortCode> {
        let (writable, hook) = {
            let sub = self.find_sub(addr)?;
            (sub.access.is_writable(), sub.download_hook.clone())
        };
        if !writable {
            return Err(AbortCode::ReadOnly);
        }
        let hook = hook.or_else(|| self.default_download.clone());
        match hook {
            Some(hook) => hook(self, addr, data),
            None => self.commit_download(addr, data),
        }
    }

    /// The built-in download behavior: decode, range-check and install
    ///
    /// Public so custom hooks can fall back to it.
    pub fn commit_download(&mut self, addr: SubAddr, data: &[u8]) -> Result<(), AbortCode> {
        let value = {
            let sub = self.find_sub(addr)?;
            let value = Value::decode(sub.data_type, data)?;
            check_limits(sub, &value)?;
            value
        };
        // Unwrap: find_sub above proved the object exists
        self.objects
            .get_mut(&addr.index)
            .unwrap()
            .install_value(addr.sub, value)
    }

    /// Deliver an upload indication: the access-checked read path
    pub fn upload(&self, addr: SubAddr) -> Result<Vec<u8>, AbortCode> {
        let sub = self.find_sub(addr)?;
        if !sub.access.is_readable() {
            return Err(AbortCode::WriteOnly);
        }
        let hook = sub.upload_hook.clone().or_else(|| self.default_upload.clone());
        match hook {
            Some(hook) => hook(self, addr),
            None => self.encode_current(addr),
        }
    }

    /// Restore every sub-object in `range` to its default value
    ///
    /// Used by the NMT reset services: reset-communication restores the
    /// 0x1000 communication profile range, reset-application restores
    /// everything.
    pub fn reset_range(&mut self, range: core::ops::RangeInclusive<u16>) {
        let defaults: Vec<(u16, u8, Value)> = self
            .objects
            .range(range)
            .flat_map(|(index, obj)| {
                obj.subs()
                    .map(move |sub| (*index, sub.sub_index(), sub.default_value().clone()))
            })
            .collect();
        for (index, sub, value) in defaults {
            // Unwrap-free: defaults always fit their own sub-objects
            if let Err(code) = self.set_value(index, sub, value) {
                log::warn!("Failed to reset 0x{index:04X}sub{sub}: {code:?}");
            }
        }
    }

    /// The built-in upload behavior: encode the current value
    ///
    /// Public so custom hooks can fall back to it.
    pub fn encode_current(&self, addr: SubAddr) -> Result<Vec<u8>, AbortCode> {
        Ok(self
            .objects
            .get(&addr.index)
            .ok_or(AbortCode::NoSuchObject)?
            .sub_bytes(addr.sub)?
            .to_vec())
    }
}

/// Check a decoded value against the sub-object's limits
#[cfg(feature = "limits")]
fn check_limits(sub: &SubObject, value: &Value) -> Result<(), AbortCode> {
    use core::cmp::Ordering;

    if let (Some(low), Some(high)) = (&sub.low_limit, &sub.high_limit) {
        if low.cmp_values(high) == Some(Ordering::Greater) {
            return Err(AbortCode::RangeInvalid);
        }
    }
    if let Some(low) = &sub.low_limit {
        if value.cmp_values(low) == Some(Ordering::Less) {
            return Err(AbortCode::ValueTooLow);
        }
    }
    if let Some(high) = &sub.high_limit {
        if value.cmp_values(high) == Some(Ordering::Greater) {
            return Err(AbortCode::ValueTooHigh);
        }
    }
    Ok(())
}

#[cfg(not(feature = "limits"))]
fn check_limits(_sub: &SubObject, _value: &Value) -> Result<(), AbortCode> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var_object(index: u16, ty: DataType) -> Object {
        let mut obj = Object::new(index, ObjectCode::Var);
        obj.insert_sub(SubObject::new(0, ty).access(AccessType::Rw))
            .unwrap();
        obj
    }

    #[test]
    fn storage_offsets_are_aligned() {
        let mut obj = Object::new(0x2000, ObjectCode::Record);
        obj.insert_sub(SubObject::new(0, DataType::UInt8).with_default(Value::UInt8(3)))
            .unwrap();
        obj.insert_sub(SubObject::new(1, DataType::UInt32).access(AccessType::Rw))
            .unwrap();
        obj.insert_sub(SubObject::new(2, DataType::UInt8).access(AccessType::Rw))
            .unwrap();
        obj.insert_sub(SubObject::new(3, DataType::UInt64).access(AccessType::Rw))
            .unwrap();

        for sub in obj.subs() {
            let offset = sub.offset().unwrap();
            let align = sub.data_type().alignment();
            assert_eq!(0, offset % align, "sub {} misaligned", sub.sub_index());
            assert!(offset + sub.size() <= obj.storage_len());
        }
        // sub 0 (u8) at 0, sub 1 (u32) aligned to 4, sub 2 (u8) at 8, sub 3
        // (u64) aligned to 16
        assert_eq!(Some(0), obj.find_sub(0).unwrap().offset());
        assert_eq!(Some(4), obj.find_sub(1).unwrap().offset());
        assert_eq!(Some(8), obj.find_sub(2).unwrap().offset());
        assert_eq!(Some(16), obj.find_sub(3).unwrap().offset());
    }

    #[test]
    fn rebuild_preserves_values() {
        let mut obj = Object::new(0x2000, ObjectCode::Record);
        obj.insert_sub(SubObject::new(1, DataType::UInt32).access(AccessType::Rw))
            .unwrap();
        obj.install_value(1, Value::UInt32(0xDEAD_BEEF)).unwrap();

        // Inserting a sub-object with a lower sub-index shifts the layout
        obj.insert_sub(SubObject::new(0, DataType::UInt8).with_default(Value::UInt8(1)))
            .unwrap();
        assert_eq!(Value::UInt32(0xDEAD_BEEF), obj.value(1).unwrap());
        assert_eq!(Value::UInt8(1), obj.value(0).unwrap());

        obj.remove_sub(0).unwrap();
        assert_eq!(Value::UInt32(0xDEAD_BEEF), obj.value(1).unwrap());
    }

    #[test]
    fn duplicate_sub_insert_is_rejected() {
        let mut obj = var_object(0x2000, DataType::UInt16);
        let result = obj.insert_sub(SubObject::new(0, DataType::UInt8));
        assert_eq!(Err(DeviceError::InvalidParameter), result);
        // The original sub-object is untouched
        assert_eq!(DataType::UInt16, obj.find_sub(0).unwrap().data_type());
    }

    #[test]
    fn string_resize_rebuilds_storage() {
        let mut obj = Object::new(0x2000, ObjectCode::Record);
        obj.insert_sub(
            SubObject::new(1, DataType::VisibleString)
                .access(AccessType::Rw)
                .with_default(Value::VisibleString("abc".into())),
        )
        .unwrap();
        obj.insert_sub(SubObject::new(2, DataType::UInt32).access(AccessType::Rw))
            .unwrap();
        obj.install_value(2, Value::UInt32(7)).unwrap();

        obj.install_value(1, Value::VisibleString("abcdefghij".into()))
            .unwrap();
        assert_eq!(
            Value::VisibleString("abcdefghij".into()),
            obj.value(1).unwrap()
        );
        // The neighbour survived the rebuild
        assert_eq!(Value::UInt32(7), obj.value(2).unwrap());
        assert_eq!(10, obj.find_sub(1).unwrap().size());
    }

    #[test]
    fn access_check_precedes_type_check() {
        let mut device = Device::new(NodeId::Assigned(1));
        let mut obj = Object::new(0x2000, ObjectCode::Var);
        obj.insert_sub(SubObject::new(0, DataType::UInt32)).unwrap();
        device.insert_object(obj).unwrap();

        // A write with a wrong-size payload to a read-only sub-object must
        // report the access violation, not the type mismatch
        let result = device.download(SubAddr::new(0x2000, 0), &[1]);
        assert_eq!(Err(AbortCode::ReadOnly), result);
    }

    #[test]
    fn read_of_write_only_sub_fails() {
        let mut device = Device::new(NodeId::Assigned(1));
        let mut obj = Object::new(0x2000, ObjectCode::Var);
        obj.insert_sub(SubObject::new(0, DataType::UInt32).access(AccessType::Wo))
            .unwrap();
        device.insert_object(obj).unwrap();

        assert_eq!(
            Err(AbortCode::WriteOnly),
            device.upload(SubAddr::new(0x2000, 0))
        );
    }

    #[test]
    #[cfg(feature = "limits")]
    fn limits_are_enforced() {
        let mut device = Device::new(NodeId::Assigned(1));
        let mut obj = Object::new(0x2000, ObjectCode::Var);
        obj.insert_sub(
            SubObject::new(0, DataType::UInt32)
                .access(AccessType::Rw)
                .limits(Some(Value::UInt32(10)), Some(Value::UInt32(100))),
        )
        .unwrap();
        device.insert_object(obj).unwrap();

        let addr = SubAddr::new(0x2000, 0);
        assert_eq!(
            Err(AbortCode::ValueTooLow),
            device.download(addr, &5u32.to_le_bytes())
        );
        assert_eq!(
            Err(AbortCode::ValueTooHigh),
            device.download(addr, &1000u32.to_le_bytes())
        );
        device.download(addr, &50u32.to_le_bytes()).unwrap();
        assert_eq!(Value::UInt32(50), device.value(0x2000, 0).unwrap());
    }

    #[test]
    #[cfg(feature = "limits")]
    fn inverted_limits_fail_with_range_invalid() {
        let mut device = Device::new(NodeId::Assigned(1));
        let mut obj = Object::new(0x2000, ObjectCode::Var);
        obj.insert_sub(
            SubObject::new(0, DataType::UInt32)
                .access(AccessType::Rw)
                .limits(Some(Value::UInt32(100)), Some(Value::UInt32(10))),
        )
        .unwrap();
        device.insert_object(obj).unwrap();

        assert_eq!(
            Err(AbortCode::RangeInvalid),
            device.download(SubAddr::new(0x2000, 0), &50u32.to_le_bytes())
        );
    }

    #[test]
    fn hooks_replace_default_behavior() {
        let mut device = Device::new(NodeId::Assigned(1));
        device.insert_object(var_object(0x2000, DataType::UInt32)).unwrap();
        let addr = SubAddr::new(0x2000, 0);

        // A hook that doubles written values before committing
        device
            .set_download_hook(
                addr,
                Rc::new(|dev, addr, data| {
                    let value = match Value::decode(DataType::UInt32, data)? {
                        Value::UInt32(v) => v,
                        _ => return Err(AbortCode::TypeMismatch),
                    };
                    dev.commit_download(addr, &(value * 2).to_le_bytes())
                }),
            )
            .unwrap();
        device.download(addr, &21u32.to_le_bytes()).unwrap();
        assert_eq!(Value::UInt32(42), device.value(0x2000, 0).unwrap());

        // An upload hook that serves a synthetic value
        device
            .set_upload_hook(addr, Rc::new(|_, _| Ok(vec![9, 0, 0, 0])))
            .unwrap();
        assert_eq!(vec![9, 0, 0, 0], device.upload(addr).unwrap());
    }

    #[test]
    fn default_device_hook_is_used_as_fallback() {
        let mut device = Device::new(NodeId::Assigned(1));
        device.insert_object(var_object(0x2000, DataType::UInt32)).unwrap();
        device.set_default_download_hook(Some(Rc::new(|_, _, _| {
            Err(AbortCode::CannotStore)
        })));
        assert_eq!(
            Err(AbortCode::CannotStore),
            device.download(SubAddr::new(0x2000, 0), &1u32.to_le_bytes())
        );
    }
}
