//! Device record storage using redb.
//!
//! One record per UDID, stored as JSON. A secondary index maps serial numbers
//! back to UDIDs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use fleetmdm_core::checkin::Authenticate;
use fleetmdm_core::codec::base64_bytes;

use crate::{Error, Result};

// Devices table: key = udid, value = DeviceRecord (JSON)
pub(crate) const DEVICES_TABLE: TableDefinition<&str, &str> = TableDefinition::new("devices");

// Serial index: key = serial number, value = udid
pub(crate) const SERIAL_INDEX_TABLE: TableDefinition<&str, &str> =
    TableDefinition::new("device_serial_index");

/// A managed device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Server-assigned identifier.
    pub uuid: String,
    pub udid: String,
    #[serde(default)]
    pub serial_number: String,
    #[serde(default)]
    pub os_version: String,
    #[serde(default)]
    pub build_version: String,
    #[serde(default)]
    pub product_name: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub imei: String,
    #[serde(default)]
    pub meid: String,
    /// Push channel the device registered on.
    #[serde(default)]
    pub topic: String,
    #[serde(default, with = "base64_bytes")]
    pub push_token: Vec<u8>,
    #[serde(default)]
    pub push_magic: String,
    #[serde(default, with = "base64_bytes")]
    pub unlock_token: Vec<u8>,
    #[serde(default)]
    pub enrolled: bool,
    #[serde(default)]
    pub awaiting_configuration: bool,
    pub created_at: DateTime<Utc>,
    /// Time of the latest check-in.
    pub last_seen: DateTime<Utc>,
}

impl DeviceRecord {
    /// A fresh record populated from an Authenticate check-in.
    pub fn from_authenticate(auth: &Authenticate) -> Self {
        let now = Utc::now();
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            udid: auth.udid.clone(),
            serial_number: auth.serial_number.clone(),
            os_version: auth.os_version.clone(),
            build_version: auth.build_version.clone(),
            product_name: auth.product_name.clone(),
            model: auth.model.clone(),
            device_name: auth.device_name.clone(),
            imei: auth.imei.clone(),
            meid: auth.meid.clone(),
            topic: auth.topic.clone(),
            push_token: Vec::new(),
            push_magic: String::new(),
            unlock_token: Vec::new(),
            enrolled: false,
            awaiting_configuration: false,
            created_at: now,
            last_seen: now,
        }
    }
}

/// Device storage.
#[derive(Clone)]
pub struct DeviceStorage {
    db: Arc<Database>,
}

impl DeviceStorage {
    pub(crate) fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Look up a device by UDID.
    pub fn get(&self, udid: &str) -> Result<Option<DeviceRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(DEVICES_TABLE)?;
        match table.get(udid)? {
            Some(value) => Ok(Some(serde_json::from_str(value.value())?)),
            None => Ok(None),
        }
    }

    /// Insert `record` unless its UDID is already present.
    ///
    /// Returns whether the record was inserted.
    pub fn insert_if_absent(&self, record: &DeviceRecord) -> Result<bool> {
        if record.udid.is_empty() {
            return Err(Error::InvalidInput("device record has an empty UDID".into()));
        }
        let write_txn = self.db.begin_write()?;
        let inserted = {
            let mut devices = write_txn.open_table(DEVICES_TABLE)?;
            if devices.get(record.udid.as_str())?.is_some() {
                false
            } else {
                let json = serde_json::to_string(record)?;
                devices.insert(record.udid.as_str(), json.as_str())?;
                if !record.serial_number.is_empty() {
                    let mut index = write_txn.open_table(SERIAL_INDEX_TABLE)?;
                    index.insert(record.serial_number.as_str(), record.udid.as_str())?;
                }
                true
            }
        };
        write_txn.commit()?;
        Ok(inserted)
    }

    /// Apply `f` to the stored record for `udid` and persist the result.
    ///
    /// Read and write happen in one transaction. Fails with
    /// [`Error::NotFound`] when the device is unknown.
    pub fn update<F>(&self, udid: &str, f: F) -> Result<DeviceRecord>
    where
        F: FnOnce(&mut DeviceRecord),
    {
        let write_txn = self.db.begin_write()?;
        let record = {
            let mut devices = write_txn.open_table(DEVICES_TABLE)?;
            let existing = devices.get(udid)?.map(|v| v.value().to_string());
            let Some(json) = existing else {
                return Err(Error::NotFound(format!("device {}", udid)));
            };
            let mut record: DeviceRecord = serde_json::from_str(&json)?;
            let previous_serial = record.serial_number.clone();
            f(&mut record);
            record.udid = udid.to_string();

            let json = serde_json::to_string(&record)?;
            devices.insert(udid, json.as_str())?;

            if previous_serial != record.serial_number {
                let mut index = write_txn.open_table(SERIAL_INDEX_TABLE)?;
                if !previous_serial.is_empty() {
                    index.remove(previous_serial.as_str())?;
                }
                if !record.serial_number.is_empty() {
                    index.insert(record.serial_number.as_str(), udid)?;
                }
            }
            record
        };
        write_txn.commit()?;
        Ok(record)
    }

    /// All devices, ordered by UDID.
    pub fn list(&self) -> Result<Vec<DeviceRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(DEVICES_TABLE)?;
        let mut records = Vec::new();
        for item in table.iter()? {
            let (_, value) = item?;
            records.push(serde_json::from_str(value.value())?);
        }
        Ok(records)
    }

    /// Look up a device by serial number.
    pub fn by_serial(&self, serial: &str) -> Result<Option<DeviceRecord>> {
        let udid = {
            let read_txn = self.db.begin_read()?;
            let index = read_txn.open_table(SERIAL_INDEX_TABLE)?;
            index.get(serial)?.map(|v| v.value().to_string())
        };
        match udid {
            Some(udid) => self.get(&udid),
            None => Ok(None),
        }
    }
}
