//! Push credential storage using redb.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use redb::{Database, TableDefinition};
use serde::{Deserialize, Serialize};

use fleetmdm_core::codec::base64_bytes;

use crate::{Error, Result};

// Push info table: key = udid, value = PushInfo (JSON)
pub(crate) const PUSH_INFO_TABLE: TableDefinition<&str, &str> = TableDefinition::new("push_info");

/// What the push trigger needs to wake a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushInfo {
    pub udid: String,
    /// Raw device token.
    #[serde(with = "base64_bytes")]
    pub token: Vec<u8>,
    pub push_magic: String,
    /// Push channel identifier.
    #[serde(default)]
    pub topic: String,
    pub updated_at: DateTime<Utc>,
}

/// Push info storage.
#[derive(Clone)]
pub struct PushInfoStorage {
    db: Arc<Database>,
}

impl PushInfoStorage {
    pub(crate) fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn get(&self, udid: &str) -> Result<Option<PushInfo>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PUSH_INFO_TABLE)?;
        match table.get(udid)? {
            Some(value) => Ok(Some(serde_json::from_str(value.value())?)),
            None => Ok(None),
        }
    }

    /// Insert or replace the credentials for `info.udid`.
    pub fn put(&self, info: &PushInfo) -> Result<()> {
        if info.udid.is_empty() {
            return Err(Error::InvalidInput("push info has an empty UDID".into()));
        }
        let json = serde_json::to_string(info)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(PUSH_INFO_TABLE)?;
            table.insert(info.udid.as_str(), json.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}
