// Copyright (c) 2024-present, tundra-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    cursor::{Cursor, Order},
    handle::DatabaseHandle,
    schema::FieldValue,
    Env, Lsn, UserValue,
};

/// A long-lived read snapshot pinned at an LSN
///
/// Compactions never reduce the set of versions visible to an open
/// view; retention honors the oldest pinned horizon.
pub struct View {
    env: Env,
    vlsn: Lsn,
}

impl View {
    pub(crate) fn new(env: Env, vlsn: Lsn) -> Self {
        env.pin(vlsn);
        Self { env, vlsn }
    }

    /// The pinned horizon.
    #[must_use]
    pub fn vlsn(&self) -> Lsn {
        self.vlsn
    }

    /// Point read at the pinned horizon.
    pub fn get(
        &self,
        db: &DatabaseHandle,
        key_values: &[FieldValue],
    ) -> crate::Result<Option<UserValue>> {
        let key = db.schema().encode_key(key_values)?;

        Ok(self
            .env
            .get_at(db.db(), &key, self.vlsn)?
            .map(|record| record.value))
    }

    /// Opens a cursor at the pinned horizon.
    pub fn cursor(
        &self,
        db: &DatabaseHandle,
        order: Order,
        key_values: Option<&[FieldValue]>,
        prefix: Option<&[u8]>,
    ) -> crate::Result<Cursor> {
        let key = key_values
            .map(|values| db.schema().encode_key(values))
            .transpose()?;

        let prefix = match prefix {
            Some(prefix) if !prefix.is_empty() => {
                Some(db.schema().encode_prefix(prefix)?)
            }
            _ => None,
        };

        Ok(Cursor::build(
            &self.env,
            db.db(),
            self.vlsn,
            order,
            key,
            prefix,
            true,
        ))
    }
}

impl Drop for View {
    fn drop(&mut self) {
        self.env.unpin(self.vlsn);
    }
}
