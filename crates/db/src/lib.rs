//! Durable key value storage for the oracle node pipeline.

use reth_db::{
    create_db,
    mdbx::{DatabaseArguments, DatabaseFlags},
    models::ClientVersion,
    transaction::{DbTx, DbTxMut},
    Database, DatabaseEnv, DatabaseError, TableType,
};
use std::{ops::Deref, path::Path, sync::Arc};
use tables::{KvKey, KvTable, KvValue};

pub mod tables;

/// DB module errors
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error from reth-mdbx lib
    #[error("mdbx (database): {0}")]
    GenericRethMdbx(#[from] eyre::Report),

    /// Reth mdbx database backend error
    #[error("mdbx (database): {0}")]
    RethMdbx(#[from] reth_db::mdbx::Error),

    /// Reth database error
    #[error("reth database: {0}")]
    RethDbError(#[from] DatabaseError),

    /// blocking database task did not complete
    #[error("database task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Read the value stored under `key`. [None] if it does not exist.
#[inline(always)]
pub fn get_value_sync<D: Database>(db: Arc<D>, key: &str) -> Result<Option<String>, Error> {
    let value = db.view(|tx| tx.get::<KvTable>(KvKey::from(key)))??;
    Ok(value.map(|v| v.0))
}

/// Read the value stored under `key`. [None] if it does not exist.
pub async fn get_value<D: Database + 'static>(
    db: Arc<D>,
    key: String,
) -> Result<Option<String>, Error> {
    tokio::task::spawn_blocking(move || get_value_sync(db, &key)).await?
}

/// Write `value` under `key`, replacing any previous value.
#[inline(always)]
pub fn put_value_sync<D: Database>(db: Arc<D>, key: &str, value: String) -> Result<(), Error> {
    db.update(|tx| tx.put::<KvTable>(KvKey::from(key), KvValue(value)))??;
    Ok(())
}

/// Write `value` under `key`, replacing any previous value.
pub async fn put_value<D: Database + 'static>(
    db: Arc<D>,
    key: String,
    value: String,
) -> Result<(), Error> {
    tokio::task::spawn_blocking(move || put_value_sync(db, &key, value)).await?
}

/// Open a DB at `path`. Creates the DB if it does not exist.
pub fn init_db<P: AsRef<Path>>(path: P) -> Result<Arc<DatabaseEnv>, Error> {
    let client_version = ClientVersion::default();
    let args = DatabaseArguments::new(client_version.clone());

    let db = create_db(path, args)?;
    db.record_client_version(client_version)?;

    {
        // Mirrors reth's `create_tables`, using our table set.
        let tx = db.deref().begin_rw_txn().map_err(|e| DatabaseError::InitTx(e.into()))?;

        for table in tables::Tables::ALL {
            let flags = match table.table_type() {
                TableType::Table => DatabaseFlags::default(),
                TableType::DupSort => DatabaseFlags::DUP_SORT,
            };

            tx.create_db(Some(table.name()), flags)
                .map_err(|e| DatabaseError::CreateTable(e.into()))?;
        }

        tx.commit().map_err(|e| DatabaseError::Commit(e.into()))?;
    }

    Ok(Arc::new(db))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let db = init_db(dir.path()).unwrap();
            put_value(db.clone(), "listener:0xabc".to_string(), "42".to_string()).await.unwrap();
            put_value(db.clone(), "dev-listener-vrf-state".to_string(), "[]".to_string())
                .await
                .unwrap();
            assert_eq!(
                get_value(db.clone(), "listener:0xabc".to_string()).await.unwrap(),
                Some("42".to_string())
            );
        }

        let db = init_db(dir.path()).unwrap();
        assert_eq!(get_value_sync(db.clone(), "listener:0xabc").unwrap(), Some("42".to_string()));
        assert_eq!(
            get_value_sync(db.clone(), "dev-listener-vrf-state").unwrap(),
            Some("[]".to_string())
        );
        assert_eq!(get_value(db, "listener:0xdef".to_string()).await.unwrap(), None);
    }
}
