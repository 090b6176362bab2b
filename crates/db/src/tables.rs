//! Database tables

use borsh::{BorshDeserialize, BorshSerialize};
use reth_db::{
    table::{Decode, Encode},
    tables, DatabaseError, TableType, TableViewer,
};
use std::fmt;

macro_rules! impl_compress_decompress {
    ($name:ident) => {
        impl reth_db::table::Compress for $name {
            type Compressed = Vec<u8>;

            fn compress_to_buf<B: bytes::BufMut + AsMut<[u8]>>(self, dest: &mut B) {
                let src = borsh::to_vec(&self).expect("borsh serialize works. qed.");
                dest.put(&src[..])
            }
        }

        impl reth_db::table::Decompress for $name {
            fn decompress<B: AsRef<[u8]>>(value: B) -> Result<Self, reth_db::DatabaseError> {
                borsh::from_slice(value.as_ref()).map_err(|_| reth_db::DatabaseError::Decode)
            }
        }
    };
}

/// Key into [`KvTable`]. Keys are stored as their raw UTF-8 bytes so that
/// cursor iteration returns entries in lexicographic key order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct KvKey(pub String);

impl Encode for KvKey {
    type Encoded = Vec<u8>;

    fn encode(self) -> Self::Encoded {
        self.0.into_bytes()
    }
}

impl Decode for KvKey {
    fn decode<B: AsRef<[u8]>>(value: B) -> Result<Self, DatabaseError> {
        String::from_utf8(value.as_ref().to_vec()).map(Self).map_err(|_| DatabaseError::Decode)
    }
}

impl From<&str> for KvKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

/// Value stored in [`KvTable`].
#[derive(
    Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, BorshSerialize, BorshDeserialize,
)]
pub struct KvValue(pub String);

impl_compress_decompress! { KvValue }

reth_db::tables! {
    /// Pipeline state: active listener and reporter sets, listener watermarks.
    table KvTable<Key = KvKey, Value = KvValue>;
}
