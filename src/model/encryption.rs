use crate::error::{MetabaseError, Result};

/// Cipher suite applied to an object's content and metadata. The engine
/// stores the choice; it never performs encryption itself.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum CipherSuite {
    #[default]
    Unspecified,
    /// Content stored without encryption.
    Null,
    AesGcm,
    SecretBox,
}

impl CipherSuite {
    pub fn to_db(self) -> i64 {
        match self {
            CipherSuite::Unspecified => 0,
            CipherSuite::Null => 1,
            CipherSuite::AesGcm => 2,
            CipherSuite::SecretBox => 3,
        }
    }

    pub fn from_db(raw: i64) -> Result<Self> {
        match raw {
            0 => Ok(CipherSuite::Unspecified),
            1 => Ok(CipherSuite::Null),
            2 => Ok(CipherSuite::AesGcm),
            3 => Ok(CipherSuite::SecretBox),
            _ => Err(MetabaseError::Encoding(format!("cipher suite {raw}"))),
        }
    }
}

/// Per-object encryption parameters, packed into a single integer column.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct EncryptionParameters {
    pub cipher_suite: CipherSuite,
    pub block_size: i32,
}

impl EncryptionParameters {
    pub fn is_zero(&self) -> bool {
        self.cipher_suite == CipherSuite::Unspecified && self.block_size == 0
    }

    pub fn verify(&self) -> Result<()> {
        if self.cipher_suite == CipherSuite::Unspecified {
            return Err(MetabaseError::invalid("encryption is missing"));
        }
        if self.cipher_suite != CipherSuite::Null && self.block_size <= 0 {
            return Err(MetabaseError::invalid("encryption block size is negative or zero"));
        }
        Ok(())
    }

    /// Packs the suite into the high half and the block size into the low
    /// half of an i64.
    pub fn to_db(self) -> i64 {
        (self.cipher_suite.to_db() << 32) | i64::from(self.block_size as u32)
    }

    pub fn from_db(raw: i64) -> Result<Self> {
        Ok(EncryptionParameters {
            cipher_suite: CipherSuite::from_db(raw >> 32)?,
            block_size: raw as u32 as i32,
        })
    }
}
