//! Provider-native source ids to stable internal ids.
//!
//! The derivation is a fixed contract shared with every downstream reader of
//! the model tree:
//!
//! ```text
//! internal_id = PREFIX "_" UPPER_HEX(SHA-256(provider_key 0x00 normalized_source_id))[..24]
//! ```

use sha2::{Digest, Sha256};

use crate::domain::{InternalId, Provider, SourceId};
use crate::error::KiraError;

pub const DIGEST_HEX_LEN: usize = 24;

pub struct IdMapper;

impl IdMapper {
    pub fn assign_or_lookup(
        provider: Provider,
        raw: &str,
    ) -> Result<(SourceId, InternalId), KiraError> {
        let source_id = SourceId::parse(provider, raw)?;
        let internal_id = Self::derive(provider, &source_id);
        Ok((source_id, internal_id))
    }

    pub fn derive(provider: Provider, source_id: &SourceId) -> InternalId {
        let mut hasher = Sha256::new();
        hasher.update(provider.key().as_bytes());
        hasher.update([0u8]);
        hasher.update(source_id.as_str().as_bytes());
        let digest = hex::encode_upper(hasher.finalize());
        InternalId::from_parts(provider, &digest[..DIGEST_HEX_LEN])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_stable() {
        let (_, first) = IdMapper::assign_or_lookup(Provider::ModelArchive, "ma-ornl-0001").unwrap();
        let (_, second) =
            IdMapper::assign_or_lookup(Provider::ModelArchive, "MA-ORNL-0001").unwrap();
        assert_eq!(first, second);
        assert!(first.as_str().starts_with("MA_"));
        assert_eq!(first.digest().len(), DIGEST_HEX_LEN);
    }

    #[test]
    fn same_source_id_differs_across_providers() {
        let (_, ftp) = IdMapper::assign_or_lookup(Provider::AlphaFold, "AF-P96541-F1").unwrap();
        let (_, cloud) =
            IdMapper::assign_or_lookup(Provider::AlphaFoldCloud, "AF-P96541-F1").unwrap();
        assert_ne!(ftp, cloud);
        assert_eq!(ftp.digest().len(), cloud.digest().len());
    }

    #[test]
    fn parsed_back_from_string() {
        let (_, id) = IdMapper::assign_or_lookup(Provider::ModBase, "model_ecac68b60ee6877ccde36af05cdeac58")
            .unwrap();
        let parsed: InternalId = id.as_str().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(parsed.provider(), Provider::ModBase);
    }
}
