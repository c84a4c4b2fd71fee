//! Encryption grouping for DWRF files.
//!
//! Encryption primitives are external: callers supply an
//! [`EncryptionLibrary`] that derives data encryption keys and performs the
//! actual key and data encryption. This module owns the writer-side
//! grouping: the dense node-to-group map, the per-group encryptors, and the
//! encrypted key metadata recorded in every stripe.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use dwrf_error::{dwrf_bail, DwrfResult};

use crate::metadata::{subtree_nodes, DwrfType, KeyProvider};

/// The external encryption primitives: key derivation and AEAD.
pub trait EncryptionLibrary {
    /// Derive a fresh data encryption key for a group from its
    /// user-supplied intermediate key metadata.
    fn generate_data_encryption_key(&self, intermediate_key: &[u8]) -> DwrfResult<Vec<u8>>;

    /// Encrypt a data encryption key under its intermediate key for
    /// inclusion in stripe and file metadata.
    fn encrypt_key(&self, intermediate_key: &[u8], dek: &[u8]) -> DwrfResult<Vec<u8>>;

    /// Recover a data encryption key from its encrypted form. Used by the
    /// read-back path.
    fn decrypt_key(&self, intermediate_key: &[u8], encrypted_dek: &[u8]) -> DwrfResult<Vec<u8>>;

    fn encrypt_data(&self, dek: &[u8], input: &[u8]) -> DwrfResult<Vec<u8>>;

    fn decrypt_data(&self, dek: &[u8], input: &[u8]) -> DwrfResult<Vec<u8>>;
}

/// A data encryption key bound to the library that uses it. One per
/// encryption group, created once per file and used for every stripe in
/// the group and for the group's encrypted file statistics.
#[derive(Clone)]
pub struct DataEncryptor {
    dek: Bytes,
    library: Arc<dyn EncryptionLibrary>,
}

impl DataEncryptor {
    pub fn new(dek: Bytes, library: Arc<dyn EncryptionLibrary>) -> Self {
        Self { dek, library }
    }

    pub fn encrypt(&self, input: &[u8]) -> DwrfResult<Vec<u8>> {
        self.library.encrypt_data(&self.dek, input)
    }

    pub fn decrypt(&self, input: &[u8]) -> DwrfResult<Vec<u8>> {
        self.library.decrypt_data(&self.dek, input)
    }
}

impl std::fmt::Debug for DataEncryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.debug_struct("DataEncryptor").finish_non_exhaustive()
    }
}

/// One group of nodes to encrypt under a shared key. `nodes` are subtree
/// roots; every descendant is encrypted with the group.
#[derive(Clone, Debug)]
pub struct WriterEncryptionGroup {
    pub nodes: Vec<u32>,
    /// Opaque key metadata supplied by the caller; the writer never
    /// interprets it.
    pub intermediate_key_metadata: Bytes,
}

/// The encryption configuration of a writer.
#[derive(Clone, Debug)]
pub struct WriterEncryption {
    pub key_provider: KeyProvider,
    pub groups: Vec<WriterEncryptionGroup>,
}

/// The resolved encryption state: per-group encryptors, encrypted key
/// metadata for stripe footers, and the dense node-to-group map.
pub struct EncryptionInfo {
    encryptors: Vec<DataEncryptor>,
    encrypted_key_metadatas: Vec<Bytes>,
    node_to_group: Vec<Option<u32>>,
}

impl EncryptionInfo {
    /// The unencrypted state: every lookup misses.
    pub fn none(node_count: usize) -> Self {
        Self {
            encryptors: Vec::new(),
            encrypted_key_metadatas: Vec::new(),
            node_to_group: vec![None; node_count],
        }
    }

    /// Resolve an encryption configuration against the type tree: derive a
    /// data encryption key per group, wrap it for the metadata, and expand
    /// each group's subtree roots into the dense node map.
    pub fn try_new(
        encryption: &WriterEncryption,
        library: Arc<dyn EncryptionLibrary>,
        types: &[DwrfType],
    ) -> DwrfResult<Self> {
        let node_to_group = create_node_to_group_map(
            encryption.groups.iter().map(|g| g.nodes.as_slice()),
            types,
        )?;

        let mut encryptors = Vec::with_capacity(encryption.groups.len());
        let mut encrypted_key_metadatas = Vec::with_capacity(encryption.groups.len());
        for group in &encryption.groups {
            let dek = library.generate_data_encryption_key(&group.intermediate_key_metadata)?;
            let encrypted_dek = library.encrypt_key(&group.intermediate_key_metadata, &dek)?;
            encryptors.push(DataEncryptor::new(Bytes::from(dek), library.clone()));
            encrypted_key_metadatas.push(Bytes::from(encrypted_dek));
        }

        Ok(Self {
            encryptors,
            encrypted_key_metadatas,
            node_to_group,
        })
    }

    pub fn group_count(&self) -> usize {
        self.encryptors.len()
    }

    /// The encryption group containing `node`, if any.
    pub fn group_by_node(&self, node: u32) -> Option<u32> {
        self.node_to_group
            .get(node as usize)
            .copied()
            .flatten()
    }

    pub fn encryptor(&self, group: u32) -> DwrfResult<&DataEncryptor> {
        self.encryptors
            .get(group as usize)
            .ok_or_else(|| dwrf_error::dwrf_err!(InvalidEncryption: "no encryptor for group {}", group))
    }

    pub fn encrypted_key_metadatas(&self) -> Vec<Bytes> {
        self.encrypted_key_metadatas.clone()
    }
}

/// Expand each group's subtree roots into a dense node-to-group map,
/// verifying the groups are disjoint.
fn create_node_to_group_map<'a>(
    groups: impl Iterator<Item = &'a [u32]>,
    types: &[DwrfType],
) -> DwrfResult<Vec<Option<u32>>> {
    let mut node_to_group: BTreeMap<u32, u32> = BTreeMap::new();
    for (group_id, roots) in groups.enumerate() {
        for &root in roots {
            if root as usize >= types.len() {
                dwrf_bail!(
                    InvalidEncryption: "group {} names node {} outside the type tree",
                    group_id,
                    root
                );
            }
            for node in subtree_nodes(types, root) {
                if let Some(other) = node_to_group.insert(node, group_id as u32) {
                    dwrf_bail!(
                        InvalidEncryption: "node {} is in both group {} and group {}",
                        node,
                        other,
                        group_id
                    );
                }
            }
        }
    }
    Ok((0..types.len() as u32)
        .map(|node| node_to_group.get(&node).copied())
        .collect())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// A deterministic toy cipher for tests: XOR with a key derived by
    /// byte-rotation. Worthless as cryptography, perfect for verifying the
    /// plumbing because ciphertext differs from plaintext and decryption
    /// requires the right key.
    #[derive(Debug, Default)]
    pub struct RotateXorLibrary;

    fn xor(key: &[u8], input: &[u8]) -> Vec<u8> {
        input
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ key[i % key.len()])
            .collect()
    }

    impl EncryptionLibrary for RotateXorLibrary {
        fn generate_data_encryption_key(&self, intermediate_key: &[u8]) -> DwrfResult<Vec<u8>> {
            if intermediate_key.is_empty() {
                dwrf_bail!(InvalidEncryption: "empty intermediate key");
            }
            Ok(intermediate_key
                .iter()
                .map(|b| b.rotate_left(3))
                .collect())
        }

        fn encrypt_key(&self, intermediate_key: &[u8], dek: &[u8]) -> DwrfResult<Vec<u8>> {
            Ok(xor(intermediate_key, dek))
        }

        fn decrypt_key(
            &self,
            intermediate_key: &[u8],
            encrypted_dek: &[u8],
        ) -> DwrfResult<Vec<u8>> {
            Ok(xor(intermediate_key, encrypted_dek))
        }

        fn encrypt_data(&self, dek: &[u8], input: &[u8]) -> DwrfResult<Vec<u8>> {
            Ok(xor(dek, input))
        }

        fn decrypt_data(&self, dek: &[u8], input: &[u8]) -> DwrfResult<Vec<u8>> {
            Ok(xor(dek, input))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RotateXorLibrary;
    use super::*;
    use crate::metadata::TypeKind;

    fn two_column_types() -> Vec<DwrfType> {
        DwrfType::create_row_type(
            &["a".to_string(), "b".to_string()],
            &[TypeKind::Bigint, TypeKind::Varchar],
        )
    }

    fn encryption(groups: Vec<Vec<u32>>) -> WriterEncryption {
        WriterEncryption {
            key_provider: KeyProvider::CryptoService,
            groups: groups
                .into_iter()
                .enumerate()
                .map(|(i, nodes)| WriterEncryptionGroup {
                    nodes,
                    intermediate_key_metadata: Bytes::from(vec![i as u8 + 1; 8]),
                })
                .collect(),
        }
    }

    #[test]
    fn node_map_covers_group_subtrees() {
        let info = EncryptionInfo::try_new(
            &encryption(vec![vec![1], vec![2]]),
            Arc::new(RotateXorLibrary),
            &two_column_types(),
        )
        .unwrap();
        assert_eq!(info.group_by_node(0), None);
        assert_eq!(info.group_by_node(1), Some(0));
        assert_eq!(info.group_by_node(2), Some(1));
        assert_eq!(info.group_count(), 2);
        assert_eq!(info.encrypted_key_metadatas().len(), 2);
    }

    #[test]
    fn overlapping_groups_rejected() {
        let result = EncryptionInfo::try_new(
            &encryption(vec![vec![1], vec![1]]),
            Arc::new(RotateXorLibrary),
            &two_column_types(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn encryptor_round_trips() {
        let info = EncryptionInfo::try_new(
            &encryption(vec![vec![1]]),
            Arc::new(RotateXorLibrary),
            &two_column_types(),
        )
        .unwrap();
        let encryptor = info.encryptor(0).unwrap();
        let ciphertext = encryptor.encrypt(b"columnar").unwrap();
        assert_ne!(ciphertext.as_slice(), b"columnar");
        assert_eq!(encryptor.decrypt(&ciphertext).unwrap(), b"columnar");
    }
}
