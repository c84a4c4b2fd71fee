//! The in-memory row batches consumed by the writer.

use std::sync::Arc;

use dwrf_error::{dwrf_bail, DwrfResult};

use crate::metadata::TypeKind;

/// Logical size of a null value for raw-size accounting.
pub(crate) const NULL_SIZE: u64 = 1;
/// Logical size of a non-null 64-bit integer.
pub(crate) const LONG_SIZE: u64 = 8;

/// A batch of rows: one [`Block`] per column, all with the same length.
#[derive(Clone, Debug)]
pub struct Page {
    blocks: Vec<Block>,
    position_count: usize,
}

impl Page {
    pub fn try_new(blocks: Vec<Block>) -> DwrfResult<Self> {
        let Some(first) = blocks.first() else {
            dwrf_bail!(InvalidArgument: "page must have at least one column");
        };
        let position_count = first.len();
        for (channel, block) in blocks.iter().enumerate() {
            if block.len() != position_count {
                dwrf_bail!(
                    InvalidArgument: "column {} has {} positions, expected {}",
                    channel,
                    block.len(),
                    position_count
                );
            }
        }
        Ok(Self {
            blocks,
            position_count,
        })
    }

    pub fn position_count(&self) -> usize {
        self.position_count
    }

    pub fn channel_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn block(&self, channel: usize) -> &Block {
        &self.blocks[channel]
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// A zero-copy view of `len` rows starting at `offset`.
    pub fn region(&self, offset: usize, len: usize) -> Page {
        assert!(offset + len <= self.position_count, "region out of bounds");
        Page {
            blocks: self.blocks.iter().map(|b| b.region(offset, len)).collect(),
            position_count: len,
        }
    }

    /// The logical (unencoded, uncompressed) size of the page.
    pub fn size_in_bytes(&self) -> u64 {
        self.blocks.iter().map(Block::size_in_bytes).sum()
    }
}

/// A column of values within a [`Page`]. Blocks share their backing
/// storage, so regions are cheap.
#[derive(Clone, Debug)]
pub enum Block {
    Bigint(BigintBlock),
    Varchar(VarcharBlock),
}

impl Block {
    pub fn len(&self) -> usize {
        match self {
            Self::Bigint(b) => b.len,
            Self::Varchar(b) => b.len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> TypeKind {
        match self {
            Self::Bigint(_) => TypeKind::Bigint,
            Self::Varchar(_) => TypeKind::Varchar,
        }
    }

    pub fn region(&self, offset: usize, len: usize) -> Block {
        match self {
            Self::Bigint(b) => Self::Bigint(b.region(offset, len)),
            Self::Varchar(b) => Self::Varchar(b.region(offset, len)),
        }
    }

    pub fn size_in_bytes(&self) -> u64 {
        match self {
            Self::Bigint(b) => b
                .iter()
                .map(|v| if v.is_some() { LONG_SIZE } else { NULL_SIZE })
                .sum(),
            Self::Varchar(b) => b
                .iter()
                .map(|v| v.map(|s| s.len() as u64).unwrap_or(NULL_SIZE))
                .sum(),
        }
    }
}

impl From<BigintBlock> for Block {
    fn from(block: BigintBlock) -> Self {
        Self::Bigint(block)
    }
}

impl From<VarcharBlock> for Block {
    fn from(block: VarcharBlock) -> Self {
        Self::Varchar(block)
    }
}

/// A block of nullable 64-bit integers.
#[derive(Clone, Debug)]
pub struct BigintBlock {
    values: Arc<[i64]>,
    validity: Option<Arc<[bool]>>,
    offset: usize,
    len: usize,
}

impl BigintBlock {
    pub fn from_values(values: Vec<i64>) -> Self {
        let len = values.len();
        Self {
            values: values.into(),
            validity: None,
            offset: 0,
            len,
        }
    }

    pub fn from_nullable(values: Vec<Option<i64>>) -> Self {
        let len = values.len();
        let validity: Arc<[bool]> = values.iter().map(Option::is_some).collect();
        let values: Arc<[i64]> = values.into_iter().map(Option::unwrap_or_default).collect();
        Self {
            values,
            validity: Some(validity),
            offset: 0,
            len,
        }
    }

    pub fn get(&self, position: usize) -> Option<i64> {
        assert!(position < self.len);
        let index = self.offset + position;
        match &self.validity {
            Some(validity) if !validity[index] => None,
            _ => Some(self.values[index]),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<i64>> + '_ {
        (0..self.len).map(|i| self.get(i))
    }

    fn region(&self, offset: usize, len: usize) -> Self {
        assert!(offset + len <= self.len, "region out of bounds");
        Self {
            values: self.values.clone(),
            validity: self.validity.clone(),
            offset: self.offset + offset,
            len,
        }
    }
}

/// A block of nullable UTF-8 strings.
#[derive(Clone, Debug)]
pub struct VarcharBlock {
    values: Arc<[String]>,
    validity: Option<Arc<[bool]>>,
    offset: usize,
    len: usize,
}

impl VarcharBlock {
    pub fn from_values(values: Vec<String>) -> Self {
        let len = values.len();
        Self {
            values: values.into(),
            validity: None,
            offset: 0,
            len,
        }
    }

    pub fn from_nullable(values: Vec<Option<String>>) -> Self {
        let len = values.len();
        let validity: Arc<[bool]> = values.iter().map(Option::is_some).collect();
        let values: Arc<[String]> = values.into_iter().map(Option::unwrap_or_default).collect();
        Self {
            values,
            validity: Some(validity),
            offset: 0,
            len,
        }
    }

    pub fn get(&self, position: usize) -> Option<&str> {
        assert!(position < self.len);
        let index = self.offset + position;
        match &self.validity {
            Some(validity) if !validity[index] => None,
            _ => Some(self.values[index].as_str()),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<&str>> + '_ {
        (0..self.len).map(|i| self.get(i))
    }

    fn region(&self, offset: usize, len: usize) -> Self {
        assert!(offset + len <= self.len, "region out of bounds");
        Self {
            values: self.values.clone(),
            validity: self.validity.clone(),
            offset: self.offset + offset,
            len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_share_storage() {
        let block = BigintBlock::from_values((0..100).collect());
        let page = Page::try_new(vec![block.into()]).unwrap();
        let region = page.region(10, 5);
        assert_eq!(region.position_count(), 5);
        let Block::Bigint(b) = region.block(0) else {
            panic!("expected bigint block");
        };
        assert_eq!(b.iter().collect::<Vec<_>>().first(), Some(&Some(10)));
    }

    #[test]
    fn mismatched_column_lengths_rejected() {
        let a = BigintBlock::from_values(vec![1, 2, 3]);
        let b = BigintBlock::from_values(vec![1]);
        assert!(Page::try_new(vec![a.into(), b.into()]).is_err());
    }

    #[test]
    fn nullable_round_trip() {
        let block = VarcharBlock::from_nullable(vec![Some("a".to_string()), None]);
        assert_eq!(block.get(0), Some("a"));
        assert_eq!(block.get(1), None);
    }
}
