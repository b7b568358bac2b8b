use smallvec::SmallVec;

use crate::error::{MetabaseError, Result};
use crate::model::NodeId;

/// Erasure-coding parameters of a remote segment.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct RedundancyScheme {
    pub algorithm: u8,
    pub share_size: i32,
    pub required_shares: i16,
    pub repair_shares: i16,
    pub optimal_shares: i16,
    pub total_shares: i16,
}

impl RedundancyScheme {
    pub fn is_zero(&self) -> bool {
        *self == RedundancyScheme::default()
    }

    /// Fixed-width big-endian encoding for the segment row.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(13);
        out.push(self.algorithm);
        out.extend_from_slice(&self.share_size.to_be_bytes());
        out.extend_from_slice(&self.required_shares.to_be_bytes());
        out.extend_from_slice(&self.repair_shares.to_be_bytes());
        out.extend_from_slice(&self.optimal_shares.to_be_bytes());
        out.extend_from_slice(&self.total_shares.to_be_bytes());
        out
    }

    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() != 13 {
            return Err(MetabaseError::Encoding(format!(
                "redundancy payload length {}",
                src.len()
            )));
        }
        let be16 = |at: usize| i16::from_be_bytes([src[at], src[at + 1]]);
        Ok(RedundancyScheme {
            algorithm: src[0],
            share_size: i32::from_be_bytes([src[1], src[2], src[3], src[4]]),
            required_shares: be16(5),
            repair_shares: be16(7),
            optimal_shares: be16(9),
            total_shares: be16(11),
        })
    }
}

/// One erasure-coded piece as the caller sees it: piece number plus the
/// storage node holding it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Piece {
    pub number: u16,
    pub storage_node: NodeId,
}

/// Ordered list of pieces supplied by upload and audit callers.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct Pieces(pub Vec<Piece>);

impl Pieces {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Piece> {
        self.0.iter()
    }

    /// Piece numbers must be unique and sorted ascending.
    pub fn verify(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(MetabaseError::invalid("pieces missing"));
        }
        for pair in self.0.windows(2) {
            if pair[0].number >= pair[1].number {
                return Err(MetabaseError::invalid(
                    "piece numbers must be unique and sorted",
                ));
            }
        }
        Ok(())
    }
}

/// Compact integer standing in for a storage node id inside segment rows.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct NodeAlias(pub u32);

/// A piece with its node resolved to an alias, the form persisted in the
/// segment row.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AliasPiece {
    pub number: u16,
    pub alias: NodeAlias,
}

const ALIAS_PIECES_VERSION: u8 = 1;

/// Ordered `(piece number, node alias)` pairs of a remote segment.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct AliasPieces(pub SmallVec<[AliasPiece; 8]>);

impl AliasPieces {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, AliasPiece> {
        self.0.iter()
    }

    /// Version-tagged encoding: one tag byte, a count, then fixed-width
    /// big-endian pairs.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + self.0.len() * 6);
        out.push(ALIAS_PIECES_VERSION);
        out.extend_from_slice(&(self.0.len() as u32).to_be_bytes());
        for piece in &self.0 {
            out.extend_from_slice(&piece.number.to_be_bytes());
            out.extend_from_slice(&piece.alias.0.to_be_bytes());
        }
        out
    }

    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.is_empty() {
            return Err(MetabaseError::Encoding("alias pieces payload empty".into()));
        }
        if src[0] != ALIAS_PIECES_VERSION {
            return Err(MetabaseError::Encoding(format!(
                "unknown alias pieces version {}",
                src[0]
            )));
        }
        if src.len() < 5 {
            return Err(MetabaseError::Encoding("alias pieces header truncated".into()));
        }
        let count = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        let body = &src[5..];
        if body.len() != count * 6 {
            return Err(MetabaseError::Encoding(format!(
                "alias pieces payload length {} for {count} pieces",
                body.len()
            )));
        }
        let mut pieces = SmallVec::with_capacity(count);
        for chunk in body.chunks_exact(6) {
            pieces.push(AliasPiece {
                number: u16::from_be_bytes([chunk[0], chunk[1]]),
                alias: NodeAlias(u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]])),
            });
        }
        Ok(AliasPieces(pieces))
    }
}

impl FromIterator<AliasPiece> for AliasPieces {
    fn from_iter<T: IntoIterator<Item = AliasPiece>>(iter: T) -> Self {
        AliasPieces(iter.into_iter().collect())
    }
}
