//! Reader for Polyglot opening books (`.bin`).
//!
//! Entries are 16 bytes, big endian: key (u64), move (u16), weight (u16), learn (u32),
//! sorted by key. Lookups are a binary search over the raw bytes.

use std::path::Path;

use shakmaty::uci::UciMove;
use shakmaty::{Move, Role, Square};

use crate::board::GameBoard;

const ENTRY_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookEntry {
    pub key: u64,
    pub raw_move: u16,
    pub weight: u16,
    pub learn: u32,
}

impl BookEntry {
    fn parse(bytes: &[u8]) -> Self {
        let mut key = [0u8; 8];
        key.copy_from_slice(&bytes[0..8]);
        Self {
            key: u64::from_be_bytes(key),
            raw_move: u16::from_be_bytes([bytes[8], bytes[9]]),
            weight: u16::from_be_bytes([bytes[10], bytes[11]]),
            learn: u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
        }
    }

    /// Decodes the packed move and resolves it against `board`.
    /// Castling is stored as king-takes-rook, which `UciMove::to_move` understands.
    pub fn to_move(&self, board: &GameBoard) -> Option<Move> {
        let to = Square::new(u32::from(self.raw_move & 0x3f));
        let from = Square::new(u32::from((self.raw_move >> 6) & 0x3f));
        let promotion = match (self.raw_move >> 12) & 0x7 {
            0 => None,
            1 => Some(Role::Knight),
            2 => Some(Role::Bishop),
            3 => Some(Role::Rook),
            4 => Some(Role::Queen),
            _ => return None,
        };
        UciMove::Normal {
            from,
            to,
            promotion,
        }
        .to_move(board.position())
        .ok()
    }
}

#[derive(Debug, Clone)]
pub struct PolyglotBook {
    data: Vec<u8>,
}

impl PolyglotBook {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self::from_bytes(std::fs::read(path)?))
    }

    /// Trailing bytes that do not form a whole entry are ignored.
    pub fn from_bytes(mut data: Vec<u8>) -> Self {
        data.truncate(data.len() - data.len() % ENTRY_SIZE);
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len() / ENTRY_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn entry(&self, index: usize) -> BookEntry {
        BookEntry::parse(&self.data[index * ENTRY_SIZE..(index + 1) * ENTRY_SIZE])
    }

    /// All entries for `key`, in file order.
    pub fn entries(&self, key: u64) -> Vec<BookEntry> {
        let (mut lo, mut hi) = (0, self.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.entry(mid).key < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        (lo..self.len())
            .map(|i| self.entry(i))
            .take_while(|e| e.key == key)
            .collect()
    }

    /// Legal book moves for the current position with their weights.
    /// Only orthodox chess positions have Polyglot keys.
    pub fn moves(&self, board: &GameBoard) -> Vec<(Move, u16)> {
        if !board.variant().is_standard_rules() {
            return Vec::new();
        }
        self.entries(board.zobrist())
            .into_iter()
            .filter_map(|e| e.to_move(board).map(|m| (m, e.weight)))
            .collect()
    }
}
