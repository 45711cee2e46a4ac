use thiserror::Error;

/// Set of piece indices a peer claims to have.
///
/// On the wire the high bit of the first byte is piece 0. Spare bits past the
/// last piece are ignored when decoding.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bitfield {
    bits: Vec<bool>,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("bitfield payload of {got} bytes, expected {expected} for {num_pieces} pieces")]
pub struct BitfieldLengthError {
    pub got: usize,
    pub expected: usize,
    pub num_pieces: usize,
}

impl Bitfield {
    pub fn new(num_pieces: usize) -> Self {
        Self { bits: vec![false; num_pieces] }
    }

    pub fn full(num_pieces: usize) -> Self {
        Self { bits: vec![true; num_pieces] }
    }

    pub fn from_payload(payload: &[u8], num_pieces: usize) -> Result<Self, BitfieldLengthError> {
        let expected = (num_pieces + 7) / 8;
        if payload.len() != expected {
            return Err(BitfieldLengthError { got: payload.len(), expected, num_pieces });
        }
        let bits = (0..num_pieces)
            .map(|idx| payload[idx / 8] & (1u8 << (7 - idx % 8)) != 0)
            .collect();
        Ok(Self { bits })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; (self.bits.len() + 7) / 8];
        for idx in self.iter_set() {
            out[idx / 8] |= 1u8 << (7 - idx % 8);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn has(&self, index: usize) -> bool {
        self.bits.get(index).copied().unwrap_or(false)
    }

    /// Set a bit; returns false when the bit was already set or out of range.
    pub fn set(&mut self, index: usize) -> bool {
        match self.bits.get_mut(index) {
            Some(bit) if !*bit => {
                *bit = true;
                true
            }
            _ => false,
        }
    }

    pub fn count(&self) -> usize {
        self.bits.iter().filter(|&&b| b).count()
    }

    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter().enumerate().filter(|(_, b)| **b).map(|(idx, _)| idx)
    }

    pub fn as_slice(&self) -> &[bool] {
        &self.bits
    }
}
