use crate::error::{PollError, Result};

/// Width of a register value on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Int16,
    Int32,
}

impl DataType {
    /// Number of 16-bit registers occupied by one value
    pub fn word_count(self) -> u16 {
        match self {
            Self::Int16 => 1,
            Self::Int32 => 2,
        }
    }
}

/// Order of the 16-bit words of a multi-register value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WordOrder {
    /// High word first
    #[default]
    Big,
    /// Low word first
    Little,
}

/// A holding register location together with how to decode it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterAddress {
    pub address: u16,
    pub data_type: DataType,
    pub word_order: WordOrder,
}

impl RegisterAddress {
    pub const fn int16(address: u16) -> Self {
        Self {
            address,
            data_type: DataType::Int16,
            word_order: WordOrder::Big,
        }
    }

    pub const fn int32(address: u16, word_order: WordOrder) -> Self {
        Self {
            address,
            data_type: DataType::Int32,
            word_order,
        }
    }

    /// Decodes the raw words read at this address into a signed value
    pub fn decode(&self, words: &[u16]) -> Result<i64> {
        let expected = self.data_type.word_count() as usize;
        if words.len() != expected {
            return Err(PollError::Protocol(format!(
                "register {} returned {} words, expected {}",
                self.address,
                words.len(),
                expected
            )));
        }
        Ok(match self.data_type {
            DataType::Int16 => words[0] as i16 as i64,
            DataType::Int32 => {
                let (high, low) = match self.word_order {
                    WordOrder::Big => (words[0], words[1]),
                    WordOrder::Little => (words[1], words[0]),
                };
                merge_u16_i32(high, low) as i64
            }
        })
    }
}

/// Converts two u16 values into a two's complement i32
fn merge_u16_i32(high: u16, low: u16) -> i32 {
    let combined: u32 = ((high as u32) << 16) | (low as u32);
    combined as i32
}
