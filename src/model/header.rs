use std::collections::HashMap;

use crate::utils::constants::{BLOCK_SIZE, CARD_SIZE};

/// Parsed FITS header: cards in file order plus a keyword index.
#[derive(Debug, Clone, Default)]
pub struct HduHeader {
    pub cards: Vec<(String, String)>,
    pub index: HashMap<String, String>,
}

impl HduHeader {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.index.get(key).map(|s| s.as_str())
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.index.get(key)?.trim().parse().ok()
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.index.get(key)?.trim().parse().ok()
    }

    /// Replace a card in place, or append it if the keyword is new.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.cards.iter_mut().find(|(k, _)| k == key) {
            Some(card) => card.1 = value.clone(),
            None => self.cards.push((key.to_string(), value.clone())),
        }
        self.index.insert(key.to_string(), value);
    }

    pub fn remove(&mut self, key: &str) {
        self.cards.retain(|(k, _)| k != key);
        self.index.remove(key);
    }

    pub fn naxis(&self) -> usize {
        self.get_i64("NAXIS").unwrap_or(0).max(0) as usize
    }

    /// Length of axis `n` (1-based, FITS convention).
    pub fn axis_len(&self, n: usize) -> Option<usize> {
        let len = self.get_i64(&format!("NAXIS{}", n))?;
        if len < 0 {
            return None;
        }
        Some(len as usize)
    }

    pub fn data_byte_count(&self) -> usize {
        let naxis = self.naxis();
        if naxis == 0 {
            return 0;
        }
        let bitpix = self.get_i64("BITPIX").unwrap_or(0);
        let bytes_per_pixel = (bitpix.unsigned_abs() / 8) as usize;
        let mut total: usize = 1;
        for i in 1..=naxis {
            total *= self.axis_len(i).unwrap_or(1);
        }
        total * bytes_per_pixel
    }

    pub fn padded_data_bytes(&self) -> usize {
        let raw = self.data_byte_count();
        ((raw + BLOCK_SIZE - 1) / BLOCK_SIZE) * BLOCK_SIZE
    }

    pub fn header_blocks(&self) -> usize {
        let total_cards = self.cards.len() + 1;
        let cards_per_block = BLOCK_SIZE / CARD_SIZE;
        (total_cards + cards_per_block - 1) / cards_per_block
    }

    pub fn data_offset(&self, header_start: usize) -> usize {
        header_start + self.header_blocks() * BLOCK_SIZE
    }
}
