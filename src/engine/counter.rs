use crate::error::SeqlogError;
use crate::token::NON_ADDRESS;

/// Tail of the global log: the last address handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalCounter {
    tail: u64,
}

impl Default for GlobalCounter {
    fn default() -> Self {
        Self::new(NON_ADDRESS)
    }
}

impl GlobalCounter {
    pub fn new(tail: u64) -> Self {
        Self { tail }
    }

    pub fn tail(&self) -> u64 {
        self.tail
    }

    /// Reserves `count` consecutive addresses and returns the first one.
    pub fn issue(&mut self, count: u64) -> Result<u64, SeqlogError> {
        if count == 0 {
            return Err(SeqlogError::Validation(
                "token request must reserve at least one address".into(),
            ));
        }
        let last = self.tail.checked_add(count).ok_or_else(|| {
            SeqlogError::Validation(format!(
                "reserving {count} tokens past tail {} exhausts the address space",
                self.tail
            ))
        })?;
        let first = self.tail + 1;
        self.tail = last;
        Ok(first)
    }

    pub fn advance_to(&mut self, tail: u64) {
        self.tail = self.tail.max(tail);
    }

    pub fn reset(&mut self, tail: u64) {
        self.tail = tail;
    }
}
