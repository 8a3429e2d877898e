//! Fixed-capacity PIN storage with deterministic wipe.
//!
//! The buffer backing a PIN never reallocates: its storage is a boxed array
//! sized for the final verification APDU (`APDU_OVERHEAD` header bytes plus
//! up to `MAX_PIN_PADDING` PIN/filler bytes), so collecting digits, padding
//! and framing all happen in place. The storage is zeroized on drop and the
//! buffer itself only moves into the signing call.

use zeroize::Zeroize;

/// CLA, INS, P1, P2 and Lc of the verification APDU.
pub const APDU_OVERHEAD: usize = 5;
/// Maximum padded PIN block length accepted by supported cards.
pub const MAX_PIN_PADDING: usize = 16;
/// Total backing storage. 21 bytes.
pub const PIN_BUFFER_CAPACITY: usize = APDU_OVERHEAD + MAX_PIN_PADDING;
/// Hard upper bound on PIN length across supported cards.
pub const MAX_PIN_LENGTH: usize = 12;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PinError {
    #[error("PIN may be at most {MAX_PIN_LENGTH} digits")]
    TooLong,
    #[error("PIN may contain only ASCII digits")]
    InvalidCharacter,
}

/// Collected PIN digits, stored after the reserved APDU header bytes.
pub struct PinBuffer {
    storage: Box<[u8; PIN_BUFFER_CAPACITY]>,
    len: usize,
}

impl PinBuffer {
    pub fn new() -> Self {
        Self {
            storage: Box::new([0u8; PIN_BUFFER_CAPACITY]),
            len: 0,
        }
    }

    /// Append one ASCII digit.
    pub fn push(&mut self, digit: u8) -> Result<(), PinError> {
        if !digit.is_ascii_digit() {
            return Err(PinError::InvalidCharacter);
        }
        if self.len >= MAX_PIN_LENGTH {
            return Err(PinError::TooLong);
        }
        self.storage[APDU_OVERHEAD + self.len] = digit;
        self.len += 1;
        Ok(())
    }

    /// Remove the last digit, zeroing its slot.
    pub fn pop(&mut self) {
        if self.len > 0 {
            self.len -= 1;
            self.storage[APDU_OVERHEAD + self.len] = 0;
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The collected digits.
    pub fn pin_bytes(&self) -> &[u8] {
        &self.storage[APDU_OVERHEAD..APDU_OVERHEAD + self.len]
    }

    /// Consume the buffer into a ready-to-transmit verification APDU,
    /// framing the header and padding the PIN block in place.
    ///
    /// `padded_len` is the card's fixed PIN block length (at most
    /// [`MAX_PIN_PADDING`]); `filler` is the card's padding byte.
    pub fn into_apdu(mut self, header: [u8; 4], padded_len: usize, filler: u8) -> PinApdu {
        let padded_len = padded_len.clamp(self.len, MAX_PIN_PADDING);
        self.storage[..4].copy_from_slice(&header);
        self.storage[4] = padded_len as u8;
        for slot in &mut self.storage[APDU_OVERHEAD + self.len..APDU_OVERHEAD + padded_len] {
            *slot = filler;
        }
        let mut storage = Box::new([0u8; PIN_BUFFER_CAPACITY]);
        std::mem::swap(&mut storage, &mut self.storage);
        self.len = 0;
        PinApdu {
            storage,
            len: APDU_OVERHEAD + padded_len,
        }
    }

    /// Zero the full backing storage and forget the digits.
    pub fn wipe(&mut self) {
        self.storage.zeroize();
        self.len = 0;
    }

    /// The entire backing storage, including unused slots.
    pub fn raw_storage(&self) -> &[u8; PIN_BUFFER_CAPACITY] {
        &self.storage
    }
}

impl Default for PinBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PinBuffer {
    fn drop(&mut self) {
        self.storage.zeroize();
    }
}

impl std::fmt::Debug for PinBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinBuffer").field("len", &self.len).finish()
    }
}

/// A framed PIN verification APDU. Wiped on drop like the buffer it came from.
pub struct PinApdu {
    storage: Box<[u8; PIN_BUFFER_CAPACITY]>,
    len: usize,
}

impl PinApdu {
    pub fn as_bytes(&self) -> &[u8] {
        &self.storage[..self.len]
    }

    pub fn wipe(&mut self) {
        self.storage.zeroize();
        self.len = 0;
    }
}

impl Drop for PinApdu {
    fn drop(&mut self) {
        self.storage.zeroize();
    }
}

impl std::fmt::Debug for PinApdu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinApdu").field("len", &self.len).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_with(pin: &str) -> PinBuffer {
        let mut buf = PinBuffer::new();
        for b in pin.bytes() {
            buf.push(b).unwrap();
        }
        buf
    }

    #[test]
    fn rejects_non_digits_and_overlong_pins() {
        let mut buf = PinBuffer::new();
        assert_eq!(buf.push(b'a'), Err(PinError::InvalidCharacter));
        for b in "123456789012".bytes() {
            buf.push(b).unwrap();
        }
        assert_eq!(buf.push(b'3'), Err(PinError::TooLong));
    }

    #[test]
    fn pop_zeroes_the_slot() {
        let mut buf = buffer_with("1234");
        buf.pop();
        assert_eq!(buf.pin_bytes(), b"123");
        assert_eq!(buf.raw_storage()[APDU_OVERHEAD + 3], 0);
    }

    #[test]
    fn apdu_framed_in_place_with_padding() {
        let buf = buffer_with("1234");
        let apdu = buf.into_apdu([0x00, 0x20, 0x00, 0x01], 12, 0xFF);
        let bytes = apdu.as_bytes();
        assert_eq!(&bytes[..5], &[0x00, 0x20, 0x00, 0x01, 12]);
        assert_eq!(&bytes[5..9], b"1234");
        assert!(bytes[9..17].iter().all(|&b| b == 0xFF));
        assert_eq!(bytes.len(), APDU_OVERHEAD + 12);
    }

    #[test]
    fn wipe_clears_all_storage() {
        let mut buf = buffer_with("123456");
        buf.wipe();
        assert!(buf.raw_storage().iter().all(|&b| b == 0));
        assert!(buf.is_empty());

        let mut apdu = buffer_with("1234").into_apdu([0x00, 0x20, 0x00, 0x01], 12, 0xFF);
        apdu.wipe();
        assert!(apdu.as_bytes().is_empty());
        assert!(apdu.storage.iter().all(|&b| b == 0));
    }

    #[test]
    fn consumed_buffer_leaves_no_digits_behind() {
        let buf = buffer_with("9876");
        let storage_before = *buf.raw_storage();
        assert!(storage_before[APDU_OVERHEAD..].starts_with(b"9876"));
        let apdu = buf.into_apdu([0x00, 0x20, 0x00, 0x01], 4, 0xFF);
        // The APDU now owns the only copy of the digits.
        assert_eq!(&apdu.as_bytes()[APDU_OVERHEAD..], b"9876");
    }
}
