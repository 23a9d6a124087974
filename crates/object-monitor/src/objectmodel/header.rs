use std::fmt;

use easy_bitfield::{BitField, BitFieldTrait};

/// Low two bits: lock state.
pub type LockBitfield = BitField<usize, usize, 0, 2, false>;
/// GC age, skipping one unused bit after the lock bits.
pub type AgeBitfield = BitField<usize, usize, 3, 4, false>;
/// Identity hash, `0` when not hashed yet.
pub type HashBitfield = BitField<usize, usize, 8, 31, false>;

/// Header word of an object.
///
/// ```text
///  unlocked:  hash:31 ------------ | age:4 | - | 01
///  locked:    hash:31 ------------ | age:4 | - | 00
///  inflated:  pointer to an ObjectMonitor    | 10
///  marked:    used by the collector          | 11
/// ```
///
/// A fast-locked header keeps hash and age; only the lock bits change and
/// the owner is found on the lock stacks. Once an object is inflated its
/// neutral header is displaced into the monitor's metadata.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct MarkWord(usize);

impl MarkWord {
    pub const LOCKED_VALUE: usize = 0b00;
    pub const UNLOCKED_VALUE: usize = 0b01;
    pub const MONITOR_VALUE: usize = 0b10;
    pub const MARKED_VALUE: usize = 0b11;

    pub const LOCK_MASK: usize = 0b11;
    pub const NO_HASH: usize = 0;

    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> usize {
        self.0
    }

    /// Neutral header with no hash and age zero.
    pub fn prototype() -> Self {
        Self(LockBitfield::encode(Self::UNLOCKED_VALUE))
    }

    /// A header pointing at an inflated monitor.
    pub fn encode<T>(monitor: *const T) -> Self {
        let address = monitor as usize;
        debug_assert_eq!(address & Self::LOCK_MASK, 0, "monitor must be aligned");
        Self(address | Self::MONITOR_VALUE)
    }

    pub fn lock_bits(self) -> usize {
        LockBitfield::decode(self.0)
    }

    pub fn is_neutral(self) -> bool {
        self.lock_bits() == Self::UNLOCKED_VALUE
    }

    pub fn is_fast_locked(self) -> bool {
        self.lock_bits() == Self::LOCKED_VALUE
    }

    pub fn has_monitor(self) -> bool {
        self.lock_bits() == Self::MONITOR_VALUE
    }

    pub fn is_marked(self) -> bool {
        self.lock_bits() == Self::MARKED_VALUE
    }

    pub fn monitor<T>(self) -> *const T {
        debug_assert!(self.has_monitor());
        (self.0 & !Self::LOCK_MASK) as *const T
    }

    /// The fast-locked form of a neutral header.
    pub fn set_fast_locked(self) -> Self {
        debug_assert!(self.is_neutral());
        Self((self.0 & !Self::LOCK_MASK) | Self::LOCKED_VALUE)
    }

    /// The neutral form of a fast-locked header.
    pub fn set_unlocked(self) -> Self {
        debug_assert!(self.is_fast_locked());
        Self((self.0 & !Self::LOCK_MASK) | Self::UNLOCKED_VALUE)
    }

    pub fn hash(self) -> usize {
        HashBitfield::decode(self.0)
    }

    pub fn has_no_hash(self) -> bool {
        self.hash() == Self::NO_HASH
    }

    pub fn copy_set_hash(self, hash: usize) -> Self {
        debug_assert!(self.is_neutral());
        Self(HashBitfield::update(hash, self.0))
    }

    pub fn age(self) -> usize {
        AgeBitfield::decode(self.0)
    }

    pub fn set_age(self, age: usize) -> Self {
        debug_assert!(self.is_neutral());
        Self(AgeBitfield::update(age, self.0))
    }
}

impl fmt::Debug for MarkWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has_monitor() {
            write!(f, "MarkWord(monitor={:#x})", self.0 & !Self::LOCK_MASK)
        } else if self.is_neutral() {
            write!(
                f,
                "MarkWord(neutral hash={:#x} age={})",
                self.hash(),
                self.age()
            )
        } else if self.is_fast_locked() {
            write!(f, "MarkWord(locked {:#x})", self.0)
        } else {
            write!(f, "MarkWord(marked {:#x})", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neutral_header_fields() {
        let mark = MarkWord::prototype();
        assert!(mark.is_neutral());
        assert!(mark.has_no_hash());

        let mark = mark.copy_set_hash(0x1234_5678).set_age(5);
        assert!(mark.is_neutral());
        assert_eq!(mark.hash(), 0x1234_5678);
        assert_eq!(mark.age(), 5);
    }

    #[test]
    fn monitor_header_round_trip() {
        let slot = Box::new(0u64);
        let ptr: *const u64 = &*slot;
        let mark = MarkWord::encode(ptr);
        assert!(mark.has_monitor());
        assert!(!mark.is_neutral());
        assert_eq!(mark.monitor::<u64>(), ptr);
    }

    #[test]
    fn fast_locking_keeps_hash() {
        let neutral = MarkWord::prototype().copy_set_hash(77);
        let locked = neutral.set_fast_locked();
        assert!(locked.is_fast_locked());
        assert_eq!(locked.hash(), 77);
        assert_eq!(locked.set_unlocked(), neutral);
    }
}
