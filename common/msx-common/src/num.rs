//! Bit and byte-lane helpers for hardware register decoding

pub trait GetBit {
    #[must_use]
    fn bit(self, i: u8) -> bool;
}

macro_rules! impl_get_bit {
    ($t:ty) => {
        impl GetBit for $t {
            #[inline]
            fn bit(self, i: u8) -> bool {
                debug_assert!(i < (<$t>::BITS as u8));
                self & (1 << i) != 0
            }
        }
    };
}

impl_get_bit!(u8);
impl_get_bit!(u16);
impl_get_bit!(u32);
impl_get_bit!(u64);
impl_get_bit!(usize);

pub trait U16Ext {
    fn lsb(self) -> u8;

    fn msb(self) -> u8;

    fn set_lsb(&mut self, value: u8);

    fn set_msb(&mut self, value: u8);
}

impl U16Ext for u16 {
    #[inline(always)]
    fn lsb(self) -> u8 {
        self as u8
    }

    #[inline(always)]
    fn msb(self) -> u8 {
        (self >> 8) as u8
    }

    #[inline(always)]
    fn set_lsb(&mut self, value: u8) {
        *self = (*self & 0xFF00) | u16::from(value);
    }

    #[inline(always)]
    fn set_msb(&mut self, value: u8) {
        *self = (*self & 0x00FF) | (u16::from(value) << 8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_bit() {
        assert!(0x80_u8.bit(7));
        assert!(!0x80_u8.bit(6));
        assert!(0x0004_u16.bit(2));
    }

    #[test]
    fn u16_byte_lanes() {
        let mut value = 0x1234_u16;
        assert_eq!(value.lsb(), 0x34);
        assert_eq!(value.msb(), 0x12);

        value.set_lsb(0xFF);
        assert_eq!(value, 0x12FF);

        value.set_msb(0x03);
        assert_eq!(value, 0x03FF);
    }
}
