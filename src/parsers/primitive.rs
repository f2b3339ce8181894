use super::{Endianness, PointerSize};
use nom::number::complete::{be_u32, be_u64, le_u32, le_u64};
use std::num::NonZeroU64;

pub fn parse_u32(slice: &[u8], endianness: Endianness) -> Option<u32> {
    let res = match endianness {
        Endianness::Little => le_u32::<()>(slice),
        Endianness::Big => be_u32::<()>(slice),
    };
    res.ok().map(|(_, val)| val)
}

pub fn parse_u64(slice: &[u8], endianness: Endianness) -> Option<u64> {
    let res = match endianness {
        Endianness::Little => le_u64::<()>(slice),
        Endianness::Big => be_u64::<()>(slice),
    };
    res.ok().map(|(_, val)| val)
}

/// Reads an old memory address. `None` is returned for null pointers and for slices too short to
/// hold a pointer.
pub fn parse_ptr_address(
    slice: &[u8],
    pointer_size: PointerSize,
    endianness: Endianness,
) -> Option<NonZeroU64> {
    let address = match pointer_size {
        PointerSize::Bits32 => u64::from(parse_u32(slice, endianness)?),
        PointerSize::Bits64 => parse_u64(slice, endianness)?,
    };

    NonZeroU64::new(address)
}

/// Reads a fixed size `char` array as a string, stopping at the first null byte.
pub fn parse_c_string(slice: &[u8]) -> String {
    let len = slice.iter().position(|&b| b == 0).unwrap_or(slice.len());
    String::from_utf8_lossy(&slice[..len]).into_owned()
}
