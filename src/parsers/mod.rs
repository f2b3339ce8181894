pub mod blend;
pub mod dna;
pub mod field;
pub mod primitive;

use nom::{
    error::{ErrorKind, ParseError},
    IResult,
};
use std::io;
use thiserror::Error;

type Result<'a, T> = IResult<&'a [u8], T, BlendParseError>;

/// Size of a pointer on the machine used to create the .blend file.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PointerSize {
    Bits32,
    Bits64,
}

impl PointerSize {
    /// Returns the pointer size in bytes.
    pub fn bytes_num(self) -> usize {
        match self {
            PointerSize::Bits32 => 4,
            PointerSize::Bits64 => 8,
        }
    }
}

/// Endianness of the machine used to create the .blend file.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Endianness {
    Little,
    Big,
}

/// Errors that can happen while reading a library .blend file.
/// Most errors are simply `NomError` but a few of them are specific either
/// for better error reporting or due to custom logic.
#[derive(Debug, Error)]
pub enum BlendParseError {
    #[error("malformed blend data ({kind:?})")]
    NomError {
        kind: ErrorKind,
        other: Option<Box<BlendParseError>>,
    },
    #[error("io error: {0}")]
    IoError(#[from] io::Error),
    /// Returned when the file is incomplete.
    #[error("not enough data")]
    NotEnoughData,
    /// The known block codes are `b"REND"`, `b"TEST"`, `b"GLOB"`, `b"DATA"` and any two-digit code
    /// like `b"OB\0\0"` for objects. Anything different from that returns `UnknownBlockCode`
    #[error("unknown block code")]
    UnknownBlockCode,
    /// Principal blocks are assumed to never be lists even though it is possible. No version of a
    /// blend file was found where this isn't true.
    #[error("principal block with a count other than one")]
    UnsupportedCountOnPrincipalBlock,
    /// This error happens if a block has a memory address equal to `0`. This should be impossible
    /// as `0` represents a null pointer.
    #[error("block with a null memory address")]
    InvalidMemoryAddress,
    /// Returned when blocks are parsed before the file header.
    #[error("blocks parsed before the file header")]
    MissingHeader,
    /// Returned when the DNA block is not found at the end of the blend file.
    #[error("no DNA block found")]
    NoDnaBlockFound,
    /// Returned when the data doesn't start with `b"BLENDER"`, even after trying to decompress it
    /// as gzip.
    #[error("compressed or unknown file format")]
    CompressedFileNotSupported,
}

impl ParseError<&[u8]> for BlendParseError {
    fn from_error_kind(_input: &[u8], kind: ErrorKind) -> Self {
        BlendParseError::NomError { kind, other: None }
    }

    fn append(_input: &[u8], kind: ErrorKind, other: Self) -> Self {
        BlendParseError::NomError {
            kind,
            other: Some(Box::new(other)),
        }
    }
}
