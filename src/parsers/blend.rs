use crate::parsers::{
    dna::{Dna, DnaParseContext},
    BlendParseError, Endianness, PointerSize, Result,
};
use libflate::gzip::Decoder;
use nom::{
    branch::alt,
    bytes::complete::{tag, take},
    multi::many_till,
    number::complete::{be_u32, be_u64, le_u32, le_u64},
    sequence::tuple,
    Err,
};
use std::{
    fmt::{self, Debug, Formatter},
    io::Read,
    num::NonZeroU64,
    path::Path,
    result::Result as StdResult,
};

pub struct BlockData {
    /// The entire binary data of the `Block` in the blend file.
    pub data: Vec<u8>,
    /// The data field can contain more than one struct, count tells us how many there is.
    pub count: usize,
}

impl Debug for BlockData {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "len/count: {}/{}", self.data.len(), self.count)
    }
}

/// Represents all possible block types found in the blend file.
/// `Rend`, `Test` and `Global` are ignored when indexing a library but are still represented here.
#[derive(Debug)]
pub enum Block {
    Rend,
    Test,
    Global {
        memory_address: NonZeroU64,
        dna_index: usize,
        data: BlockData,
    },
    /// A principal (or root) block is defined by having a two digit code and by the fact that its
    /// `dna_index` is always valid. Every ID data-block (objects, meshes, materials...) is stored
    /// in a principal block.
    Principal {
        code: [u8; 2],
        memory_address: NonZeroU64,
        dna_index: usize,
        data: BlockData,
    },
    /// Subsidiary blocks are defined by having the code "DATA", which is ommited here. Their
    /// `dna_index` is not always correct and is only used when whichever field points to them has
    /// an "invalid" type (like void*).
    Subsidiary {
        memory_address: NonZeroU64,
        dna_index: usize,
        data: BlockData,
    },
    /// The DNA of the blend file. Used to interpret all the other blocks.
    Dna(Dna),
}

impl Block {
    pub fn memory_address(&self) -> Option<NonZeroU64> {
        match self {
            Block::Principal { memory_address, .. }
            | Block::Subsidiary { memory_address, .. }
            | Block::Global { memory_address, .. } => Some(*memory_address),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Header {
    /// The size of the pointer on the machine used to save the blend file.
    pub pointer_size: PointerSize,
    /// The endianness on the machine used to save the blend file.
    pub endianness: Endianness,
    /// The version of Blender used to save the blend file, as written in the header (`b"280"`).
    pub version: [u8; 3],
}

impl Header {
    /// The file version as a number, `280` for a file saved by Blender 2.80.
    pub fn version_number(&self) -> u16 {
        self.version
            .iter()
            .fold(0_u16, |acc, d| acc * 10 + u16::from(d.wrapping_sub(b'0') % 10))
    }
}

fn pointer_size_bits32(input: &[u8]) -> Result<PointerSize> {
    let (input, _) = tag("_")(input)?;
    Ok((input, PointerSize::Bits32))
}

fn pointer_size_bits64(input: &[u8]) -> Result<PointerSize> {
    let (input, _) = tag("-")(input)?;
    Ok((input, PointerSize::Bits64))
}

pub fn pointer_size(input: &[u8]) -> Result<PointerSize> {
    alt((pointer_size_bits32, pointer_size_bits64))(input)
}

fn endianness_little(input: &[u8]) -> Result<Endianness> {
    let (input, _) = tag("v")(input)?;
    Ok((input, Endianness::Little))
}

fn endianness_big(input: &[u8]) -> Result<Endianness> {
    let (input, _) = tag("V")(input)?;
    Ok((input, Endianness::Big))
}

pub fn endianness(input: &[u8]) -> Result<Endianness> {
    alt((endianness_little, endianness_big))(input)
}

pub fn version(input: &[u8]) -> Result<[u8; 3]> {
    let (input, v) = take(3_usize)(input)?;
    Ok((input, [v[0], v[1], v[2]]))
}

pub fn header(input: &[u8]) -> Result<Header> {
    let (input, _) = match tag::<_, _, BlendParseError>("BLENDER")(input) {
        Ok(v) => v,
        Err(_) => {
            return Err(nom::Err::Failure(
                BlendParseError::CompressedFileNotSupported,
            ))
        }
    };

    let (input, (pointer_size, endianness, version)) =
        tuple((pointer_size, endianness, version))(input)?;

    Ok((
        input,
        Header {
            pointer_size,
            endianness,
            version,
        },
    ))
}

pub fn block_header_code(input: &[u8]) -> Result<[u8; 4]> {
    let (input, v) = take(4_usize)(input)?;
    Ok((input, [v[0], v[1], v[2], v[3]]))
}

#[derive(Debug)]
pub struct RawBlend {
    pub header: Header,
    pub blocks: Vec<Block>,
    pub dna: Dna,
}

impl RawBlend {
    /// Parses a blend file from `data`. Gzip compressed files are decompressed first.
    pub fn from_data<T: Read>(mut data: T) -> StdResult<Self, BlendParseError> {
        let mut buffer = Vec::new();
        data.read_to_end(&mut buffer)?;

        RawBlend::from_bytes(&buffer)
    }

    /// Parses a blend file already in memory. Gzip compressed files are decompressed first.
    pub fn from_bytes(buffer: &[u8]) -> StdResult<Self, BlendParseError> {
        if !buffer.starts_with(b"BLENDER") {
            if let Some(decompressed) = gunzip(buffer) {
                return RawBlend::parse(&decompressed);
            }
        }

        RawBlend::parse(buffer)
    }

    /// Parses a blend file from a path.
    pub fn from_path<P: AsRef<Path>>(path: P) -> StdResult<Self, BlendParseError> {
        use std::fs::File;

        let file = File::open(path)?;
        RawBlend::from_data(file)
    }

    fn parse(buffer: &[u8]) -> StdResult<Self, BlendParseError> {
        let mut parser = BlendParseContext::default();
        let res = parser.blend(buffer);

        match res {
            Ok((_, blend)) => Ok(blend),
            Err(Err::Failure(e)) | Err(Err::Error(e)) => Err(e),
            Err(Err::Incomplete(..)) => Err(BlendParseError::NotEnoughData),
        }
    }
}

/// Returns `None` when `data` is not a gzip stream.
fn gunzip(data: &[u8]) -> Option<Vec<u8>> {
    let mut decoder = Decoder::new(data).ok()?;
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed).ok()?;
    Some(decompressed)
}

#[derive(Default)]
pub enum BlendParseContext {
    #[default]
    Empty,
    ParsedHeader(Header),
}

impl BlendParseContext {
    fn memory_address<'b>(&self, header: &Header, input: &'b [u8]) -> Result<'b, NonZeroU64> {
        let (input, data) = take(header.pointer_size.bytes_num())(input)?;

        let (_, address) = match (&header.endianness, &header.pointer_size) {
            (Endianness::Little, PointerSize::Bits32) => {
                le_u32(data).map(|(i, n)| (i, u64::from(n)))?
            }
            (Endianness::Big, PointerSize::Bits32) => {
                be_u32(data).map(|(i, n)| (i, u64::from(n)))?
            }
            (Endianness::Little, PointerSize::Bits64) => le_u64(data)?,
            (Endianness::Big, PointerSize::Bits64) => be_u64(data)?,
        };

        match NonZeroU64::new(address) {
            Some(address) => Ok((input, address)),
            None => Err(Err::Failure(BlendParseError::InvalidMemoryAddress)),
        }
    }

    fn u32<'b>(header: &Header, input: &'b [u8]) -> Result<'b, usize> {
        let (input, n) = match header.endianness {
            Endianness::Little => le_u32(input)?,
            Endianness::Big => be_u32(input)?,
        };
        Ok((input, n as usize))
    }

    fn block<'b>(&self, input: &'b [u8]) -> Result<'b, Block> {
        let header = match self {
            BlendParseContext::ParsedHeader(header) => header,
            BlendParseContext::Empty => return Err(Err::Failure(BlendParseError::MissingHeader)),
        };

        let (input, code) = block_header_code(input)?;
        let (input, size) = Self::u32(header, input)?;
        let (input, memory_address) = self.memory_address(header, input)?;
        let (input, dna_index) = Self::u32(header, input)?;
        let (input, count) = Self::u32(header, input)?;

        let (input, block_data) = take(size)(input)?;
        let data = || BlockData {
            data: block_data.to_vec(),
            count,
        };

        //Assumption: These block codes will always exist
        let block = match &code {
            b"REND" => Block::Rend,
            b"TEST" => Block::Test,
            b"GLOB" => Block::Global {
                memory_address,
                dna_index,
                data: data(),
            },
            b"DATA" => Block::Subsidiary {
                memory_address,
                dna_index,
                data: data(),
            },
            b"DNA1" => {
                let ctx = DnaParseContext::new(header.endianness);
                let (_, dna) = ctx.dna(block_data)?;

                Block::Dna(dna)
            }
            &[code1, code2, 0, 0] => {
                if count != 1 {
                    return Err(Err::Failure(
                        BlendParseError::UnsupportedCountOnPrincipalBlock,
                    ));
                }
                Block::Principal {
                    code: [code1, code2],
                    memory_address,
                    dna_index,
                    data: data(),
                }
            }
            _ => return Err(Err::Failure(BlendParseError::UnknownBlockCode)),
        };

        Ok((input, block))
    }

    pub fn blend<'b>(&mut self, input: &'b [u8]) -> Result<'b, RawBlend> {
        let (input, header) = header(input)?;

        //This has to happen before the rest of the parser runs
        *self = BlendParseContext::ParsedHeader(header.clone());

        let this = &*self;
        let (input, (mut blocks, _)) = many_till(|d| this.block(d), tag("ENDB"))(input)?;

        let dna = if let Some(Block::Dna(dna)) = blocks.pop() {
            // Assumption: The DNA block is always the last one
            dna
        } else {
            return Err(Err::Failure(BlendParseError::NoDnaBlockFound));
        };

        Ok((
            input,
            RawBlend {
                blocks,
                dna,
                header,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_reads_pointer_size_endianness_and_version() {
        let (_, header) = header(b"BLENDER-v280").expect("valid header");
        assert_eq!(header.pointer_size, PointerSize::Bits64);
        assert_eq!(header.endianness, Endianness::Little);
        assert_eq!(header.version_number(), 280);

        let (_, header) = header_of(b"BLENDER_V249");
        assert_eq!(header.pointer_size, PointerSize::Bits32);
        assert_eq!(header.endianness, Endianness::Big);
        assert_eq!(header.version_number(), 249);
    }

    fn header_of(data: &[u8]) -> (&[u8], Header) {
        header(data).expect("valid header")
    }

    #[test]
    fn unknown_magic_is_reported_as_compressed() {
        match RawBlend::from_bytes(b"\x28\xb5\x2f\xfdzstd data") {
            Err(BlendParseError::CompressedFileNotSupported) => {}
            other => panic!("unexpected result {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn truncated_files_fail() {
        assert!(RawBlend::from_bytes(b"BLENDER-v280OB\0\0").is_err());
    }
}
