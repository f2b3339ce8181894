use crate::parsers::{Endianness, Result};
use nom::{
    bytes::complete::{tag, take, take_while},
    combinator::map,
    multi::count,
    number::complete::{be_u16, be_u32, le_u16, le_u32},
    sequence::terminated,
};

/// The SDNA of a blend file: every name, type and struct layout the file-blocks are written with.
#[derive(Debug)]
pub struct Dna {
    pub names: Vec<String>,
    pub types: Vec<DnaType>,
    pub structs: Vec<DnaStruct>,
}

#[derive(Debug)]
pub struct DnaType {
    pub name: String,
    pub bytes_len: usize, //size in bytes of the type
}

#[derive(Debug)]
pub struct DnaField {
    pub type_index: usize, //index on Dna::types array
    pub name_index: usize, //index on Dna::names array
}

#[derive(Debug)]
pub struct DnaStruct {
    pub type_index: usize, //index on Dna::types array
    pub fields: Vec<DnaField>,
}

impl Dna {
    /// Returns the index of the struct whose type is called `type_name`, if the file defines one.
    pub fn struct_index_by_type_name(&self, type_name: &str) -> Option<usize> {
        self.structs.iter().position(|s| {
            self.types
                .get(s.type_index)
                .map_or(false, |t| t.name == type_name)
        })
    }

    /// The type name of the struct at `struct_index`.
    pub fn struct_type_name(&self, struct_index: usize) -> Option<&str> {
        let dna_struct = self.structs.get(struct_index)?;
        self.types
            .get(dna_struct.type_index)
            .map(|t| t.name.as_str())
    }
}

/// Sections of the SDNA are padded so the next one starts 4-byte aligned.
fn padding_to_4(len: usize) -> usize {
    (4 - len % 4) % 4
}

#[derive(Debug)]
pub struct DnaParseContext {
    endianness: Endianness,
}

impl DnaParseContext {
    pub fn new(endianness: Endianness) -> Self {
        Self { endianness }
    }

    fn u32<'b>(&self, input: &'b [u8]) -> Result<'b, u32> {
        match self.endianness {
            Endianness::Little => le_u32(input),
            Endianness::Big => be_u32(input),
        }
    }

    fn u16<'b>(&self, input: &'b [u8]) -> Result<'b, u16> {
        match self.endianness {
            Endianness::Little => le_u16(input),
            Endianness::Big => be_u16(input),
        }
    }

    /// `len` null terminated strings, followed by the padding needed to realign the input.
    fn strings<'b>(&self, input: &'b [u8], len: usize) -> Result<'b, Vec<String>> {
        let (rest, strings) = count(
            terminated(
                map(take_while(|b: u8| b != 0), |b: &[u8]| {
                    String::from_utf8_lossy(b).into_owned()
                }),
                tag("\0"),
            ),
            len,
        )(input)?;

        let consumed = input.len() - rest.len();
        let (rest, _) = take(padding_to_4(consumed))(rest)?;

        Ok((rest, strings))
    }

    fn names<'b>(&self, input: &'b [u8]) -> Result<'b, Vec<String>> {
        let (input, _) = tag("NAME")(input)?;
        let (input, names_len) = self.u32(input)?;

        self.strings(input, names_len as usize)
    }

    fn types<'b>(&self, input: &'b [u8]) -> Result<'b, Vec<DnaType>> {
        let (input, _) = tag("TYPE")(input)?;
        let (input, types_len) = self.u32(input)?;
        let types_len = types_len as usize;

        let (input, type_names) = self.strings(input, types_len)?;

        let (input, _) = tag("TLEN")(input)?;
        let (input, type_lengths) = count(|i| self.u16(i), types_len)(input)?;
        let (input, _) = take(padding_to_4(types_len * 2))(input)?;

        Ok((
            input,
            type_names
                .into_iter()
                .zip(type_lengths)
                .map(|(name, length)| DnaType {
                    name,
                    bytes_len: usize::from(length),
                })
                .collect(),
        ))
    }

    fn field<'b>(&self, input: &'b [u8]) -> Result<'b, DnaField> {
        let (input, type_index) = self.u16(input)?;
        let (input, name_index) = self.u16(input)?;

        Ok((
            input,
            DnaField {
                type_index: usize::from(type_index),
                name_index: usize::from(name_index),
            },
        ))
    }

    fn structs<'b>(&self, input: &'b [u8]) -> Result<'b, Vec<DnaStruct>> {
        let (input, _) = tag("STRC")(input)?;
        let (mut input, structs_len) = self.u32(input)?;

        let mut structs = Vec::new();
        for _ in 0..structs_len {
            let (rest, struct_type_index) = self.u16(input)?;
            let (rest, fields_num) = self.u16(rest)?;
            let (rest, fields) = count(|i| self.field(i), usize::from(fields_num))(rest)?;
            input = rest;

            structs.push(DnaStruct {
                type_index: usize::from(struct_type_index),
                fields,
            });
        }

        Ok((input, structs))
    }

    pub fn dna<'b>(&self, input: &'b [u8]) -> Result<'b, Dna> {
        let (input, _) = tag("SDNA")(input)?;
        let (input, names) = self.names(input)?;
        let (input, types) = self.types(input)?;
        let (input, structs) = self.structs(input)?;

        Ok((
            input,
            Dna {
                names,
                types,
                structs,
            },
        ))
    }
}
