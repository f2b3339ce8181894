//! Writes small library files: data-blocks with names, references between them, asset marks and
//! liboverride references. The output is a little-endian, 64 bit file with its own SDNA, readable
//! by `BlendHandle`.

use crate::idtype::IdCode;
use std::{fs, io, path::Path};

/// Maximum length of an ID name, type prefix and trailing null included.
pub const MAX_ID_NAME: usize = 66;

const ID_SIZE: usize = 128;
const DATABLOCK_SIZE: usize = ID_SIZE + 16;
const BLOCK_HEADER_SIZE: usize = 24;
const BASE_ADDRESS: u64 = 0x1000_0000;
const DNA_ADDRESS: u64 = 0x0FFF_0000;

const STRUCT_OVERRIDE: u16 = 1;
const STRUCT_ASSET: u16 = 2;
const FIRST_DATABLOCK_STRUCT: u16 = 3;

const PRIMITIVE_TYPES: [(&str, u16); 12] = [
    ("char", 1),
    ("uchar", 1),
    ("short", 2),
    ("ushort", 2),
    ("int", 4),
    ("long", 4),
    ("ulong", 4),
    ("float", 4),
    ("double", 8),
    ("int64_t", 8),
    ("uint64_t", 8),
    ("void", 0),
];

const T_CHAR: u16 = 0;
const T_SHORT: u16 = 2;
const T_INT: u16 = 4;
const T_VOID: u16 = 11;
const T_ID: u16 = 12;
const T_OVERRIDE: u16 = 13;
const T_ASSET: u16 = 14;

const NAMES: [&str; 15] = [
    "*next",
    "*prev",
    "*newid",
    "*lib",
    "*asset_data",
    "name[66]",
    "flag",
    "tag",
    "us",
    "_pad[4]",
    "*override_library",
    "*reference",
    "id",
    "**refs",
    "totref",
];

/// A data-block added to a `LibraryWriter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRef(usize);

#[derive(Debug)]
struct Entry {
    code: IdCode,
    name: String,
    is_asset: bool,
    references: Vec<usize>,
    override_reference: Option<usize>,
}

#[derive(Debug)]
pub struct LibraryWriter {
    version: u16,
    entries: Vec<Entry>,
}

impl Default for LibraryWriter {
    fn default() -> Self {
        LibraryWriter {
            version: 300,
            entries: Vec::new(),
        }
    }
}

impl LibraryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the version written in the header, `280` for Blender 2.80. Only the last three digits
    /// are kept.
    pub fn version(&mut self, version: u16) -> &mut Self {
        self.version = version % 1000;
        self
    }

    /// Adds a data-block. Names longer than an ID name can hold are truncated.
    pub fn add(&mut self, code: IdCode, name: &str) -> BlockRef {
        let mut name = name.to_string();
        while name.len() > MAX_ID_NAME - 3 {
            name.pop();
        }

        self.entries.push(Entry {
            code,
            name,
            is_asset: false,
            references: Vec::new(),
            override_reference: None,
        });
        BlockRef(self.entries.len() - 1)
    }

    pub fn mark_asset(&mut self, block: BlockRef) -> &mut Self {
        if let Some(entry) = self.entries.get_mut(block.0) {
            entry.is_asset = true;
        }
        self
    }

    /// Makes `from` point to `to`.
    pub fn add_reference(&mut self, from: BlockRef, to: BlockRef) -> &mut Self {
        if let Some(entry) = self.entries.get_mut(from.0) {
            entry.references.push(to.0);
        }
        self
    }

    /// Makes `block` a liboverride of `reference`.
    pub fn set_override_reference(&mut self, block: BlockRef, reference: BlockRef) -> &mut Self {
        if let Some(entry) = self.entries.get_mut(block.0) {
            entry.override_reference = Some(reference.0);
        }
        self
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        fs::write(path, self.to_bytes())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let codes = self.used_codes();

        let mut out = Vec::new();
        out.extend_from_slice(b"BLENDER-v");
        out.extend_from_slice(format!("{:03}", self.version).as_bytes());

        for (index, entry) in self.entries.iter().enumerate() {
            let struct_index = codes
                .iter()
                .position(|&c| c == entry.code)
                .map_or(0, |p| FIRST_DATABLOCK_STRUCT + p as u16);

            let code = entry.code.code();
            write_block(
                &mut out,
                [code[0], code[1], 0, 0],
                address(index, 0),
                struct_index,
                1,
                &self.datablock_bytes(index, entry),
            );

            if !entry.references.is_empty() {
                let data: Vec<u8> = entry
                    .references
                    .iter()
                    .flat_map(|&r| address(r, 0).to_le_bytes().to_vec())
                    .collect();
                write_block(
                    &mut out,
                    *b"DATA",
                    address(index, 1),
                    0,
                    entry.references.len() as u32,
                    &data,
                );
            }

            if let Some(reference) = entry.override_reference {
                write_block(
                    &mut out,
                    *b"DATA",
                    address(index, 2),
                    STRUCT_OVERRIDE,
                    1,
                    &address(reference, 0).to_le_bytes(),
                );
            }

            if entry.is_asset {
                write_block(&mut out, *b"DATA", address(index, 3), STRUCT_ASSET, 1, &[0; 8]);
            }
        }

        write_block(&mut out, *b"DNA1", DNA_ADDRESS, 0, 1, &sdna(&codes));

        out.extend_from_slice(b"ENDB");
        out.extend_from_slice(&[0; BLOCK_HEADER_SIZE - 4]);
        out
    }

    fn used_codes(&self) -> Vec<IdCode> {
        let mut codes = Vec::new();
        for entry in &self.entries {
            if !codes.contains(&entry.code) {
                codes.push(entry.code);
            }
        }
        codes
    }

    fn datablock_bytes(&self, index: usize, entry: &Entry) -> Vec<u8> {
        let mut data = Vec::with_capacity(DATABLOCK_SIZE);

        // next, prev, newid, lib
        data.extend_from_slice(&[0; 32]);
        let asset = if entry.is_asset { address(index, 3) } else { 0 };
        data.extend_from_slice(&asset.to_le_bytes());

        let mut name = [0_u8; MAX_ID_NAME];
        let full_name = format!("{}{}", entry.code, entry.name);
        name[..full_name.len()].copy_from_slice(full_name.as_bytes());
        data.extend_from_slice(&name);

        data.extend_from_slice(&0_i16.to_le_bytes());
        data.extend_from_slice(&0_i32.to_le_bytes());
        data.extend_from_slice(&1_i32.to_le_bytes());
        data.extend_from_slice(&[0; 4]);
        let override_library = if entry.override_reference.is_some() {
            address(index, 2)
        } else {
            0
        };
        data.extend_from_slice(&override_library.to_le_bytes());

        let refs = if entry.references.is_empty() {
            0
        } else {
            address(index, 1)
        };
        data.extend_from_slice(&refs.to_le_bytes());
        data.extend_from_slice(&(entry.references.len() as i32).to_le_bytes());
        data.extend_from_slice(&[0; 4]);

        data
    }
}

/// Old memory address of the `slot`th block written for entry `index`.
fn address(index: usize, slot: u64) -> u64 {
    BASE_ADDRESS + index as u64 * 0x100 + slot * 0x10
}

fn write_block(out: &mut Vec<u8>, code: [u8; 4], address: u64, sdna: u16, count: u32, data: &[u8]) {
    out.extend_from_slice(&code);
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(&address.to_le_bytes());
    out.extend_from_slice(&u32::from(sdna).to_le_bytes());
    out.extend_from_slice(&count.to_le_bytes());
    out.extend_from_slice(data);
}

fn pad_to_4(out: &mut Vec<u8>) {
    while out.len() % 4 != 0 {
        out.push(0);
    }
}

fn write_strings<'a, I: IntoIterator<Item = &'a str>>(out: &mut Vec<u8>, strings: I) {
    for s in strings {
        out.extend_from_slice(s.as_bytes());
        out.push(0);
    }
    pad_to_4(out);
}

fn name_index(name: &str) -> u16 {
    NAMES.iter().position(|&n| n == name).unwrap_or(0) as u16
}

fn sdna(codes: &[IdCode]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"SDNA");

    out.extend_from_slice(b"NAME");
    out.extend_from_slice(&(NAMES.len() as u32).to_le_bytes());
    write_strings(&mut out, NAMES.iter().copied());

    let mut types: Vec<(&str, u16)> = PRIMITIVE_TYPES.to_vec();
    types.push(("ID", ID_SIZE as u16));
    types.push(("IDOverrideLibrary", 8));
    types.push(("AssetMetaData", 8));
    types.extend(codes.iter().map(|c| (c.struct_name(), DATABLOCK_SIZE as u16)));

    out.extend_from_slice(b"TYPE");
    out.extend_from_slice(&(types.len() as u32).to_le_bytes());
    write_strings(&mut out, types.iter().map(|&(name, _)| name));

    out.extend_from_slice(b"TLEN");
    for &(_, len) in &types {
        out.extend_from_slice(&len.to_le_bytes());
    }
    pad_to_4(&mut out);

    let id_fields: [(u16, &str); 11] = [
        (T_VOID, "*next"),
        (T_VOID, "*prev"),
        (T_ID, "*newid"),
        (T_VOID, "*lib"),
        (T_ASSET, "*asset_data"),
        (T_CHAR, "name[66]"),
        (T_SHORT, "flag"),
        (T_INT, "tag"),
        (T_INT, "us"),
        (T_CHAR, "_pad[4]"),
        (T_OVERRIDE, "*override_library"),
    ];
    let datablock_fields: [(u16, &str); 4] = [
        (T_ID, "id"),
        (T_VOID, "**refs"),
        (T_INT, "totref"),
        (T_CHAR, "_pad[4]"),
    ];

    let mut structs: Vec<(u16, Vec<(u16, &str)>)> = vec![
        (T_ID, id_fields.to_vec()),
        (T_OVERRIDE, vec![(T_ID, "*reference")]),
        (T_ASSET, vec![(T_INT, "flag"), (T_CHAR, "_pad[4]")]),
    ];
    for (i, _) in codes.iter().enumerate() {
        structs.push((T_ASSET + 1 + i as u16, datablock_fields.to_vec()));
    }
    debug_assert_eq!(structs.len(), usize::from(FIRST_DATABLOCK_STRUCT) + codes.len());

    out.extend_from_slice(b"STRC");
    out.extend_from_slice(&(structs.len() as u32).to_le_bytes());
    for (type_index, fields) in &structs {
        out.extend_from_slice(&type_index.to_le_bytes());
        out.extend_from_slice(&(fields.len() as u16).to_le_bytes());
        for &(field_type, field_name) in fields {
            out.extend_from_slice(&field_type.to_le_bytes());
            out.extend_from_slice(&name_index(field_name).to_le_bytes());
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsers::blend::{Block, RawBlend};

    #[test]
    fn writes_a_parsable_file() {
        let mut writer = LibraryWriter::new();
        writer.version(280);
        let mesh = writer.add(IdCode::Mesh, "CubeMesh");
        let object = writer.add(IdCode::Object, "Cube");
        writer.add_reference(object, mesh);

        let raw = RawBlend::from_bytes(&writer.to_bytes()).expect("valid file");
        assert_eq!(raw.header.version_number(), 280);
        assert_eq!(raw.dna.struct_index_by_type_name("Mesh"), Some(3));
        assert_eq!(raw.dna.struct_index_by_type_name("Object"), Some(4));

        let principal = raw
            .blocks
            .iter()
            .filter(|b| matches!(b, Block::Principal { .. }))
            .count();
        assert_eq!(principal, 2);
    }

    #[test]
    fn long_names_are_truncated() {
        let mut writer = LibraryWriter::new();
        let long = "x".repeat(100);
        writer.add(IdCode::Mesh, &long);

        let raw = RawBlend::from_bytes(&writer.to_bytes()).expect("valid file");
        assert!(raw.blocks.iter().any(|b| matches!(b, Block::Principal { .. })));
    }
}
