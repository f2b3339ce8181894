use crate::parsers::{
    blend::{Block, Header as BlendHeader, RawBlend},
    dna::Dna,
    field::{parse_field, FieldInfo},
    primitive::{parse_c_string, parse_ptr_address},
};
use linked_hash_map::LinkedHashMap;
use std::{collections::HashMap, num::NonZeroU64};

/// Represents a field inside a struct. The data `FieldTemplate` keeps is used to interpret the raw
/// bytes of the block.
#[derive(Debug, Clone)]
pub struct FieldTemplate {
    pub info: FieldInfo,
    /// The index of this field's type inside the `Dna::types` array.
    pub type_index: usize,
    /// The type name of this field.
    pub type_name: String,
    /// The index of the data in the `Instance` owned by this field.
    pub data_start: usize,
    /// The length in bytes of the data in the `Instance` owned by this field.
    pub data_len: usize,
}

/// The memory layout of one SDNA struct.
#[derive(Debug, Clone)]
pub struct StructLayout {
    pub type_name: String,
    pub bytes_len: usize,
    /// We use a LinkedHashMap here because we want to preserve declaration order.
    pub fields: LinkedHashMap<String, FieldTemplate>,
}

/// A parsed blend file plus the lookup tables needed to follow pointers between its blocks.
pub struct Blend {
    pub blend: RawBlend,
    layouts: Vec<Option<StructLayout>>,
    struct_by_type: HashMap<usize, usize>,
    block_by_address: HashMap<NonZeroU64, usize>,
}

impl Blend {
    pub fn new(blend: RawBlend) -> Self {
        let layouts = (0..blend.dna.structs.len())
            .map(|index| generate_fields(&blend.dna, index, &blend.header))
            .collect();

        let struct_by_type = blend
            .dna
            .structs
            .iter()
            .enumerate()
            .map(|(index, s)| (s.type_index, index))
            .collect();

        let block_by_address = blend
            .blocks
            .iter()
            .enumerate()
            .filter_map(|(index, block)| block.memory_address().map(|address| (address, index)))
            .collect();

        Self {
            blend,
            layouts,
            struct_by_type,
            block_by_address,
        }
    }

    pub fn header(&self) -> &BlendHeader {
        &self.blend.header
    }

    pub fn block_by_address(&self, address: NonZeroU64) -> Option<&Block> {
        self.block_by_address
            .get(&address)
            .and_then(|&index| self.blend.blocks.get(index))
    }

    fn layout(&self, struct_index: usize) -> Option<&StructLayout> {
        self.layouts.get(struct_index).and_then(Option::as_ref)
    }

    /// Every principal block whose struct layout could be computed, in file order.
    pub fn root_instances(&self) -> impl Iterator<Item = Instance<'_>> {
        self.blend.blocks.iter().filter_map(move |block| match block {
            Block::Principal {
                code,
                memory_address,
                dna_index,
                data,
            } => Some(Instance {
                blend: self,
                layout: self.layout(*dna_index)?,
                code: Some(*code),
                memory_address: Some(*memory_address),
                data: &data.data,
            }),
            _ => None,
        })
    }

    /// Interprets the block found at `address` with the struct layout its header declares.
    pub fn instance_at(&self, address: NonZeroU64) -> Option<Instance<'_>> {
        match self.block_by_address(address)? {
            Block::Principal {
                code,
                memory_address,
                dna_index,
                data,
            } => Some(Instance {
                blend: self,
                layout: self.layout(*dna_index)?,
                code: Some(*code),
                memory_address: Some(*memory_address),
                data: &data.data,
            }),
            Block::Subsidiary {
                memory_address,
                dna_index,
                data,
            } => Some(Instance {
                blend: self,
                layout: self.layout(*dna_index)?,
                code: None,
                memory_address: Some(*memory_address),
                data: &data.data,
            }),
            _ => None,
        }
    }
}

/// A struct inside a block. Only the pieces of data needed to index ID data-blocks are interpreted:
/// strings, nested structs and pointers.
#[derive(Clone)]
pub struct Instance<'a> {
    blend: &'a Blend,
    layout: &'a StructLayout,
    /// The two letter code of the block, for instances created from a principal block.
    pub code: Option<[u8; 2]>,
    pub memory_address: Option<NonZeroU64>,
    data: &'a [u8],
}

impl<'a> std::fmt::Debug for Instance<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("type_name", &self.layout.type_name)
            .field("code", &self.code)
            .field("memory_address", &self.memory_address)
            .finish()
    }
}

impl<'a> Instance<'a> {
    pub fn type_name(&self) -> &'a str {
        &self.layout.type_name
    }

    fn field_data(&self, field: &FieldTemplate) -> Option<&'a [u8]> {
        let end = field.data_start.checked_add(field.data_len)?;
        self.data.get(field.data_start..end)
    }

    /// Reads a `char` array field as a string.
    pub fn get_string(&self, name: &str) -> Option<String> {
        let field = self.layout.fields.get(name)?;
        match field.info {
            FieldInfo::ValueArray { .. } => self.field_data(field).map(parse_c_string),
            _ => None,
        }
    }

    /// Accesses a struct stored by value inside this one, like the `ID id` member every data-block
    /// starts with.
    pub fn get(&self, name: &str) -> Option<Instance<'a>> {
        let field = self.layout.fields.get(name)?;
        if field.info != FieldInfo::Value {
            return None;
        }
        let struct_index = *self.blend.struct_by_type.get(&field.type_index)?;

        Some(Instance {
            blend: self.blend,
            layout: self.blend.layout(struct_index)?,
            code: None,
            memory_address: None,
            data: self.field_data(field)?,
        })
    }

    /// Reads the old memory address stored in a single pointer field.
    pub fn get_ptr_address(&self, name: &str) -> Option<NonZeroU64> {
        let field = self.layout.fields.get(name)?;
        match field.info {
            FieldInfo::Pointer { .. } => self.read_ptr(self.field_data(field)?),
            _ => None,
        }
    }

    /// Follows a pointer field and interprets the pointed block.
    pub fn deref(&self, name: &str) -> Option<Instance<'a>> {
        self.blend.instance_at(self.get_ptr_address(name)?)
    }

    fn read_ptr(&self, data: &[u8]) -> Option<NonZeroU64> {
        let header = self.blend.header();
        parse_ptr_address(data, header.pointer_size, header.endianness)
    }

    /// Every non-null address stored in the pointer fields of this instance, except the fields in
    /// `skip`.
    ///
    /// `*field` and `*field[n]` members contribute their own values. `**field` members point to a
    /// block holding an array of pointers, every element of that array is returned.
    pub fn pointer_targets(&self, skip: &[&str]) -> Vec<NonZeroU64> {
        let pointer_size = self.blend.header().pointer_size.bytes_num();
        let mut targets = Vec::new();

        for (name, field) in self.layout.fields.iter() {
            if skip.contains(&name.as_str()) {
                continue;
            }
            let data = match self.field_data(field) {
                Some(data) => data,
                None => continue,
            };

            match field.info {
                FieldInfo::Pointer {
                    indirection_count: 1,
                } => targets.extend(self.read_ptr(data)),
                FieldInfo::PointerArray {
                    indirection_count: 1,
                    ..
                } => targets.extend(
                    data.chunks_exact(pointer_size)
                        .filter_map(|p| self.read_ptr(p)),
                ),
                FieldInfo::Pointer {
                    indirection_count: 2,
                } => {
                    let array = self
                        .read_ptr(data)
                        .and_then(|address| self.blend.block_by_address(address));
                    if let Some(Block::Subsidiary { data, .. }) = array {
                        targets.extend(
                            data.data
                                .chunks_exact(pointer_size)
                                .filter_map(|p| self.read_ptr(p)),
                        );
                    }
                }
                _ => {}
            }
        }

        targets
    }
}

/// Computes the offset of every field of the struct at `struct_index`. Returns `None` if the SDNA
/// is inconsistent, e.g. a field name that can't be parsed or field sizes that don't add up to the
/// struct size.
pub fn generate_fields(
    dna: &Dna,
    struct_index: usize,
    header: &BlendHeader,
) -> Option<StructLayout> {
    let dna_struct = dna.structs.get(struct_index)?;
    let dna_type = dna.types.get(dna_struct.type_index)?;

    let mut fields = LinkedHashMap::new();
    let mut data_start = 0;

    for field in &dna_struct.fields {
        let field_dna_type = dna.types.get(field.type_index)?;
        let field_full_name = dna.names.get(field.name_index)?;

        let (_, (field_name, field_info)) = parse_field(field_full_name).ok()?;

        let field_bytes_len = match &field_info {
            FieldInfo::Pointer { .. } | FieldInfo::FnPointer => header.pointer_size.bytes_num(),
            FieldInfo::PointerArray { len, .. } => {
                header.pointer_size.bytes_num().checked_mul(*len)?
            }
            FieldInfo::ValueArray { len, .. } => field_dna_type.bytes_len.checked_mul(*len)?,
            FieldInfo::Value => field_dna_type.bytes_len,
        };

        fields.insert(
            String::from(field_name),
            FieldTemplate {
                info: field_info,
                type_index: field.type_index,
                type_name: field_dna_type.name.clone(),
                data_start,
                data_len: field_bytes_len,
            },
        );

        data_start = data_start.checked_add(field_bytes_len)?;
    }

    if dna_type.bytes_len != data_start {
        return None;
    }

    Some(StructLayout {
        type_name: dna_type.name.clone(),
        bytes_len: data_start,
        fields,
    })
}
