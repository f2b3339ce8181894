//! Index of the ID data-blocks stored in a library file.
//!
//! Opening a `BlendHandle` parses the whole file once and keeps only what linking needs: the type,
//! name and asset flag of every data-block, which other data-blocks it points to, and which
//! data-block a linked liboverride uses as its reference. The file itself is released afterwards.

use crate::{
    idtype::IdCode,
    parsers::{blend::RawBlend, BlendParseError},
    runtime::{Blend, Instance},
};
use std::{
    collections::HashMap,
    fmt,
    io::Read,
    num::NonZeroU64,
    path::{Path, PathBuf},
};

/// One ID data-block of a library file.
#[derive(Debug, Clone)]
pub struct DataBlock {
    pub code: IdCode,
    /// The name without its two letter type prefix.
    pub name: String,
    pub is_asset: bool,
    /// Indices (in the owning `BlendHandle`) of the data-blocks this one points to, in field order.
    pub dependencies: Vec<usize>,
    /// Index of the reference data-block when this data-block is a liboverride.
    pub override_reference: Option<usize>,
}

/// An open library file.
pub struct BlendHandle {
    path: Option<PathBuf>,
    version: u16,
    blocks: Vec<DataBlock>,
    by_name: HashMap<(IdCode, String), usize>,
}

impl fmt::Debug for BlendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlendHandle")
            .field("path", &self.path)
            .field("version", &self.version)
            .field("blocks", &self.blocks.len())
            .finish()
    }
}

impl BlendHandle {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, BlendParseError> {
        let raw = RawBlend::from_path(path.as_ref())?;
        let mut handle = BlendHandle::from_raw(raw);
        handle.path = Some(path.as_ref().to_path_buf());
        Ok(handle)
    }

    /// Opens a library already loaded in memory, e.g. a buffer embedded in the executable.
    pub fn from_memory(data: &[u8]) -> Result<Self, BlendParseError> {
        RawBlend::from_bytes(data).map(BlendHandle::from_raw)
    }

    pub fn from_reader<R: Read>(data: R) -> Result<Self, BlendParseError> {
        RawBlend::from_data(data).map(BlendHandle::from_raw)
    }

    pub fn from_raw(raw: RawBlend) -> Self {
        let version = raw.header.version_number();
        let blend = Blend::new(raw);

        let mut addresses = Vec::new();
        let mut pending = Vec::new();

        for instance in blend.root_instances() {
            if let Some((address, block, targets, reference)) = index_instance(&instance) {
                addresses.push(address);
                pending.push((block, targets, reference));
            }
        }

        let by_address: HashMap<NonZeroU64, usize> = addresses
            .iter()
            .enumerate()
            .map(|(index, &address)| (address, index))
            .collect();

        let mut blocks = Vec::with_capacity(pending.len());
        let mut by_name = HashMap::new();

        for (index, (mut block, targets, reference)) in pending.into_iter().enumerate() {
            for target in targets {
                if let Some(&dependency) = by_address.get(&target) {
                    if dependency != index && !block.dependencies.contains(&dependency) {
                        block.dependencies.push(dependency);
                    }
                }
            }
            block.override_reference = reference.and_then(|r| by_address.get(&r).copied());

            by_name
                .entry((block.code, block.name.clone()))
                .or_insert(index);
            blocks.push(block);
        }

        BlendHandle {
            path: None,
            version,
            blocks,
            by_name,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The version of Blender that saved the file, `280` for 2.80.
    pub fn version(&self) -> u16 {
        self.version
    }

    /// Names of the data-blocks of type `code`, in file order.
    pub fn datablock_names(&self, code: IdCode, assets_only: bool) -> Vec<&str> {
        self.blocks
            .iter()
            .filter(|b| b.code == code && (!assets_only || b.is_asset))
            .map(|b| b.name.as_str())
            .collect()
    }

    /// Index of the data-block named `name` of type `code`.
    pub fn find(&self, code: IdCode, name: &str) -> Option<usize> {
        self.by_name.get(&(code, name.to_string())).copied()
    }

    pub fn get(&self, index: usize) -> Option<&DataBlock> {
        self.blocks.get(index)
    }

    pub fn blocks(&self) -> &[DataBlock] {
        &self.blocks
    }
}

type IndexedInstance = (NonZeroU64, DataBlock, Vec<NonZeroU64>, Option<NonZeroU64>);

fn index_instance(instance: &Instance) -> Option<IndexedInstance> {
    let code = IdCode::from_code(instance.code?)?;
    let address = instance.memory_address?;

    let id = instance.get("id")?;
    if id.type_name() != "ID" {
        return None;
    }

    let full_name = id.get_string("name")?;
    let name = full_name.get(2..).unwrap_or_default().to_string();

    let is_asset = id.get_ptr_address("asset_data").is_some();
    let reference = id
        .deref("override_library")
        .and_then(|o| o.get_ptr_address("reference"));

    let block = DataBlock {
        code,
        name,
        is_asset,
        dependencies: Vec::new(),
        override_reference: None,
    };

    Some((address, block, instance.pointer_targets(&[]), reference))
}
