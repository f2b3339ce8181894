//! Linking, appending and overriding data-blocks from library files.
//!
//! A `LinkAppendContext` is driven through a fixed protocol: register libraries, register items
//! (one per requested data-block), run `link`, then optionally `append` or `liboverride`, read the
//! results back and `finalize`. Each pass returns a `PassOutcome` with the result of every item the
//! client registered, and sends human readable diagnostics to an optional `ReportList`.

mod append;
mod liboverride;
mod link;
mod relocate;

use crate::{
    document::{IdKey, IdTag, LibraryKey, Main},
    error::{Error, ResolveError, Result},
    handle::BlendHandle,
    idtype::{IdCode, IdFilter},
    report::{report, ReportList, ReportType},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::error;

/// Library name standing for the in-memory file set with `embedded_blendfile_set`.
pub const EMBEDDED_STARTUP_BLEND: &str = "<startup.blend>";

bitflags::bitflags! {
    /// Options of a link/append operation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct LinkFlags: u32 {
        /// Keep the data linked. Without it the data is appended.
        const LINK = 1 << 0;
        /// Store library paths relative to the destination document.
        const RELATIVE_PATH = 1 << 1;
        /// Only consider data-blocks marked as assets.
        const ASSETS_ONLY = 1 << 2;
        /// Append the dependencies coming from other libraries too.
        const APPEND_RECURSIVE = 1 << 3;
        /// Give appended data a fake user.
        const APPEND_SET_FAKEUSER = 1 << 4;
        /// Reuse local data appended earlier from the same library data.
        const APPEND_LOCAL_ID_REUSE = 1 << 5;
        /// Clear the asset mark of appended data.
        const APPEND_ASSET_DATA_CLEAR = 1 << 6;
        /// Create placeholders for data-blocks missing from their library.
        const USE_PLACEHOLDERS = 1 << 7;
        /// Tag linked data as indirectly used.
        const FORCE_INDIRECT = 1 << 8;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct OverrideFlags: u32 {
        /// Create overrides that are never saved.
        const CREATE_RUNTIME = 1 << 0;
        /// Return an existing local override of the same linked data instead of creating another
        /// one.
        const USE_EXISTING_LIBOVERRIDES = 1 << 1;
    }
}

bitflags::bitflags! {
    /// Which items `item_foreach` visits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ForeachItemFlags: u32 {
        /// Items registered by the client.
        const DO_DIRECT = 1 << 0;
        /// Items added for the dependencies of other items.
        const DO_INDIRECT = 1 << 1;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ItemTag: u32 {
        /// Added by the context for a dependency, not requested by the client.
        const INDIRECT = 1 << 0;
        /// Used as the reference of a liboverride, and by other data.
        const LIBOVERRIDE_DEPENDENCY = 1 << 1;
        /// Only used as the reference of a liboverride.
        const LIBOVERRIDE_DEPENDENCY_ONLY = 1 << 2;
    }
}

/// What appending does with the linked data of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AppendAction {
    Unset,
    KeepLinked,
    ReuseLocal,
    MakeLocal,
    CopyLocal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Created,
    /// At least one library and one item are registered, no pass ran yet.
    Populated,
    Linked,
    Appended,
    Overridden,
    Done,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Created => "created",
            Stage::Populated => "populated",
            Stage::Linked => "linked",
            Stage::Appended => "appended",
            Stage::Overridden => "overridden",
            Stage::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of `LinkAppendContext::new`.
pub struct LinkAppendParams<'m> {
    pub main: &'m mut Main,
    pub flags: LinkFlags,
    /// Tag added to every ID the context creates.
    pub id_tag_extra: IdTag,
}

impl<'m> LinkAppendParams<'m> {
    pub fn new(main: &'m mut Main, flags: LinkFlags) -> Self {
        LinkAppendParams {
            main,
            flags,
            id_tag_extra: IdTag::empty(),
        }
    }
}

/// Stable handle to an item of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemHandle(usize);

impl ItemHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

/// One requested data-block and what the passes did with it.
#[derive(Debug, Clone)]
pub struct Item<U> {
    name: String,
    code: IdCode,
    userdata: Option<U>,
    /// Enabled library indices. Empty means every library.
    libraries: BTreeSet<usize>,
    new_id: Option<IdKey>,
    liboverride_id: Option<IdKey>,
    source_library: Option<LibraryKey>,
    tag: ItemTag,
    action: AppendAction,
    reusable_local_id: Option<IdKey>,
    /// ID replaced by this item during a relocation.
    old_id: Option<IdKey>,
}

impl<U> Item<U> {
    fn new(name: &str, code: IdCode, userdata: Option<U>) -> Self {
        Item {
            name: name.to_string(),
            code,
            userdata,
            libraries: BTreeSet::new(),
            new_id: None,
            liboverride_id: None,
            source_library: None,
            tag: ItemTag::empty(),
            action: AppendAction::Unset,
            reusable_local_id: None,
            old_id: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn code(&self) -> IdCode {
        self.code
    }

    pub fn userdata(&self) -> Option<&U> {
        self.userdata.as_ref()
    }

    pub fn new_id(&self) -> Option<IdKey> {
        self.new_id
    }

    pub fn liboverride_id(&self) -> Option<IdKey> {
        self.liboverride_id
    }

    /// Library of the destination document the data was linked from.
    pub fn source_library(&self) -> Option<LibraryKey> {
        self.source_library
    }

    /// The ID this item replaced, for items created by a relocation.
    pub fn relocated_from(&self) -> Option<IdKey> {
        self.old_id
    }

    pub fn tag(&self) -> ItemTag {
        self.tag
    }

    pub fn is_indirect(&self) -> bool {
        self.tag.contains(ItemTag::INDIRECT)
    }

    pub fn action(&self) -> AppendAction {
        self.action
    }

    pub fn is_library_enabled(&self, index: usize) -> bool {
        self.libraries.is_empty() || self.libraries.contains(&index)
    }

    fn matches(&self, flags: ForeachItemFlags) -> bool {
        if self.is_indirect() {
            flags.contains(ForeachItemFlags::DO_INDIRECT)
        } else {
            flags.contains(ForeachItemFlags::DO_DIRECT)
        }
    }
}

/// Selects items for `LinkAppendContext::items`.
#[derive(Debug, Clone, Copy)]
pub struct ItemFilter {
    pub flags: ForeachItemFlags,
    pub code: Option<IdCode>,
}

impl Default for ItemFilter {
    fn default() -> Self {
        ItemFilter {
            flags: ForeachItemFlags::DO_DIRECT,
            code: None,
        }
    }
}

impl ItemFilter {
    pub fn code(code: IdCode) -> Self {
        ItemFilter {
            code: Some(code),
            ..ItemFilter::default()
        }
    }
}

struct LibraryEntry {
    path: String,
    handle: Option<BlendHandle>,
}

/// Results of one pass, one entry per item registered by the client.
#[derive(Debug, Clone, Default)]
pub struct PassOutcome {
    results: BTreeMap<ItemHandle, std::result::Result<IdKey, ResolveError>>,
}

impl PassOutcome {
    pub fn get(&self, item: ItemHandle) -> Option<&std::result::Result<IdKey, ResolveError>> {
        self.results.get(&item)
    }

    /// Results in item registration order.
    pub fn iter(
        &self,
    ) -> impl Iterator<Item = (ItemHandle, &std::result::Result<IdKey, ResolveError>)> {
        self.results.iter().map(|(handle, result)| (*handle, result))
    }

    pub fn resolved(&self) -> impl Iterator<Item = (ItemHandle, IdKey)> + '_ {
        self.results
            .iter()
            .filter_map(|(handle, result)| result.as_ref().ok().map(|id| (*handle, *id)))
    }

    pub fn failures(&self) -> impl Iterator<Item = (ItemHandle, &ResolveError)> {
        self.results
            .iter()
            .filter_map(|(handle, result)| result.as_ref().err().map(|e| (*handle, e)))
    }

    pub fn is_complete(&self) -> bool {
        self.failures().next().is_none()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

pub struct LinkAppendContext<'m, U> {
    main: &'m mut Main,
    flags: LinkFlags,
    id_tag_extra: IdTag,
    embedded: Option<Arc<[u8]>>,
    libraries: Vec<LibraryEntry>,
    items: Vec<Item<U>>,
    stage: Stage,
    new_id_to_item: HashMap<IdKey, ItemHandle>,
    /// Errors per item of the last link, kept so later passes can report them again.
    link_failures: HashMap<ItemHandle, ResolveError>,
}

impl<'m, U> fmt::Debug for LinkAppendContext<'m, U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkAppendContext")
            .field("flags", &self.flags)
            .field("stage", &self.stage())
            .field("libraries", &self.libraries.len())
            .field("items", &self.items.len())
            .finish()
    }
}

impl<'m, U> LinkAppendContext<'m, U> {
    pub fn new(params: LinkAppendParams<'m>) -> Result<Self> {
        if params.main.is_locked() {
            return Err(Error::InvalidArgument(
                "destination document is locked by another operation".to_string(),
            ));
        }

        Ok(LinkAppendContext {
            main: params.main,
            flags: params.flags,
            id_tag_extra: params.id_tag_extra,
            embedded: None,
            libraries: Vec::new(),
            items: Vec::new(),
            stage: Stage::Created,
            new_id_to_item: HashMap::new(),
            link_failures: HashMap::new(),
        })
    }

    /// Releases the context. Dropping it has the same effect.
    pub fn free(self) {}

    pub fn main(&self) -> &Main {
        self.main
    }

    pub fn flags(&self) -> LinkFlags {
        self.flags
    }

    pub fn stage(&self) -> Stage {
        match self.stage {
            Stage::Created if !self.libraries.is_empty() && !self.items.is_empty() => {
                Stage::Populated
            }
            stage => stage,
        }
    }

    /// Sets or clears flags without any validation.
    pub fn flag_set(&mut self, flag: LinkFlags, value: bool) {
        self.flags.set(flag, value);
    }

    /// Replaces the flags. Only allowed before any pass ran.
    pub fn reconfigure(mut self, flags: LinkFlags) -> Result<Self> {
        self.ensure_not_started("reconfigure")?;
        self.flags = flags;
        Ok(self)
    }

    pub fn embedded_blendfile_set<B: Into<Arc<[u8]>>>(&mut self, data: B) -> Result<()> {
        if self.embedded.is_some() {
            return Err(Error::EmbeddedBlendfileAlreadySet);
        }
        self.embedded = Some(data.into());
        Ok(())
    }

    pub fn embedded_blendfile_clear(&mut self) {
        self.embedded = None;
    }

    fn ensure_not_started(&self, operation: &'static str) -> Result<()> {
        if self.stage != Stage::Created {
            return Err(Error::InvalidStage {
                operation,
                stage: self.stage().as_str(),
            });
        }
        Ok(())
    }

    // --- Libraries ------------------------------------------------------------------------------

    /// Registers a library and returns its index. `handle` is an already open library, otherwise
    /// the file is opened when a pass needs it. The same file can be registered several times.
    pub fn library_add<S: Into<String>>(
        &mut self,
        name: S,
        handle: Option<BlendHandle>,
    ) -> Result<usize> {
        self.ensure_not_started("library_add")?;
        if !self.items.is_empty() {
            return Err(Error::InvalidStage {
                operation: "library_add",
                stage: self.stage().as_str(),
            });
        }

        self.libraries.push(LibraryEntry {
            path: name.into(),
            handle,
        });
        Ok(self.libraries.len() - 1)
    }

    pub fn library_count(&self) -> usize {
        self.libraries.len()
    }

    pub fn library_path(&self, index: usize) -> Option<&str> {
        self.libraries.get(index).map(|l| l.path.as_str())
    }

    /// Makes sure the library at `index` has an open handle. Failures are reported and return
    /// `None`.
    fn library_handle_ensure(
        &mut self,
        index: usize,
        reports: &mut Option<&mut ReportList>,
    ) -> Result<&BlendHandle> {
        let embedded = self.embedded.clone();
        let entry = self.libraries.get_mut(index).ok_or(Error::LibraryIndex(index))?;

        if entry.handle.is_none() {
            let opened = if entry.path == EMBEDDED_STARTUP_BLEND {
                match embedded {
                    Some(data) => BlendHandle::from_memory(&data),
                    None => {
                        report(
                            reports,
                            ReportType::Error,
                            "No embedded blend file is set".to_string(),
                        );
                        return Err(Error::EmbeddedBlendfileMissing);
                    }
                }
            } else {
                BlendHandle::from_path(&entry.path)
            };

            match opened {
                Ok(handle) => entry.handle = Some(handle),
                Err(e) => {
                    error!(library = %entry.path, "cannot open library: {}", e);
                    report(
                        reports,
                        ReportType::Error,
                        format!("Cannot read library '{}': {}", entry.path, e),
                    );
                    return Err(Error::LibraryOpen {
                        path: PathBuf::from(&entry.path),
                        source: e,
                    });
                }
            }
        }

        entry.handle.as_ref().ok_or(Error::LibraryIndex(index))
    }

    fn library_handle_release(&mut self, index: usize) {
        if let Some(entry) = self.libraries.get_mut(index) {
            entry.handle = None;
        }
    }

    /// Absolute path the library at `index` is recorded under in the destination document.
    fn library_filepath_abs(&self, index: usize) -> PathBuf {
        let path = match self.libraries.get(index) {
            Some(entry) => entry.path.as_str(),
            None => return PathBuf::new(),
        };
        if path == EMBEDDED_STARTUP_BLEND {
            return PathBuf::from(path);
        }
        let path = Path::new(path);
        if path.is_absolute() {
            return path.to_path_buf();
        }
        std::env::current_dir()
            .map(|dir| dir.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }

    // --- Items ----------------------------------------------------------------------------------

    /// Registers a request for the data-block `name` of type `code`. The same pair can be requested
    /// several times.
    pub fn item_add(&mut self, name: &str, code: IdCode, userdata: U) -> Result<ItemHandle> {
        self.ensure_not_started("item_add")?;
        Ok(self.push_item(Item::new(name, code, Some(userdata))))
    }

    fn push_item(&mut self, item: Item<U>) -> ItemHandle {
        self.items.push(item);
        ItemHandle(self.items.len() - 1)
    }

    /// Registers every linkable data-block of the types in `filter` found in the library at
    /// `index`, each enabled for that library only. An empty filter means every type. Returns how
    /// many items were added, or `Error::LibraryOpen` when the library cannot be read.
    pub fn item_idtypes_from_library_add(
        &mut self,
        mut reports: Option<&mut ReportList>,
        filter: IdFilter,
        index: usize,
    ) -> Result<usize> {
        self.ensure_not_started("item_idtypes_from_library_add")?;
        if index >= self.libraries.len() {
            return Err(Error::LibraryIndex(index));
        }

        let assets_only = self.flags.contains(LinkFlags::ASSETS_ONLY);
        let handle = self.library_handle_ensure(index, &mut reports)?;

        let mut requests = Vec::new();
        for code in IdCode::ALL.iter().copied() {
            if !code.is_linkable() || (!filter.is_empty() && !filter.contains(code.filter())) {
                continue;
            }
            requests.extend(
                handle
                    .datablock_names(code, assets_only)
                    .into_iter()
                    .map(|name| (name.to_string(), code)),
            );
        }

        let added = requests.len();
        for (name, code) in requests {
            let mut item = Item::new(&name, code, None);
            item.libraries.insert(index);
            self.push_item(item);
        }
        Ok(added)
    }

    pub fn item_library_index_enable(&mut self, item: ItemHandle, index: usize) -> Result<()> {
        self.ensure_not_started("item_library_index_enable")?;
        if index >= self.libraries.len() {
            return Err(Error::LibraryIndex(index));
        }
        self.item_mut(item)?.libraries.insert(index);
        Ok(())
    }

    pub fn item(&self, item: ItemHandle) -> Result<&Item<U>> {
        self.items.get(item.0).ok_or(Error::UnknownItem(item.0))
    }

    fn item_mut(&mut self, item: ItemHandle) -> Result<&mut Item<U>> {
        self.items.get_mut(item.0).ok_or(Error::UnknownItem(item.0))
    }

    pub fn item_userdata_get(&self, item: ItemHandle) -> Option<&U> {
        self.items.get(item.0).and_then(Item::userdata)
    }

    pub fn item_newid_get(&self, item: ItemHandle) -> Option<IdKey> {
        self.items.get(item.0).and_then(Item::new_id)
    }

    /// Replaces the linked ID of an item by another ID of the same library.
    pub fn item_newid_set(&mut self, item: ItemHandle, new_id: IdKey) -> Result<()> {
        let current = self.item(item)?;
        let old_id = match current.new_id {
            Some(id) if current.liboverride_id.is_none() => id,
            _ => {
                return Err(Error::InvalidArgument(
                    "only linked items without a liboverride can be remapped".to_string(),
                ))
            }
        };
        let same_library = match (self.main.id(old_id), self.main.id(new_id)) {
            (Some(old), Some(new)) => old.lib == new.lib,
            _ => false,
        };
        if !same_library || self.new_id_to_item.contains_key(&new_id) {
            return Err(Error::InvalidArgument(format!(
                "{} cannot replace {} for this item",
                new_id, old_id
            )));
        }

        self.new_id_to_item.remove(&old_id);
        self.new_id_to_item.insert(new_id, item);
        self.item_mut(item)?.new_id = Some(new_id);
        Ok(())
    }

    pub fn item_liboverrideid_get(&self, item: ItemHandle) -> Option<IdKey> {
        self.items.get(item.0).and_then(Item::liboverride_id)
    }

    pub fn item_idcode_get(&self, item: ItemHandle) -> Option<IdCode> {
        self.items.get(item.0).map(Item::code)
    }

    pub fn item_name_get(&self, item: ItemHandle) -> Option<&str> {
        self.items.get(item.0).map(Item::name)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Calls `callback` for every item selected by `flags`, in registration order, until it returns
    /// `false`.
    pub fn item_foreach<F>(&self, flags: ForeachItemFlags, mut callback: F)
    where
        F: FnMut(ItemHandle, &Item<U>) -> bool,
    {
        for (index, item) in self.items.iter().enumerate() {
            if !item.matches(flags) {
                continue;
            }
            if !callback(ItemHandle(index), item) {
                break;
            }
        }
    }

    /// Items selected by `filter`, in registration order.
    pub fn items(&self, filter: ItemFilter) -> impl Iterator<Item = (ItemHandle, &Item<U>)> {
        self.items
            .iter()
            .enumerate()
            .filter(move |(_, item)| {
                item.matches(filter.flags) && filter.code.map_or(true, |c| c == item.code)
            })
            .map(|(index, item)| (ItemHandle(index), item))
    }

    // --- Passes ---------------------------------------------------------------------------------

    /// Ends the operation: runtime tags set by the passes are cleared.
    pub fn finalize(&mut self) -> Result<()> {
        match self.stage {
            Stage::Linked | Stage::Appended | Stage::Overridden => {}
            _ => {
                return Err(Error::InvalidStage {
                    operation: "finalize",
                    stage: self.stage().as_str(),
                })
            }
        }
        self.main.tag_all(IdTag::PRE_EXISTING | IdTag::NEW, false);
        self.stage = Stage::Done;
        Ok(())
    }

    /// Results of the items registered by the client.
    fn outcome<F>(&self, result_of: F) -> PassOutcome
    where
        F: Fn(ItemHandle, &Item<U>) -> std::result::Result<IdKey, ResolveError>,
    {
        PassOutcome {
            results: self
                .items(ItemFilter::default())
                .map(|(handle, item)| (handle, result_of(handle, item)))
                .collect(),
        }
    }

    /// Why an item has no linked ID.
    fn link_failure(&self, handle: ItemHandle, item: &Item<U>) -> ResolveError {
        self.link_failures
            .get(&handle)
            .cloned()
            .unwrap_or_else(|| ResolveError::NotFound {
                name: item.name.clone(),
                code: item.code,
            })
    }
}
