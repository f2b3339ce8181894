//! A one call driver for the link/append context.
//!
//! `LibraryLoader` opens one library file, lets the caller look at what it contains, then loads a
//! set of named data-blocks into a document:
//!
//! ```no_run
//! use blend_link::{
//!     document::Main,
//!     idtype::IdCode,
//!     loader::{LibraryLoader, LoadOptions, LoadRequest},
//! };
//!
//! let loader = LibraryLoader::open("assets/props.blend", LoadOptions::default())?;
//! let mut request = LoadRequest::new();
//! for name in loader.available(IdCode::Object) {
//!     request.add(IdCode::Object, name);
//! }
//!
//! let mut main = Main::new();
//! let result = loader.load(&mut main, &request)?;
//! for report in result.reports.iter() {
//!     println!("{}", report);
//! }
//! # Ok::<(), blend_link::error::Error>(())
//! ```

use crate::{
    document::{IdKey, IdTag, Main},
    error::{Error, Result},
    handle::BlendHandle,
    idtype::IdCode,
    link_append::{ItemFilter, LinkAppendContext, LinkAppendParams, LinkFlags, OverrideFlags},
    report::ReportList,
};
use linked_hash_map::LinkedHashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// How data is loaded. Every option defaults to `false`, which appends the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadOptions {
    /// Link the data instead of appending it.
    pub link: bool,
    /// Store the library path relative to the document.
    pub relative: bool,
    pub assets_only: bool,
    /// Create liboverrides of the linked data. Requires `link`.
    pub create_liboverrides: bool,
    /// Return existing liboverrides instead of creating new ones.
    pub reuse_liboverrides: bool,
    pub create_liboverrides_runtime: bool,
    /// Append the data coming from other libraries too.
    pub recursive: bool,
    pub set_fake_user: bool,
}

impl LoadOptions {
    pub fn validate(&self) -> Result<()> {
        if self.create_liboverrides && !self.link {
            return Err(Error::InvalidArgument(
                "`create_liboverrides` requires `link`".to_string(),
            ));
        }
        if self.reuse_liboverrides && !self.create_liboverrides {
            return Err(Error::InvalidArgument(
                "`reuse_liboverrides` requires `create_liboverrides`".to_string(),
            ));
        }
        if self.create_liboverrides_runtime && !self.create_liboverrides {
            return Err(Error::InvalidArgument(
                "`create_liboverrides_runtime` requires `create_liboverrides`".to_string(),
            ));
        }
        Ok(())
    }

    pub fn link_flags(&self) -> LinkFlags {
        let mut flags = LinkFlags::empty();
        flags.set(LinkFlags::LINK, self.link);
        flags.set(LinkFlags::RELATIVE_PATH, self.relative);
        flags.set(LinkFlags::ASSETS_ONLY, self.assets_only);
        flags.set(LinkFlags::APPEND_RECURSIVE, self.recursive);
        flags.set(LinkFlags::APPEND_SET_FAKEUSER, self.set_fake_user);
        flags
    }

    pub fn override_flags(&self) -> OverrideFlags {
        let mut flags = OverrideFlags::empty();
        flags.set(OverrideFlags::CREATE_RUNTIME, self.create_liboverrides_runtime);
        flags.set(OverrideFlags::USE_EXISTING_LIBOVERRIDES, self.reuse_liboverrides);
        flags
    }
}

/// Names of the data-blocks to load, per type, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadRequest {
    names: LinkedHashMap<IdCode, Vec<String>>,
}

impl LoadRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<S: Into<String>>(&mut self, code: IdCode, name: S) -> &mut Self {
        self.names.entry(code).or_insert_with(Vec::new).push(name.into());
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (IdCode, &[String])> {
        self.names.iter().map(|(code, names)| (*code, names.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.names.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What was loaded for one requested name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Loaded {
    Found(IdKey),
    Missing(String),
}

impl Loaded {
    pub fn id(&self) -> Option<IdKey> {
        match self {
            Loaded::Found(id) => Some(*id),
            Loaded::Missing(_) => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct LoadResult {
    /// One entry per requested name, in request order.
    pub ids: LinkedHashMap<IdCode, Vec<Loaded>>,
    pub reports: ReportList,
}

impl LoadResult {
    pub fn get(&self, code: IdCode) -> &[Loaded] {
        self.ids.get(&code).map_or(&[][..], Vec::as_slice)
    }
}

#[derive(Debug)]
pub struct LibraryLoader {
    path: PathBuf,
    options: LoadOptions,
    handle: BlendHandle,
}

impl LibraryLoader {
    /// Validates `options` and opens the library at `path`.
    pub fn open<P: AsRef<Path>>(path: P, options: LoadOptions) -> Result<Self> {
        options.validate()?;
        let path = path.as_ref().to_path_buf();
        let handle = BlendHandle::from_path(&path).map_err(|source| Error::LibraryOpen {
            path: path.clone(),
            source,
        })?;

        Ok(LibraryLoader {
            path,
            options,
            handle,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> LoadOptions {
        self.options
    }

    /// Names of the data-blocks of type `code` the library contains.
    pub fn available(&self, code: IdCode) -> Vec<&str> {
        if !code.is_linkable() {
            return Vec::new();
        }
        self.handle.datablock_names(code, self.options.assets_only)
    }

    /// Loads the requested data-blocks into `main`. Names the library does not contain are returned
    /// as `Loaded::Missing` and reported as warnings.
    pub fn load(self, main: &mut Main, request: &LoadRequest) -> Result<LoadResult> {
        let options = self.options;
        let mut result = LoadResult::default();

        let mut params = LinkAppendParams::new(main, options.link_flags());
        params.id_tag_extra = IdTag::TEMP_MAIN;
        let mut context = LinkAppendContext::new(params)?;
        context.library_add(self.path.to_string_lossy(), Some(self.handle))?;

        for (code, names) in request.iter() {
            for (index, name) in names.iter().enumerate() {
                context.item_add(name, code, index)?;
            }
        }

        context.link(Some(&mut result.reports))?;
        if options.create_liboverrides {
            context.liboverride(options.override_flags(), Some(&mut result.reports))?;
        } else if !options.link {
            context.append(Some(&mut result.reports))?;
        }

        for (code, names) in request.iter() {
            let mut loaded: Vec<Loaded> = names.iter().cloned().map(Loaded::Missing).collect();
            for (_, item) in context.items(ItemFilter::code(code)) {
                let id = if options.create_liboverrides {
                    item.liboverride_id()
                } else {
                    item.new_id()
                };
                if let (Some(id), Some(&index)) = (id, item.userdata()) {
                    if let Some(slot) = loaded.get_mut(index) {
                        *slot = Loaded::Found(id);
                    }
                }
            }
            debug!(
                %code,
                requested = names.len(),
                found = loaded.iter().filter(|l| l.id().is_some()).count(),
                "loaded data-blocks"
            );
            result.ids.insert(code, loaded);
        }

        context.finalize()?;
        Ok(result)
    }
}
