use super::{LinkAppendContext, LinkFlags, PassOutcome, Stage};
use crate::{
    document::{Id, IdKey, IdTag, LibraryKey, OverrideLibrary},
    error::{Error, ResolveError, Result},
    handle::BlendHandle,
    idtype::IdCode,
    report::{report, ReportList, ReportType},
};
use tracing::{debug, warn};

/// Files saved before this version get a warning when data is linked from them.
const MIN_VERSION_WITHOUT_WARNING: u16 = 250;

impl<'m, U> LinkAppendContext<'m, U> {
    /// Links every item from the first enabled library that contains it.
    ///
    /// Items that cannot be found get exactly one warning in `reports` and an error in the returned
    /// outcome, the other items are linked regardless.
    pub fn link(&mut self, reports: Option<&mut ReportList>) -> Result<PassOutcome> {
        if self.stage != Stage::Created {
            return Err(Error::InvalidStage {
                operation: "link",
                stage: self.stage().as_str(),
            });
        }
        self.link_items(reports);
        Ok(self.outcome(|handle, item| item.new_id.ok_or_else(|| self.link_failure(handle, item))))
    }

    pub(super) fn link_items(&mut self, mut reports: Option<&mut ReportList>) {
        self.stage = Stage::Linked;
        self.new_id_to_item.clear();
        self.link_failures.clear();

        if self.items.is_empty() {
            return;
        }

        self.main.tag_all(IdTag::PRE_EXISTING, true);

        let mut todo: Vec<bool> = self
            .items
            .iter()
            .map(|item| item.new_id.is_none() && item.code.is_linkable())
            .collect();
        let mut library_opened = vec![false; self.items.len()];

        for lib_index in 0..self.libraries.len() {
            let wanted: Vec<usize> = (0..self.items.len())
                .filter(|&i| todo[i] && self.items[i].is_library_enabled(lib_index))
                .collect();
            if wanted.is_empty() {
                continue;
            }

            if self.library_handle_ensure(lib_index, &mut reports).is_err() {
                continue;
            }
            let handle = match self.libraries.get_mut(lib_index).and_then(|l| l.handle.take()) {
                Some(handle) => handle,
                None => continue,
            };
            let library = self.library_begin(lib_index, &handle, &mut reports);

            for i in wanted {
                library_opened[i] = true;
                let (code, name) = (self.items[i].code, self.items[i].name.clone());

                if let Some(id) = self.link_named_part(&handle, library, code, &name) {
                    todo[i] = false;
                    let item = &mut self.items[i];
                    item.new_id = Some(id);
                    item.source_library = Some(library);
                    self.new_id_to_item.insert(id, super::ItemHandle(i));
                }
            }

            self.library_handle_release(lib_index);
        }

        for (index, item) in self.items.iter().enumerate() {
            if item.new_id.is_some() || item.is_indirect() {
                continue;
            }

            let error = if !item.code.is_linkable() {
                ResolveError::NotLinkable(item.code)
            } else if !library_opened[index] {
                ResolveError::LibraryUnavailable
            } else {
                ResolveError::NotFound {
                    name: item.name.clone(),
                    code: item.code,
                }
            };

            warn!(name = %item.name, code = %item.code, "cannot link data-block: {}", error);
            report(
                &mut reports,
                ReportType::Warning,
                format!("Cannot link '{}' ({}): {}", item.name, item.code, error),
            );
            self.link_failures.insert(super::ItemHandle(index), error);
        }
    }

    /// Returns the record of the library in the destination document, updated for the file being
    /// read.
    fn library_begin(
        &mut self,
        lib_index: usize,
        handle: &BlendHandle,
        reports: &mut Option<&mut ReportList>,
    ) -> LibraryKey {
        let filepath_abs = self.library_filepath_abs(lib_index);
        let library = self.main.library_ensure(&filepath_abs);

        if self.flags.contains(LinkFlags::RELATIVE_PATH) {
            self.main.library_make_relative(library);
        }
        if let Some(lib) = self.main.library_mut(library) {
            // The library may have been missing when the document was loaded.
            lib.tag.remove(IdTag::MISSING);
            lib.version = handle.version();
        }

        let version = handle.version();
        if version < MIN_VERSION_WITHOUT_WARNING {
            report(
                reports,
                ReportType::Warning,
                format!(
                    "Linking or appending from a very old .blend file format ({}.{}), re-save \
                     '{}' with a recent version",
                    version / 100,
                    version % 100,
                    filepath_abs.display()
                ),
            );
        }

        library
    }

    fn direct_tag(&self) -> IdTag {
        if self.flags.contains(LinkFlags::FORCE_INDIRECT) {
            IdTag::INDIRECT
        } else {
            IdTag::EXTERN
        }
    }

    /// Links one data-block and everything it depends on.
    fn link_named_part(
        &mut self,
        handle: &BlendHandle,
        library: LibraryKey,
        code: IdCode,
        name: &str,
    ) -> Option<IdKey> {
        if let Some(block) = handle.find(code, name) {
            return self.read_linked(handle, library, block);
        }

        if !self.flags.contains(LinkFlags::USE_PLACEHOLDERS) {
            return None;
        }

        if let Some(existing) = self.main.find(code, name, Some(library)) {
            return Some(existing);
        }

        debug!(%code, name, "creating placeholder for missing data-block");
        let mut placeholder = Id::new(code, name);
        placeholder.lib = Some(library);
        placeholder.tag = IdTag::MISSING | IdTag::NEW | self.direct_tag() | self.id_tag_extra;
        Some(self.main.add_id(placeholder))
    }

    /// Reads `block` as a directly linked ID, then its dependencies as indirectly linked ones.
    fn read_linked(
        &mut self,
        handle: &BlendHandle,
        library: LibraryKey,
        block: usize,
    ) -> Option<IdKey> {
        let mut queue = Vec::new();
        let root = self.ensure_linked(handle, library, block, true, &mut queue)?;

        while let Some((id, block)) = queue.pop() {
            let data = match handle.get(block) {
                Some(data) => data,
                None => continue,
            };

            for &dependency in &data.dependencies {
                let used = self.ensure_linked(handle, library, dependency, false, &mut queue);
                if let Some(used) = used {
                    self.main.add_reference(id, used);
                }
            }

            let reference = data
                .override_reference
                .and_then(|reference| {
                    self.ensure_linked(handle, library, reference, false, &mut queue)
                });
            if let Some(reference) = reference {
                if let Some(id) = self.main.id_mut(id) {
                    id.override_library = Some(OverrideLibrary { reference });
                }
            }
        }

        Some(root)
    }

    /// Returns the ID of `block`, creating it if it was not linked yet. Newly created IDs are
    /// queued so their dependencies get linked too.
    fn ensure_linked(
        &mut self,
        handle: &BlendHandle,
        library: LibraryKey,
        block: usize,
        direct: bool,
        queue: &mut Vec<(IdKey, usize)>,
    ) -> Option<IdKey> {
        let data = handle.get(block)?;

        if let Some(existing) = self.main.find(data.code, &data.name, Some(library)) {
            if direct {
                warn!(id = %format!("{}{}", data.code, data.name), "data-block is already linked");
                let force_indirect = self.flags.contains(LinkFlags::FORCE_INDIRECT);
                if let Some(id) = self.main.id_mut(existing) {
                    if !force_indirect && id.tag.contains(IdTag::INDIRECT) {
                        id.tag.remove(IdTag::INDIRECT);
                        id.tag.insert(IdTag::EXTERN);
                    }
                }
            }
            return Some(existing);
        }

        let mut id = Id::new(data.code, &data.name);
        id.lib = Some(library);
        id.is_asset = data.is_asset;
        id.tag = IdTag::NEW | self.id_tag_extra;
        id.tag.insert(if direct { self.direct_tag() } else { IdTag::INDIRECT });

        let key = self.main.add_id(id);
        debug!(id = %key, code = %data.code, name = %data.name, direct, "linked data-block");
        queue.push((key, block));
        Some(key)
    }
}
