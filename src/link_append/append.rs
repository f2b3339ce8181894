use super::{
    AppendAction, Item, ItemHandle, ItemTag, LinkAppendContext, LinkFlags, PassOutcome, Stage,
};
use crate::{
    document::{IdFlag, IdKey, IdTag, LibraryKey, WeakReference},
    error::{Error, ResolveError, Result},
    report::ReportList,
};
use std::collections::{HashMap, HashSet};
use tracing::{debug, error};

/// Local IDs appended earlier, by library path and full name of the library ID they came from.
type WeakReferences = HashMap<(String, String), IdKey>;

impl<'m, U> LinkAppendContext<'m, U> {
    /// Turns the linked data of every item into local data.
    ///
    /// Dependencies of the items are added as indirect items and get an action of their own. Items
    /// that were never linked keep no ID.
    pub fn append(&mut self, _reports: Option<&mut ReportList>) -> Result<PassOutcome> {
        if self.stage != Stage::Linked {
            return Err(Error::InvalidStage {
                operation: "append",
                stage: self.stage().as_str(),
            });
        }
        if self.flags.contains(LinkFlags::LINK) {
            return Err(Error::InvalidArgument(
                "cannot append with a context configured to link".to_string(),
            ));
        }
        self.stage = Stage::Appended;

        if !self.items.is_empty() {
            let mut weak_references = self.weak_references();
            self.define_actions(&mut weak_references);
            self.apply_actions();
        }

        Ok(self.outcome(|handle, item| {
            item.new_id.ok_or_else(|| {
                self.link_failures
                    .get(&handle)
                    .cloned()
                    .unwrap_or(ResolveError::NotLinked)
            })
        }))
    }

    fn weak_references(&self) -> WeakReferences {
        self.main
            .ids()
            .filter(|(_, id)| !id.is_linked())
            .filter_map(|(key, id)| {
                id.weak_reference
                    .as_ref()
                    .map(|w| ((w.library_filepath.clone(), w.library_id_name.clone()), key))
            })
            .collect()
    }

    /// Library path and full name an ID appended from `key` would be remembered under.
    fn weak_reference_of(&self, key: IdKey) -> Option<WeakReference> {
        let id = self.main.id(key)?;
        let library = self.main.library(id.lib?)?;
        Some(WeakReference {
            library_filepath: library.filepath.clone(),
            library_id_name: id.full_name(),
        })
    }

    fn weak_reference_remove(&mut self, weak_references: &mut WeakReferences, item: usize) {
        let linked = match self.items[item].new_id {
            Some(id) => id,
            None => return,
        };
        if let Some(w) = self.weak_reference_of(linked) {
            weak_references.remove(&(w.library_filepath, w.library_id_name));
        }
        if let Some(local) = self.items[item].reusable_local_id.take() {
            if let Some(id) = self.main.id_mut(local) {
                id.weak_reference = None;
            }
        }
    }

    /// IDs used by `key`, and whether the usage is only as a liboverride reference. Non-linkable
    /// IDs (shape keys...) are not returned, the IDs they use are.
    fn dependencies_of(&self, key: IdKey) -> Vec<(IdKey, bool)> {
        let mut found = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![key];
        visited.insert(key);

        while let Some(owner) = stack.pop() {
            let id = match self.main.id(owner) {
                Some(id) => id,
                None => continue,
            };
            let usages = id
                .references
                .iter()
                .map(|&r| (r, false))
                .chain(id.override_library.as_ref().map(|o| (o.reference, true)));

            for (used, override_usage) in usages {
                let data = match self.main.id(used) {
                    Some(data) => data,
                    None => continue,
                };
                if !data.is_linked() {
                    error!(
                        id = %data.full_name(),
                        owner = %id.full_name(),
                        "local ID found as part of a linked data-block hierarchy"
                    );
                    continue;
                }
                if !data.code.is_linkable() {
                    if visited.insert(used) {
                        stack.push(used);
                    }
                    continue;
                }
                if used != key && !found.contains(&(used, override_usage)) {
                    found.push((used, override_usage));
                }
            }
        }

        found
    }

    /// Records `used` as a dependency of an item, adding an indirect item for it if needed.
    fn dependency_add(&mut self, used: IdKey, override_usage: bool, parent_tag: ItemTag) {
        let override_only =
            override_usage || parent_tag.contains(ItemTag::LIBOVERRIDE_DEPENDENCY_ONLY);

        if let Some(&handle) = self.new_id_to_item.get(&used) {
            let item = &mut self.items[handle.0];
            if override_only {
                if !item.tag.contains(ItemTag::LIBOVERRIDE_DEPENDENCY_ONLY) {
                    item.tag.insert(ItemTag::LIBOVERRIDE_DEPENDENCY);
                }
            } else if item.tag.contains(ItemTag::LIBOVERRIDE_DEPENDENCY_ONLY) {
                item.tag.remove(ItemTag::LIBOVERRIDE_DEPENDENCY_ONLY);
                item.tag.insert(ItemTag::LIBOVERRIDE_DEPENDENCY);
            }
            return;
        }

        let (name, code, lib) = match self.main.id(used) {
            Some(id) => (id.name.clone(), id.code, id.lib),
            None => return,
        };
        let mut item = Item::new(&name, code, None);
        item.new_id = Some(used);
        item.source_library = lib;
        item.tag = ItemTag::INDIRECT;
        if override_only {
            item.tag.insert(ItemTag::LIBOVERRIDE_DEPENDENCY_ONLY);
        } else if parent_tag.contains(ItemTag::LIBOVERRIDE_DEPENDENCY) {
            item.tag.insert(ItemTag::LIBOVERRIDE_DEPENDENCY);
        }

        debug!(id = %used, %code, name = %name, "adding dependency item");
        let handle = self.push_item(item);
        self.new_id_to_item.insert(used, handle);
    }

    fn define_actions(&mut self, weak_references: &mut WeakReferences) {
        let do_recursive = self.flags.contains(LinkFlags::APPEND_RECURSIVE);
        let do_reuse = self.flags.contains(LinkFlags::APPEND_LOCAL_ID_REUSE);

        self.new_id_to_item = self
            .items
            .iter()
            .enumerate()
            .filter_map(|(index, item)| item.new_id.map(|id| (id, ItemHandle(index))))
            .collect();

        let direct_libraries: HashSet<Option<LibraryKey>> = if do_recursive {
            HashSet::new()
        } else {
            self.items
                .iter()
                .filter_map(|item| item.new_id)
                .filter_map(|id| self.main.id(id).map(|id| id.lib))
                .collect()
        };

        // The list grows while it is walked, dependency items get their own dependencies added.
        let mut index = 0;
        while index < self.items.len() {
            let id = match self.items[index].new_id {
                Some(id) => id,
                None => {
                    index += 1;
                    continue;
                }
            };

            let reusable = match self.main.id(id) {
                Some(data) if data.code.append_is_reusable() => {
                    self.weak_reference_of(id).and_then(|w| {
                        weak_references
                            .get(&(w.library_filepath, w.library_id_name))
                            .copied()
                    })
                }
                _ => None,
            };
            self.items[index].reusable_local_id = reusable;

            let parent_tag = self.items[index].tag;
            for (used, override_usage) in self.dependencies_of(id) {
                self.dependency_add(used, override_usage, parent_tag);
            }
            index += 1;
        }

        for item in self.items.iter_mut() {
            let id = match item.new_id {
                Some(id) => id,
                None => continue,
            };
            let keep_linked = if item.tag.contains(ItemTag::LIBOVERRIDE_DEPENDENCY_ONLY) {
                true
            } else if !do_recursive {
                let lib = self.main.id(id).and_then(|id| id.lib);
                !direct_libraries.contains(&lib)
            } else {
                false
            };
            if keep_linked {
                debug!(name = %item.name, code = %item.code, "data-block stays linked");
                item.action = AppendAction::KeepLinked;
                item.reusable_local_id = None;
            }
        }

        // A local ID can only be reused when every data-block it depends on is reused or kept
        // linked too.
        if do_reuse {
            loop {
                let mut changed = false;
                for index in 0..self.items.len() {
                    let id = match (self.items[index].new_id, self.items[index].reusable_local_id) {
                        (Some(id), Some(_)) => id,
                        _ => continue,
                    };
                    let blocked = self.dependencies_of(id).into_iter().any(|(used, _)| {
                        self.new_id_to_item
                            .get(&used)
                            .map(|h| &self.items[h.0])
                            .map_or(false, |dep| {
                                dep.action != AppendAction::KeepLinked
                                    && dep.reusable_local_id.is_none()
                            })
                    });
                    if blocked {
                        debug!(
                            name = %self.items[index].name,
                            "local data cannot be reused, a dependency is not"
                        );
                        self.weak_reference_remove(weak_references, index);
                        changed = true;
                    }
                }
                if !changed {
                    break;
                }
            }
        }

        for index in 0..self.items.len() {
            let item = &self.items[index];
            let id = match (item.new_id, item.action) {
                (Some(id), AppendAction::Unset) => id,
                _ => continue,
            };
            let data = match self.main.id(id) {
                Some(data) => data,
                None => continue,
            };

            let action = if do_reuse && item.reusable_local_id.is_some() {
                AppendAction::ReuseLocal
            } else if data.tag.contains(IdTag::PRE_EXISTING) {
                AppendAction::CopyLocal
            } else if item.tag.contains(ItemTag::LIBOVERRIDE_DEPENDENCY) {
                AppendAction::CopyLocal
            } else if data.is_linked() && data.is_override() {
                AppendAction::CopyLocal
            } else {
                AppendAction::MakeLocal
            };
            debug!(name = %item.name, code = %item.code, ?action, "append action");
            self.items[index].action = action;
        }

        // Linked data kept as is must still use linked dependencies.
        for index in 0..self.items.len() {
            let item = &self.items[index];
            if item.action != AppendAction::KeepLinked {
                continue;
            }
            let id = match item.new_id {
                Some(id) => id,
                None => continue,
            };
            for (used, _) in self.dependencies_of(id) {
                if let Some(&handle) = self.new_id_to_item.get(&used) {
                    let dependency = &mut self.items[handle.0];
                    if dependency.action == AppendAction::MakeLocal {
                        dependency.action = AppendAction::CopyLocal;
                    }
                }
            }
        }

        for index in 0..self.items.len() {
            let item = &self.items[index];
            if item.reusable_local_id.is_some()
                && !matches!(item.action, AppendAction::KeepLinked | AppendAction::ReuseLocal)
            {
                self.weak_reference_remove(weak_references, index);
            }
        }
    }

    fn apply_actions(&mut self) {
        let set_fakeuser = self.flags.contains(LinkFlags::APPEND_SET_FAKEUSER);
        let clear_asset = self.flags.contains(LinkFlags::APPEND_ASSET_DATA_CLEAR);
        let recursive = self.flags.contains(LinkFlags::APPEND_RECURSIVE);

        for index in 0..self.items.len() {
            let (id, action) = match self.items[index].new_id {
                Some(id) => (id, self.items[index].action),
                None => continue,
            };
            let weak_reference = self.weak_reference_of(id);

            let local = match action {
                AppendAction::CopyLocal => {
                    let copy = self.main.copy_local(id);
                    let extra = self.id_tag_extra;
                    if let Some(copy) = copy.and_then(|c| self.main.id_mut(c)) {
                        copy.tag.insert(IdTag::NEW | extra);
                    }
                    copy
                }
                AppendAction::MakeLocal => {
                    self.main.make_local(id);
                    Some(id)
                }
                AppendAction::ReuseLocal => {
                    let reused = self.items[index].reusable_local_id;
                    if let Some(data) = self.main.id_mut(id) {
                        data.newid = reused;
                    }
                    None
                }
                AppendAction::KeepLinked => None,
                AppendAction::Unset => {
                    error!(
                        name = %self.items[index].name,
                        "unexpected unset append action, keeping the data-block linked"
                    );
                    None
                }
            };

            let local = match local.and_then(|key| self.main.id_mut(key)) {
                Some(local) => local,
                None => continue,
            };
            if local.code.append_is_reusable() {
                local.weak_reference = weak_reference;
            }
            if set_fakeuser && local.code.uses_fake_user_on_append() {
                local.flag.insert(IdFlag::FAKEUSER);
            }
            if clear_asset {
                local.is_asset = false;
            }
            if recursive {
                local.override_library = None;
            }
        }

        for item in &self.items {
            let id = match item.new_id {
                Some(id) => id,
                None => continue,
            };
            let local = match item.action {
                AppendAction::MakeLocal => Some(id),
                AppendAction::CopyLocal | AppendAction::ReuseLocal => {
                    self.main.id(id).and_then(|id| id.newid)
                }
                _ => None,
            };
            if let Some(local) = local {
                self.main.relink_to_newid(&[local]);
            }
        }

        let mut superseded = Vec::new();
        for item in self.items.iter_mut() {
            let id = match item.new_id {
                Some(id) => id,
                None => continue,
            };
            if !matches!(item.action, AppendAction::CopyLocal | AppendAction::ReuseLocal) {
                continue;
            }
            let data = match self.main.id(id) {
                Some(data) => data,
                None => continue,
            };
            if let Some(local) = data.newid {
                item.new_id = Some(local);
            }
            if item.action == AppendAction::ReuseLocal
                && !data.tag.contains(IdTag::PRE_EXISTING)
                && !item.tag.contains(ItemTag::LIBOVERRIDE_DEPENDENCY)
            {
                superseded.push(id);
            }
        }

        // Linked data replaced by reused local data is not needed anymore.
        self.main.delete_multi(&superseded);
        self.main.clear_newid();
        self.new_id_to_item = self
            .items
            .iter()
            .enumerate()
            .filter_map(|(index, item)| item.new_id.map(|id| (id, ItemHandle(index))))
            .collect();
    }
}
