//! The destination document: every ID data-block and library known to the current file.
//!
//! IDs live in an arena and are addressed by `IdKey`s. Keys are never reused, a deleted ID leaves
//! an empty slot so keys held by clients stay unambiguous. References between IDs are plain key
//! lists, user counts are derived from them.

use crate::idtype::IdCode;
use linked_hash_map::LinkedHashMap;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fmt,
    path::{Component, Path, PathBuf},
};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdKey(usize);

impl IdKey {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for IdKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LibraryKey(usize);

bitflags::bitflags! {
    /// Runtime tags of an ID. Never saved, only meaningful during an operation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct IdTag: u32 {
        /// The ID existed before the current link/append operation started.
        const PRE_EXISTING = 1 << 0;
        /// Linked and directly used by local data.
        const EXTERN = 1 << 1;
        /// Linked only because another linked ID uses it.
        const INDIRECT = 1 << 2;
        /// Created by the current operation.
        const NEW = 1 << 3;
        /// Placeholder for data that could not be found in its library.
        const MISSING = 1 << 4;
        /// Liboverride that is never written to disk.
        const RUNTIME = 1 << 5;
        /// Free for clients, typically passed as the extra tag of a link/append context to find
        /// what it created.
        const TEMP_MAIN = 1 << 7;
    }
}

bitflags::bitflags! {
    /// Persistent flags of an ID.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct IdFlag: u16 {
        /// The ID keeps one extra user so it is never considered unused.
        const FAKEUSER = 1 << 0;
    }
}

/// Remembers which library data a local ID was appended from, so later appends can reuse it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeakReference {
    pub library_filepath: String,
    /// Full name of the library ID, type prefix included.
    pub library_id_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverrideLibrary {
    pub reference: IdKey,
}

#[derive(Debug, Clone)]
pub struct Id {
    pub name: String,
    pub code: IdCode,
    pub lib: Option<LibraryKey>,
    pub tag: IdTag,
    pub flag: IdFlag,
    /// IDs this one uses, once per usage.
    pub references: Vec<IdKey>,
    pub override_library: Option<OverrideLibrary>,
    /// Set while an operation maps this ID to its replacement (local copy, override...).
    pub newid: Option<IdKey>,
    pub weak_reference: Option<WeakReference>,
    pub is_asset: bool,
}

impl Id {
    pub fn new(code: IdCode, name: &str) -> Self {
        Id {
            name: name.to_string(),
            code,
            lib: None,
            tag: IdTag::empty(),
            flag: IdFlag::empty(),
            references: Vec::new(),
            override_library: None,
            newid: None,
            weak_reference: None,
            is_asset: false,
        }
    }

    pub fn is_linked(&self) -> bool {
        self.lib.is_some()
    }

    /// The name with its type prefix, `MECube`.
    pub fn full_name(&self) -> String {
        format!("{}{}", self.code, self.name)
    }

    pub fn is_override(&self) -> bool {
        self.override_library.is_some()
    }

    pub fn has_fake_user(&self) -> bool {
        self.flag.contains(IdFlag::FAKEUSER)
    }
}

#[derive(Debug, Clone)]
pub struct Library {
    /// The path as stored in the file, possibly relative (`//lib.blend`).
    pub filepath: String,
    pub filepath_abs: PathBuf,
    pub tag: IdTag,
    /// Version of the file the library data was last read from.
    pub version: u16,
}

#[derive(Debug)]
struct Slot {
    id: Id,
    attached: bool,
}

#[derive(Debug, Default)]
pub struct Main {
    filepath: Option<PathBuf>,
    ids: Vec<Option<Slot>>,
    libraries: Vec<Option<Library>>,
    library_by_path: LinkedHashMap<PathBuf, LibraryKey>,
    lock: usize,
}

impl Main {
    pub fn new() -> Self {
        Self::default()
    }

    /// A document saved at `filepath`. Relative library paths are computed from its directory.
    pub fn with_filepath<P: Into<PathBuf>>(filepath: P) -> Self {
        Main {
            filepath: Some(filepath.into()),
            ..Main::default()
        }
    }

    pub fn filepath(&self) -> Option<&Path> {
        self.filepath.as_deref()
    }

    pub fn lock(&mut self) {
        self.lock += 1;
    }

    pub fn unlock(&mut self) {
        self.lock = self.lock.saturating_sub(1);
    }

    pub fn is_locked(&self) -> bool {
        self.lock > 0
    }

    // --- IDs ------------------------------------------------------------------------------------

    /// Adds an ID, renaming it with a numeric suffix if its name is taken in the same library.
    pub fn add_id(&mut self, mut id: Id) -> IdKey {
        id.name = self.unique_name(id.code, id.lib, &id.name, None);
        self.ids.push(Some(Slot { id, attached: true }));
        IdKey(self.ids.len() - 1)
    }

    pub fn id(&self, key: IdKey) -> Option<&Id> {
        match self.ids.get(key.0) {
            Some(Some(slot)) => Some(&slot.id),
            _ => None,
        }
    }

    pub fn id_mut(&mut self, key: IdKey) -> Option<&mut Id> {
        match self.ids.get_mut(key.0) {
            Some(Some(slot)) => Some(&mut slot.id),
            _ => None,
        }
    }

    pub fn contains(&self, key: IdKey) -> bool {
        matches!(self.ids.get(key.0), Some(Some(slot)) if slot.attached)
    }

    /// Every attached ID, in creation order.
    pub fn ids(&self) -> impl Iterator<Item = (IdKey, &Id)> {
        self.ids.iter().enumerate().filter_map(|(i, slot)| match slot {
            Some(slot) if slot.attached => Some((IdKey(i), &slot.id)),
            _ => None,
        })
    }

    pub fn keys(&self) -> Vec<IdKey> {
        self.ids().map(|(key, _)| key).collect()
    }

    pub fn len(&self) -> usize {
        self.ids().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Finds an attached ID by type, name and library (`None` for local data).
    pub fn find(&self, code: IdCode, name: &str, lib: Option<LibraryKey>) -> Option<IdKey> {
        self.ids()
            .find(|(_, id)| id.code == code && id.lib == lib && id.name == name)
            .map(|(key, _)| key)
    }

    /// Number of users of `key`: every usage by another attached ID, override references included,
    /// plus the fake user.
    pub fn users(&self, key: IdKey) -> usize {
        let usages: usize = self
            .ids()
            .filter(|&(other, _)| other != key)
            .map(|(_, id)| {
                id.references.iter().filter(|&&r| r == key).count()
                    + id.override_library
                        .as_ref()
                        .map_or(0, |o| (o.reference == key) as usize)
            })
            .sum();
        let fake = self.id(key).map_or(0, |id| id.has_fake_user() as usize);
        usages + fake
    }

    /// IDs using `key`.
    pub fn users_of(&self, key: IdKey) -> Vec<IdKey> {
        self.ids()
            .filter(|(other, id)| {
                *other != key
                    && (id.references.contains(&key)
                        || id.override_library.as_ref().map_or(false, |o| o.reference == key))
            })
            .map(|(other, _)| other)
            .collect()
    }

    pub fn add_reference(&mut self, from: IdKey, to: IdKey) {
        if let Some(id) = self.id_mut(from) {
            id.references.push(to);
        }
    }

    pub fn rename(&mut self, key: IdKey, name: &str) {
        let (code, lib) = match self.id(key) {
            Some(id) => (id.code, id.lib),
            None => return,
        };
        let name = self.unique_name(code, lib, name, Some(key));
        if let Some(id) = self.id_mut(key) {
            id.name = name;
        }
    }

    fn unique_name(
        &self,
        code: IdCode,
        lib: Option<LibraryKey>,
        name: &str,
        exclude: Option<IdKey>,
    ) -> String {
        let taken: HashSet<&str> = self
            .ids()
            .filter(|&(key, id)| Some(key) != exclude && id.code == code && id.lib == lib)
            .map(|(_, id)| id.name.as_str())
            .collect();

        if !taken.contains(name) {
            return name.to_string();
        }

        let base = split_numeric_suffix(name);
        (1..)
            .map(|n| format!("{}.{:03}", base, n))
            .find(|candidate| !taken.contains(candidate.as_str()))
            .unwrap_or_else(|| name.to_string())
    }

    pub fn tag_all(&mut self, tag: IdTag, value: bool) {
        for slot in self.ids.iter_mut().flatten().filter(|s| s.attached) {
            slot.id.tag.set(tag, value);
        }
    }

    pub fn clear_newid(&mut self) {
        for slot in self.ids.iter_mut().flatten() {
            slot.id.newid = None;
        }
    }

    /// Temporarily removes an ID from lookups and iteration without deleting it.
    pub fn detach(&mut self, key: IdKey) {
        if let Some(Some(slot)) = self.ids.get_mut(key.0) {
            slot.attached = false;
        }
    }

    pub fn attach(&mut self, key: IdKey) {
        if let Some(Some(slot)) = self.ids.get_mut(key.0) {
            slot.attached = true;
        }
    }

    /// Deletes IDs. Usages of the deleted IDs by the remaining ones are cleared.
    pub fn delete_multi(&mut self, keys: &[IdKey]) {
        let deleted: HashSet<IdKey> = keys.iter().copied().collect();
        for key in &deleted {
            if let Some(slot) = self.ids.get_mut(key.0) {
                if let Some(slot) = slot.take() {
                    debug!(id = %slot.id.full_name(), "deleting ID");
                }
            }
        }

        for slot in self.ids.iter_mut().flatten() {
            let id = &mut slot.id;
            id.references.retain(|r| !deleted.contains(r));
            if id.override_library.as_ref().map_or(false, |o| deleted.contains(&o.reference)) {
                id.override_library = None;
            }
            if id.newid.map_or(false, |n| deleted.contains(&n)) {
                id.newid = None;
            }
        }
    }

    pub fn delete(&mut self, key: IdKey) {
        self.delete_multi(&[key]);
    }

    /// Replaces every usage of `old` by `new`. With `skip_indirect`, usages by linked IDs are left
    /// untouched.
    pub fn remap(&mut self, old: IdKey, new: IdKey, skip_indirect: bool) {
        for (index, slot) in self.ids.iter_mut().enumerate() {
            let slot = match slot {
                Some(slot) if slot.attached => slot,
                _ => continue,
            };
            if index == old.0 || index == new.0 || (skip_indirect && slot.id.is_linked()) {
                continue;
            }

            for reference in slot.id.references.iter_mut().filter(|r| **r == old) {
                *reference = new;
            }
            if let Some(o) = slot.id.override_library.as_mut() {
                if o.reference == old {
                    o.reference = new;
                }
            }
        }
    }

    /// Makes every usage by the IDs in `keys` point to the `newid` of the used ID, when it has one.
    pub fn relink_to_newid(&mut self, keys: &[IdKey]) {
        let newids: Vec<Option<IdKey>> = self
            .ids
            .iter()
            .map(|slot| slot.as_ref().and_then(|s| s.id.newid))
            .collect();
        let lookup = |key: IdKey| newids.get(key.0).copied().flatten();

        for &key in keys {
            if let Some(id) = self.id_mut(key) {
                for reference in id.references.iter_mut() {
                    if let Some(new) = lookup(*reference) {
                        *reference = new;
                    }
                }
            }
        }
    }

    /// Turns a linked ID into local data in place.
    pub fn make_local(&mut self, key: IdKey) {
        let (code, name) = match self.id_mut(key) {
            Some(id) => {
                id.lib = None;
                id.tag.remove(IdTag::EXTERN | IdTag::INDIRECT | IdTag::MISSING);
                (id.code, id.name.clone())
            }
            None => return,
        };
        let name = self.unique_name(code, None, &name, Some(key));
        if let Some(id) = self.id_mut(key) {
            id.name = name;
        }
    }

    /// Creates a local copy of `key`, stored as its `newid`.
    pub fn copy_local(&mut self, key: IdKey) -> Option<IdKey> {
        let source = self.id(key)?;
        let mut copy = source.clone();
        copy.lib = None;
        copy.tag = IdTag::empty();
        copy.newid = None;
        copy.weak_reference = None;

        let new = self.add_id(copy);
        if let Some(id) = self.id_mut(key) {
            id.newid = Some(new);
        }
        Some(new)
    }

    /// Creates a local liboverride of the linked ID `reference`, stored as its `newid`.
    pub fn override_create(&mut self, reference: IdKey) -> Option<IdKey> {
        let source = self.id(reference)?;
        let mut id = Id::new(source.code, &source.name);
        id.references = source.references.clone();
        id.is_asset = source.is_asset;
        id.override_library = Some(OverrideLibrary { reference });

        let new = self.add_id(id);
        if let Some(id) = self.id_mut(reference) {
            id.newid = Some(new);
        }
        Some(new)
    }

    // --- Libraries ------------------------------------------------------------------------------

    /// Returns the library read from `filepath_abs`, creating it if needed.
    pub fn library_ensure(&mut self, filepath_abs: &Path) -> LibraryKey {
        if let Some(&key) = self.library_by_path.get(filepath_abs) {
            if self.library(key).is_some() {
                return key;
            }
        }

        self.libraries.push(Some(Library {
            filepath: filepath_abs.to_string_lossy().into_owned(),
            filepath_abs: filepath_abs.to_path_buf(),
            tag: IdTag::empty(),
            version: 0,
        }));
        let key = LibraryKey(self.libraries.len() - 1);
        self.library_by_path.insert(filepath_abs.to_path_buf(), key);
        key
    }

    pub fn library(&self, key: LibraryKey) -> Option<&Library> {
        self.libraries.get(key.0).and_then(Option::as_ref)
    }

    pub fn library_mut(&mut self, key: LibraryKey) -> Option<&mut Library> {
        self.libraries.get_mut(key.0).and_then(Option::as_mut)
    }

    pub fn find_library(&self, filepath_abs: &Path) -> Option<LibraryKey> {
        self.library_by_path
            .get(filepath_abs)
            .copied()
            .filter(|&key| self.library(key).is_some())
    }

    /// Every library, in creation order.
    pub fn libraries(&self) -> impl Iterator<Item = (LibraryKey, &Library)> {
        self.library_by_path
            .values()
            .filter_map(move |&key| self.library(key).map(|lib| (key, lib)))
    }

    /// Stores the path of `key` relative to the directory of this document, when it has one.
    pub fn library_make_relative(&mut self, key: LibraryKey) {
        let base = match self.filepath.as_ref().and_then(|p| p.parent()) {
            Some(base) => base.to_path_buf(),
            None => return,
        };
        if let Some(lib) = self.library_mut(key) {
            lib.filepath = relative_path(&base, &lib.filepath_abs);
        }
    }

    /// Deletes libraries no attached ID comes from.
    pub fn remove_unused_libraries(&mut self) {
        let used: HashSet<LibraryKey> = self.ids().filter_map(|(_, id)| id.lib).collect();
        let unused: Vec<(PathBuf, LibraryKey)> = self
            .library_by_path
            .iter()
            .filter(|(_, key)| !used.contains(key))
            .map(|(path, &key)| (path.clone(), key))
            .collect();

        for (path, key) in unused {
            debug!(library = %path.display(), "removing unused library");
            self.library_by_path.remove(&path);
            if let Some(slot) = self.libraries.get_mut(key.0) {
                *slot = None;
            }
        }
    }
}

/// Strips a `.001` style suffix.
fn split_numeric_suffix(name: &str) -> &str {
    match name.rfind('.') {
        Some(dot)
            if dot + 1 < name.len() && name[dot + 1..].bytes().all(|b| b.is_ascii_digit()) =>
        {
            &name[..dot]
        }
        _ => name,
    }
}

/// Blender style relative path (`//textures/wood.png`) of `target` seen from the directory `base`.
pub fn relative_path(base: &Path, target: &Path) -> String {
    let base: Vec<Component> = base.components().collect();
    let target_components: Vec<Component> = target.components().collect();

    if base.first() != target_components.first() {
        return target.to_string_lossy().into_owned();
    }

    let common = base
        .iter()
        .zip(target_components.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut parts: Vec<String> = Vec::new();
    parts.extend((common..base.len()).map(|_| "..".to_string()));
    parts.extend(
        target_components[common..]
            .iter()
            .map(|c| c.as_os_str().to_string_lossy().into_owned()),
    );

    format!("//{}", parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_unique_per_library() {
        let mut main = Main::new();
        let lib = main.library_ensure(Path::new("/libs/a.blend"));

        let a = main.add_id(Id::new(IdCode::Mesh, "Cube"));
        let b = main.add_id(Id::new(IdCode::Mesh, "Cube"));
        let c = main.add_id(Id::new(IdCode::Mesh, "Cube.001"));
        let mut linked = Id::new(IdCode::Mesh, "Cube");
        linked.lib = Some(lib);
        let d = main.add_id(linked);
        let o = main.add_id(Id::new(IdCode::Object, "Cube"));

        let name = |k| main.id(k).map(|id| id.name.clone()).unwrap_or_default();
        assert_eq!(name(a), "Cube");
        assert_eq!(name(b), "Cube.001");
        assert_eq!(name(c), "Cube.002");
        assert_eq!(name(d), "Cube");
        assert_eq!(name(o), "Cube");
        assert_eq!(main.find(IdCode::Mesh, "Cube", Some(lib)), Some(d));
    }

    #[test]
    fn users_count_references_and_fake_user() {
        let mut main = Main::new();
        let mesh = main.add_id(Id::new(IdCode::Mesh, "Mesh"));
        let a = main.add_id(Id::new(IdCode::Object, "A"));
        let b = main.add_id(Id::new(IdCode::Object, "B"));
        main.add_reference(a, mesh);
        main.add_reference(b, mesh);
        assert_eq!(main.users(mesh), 2);

        if let Some(id) = main.id_mut(mesh) {
            id.flag.insert(IdFlag::FAKEUSER);
        }
        assert_eq!(main.users(mesh), 3);

        main.delete(a);
        assert_eq!(main.users(mesh), 2);
        assert_eq!(main.users_of(mesh), vec![b]);
    }

    #[test]
    fn detached_ids_are_hidden() {
        let mut main = Main::new();
        let mesh = main.add_id(Id::new(IdCode::Mesh, "Mesh"));
        main.detach(mesh);
        assert_eq!(main.find(IdCode::Mesh, "Mesh", None), None);
        assert!(main.id(mesh).is_some());
        main.attach(mesh);
        assert_eq!(main.find(IdCode::Mesh, "Mesh", None), Some(mesh));
    }

    #[test]
    fn remap_skips_linked_users_when_asked() {
        let mut main = Main::new();
        let lib = main.library_ensure(Path::new("/libs/a.blend"));
        let old = main.add_id(Id::new(IdCode::Material, "Old"));
        let new = main.add_id(Id::new(IdCode::Material, "New"));
        let local = main.add_id(Id::new(IdCode::Mesh, "Local"));
        let mut linked = Id::new(IdCode::Mesh, "Linked");
        linked.lib = Some(lib);
        let linked = main.add_id(linked);
        main.add_reference(local, old);
        main.add_reference(linked, old);

        main.remap(old, new, true);
        assert_eq!(main.id(local).map(|id| id.references.clone()), Some(vec![new]));
        assert_eq!(main.id(linked).map(|id| id.references.clone()), Some(vec![old]));

        main.remap(old, new, false);
        assert_eq!(main.users(old), 0);
    }

    #[test]
    fn copy_local_relinks_through_newid() {
        let mut main = Main::new();
        let lib = main.library_ensure(Path::new("/libs/a.blend"));
        let mut material = Id::new(IdCode::Material, "Red");
        material.lib = Some(lib);
        let material = main.add_id(material);
        let mut mesh = Id::new(IdCode::Mesh, "Cube");
        mesh.lib = Some(lib);
        let mesh = main.add_id(mesh);
        main.add_reference(mesh, material);

        let material_copy = main.copy_local(material).expect("copied");
        main.make_local(mesh);
        main.relink_to_newid(&[mesh]);

        assert_eq!(main.id(material_copy).map(|id| id.lib), Some(None));
        assert_eq!(
            main.id(mesh).map(|id| id.references.clone()),
            Some(vec![material_copy])
        );
    }

    #[test]
    fn unused_libraries_are_removed() {
        let mut main = Main::new();
        let used = main.library_ensure(Path::new("/libs/a.blend"));
        main.library_ensure(Path::new("/libs/b.blend"));
        let mut id = Id::new(IdCode::Mesh, "Cube");
        id.lib = Some(used);
        main.add_id(id);

        main.remove_unused_libraries();
        let paths: Vec<_> = main.libraries().map(|(_, l)| l.filepath.clone()).collect();
        assert_eq!(paths, vec!["/libs/a.blend".to_string()]);
    }

    #[test]
    fn relative_paths_use_blender_prefix() {
        assert_eq!(
            relative_path(Path::new("/projects/shot"), Path::new("/projects/shot/lib.blend")),
            "//lib.blend"
        );
        assert_eq!(
            relative_path(Path::new("/projects/shot"), Path::new("/projects/assets/lib.blend")),
            "//../assets/lib.blend"
        );
    }
}
