use super::{Item, LinkAppendContext, LinkFlags, PassOutcome, Stage};
use crate::{
    document::{IdFlag, IdKey, IdTag, LibraryKey},
    error::{Error, Result},
    report::{report, ReportList, ReportType},
};
use tracing::{debug, warn};

impl<'m, U> LinkAppendContext<'m, U> {
    /// Replaces every linked ID of `library` by the data-block of the same name found in the
    /// libraries of the context, usually a single one with the new path of the library.
    ///
    /// With `do_reload` the data is re-read from the same file: missing data-blocks get
    /// placeholders and usages by other linked data are remapped too. Items are created by this
    /// call, none may be registered beforehand.
    pub fn library_relocate(
        &mut self,
        library: LibraryKey,
        do_reload: bool,
        mut reports: Option<&mut ReportList>,
    ) -> Result<PassOutcome> {
        self.relocate_check("library_relocate")?;
        if self.main.library(library).is_none() {
            return Err(Error::InvalidArgument(format!(
                "{:?} is not a library of the destination document",
                library
            )));
        }

        let old_ids: Vec<IdKey> = self
            .main
            .ids()
            .filter(|(_, id)| id.lib == Some(library) && id.code.is_linkable())
            .map(|(key, _)| key)
            .collect();

        for &old_id in &old_ids {
            let mut item = match self.main.id(old_id) {
                Some(id) => Item::new(&id.name, id.code, None),
                None => continue,
            };
            debug!(id = %item.name, code = %item.code, "data-block to seek for");
            item.old_id = Some(old_id);
            self.main.detach(old_id);
            self.push_item(item);
        }

        if self.items.is_empty() {
            self.stage = Stage::Linked;
            return Ok(PassOutcome::default());
        }

        self.main.tag_all(IdTag::PRE_EXISTING, true);
        if do_reload {
            self.flags.insert(LinkFlags::USE_PLACEHOLDERS);
        }

        self.link_items(reports.as_deref_mut());

        self.main.lock();
        for &old_id in &old_ids {
            self.main.attach(old_id);
        }
        self.relocate_remap(!do_reload, &mut reports);
        self.main.unlock();

        self.relocate_cleanup();
        self.relocate_liboverrides();

        Ok(self.relocate_outcome())
    }

    /// Replaces the linked ID `old_id` by the data-block of the same name found in the libraries of
    /// the context.
    pub fn id_relocate(
        &mut self,
        old_id: IdKey,
        mut reports: Option<&mut ReportList>,
    ) -> Result<PassOutcome> {
        self.relocate_check("id_relocate")?;
        if !self.flags.contains(LinkFlags::LINK) {
            return Err(Error::InvalidArgument(
                "relocating a data-block requires a context configured to link".to_string(),
            ));
        }
        let mut item = match self.main.id(old_id) {
            Some(id) if id.is_linked() => Item::new(&id.name, id.code, None),
            _ => return Err(Error::InvalidArgument(format!("{} is not linked data", old_id))),
        };
        item.old_id = Some(old_id);
        self.push_item(item);

        self.main.tag_all(IdTag::PRE_EXISTING, true);
        self.link_items(reports.as_deref_mut());

        self.main.lock();
        self.relocate_remap(true, &mut reports);
        self.main.unlock();

        self.relocate_cleanup();
        self.relocate_liboverrides();
        self.main.tag_all(IdTag::PRE_EXISTING, false);

        Ok(self.relocate_outcome())
    }

    fn relocate_check(&self, operation: &'static str) -> Result<()> {
        self.ensure_not_started(operation)?;
        if !self.items.is_empty() {
            return Err(Error::InvalidStage {
                operation,
                stage: self.stage().as_str(),
            });
        }
        Ok(())
    }

    fn relocate_outcome(&self) -> PassOutcome {
        self.outcome(|handle, item| item.new_id.ok_or_else(|| self.link_failure(handle, item)))
    }

    /// Makes the users of every relocated ID use its replacement.
    fn relocate_remap(&mut self, skip_indirect: bool, reports: &mut Option<&mut ReportList>) {
        let pairs: Vec<(IdKey, IdKey)> = self
            .items
            .iter()
            .filter_map(|item| Some((item.old_id?, item.new_id?)))
            .filter(|(old, new)| old != new)
            .collect();

        for &(old, new) in &pairs {
            debug!(
                old = %old,
                new = %new,
                users = self.main.users(old),
                "remapping relocated data-block"
            );
            self.main.remap(old, new, skip_indirect);
        }

        for &(old, new) in &pairs {
            if self.main.id(old).map_or(false, |id| id.has_fake_user()) {
                if let Some(id) = self.main.id_mut(old) {
                    id.flag.remove(IdFlag::FAKEUSER);
                }
                if let Some(id) = self.main.id_mut(new) {
                    id.flag.insert(IdFlag::FAKEUSER);
                }
            }

            let users = self.main.users(old);
            let same_library = match (self.main.id(old), self.main.id(new)) {
                (Some(old), Some(new)) => old.lib == new.lib,
                _ => false,
            };
            if users == 0 || !same_library {
                continue;
            }

            // Still used, it cannot keep the name of its replacement.
            let name = match self.main.id(old) {
                Some(id) => kept_name(&id.name),
                None => continue,
            };
            self.main.rename(old, &name);

            let full_name = |key| self.main.id(key).map(|id| id.full_name()).unwrap_or_default();
            let message = format!(
                "Lib Reload: Replacing all references to old data-block '{}' by reloaded one \
                 failed, old one ({} remaining users) had to be kept and was renamed to '{}'",
                full_name(new),
                users,
                full_name(old)
            );
            warn!("{}", message);
            report(reports, ReportType::Warning, message);
        }
    }

    /// Deletes the replaced IDs nothing uses anymore, then the libraries left without data.
    fn relocate_cleanup(&mut self) {
        let mut pending: Vec<IdKey> = self
            .items
            .iter()
            .filter_map(|item| item.old_id.filter(|&old| Some(old) != item.new_id))
            .collect();

        // Deleting one old ID can leave the old IDs it used without users.
        loop {
            let (unused, used): (Vec<IdKey>, Vec<IdKey>) = pending
                .into_iter()
                .filter(|&old| self.main.contains(old))
                .partition(|&old| self.main.users(old) == 0);
            if unused.is_empty() {
                break;
            }
            self.main.delete_multi(&unused);
            pending = used;
        }

        // Data that cannot be linked by name (shape keys...) comes along with the data using it.
        let orphans: Vec<IdKey> = self
            .main
            .ids()
            .filter(|(_, id)| {
                id.is_linked() && !id.code.is_linkable() && id.tag.contains(IdTag::PRE_EXISTING)
            })
            .map(|(key, _)| key)
            .filter(|&key| self.main.users(key) == 0)
            .collect();
        self.main.delete_multi(&orphans);

        self.main.remove_unused_libraries();
    }

    /// Overrides of relocated data are valid again when their reference was found.
    fn relocate_liboverrides(&mut self) {
        let found: Vec<IdKey> = self
            .main
            .ids()
            .filter(|(_, id)| !id.is_linked() && id.tag.contains(IdTag::PRE_EXISTING))
            .filter(|(_, id)| {
                id.override_library
                    .as_ref()
                    .and_then(|o| self.main.id(o.reference))
                    .map_or(false, |reference| !reference.tag.contains(IdTag::MISSING))
            })
            .map(|(key, _)| key)
            .collect();

        for key in found {
            if let Some(id) = self.main.id_mut(key) {
                id.tag.remove(IdTag::MISSING);
            }
        }
    }
}

/// `Mesh.002` becomes `Mesh~002`, any other name gets `~000` appended.
fn kept_name(name: &str) -> String {
    match name.rfind('.') {
        Some(dot)
            if dot + 1 < name.len() && name[dot + 1..].bytes().all(|b| b.is_ascii_digit()) =>
        {
            format!("{}~{}", &name[..dot], &name[dot + 1..])
        }
        _ => format!("{}~000", name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        document::{Id, Main},
        idtype::IdCode,
        link_append::LinkAppendParams,
        writer::LibraryWriter,
    };
    use std::path::Path;

    fn write_library(path: &Path, material: &str) {
        let mut writer = LibraryWriter::new();
        let red = writer.add(IdCode::Material, material);
        let mesh = writer.add(IdCode::Mesh, "CubeMesh");
        writer.add_reference(mesh, red);
        writer.write(path).expect("write library");
    }

    /// Links `CubeMesh` from `path` and gives it a local user.
    fn linked_document(path: &Path) -> (Main, IdKey, IdKey) {
        let mut main = Main::new();
        let mesh = {
            let mut context =
                LinkAppendContext::new(LinkAppendParams::new(&mut main, LinkFlags::LINK))
                    .expect("context");
            context.library_add(path.to_string_lossy(), None).expect("library");
            let item = context.item_add("CubeMesh", IdCode::Mesh, ()).expect("item");
            context.link(None).expect("link");
            context.finalize().expect("finalize");
            context.item_newid_get(item).expect("linked")
        };
        let object = main.add_id(Id::new(IdCode::Object, "Cube"));
        main.add_reference(object, mesh);
        (main, mesh, object)
    }

    #[test]
    fn kept_names() {
        assert_eq!(kept_name("Mesh.002"), "Mesh~002");
        assert_eq!(kept_name("Mesh"), "Mesh~000");
        assert_eq!(kept_name("v1.5a"), "v1.5a~000");
    }

    #[test]
    fn relocates_to_new_path() {
        let dir = tempfile::tempdir().expect("temp dir");
        let old_path = dir.path().join("old.blend");
        let new_path = dir.path().join("new.blend");
        write_library(&old_path, "Red");
        write_library(&new_path, "Red");

        let (mut main, old_mesh, object) = linked_document(&old_path);
        let old_library = main.id(old_mesh).and_then(|id| id.lib).expect("linked");

        let params = LinkAppendParams::new(&mut main, LinkFlags::LINK);
        let mut context = LinkAppendContext::<()>::new(params).expect("context");
        context.library_add(new_path.to_string_lossy(), None).expect("library");
        let outcome = context
            .library_relocate(old_library, false, None)
            .expect("relocate");
        assert!(outcome.is_complete());
        context.finalize().expect("finalize");
        context.free();

        let new_mesh = main.id(object).map(|id| id.references[0]).expect("object");
        assert_ne!(new_mesh, old_mesh);
        assert!(main.id(old_mesh).is_none());
        let paths: Vec<_> = main.libraries().map(|(_, l)| l.filepath_abs.clone()).collect();
        assert_eq!(paths, vec![new_path]);
        assert_eq!(main.ids().filter(|(_, id)| id.code == IdCode::Material).count(), 1);
    }

    #[test]
    fn reload_uses_placeholders_for_missing_data() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("lib.blend");
        write_library(&path, "Red");

        let (mut main, old_mesh, object) = linked_document(&path);
        let library = main.id(old_mesh).and_then(|id| id.lib).expect("linked");
        if let Some(id) = main.id_mut(old_mesh) {
            id.flag.insert(IdFlag::FAKEUSER);
        }

        // The material is renamed on disk, the mesh now uses the renamed one.
        write_library(&path, "Blue");

        let params = LinkAppendParams::new(&mut main, LinkFlags::LINK);
        let mut context = LinkAppendContext::<()>::new(params).expect("context");
        context.library_add(path.to_string_lossy(), None).expect("library");
        let mut reports = ReportList::new();
        let outcome = context
            .library_relocate(library, true, Some(&mut reports))
            .expect("reload");
        assert!(outcome.is_complete());
        context.finalize().expect("finalize");
        context.free();

        let new_mesh = main.id(object).map(|id| id.references[0]).expect("object");
        assert!(main.id(new_mesh).map_or(false, |id| id.has_fake_user()));
        let names: Vec<_> = main
            .ids()
            .filter(|(_, id)| id.code == IdCode::Material)
            .map(|(_, id)| (id.name.clone(), id.tag.contains(IdTag::MISSING)))
            .collect();
        assert_eq!(names, vec![("Blue".to_string(), false), ("Red".to_string(), true)]);
        assert!(reports.is_empty());
    }

    #[test]
    fn relocates_single_id() {
        let dir = tempfile::tempdir().expect("temp dir");
        let old_path = dir.path().join("old.blend");
        let new_path = dir.path().join("new.blend");
        write_library(&old_path, "Red");
        write_library(&new_path, "Red");

        let (mut main, old_mesh, object) = linked_document(&old_path);
        let params = LinkAppendParams::new(&mut main, LinkFlags::LINK);
        let mut context = LinkAppendContext::<()>::new(params).expect("context");
        context.library_add(new_path.to_string_lossy(), None).expect("library");
        let outcome = context.id_relocate(old_mesh, None).expect("relocate");
        let new_mesh = outcome.resolved().next().map(|(_, id)| id).expect("relocated");
        context.finalize().expect("finalize");
        context.free();

        assert_eq!(main.id(object).map(|id| id.references.clone()), Some(vec![new_mesh]));
        assert!(main.id(old_mesh).is_none());
        assert!(main.ids().all(|(_, id)| !id.tag.contains(IdTag::PRE_EXISTING)));
    }
}
