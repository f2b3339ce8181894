use super::{LinkAppendContext, LinkFlags, OverrideFlags, PassOutcome, Stage};
use crate::{
    document::{IdKey, IdTag},
    error::{Error, Result},
    report::ReportList,
};
use std::collections::HashMap;
use tracing::debug;

impl<'m, U> LinkAppendContext<'m, U> {
    /// Creates a local liboverride of the linked ID of every item.
    ///
    /// With `USE_EXISTING_LIBOVERRIDES` an existing local override of the same linked ID is
    /// returned instead, so running the pass again gives the same overrides. Without it an item
    /// that already has an override keeps it.
    pub fn liboverride(
        &mut self,
        flags: OverrideFlags,
        _reports: Option<&mut ReportList>,
    ) -> Result<PassOutcome> {
        match self.stage {
            Stage::Linked | Stage::Overridden => {}
            _ => {
                return Err(Error::InvalidStage {
                    operation: "liboverride",
                    stage: self.stage().as_str(),
                })
            }
        }
        if !self.flags.contains(LinkFlags::LINK) {
            return Err(Error::InvalidArgument(
                "liboverrides can only be created from linked data".to_string(),
            ));
        }
        self.stage = Stage::Overridden;

        let set_runtime = flags.contains(OverrideFlags::CREATE_RUNTIME);
        let existing = if flags.contains(OverrideFlags::USE_EXISTING_LIBOVERRIDES) {
            Some(self.existing_overrides(set_runtime))
        } else {
            None
        };

        for index in 0..self.items.len() {
            let reference = match self.items[index].new_id {
                Some(id) => id,
                None => continue,
            };
            if let Some(existing) = &existing {
                self.items[index].liboverride_id = existing.get(&reference).copied();
            }
            if self.items[index].liboverride_id.is_some() {
                continue;
            }

            let created = self.main.override_create(reference);
            let extra = self.id_tag_extra;
            if let Some(id) = created.and_then(|key| self.main.id_mut(key)) {
                id.tag.insert(IdTag::NEW | extra);
                if set_runtime {
                    id.tag.insert(IdTag::RUNTIME);
                }
            }
            if set_runtime {
                // Only used through a runtime override from now on.
                if let Some(id) = self.main.id_mut(reference) {
                    if !id.tag.contains(IdTag::PRE_EXISTING) {
                        id.tag.remove(IdTag::EXTERN);
                        id.tag.insert(IdTag::INDIRECT);
                    }
                }
            }
            debug!(name = %self.items[index].name, override_id = ?created, "created liboverride");
            self.items[index].liboverride_id = created;
        }

        self.main.clear_newid();

        Ok(self.outcome(|handle, item| {
            item.liboverride_id
                .ok_or_else(|| self.link_failure(handle, item))
        }))
    }

    /// First local override of each linked ID, only counting overrides whose runtime state matches
    /// `runtime`.
    fn existing_overrides(&self, runtime: bool) -> HashMap<IdKey, IdKey> {
        let mut found = HashMap::new();
        for (key, id) in self.main.ids() {
            if id.is_linked() || id.tag.contains(IdTag::RUNTIME) != runtime {
                continue;
            }
            if let Some(o) = &id.override_library {
                found.entry(o.reference).or_insert(key);
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        document::Main, idtype::IdCode, link_append::LinkAppendParams, writer::LibraryWriter,
    };

    fn library() -> tempfile::NamedTempFile {
        let mut writer = LibraryWriter::new();
        let mesh = writer.add(IdCode::Mesh, "CubeMesh");
        let object = writer.add(IdCode::Object, "Cube");
        writer.add_reference(object, mesh);

        let file = tempfile::NamedTempFile::new().expect("temp file");
        writer.write(file.path()).expect("write library");
        file
    }

    #[test]
    fn second_pass_reuses_overrides() {
        let file = library();
        let mut main = Main::new();
        let mut context = LinkAppendContext::new(LinkAppendParams::new(&mut main, LinkFlags::LINK))
            .expect("context");
        context.library_add(file.path().to_string_lossy(), None).expect("library");
        let cube = context.item_add("Cube", IdCode::Object, ()).expect("item");
        context.link(None).expect("link");

        let flags = OverrideFlags::USE_EXISTING_LIBOVERRIDES;
        let first = context.liboverride(flags, None).expect("override");
        let second = context.liboverride(flags, None).expect("override again");
        assert!(first.get(cube).map_or(false, |r| r.is_ok()));
        assert_eq!(first.get(cube), second.get(cube));

        let overrides = context.main().ids().filter(|(_, id)| id.is_override()).count();
        assert_eq!(overrides, 1);
    }

    #[test]
    fn runtime_override_makes_reference_indirect() {
        let file = library();
        let mut main = Main::new();
        let mut context = LinkAppendContext::new(LinkAppendParams::new(&mut main, LinkFlags::LINK))
            .expect("context");
        context.library_add(file.path().to_string_lossy(), None).expect("library");
        let cube = context.item_add("Cube", IdCode::Object, ()).expect("item");
        context.link(None).expect("link");
        context
            .liboverride(OverrideFlags::CREATE_RUNTIME, None)
            .expect("override");

        let linked = context.item_newid_get(cube).expect("linked");
        let over = context.item_liboverrideid_get(cube).expect("overridden");
        let main = context.main();
        assert!(main.id(over).map_or(false, |id| id.tag.contains(IdTag::RUNTIME)));
        assert!(main.id(linked).map_or(false, |id| id.tag.contains(IdTag::INDIRECT)));
        assert!(main.id(linked).map_or(false, |id| !id.tag.contains(IdTag::EXTERN)));
    }

    #[test]
    fn requires_linked_data() {
        let mut main = Main::new();
        let mut context: LinkAppendContext<()> =
            LinkAppendContext::new(LinkAppendParams::new(&mut main, LinkFlags::empty()))
                .expect("context");
        assert!(matches!(
            context.liboverride(OverrideFlags::empty(), None),
            Err(Error::InvalidStage { .. })
        ));
        context.link(None).expect("link");
        assert!(matches!(
            context.liboverride(OverrideFlags::empty(), None),
            Err(Error::InvalidArgument(_))
        ));
    }
}
