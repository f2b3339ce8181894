mod common;

use blend_link::{
    document::{IdTag, Main},
    error::{Error, ResolveError},
    idtype::{IdCode, IdFilter},
    link_append::{
        ForeachItemFlags, ItemFilter, LinkAppendContext, LinkAppendParams, LinkFlags, Stage,
        EMBEDDED_STARTUP_BLEND,
    },
    report::{ReportList, ReportType},
    writer::LibraryWriter,
};
use common::{cube_library, Fixtures};

fn link_context(main: &mut Main) -> LinkAppendContext<'_, &'static str> {
    LinkAppendContext::new(LinkAppendParams::new(main, LinkFlags::LINK)).expect("context")
}

#[test]
fn duplicate_library_names_get_increasing_indices() {
    let mut main = Main::new();
    let mut context = link_context(&mut main);

    let indices: Vec<usize> = (0..3)
        .map(|_| context.library_add("same.blend", None).expect("library"))
        .collect();
    assert_eq!(indices, vec![0, 1, 2]);
    assert_eq!(context.library_count(), 3);
}

#[test]
fn empty_context_drops_cleanly() {
    let mut main = Main::new();
    {
        let context = link_context(&mut main);
        assert_eq!(context.stage(), Stage::Created);
        assert!(context.is_empty());
    }
    assert!(main.is_empty());
    assert!(!main.is_locked());
}

#[test]
fn links_found_items_and_warns_once_for_missing() {
    let fixtures = Fixtures::new();
    let path = fixtures.write("lib.blend", &cube_library());
    let mut main = Main::new();
    let mut reports = ReportList::new();

    let mut context = link_context(&mut main);
    context.library_add(path.as_str(), None).expect("library");
    let cube = context.item_add("CubeMesh", IdCode::Mesh, "cube").expect("item");
    let missing = context.item_add("MissingMesh", IdCode::Mesh, "missing").expect("item");
    assert_eq!(context.stage(), Stage::Populated);

    let outcome = context.link(Some(&mut reports)).expect("link");
    assert!(context.item_newid_get(cube).is_some());
    assert!(context.item_newid_get(missing).is_none());
    assert_eq!(
        outcome.get(missing),
        Some(&Err(ResolveError::NotFound {
            name: "MissingMesh".to_string(),
            code: IdCode::Mesh
        }))
    );
    assert_eq!(context.item_userdata_get(missing), Some(&"missing"));

    let warnings: Vec<_> = reports.of_kind(ReportType::Warning).collect();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].message.contains("MissingMesh"));
    context.finalize().expect("finalize");
    context.free();

    // The material comes along with the mesh, indirectly.
    let red = main.ids().find(|(_, id)| id.code == IdCode::Material).map(|(_, id)| id.clone());
    let red = red.expect("material linked");
    assert!(red.is_linked());
    assert_eq!(red.tag, IdTag::INDIRECT);
}

#[test]
fn newid_is_none_exactly_for_reported_items() {
    let fixtures = Fixtures::new();
    let path = fixtures.write("lib.blend", &cube_library());
    let mut main = Main::new();
    let mut reports = ReportList::new();

    let mut context = link_context(&mut main);
    context.library_add(path.as_str(), None).expect("library");
    let names = ["Cube", "Nope", "CubeMesh", "Plane", "Other"];
    let codes = [IdCode::Object, IdCode::Object, IdCode::Mesh, IdCode::Mesh, IdCode::Material];
    for (name, code) in names.iter().zip(codes.iter()) {
        context.item_add(name, *code, *name).expect("item");
    }
    context.link(Some(&mut reports)).expect("link");

    context.item_foreach(ForeachItemFlags::DO_DIRECT, |handle, item| {
        let reported = reports.iter().any(|r| r.message.contains(&format!("'{}'", item.name())));
        assert_eq!(context.item_newid_get(handle).is_none(), reported, "{}", item.name());
        true
    });
}

#[test]
fn enabled_libraries_narrow_resolution() {
    let fixtures = Fixtures::new();
    let mut first = LibraryWriter::new();
    first.add(IdCode::Mesh, "Shared");
    let mut second = LibraryWriter::new();
    second.add(IdCode::Mesh, "Shared");
    let first = fixtures.write("first.blend", &first);
    let second = fixtures.write("second.blend", &second);

    let mut main = Main::new();
    let mut context = link_context(&mut main);
    context.library_add(first.as_str(), None).expect("library");
    let index = context.library_add(second.as_str(), None).expect("library");
    let narrowed = context.item_add("Shared", IdCode::Mesh, "narrowed").expect("item");
    context.item_library_index_enable(narrowed, index).expect("enable");
    let any = context.item_add("Shared", IdCode::Mesh, "any").expect("item");
    context.link(None).expect("link");

    let library_of = |handle| {
        let id = context.item_newid_get(handle).expect("linked");
        let lib = context.main().id(id).and_then(|id| id.lib).expect("linked data");
        context.main().library(lib).map(|l| l.filepath.clone()).expect("library")
    };
    assert_eq!(library_of(narrowed), second);
    assert_eq!(library_of(any), first);
}

#[test]
fn unreadable_library_is_reported() {
    let fixtures = Fixtures::new();
    let path = fixtures.path("missing.blend");
    let mut main = Main::new();
    let mut reports = ReportList::new();

    let mut context = link_context(&mut main);
    context.library_add(path.to_string_lossy(), None).expect("library");
    let cube = context.item_add("Cube", IdCode::Object, "cube").expect("item");
    let outcome = context.link(Some(&mut reports)).expect("link");

    assert_eq!(outcome.get(cube), Some(&Err(ResolveError::LibraryUnavailable)));
    assert_eq!(reports.of_kind(ReportType::Error).count(), 1);
    assert_eq!(reports.of_kind(ReportType::Warning).count(), 1);
}

#[test]
fn non_linkable_types_are_rejected_per_item() {
    let fixtures = Fixtures::new();
    let path = fixtures.write("lib.blend", &cube_library());
    let mut main = Main::new();

    let mut context = link_context(&mut main);
    context.library_add(path.as_str(), None).expect("library");
    let screen = context.item_add("Layout", IdCode::Screen, "screen").expect("item");
    let cube = context.item_add("Cube", IdCode::Object, "cube").expect("item");
    let outcome = context.link(None).expect("link");

    assert_eq!(outcome.get(screen), Some(&Err(ResolveError::NotLinkable(IdCode::Screen))));
    assert!(outcome.get(cube).map_or(false, |r| r.is_ok()));
    assert!(!outcome.is_complete());
}

#[test]
fn already_linked_data_is_reused() {
    let fixtures = Fixtures::new();
    let path = fixtures.write("lib.blend", &cube_library());
    let mut main = Main::new();

    let mut ids = Vec::new();
    for _ in 0..2 {
        let mut context = link_context(&mut main);
        context.library_add(path.as_str(), None).expect("library");
        let item = context.item_add("CubeMesh", IdCode::Mesh, "mesh").expect("item");
        context.link(None).expect("link");
        ids.push(context.item_newid_get(item).expect("linked"));
        context.finalize().expect("finalize");
    }
    assert_eq!(ids[0], ids[1]);
    assert_eq!(main.libraries().count(), 1);
}

#[test]
fn indirect_data_becomes_direct_when_requested() {
    let fixtures = Fixtures::new();
    let path = fixtures.write("lib.blend", &cube_library());
    let mut main = Main::new();

    let mut context = link_context(&mut main);
    context.library_add(path.as_str(), None).expect("library");
    context.item_add("Cube", IdCode::Object, "cube").expect("item");
    let red = context.item_add("Red", IdCode::Material, "red").expect("item");
    context.link(None).expect("link");

    let red = context.item_newid_get(red).expect("linked");
    let tag = context.main().id(red).map(|id| id.tag).expect("material");
    assert!(tag.contains(IdTag::EXTERN));
    assert!(!tag.contains(IdTag::INDIRECT));
}

#[test]
fn placeholders_stand_in_for_missing_data() {
    let fixtures = Fixtures::new();
    let path = fixtures.write("lib.blend", &cube_library());
    let mut main = Main::new();
    let mut reports = ReportList::new();

    let flags = LinkFlags::LINK | LinkFlags::USE_PLACEHOLDERS;
    let mut context = LinkAppendContext::new(LinkAppendParams::new(&mut main, flags))
        .expect("context");
    context.library_add(path.as_str(), None).expect("library");
    let ghost = context.item_add("Ghost", IdCode::Mesh, ()).expect("item");
    context.link(Some(&mut reports)).expect("link");

    let ghost = context.item_newid_get(ghost).expect("placeholder");
    let tag = context.main().id(ghost).map(|id| id.tag).expect("placeholder");
    assert!(tag.contains(IdTag::MISSING | IdTag::EXTERN));
    assert!(reports.is_empty());
}

#[test]
fn extra_tag_marks_created_data() {
    let fixtures = Fixtures::new();
    let path = fixtures.write("lib.blend", &cube_library());
    let mut main = Main::new();

    let mut params = LinkAppendParams::new(&mut main, LinkFlags::LINK);
    params.id_tag_extra = IdTag::TEMP_MAIN;
    let mut context = LinkAppendContext::new(params).expect("context");
    context.library_add(path.as_str(), None).expect("library");
    context.item_add("Cube", IdCode::Object, ()).expect("item");
    context.link(None).expect("link");

    let tagged = context.main().ids().filter(|(_, id)| id.tag.contains(IdTag::TEMP_MAIN)).count();
    assert_eq!(tagged, 3);
}

#[test]
fn registers_whole_library_by_type() {
    let fixtures = Fixtures::new();
    let path = fixtures.write("lib.blend", &cube_library());
    let mut main = Main::new();

    let mut context: LinkAppendContext<()> =
        LinkAppendContext::new(LinkAppendParams::new(&mut main, LinkFlags::LINK)).expect("context");
    let index = context.library_add(path.as_str(), None).expect("library");
    let added = context
        .item_idtypes_from_library_add(None, IdFilter::ME | IdFilter::MA, index)
        .expect("register");
    assert_eq!(added, 3);
    let meshes: Vec<_> = context
        .items(ItemFilter::code(IdCode::Mesh))
        .map(|(_, i)| i.name().to_string())
        .collect();
    assert_eq!(meshes, vec!["CubeMesh".to_string(), "Plane".to_string()]);

    let all = context
        .item_idtypes_from_library_add(None, IdFilter::empty(), index)
        .expect("register");
    assert_eq!(all, 4);

    let outcome = context.link(None).expect("link");
    assert_eq!(outcome.len(), 7);
    assert!(outcome.is_complete());
}

#[test]
fn assets_only_skips_plain_data() {
    let fixtures = Fixtures::new();
    let path = fixtures.write("lib.blend", &cube_library());
    let mut main = Main::new();

    let flags = LinkFlags::LINK | LinkFlags::ASSETS_ONLY;
    let mut context: LinkAppendContext<()> =
        LinkAppendContext::new(LinkAppendParams::new(&mut main, flags)).expect("context");
    let index = context.library_add(path.as_str(), None).expect("library");
    let added = context
        .item_idtypes_from_library_add(None, IdFilter::empty(), index)
        .expect("register");
    assert_eq!(added, 1);
}

#[test]
fn links_from_embedded_buffer() {
    let mut main = Main::new();
    let mut context = link_context(&mut main);
    context
        .embedded_blendfile_set(cube_library().to_bytes())
        .expect("embedded");
    assert!(matches!(
        context.embedded_blendfile_set(Vec::<u8>::new()),
        Err(Error::EmbeddedBlendfileAlreadySet)
    ));

    context.library_add(EMBEDDED_STARTUP_BLEND, None).expect("library");
    let cube = context.item_add("Cube", IdCode::Object, "cube").expect("item");
    let outcome = context.link(None).expect("link");
    assert!(outcome.get(cube).map_or(false, |r| r.is_ok()));
}

#[test]
fn links_from_gzip_library_and_warns_about_old_files() {
    let fixtures = Fixtures::new();
    let mut writer = cube_library();
    writer.version(249);

    let mut encoder = libflate::gzip::Encoder::new(Vec::new()).expect("encoder");
    std::io::Write::write_all(&mut encoder, &writer.to_bytes()).expect("compress");
    let compressed = encoder.finish().into_result().expect("compress");
    let path = fixtures.path("old.blend");
    std::fs::write(&path, compressed).expect("write");

    let mut main = Main::new();
    let mut reports = ReportList::new();
    let mut context = link_context(&mut main);
    context.library_add(path.to_string_lossy(), None).expect("library");
    let cube = context.item_add("Cube", IdCode::Object, "cube").expect("item");
    context.link(Some(&mut reports)).expect("link");

    assert!(context.item_newid_get(cube).is_some());
    let warnings: Vec<_> = reports.of_kind(ReportType::Warning).collect();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].message.contains("very old"));
}

#[test]
fn relative_library_paths() {
    let fixtures = Fixtures::new();
    let path = fixtures.write("lib.blend", &cube_library());
    let mut main = Main::with_filepath(fixtures.path("scene.blend"));

    let flags = LinkFlags::LINK | LinkFlags::RELATIVE_PATH;
    let mut context: LinkAppendContext<()> =
        LinkAppendContext::new(LinkAppendParams::new(&mut main, flags)).expect("context");
    context.library_add(path.as_str(), None).expect("library");
    context.item_add("Cube", IdCode::Object, ()).expect("item");
    context.link(None).expect("link");
    context.finalize().expect("finalize");
    context.free();

    let filepaths: Vec<_> = main.libraries().map(|(_, l)| l.filepath.clone()).collect();
    assert_eq!(filepaths, vec!["//lib.blend".to_string()]);
}

#[test]
fn protocol_order_is_enforced() {
    let mut main = Main::new();
    let mut context = link_context(&mut main);
    context.library_add("lib.blend", None).expect("library");
    let item = context.item_add("Cube", IdCode::Object, "cube").expect("item");

    assert!(matches!(
        context.library_add("late.blend", None),
        Err(Error::InvalidStage { .. })
    ));
    assert!(matches!(
        context.item_library_index_enable(item, 4),
        Err(Error::LibraryIndex(4))
    ));
    assert!(matches!(context.finalize(), Err(Error::InvalidStage { .. })));

    context.link(None).expect("link");
    assert!(matches!(context.link(None), Err(Error::InvalidStage { .. })));
    assert!(matches!(
        context.item_add("Other", IdCode::Object, "other"),
        Err(Error::InvalidStage { .. })
    ));
    context.finalize().expect("finalize");
    assert_eq!(context.stage(), Stage::Done);
}

#[test]
fn locked_document_is_refused() {
    let mut main = Main::new();
    main.lock();
    let result: Result<LinkAppendContext<()>, _> =
        LinkAppendContext::new(LinkAppendParams::new(&mut main, LinkFlags::LINK));
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
}

#[test]
fn embedded_buffer_can_be_cleared_and_set_again() {
    let mut main = Main::new();
    let mut context = link_context(&mut main);
    context.embedded_blendfile_clear();

    context
        .embedded_blendfile_set(cube_library().to_bytes())
        .expect("embedded");
    context.embedded_blendfile_clear();
    context.embedded_blendfile_clear();
    context
        .embedded_blendfile_set(cube_library().to_bytes())
        .expect("embedded after clear");

    context.library_add(EMBEDDED_STARTUP_BLEND, None).expect("library");
    let plane = context.item_add("Plane", IdCode::Mesh, "plane").expect("item");
    context.link(None).expect("link");
    assert!(context.item_newid_get(plane).is_some());
}

#[test]
fn missing_embedded_buffer_is_an_unavailable_library() {
    let mut main = Main::new();
    let mut reports = ReportList::new();
    let mut context = link_context(&mut main);
    let index = context.library_add(EMBEDDED_STARTUP_BLEND, None).expect("library");

    assert!(matches!(
        context.item_idtypes_from_library_add(Some(&mut reports), IdFilter::empty(), index),
        Err(Error::EmbeddedBlendfileMissing)
    ));
    assert_eq!(reports.of_kind(ReportType::Error).count(), 1);
}

#[test]
fn whole_library_registration_fails_on_unreadable_file() {
    let fixtures = Fixtures::new();
    let path = fixtures.path("missing.blend");
    let mut main = Main::new();
    let mut context = link_context(&mut main);
    let index = context.library_add(path.to_string_lossy(), None).expect("library");

    match context.item_idtypes_from_library_add(None, IdFilter::empty(), index) {
        Err(Error::LibraryOpen { path: failed, .. }) => assert_eq!(failed, path),
        other => panic!("expected a library open error, got {:?}", other),
    }
    assert!(context.is_empty());
}

#[test]
fn reconfigure_replaces_flags_before_any_pass() {
    let fixtures = Fixtures::new();
    let path = fixtures.write("lib.blend", &cube_library());
    let mut main = Main::new();

    let mut context = link_context(&mut main)
        .reconfigure(LinkFlags::APPEND_SET_FAKEUSER)
        .expect("reconfigure");
    assert_eq!(context.flags(), LinkFlags::APPEND_SET_FAKEUSER);

    context.library_add(path.as_str(), None).expect("library");
    let mesh = context.item_add("Plane", IdCode::Mesh, "plane").expect("item");
    context.link(None).expect("link");
    context.append(None).expect("append");
    let local = context.item_newid_get(mesh).expect("appended");
    assert!(context.main().id(local).map_or(false, |id| !id.is_linked()));
}

#[test]
fn reconfigure_is_refused_after_link() {
    let fixtures = Fixtures::new();
    let path = fixtures.write("lib.blend", &cube_library());
    let mut main = Main::new();

    let mut context = link_context(&mut main);
    context.library_add(path.as_str(), None).expect("library");
    context.item_add("Cube", IdCode::Object, "cube").expect("item");
    context.link(None).expect("link");

    assert!(matches!(
        context.reconfigure(LinkFlags::empty()),
        Err(Error::InvalidStage { .. })
    ));
}

#[test]
fn flag_set_toggles_single_flags() {
    let mut main = Main::new();
    let mut context = link_context(&mut main);

    context.flag_set(LinkFlags::USE_PLACEHOLDERS | LinkFlags::FORCE_INDIRECT, true);
    assert_eq!(
        context.flags(),
        LinkFlags::LINK | LinkFlags::USE_PLACEHOLDERS | LinkFlags::FORCE_INDIRECT
    );
    context.flag_set(LinkFlags::FORCE_INDIRECT, false);
    assert_eq!(context.flags(), LinkFlags::LINK | LinkFlags::USE_PLACEHOLDERS);
}

#[test]
fn newid_can_be_swapped_within_its_library() {
    let fixtures = Fixtures::new();
    let first = fixtures.write("first.blend", &cube_library());
    let second = fixtures.write("second.blend", &cube_library());
    let mut main = Main::new();

    let mut context = link_context(&mut main);
    let first_index = context.library_add(first.as_str(), None).expect("library");
    let second_index = context.library_add(second.as_str(), None).expect("library");
    let cube = context.item_add("Cube", IdCode::Object, "cube").expect("item");
    context.item_library_index_enable(cube, first_index).expect("enable");
    let plane = context.item_add("Plane", IdCode::Mesh, "plane").expect("item");
    context.item_library_index_enable(plane, second_index).expect("enable");
    context.link(None).expect("link");

    let linked_cube = context.item_newid_get(cube).expect("cube linked");
    let linked_plane = context.item_newid_get(plane).expect("plane linked");
    let first_lib = context.main().id(linked_cube).and_then(|id| id.lib);
    let cube_mesh = context
        .main()
        .find(IdCode::Mesh, "CubeMesh", first_lib)
        .expect("dependency linked");

    assert!(matches!(
        context.item_newid_set(cube, linked_plane),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(context.item_newid_get(cube), Some(linked_cube));

    context.item_newid_set(cube, cube_mesh).expect("same library");
    assert_eq!(context.item_newid_get(cube), Some(cube_mesh));
}
