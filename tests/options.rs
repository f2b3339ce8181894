mod common;

use blend_link::{
    document::{IdTag, Main},
    error::Error,
    idtype::IdCode,
    link_append::LinkFlags,
    loader::{LibraryLoader, LoadOptions, LoadRequest, Loaded},
};
use common::{cube_library, Fixtures};

#[test]
fn options_load_from_toml() {
    let options: LoadOptions = toml::from_str(
        r#"
        link = true
        create_liboverrides = true
        reuse_liboverrides = true
        "#,
    )
    .expect("valid options");

    assert!(options.link);
    assert!(!options.relative);
    assert!(options.validate().is_ok());
    assert_eq!(options.link_flags(), LinkFlags::LINK);

    let empty: LoadOptions = toml::from_str("").expect("defaults");
    assert_eq!(empty, LoadOptions::default());
}

#[test]
fn invalid_options_are_refused_before_opening() {
    let options: LoadOptions = toml::from_str("create_liboverrides = true").expect("parses");
    let result = LibraryLoader::open("does-not-matter.blend", options);
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
}

#[test]
fn appends_requested_names() {
    let fixtures = Fixtures::new();
    let path = fixtures.write("lib.blend", &cube_library());
    let loader = LibraryLoader::open(&path, LoadOptions::default()).expect("open");

    let mut request = LoadRequest::new();
    request.add(IdCode::Mesh, "Plane").add(IdCode::Object, "Cube");
    assert_eq!(request.len(), 2);

    let mut main = Main::new();
    let result = loader.load(&mut main, &request).expect("load");

    let codes: Vec<IdCode> = result.ids.keys().copied().collect();
    assert_eq!(codes, vec![IdCode::Mesh, IdCode::Object]);
    assert!(result.reports.is_empty());
    for loaded in result.ids.values().flatten() {
        let id = loaded.id().expect("found");
        let id = main.id(id).expect("in document");
        assert!(!id.is_linked());
        assert!(id.tag.contains(IdTag::TEMP_MAIN));
    }
}

#[test]
fn creates_liboverrides_once() {
    let fixtures = Fixtures::new();
    let path = fixtures.write("lib.blend", &cube_library());
    let options = LoadOptions {
        link: true,
        create_liboverrides: true,
        reuse_liboverrides: true,
        ..LoadOptions::default()
    };

    let mut main = Main::new();
    let mut request = LoadRequest::new();
    request.add(IdCode::Object, "Cube");

    let first = LibraryLoader::open(&path, options)
        .and_then(|loader| loader.load(&mut main, &request))
        .expect("first load");
    let second = LibraryLoader::open(&path, options)
        .and_then(|loader| loader.load(&mut main, &request))
        .expect("second load");

    let first = first.get(IdCode::Object)[0].clone();
    assert!(matches!(first, Loaded::Found(_)));
    assert_eq!(second.get(IdCode::Object)[0], first);
}
