#![allow(dead_code)]

use blend_link::{idtype::IdCode, writer::LibraryWriter};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A directory of library files removed when dropped.
pub struct Fixtures {
    dir: TempDir,
}

impl Fixtures {
    pub fn new() -> Self {
        Fixtures {
            dir: tempfile::tempdir().expect("temp dir"),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn write(&self, name: &str, writer: &LibraryWriter) -> String {
        let path = self.path(name);
        writer.write(&path).expect("write library");
        path.to_string_lossy().into_owned()
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }
}

/// `OBCube` → `MECubeMesh` → `MARed`, plus an unused `MEPlane`.
pub fn cube_library() -> LibraryWriter {
    let mut writer = LibraryWriter::new();
    let red = writer.add(IdCode::Material, "Red");
    let mesh = writer.add(IdCode::Mesh, "CubeMesh");
    let cube = writer.add(IdCode::Object, "Cube");
    writer.add(IdCode::Mesh, "Plane");
    writer.add_reference(mesh, red);
    writer.add_reference(cube, mesh);
    writer.mark_asset(cube);
    writer
}

/// `MEOver` is a liboverride of `MEBase`.
pub fn override_library() -> LibraryWriter {
    let mut writer = LibraryWriter::new();
    let base = writer.add(IdCode::Mesh, "Base");
    let over = writer.add(IdCode::Mesh, "Over");
    writer.set_override_reference(over, base);
    writer
}
