//! # blend_link - Link and append data-blocks from Blender library files
//!
//! ## Example
//!
//! ```no_run
//! use blend_link::{
//!     document::Main,
//!     idtype::IdCode,
//!     link_append::{LinkAppendContext, LinkAppendParams, LinkFlags},
//!     report::ReportList,
//! };
//!
//! /// Links the "Cube" object of a library and prints what could not be found
//! fn main() -> blend_link::error::Result<()> {
//!     let mut main = Main::new();
//!     let mut reports = ReportList::new();
//!
//!     let params = LinkAppendParams::new(&mut main, LinkFlags::LINK);
//!     let mut context = LinkAppendContext::new(params)?;
//!     context.library_add("props.blend", None)?;
//!     let cube = context.item_add("Cube", IdCode::Object, ())?;
//!
//!     let outcome = context.link(Some(&mut reports))?;
//!     println!("Cube linked as {:?}", outcome.get(cube));
//!     context.finalize()?;
//!
//!     for report in reports.iter() {
//!         println!("{}", report);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## The .blend file
//!
//! A .blend file is a dump of Blender's memory: a header, a list of blocks holding C-like structs,
//! and a description of those structs (the SDNA) stored in the file itself. Data that can be shared
//! between files, like objects, meshes and materials, is stored as ID data-blocks. Every ID starts
//! with an `ID` struct holding its name, prefixed with the two letter code of its type (`OBCube`,
//! `MECubeMesh`). IDs point to each other, an object points to its mesh which points to its
//! materials.
//!
//! A file whose data is used by another file is a library. Its data can be used in three ways:
//!
//! - linked: the data stays in the library and is read again every time the document is opened,
//! - appended: the data is copied into the document and becomes local,
//! - overridden: the data stays linked but a local liboverride on top of it can be edited.
//!
//! ## This crate
//!
//! The `parsers` and `runtime` modules read the container and the structs of a library file,
//! `handle` turns that into an index of the ID data-blocks it holds. `document` is the destination
//! document the data is loaded into: an arena of IDs and libraries addressed by stable keys.
//!
//! `link_append` holds the `LinkAppendContext`. A context is driven through a fixed protocol:
//! register libraries, register the data-blocks you want (items), run `link`, then optionally
//! `append` or `liboverride`, read the results and `finalize`. Every pass returns a `PassOutcome`
//! with the result of each item and writes human readable diagnostics to an optional `ReportList`.
//! Items that cannot be found never abort a pass. The context is also used to relocate or reload
//! the data of a library whose file moved or changed.
//!
//! `loader` wraps all of that for the common case of loading named data-blocks out of one file.
//!
//! ### Writing libraries
//!
//! `writer::LibraryWriter` writes small but valid library files: data-blocks, the references
//! between them, asset marks and liboverride references. It is meant for fixtures and for library
//! buffers embedded in an executable, it cannot save a whole document.
//!
//! ### Supported versions
//!
//! As the .blend file is self-describing, files from any Blender version can be read, both 32 and
//! 64 bit, little and big endian, plain or gzip-compressed. Linking from files saved before 2.50
//! produces a warning.
//!
//! ### Logging
//!
//! The crate emits `tracing` events: `debug` for the decisions taken for every data-block, `warn`
//! for data-blocks that could not be linked, `error` for inconsistent data. Install any `tracing`
//! subscriber to see them.

pub mod document;
pub mod error;
pub mod handle;
pub mod idtype;
pub mod link_append;
pub mod loader;
pub mod parsers;
pub mod report;
pub mod runtime;
pub mod writer;

pub use document::{IdKey, LibraryKey, Main};
pub use error::{Error, ResolveError, Result};
pub use handle::BlendHandle;
pub use idtype::{IdCode, IdFilter};
pub use link_append::{
    ItemHandle, LinkAppendContext, LinkAppendParams, LinkFlags, OverrideFlags, PassOutcome,
};
pub use loader::{LibraryLoader, LoadOptions, LoadRequest};
pub use report::{ReportList, ReportType};
