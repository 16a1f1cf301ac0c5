//! Export, import and relocation directory views

pub mod export;
pub mod import;
pub mod relocation;

pub use export::{ExportDirectory, ExportEntry};
pub use import::{
    AddedImport, ImportDescriptor, ImportDirectory, ImportEditor, ImportSymbol, ModuleImport,
    DEFAULT_EXTENSION_SECTION, DESCRIPTOR_AREA_PAGE, EXTENSION_FILL, EXTENSION_PAGES,
};
pub use relocation::{RelocationBlock, RelocationDirectory, RelocationEntry};
