//! Executable format support.

/// PE/COFF image model, directories and the import editor
pub mod pe;
