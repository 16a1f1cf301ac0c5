//! Demangler helpers for exported symbol names.
//!
//! Rust (legacy and v0), C++ Itanium and MSVC names are recognised. Plain C
//! names are left alone.

use once_cell::sync::Lazy;
use regex::Regex;

static RE_ITA_MANGLED: Lazy<Regex> = Lazy::new(|| {
    // Itanium (GCC/Clang) ABI: _Z...
    Regex::new(r"^_Z[a-zA-Z0-9_][a-zA-Z0-9_.$]*$").expect("valid itanium mangled regex")
});

static RE_MSVC_MANGLED: Lazy<Regex> = Lazy::new(|| {
    // MSVC: ?name@@... or ??0...
    Regex::new(r"^\?\??[A-Za-z0-9_@\$\?]+@@[A-Za-z0-9_@\$\?]*$").expect("valid msvc mangled regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolFlavor {
    Rust,
    Itanium,
    Msvc,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemangleResult {
    pub original: String,
    pub demangled: String,
    pub flavor: SymbolFlavor,
}

pub fn detect_flavor(s: &str) -> SymbolFlavor {
    if rustc_demangle::try_demangle(s).is_ok() {
        return SymbolFlavor::Rust;
    }
    if RE_ITA_MANGLED.is_match(s) {
        return SymbolFlavor::Itanium;
    }
    if RE_MSVC_MANGLED.is_match(s) {
        return SymbolFlavor::Msvc;
    }
    SymbolFlavor::Unknown
}

/// Attempt to demangle a single symbol. Returns None when not recognized.
pub fn demangle_one(s: &str) -> Option<DemangleResult> {
    let result = |demangled: String, flavor| DemangleResult {
        original: s.to_string(),
        demangled,
        flavor,
    };
    match detect_flavor(s) {
        SymbolFlavor::Rust => rustc_demangle::try_demangle(s)
            .ok()
            .map(|dm| result(format!("{:#}", dm), SymbolFlavor::Rust)),
        SymbolFlavor::Itanium => cpp_demangle::Symbol::new(s)
            .ok()
            .map(|sym| result(sym.to_string(), SymbolFlavor::Itanium)),
        SymbolFlavor::Msvc => {
            msvc_demangler::demangle(s, msvc_demangler::DemangleFlags::COMPLETE)
                .ok()
                .map(|out| result(out, SymbolFlavor::Msvc))
        }
        SymbolFlavor::Unknown => None,
    }
}
