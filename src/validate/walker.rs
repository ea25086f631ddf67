//! Structural walk over a validated module binary.
//!
//! Collects the surfaces the policy cares about: imports, the subset of
//! imported functions actually called, exports, data-segment literals, and
//! declared memory demand.

use wasmparser::{ExternalKind, Operator, Parser, Payload, TypeRef};

pub(crate) const WASM_PAGE_BYTES: u64 = 65_536;

const MIN_LITERAL_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ImportKind {
    Func,
    Memory,
    Table,
    Global,
}

impl ImportKind {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            ImportKind::Func => "func",
            ImportKind::Memory => "memory",
            ImportKind::Table => "table",
            ImportKind::Global => "global",
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ImportedItem {
    pub module: String,
    pub field: String,
    pub kind: ImportKind,
}

#[derive(Debug, Clone)]
pub(crate) struct ExportedItem {
    pub name: String,
    pub kind: &'static str,
}

/// Everything the validator needs to know about one module.
#[derive(Debug, Default)]
pub(crate) struct ModuleSurface {
    pub imports: Vec<ImportedItem>,
    /// Qualified `module.field` names of imported functions with at least
    /// one direct call site, in first-call order.
    pub called: Vec<String>,
    pub exports: Vec<ExportedItem>,
    /// Printable runs extracted from data segments.
    pub literals: Vec<String>,
    /// Largest initial memory demand declared or imported, in bytes.
    pub min_memory_bytes: u64,
}

/// Walk a binary that already passed `wasmparser::validate`.
pub(crate) fn walk(binary: &[u8]) -> Result<ModuleSurface, String> {
    let mut surface = ModuleSurface::default();
    let mut imported_funcs: Vec<String> = Vec::new();

    for payload in Parser::new(0).parse_all(binary) {
        match payload.map_err(|e| e.to_string())? {
            Payload::ImportSection(reader) => {
                for import in reader {
                    let import = import.map_err(|e| e.to_string())?;
                    let kind = match import.ty {
                        TypeRef::Func(_) => {
                            imported_funcs.push(format!("{}.{}", import.module, import.name));
                            ImportKind::Func
                        }
                        TypeRef::Memory(mem) => {
                            let bytes = mem.initial.saturating_mul(WASM_PAGE_BYTES);
                            surface.min_memory_bytes = surface.min_memory_bytes.max(bytes);
                            ImportKind::Memory
                        }
                        TypeRef::Table(_) => ImportKind::Table,
                        TypeRef::Global(_) | TypeRef::Tag(_) => ImportKind::Global,
                    };
                    surface.imports.push(ImportedItem {
                        module: import.module.to_string(),
                        field: import.name.to_string(),
                        kind,
                    });
                }
            }
            Payload::MemorySection(reader) => {
                for memory in reader {
                    let memory = memory.map_err(|e| e.to_string())?;
                    let bytes = memory.initial.saturating_mul(WASM_PAGE_BYTES);
                    surface.min_memory_bytes = surface.min_memory_bytes.max(bytes);
                }
            }
            Payload::ExportSection(reader) => {
                for export in reader {
                    let export = export.map_err(|e| e.to_string())?;
                    surface.exports.push(ExportedItem {
                        name: export.name.to_string(),
                        kind: external_kind_str(export.kind),
                    });
                }
            }
            Payload::CodeSectionEntry(body) => {
                let mut operators = body.get_operators_reader().map_err(|e| e.to_string())?;
                while !operators.eof() {
                    let function_index = match operators.read().map_err(|e| e.to_string())? {
                        Operator::Call { function_index } => function_index,
                        Operator::ReturnCall { function_index } => function_index,
                        _ => continue,
                    };
                    if let Some(name) = imported_funcs.get(function_index as usize) {
                        if !surface.called.iter().any(|c| c == name) {
                            surface.called.push(name.clone());
                        }
                    }
                }
            }
            Payload::DataSection(reader) => {
                for segment in reader {
                    let segment = segment.map_err(|e| e.to_string())?;
                    collect_literals(segment.data, &mut surface.literals);
                }
            }
            _ => {}
        }
    }

    Ok(surface)
}

/// Initial memory demand of a validated binary, in bytes. Zero when the
/// binary declares no memory or fails to parse.
pub(crate) fn declared_memory_bytes(binary: &[u8]) -> u64 {
    walk(binary).map(|s| s.min_memory_bytes).unwrap_or(0)
}

fn external_kind_str(kind: ExternalKind) -> &'static str {
    match kind {
        ExternalKind::Func => "func",
        ExternalKind::Table => "table",
        ExternalKind::Memory => "memory",
        ExternalKind::Global => "global",
        ExternalKind::Tag => "tag",
    }
}

/// Extract printable ASCII runs of useful length from raw segment bytes.
fn collect_literals(data: &[u8], out: &mut Vec<String>) {
    let mut run = Vec::new();
    for &byte in data.iter().chain(std::iter::once(&0u8)) {
        if (0x20..=0x7e).contains(&byte) {
            run.push(byte);
            continue;
        }
        if run.len() >= MIN_LITERAL_LEN {
            out.push(String::from_utf8_lossy(&run).into_owned());
        }
        run.clear();
    }
}
