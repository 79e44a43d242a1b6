//! Turning cell source into name sets.
//!
//! The scheduler never looks at source text itself. It hands the text to a
//! [`NameExtractor`] and works with the returned [`NameSets`]. Any language
//! can be plugged in; [`RustCellExtractor`] covers notebooks whose cells are
//! Rust items.

use std::collections::BTreeSet;

use syn::visit::Visit;
use syn::{
    FnArg, ItemConst, ItemEnum, ItemFn, ItemMod, ItemStatic, ItemStruct, ItemTrait, ItemType,
    ItemUse, Pat, UseTree,
};

use super::types::{Name, NameSets};
use crate::error::{Error, Result};

/// Produces the names a cell reads and writes from its source.
pub trait NameExtractor: Send + Sync {
    fn extract(&self, source: &str) -> Result<NameSets>;
}

impl<F> NameExtractor for F
where
    F: Fn(&str) -> Result<NameSets> + Send + Sync,
{
    fn extract(&self, source: &str) -> Result<NameSets> {
        self(source)
    }
}

/// Extractor for cells written as Rust items.
///
/// A cell function reads the outputs named by its parameters and defines its
/// own name:
///
/// ```
/// use tessera_core::graph::{NameExtractor, RustCellExtractor};
///
/// let names = RustCellExtractor::new()
///     .extract("fn doubled(base: &i32) -> i32 { base * 2 }")
///     .unwrap();
/// assert!(names.refs.contains("base"));
/// assert!(names.defs.contains("doubled"));
/// ```
///
/// Constants, statics, type definitions, modules, traits and `use` imports
/// define their names as well. Locals inside function bodies are never
/// global.
#[derive(Debug, Clone)]
pub struct RustCellExtractor {
    private_prefix: String,
}

impl RustCellExtractor {
    pub fn new() -> Self {
        Self::with_private_prefix("_")
    }

    pub fn with_private_prefix(prefix: impl Into<String>) -> Self {
        Self {
            private_prefix: prefix.into(),
        }
    }
}

impl Default for RustCellExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl NameExtractor for RustCellExtractor {
    fn extract(&self, source: &str) -> Result<NameSets> {
        let file: syn::File = syn::parse_str(source).map_err(|e| {
            let start: proc_macro2::LineColumn = e.span().start();
            Error::Parse {
                message: e.to_string(),
                line: (start.line > 0).then_some(start.line),
            }
        })?;

        let mut collector = NameCollector::default();
        collector.visit_file(&file);

        let mut names = NameSets::default();
        for raw in collector.defs {
            let name = Name::new(raw)?;
            if name.is_private(&self.private_prefix) {
                names.private_defs.insert(name);
            } else {
                names.defs.insert(name);
            }
        }
        for raw in collector.refs {
            names.refs.insert(Name::new(raw)?);
        }
        names.normalize(&self.private_prefix);
        Ok(names)
    }
}

/// Walks top-level items only; nothing inside a body is global.
#[derive(Default)]
struct NameCollector {
    defs: BTreeSet<String>,
    refs: BTreeSet<String>,
}

impl NameCollector {
    fn collect_use_tree(&mut self, tree: &UseTree) {
        match tree {
            UseTree::Path(path) => self.collect_use_tree(&path.tree),
            UseTree::Name(name) if name.ident != "self" => {
                self.defs.insert(name.ident.to_string());
            }
            UseTree::Rename(rename) => {
                self.defs.insert(rename.rename.to_string());
            }
            UseTree::Group(group) => {
                for item in &group.items {
                    self.collect_use_tree(item);
                }
            }
            // Glob imports bring in names we cannot see
            _ => {}
        }
    }
}

impl<'ast> Visit<'ast> for NameCollector {
    fn visit_item_fn(&mut self, func: &'ast ItemFn) {
        self.defs.insert(func.sig.ident.to_string());
        for arg in &func.sig.inputs {
            if let FnArg::Typed(pat_type) = arg
                && let Pat::Ident(ident) = &*pat_type.pat
            {
                self.refs.insert(ident.ident.to_string());
            }
        }
    }

    fn visit_item_const(&mut self, item: &'ast ItemConst) {
        if item.ident != "_" {
            self.defs.insert(item.ident.to_string());
        }
    }

    fn visit_item_static(&mut self, item: &'ast ItemStatic) {
        self.defs.insert(item.ident.to_string());
    }

    fn visit_item_struct(&mut self, item: &'ast ItemStruct) {
        self.defs.insert(item.ident.to_string());
    }

    fn visit_item_enum(&mut self, item: &'ast ItemEnum) {
        self.defs.insert(item.ident.to_string());
    }

    fn visit_item_type(&mut self, item: &'ast ItemType) {
        self.defs.insert(item.ident.to_string());
    }

    fn visit_item_trait(&mut self, item: &'ast ItemTrait) {
        self.defs.insert(item.ident.to_string());
    }

    fn visit_item_mod(&mut self, item: &'ast ItemMod) {
        self.defs.insert(item.ident.to_string());
    }

    fn visit_item_use(&mut self, item: &'ast ItemUse) {
        self.collect_use_tree(&item.tree);
    }
}
