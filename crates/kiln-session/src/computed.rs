// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Materialize compile-result diffs into a queryable session view.
// Author: Lukas Bower

//! Client-side view of the last successful compile.
//!
//! The worker ships per-module added/removed diffs keyed by interner ids;
//! this module replays them against the previous view to obtain the current
//! one, and resolves ids back to strings at query time.

use std::collections::{BTreeMap, BTreeSet};

use kiln_codec::{
    Computed, Diagnostic, ExpType, Import, ModuleDiffs, PkgDep, SpanInfo, SrcSpan, SymbolId,
    UseSite,
};

use crate::error::SessionError;
use crate::interner::StringArena;

/// An import with its names resolved out of the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImport {
    /// Imported module name.
    pub module: String,
    /// True when the import is qualified.
    pub qualified: bool,
    /// Local alias, when one was given.
    pub alias: Option<String>,
}

/// Aggregated, queryable output of the most recent successful compile.
#[derive(Debug, Clone, Default)]
pub struct ComputedState {
    diagnostics: Vec<Diagnostic>,
    loaded: Vec<String>,
    arena: StringArena,
    imports: BTreeMap<String, BTreeSet<Import>>,
    auto_completion: BTreeMap<String, BTreeSet<SymbolId>>,
    span_info: BTreeMap<String, BTreeSet<SpanInfo>>,
    pkg_deps: BTreeMap<String, BTreeSet<PkgDep>>,
    exp_types: BTreeMap<String, BTreeSet<ExpType>>,
    use_sites: BTreeMap<String, BTreeSet<UseSite>>,
}

impl ComputedState {
    /// Replay a received result against `base` (the view the diffs were
    /// computed relative to), yielding the new view.
    pub(crate) fn apply(
        base: Option<&ComputedState>,
        update: &Computed,
    ) -> Result<Self, SessionError> {
        let mut next = base.cloned().unwrap_or_default();
        next.arena.apply_delta(&update.cache)?;
        next.diagnostics = update.diagnostics.clone();
        next.loaded = update.loaded.clone();
        apply_category(&mut next.imports, &update.imports);
        apply_category(&mut next.auto_completion, &update.auto_completion);
        apply_category(&mut next.span_info, &update.span_info);
        apply_category(&mut next.pkg_deps, &update.pkg_deps);
        apply_category(&mut next.exp_types, &update.exp_types);
        apply_category(&mut next.use_sites, &update.use_sites);
        Ok(next)
    }

    pub(crate) fn prepend_other_error(&mut self, message: String) {
        self.diagnostics.insert(0, Diagnostic::other(message));
    }

    /// Errors and warnings from the compile, in emission order.
    #[must_use]
    pub fn source_errors(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Names of all successfully loaded modules.
    #[must_use]
    pub fn loaded_modules(&self) -> &[String] {
        &self.loaded
    }

    /// Imports of `module`, resolved to names.
    #[must_use]
    pub fn imports(&self, module: &str) -> Vec<ResolvedImport> {
        self.imports
            .get(module)
            .into_iter()
            .flatten()
            .filter_map(|import| {
                Some(ResolvedImport {
                    module: self.arena.resolve(import.module)?.to_owned(),
                    qualified: import.qualified,
                    alias: import
                        .alias
                        .and_then(|id| self.arena.resolve(id).map(str::to_owned)),
                })
            })
            .collect()
    }

    /// Identifiers in scope in `module`, for completion.
    #[must_use]
    pub fn auto_completion(&self, module: &str) -> Vec<String> {
        self.resolve_ids(self.auto_completion.get(module))
    }

    /// Identifier attached to each known span of `module`.
    #[must_use]
    pub fn span_info(&self, module: &str) -> Vec<(SrcSpan, String)> {
        self.span_info
            .get(module)
            .into_iter()
            .flatten()
            .filter_map(|info| {
                Some((info.span, self.arena.resolve(info.symbol)?.to_owned()))
            })
            .collect()
    }

    /// External package dependencies of `module` with optional pinned
    /// versions.
    #[must_use]
    pub fn pkg_deps(&self, module: &str) -> Vec<(String, Option<String>)> {
        self.pkg_deps
            .get(module)
            .into_iter()
            .flatten()
            .filter_map(|dep| {
                Some((
                    self.arena.resolve(dep.package)?.to_owned(),
                    dep.version
                        .and_then(|id| self.arena.resolve(id).map(str::to_owned)),
                ))
            })
            .collect()
    }

    /// Package dependencies of every loaded module, deduplicated.
    #[must_use]
    pub fn all_pkg_deps(&self) -> Vec<(String, Option<String>)> {
        let mut seen = BTreeMap::new();
        for module in self.pkg_deps.keys() {
            for (package, version) in self.pkg_deps(module) {
                seen.entry(package).or_insert(version);
            }
        }
        seen.into_iter().collect()
    }

    /// Type annotations recorded for expressions of `module`.
    #[must_use]
    pub fn exp_types(&self, module: &str) -> Vec<(SrcSpan, String)> {
        self.exp_types
            .get(module)
            .into_iter()
            .flatten()
            .filter_map(|exp| Some((exp.span, self.arena.resolve(exp.ty)?.to_owned())))
            .collect()
    }

    /// Places identifiers are referenced inside `module`.
    #[must_use]
    pub fn use_sites(&self, module: &str) -> Vec<(String, SrcSpan)> {
        self.use_sites
            .get(module)
            .into_iter()
            .flatten()
            .filter_map(|site| {
                Some((self.arena.resolve(site.symbol)?.to_owned(), site.span))
            })
            .collect()
    }

    fn resolve_ids(&self, ids: Option<&BTreeSet<SymbolId>>) -> Vec<String> {
        ids.into_iter()
            .flatten()
            .filter_map(|id| self.arena.resolve(*id).map(str::to_owned))
            .collect()
    }
}

fn apply_category<T: Ord + Clone>(
    current: &mut BTreeMap<String, BTreeSet<T>>,
    diffs: &ModuleDiffs<T>,
) {
    for (module, diff) in diffs {
        let entries = current.entry(module.clone()).or_default();
        for item in &diff.removed {
            entries.remove(item);
        }
        for item in &diff.added {
            entries.insert(item.clone());
        }
        if entries.is_empty() {
            current.remove(module);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_codec::{CacheDelta, Diff};

    fn delta_with(module: &str, imports: Diff<Import>, cache: Vec<(u32, &str)>) -> Computed {
        Computed {
            loaded: vec![module.to_owned()],
            cache: CacheDelta {
                entries: cache
                    .into_iter()
                    .map(|(id, text)| (SymbolId::from_raw(id), text.to_owned()))
                    .collect(),
            },
            imports: vec![(module.to_owned(), imports)],
            ..Computed::default()
        }
    }

    #[test]
    fn diffs_accumulate_across_results() {
        let base_import = Import {
            module: SymbolId::from_raw(0),
            qualified: false,
            alias: None,
        };
        let first = delta_with(
            "M",
            Diff {
                added: vec![base_import],
                removed: vec![],
            },
            vec![(0, "Data.List")],
        );
        let state = ComputedState::apply(None, &first).expect("first result");
        assert_eq!(state.imports("M").len(), 1);
        assert_eq!(state.imports("M")[0].module, "Data.List");

        let second_import = Import {
            module: SymbolId::from_raw(1),
            qualified: true,
            alias: None,
        };
        let second = delta_with(
            "M",
            Diff {
                added: vec![second_import],
                removed: vec![base_import],
            },
            vec![(1, "Data.Map")],
        );
        let state = ComputedState::apply(Some(&state), &second).expect("second result");
        let imports = state.imports("M");
        assert_eq!(imports.len(), 1);
        assert_eq!(imports[0].module, "Data.Map");
        assert!(imports[0].qualified);
    }

    #[test]
    fn removal_of_the_last_entry_drops_the_module() {
        let import = Import {
            module: SymbolId::from_raw(0),
            qualified: false,
            alias: None,
        };
        let first = delta_with(
            "M",
            Diff {
                added: vec![import],
                removed: vec![],
            },
            vec![(0, "Data.List")],
        );
        let state = ComputedState::apply(None, &first).expect("first result");
        let second = delta_with(
            "M",
            Diff {
                added: vec![],
                removed: vec![import],
            },
            vec![],
        );
        let state = ComputedState::apply(Some(&state), &second).expect("second result");
        assert!(state.imports("M").is_empty());
    }
}
