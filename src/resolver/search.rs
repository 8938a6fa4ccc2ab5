//! Search list handling.
//!
//! The libc resolver appends configured postfix domains to short names
//! before looking them up. Whether a name counts as short is decided by the
//! ndots option: names with at least that many dots are first tried as
//! given, everything else starts with the first postfix. This module keeps
//! the configured list and walks a query through the candidate names.

use std::sync::Arc;
use crate::base::name::count_dots;

//------------ SearchState ---------------------------------------------------

/// The configured search list and ndots threshold.
///
/// The state is immutable once built; the resolver swaps in a new value
/// when the configuration changes and every in-progress query keeps the
/// snapshot it started with behind an [`Arc`].
#[derive(Clone, Debug)]
pub struct SearchState {
    /// Number of dots from which a name is tried verbatim first.
    pub ndots: u32,

    /// The postfix domains, in the order they are tried.
    pub domains: Vec<Box<str>>,
}

impl SearchState {
    pub fn new() -> Self {
        SearchState {
            ndots: 1,
            domains: Vec::new(),
        }
    }

    /// Appends the postfix with the given index to `base`.
    pub fn join(&self, index: usize, base: &str) -> String {
        let postfix = &self.domains[index];
        if base.ends_with('.') {
            format!("{}{}", base, postfix)
        } else {
            format!("{}.{}", base, postfix)
        }
    }
}

impl Default for SearchState {
    fn default() -> Self {
        Self::new()
    }
}

//------------ SearchContext -------------------------------------------------

/// The search progress carried by one request.
#[derive(Debug)]
pub struct SearchContext {
    /// The search configuration this query runs under.
    pub state: Arc<SearchState>,

    /// The name the user actually asked for.
    pub origname: String,

    /// Index of the postfix tried last; -1 for the verbatim name.
    pub index: isize,
}

/// What to try after a candidate name did not exist.
#[derive(Debug, Eq, PartialEq)]
pub enum SearchStep {
    /// Try this name; the search continues afterwards.
    Next(String),

    /// Try the original name as given; this is the final candidate.
    Raw(String),

    /// All candidates are exhausted.
    Done,
}

impl SearchContext {
    /// Starts a search for `name`, returning the first candidate.
    ///
    /// Callers must only invoke this with a non-empty search list.
    pub fn start(state: Arc<SearchState>, name: &str) -> (String, Self) {
        debug_assert!(!state.domains.is_empty());
        let (first, index) = if count_dots(name) >= state.ndots as usize {
            (name.to_owned(), -1)
        } else {
            (state.join(0, name), 0)
        };
        let ctx = SearchContext {
            state,
            origname: name.to_owned(),
            index,
        };
        (first, ctx)
    }

    /// Advances to the next candidate name.
    pub fn advance(&mut self) -> SearchStep {
        self.index += 1;
        let index = self.index as usize;
        if index < self.state.domains.len() {
            SearchStep::Next(self.state.join(index, &self.origname))
        } else if count_dots(&self.origname) < self.state.ndots as usize {
            SearchStep::Raw(self.origname.clone())
        } else {
            SearchStep::Done
        }
    }
}

//============ Testing =======================================================
