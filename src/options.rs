//! Per-call options of `Scheduler::run_parallel`.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

type Compare<O> = Arc<dyn Fn(&O, &O) -> Ordering + Send + Sync>;

/// Which post-merge sort a task applies.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SortKind {
    None,
    Ascending,
    Descending,
    AscendingByKey,
    DescendingByKey,
}

/// A sort applied to the merged output, once every span has landed.
///
/// Items that can't be compared (`NaN`s for example) are considered equal.
pub struct Sort<O> {
    kind: SortKind,
    compare: Option<Compare<O>>,
}

impl<O> Sort<O> {
    pub fn none() -> Self {
        Sort { kind: SortKind::None, compare: None }
    }

    pub fn kind(&self) -> SortKind { self.kind }

    pub(crate) fn apply(&self, items: &mut [O]) {
        if let Some(compare) = &self.compare {
            profiling::scope!("sort output");
            items.sort_by(|a, b| compare(a, b));
        }
    }
}

impl<O: 'static> Sort<O> {
    pub fn ascending_by_key<K, F>(key: F) -> Self
    where
        K: PartialOrd + 'static,
        F: Fn(&O) -> K + Send + Sync + 'static,
    {
        Sort {
            kind: SortKind::AscendingByKey,
            compare: Some(Arc::new(move |a: &O, b: &O| partial(&key(a), &key(b)))),
        }
    }

    pub fn descending_by_key<K, F>(key: F) -> Self
    where
        K: PartialOrd + 'static,
        F: Fn(&O) -> K + Send + Sync + 'static,
    {
        Sort {
            kind: SortKind::DescendingByKey,
            compare: Some(Arc::new(move |a: &O, b: &O| partial(&key(b), &key(a)))),
        }
    }
}

impl<O: PartialOrd + 'static> Sort<O> {
    pub fn ascending() -> Self {
        Sort {
            kind: SortKind::Ascending,
            compare: Some(Arc::new(|a: &O, b: &O| partial(a, b))),
        }
    }

    pub fn descending() -> Self {
        Sort {
            kind: SortKind::Descending,
            compare: Some(Arc::new(|a: &O, b: &O| partial(b, a))),
        }
    }
}

fn partial<K: PartialOrd>(a: &K, b: &K) -> Ordering {
    a.partial_cmp(b).unwrap_or(Ordering::Equal)
}

impl<O> Default for Sort<O> {
    fn default() -> Self { Sort::none() }
}

impl<O> Clone for Sort<O> {
    fn clone(&self) -> Self {
        Sort { kind: self.kind, compare: self.compare.clone() }
    }
}

impl<O> fmt::Debug for Sort<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sort({:?})", self.kind)
    }
}

/// Options of a parallel operation.
#[derive(Clone, Debug)]
pub struct Options<O> {
    pub(crate) threads: usize,
    pub(crate) sort: Sort<O>,
    pub(crate) aggregate: bool,
}

impl<O> Options<O> {
    pub fn new() -> Self {
        Options {
            threads: 1,
            sort: Sort::none(),
            aggregate: false,
        }
    }

    /// The number of spans to split the input into.
    ///
    /// Zero is treated as one. Values above the input length are clamped to it.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;

        self
    }

    pub fn with_sort(mut self, sort: Sort<O>) -> Self {
        self.sort = sort;

        self
    }

    /// Concatenate each span's result in span order instead of requiring one output
    /// item per input item.
    ///
    /// Typically used when each span reduces its items to a single value.
    pub fn with_aggregate(mut self, aggregate: bool) -> Self {
        self.aggregate = aggregate;

        self
    }

    pub fn threads(&self) -> usize { self.threads }

    pub fn sort(&self) -> &Sort<O> { &self.sort }

    pub fn aggregate(&self) -> bool { self.aggregate }
}

impl<O> Default for Options<O> {
    fn default() -> Self { Options::new() }
}

#[test]
fn sort_orders() {
    let mut items = vec![3.0, 1.0, 2.0, 0.5];
    Sort::ascending().apply(&mut items);
    assert_eq!(items, vec![0.5, 1.0, 2.0, 3.0]);

    let mut items = vec![3, 1, 2];
    Sort::descending().apply(&mut items);
    assert_eq!(items, vec![3, 2, 1]);

    let mut words = vec!["pear", "fig", "banana"];
    Sort::ascending_by_key(|w: &&str| w.len()).apply(&mut words);
    assert_eq!(words, vec!["fig", "pear", "banana"]);

    let mut words = vec!["pear", "fig", "banana"];
    Sort::descending_by_key(|w: &&str| w.to_string()).apply(&mut words);
    assert_eq!(words, vec!["pear", "fig", "banana"]);

    let mut untouched = vec![2, 1];
    Sort::none().apply(&mut untouched);
    assert_eq!(untouched, vec![2, 1]);
}

#[test]
fn option_defaults() {
    let options: Options<u32> = Options::default();
    assert_eq!(options.threads(), 1);
    assert_eq!(options.sort().kind(), SortKind::None);
    assert!(!options.aggregate());

    let options = options.with_threads(4).with_aggregate(true).with_sort(Sort::ascending());
    assert_eq!(options.threads(), 4);
    assert_eq!(options.sort().kind(), SortKind::Ascending);
    assert!(options.aggregate());
}
