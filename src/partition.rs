//! Splitting an input into contiguous spans.
//!
//! Only index math happens here. The items themselves are read by the worker when
//! the span is executed.

use std::ops::Range;

use crate::error::Error;

/// A half-open range of indices into the input sequence.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    #[inline]
    pub fn new(start: usize, end: usize) -> Self {
        debug_assert!(start <= end, "{}..{}", start, end);
        Span { start, end }
    }

    #[inline]
    pub fn len(&self) -> usize { self.end - self.start }

    #[inline]
    pub fn is_empty(&self) -> bool { self.start == self.end }

    #[inline]
    pub fn range(&self) -> Range<usize> { self.start..self.end }
}

/// The number of spans `partition` will actually produce.
///
/// A request for zero spans or an empty input yields a single span, and there are
/// never more spans than items.
pub fn effective_span_count(length: usize, threads: usize) -> usize {
    if threads == 0 || length == 0 {
        return 1;
    }

    threads.min(length)
}

/// Split `length` items into contiguous spans as evenly as possible.
///
/// The first `length % n` spans get one extra item, so no two spans differ by more
/// than one item. Degenerate requests are normalized (see `effective_span_count`).
pub fn partition(length: usize, threads: usize) -> Vec<Span> {
    let count = effective_span_count(length, threads);
    let base = length / count;
    let extra = length % count;

    let mut spans = Vec::with_capacity(count);
    let mut start = 0;
    for i in 0..count {
        let len = base + if i < extra { 1 } else { 0 };
        spans.push(Span::new(start, start + len));
        start += len;
    }

    debug_assert_eq!(start, length);

    spans
}

/// Like `partition`, but refuses requests that would need normalizing.
pub fn try_partition(length: usize, threads: usize) -> Result<Vec<Span>, Error> {
    if threads == 0 || (length > 0 && threads > length) {
        return Err(Error::Partition { length, threads });
    }

    Ok(partition(length, threads))
}

#[cfg(test)]
fn check_coverage(length: usize, spans: &[Span]) {
    assert!(!spans.is_empty());
    assert_eq!(spans[0].start, 0);
    assert_eq!(spans.last().unwrap().end, length);
    for pair in spans.windows(2) {
        assert_eq!(pair[0].end, pair[1].start);
    }

    let total: usize = spans.iter().map(Span::len).sum();
    assert_eq!(total, length);

    let min = spans.iter().map(Span::len).min().unwrap();
    let max = spans.iter().map(Span::len).max().unwrap();
    assert!(max - min <= 1, "{:?}", spans);
}

#[test]
fn partition_coverage() {
    for length in 0..64 {
        for threads in 1..17 {
            let spans = partition(length, threads);
            check_coverage(length, &spans);
            assert_eq!(spans.len(), effective_span_count(length, threads));
        }
    }
}

#[test]
fn partition_remainder_goes_first() {
    assert_eq!(
        partition(10, 3),
        vec![Span::new(0, 4), Span::new(4, 7), Span::new(7, 10)],
    );
    assert_eq!(
        partition(9, 3),
        vec![Span::new(0, 3), Span::new(3, 6), Span::new(6, 9)],
    );
}

#[test]
fn partition_degenerate() {
    assert_eq!(partition(0, 4), vec![Span::new(0, 0)]);
    assert_eq!(partition(7, 0), vec![Span::new(0, 7)]);
    assert_eq!(partition(2, 5), vec![Span::new(0, 1), Span::new(1, 2)]);

    assert!(matches!(try_partition(7, 0), Err(Error::Partition { length: 7, threads: 0 })));
    assert!(matches!(try_partition(2, 5), Err(Error::Partition { .. })));
    assert_eq!(try_partition(0, 3).unwrap(), vec![Span::new(0, 0)]);
    assert_eq!(try_partition(6, 2).unwrap().len(), 2);
}
