//! Record combining over sorted runs.
//!
//! A combiner sees one group of comparator-equal records at a time and may
//! emit any number of replacement records. Grouping only works on sorted
//! input; on unsorted input groups are simply shorter.

use std::cmp::Ordering;
use std::sync::Arc;

use super::{RawComparator, RawRecordSink, RawRecordSource};
use crate::error::Result;

pub trait Combiner: Send + Sync {
    fn combine(&self, group: &[&[u8]], emit: &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()>;
}

/// Combiner backed by a closure.
pub struct FnCombiner<F>(F);

impl<F> FnCombiner<F>
where
    F: Fn(&[&[u8]], &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> Combiner for FnCombiner<F>
where
    F: Fn(&[&[u8]], &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()> + Send + Sync,
{
    fn combine(&self, group: &[&[u8]], emit: &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()> {
        (self.0)(group, emit)
    }
}

// ── Group Buffer ───────────────────────────────────────────────────

/// Flat storage for a run of records.
#[derive(Default)]
struct GroupBuffer {
    data: Vec<u8>,
    ends: Vec<usize>,
}

impl GroupBuffer {
    fn is_empty(&self) -> bool {
        self.ends.is_empty()
    }

    fn len(&self) -> usize {
        self.ends.len()
    }

    fn push(&mut self, record: &[u8]) {
        self.data.extend_from_slice(record);
        self.ends.push(self.data.len());
    }

    fn get(&self, i: usize) -> &[u8] {
        let start = if i == 0 { 0 } else { self.ends[i - 1] };
        &self.data[start..self.ends[i]]
    }

    fn slices(&self) -> Vec<&[u8]> {
        (0..self.len()).map(|i| self.get(i)).collect()
    }

    fn clear(&mut self) {
        self.data.clear();
        self.ends.clear();
    }
}

// ── Push-side Combining ────────────────────────────────────────────

/// Sink adapter: groups sorted records and forwards the combiner's output.
pub struct CombiningSink<'a> {
    comparator: &'a dyn RawComparator,
    combiner: &'a dyn Combiner,
    inner: &'a mut dyn RawRecordSink,
    group: GroupBuffer,
    emitted: u64,
}

impl<'a> CombiningSink<'a> {
    pub fn new(
        comparator: &'a dyn RawComparator,
        combiner: &'a dyn Combiner,
        inner: &'a mut dyn RawRecordSink,
    ) -> Self {
        Self {
            comparator,
            combiner,
            inner,
            group: GroupBuffer::default(),
            emitted: 0,
        }
    }

    /// Flush the last group. Returns the number of records emitted.
    pub fn finish(mut self) -> Result<u64> {
        self.flush_group()?;
        Ok(self.emitted)
    }

    fn flush_group(&mut self) -> Result<()> {
        if self.group.is_empty() {
            return Ok(());
        }
        let inner = &mut *self.inner;
        let emitted = &mut self.emitted;
        let slices = self.group.slices();
        self.combiner.combine(&slices, &mut |record| {
            *emitted += 1;
            inner.write_record(record)
        })?;
        drop(slices);
        self.group.clear();
        Ok(())
    }
}

impl RawRecordSink for CombiningSink<'_> {
    fn write_record(&mut self, record: &[u8]) -> Result<()> {
        if !self.group.is_empty()
            && self.comparator.compare(self.group.get(0), record) != Ordering::Equal
        {
            self.flush_group()?;
        }
        self.group.push(record);
        Ok(())
    }
}

/// Run `combiner` over every group of a sorted source.
pub fn combine_sorted(
    source: &mut dyn RawRecordSource,
    comparator: &dyn RawComparator,
    combiner: &dyn Combiner,
    sink: &mut dyn RawRecordSink,
) -> Result<u64> {
    let mut combining = CombiningSink::new(comparator, combiner, sink);
    while let Some(record) = source.next_record()? {
        combining.write_record(record)?;
    }
    combining.finish()
}

// ── Pull-side Combining ────────────────────────────────────────────

/// Source adapter: yields the combiner's output for each group of `inner`.
pub struct CombiningSource<S> {
    inner: S,
    comparator: Arc<dyn RawComparator>,
    combiner: Arc<dyn Combiner>,
    group: GroupBuffer,
    next_group: GroupBuffer,
    output: GroupBuffer,
    output_pos: usize,
    exhausted: bool,
}

impl<S: RawRecordSource> CombiningSource<S> {
    pub fn new(inner: S, comparator: Arc<dyn RawComparator>, combiner: Arc<dyn Combiner>) -> Self {
        Self {
            inner,
            comparator,
            combiner,
            group: GroupBuffer::default(),
            next_group: GroupBuffer::default(),
            output: GroupBuffer::default(),
            output_pos: 0,
            exhausted: false,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    fn fill_group(&mut self) -> Result<()> {
        while !self.exhausted {
            match self.inner.next_record()? {
                None => self.exhausted = true,
                Some(record) => {
                    if self.group.is_empty()
                        || self.comparator.compare(self.group.get(0), record) == Ordering::Equal
                    {
                        self.group.push(record);
                    } else {
                        self.next_group.push(record);
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }
}

impl<S: RawRecordSource> RawRecordSource for CombiningSource<S> {
    fn next_record(&mut self) -> Result<Option<&[u8]>> {
        loop {
            if self.output_pos < self.output.len() {
                self.output_pos += 1;
                return Ok(Some(self.output.get(self.output_pos - 1)));
            }
            self.output.clear();
            self.output_pos = 0;

            self.fill_group()?;
            if self.group.is_empty() {
                return Ok(None);
            }
            let output = &mut self.output;
            let slices = self.group.slices();
            self.combiner.combine(&slices, &mut |record| {
                output.push(record);
                Ok(())
            })?;
            drop(slices);
            self.group.clear();
            std::mem::swap(&mut self.group, &mut self.next_group);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{collect_records, KeyPrefixComparator, VecRecordSource};

    // ── Test Helpers ──

    /// Records are `[key: 1 byte][count: u32 LE]`; combining sums counts.
    fn summing() -> Arc<dyn Combiner> {
        Arc::new(FnCombiner::new(|group: &[&[u8]], emit: &mut dyn FnMut(&[u8]) -> Result<()>| {
            let total: u32 = group
                .iter()
                .map(|r| u32::from_le_bytes([r[1], r[2], r[3], r[4]]))
                .sum();
            let mut out = vec![group[0][0]];
            out.extend_from_slice(&total.to_le_bytes());
            emit(&out)
        }))
    }

    fn rec(key: u8, count: u32) -> Vec<u8> {
        let mut r = vec![key];
        r.extend_from_slice(&count.to_le_bytes());
        r
    }

    #[test]
    fn test_combine_sorted_sums_groups() {
        let mut source = VecRecordSource::new(vec![rec(1, 2), rec(1, 3), rec(2, 7), rec(3, 1), rec(3, 1)]);
        let mut out: Vec<Vec<u8>> = Vec::new();
        let emitted = combine_sorted(&mut source, &KeyPrefixComparator::new(1), summing().as_ref(), &mut out).unwrap();
        assert_eq!(emitted, 3);
        assert_eq!(out, vec![rec(1, 5), rec(2, 7), rec(3, 2)]);
    }

    #[test]
    fn test_combining_source_matches_sink() {
        let input = vec![rec(1, 1), rec(1, 1), rec(1, 1), rec(4, 9), rec(5, 0), rec(5, 5)];
        let mut source = CombiningSource::new(
            VecRecordSource::new(input),
            Arc::new(KeyPrefixComparator::new(1)),
            summing(),
        );
        let out = collect_records(&mut source).unwrap();
        assert_eq!(out, vec![rec(1, 3), rec(4, 9), rec(5, 5)]);
    }

    #[test]
    fn test_combiner_may_drop_groups() {
        let drop_odd = FnCombiner::new(|group: &[&[u8]], emit: &mut dyn FnMut(&[u8]) -> Result<()>| {
            if group[0][0] % 2 == 0 {
                emit(group[0])?;
            }
            Ok(())
        });
        let mut source = CombiningSource::new(
            VecRecordSource::new(vec![rec(1, 0), rec(2, 0), rec(3, 0), rec(3, 0)]),
            Arc::new(KeyPrefixComparator::new(1)),
            Arc::new(drop_odd),
        );
        assert_eq!(collect_records(&mut source).unwrap(), vec![rec(2, 0)]);
    }

    #[test]
    fn test_empty_source() {
        let mut source = CombiningSource::new(
            VecRecordSource::new(Vec::new()),
            Arc::new(KeyPrefixComparator::new(1)),
            summing(),
        );
        assert!(source.next_record().unwrap().is_none());
    }
}
