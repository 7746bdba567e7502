//! Duplicate-aware partitioning sort.

use rayon;

use crate::record::Record;

/// Ranges at or below this length are sorted on the calling thread.
const PARALLEL_THRESHOLD: usize = 4096;
/// No new task pairs are forked past this recursion depth.
const MAX_FORK_DEPTH: usize = 8;

/// Sorts records in place into non-decreasing key order.
///
/// Large ranges recurse as parallel fork-join tasks on the current rayon
/// thread pool (run it under [`rayon::ThreadPool::install`] to choose the
/// pool), so repeated keys cost nothing extra: every partition groups all
/// pivot-equal records into one block that is never revisited.
pub fn sort(records: &mut [Record]) {
    sort_parallel(records, 0);
}

fn sort_parallel(records: &mut [Record], depth: usize) {
    if records.len() <= PARALLEL_THRESHOLD || depth >= MAX_FORK_DEPTH {
        sort_sequential(records);
        return;
    }

    let (eq_lo, eq_hi) = partition(records);
    let (lower, rest) = records.split_at_mut(eq_lo);
    let upper = &mut rest[(eq_hi - eq_lo)..];

    rayon::join(
        || sort_parallel(lower, depth + 1),
        || sort_parallel(upper, depth + 1),
    );
}

fn sort_sequential(records: &mut [Record]) {
    let mut rest = records;

    // recurse into the smaller side only, keeping stack depth logarithmic
    // even when first-element pivots degenerate on pre-sorted input
    while rest.len() > 1 {
        let (eq_lo, eq_hi) = partition(rest);
        let (lower, upper_part) = rest.split_at_mut(eq_lo);
        let upper = &mut upper_part[(eq_hi - eq_lo)..];

        if lower.len() <= upper.len() {
            sort_sequential(lower);
            rest = upper;
        } else {
            sort_sequential(upper);
            rest = lower;
        }
    }
}

/// Partitions `records` around the key of its first element.
///
/// On return the slice is arranged as `[less | equal | greater]` relative to
/// the pivot key and the half-open index range of the equal block is handed
/// back; only the outer two blocks still need sorting. Requires a non-empty
/// slice.
fn partition(records: &mut [Record]) -> (usize, usize) {
    let pivot = records[0].key;

    // two-pointer scan: walk i rightwards, pulling elements <= pivot down
    // from the right end; remember where pivot-equal elements land
    let mut equal: Vec<usize> = Vec::new();
    let mut j = records.len() - 1;
    let mut i = 1;
    while i < j {
        if records[i].key > pivot {
            while j > i && records[j].key > pivot {
                j -= 1;
            }
            if j > i {
                records.swap(i, j);
            }
        }
        if records[i].key == pivot {
            equal.push(i);
        }
        i += 1;
    }

    // records[j] is either unexamined or left over from a failed swap, so
    // it may still exceed the pivot; one step left always lands on a
    // smaller-or-equal element
    if records[j].key > pivot {
        j -= 1;
    }
    records.swap(0, j);
    let pivot_at = j;

    // the settle swap invalidates an index recorded at the pivot's slot
    if equal.last() == Some(&pivot_at) {
        equal.pop();
    }
    // and may have parked a pivot-equal element at the front instead
    let stranded = pivot_at > 0 && records[0].key == pivot;

    // pack the recorded elements into the slots just below the pivot;
    // recorded indices are strictly increasing and all below pivot_at, so
    // walking them highest-first never collides with an unmoved entry
    let mut dest = pivot_at;
    for &src in equal.iter().rev() {
        dest -= 1;
        if src != dest {
            records.swap(src, dest);
        }
    }
    if stranded {
        records.swap(0, pivot_at - equal.len() - 1);
    }

    let eq_lo = pivot_at - equal.len() - (stranded as usize);
    return (eq_lo, pivot_at + 1);
}

#[cfg(test)]
mod test {
    use rand::prelude::*;
    use rstest::*;

    use crate::record::Record;

    use super::{partition, sort};

    fn keyed(keys: &[i64]) -> Vec<Record> {
        Vec::from_iter(keys.iter().map(|&key| Record::new(key, "name", "value")))
    }

    fn ranked(records: &[Record]) -> Vec<(i64, String, String)> {
        let mut ranked =
            Vec::from_iter(records.iter().map(|r| (r.key, r.name.clone(), r.value.clone())));
        ranked.sort();
        ranked
    }

    #[rstest]
    #[case(vec![5, 1, 5, 2, 5], 2, 5)]
    #[case(vec![3, 7, 3, 1], 1, 3)]
    #[case(vec![2, 5, 2], 0, 2)]
    #[case(vec![4, 4, 4, 4], 0, 4)]
    #[case(vec![1, 2, 3, 4], 0, 1)]
    #[case(vec![9, 1], 1, 2)]
    #[case(vec![1, 9], 0, 1)]
    #[case(vec![6, 6], 0, 2)]
    fn test_partition_blocks(#[case] keys: Vec<i64>, #[case] lo: usize, #[case] hi: usize) {
        let mut records = keyed(&keys);

        let (eq_lo, eq_hi) = partition(&mut records);

        assert_eq!((eq_lo, eq_hi), (lo, hi));
        let pivot = records[eq_lo].key;
        assert!(records[..eq_lo].iter().all(|r| r.key < pivot));
        assert!(records[eq_lo..eq_hi].iter().all(|r| r.key == pivot));
        assert!(records[eq_hi..].iter().all(|r| r.key > pivot));
    }

    #[rstest]
    #[case(vec![])]
    #[case(vec![1])]
    #[case(vec![2, 1])]
    #[case(vec![5, 1, 5, 2, 5])]
    #[case(vec![3, 7, 3, 1])]
    #[case(vec![1, 2, 3, 4, 5])]
    #[case(vec![5, 4, 3, 2, 1])]
    fn test_sort_small(#[case] keys: Vec<i64>) {
        let mut records = keyed(&keys);

        sort(&mut records);

        let mut expected = keys.clone();
        expected.sort_unstable();
        assert_eq!(Vec::from_iter(records.iter().map(|r| r.key)), expected);
    }

    #[test]
    fn test_sort_all_equal_keys() {
        let mut records = Vec::from_iter((0..1000).map(|i| Record::new(42, format!("n{}", i), "v")));

        sort(&mut records);

        assert_eq!(records.len(), 1000);
        assert!(records.iter().all(|r| r.key == 42));
    }

    #[test]
    fn test_sort_is_key_ordered_permutation() {
        let mut rng = rand::thread_rng();
        let original = Vec::from_iter(
            (0..50_000).map(|i| Record::new(rng.gen_range(-1000..1000), format!("n{}", i % 7), format!("v{}", i))),
        );

        let mut records = original.clone();
        sort(&mut records);

        assert!(records.windows(2).all(|w| w[0].key <= w[1].key));
        assert_eq!(ranked(&records), ranked(&original));
    }

    #[test]
    fn test_sort_presorted_input() {
        let mut records = keyed(&Vec::from_iter(0..5000));

        sort(&mut records);

        assert_eq!(Vec::from_iter(records.iter().map(|r| r.key)), Vec::from_iter(0..5000));
    }
}
