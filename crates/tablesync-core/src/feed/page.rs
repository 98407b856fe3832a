//! Window selection over a sorted key list.
//!
//! The feed materializes the keys of a pinned snapshot in ascending order and
//! asks for the window a boundary selects. Everything here is index
//! arithmetic, so the same keys and boundary always give the same window.
use std::ops::Range;

/// Where a page starts or ends.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Boundary<K> {
    /// Keys strictly after the given key; `None` starts at the beginning.
    After(Option<K>),
    /// The last keys strictly before the given key; `None` ends at the end.
    Before(Option<K>),
}

/// A selected page and the boundaries of its neighbours.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Window<K> {
    /// Index range of the page into the key list.
    pub range: Range<usize>,
    /// Boundary that selects this page again, in the direction it was read.
    pub refetch: Boundary<K>,
    /// Backward boundary that selects the page before this one.
    pub backward: Boundary<K>,
    /// Forward boundary that selects the page after this one.
    pub resume: Boundary<K>,
    /// Keys exist after the page.
    pub has_more: bool,
    /// Keys exist before the page.
    pub has_prior: bool,
}

/// Select the window `boundary` names, at most `limit` keys long.
///
/// `keys` must be sorted ascending without duplicates and `limit` must be at
/// least 1.
pub(crate) fn select<K: Ord + Clone>(
    keys: &[K],
    boundary: &Boundary<K>,
    limit: usize,
) -> Window<K> {
    let n = keys.len();
    let limit = limit.max(1);
    let range = match boundary {
        Boundary::After(None) => 0..limit.min(n),
        Boundary::After(Some(b)) => {
            let start = keys.partition_point(|k| k <= b);
            start..start.saturating_add(limit).min(n)
        }
        Boundary::Before(None) => n.saturating_sub(limit)..n,
        Boundary::Before(Some(b)) => {
            let end = keys.partition_point(|k| k < b);
            end.saturating_sub(limit)..end
        }
    };

    let (start, end) = (range.start, range.end);
    let refetch = match boundary {
        // A backward page may be short at the head, so it is re-read from its end.
        Boundary::Before(_) => Boundary::Before(keys.get(end).cloned()),
        Boundary::After(_) => Boundary::After(start.checked_sub(1).map(|i| keys[i].clone())),
    };
    Window {
        refetch,
        backward: Boundary::Before(keys.get(start).cloned()),
        resume: Boundary::After(end.checked_sub(1).map(|i| keys[i].clone())),
        has_more: end < n,
        has_prior: start > 0,
        range,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> Vec<u32> {
        (1..=10).collect()
    }

    fn page(keys: &[u32], w: &Window<u32>) -> Vec<u32> {
        keys[w.range.clone()].to_vec()
    }

    #[test]
    fn forward_paging_walks_the_whole_list() {
        let keys = keys();
        let mut boundary = Boundary::After(None);
        let mut seen = Vec::new();
        loop {
            let w = select(&keys, &boundary, 4);
            seen.extend(page(&keys, &w));
            if !w.has_more {
                break;
            }
            boundary = w.resume;
        }
        assert_eq!(seen, keys);
    }

    #[test]
    fn refetch_reproduces_the_page() {
        let keys = keys();
        let first = select(&keys, &Boundary::After(None), 4);
        let second = select(&keys, &first.resume, 4);
        assert_eq!(page(&keys, &second), vec![5, 6, 7, 8]);
        assert!(second.has_prior && second.has_more);

        let again = select(&keys, &second.refetch, 4);
        assert_eq!(again.range, second.range);
    }

    #[test]
    fn backward_returns_the_preceding_rows_ascending() {
        let keys = keys();
        let w = select(&keys, &Boundary::After(Some(6)), 3);
        assert_eq!(page(&keys, &w), vec![7, 8, 9]);

        let back = select(&keys, &w.backward, 3);
        assert_eq!(page(&keys, &back), vec![4, 5, 6]);

        let last = select(&keys, &Boundary::Before(None), 3);
        assert_eq!(page(&keys, &last), vec![8, 9, 10]);
        assert!(!last.has_more);

        let head = select(&keys, &Boundary::Before(Some(3)), 5);
        assert_eq!(page(&keys, &head), vec![1, 2]);
        assert!(!head.has_prior);
    }

    #[test]
    fn short_backward_pages_refetch_exactly() {
        let keys = keys();
        let head = select(&keys, &Boundary::Before(Some(3)), 5);
        assert_eq!(page(&keys, &head), vec![1, 2]);
        let again = select(&keys, &head.refetch, 5);
        assert_eq!(again.range, head.range);

        let short: Vec<u32> = vec![1, 2];
        let last = select(&short, &Boundary::Before(None), 5);
        assert_eq!(page(&short, &last), vec![1, 2]);
        assert_eq!(select(&short, &last.refetch, 5).range, last.range);

        let back = select(&keys, &Boundary::Before(Some(8)), 3);
        assert_eq!(page(&keys, &back), vec![5, 6, 7]);
        assert_eq!(select(&keys, &back.refetch, 3).range, back.range);
    }

    #[test]
    fn empty_pages_keep_usable_boundaries() {
        let keys = keys();
        let w = select(&keys, &Boundary::After(Some(10)), 3);
        assert!(w.range.is_empty());
        assert!(!w.has_more);
        assert!(w.has_prior);
        assert_eq!(w.resume, Boundary::After(Some(10)));
        assert_eq!(w.backward, Boundary::Before(None));

        let none: Vec<u32> = Vec::new();
        let w = select(&none, &Boundary::After(None), 3);
        assert!(w.range.is_empty() && !w.has_more && !w.has_prior);
        assert_eq!(w.resume, Boundary::After(None));
    }

    #[test]
    fn boundaries_between_keys_are_honored() {
        let keys = vec![10, 20, 30];
        let w = select(&keys, &Boundary::After(Some(15)), 5);
        assert_eq!(page(&keys, &w), vec![20, 30]);
        let w = select(&keys, &Boundary::Before(Some(25)), 5);
        assert_eq!(page(&keys, &w), vec![10, 20]);
    }
}
