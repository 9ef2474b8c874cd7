use crate::error::BatchError;

/// Split `items` into contiguous groups of `size` (the last one may be shorter).
pub fn chunk<T: Clone>(items: &[T], size: usize) -> Result<Vec<Vec<T>>, BatchError> {
    if size == 0 {
        return Err(BatchError::InvalidArgument("chunk size must be > 0"));
    }
    Ok(items.chunks(size).map(<[T]>::to_vec).collect())
}

/// Like [`chunk`], but takes ownership and moves the items instead of cloning.
pub fn into_chunks<T>(items: Vec<T>, size: usize) -> Result<Vec<Vec<T>>, BatchError> {
    if size == 0 {
        return Err(BatchError::InvalidArgument("chunk size must be > 0"));
    }
    let mut out = Vec::with_capacity(items.len().div_ceil(size));
    let mut iter = items.into_iter().peekable();
    while iter.peek().is_some() {
        out.push(iter.by_ref().take(size).collect());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_count_and_order_are_preserved() {
        for len in 0..20usize {
            let items: Vec<usize> = (0..len).collect();
            for size in 1..7usize {
                let groups = chunk(&items, size).unwrap();
                assert_eq!(groups.len(), len.div_ceil(size));
                assert!(groups.iter().all(|g| !g.is_empty() && g.len() <= size));
                assert_eq!(groups.concat(), items);

                let owned = into_chunks(items.clone(), size).unwrap();
                assert_eq!(owned, groups);
            }
        }
    }

    #[test]
    fn last_group_holds_the_remainder() {
        let groups = chunk(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10], 3).unwrap();
        assert_eq!(groups, vec![vec![1, 2, 3], vec![4, 5, 6], vec![7, 8, 9], vec![10]]);
    }

    #[test]
    fn zero_size_is_rejected() {
        assert!(matches!(
            chunk(&[1, 2, 3], 0),
            Err(BatchError::InvalidArgument(_))
        ));
        assert!(matches!(
            into_chunks(vec![1, 2, 3], 0),
            Err(BatchError::InvalidArgument(_))
        ));
    }
}
