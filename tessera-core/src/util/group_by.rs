use std::marker::PhantomData;

/// Iterator over runs of consecutive elements that map to the same key.
pub struct GroupByKey<'a, T: 'a, F, K> {
    slice: &'a [T],
    extraction: F,
    phantom: PhantomData<fn(&'a T) -> K>,
}

impl<'a, T: 'a, F, K: 'a> Iterator for GroupByKey<'a, T, F, K>
where
    F: FnMut(&T) -> K,
    K: PartialEq,
{
    type Item = (K, &'a [T]);

    fn next(&mut self) -> Option<Self::Item> {
        let slice = self.slice;
        let extraction = &mut self.extraction;
        let key = extraction(slice.first()?);
        let len = 1 + slice[1..]
            .iter()
            .take_while(|item| extraction(item) == key)
            .count();

        let (head, tail) = slice.split_at(len);
        self.slice = tail;
        Some((key, head))
    }
}

pub trait GroupByExt {
    type Item;

    /// Group consecutive elements of a slice which map to the same key.
    fn group_by_key<F, K>(&self, extraction: F) -> GroupByKey<'_, Self::Item, F, K>
    where
        F: FnMut(&Self::Item) -> K;

    /// Sorts (stable) and then groups all elements which map to the same key.
    fn sort_and_group_by_key<F, K>(&mut self, extraction: F) -> GroupByKey<'_, Self::Item, F, K>
    where
        F: FnMut(&Self::Item) -> K,
        K: Ord;
}

impl<T> GroupByExt for [T] {
    type Item = T;

    fn group_by_key<F, K>(&self, extraction: F) -> GroupByKey<'_, T, F, K>
    where
        F: FnMut(&T) -> K,
    {
        GroupByKey {
            slice: self,
            extraction,
            phantom: PhantomData,
        }
    }

    fn sort_and_group_by_key<F, K>(&mut self, mut extraction: F) -> GroupByKey<'_, T, F, K>
    where
        F: FnMut(&T) -> K,
        K: Ord,
    {
        self.sort_by_key(&mut extraction);
        self.group_by_key(extraction)
    }
}
