use crossbeam::atomic::AtomicCell;

pub trait Counter {
    type Output;

    fn get_and_increment(self) -> Self::Output;
}

impl Counter for &mut u64 {
    type Output = u64;

    fn get_and_increment(self) -> Self::Output {
        let current = *self;
        *self = u64::checked_add(current, 1).expect("attempt to add with overflow");
        current
    }
}

impl<T: Copy + Eq> Counter for &AtomicCell<T>
where
    for<'b> &'b mut T: Counter<Output = T>,
{
    type Output = T;

    fn get_and_increment(self) -> Self::Output {
        let mut old_value = self.load();

        loop {
            let mut new_value = old_value;
            new_value.get_and_increment();

            match self.compare_exchange(old_value, new_value) {
                Ok(_) => return old_value,
                Err(v) => old_value = v,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_counters() {
        let mut value = 5u64;
        assert_eq!(value.get_and_increment(), 5);
        assert_eq!(value, 6);

        let cell = AtomicCell::new(1u64);
        assert_eq!(cell.get_and_increment(), 1);
        assert_eq!(cell.get_and_increment(), 2);
        assert_eq!(cell.load(), 3);
    }
}
