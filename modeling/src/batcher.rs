use anyhow::Result;
use tch::Tensor;

/// Stacks items pulled from an inner iterator into batches along a new
/// leading dimension. Incomplete trailing batches are dropped unless
/// `return_last_incomplete_batch` is set.
pub struct Batcher<I> {
    inner: I,
    batch_size: usize,
    return_last_incomplete_batch: bool,
}

impl<I> Batcher<I> {
    fn new(inner: I) -> Self {
        Self {
            inner,
            batch_size: 16,
            return_last_incomplete_batch: false,
        }
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn return_last_incomplete_batch(mut self, r: bool) -> Self {
        self.return_last_incomplete_batch = r;
        self
    }
}

pub struct Iter1<I: Iterator<Item = Tensor>> {
    inner: I,
}

pub struct Iter2<I: Iterator<Item = (Tensor, Tensor)>> {
    inner: I,
}

impl<I: Iterator<Item = Tensor>> Batcher<Iter1<I>> {
    pub fn new1(inner: I) -> Self {
        Self::new(Iter1 { inner })
    }
}

impl<I: Iterator<Item = (Tensor, Tensor)>> Batcher<Iter2<I>> {
    pub fn new2(inner: I) -> Self {
        Self::new(Iter2 { inner })
    }
}

pub struct IterResult1<I: Iterator<Item = Result<Tensor>>> {
    inner: I,
}

pub struct IterResult2<I: Iterator<Item = Result<(Tensor, Tensor)>>> {
    inner: I,
}

impl<I: Iterator<Item = Result<Tensor>>> Batcher<IterResult1<I>> {
    pub fn new_r1(inner: I) -> Self {
        Self::new(IterResult1 { inner })
    }
}

impl<I: Iterator<Item = Result<(Tensor, Tensor)>>> Batcher<IterResult2<I>> {
    pub fn new_r2(inner: I) -> Self {
        Self::new(IterResult2 { inner })
    }
}

impl<I: Iterator<Item = Tensor>> Iterator for Batcher<Iter1<I>> {
    type Item = Result<Tensor>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut items = Vec::with_capacity(self.batch_size);
        for _i in 0..self.batch_size {
            // inner.inner: the Iter1/Iter2 wrappers keep the Iterator impls apart
            match self.inner.inner.next() {
                Some(item) => items.push(item),
                None => {
                    if self.return_last_incomplete_batch && !items.is_empty() {
                        break;
                    }
                    return None;
                }
            }
        }
        Some(Tensor::f_stack(&items, 0).map_err(anyhow::Error::from))
    }
}

impl<I: Iterator<Item = (Tensor, Tensor)>> Iterator for Batcher<Iter2<I>> {
    type Item = Result<(Tensor, Tensor)>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut xs = Vec::with_capacity(self.batch_size);
        let mut ys = Vec::with_capacity(self.batch_size);
        for _i in 0..self.batch_size {
            match self.inner.inner.next() {
                Some((x, y)) => {
                    xs.push(x);
                    ys.push(y)
                }
                None => {
                    if self.return_last_incomplete_batch && !xs.is_empty() {
                        break;
                    }
                    return None;
                }
            }
        }
        let out = || {
            let xs = Tensor::f_stack(&xs, 0)?;
            let ys = Tensor::f_stack(&ys, 0)?;
            Ok::<_, tch::TchError>((xs, ys))
        };
        Some(out().map_err(anyhow::Error::from))
    }
}

impl<I: Iterator<Item = Result<Tensor>>> Iterator for Batcher<IterResult1<I>> {
    type Item = Result<Tensor>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut items = Vec::with_capacity(self.batch_size);
        for _i in 0..self.batch_size {
            match self.inner.inner.next() {
                Some(Ok(item)) => items.push(item),
                Some(Err(e)) => return Some(Err(e)),
                None => {
                    if self.return_last_incomplete_batch && !items.is_empty() {
                        break;
                    }
                    return None;
                }
            }
        }
        Some(Tensor::f_stack(&items, 0).map_err(anyhow::Error::from))
    }
}

impl<I: Iterator<Item = Result<(Tensor, Tensor)>>> Iterator for Batcher<IterResult2<I>> {
    type Item = Result<(Tensor, Tensor)>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut xs = Vec::with_capacity(self.batch_size);
        let mut ys = Vec::with_capacity(self.batch_size);
        for _i in 0..self.batch_size {
            match self.inner.inner.next() {
                Some(Ok((x, y))) => {
                    xs.push(x);
                    ys.push(y)
                }
                Some(Err(e)) => return Some(Err(e)),
                None => {
                    if self.return_last_incomplete_batch && !xs.is_empty() {
                        break;
                    }
                    return None;
                }
            }
        }
        let out = || {
            let xs = Tensor::f_stack(&xs, 0)?;
            let ys = Tensor::f_stack(&ys, 0)?;
            Ok::<_, tch::TchError>((xs, ys))
        };
        Some(out().map_err(anyhow::Error::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stacks_pairs_into_batches() {
        let pairs = (0..5).map(|i| {
            (
                Tensor::from_slice(&[i as i64, i as i64 + 1]),
                Tensor::from_slice(&[i as i64 + 1, i as i64 + 2]),
            )
        });
        let batches = Batcher::new2(pairs)
            .batch_size(2)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        // the incomplete trailing batch is dropped
        assert_eq!(batches.len(), 2);
        let (x, y) = &batches[0];
        assert_eq!(x.size(), vec![2, 2]);
        assert_eq!(y.size(), vec![2, 2]);
        assert_eq!(x.int64_value(&[1, 0]), 1);
        assert_eq!(y.int64_value(&[1, 0]), 2);
    }

    #[test]
    fn keeps_incomplete_batch_when_asked() {
        let items = (0..5).map(|i| Tensor::from_slice(&[i as i64]));
        let batches = Batcher::new1(items)
            .batch_size(2)
            .return_last_incomplete_batch(true)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].size(), vec![1, 1]);
    }

    #[test]
    fn propagates_inner_errors() {
        let items = (0..4).map(|i| {
            if i == 2 {
                Err(anyhow::anyhow!("bad sample"))
            } else {
                Ok(Tensor::from_slice(&[i as i64]))
            }
        });
        let results = Batcher::new_r1(items).batch_size(2).collect::<Vec<_>>();
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }
}
