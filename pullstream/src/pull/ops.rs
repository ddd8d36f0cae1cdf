//! Derived operations on stream pulls.
//!
//! Everything here is built from [`Pull::uncons`]: step the source one chunk
//! at a time, and push leftovers back with [`Pull::cons`].

use std::sync::Arc;

use super::{Element, Pull};
use crate::chunk::Chunk;

type Predicate<O> = Arc<dyn Fn(&O) -> bool + Send + Sync>;

/// A step that yields a chunk and the rest of the source.
pub type Unconsed<O> = Option<(Chunk<O>, Pull<O, ()>)>;

impl<O: Element> Pull<O, ()> {
    /// Runs until the first element is available.
    pub fn uncons1<P: Element>(self) -> Pull<P, Option<(O, Pull<O, ()>)>> {
        self.uncons::<P>().flat_map(|step| match step {
            None => Pull::pure(None),
            Some((head, tail)) => match head.size() {
                0 => tail.uncons1(),
                1 => Pull::pure(Some((head[0].clone(), tail))),
                _ => Pull::pure(Some((head[0].clone(), tail.cons(head.drop(1))))),
            },
        })
    }

    /// Runs until `n` elements are available and yields them as one chunk.
    ///
    /// If the source ends early, the elements read so far are yielded when
    /// `allow_fewer` is set; otherwise the result is `None`.
    pub fn uncons_n<P: Element>(self, n: usize, allow_fewer: bool) -> Pull<P, Unconsed<O>> {
        if n == 0 {
            return Pull::pure(Some((Chunk::empty(), self)));
        }
        uncons_n_from(self, n, Vec::new(), 0, allow_fewer)
    }

    /// Like [`Pull::uncons`], but splits the first chunk so it holds at most
    /// `n` elements.
    pub fn uncons_limit<P: Element>(self, n: usize) -> Pull<P, Unconsed<O>> {
        if n == 0 {
            return Pull::pure(Some((Chunk::empty(), self)));
        }
        self.uncons::<P>().map(move |step| {
            step.map(|(head, tail)| {
                if head.size() <= n {
                    (head, tail)
                } else {
                    let (prefix, rest) = head.split_at(n);
                    (prefix, tail.cons(rest))
                }
            })
        })
    }

    /// Emits the first `n` elements.
    ///
    /// Ends with the rest of the source, or `None` if it ran out.
    pub fn take(self, n: usize) -> Pull<O, Option<Pull<O, ()>>> {
        if n == 0 {
            return Pull::pure(Some(self));
        }
        self.uncons::<O>().flat_map(move |step| match step {
            None => Pull::pure(None),
            Some((head, tail)) => {
                let size = head.size();
                if size < n {
                    Pull::output(head).then(tail.take(n - size))
                } else if size == n {
                    Pull::output(head).as_value(Some(tail))
                } else {
                    let (prefix, rest) = head.split_at(n);
                    Pull::output(prefix).as_value(Some(tail.cons(rest)))
                }
            }
        })
    }

    /// Discards the first `n` elements.
    ///
    /// Ends with the rest of the source, or `None` if it ran out.
    pub fn drop<P: Element>(self, n: usize) -> Pull<P, Option<Pull<O, ()>>> {
        if n == 0 {
            return Pull::pure(Some(self));
        }
        self.uncons::<P>().flat_map(move |step| match step {
            None => Pull::pure(None),
            Some((head, tail)) => {
                let size = head.size();
                if size < n {
                    tail.drop(n - size)
                } else if size == n {
                    Pull::pure(Some(tail))
                } else {
                    Pull::pure(Some(tail.cons(head.drop(n))))
                }
            }
        })
    }

    /// Emits elements while `predicate` holds.
    ///
    /// With `take_failure`, the first element failing the predicate is emitted
    /// too. Ends with the rest of the source, or `None` if it ran out.
    pub fn take_while<F>(self, predicate: F, take_failure: bool) -> Pull<O, Option<Pull<O, ()>>>
    where
        F: Fn(&O) -> bool + Send + Sync + 'static,
    {
        take_while_with(self, Arc::new(predicate), take_failure)
    }

    /// Discards elements while `predicate` holds.
    ///
    /// Ends with the rest of the source starting at the first failing
    /// element, or `None` if it ran out.
    pub fn drop_while<P, F>(self, predicate: F) -> Pull<P, Option<Pull<O, ()>>>
    where
        P: Element,
        F: Fn(&O) -> bool + Send + Sync + 'static,
    {
        drop_while_with(self, Arc::new(predicate))
    }

    /// Finds the first element matching `predicate`.
    pub fn find<P, F>(self, predicate: F) -> Pull<P, Option<(O, Pull<O, ()>)>>
    where
        P: Element,
        F: Fn(&O) -> bool + Send + Sync + 'static,
    {
        find_with(self, Arc::new(predicate))
    }

    /// Folds every element of the source.
    pub fn fold<P, B, F>(self, init: B, f: F) -> Pull<P, B>
    where
        P: Element,
        B: Send + 'static,
        F: FnMut(B, &O) -> B + Send + 'static,
    {
        self.uncons::<P>().flat_map(move |step| match step {
            None => Pull::pure(init),
            Some((head, tail)) => {
                let mut f = f;
                let acc = head.fold_left(init, &mut f);
                tail.fold(acc, f)
            }
        })
    }

    /// The last element of the source.
    pub fn last<P: Element>(self) -> Pull<P, Option<O>> {
        self.fold(None, |_, value: &O| Some(value.clone()))
    }

    /// Maps every emitted chunk.
    pub fn map_chunks<P, F>(self, f: F) -> Pull<P, ()>
    where
        P: Element,
        F: Fn(Chunk<O>) -> Chunk<P> + Send + Sync + 'static,
    {
        map_chunks_with(self, Arc::new(f))
    }

    /// Maps every emitted element.
    pub fn map_output<P, F>(self, f: F) -> Pull<P, ()>
    where
        P: Element,
        F: Fn(&O) -> P + Send + Sync + 'static,
    {
        self.map_chunks(move |chunk| chunk.map(&f))
    }
}

fn uncons_n_from<O: Element, P: Element>(
    pull: Pull<O, ()>,
    n: usize,
    mut acc: Vec<Chunk<O>>,
    size: usize,
    allow_fewer: bool,
) -> Pull<P, Unconsed<O>> {
    pull.uncons::<P>().flat_map(move |step| match step {
        None if allow_fewer && size > 0 => Pull::pure(Some((Chunk::concat_all(acc), Pull::done()))),
        None => Pull::pure(None),
        Some((head, tail)) => {
            let needed = n - size;
            if head.size() < needed {
                let size = size + head.size();
                acc.push(head);
                uncons_n_from(tail, n, acc, size, allow_fewer)
            } else {
                let (prefix, rest) = head.split_at(needed);
                acc.push(prefix);
                Pull::pure(Some((Chunk::concat_all(acc), tail.cons(rest))))
            }
        }
    })
}

fn take_while_with<O: Element>(
    pull: Pull<O, ()>,
    predicate: Predicate<O>,
    take_failure: bool,
) -> Pull<O, Option<Pull<O, ()>>> {
    pull.uncons::<O>().flat_map(move |step| match step {
        None => Pull::pure(None),
        Some((head, tail)) => {
            let failed = head.iter().position(|value| !predicate(value));
            match failed {
                None => Pull::output(head).then(take_while_with(tail, predicate, take_failure)),
                Some(index) => {
                    let cut = if take_failure { index + 1 } else { index };
                    let (prefix, rest) = head.split_at(cut);
                    Pull::output(prefix).as_value(Some(tail.cons(rest)))
                }
            }
        }
    })
}

fn drop_while_with<O: Element, P: Element>(
    pull: Pull<O, ()>,
    predicate: Predicate<O>,
) -> Pull<P, Option<Pull<O, ()>>> {
    pull.uncons::<P>().flat_map(move |step| match step {
        None => Pull::pure(None),
        Some((head, tail)) => {
            let failed = head.iter().position(|value| !predicate(value));
            match failed {
                None => drop_while_with(tail, predicate),
                Some(index) => Pull::pure(Some(tail.cons(head.drop(index)))),
            }
        }
    })
}

fn find_with<O: Element, P: Element>(
    pull: Pull<O, ()>,
    predicate: Predicate<O>,
) -> Pull<P, Option<(O, Pull<O, ()>)>> {
    pull.uncons::<P>().flat_map(move |step| match step {
        None => Pull::pure(None),
        Some((head, tail)) => {
            let matched = head.iter().position(|value| predicate(value));
            match matched {
                None => find_with(tail, predicate),
                Some(index) => {
                    let found = head[index].clone();
                    Pull::pure(Some((found, tail.cons(head.drop(index + 1)))))
                }
            }
        }
    })
}

fn map_chunks_with<O: Element, P: Element>(
    pull: Pull<O, ()>,
    f: Arc<dyn Fn(Chunk<O>) -> Chunk<P> + Send + Sync>,
) -> Pull<P, ()> {
    pull.uncons::<P>().flat_map(move |step| match step {
        None => Pull::done(),
        Some((head, tail)) => Pull::output(f(head)).then(map_chunks_with(tail, f)),
    })
}
