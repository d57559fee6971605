use std::time::Duration;

/// An infinite stream of back off durations, where the duration increases
/// by an exponential factor up to some maximum delay. Upon reaching the
/// maximum delay, that value will be returned from then on. Use
/// `Iterator::take` to bound the number of attempts.
///
/// The [Retry] trait drives a fallible operation with these delays, using
/// [std::thread::sleep]; do NOT use this from asynchronous code.
pub struct ExponentialBackoff {
    curr: Duration,
    max: Duration,
    factor: u32,
}

impl ExponentialBackoff {
    pub fn new(start: Duration, max: Duration, factor: u32) -> ExponentialBackoff {
        ExponentialBackoff {
            curr: start,
            max,
            factor,
        }
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        let this = self.curr;
        self.curr = (self.curr * self.factor).min(self.max);
        Some(this)
    }
}

/// Retry a function returning a [Result] until it succeeds or the iterator
/// of delays is exhausted.
pub trait Retry: Iterator<Item = Duration> {
    /// Call `f` until it returns [Ok]. After every failed attempt but the
    /// last, `sleep` is called with the error and the next delay; it is
    /// expected to log and then sleep. Returns `None` only if the iterator
    /// was empty, and the last [Err] if every attempt failed.
    fn retry<F, S, T, E>(&mut self, mut f: F, sleep: S) -> Option<Result<T, E>>
    where
        F: FnMut() -> Result<T, E>,
        S: Fn(&E, Duration),
        Self: Sized,
    {
        let mut last_err = None;
        let mut iter = self.peekable();
        while let Some(delay) = iter.next() {
            match f() {
                Ok(v) => return Some(Ok(v)),
                Err(e) => {
                    if iter.peek().is_some() {
                        sleep(&e, delay);
                    }
                    last_err = Some(Err(e));
                }
            }
        }
        last_err
    }
}

impl<I: Iterator<Item = Duration>> Retry for I {}
