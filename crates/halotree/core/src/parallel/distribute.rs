// Dotlanth
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! The distribution primitive under every parallel strategy
//!
//! Items are processed on scoped threads that borrow the item slice, so the
//! caller keeps ownership of everything it hands out. Results come back in
//! item order. The first failure stops every worker at its next item.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crossbeam_deque::{Injector, Steal};
use tracing::{debug, warn};

use super::context::Distribution;
use crate::error::{ArborError, ArborResult, ParallelError};

/// Where a worker takes its next item index from
enum ItemSource<'a> {
    Range(Range<usize>),
    Queue(&'a Injector<usize>),
}

impl ItemSource<'_> {
    fn next_index(&mut self) -> Option<usize> {
        match self {
            ItemSource::Range(range) => range.next(),
            ItemSource::Queue(queue) => loop {
                match queue.steal() {
                    Steal::Success(index) => return Some(index),
                    Steal::Empty => return None,
                    Steal::Retry => continue,
                }
            },
        }
    }
}

/// Contiguous share of `len` items for `worker` out of `workers`. Earlier workers take the remainder.
pub fn static_range(len: usize, workers: usize, worker: usize) -> Range<usize> {
    let workers = workers.max(1);
    let chunk = len / workers;
    let remainder = len % workers;
    let start = worker * chunk + worker.min(remainder);
    let end = start + chunk + usize::from(worker < remainder);
    start.min(len)..end.min(len)
}

/// Runs `work` on every item, returning the results in item order.
pub fn distribute<T, R, F>(items: &[T], workers: usize, distribution: Distribution, work: F) -> ArborResult<Vec<R>>
where
    T: Sync,
    R: Send,
    F: Fn(usize, &T) -> ArborResult<R> + Sync,
{
    distribute_with_state(items, workers, distribution, |_| (), |_, index, item| work(index, item))
}

/// Like [`distribute`], giving every worker its own state built by `init` from the worker number.
pub fn distribute_with_state<T, S, R, I, F>(items: &[T], workers: usize, distribution: Distribution, init: I, work: F) -> ArborResult<Vec<R>>
where
    T: Sync,
    R: Send,
    I: Fn(usize) -> S + Sync,
    F: Fn(&mut S, usize, &T) -> ArborResult<R> + Sync,
{
    if workers == 0 {
        return Err(ParallelError::InvalidContext("at least one worker is required".to_string()).into());
    }
    if items.is_empty() {
        return Ok(Vec::new());
    }
    let workers = workers.min(items.len());
    debug!("Distributing {} items over {} workers ({:?})", items.len(), workers, distribution);

    let queue = Injector::new();
    if distribution == Distribution::Dynamic {
        for index in 0..items.len() {
            queue.push(index);
        }
    }
    let abort = AtomicBool::new(false);

    let outcomes: Vec<thread::Result<ArborResult<Vec<(usize, R)>>>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                let mut source = match distribution {
                    Distribution::Static => ItemSource::Range(static_range(items.len(), workers, worker)),
                    Distribution::Dynamic => ItemSource::Queue(&queue),
                };
                let (abort, init, work) = (&abort, &init, &work);
                scope.spawn(move || {
                    let mut state = init(worker);
                    let mut done = Vec::new();
                    while let Some(index) = source.next_index() {
                        if abort.load(Ordering::Relaxed) {
                            break;
                        }
                        match work(&mut state, index, &items[index]) {
                            Ok(result) => done.push((index, result)),
                            Err(e) => {
                                abort.store(true, Ordering::Relaxed);
                                return Err(e);
                            }
                        }
                    }
                    Ok(done)
                })
            })
            .collect();
        handles.into_iter().map(|handle| handle.join()).collect()
    });

    let mut slots: Vec<Option<R>> = (0..items.len()).map(|_| None).collect();
    let mut failure: Option<ArborError> = None;
    for (worker, outcome) in outcomes.into_iter().enumerate() {
        match outcome {
            Ok(Ok(done)) => {
                for (index, result) in done {
                    slots[index] = Some(result);
                }
            }
            Ok(Err(e)) => {
                warn!("Worker {} failed: {}", worker, e);
                if failure.is_none() {
                    failure = Some(ParallelError::WorkerFailed { worker, source: Box::new(e) }.into());
                }
            }
            Err(_) => {
                warn!("Worker {} panicked", worker);
                if failure.is_none() {
                    failure = Some(ParallelError::WorkerPanicked { worker }.into());
                }
            }
        }
    }
    if let Some(e) = failure {
        return Err(e);
    }
    Ok(slots.into_iter().flatten().collect())
}
