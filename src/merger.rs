//! Multiway stream merger.
//!
//! Streams are merged by a binary merge tree. Each inner node of the tree is a two-way merge, a subtree
//! gets its own thread if a slot of the [`ResourceBudget`] is available and is pulled synchronously by
//! its parent otherwise. Trees deeper than the configured limit are replaced by a k-way merge.

use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::iter;
use std::marker::PhantomData;
use std::panic;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::Receiver;

use crate::budget::{BudgetPermit, ResourceBudget};

/// A lazily produced, single-pass sorted sequence of items.
pub type SortedStream<T, E> = Box<dyn Iterator<Item = Result<T, E>> + Send>;

/// Merge tree depth after which the k-way merge is used.
pub const MAX_MERGE_DEPTH: usize = 30;
/// Capacity of the queue between a parallel subtree and its consumer.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Merges multiple sorted streams into a single sorted one.
///
/// Items comparing equal are all preserved. The merge is lazy: inputs are consumed only as fast as the
/// merged stream is, parallel subtrees run at most `queue_capacity` items ahead of their consumer.
pub struct StreamMerger<T, F> {
    compare: Arc<F>,
    parallelism: usize,
    queue_capacity: usize,
    max_depth: usize,

    item_type: PhantomData<fn() -> T>,
}

impl<T, F> Clone for StreamMerger<T, F> {
    fn clone(&self) -> Self {
        StreamMerger {
            compare: Arc::clone(&self.compare),
            parallelism: self.parallelism,
            queue_capacity: self.queue_capacity,
            max_depth: self.max_depth,
            item_type: PhantomData,
        }
    }
}

impl<T, F> StreamMerger<T, F>
where
    T: Send + 'static,
    F: Fn(&T, &T) -> Ordering + Send + Sync + 'static,
{
    /// Creates a merger.
    ///
    /// # Arguments
    /// * `compare` - Function to be used to compare items
    /// * `parallelism` - Maximum number of merge subtrees running in their own threads at the same time
    pub fn new(compare: F, parallelism: usize) -> Self {
        StreamMerger {
            compare: Arc::new(compare),
            parallelism,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_depth: MAX_MERGE_DEPTH,
            item_type: PhantomData,
        }
    }

    /// Sets capacity of the queues connecting parallel subtrees to their consumers.
    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        return self;
    }

    /// Sets merge tree depth after which the k-way merge is used.
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        return self;
    }

    /// Merges sorted streams. Items of every stream must be sorted according to the comparator,
    /// otherwise the result order is undefined. Errors of the input streams are passed through as is.
    pub fn merge<E>(&self, streams: Vec<SortedStream<T, E>>) -> Result<SortedStream<T, E>, E>
    where
        E: From<io::Error> + Send + 'static,
    {
        self.merge_with_budget(streams, Arc::new(ResourceBudget::new(self.parallelism)))
    }

    /// Merges sorted streams sharing the provided budget of parallel subtrees.
    pub fn merge_with_budget<E>(
        &self,
        streams: Vec<SortedStream<T, E>>,
        budget: Arc<ResourceBudget>,
    ) -> Result<SortedStream<T, E>, E>
    where
        E: From<io::Error> + Send + 'static,
    {
        log::debug!(
            "merging {} streams (parallelism: {})",
            streams.len(),
            budget.capacity()
        );
        self.merge_tree(streams, &budget, 0)
    }

    fn merge_tree<E>(
        &self,
        mut streams: Vec<SortedStream<T, E>>,
        budget: &Arc<ResourceBudget>,
        depth: usize,
    ) -> Result<SortedStream<T, E>, E>
    where
        E: From<io::Error> + Send + 'static,
    {
        if streams.len() <= 2 {
            let mut streams = streams.into_iter();
            return Ok(match (streams.next(), streams.next()) {
                (None, _) => Box::new(iter::empty()),
                (Some(single), None) => single,
                (Some(left), Some(right)) => Box::new(TwoWayMerge::new(left, right, Arc::clone(&self.compare))),
            });
        }

        if depth >= self.max_depth {
            log::debug!(
                "merge depth limit reached (depth: {}), using k-way merge of {} streams",
                depth,
                streams.len()
            );
            return Ok(Box::new(KWayMerge::new(streams, Arc::clone(&self.compare))));
        }

        let second_half = streams.split_off((streams.len() + 1) / 2);
        let first = self.merge_subtree(streams, budget, depth + 1)?;
        let second = self.merge_subtree(second_half, budget, depth + 1)?;

        self.merge_tree(vec![first, second], budget, depth + 1)
    }

    fn merge_subtree<E>(
        &self,
        streams: Vec<SortedStream<T, E>>,
        budget: &Arc<ResourceBudget>,
        depth: usize,
    ) -> Result<SortedStream<T, E>, E>
    where
        E: From<io::Error> + Send + 'static,
    {
        match budget.try_acquire() {
            Some(permit) => self.spawn_subtree(streams, budget, depth, permit),
            None => self.merge_tree(streams, budget, depth),
        }
    }

    fn spawn_subtree<E>(
        &self,
        streams: Vec<SortedStream<T, E>>,
        budget: &Arc<ResourceBudget>,
        depth: usize,
        permit: BudgetPermit,
    ) -> Result<SortedStream<T, E>, E>
    where
        E: From<io::Error> + Send + 'static,
    {
        log::debug!("merging {} streams in a separate thread (depth: {})", streams.len(), depth);

        let (sender, receiver) = crossbeam_channel::bounded(self.queue_capacity);
        let merger = self.clone();
        let budget = Arc::clone(budget);

        let handle = thread::Builder::new()
            .name(format!("merge-{}", depth))
            .spawn(move || {
                let _permit = permit;
                match merger.merge_tree(streams, &budget, depth) {
                    Ok(merged) => {
                        for item in merged {
                            // the consumer is gone
                            if sender.send(item).is_err() {
                                break;
                            }
                        }
                    }
                    Err(err) => {
                        let _ = sender.send(Err(err));
                    }
                }
            })
            .map_err(E::from)?;

        return Ok(Box::new(ChannelStream {
            receiver,
            producer: Some(handle),
        }));
    }
}

/// Consumer side of a subtree merged in a separate thread.
struct ChannelStream<T, E> {
    receiver: Receiver<Result<T, E>>,
    producer: Option<thread::JoinHandle<()>>,
}

impl<T, E> Iterator for ChannelStream<T, E> {
    type Item = Result<T, E>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.receiver.recv() {
            Ok(item) => Some(item),
            Err(_) => {
                // a panicked producer must not look like an exhausted stream
                if let Some(producer) = self.producer.take() {
                    if let Err(panic) = producer.join() {
                        panic::resume_unwind(panic);
                    }
                }
                None
            }
        }
    }
}

/// Stream with a look-ahead item.
struct Cursor<T, E> {
    stream: SortedStream<T, E>,
    head: Option<T>,
    exhausted: bool,
}

impl<T, E> Cursor<T, E> {
    fn new(stream: SortedStream<T, E>) -> Self {
        Cursor {
            stream,
            head: None,
            exhausted: false,
        }
    }

    /// Loads the next item into the head unless it is already loaded or the stream is exhausted.
    fn load(&mut self) -> Result<(), E> {
        if self.head.is_none() && !self.exhausted {
            match self.stream.next() {
                Some(Ok(item)) => self.head = Some(item),
                Some(Err(err)) => return Err(err),
                None => self.exhausted = true,
            }
        }

        return Ok(());
    }
}

/// Classic merge of two sorted streams. On a tie the left item goes first.
struct TwoWayMerge<T, E, F> {
    left: Cursor<T, E>,
    right: Cursor<T, E>,
    pending: Option<T>,
    compare: Arc<F>,
}

impl<T, E, F> TwoWayMerge<T, E, F> {
    fn new(left: SortedStream<T, E>, right: SortedStream<T, E>, compare: Arc<F>) -> Self {
        TwoWayMerge {
            left: Cursor::new(left),
            right: Cursor::new(right),
            pending: None,
            compare,
        }
    }
}

impl<T, E, F> Iterator for TwoWayMerge<T, E, F>
where
    F: Fn(&T, &T) -> Ordering,
{
    type Item = Result<T, E>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(item) = self.pending.take() {
            return Some(Ok(item));
        }

        if let Err(err) = self.left.load() {
            return Some(Err(err));
        }
        if let Err(err) = self.right.load() {
            return Some(Err(err));
        }

        match (self.left.head.take(), self.right.head.take()) {
            (Some(left), Some(right)) => match (self.compare)(&left, &right) {
                Ordering::Less => {
                    self.right.head = Some(right);
                    Some(Ok(left))
                }
                Ordering::Greater => {
                    self.left.head = Some(left);
                    Some(Ok(right))
                }
                Ordering::Equal => {
                    self.pending = Some(right);
                    Some(Ok(left))
                }
            },
            (Some(left), None) => Some(Ok(left)),
            (None, Some(right)) => Some(Ok(right)),
            (None, None) => None,
        }
    }
}

/// Current head of a stream ordered by the merge comparator.
struct OrderedHead<T, F> {
    value: T,
    compare: Arc<F>,
}

impl<T, F: Fn(&T, &T) -> Ordering> Ord for OrderedHead<T, F> {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.compare)(&self.value, &other.value)
    }
}

impl<T, F: Fn(&T, &T) -> Ordering> PartialOrd for OrderedHead<T, F> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T, F: Fn(&T, &T) -> Ordering> PartialEq for OrderedHead<T, F> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T, F: Fn(&T, &T) -> Ordering> Eq for OrderedHead<T, F> {}

/// Streams whose heads compare equal to a key of the k-way merge map.
/// The key itself holds the head of the `first` stream.
struct EqualHeads<T> {
    first: usize,
    others: Vec<(usize, T)>,
}

/// K-way merge keeping stream heads in a sorted map.
/// Time complexity is *m* \* log(*n*) where *m* is the number of items and *n* is the number of streams.
struct KWayMerge<T, E, F> {
    streams: Vec<SortedStream<T, E>>,
    heads: BTreeMap<OrderedHead<T, F>, EqualHeads<T>>,
    compare: Arc<F>,
    /// Streams not yet polled for their first item.
    unstarted: usize,
    /// Streams whose heads were emitted and have to be advanced.
    to_advance: VecDeque<usize>,
    pending: VecDeque<T>,
}

impl<T, E, F> KWayMerge<T, E, F>
where
    F: Fn(&T, &T) -> Ordering,
{
    fn new(streams: Vec<SortedStream<T, E>>, compare: Arc<F>) -> Self {
        KWayMerge {
            heads: BTreeMap::new(),
            compare,
            unstarted: 0,
            to_advance: VecDeque::new(),
            pending: VecDeque::new(),
            streams,
        }
    }

    fn put(&mut self, value: T, stream_idx: usize) {
        let key = OrderedHead {
            value,
            compare: Arc::clone(&self.compare),
        };

        if let Some(equal) = self.heads.get_mut(&key) {
            equal.others.push((stream_idx, key.value));
        } else {
            self.heads.insert(
                key,
                EqualHeads {
                    first: stream_idx,
                    others: Vec::new(),
                },
            );
        }
    }

    fn advance(&mut self, stream_idx: usize) -> Result<(), E> {
        match self.streams[stream_idx].next() {
            Some(Ok(value)) => self.put(value, stream_idx),
            Some(Err(err)) => return Err(err),
            None => {}
        }

        return Ok(());
    }
}

impl<T, E, F> Iterator for KWayMerge<T, E, F>
where
    F: Fn(&T, &T) -> Ordering,
{
    type Item = Result<T, E>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.unstarted < self.streams.len() {
            let stream_idx = self.unstarted;
            self.unstarted += 1;
            if let Err(err) = self.advance(stream_idx) {
                return Some(Err(err));
            }
        }

        loop {
            if let Some(value) = self.pending.pop_front() {
                return Some(Ok(value));
            }

            while let Some(stream_idx) = self.to_advance.pop_front() {
                if let Err(err) = self.advance(stream_idx) {
                    return Some(Err(err));
                }
            }

            let (key, equal) = self.heads.pop_first()?;
            self.pending.push_back(key.value);
            self.to_advance.push_back(equal.first);
            for (stream_idx, value) in equal.others {
                self.pending.push_back(value);
                self.to_advance.push_back(stream_idx);
            }
        }
    }
}
