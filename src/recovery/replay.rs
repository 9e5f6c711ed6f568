//! Ordering of replayed source events.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::operators::Event;

/// Interleave the replay buffers of several sources into one stream
/// in timestamp order.
///
/// Each buffer keeps its own order; ties between sources go to the
/// lower index. Returns `(buffer index, event)` pairs.
pub(crate) fn merge_by_timestamp(buffers: Vec<Vec<Event>>) -> Vec<(usize, Event)> {
    let total = buffers.iter().map(Vec::len).sum();
    let mut iters: Vec<_> = buffers.into_iter().map(|b| b.into_iter().peekable()).collect();
    let mut heap = BinaryHeap::new();
    for (idx, iter) in iters.iter_mut().enumerate() {
        if let Some(event) = iter.peek() {
            heap.push(Reverse((event.timestamp(), idx)));
        }
    }

    let mut merged = Vec::with_capacity(total);
    while let Some(Reverse((_, idx))) = heap.pop() {
        let iter = &mut iters[idx];
        if let Some(event) = iter.next() {
            merged.push((idx, event));
        }
        if let Some(next) = iter.peek() {
            heap.push(Reverse((next.timestamp(), idx)));
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::DataEvent;
    use serde_json::json;

    fn data(ts: u64) -> Event {
        Event::Data(DataEvent::new(ts, json!(ts)))
    }

    #[test]
    fn events_come_out_in_timestamp_order() {
        let merged = merge_by_timestamp(vec![
            vec![data(1), data(4), Event::Watermark(4)],
            vec![data(2), data(3)],
            vec![],
        ]);
        let order: Vec<(usize, u64)> = merged.iter().map(|(i, e)| (*i, e.timestamp())).collect();
        assert_eq!(order, vec![(0, 1), (1, 2), (1, 3), (0, 4), (0, 4)]);
        assert!(matches!(merged[4].1, Event::Watermark(4)));
    }

    #[test]
    fn ties_prefer_lower_source() {
        let merged = merge_by_timestamp(vec![vec![data(5)], vec![data(5)], vec![data(1)]]);
        let sources: Vec<usize> = merged.iter().map(|(i, _)| *i).collect();
        assert_eq!(sources, vec![2, 0, 1]);
    }

    #[test]
    fn source_order_is_kept_when_out_of_order() {
        let merged = merge_by_timestamp(vec![vec![data(3), data(1)]]);
        let ts: Vec<u64> = merged.iter().map(|(_, e)| e.timestamp()).collect();
        assert_eq!(ts, vec![3, 1]);
    }
}
