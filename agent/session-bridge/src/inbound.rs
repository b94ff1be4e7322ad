//! Inbound control-frame demultiplexer.
//!
//! One bounded queue per origin (remote peer). A flooding peer overwrites its
//! own oldest frames and never delays another peer's: origins with pending
//! frames are served round-robin, one frame per turn. Frames of one origin are
//! delivered in arrival order; there is no ordering across origins.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use adapter_trait::ControlFrame;
use futures::Stream;
use ring_buffer::RingBuffer;
use tokio::sync::Notify;
use tracing::trace;

#[derive(Default)]
struct Queues {
    by_origin: HashMap<String, RingBuffer<ControlFrame>>,
    /// Origins with at least one pending frame, in service order. Each appears once.
    ready:     VecDeque<String>,
}

pub struct FrameMux {
    topic:    String,
    capacity: usize,
    queues:   Mutex<Queues>,
    notify:   Notify,
}

impl FrameMux {
    pub fn new(topic: impl Into<String>, capacity: usize) -> Self {
        Self {
            topic:    topic.into(),
            capacity: capacity.max(1),
            queues:   Mutex::new(Queues::default()),
            notify:   Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, frame: ControlFrame) {
        let evicted = {
            let mut q = self.lock();
            let Queues { by_origin, ready } = &mut *q;
            let ring = by_origin
                .entry(frame.origin.clone())
                .or_insert_with(|| RingBuffer::new(self.capacity));
            if ring.is_empty() {
                ready.push_back(frame.origin.clone());
            }
            ring.push(frame)
        };
        if let Some(old) = evicted {
            metrics::counter!("teleop.inbound.frames_overwritten", "topic" => self.topic.clone()).increment(1);
            trace!(origin = %old.origin, seq = old.seq, "Inbound queue full, overwrote oldest frame");
        }
        self.notify.notify_one();
    }

    /// Take the oldest frame of the origin whose turn it is.
    pub fn pop(&self) -> Option<ControlFrame> {
        let mut q = self.lock();
        let Queues { by_origin, ready } = &mut *q;
        while let Some(origin) = ready.pop_front() {
            let Some(ring) = by_origin.get_mut(&origin) else {
                continue;
            };
            let Some(frame) = ring.pop() else {
                continue;
            };
            if !ring.is_empty() {
                ready.push_back(origin);
            }
            return Some(frame);
        }
        None
    }

    /// Discard the queue of a departed peer.
    pub fn remove_origin(&self, origin: &str) {
        let mut q = self.lock();
        q.by_origin.remove(origin);
        q.ready.retain(|o| o != origin);
    }

    /// Discard every queue (session destroyed).
    pub fn clear(&self) {
        let mut q = self.lock();
        q.by_origin.clear();
        q.ready.clear();
    }

    /// Endless stream of frames. Intended for a single consumer per topic.
    pub fn stream(self: Arc<Self>) -> Pin<Box<dyn Stream<Item = ControlFrame> + Send>> {
        Box::pin(async_stream::stream! {
            loop {
                match self.pop() {
                    Some(frame) => yield frame,
                    // notify_one leaves a permit when nobody waits, so a push
                    // racing with this check still wakes us.
                    None => self.notify.notified().await,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adapter_trait::Axes;
    use futures::StreamExt;

    fn frame(origin: &str, seq: u64) -> ControlFrame {
        ControlFrame::new(origin, seq, Axes::default())
    }

    fn drain(mux: &FrameMux) -> Vec<(String, u64)> {
        std::iter::from_fn(|| mux.pop()).map(|f| (f.origin, f.seq)).collect()
    }

    #[test]
    fn per_origin_capacity_overwrites_oldest() {
        let mux = FrameMux::new("control", 4);
        for seq in 1..=6 {
            mux.push(frame("a", seq));
        }
        mux.push(frame("b", 1));

        let drained = drain(&mux);
        assert_eq!(drained.len(), 5);
        let a_seqs: Vec<u64> = drained.iter().filter(|(o, _)| o == "a").map(|(_, s)| *s).collect();
        assert_eq!(a_seqs, vec![3, 4, 5, 6]);
    }

    #[test]
    fn origins_take_turns() {
        let mux = FrameMux::new("control", 4);
        for seq in 1..=3 {
            mux.push(frame("a", seq));
        }
        mux.push(frame("b", 1));
        mux.push(frame("b", 2));

        assert_eq!(
            drain(&mux),
            vec![
                ("a".into(), 1),
                ("b".into(), 1),
                ("a".into(), 2),
                ("b".into(), 2),
                ("a".into(), 3),
            ]
        );
    }

    #[test]
    fn flooding_origin_cannot_starve_another() {
        for round in 0..20 {
            let mux = FrameMux::new("control", 4);
            let flooder = format!("flood-{round}");
            mux.push(frame(&flooder, 0));
            mux.push(frame("controller", 1));

            let mut delivered = false;
            for seq in 1..200 {
                mux.push(frame(&flooder, seq));
                if mux.pop().is_some_and(|f| f.origin == "controller") {
                    delivered = true;
                    break;
                }
            }
            assert!(delivered, "controller frame starved behind {flooder}");
        }
    }

    #[test]
    fn departed_origin_is_discarded() {
        let mux = FrameMux::new("control", 4);
        mux.push(frame("a", 1));
        mux.push(frame("b", 1));
        mux.remove_origin("a");
        assert_eq!(mux.pop().map(|f| f.origin), Some("b".to_string()));
        assert!(mux.pop().is_none());

        // a rejoining origin is queued once
        mux.push(frame("a", 2));
        assert_eq!(drain(&mux), vec![("a".into(), 2)]);
    }

    #[tokio::test]
    async fn stream_wakes_on_push() {
        let mux = Arc::new(FrameMux::new("control", 4));
        let mut frames = Arc::clone(&mux).stream();
        let pusher = Arc::clone(&mux);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            pusher.push(frame("a", 42));
        });
        assert_eq!(frames.next().await.map(|f| f.seq), Some(42));
    }
}
