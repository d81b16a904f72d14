//! Latest-wins frame hand-off between a stream worker and the renderer.
//!
//! The mailbox holds at most one frame behind an atomically swapped `Arc`.
//! `publish` replaces the pointer and `read` clones it, so neither side
//! blocks and a reader only ever sees a frame that was fully built before
//! it was published.

use arc_swap::ArcSwapOption;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Byte order of the packed 8-bit pixels in a [`Frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    Rgb8,
    Bgr8,
}

impl PixelLayout {
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgb8 | Self::Bgr8 => 3,
        }
    }
}

/// One decoded picture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub width: usize,
    pub height: usize,
    pub layout: PixelLayout,
    pub pixels: Vec<u8>,
}

impl Frame {
    pub fn new(width: usize, height: usize, layout: PixelLayout, pixels: Vec<u8>) -> Self {
        Self {
            width,
            height,
            layout,
            pixels,
        }
    }

    pub fn expected_len(&self) -> usize {
        self.width
            .saturating_mul(self.height)
            .saturating_mul(self.layout.bytes_per_pixel())
    }
}

#[derive(Debug, Default)]
pub struct FrameMailbox {
    latest: ArcSwapOption<Frame>,
    published: AtomicU64,
}

impl FrameMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces whatever frame was held before. Never blocks.
    pub fn publish(&self, frame: Frame) {
        self.latest.store(Some(Arc::new(frame)));
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    /// Most recent frame, or `None` before the first publish. Does not consume.
    pub fn read(&self) -> Option<Arc<Frame>> {
        self.latest.load_full()
    }

    /// Drops the held frame. The publish counter is left alone.
    pub fn clear(&self) {
        self.latest.store(None);
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::{Frame, FrameMailbox, PixelLayout};
    use std::sync::Arc;

    fn solid(width: usize, height: usize, value: u8) -> Frame {
        Frame::new(
            width,
            height,
            PixelLayout::Rgb8,
            vec![value; width * height * 3],
        )
    }

    #[test]
    fn empty_mailbox_reads_none() {
        let mailbox = FrameMailbox::new();
        assert!(mailbox.read().is_none());
        assert_eq!(mailbox.published(), 0);
    }

    #[test]
    fn repeated_reads_return_the_same_frame() {
        let mailbox = FrameMailbox::new();
        mailbox.publish(solid(4, 2, 7));

        let first = mailbox.read().expect("frame published");
        for _ in 0..5 {
            let again = mailbox.read().expect("frame still present");
            assert!(Arc::ptr_eq(&first, &again));
        }
    }

    #[test]
    fn publish_overwrites_previous_frame() {
        let mailbox = FrameMailbox::new();
        mailbox.publish(solid(4, 2, 1));
        mailbox.publish(solid(8, 4, 2));

        let latest = mailbox.read().expect("frame published");
        assert_eq!((latest.width, latest.height), (8, 4));
        assert!(latest.pixels.iter().all(|&b| b == 2));
        assert_eq!(mailbox.published(), 2);
    }

    #[test]
    fn clear_empties_the_mailbox_until_the_next_publish() {
        let mailbox = FrameMailbox::new();
        mailbox.publish(solid(4, 2, 1));
        mailbox.clear();
        assert!(mailbox.read().is_none());
        assert_eq!(mailbox.published(), 1);

        mailbox.publish(solid(4, 2, 3));
        assert!(mailbox.read().is_some());
    }

    #[test]
    fn reader_thread_never_sees_a_partial_frame() {
        let mailbox = Arc::new(FrameMailbox::new());
        let writer = {
            let mailbox = mailbox.clone();
            std::thread::spawn(move || {
                for value in 0..200_u8 {
                    mailbox.publish(solid(16, 9, value));
                }
            })
        };

        for _ in 0..2_000 {
            if let Some(frame) = mailbox.read() {
                assert_eq!(frame.pixels.len(), frame.expected_len());
                let first = frame.pixels[0];
                assert!(frame.pixels.iter().all(|&b| b == first));
            }
        }
        writer.join().expect("writer thread");
    }
}
