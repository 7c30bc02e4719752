//! Length-prefixed message reassembly.
//!
//! A [`StreamDefragger`] turns the spans handed to
//! [`SessionListener::on_data_received`](crate::SessionListener) into whole
//! messages. Every message starts with a fixed size header; a caller supplied
//! function maps the header to the total message length (header included).
//!
//! Messages that sit completely inside the fed span are returned as views of
//! it, only messages split across spans are copied into the spill buffer.
//!
//! ```ignore
//! let mut defrag = StreamDefragger::new(4, |h| {
//!     u32::from_be_bytes([h[0], h[1], h[2], h[3]]) as i64
//! });
//!
//! fn on_data_received(&self, data: &[u8]) {
//!     let mut feed = self.defrag.lock().unwrap().feed(data);
//!     while let Some(frame) = feed.next() {
//!         match frame {
//!             Frame::Message(msg) => handle(msg),
//!             Frame::InvalidHeader => return session.close_connection(),
//!         }
//!     }
//! }
//! ```

use collider_core::constants::DEFRAG_MIN_SPILL;

/// One result of [`Feed::next`].
#[derive(Debug, PartialEq, Eq)]
pub enum Frame<'a> {
    /// A whole message, header included. Valid until the next `next()`.
    Message(&'a [u8]),
    /// The header decoder rejected a header. The stream cannot be resynced.
    InvalidHeader,
}

pub struct StreamDefragger<F> {
    header_size: usize,
    decode: F,
    /// Bytes of an incomplete message carried over from earlier spans
    spill: Vec<u8>,
    /// Length of the spilled message, 0 while its header is incomplete
    msg_len: usize,
    invalid: bool,
}

impl<F> StreamDefragger<F>
where
    F: FnMut(&[u8]) -> i64,
{
    /// `decode` gets exactly `header_size` bytes and returns the message
    /// length, header included.
    ///
    /// Any length below `header_size` marks the stream invalid, a positive
    /// one included: such a message could not even hold its own header.
    pub fn new(header_size: usize, decode: F) -> Self {
        assert!(header_size > 0, "header size must be positive");
        Self {
            header_size,
            decode,
            spill: Vec::new(),
            msg_len: 0,
            invalid: false,
        }
    }

    #[inline]
    pub fn header_size(&self) -> usize {
        self.header_size
    }

    /// Bytes carried over to the next `feed()`.
    pub fn pending(&self) -> usize {
        self.spill.len()
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid
    }

    /// Start scanning `data`.
    pub fn feed<'d>(&mut self, data: &'d [u8]) -> Feed<'_, 'd, F> {
        let mut feed = Feed {
            defrag: self,
            data,
            pos: 0,
            spilled: SpillState::None,
            reported: false,
        };
        if !feed.defrag.invalid && !feed.defrag.spill.is_empty() {
            feed.top_up();
        }
        feed
    }

    /// `Some(len)` for a valid decoded length, `None` (and the stream
    /// marked invalid) otherwise.
    fn check_len(&mut self, len: i64) -> Option<usize> {
        if len < self.header_size as i64 {
            self.invalid = true;
            self.spill.clear();
            self.msg_len = 0;
            return None;
        }
        Some(len as usize)
    }

    fn spill(&mut self, bytes: &[u8], msg_len: usize) {
        self.spill.clear();
        self.spill.reserve(msg_len.max(self.header_size).max(DEFRAG_MIN_SPILL));
        self.spill.extend_from_slice(bytes);
        self.msg_len = msg_len;
    }
}

impl<F> std::fmt::Debug for StreamDefragger<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamDefragger")
            .field("header_size", &self.header_size)
            .field("pending", &self.spill.len())
            .field("invalid", &self.invalid)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpillState {
    None,
    /// The spill holds a whole message not yet returned
    Ready,
    /// Returned, clear on the next call
    Returned,
}

/// Cursor over one fed span.
///
/// Dropping it before `next()` returned `None` skips the unread messages but
/// still carries a trailing partial message over, the stream stays framed.
pub struct Feed<'a, 'd, F>
where
    F: FnMut(&[u8]) -> i64,
{
    defrag: &'a mut StreamDefragger<F>,
    data: &'d [u8],
    pos: usize,
    spilled: SpillState,
    reported: bool,
}

impl<'a, 'd, F> Feed<'a, 'd, F>
where
    F: FnMut(&[u8]) -> i64,
{
    /// Unscanned bytes of the fed span. After `InvalidHeader` this starts
    /// at the offending header.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Complete the spilled message from the front of the span.
    fn top_up(&mut self) {
        let d = &mut *self.defrag;
        let h = d.header_size;
        if d.spill.len() < h {
            let take = (h - d.spill.len()).min(self.data.len());
            d.spill.extend_from_slice(&self.data[..take]);
            self.pos = take;
            if d.spill.len() < h {
                return;
            }
            let decoded = (d.decode)(&d.spill[..h]);
            let Some(len) = d.check_len(decoded) else {
                // The bad header began in an earlier span
                self.pos = 0;
                return;
            };
            d.msg_len = len;
            d.spill.reserve(len - d.spill.len());
        }

        let need = d.msg_len - d.spill.len();
        let take = need.min(self.data.len() - self.pos);
        d.spill.extend_from_slice(&self.data[self.pos..self.pos + take]);
        self.pos += take;
        if d.spill.len() == d.msg_len {
            self.spilled = SpillState::Ready;
        }
    }

    /// The next message, `None` once the span is used up.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<Frame<'_>> {
        let d = &mut *self.defrag;
        if d.invalid {
            if self.reported {
                return None;
            }
            self.reported = true;
            return Some(Frame::InvalidHeader);
        }

        match self.spilled {
            SpillState::Ready => {
                self.spilled = SpillState::Returned;
                return Some(Frame::Message(&d.spill));
            }
            SpillState::Returned => {
                d.spill.clear();
                d.msg_len = 0;
                self.spilled = SpillState::None;
            }
            SpillState::None => {
                if !d.spill.is_empty() {
                    // Still incomplete, the whole span went into the spill
                    return None;
                }
            }
        }

        let data = self.data;
        let rest = &data[self.pos..];
        if rest.is_empty() {
            return None;
        }
        let h = d.header_size;
        if rest.len() < h {
            d.spill(rest, 0);
            self.pos = data.len();
            return None;
        }
        let decoded = (d.decode)(&rest[..h]);
        let len = match d.check_len(decoded) {
            Some(len) => len,
            None => {
                // `pos` stays at the bad header
                self.reported = true;
                return Some(Frame::InvalidHeader);
            }
        };
        if rest.len() < len {
            d.spill(rest, len);
            self.pos = data.len();
            return None;
        }
        let start = self.pos;
        self.pos += len;
        Some(Frame::Message(&data[start..start + len]))
    }
}

impl<'a, 'd, F> Drop for Feed<'a, 'd, F>
where
    F: FnMut(&[u8]) -> i64,
{
    fn drop(&mut self) {
        while self.next().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn be32(h: &[u8]) -> i64 {
        u32::from_be_bytes([h[0], h[1], h[2], h[3]]) as i64
    }

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut v = ((payload.len() + 4) as u32).to_be_bytes().to_vec();
        v.extend_from_slice(payload);
        v
    }

    fn collect<F: FnMut(&[u8]) -> i64>(d: &mut StreamDefragger<F>, data: &[u8]) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut feed = d.feed(data);
        while let Some(f) = feed.next() {
            match f {
                Frame::Message(m) => out.push(m.to_vec()),
                Frame::InvalidHeader => out.push(b"INVALID".to_vec()),
            }
        }
        out
    }

    #[test]
    fn test_whole_messages_are_views() {
        let mut wire = frame(b"one");
        wire.extend(frame(b"two"));
        let mut d = StreamDefragger::new(4, be32);
        let mut feed = d.feed(&wire);
        match feed.next() {
            Some(Frame::Message(m)) => {
                assert_eq!(&m[4..], b"one");
                assert_eq!(m.as_ptr(), wire.as_ptr());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(feed.next(), Some(Frame::Message(&wire[7..])));
        assert_eq!(feed.next(), None);
        assert_eq!(feed.remaining(), 0);
        drop(feed);
        assert_eq!(d.pending(), 0);
    }

    #[test]
    fn test_any_split_reassembles() {
        let mut wire = frame(b"hello");
        wire.extend(frame(&[7u8; 3000]));
        wire.extend(frame(b""));
        let expected = vec![frame(b"hello"), frame(&[7u8; 3000]), frame(b"")];

        for split in 0..=wire.len() {
            let mut d = StreamDefragger::new(4, be32);
            let mut got = collect(&mut d, &wire[..split]);
            got.extend(collect(&mut d, &wire[split..]));
            assert_eq!(got, expected, "split at {}", split);
            assert_eq!(d.pending(), 0);
        }
    }

    #[test]
    fn test_one_byte_at_a_time() {
        let mut wire = frame(b"abc");
        wire.extend(frame(b"defgh"));
        let mut d = StreamDefragger::new(4, be32);
        let mut got = Vec::new();
        for b in &wire {
            got.extend(collect(&mut d, std::slice::from_ref(b)));
        }
        assert_eq!(got, vec![frame(b"abc"), frame(b"defgh")]);
    }

    #[test]
    fn test_spill_keeps_minimum_capacity() {
        let wire = frame(b"xyz");
        let mut d = StreamDefragger::new(4, be32);
        assert!(collect(&mut d, &wire[..2]).is_empty());
        assert_eq!(d.pending(), 2);
        assert!(d.spill.capacity() >= DEFRAG_MIN_SPILL);
        assert_eq!(collect(&mut d, &wire[2..]), vec![wire.clone()]);
    }

    #[test]
    fn test_invalid_header_is_sticky() {
        let mut d = StreamDefragger::new(4, be32);
        // Length 2 is below the header size
        let bad = [0u8, 0, 0, 2, 1, 2, 3];
        assert_eq!(collect(&mut d, &bad), vec![b"INVALID".to_vec()]);
        assert!(d.is_invalid());
        assert_eq!(collect(&mut d, &frame(b"ok")), vec![b"INVALID".to_vec()]);
    }

    #[test]
    fn test_invalid_header_leaves_position() {
        let mut wire = frame(b"ok");
        wire.extend_from_slice(&[0, 0, 0, 0, 1, 2, 3, 4]);
        let mut d = StreamDefragger::new(4, be32);
        let mut feed = d.feed(&wire);
        assert_eq!(feed.next(), Some(Frame::Message(&wire[..6])));
        assert_eq!(feed.remaining(), 8);
        assert_eq!(feed.next(), Some(Frame::InvalidHeader));
        assert_eq!(feed.remaining(), 8);
        assert_eq!(feed.next(), None);
        assert_eq!(feed.remaining(), 8);
        drop(feed);

        // Later spans are reported once each and left untouched
        let mut feed = d.feed(&[9, 9, 9]);
        assert_eq!(feed.next(), Some(Frame::InvalidHeader));
        assert_eq!(feed.remaining(), 3);
        assert_eq!(feed.next(), None);
    }

    #[test]
    fn test_short_positive_length_is_invalid() {
        let mut d = StreamDefragger::new(4, |_| 2);
        let mut feed = d.feed(&[0, 0, 0, 2, 7]);
        assert_eq!(feed.next(), Some(Frame::InvalidHeader));
        assert_eq!(feed.remaining(), 5);
    }

    #[test]
    fn test_invalid_header_in_spill() {
        let mut d = StreamDefragger::new(4, |_| 0);
        assert!(collect(&mut d, &[0, 0]).is_empty());
        let mut feed = d.feed(&[0, 0, 9]);
        assert_eq!(feed.next(), Some(Frame::InvalidHeader));
        assert_eq!(feed.remaining(), 3);
        assert_eq!(feed.next(), None);
    }

    #[test]
    fn test_dropped_feed_keeps_stream_framed() {
        let mut wire = frame(b"first");
        wire.extend(frame(b"second"));
        let tail = frame(b"third");
        wire.extend_from_slice(&tail[..3]);

        let mut d = StreamDefragger::new(4, be32);
        {
            let mut feed = d.feed(&wire);
            assert!(matches!(feed.next(), Some(Frame::Message(_))));
            // "second" is skipped, the partial "third" is carried over
        }
        assert_eq!(d.pending(), 3);
        assert_eq!(collect(&mut d, &tail[3..]), vec![tail.clone()]);
    }

    #[test]
    fn test_header_only_message() {
        let mut d = StreamDefragger::new(2, |h| u16::from_le_bytes([h[0], h[1]]) as i64);
        let wire = [2u8, 0, 2, 0, 3, 0, 9];
        assert_eq!(
            collect(&mut d, &wire),
            vec![vec![2, 0], vec![2, 0], vec![3, 0, 9]]
        );
    }
}
