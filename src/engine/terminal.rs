//! Terminal query interception.
//!
//! Some programs probe the terminal (cursor position, background colour) and
//! block until a reply arrives. Commands here never run under a real terminal,
//! so the two known probes are answered with fixed replies and removed from the
//! text shown to the user.

/// `CSI 6 n`: device status report, cursor position.
pub const CURSOR_POSITION_QUERY: &[u8] = b"\x1b[6n";
pub const CURSOR_POSITION_REPLY: &[u8] = b"\x1b[1;1R";

/// `OSC 11 ; ? ST`: background colour query.
pub const BACKGROUND_COLOR_QUERY: &[u8] = b"\x1b]11;?\x1b\\";
pub const BACKGROUND_COLOR_REPLY: &[u8] = b"\x1b]11;rgb:0000/0000/0000\x1b\\";

const RULES: [(&[u8], &[u8]); 2] = [
    (CURSOR_POSITION_QUERY, CURSOR_POSITION_REPLY),
    (BACKGROUND_COLOR_QUERY, BACKGROUND_COLOR_REPLY),
];

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Filtered {
    pub cleaned: Vec<u8>,
    pub responses: Vec<&'static [u8]>,
}

/// Strip every complete query from `bytes` and collect the reply for each, in
/// the order the queries appeared.
pub fn filter_and_respond(bytes: &[u8]) -> Filtered {
    let mut out = Filtered {
        cleaned: Vec::with_capacity(bytes.len()),
        responses: Vec::new(),
    };
    let mut i = 0;
    while i < bytes.len() {
        match RULES.iter().find(|(query, _)| bytes[i..].starts_with(query)) {
            Some((query, reply)) => {
                out.responses.push(*reply);
                i += query.len();
            }
            None => {
                out.cleaned.push(bytes[i]);
                i += 1;
            }
        }
    }
    out
}

/// Streaming wrapper around [`filter_and_respond`] that holds back a trailing
/// partial query until the next chunk decides it.
#[derive(Debug, Default)]
pub struct QueryFilter {
    pending: Vec<u8>,
}

impl QueryFilter {
    pub fn feed(&mut self, chunk: &[u8]) -> Filtered {
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(chunk);
        let keep = partial_query_suffix(&buf);
        self.pending = buf.split_off(buf.len() - keep);
        filter_and_respond(&buf)
    }

    /// Release whatever is still held back; called at end of stream.
    pub fn flush(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }
}

/// Length of the longest suffix of `buf` that is a proper prefix of a query.
fn partial_query_suffix(buf: &[u8]) -> usize {
    let longest = RULES.iter().map(|(q, _)| q.len() - 1).max().unwrap_or(0);
    (1..=longest.min(buf.len()))
        .rev()
        .find(|&k| {
            let tail = &buf[buf.len() - k..];
            RULES
                .iter()
                .any(|(query, _)| query.len() > k && query.starts_with(tail))
        })
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_passes_through() {
        let f = filter_and_respond(b"hello\n\x1b[31mred\x1b[0m\n");
        assert_eq!(f.cleaned, b"hello\n\x1b[31mred\x1b[0m\n");
        assert!(f.responses.is_empty());
    }

    #[test]
    fn both_queries_are_stripped_and_answered_in_order() {
        let f = filter_and_respond(b"a\x1b]11;?\x1b\\b\x1b[6nc");
        assert_eq!(f.cleaned, b"abc");
        assert_eq!(
            f.responses,
            vec![BACKGROUND_COLOR_REPLY, CURSOR_POSITION_REPLY]
        );
    }

    #[test]
    fn query_split_across_chunks_is_still_caught() {
        let mut filter = QueryFilter::default();
        let first = filter.feed(b"ab\x1b[");
        assert_eq!(first.cleaned, b"ab");
        assert!(first.responses.is_empty());

        let second = filter.feed(b"6ncd");
        assert_eq!(second.cleaned, b"cd");
        assert_eq!(second.responses, vec![CURSOR_POSITION_REPLY]);
        assert!(filter.flush().is_empty());
    }

    #[test]
    fn osc_query_split_at_inner_escape() {
        let mut filter = QueryFilter::default();
        let first = filter.feed(b"x\x1b]11;?\x1b");
        assert_eq!(first.cleaned, b"x");
        let second = filter.feed(b"\\y");
        assert_eq!(second.cleaned, b"y");
        assert_eq!(second.responses, vec![BACKGROUND_COLOR_REPLY]);
    }

    #[test]
    fn held_prefix_that_never_completes_is_released() {
        let mut filter = QueryFilter::default();
        let first = filter.feed(b"done\x1b[6");
        assert_eq!(first.cleaned, b"done");
        let second = filter.feed(b"7m");
        assert_eq!(second.cleaned, b"\x1b[67m");

        let third = filter.feed(b"tail\x1b");
        assert_eq!(third.cleaned, b"tail");
        assert_eq!(filter.flush(), b"\x1b");
    }
}
