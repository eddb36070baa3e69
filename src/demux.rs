use tracing::debug;

/// Tag name of tool-call blocks, `<tool_call>...</tool_call>`.
pub const TOOL_CALL_TAG: &str = "tool_call";

/// Reasoning tags recognized by [`TagDemux::new`].
pub const DEFAULT_REASONING_TAGS: &[&str] = &["think", "thinking", "reasoning", "thought"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarkerKind {
    Reasoning,
    ToolCall,
}

#[derive(Debug, Clone)]
struct Marker {
    tag: String,
    open: String,
    close: String,
    kind: MarkerKind,
}

impl Marker {
    fn new(tag: &str, kind: MarkerKind) -> Self {
        let tag = tag.to_ascii_lowercase();
        Self {
            open: format!("<{tag}>"),
            close: format!("</{tag}>"),
            tag,
            kind,
        }
    }
}

/// What the demultiplexer is currently inside of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Text,
    Think,
    ToolCall,
}

/// A classified span. Markers themselves are consumed; every other byte of
/// input ends up in exactly one `Content`, `Think` or `ToolCall` segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Content(String),
    ThinkStart { tag: String },
    Think { tag: String, text: String },
    ThinkEnd { tag: String },
    ToolCallStart,
    /// Interior of a tool-call block. Not meant for display.
    ToolCall(String),
    ToolCallEnd,
}

/// Streaming tag demultiplexer. One instance per model response.
///
/// Markers are matched case-insensitively against a table, so a reasoning tag
/// synonym is a table entry. Any buffer suffix that could still grow into a
/// marker is held back until the next `push`, which keeps the output
/// independent of chunk boundaries.
#[derive(Debug, Clone)]
pub struct TagDemux {
    markers: Vec<Marker>,
    max_marker_len: usize,
    mode: Mode,
    buffer: String,
    active: Option<usize>,
}

impl TagDemux {
    pub fn new() -> Self {
        Self::with_reasoning_tags(DEFAULT_REASONING_TAGS)
    }

    /// Build a demultiplexer recognizing the given reasoning tags in addition
    /// to `<tool_call>`.
    pub fn with_reasoning_tags<S: AsRef<str>>(tags: &[S]) -> Self {
        let mut markers: Vec<Marker> = tags
            .iter()
            .map(|t| Marker::new(t.as_ref(), MarkerKind::Reasoning))
            .collect();
        markers.push(Marker::new(TOOL_CALL_TAG, MarkerKind::ToolCall));

        let max_marker_len = markers
            .iter()
            .map(|m| m.open.len().max(m.close.len()))
            .max()
            .unwrap_or(0);

        Self {
            markers,
            max_marker_len,
            mode: Mode::Text,
            buffer: String::new(),
            active: None,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Tag name of the open reasoning span, if any.
    pub fn think_tag(&self) -> Option<&str> {
        match (self.mode, self.active) {
            (Mode::Think, Some(i)) => Some(self.markers[i].tag.as_str()),
            _ => None,
        }
    }

    /// Length of the longest recognized marker.
    pub fn max_marker_len(&self) -> usize {
        self.max_marker_len
    }

    /// Bytes currently held back waiting for more input.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Feed the next chunk and return every span that can be decided now.
    pub fn push(&mut self, text: &str) -> Vec<Segment> {
        self.buffer.push_str(text);
        let mut out = Vec::new();
        while self.step(&mut out) {}
        out
    }

    /// End of input: emit whatever is buffered as part of the current span
    /// and close it. The demultiplexer is back in `Text` mode afterwards.
    pub fn flush(&mut self) -> Vec<Segment> {
        let rest = std::mem::take(&mut self.buffer);
        let mut out = Vec::new();
        match self.mode {
            Mode::Text => {
                if !rest.is_empty() {
                    out.push(Segment::Content(rest));
                }
            }
            Mode::Think => {
                let tag = self.active_tag();
                debug!(tag = %tag, "flushing unterminated reasoning span");
                if !rest.is_empty() {
                    out.push(Segment::Think {
                        tag: tag.clone(),
                        text: rest,
                    });
                }
                out.push(Segment::ThinkEnd { tag });
            }
            Mode::ToolCall => {
                debug!("flushing unterminated tool-call span");
                if !rest.is_empty() {
                    out.push(Segment::ToolCall(rest));
                }
                out.push(Segment::ToolCallEnd);
            }
        }
        self.mode = Mode::Text;
        self.active = None;
        out
    }

    /// One pass of the state machine. Returns true when a marker was consumed
    /// and the remaining buffer must be examined again.
    fn step(&mut self, out: &mut Vec<Segment>) -> bool {
        let lower = self.buffer.to_ascii_lowercase();

        match self.mode {
            Mode::Text => {
                let found = self
                    .markers
                    .iter()
                    .enumerate()
                    .filter_map(|(i, m)| lower.find(&m.open).map(|pos| (pos, i)))
                    .min();

                match found {
                    Some((pos, i)) => {
                        if pos > 0 {
                            out.push(Segment::Content(self.buffer[..pos].to_string()));
                        }
                        self.buffer.drain(..pos + self.markers[i].open.len());
                        self.active = Some(i);
                        match self.markers[i].kind {
                            MarkerKind::Reasoning => {
                                self.mode = Mode::Think;
                                out.push(Segment::ThinkStart {
                                    tag: self.markers[i].tag.clone(),
                                });
                            }
                            MarkerKind::ToolCall => {
                                self.mode = Mode::ToolCall;
                                out.push(Segment::ToolCallStart);
                            }
                        }
                        true
                    }
                    None => {
                        let keep = held_tail_len(&lower, self.markers.iter().map(|m| m.open.as_str()));
                        if let Some(text) = self.take_prefix(keep) {
                            out.push(Segment::Content(text));
                        }
                        false
                    }
                }
            }
            Mode::Think | Mode::ToolCall => {
                let Some(i) = self.active else {
                    self.mode = Mode::Text;
                    return true;
                };
                let close = self.markers[i].close.clone();
                let tag = self.markers[i].tag.clone();

                match lower.find(&close) {
                    Some(pos) => {
                        let interior = self.buffer[..pos].to_string();
                        self.buffer.drain(..pos + close.len());
                        if self.mode == Mode::Think {
                            if !interior.is_empty() {
                                out.push(Segment::Think {
                                    tag: tag.clone(),
                                    text: interior,
                                });
                            }
                            out.push(Segment::ThinkEnd { tag });
                        } else {
                            if !interior.is_empty() {
                                out.push(Segment::ToolCall(interior));
                            }
                            out.push(Segment::ToolCallEnd);
                        }
                        self.mode = Mode::Text;
                        self.active = None;
                        true
                    }
                    None => {
                        let keep = held_tail_len(&lower, std::iter::once(close.as_str()));
                        if let Some(text) = self.take_prefix(keep) {
                            if self.mode == Mode::Think {
                                out.push(Segment::Think { tag, text });
                            } else {
                                out.push(Segment::ToolCall(text));
                            }
                        }
                        false
                    }
                }
            }
        }
    }

    /// Remove and return everything except the last `keep` bytes.
    fn take_prefix(&mut self, keep: usize) -> Option<String> {
        let cut = self.buffer.len() - keep;
        if cut == 0 {
            return None;
        }
        Some(self.buffer.drain(..cut).collect())
    }

    fn active_tag(&self) -> String {
        self.active
            .map(|i| self.markers[i].tag.clone())
            .unwrap_or_default()
    }
}

impl Default for TagDemux {
    fn default() -> Self {
        Self::new()
    }
}

/// Length of the longest suffix of `haystack` that is a proper prefix of one
/// of `markers`. Bounded by the longest marker length minus one.
fn held_tail_len<'a>(haystack: &str, markers: impl Iterator<Item = &'a str> + Clone) -> usize {
    let longest = markers.clone().map(str::len).max().unwrap_or(0);
    let upper = longest.saturating_sub(1).min(haystack.len());

    for k in (1..=upper).rev() {
        let start = haystack.len() - k;
        if !haystack.is_char_boundary(start) {
            continue;
        }
        let tail = &haystack[start..];
        if markers.clone().any(|m| m.len() > k && m.starts_with(tail)) {
            return k;
        }
    }
    0
}

/// Classify a complete text in one go.
pub fn classify(text: &str) -> Vec<Segment> {
    let mut demux = TagDemux::new();
    let mut out = demux.push(text);
    out.extend(demux.flush());
    out
}

/// Answer text only: reasoning spans and tool-call blocks removed.
pub fn strip_reasoning(text: &str) -> String {
    classify(text)
        .into_iter()
        .filter_map(|s| match s {
            Segment::Content(c) => Some(c),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Merge adjacent text segments of the same kind so that emissions from
    /// differently chunked input can be compared.
    fn coalesce(segments: Vec<Segment>) -> Vec<Segment> {
        let mut out: Vec<Segment> = Vec::new();
        for seg in segments {
            let merged = match (out.last_mut(), &seg) {
                (Some(Segment::Content(prev)), Segment::Content(next)) => {
                    prev.push_str(next);
                    true
                }
                (Some(Segment::ToolCall(prev)), Segment::ToolCall(next)) => {
                    prev.push_str(next);
                    true
                }
                (
                    Some(Segment::Think { tag: prev_tag, text: prev }),
                    Segment::Think { tag, text },
                ) if prev_tag == tag => {
                    prev.push_str(text);
                    true
                }
                _ => false,
            };
            if !merged {
                out.push(seg);
            }
        }
        out
    }

    fn run_chunks(chunks: &[&str]) -> Vec<Segment> {
        let mut demux = TagDemux::new();
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend(demux.push(chunk));
        }
        out.extend(demux.flush());
        coalesce(out)
    }

    fn think(text: &str) -> Segment {
        Segment::Think {
            tag: "think".into(),
            text: text.into(),
        }
    }

    fn content(text: &str) -> Segment {
        Segment::Content(text.into())
    }

    #[test]
    fn think_then_content_whole() {
        let got = run_chunks(&["<think>A</think>B"]);
        assert_eq!(
            got,
            vec![
                Segment::ThinkStart { tag: "think".into() },
                think("A"),
                Segment::ThinkEnd { tag: "think".into() },
                content("B"),
            ]
        );
    }

    #[test]
    fn markers_split_across_chunks() {
        let whole = run_chunks(&["<think>A</think>B"]);
        let split = run_chunks(&["<th", "ink>A</th", "ink>B"]);
        assert_eq!(whole, split);
    }

    #[test]
    fn every_two_way_split_matches_whole() {
        let inputs = [
            "Hello <think>pondering</think> world",
            "pre <tool_call>{\"name\":\"x\"}</tool_call> post",
            "a < b and <THINKING>Deep</Thinking>done",
            "x<reasoning>r</reasoning><thought>t</thought>y",
            "<<think>>a</think>>",
        ];
        for input in inputs {
            let whole = run_chunks(&[input]);
            for (i, _) in input.char_indices().skip(1) {
                let split = run_chunks(&[&input[..i], &input[i..]]);
                assert_eq!(whole, split, "split at {i} of {input:?}");
            }
        }
    }

    #[test]
    fn char_by_char_matches_whole() {
        let input = "héllo <think>ünïcode 思考</think>答え <tool_call>{}</tool_call>!";
        let whole = run_chunks(&[input]);
        let chars: Vec<String> = input.chars().map(String::from).collect();
        let refs: Vec<&str> = chars.iter().map(String::as_str).collect();
        assert_eq!(whole, run_chunks(&refs));
        assert_eq!(strip_reasoning(input), "héllo 答え !");
    }

    #[test]
    fn markers_are_case_insensitive() {
        let got = run_chunks(&["<THINK>x</Think>y"]);
        assert_eq!(got[1], think("x"));
        assert_eq!(got[3], content("y"));
    }

    #[test]
    fn end_marker_must_match_open_tag() {
        let got = run_chunks(&["<thinking>a</think>b</thinking>c"]);
        assert_eq!(
            got,
            vec![
                Segment::ThinkStart {
                    tag: "thinking".into()
                },
                Segment::Think {
                    tag: "thinking".into(),
                    text: "a</think>b".into()
                },
                Segment::ThinkEnd {
                    tag: "thinking".into()
                },
                content("c"),
            ]
        );
    }

    #[test]
    fn tool_call_interior_never_becomes_content() {
        let got = run_chunks(&["before<tool_call>{\"name\":\"f\"}</tool_call>after"]);
        assert_eq!(
            got,
            vec![
                content("before"),
                Segment::ToolCallStart,
                Segment::ToolCall("{\"name\":\"f\"}".into()),
                Segment::ToolCallEnd,
                content("after"),
            ]
        );
    }

    #[test]
    fn earliest_marker_wins() {
        let got = run_chunks(&["<tool_call>x</tool_call><think>y</think>"]);
        assert_eq!(got[0], Segment::ToolCallStart);
        assert_eq!(got[3], Segment::ThinkStart { tag: "think".into() });
    }

    #[test]
    fn buffer_bounded_in_text_mode() {
        let mut demux = TagDemux::new();
        let limit = demux.max_marker_len() - 1;
        for chunk in ["plain text ", "with < angle", " brackets <", "thi", "nkin"] {
            demux.push(chunk);
            assert_eq!(demux.mode(), Mode::Text);
            assert!(demux.buffered_len() <= limit, "buffered {}", demux.buffered_len());
        }
        // "<thinkin" could still become "<thinking>"
        assert_eq!(demux.buffered_len(), "<thinkin".len());
    }

    #[test]
    fn lone_angle_bracket_is_literal() {
        let mut demux = TagDemux::new();
        assert_eq!(demux.push("a <b> c"), vec![content("a <b> c")]);
        assert_eq!(demux.push("x<"), vec![content("x")]);
        assert_eq!(demux.flush(), vec![content("<")]);
    }

    #[test]
    fn flush_emits_unterminated_spans() {
        let mut demux = TagDemux::new();
        let mut out = demux.push("<think>half a thought");
        assert_eq!(demux.think_tag(), Some("think"));
        out.extend(demux.flush());
        let out = coalesce(out);
        assert_eq!(out[1], think("half a thought"));
        assert_eq!(out[2], Segment::ThinkEnd { tag: "think".into() });
        assert_eq!(demux.mode(), Mode::Text);

        let out = coalesce({
            let mut v = demux.push("<tool_call>{\"name\"");
            v.extend(demux.flush());
            v
        });
        assert_eq!(out[1], Segment::ToolCall("{\"name\"".into()));
        assert_eq!(out[2], Segment::ToolCallEnd);
    }

    #[test]
    fn custom_reasoning_tags() {
        let mut demux = TagDemux::with_reasoning_tags(&["scratchpad"]);
        let mut out = demux.push("<scratchpad>s</scratchpad><think>t</think>");
        out.extend(demux.flush());
        let out = coalesce(out);
        assert_eq!(
            out[1],
            Segment::Think {
                tag: "scratchpad".into(),
                text: "s".into()
            }
        );
        // "think" is not in this table
        assert_eq!(out[3], content("<think>t</think>"));
    }

    #[test]
    fn strip_reasoning_keeps_only_answer() {
        assert_eq!(
            strip_reasoning("<think>plan</think>It's 18°C.<tool_call>{}</tool_call>"),
            "It's 18°C."
        );
        assert_eq!(strip_reasoning("no markup"), "no markup");
    }
}
