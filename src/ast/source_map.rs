use super::Span;

/// Maps byte offsets to line/column positions within source text.
pub struct SourceMap {
    line_starts: Vec<usize>,
}

impl SourceMap {
    pub fn new(source: &str) -> Self {
        let line_starts = std::iter::once(0)
            .chain(source.match_indices('\n').map(|(i, _)| i + 1))
            .collect();
        SourceMap { line_starts }
    }

    /// Returns (line, col), both 1-based.
    pub fn lookup(&self, offset: usize) -> (usize, usize) {
        let line = match self.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i.saturating_sub(1),
        };
        (line + 1, offset.saturating_sub(self.line_starts[line]) + 1)
    }

    /// `line:col` of the start of `span`.
    pub fn location(&self, span: Span) -> String {
        let (line, col) = self.lookup(span.start);
        format!("{}:{}", line, col)
    }

    /// Returns the full text of the given 1-based line number, without its line ending.
    pub fn line_text<'a>(&self, source: &'a str, line: usize) -> &'a str {
        if line == 0 || line > self.line_starts.len() {
            return "";
        }
        let start = self.line_starts[line - 1];
        let end = self.line_starts.get(line).copied().unwrap_or(source.len());
        source[start..end].trim_end_matches(['\n', '\r'])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_on_route_header() {
        let src = "@ GET /test { > 1 }";
        let sm = SourceMap::new(src);
        assert_eq!(sm.lookup(0), (1, 1));
        assert_eq!(sm.lookup(6), (1, 7));
    }

    #[test]
    fn lookup_across_lines() {
        let src = "@ ws /chat {\n  on connect {\n  }\n}";
        let sm = SourceMap::new(src);
        assert_eq!(sm.lookup(12), (1, 13)); // newline after `{`
        assert_eq!(sm.lookup(13), (2, 1));
        assert_eq!(sm.lookup(15), (2, 3)); // `on`
        assert_eq!(sm.location(Span::new(15, 17)), "2:3");
    }

    #[test]
    fn line_text_strips_crlf() {
        let src = "$ a = 1\r\n$ b = 2\r\n";
        let sm = SourceMap::new(src);
        assert_eq!(sm.line_text(src, 1), "$ a = 1");
        assert_eq!(sm.line_text(src, 2), "$ b = 2");
        assert_eq!(sm.line_text(src, 3), "");
    }

    #[test]
    fn line_text_out_of_bounds() {
        let src = "> 1";
        let sm = SourceMap::new(src);
        assert_eq!(sm.line_text(src, 0), "");
        assert_eq!(sm.line_text(src, 9), "");
    }

    #[test]
    fn empty_source() {
        let sm = SourceMap::new("");
        assert_eq!(sm.lookup(0), (1, 1));
        assert_eq!(sm.line_text("", 1), "");
    }
}
