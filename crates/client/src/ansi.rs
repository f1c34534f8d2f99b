//! ANSI escape-sequence renderer.
//!
//! Interprets SGR (Select Graphic Rendition) sequences into styled text
//! spans: standard colors (30-37, 90-97), 256-color mode (38;5;n), true
//! color (38;2;r;g;b), and bold/dim/italic/underline. All other CSI
//! sequences (cursor movement, erase) are consumed and dropped. Style state
//! threads across calls so a fragment boundary never loses attributes, and
//! an escape sequence cut off at the end of a fragment is handed back to
//! the caller for re-feeding with the next chunk.

/// Foreground color of a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    /// The terminal's default foreground.
    Default,
    /// A concrete 24-bit color.
    Rgb(u8, u8, u8),
}

/// Text attributes applied to a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Style {
    pub color: Color,
    pub bold: bool,
    pub dim: bool,
    pub italic: bool,
    pub underline: bool,
}

impl Default for Style {
    fn default() -> Self {
        Self {
            color: Color::Default,
            bold: false,
            dim: false,
            italic: false,
            underline: false,
        }
    }
}

/// A run of text rendered with one style.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    pub text: String,
    pub style: Style,
}

/// Output of one [`AnsiParser::feed`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parsed {
    /// Styled runs in input order. Adjacent runs always differ in style.
    pub spans: Vec<Span>,
    /// Unconsumed tail of an escape sequence cut off by the fragment
    /// boundary. Prepend it to the next fragment.
    pub remainder: String,
}

/// Stateful SGR interpreter.
#[derive(Debug, Default)]
pub struct AnsiParser {
    style: Style,
}

impl AnsiParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current style, as left by the last fragment.
    pub fn style(&self) -> Style {
        self.style
    }

    /// Drop all carried style state.
    pub fn reset(&mut self) {
        self.style = Style::default();
    }

    /// Interpret one fragment of terminal output.
    pub fn feed(&mut self, input: &str) -> Parsed {
        let mut spans = Vec::new();
        let mut text = String::new();
        let chars: Vec<char> = input.chars().collect();
        let mut i = 0;

        while i < chars.len() {
            if chars[i] != '\u{1b}' {
                text.push(chars[i]);
                i += 1;
                continue;
            }

            // ESC as the last character: an incomplete sequence.
            if i + 1 >= chars.len() {
                return self.finish(spans, text, chars[i..].iter().collect());
            }

            if chars[i + 1] != '[' {
                // Malformed introducer: drop the ESC alone, the next
                // character is plain text.
                i += 1;
                continue;
            }

            // CSI: scan parameter characters up to the terminating letter.
            match scan_csi(&chars, i + 2) {
                CsiScan::Complete { end, terminator } => {
                    if terminator == 'm' {
                        let params: String = chars[i + 2..end].iter().collect();
                        let new_style = apply_sgr(self.style, &params);
                        if new_style != self.style {
                            flush(&mut spans, &mut text, self.style);
                            self.style = new_style;
                        }
                    }
                    // Other terminators: sequence dropped, style untouched.
                    i = end + 1;
                }
                CsiScan::Truncated => {
                    return self.finish(spans, text, chars[i..].iter().collect());
                }
                CsiScan::Malformed => {
                    // Drop the ESC alone and rescan from the '['.
                    i += 1;
                }
            }
        }

        self.finish(spans, text, String::new())
    }

    fn finish(&self, mut spans: Vec<Span>, text: String, remainder: String) -> Parsed {
        let mut text = text;
        flush(&mut spans, &mut text, self.style);
        Parsed { spans, remainder }
    }
}

fn flush(spans: &mut Vec<Span>, text: &mut String, style: Style) {
    if text.is_empty() {
        return;
    }
    spans.push(Span {
        text: std::mem::take(text),
        style,
    });
}

enum CsiScan {
    Complete { end: usize, terminator: char },
    Truncated,
    Malformed,
}

fn scan_csi(chars: &[char], start: usize) -> CsiScan {
    let mut i = start;
    while i < chars.len() {
        let ch = chars[i];
        if ch.is_ascii_alphabetic() {
            return CsiScan::Complete {
                end: i,
                terminator: ch,
            };
        }
        if !ch.is_ascii_digit() && ch != ';' {
            return CsiScan::Malformed;
        }
        i += 1;
    }
    CsiScan::Truncated
}

/// Apply one SGR parameter string to a style. An empty string means reset.
fn apply_sgr(mut style: Style, params: &str) -> Style {
    let codes: Vec<u32> = params
        .split(';')
        .map(|p| p.parse().unwrap_or(0))
        .collect();

    let mut i = 0;
    while i < codes.len() {
        match codes[i] {
            0 => style = Style::default(),
            1 => style.bold = true,
            2 => style.dim = true,
            3 => style.italic = true,
            4 => style.underline = true,
            22 => {
                style.bold = false;
                style.dim = false;
            }
            23 => style.italic = false,
            24 => style.underline = false,

            n @ 30..=37 => style.color = standard_color((n - 30) as usize),
            n @ 90..=97 => style.color = standard_color((n - 90 + 8) as usize),
            39 => style.color = Color::Default,

            38 => {
                // Extended foreground: 38;5;n or 38;2;r;g;b.
                if let Some((color, consumed)) = extended_color(&codes[i + 1..]) {
                    style.color = color;
                    i += consumed;
                }
            }
            48 => {
                // Extended background: consumed so its parameters are not
                // misread as attribute codes, then ignored.
                if let Some((_, consumed)) = extended_color(&codes[i + 1..]) {
                    i += consumed;
                }
            }

            // Simple background colors ignored.
            40..=47 | 49 | 100..=107 => {}

            _ => {}
        }
        i += 1;
    }
    style
}

/// Decode the tail of a 38/48 extended-color code. Returns the color and
/// how many parameters were consumed.
fn extended_color(rest: &[u32]) -> Option<(Color, usize)> {
    match rest.first()? {
        5 => {
            let index = *rest.get(1)?;
            Some((palette_256(index.min(255) as u8), 2))
        }
        2 => {
            let r = *rest.get(1)?;
            let g = *rest.get(2)?;
            let b = *rest.get(3)?;
            Some((
                Color::Rgb(r.min(255) as u8, g.min(255) as u8, b.min(255) as u8),
                4,
            ))
        }
        _ => None,
    }
}

/// The 16 standard colors (0-7 normal, 8-15 bright).
fn standard_color(index: usize) -> Color {
    const TABLE: [(u8, u8, u8); 16] = [
        (0, 0, 0),       // black
        (205, 49, 49),   // red
        (13, 188, 121),  // green
        (229, 229, 16),  // yellow
        (36, 114, 200),  // blue
        (188, 63, 188),  // magenta
        (17, 168, 205),  // cyan
        (229, 229, 229), // white
        (128, 128, 128), // bright black
        (230, 102, 102), // bright red
        (102, 230, 102), // bright green
        (230, 230, 102), // bright yellow
        (102, 102, 230), // bright blue
        (204, 102, 230), // bright magenta
        (102, 230, 230), // bright cyan
        (255, 255, 255), // bright white
    ];
    let (r, g, b) = TABLE[index.min(15)];
    Color::Rgb(r, g, b)
}

/// Map a 256-color palette index to RGB: the 16 standard colors, a 6x6x6
/// cube, then a 24-step grayscale ramp.
fn palette_256(index: u8) -> Color {
    match index {
        0..=15 => standard_color(index as usize),
        16..=231 => {
            let idx = (index - 16) as u32;
            let r = idx / 36;
            let g = (idx % 36) / 6;
            let b = idx % 6;
            let scale = |c: u32| -> u8 {
                if c == 0 {
                    0
                } else {
                    (55 + 40 * c) as u8
                }
            };
            Color::Rgb(scale(r), scale(g), scale(b))
        }
        232..=255 => {
            let gray = 8 + 10 * (index as u32 - 232);
            Color::Rgb(gray as u8, gray as u8, gray as u8)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn red() -> Color {
        Color::Rgb(205, 49, 49)
    }

    #[test]
    fn test_plain_text_single_default_span() {
        let mut parser = AnsiParser::new();
        let parsed = parser.feed("hello world");
        assert_eq!(parsed.spans.len(), 1);
        assert_eq!(parsed.spans[0].text, "hello world");
        assert_eq!(parsed.spans[0].style, Style::default());
        assert!(parsed.remainder.is_empty());
    }

    #[test]
    fn test_empty_input_no_spans() {
        let mut parser = AnsiParser::new();
        let parsed = parser.feed("");
        assert!(parsed.spans.is_empty());
        assert!(parsed.remainder.is_empty());
    }

    #[test]
    fn test_standard_foreground_colors() {
        let mut parser = AnsiParser::new();
        let parsed = parser.feed("\x1b[31mred\x1b[32mgreen");
        assert_eq!(parsed.spans.len(), 2);
        assert_eq!(parsed.spans[0].text, "red");
        assert_eq!(parsed.spans[0].style.color, red());
        assert_eq!(parsed.spans[1].text, "green");
        assert_eq!(parsed.spans[1].style.color, Color::Rgb(13, 188, 121));
    }

    #[test]
    fn test_bright_foreground_colors() {
        let mut parser = AnsiParser::new();
        let parsed = parser.feed("\x1b[90mgray\x1b[97mwhite");
        assert_eq!(parsed.spans[0].style.color, Color::Rgb(128, 128, 128));
        assert_eq!(parsed.spans[1].style.color, Color::Rgb(255, 255, 255));
    }

    #[test]
    fn test_reset_restores_defaults() {
        let mut parser = AnsiParser::new();
        let parsed = parser.feed("\x1b[1;31mbold red\x1b[0mplain");
        assert_eq!(parsed.spans.len(), 2);
        assert!(parsed.spans[0].style.bold);
        assert_eq!(parsed.spans[0].style.color, red());
        assert_eq!(parsed.spans[1].style, Style::default());
    }

    #[test]
    fn test_empty_sgr_is_reset() {
        let mut parser = AnsiParser::new();
        let parsed = parser.feed("\x1b[31mred\x1b[mplain");
        assert_eq!(parsed.spans[1].style, Style::default());
    }

    #[test]
    fn test_attribute_flags() {
        let mut parser = AnsiParser::new();
        let parsed = parser.feed("\x1b[1;2;3;4mall");
        let style = parsed.spans[0].style;
        assert!(style.bold && style.dim && style.italic && style.underline);

        let parsed = parser.feed("\x1b[22;23;24mnone");
        let style = parsed.spans[0].style;
        assert!(!style.bold && !style.dim && !style.italic && !style.underline);
    }

    #[test]
    fn test_default_foreground_code_39() {
        let mut parser = AnsiParser::new();
        let parsed = parser.feed("\x1b[31mred\x1b[39mdefault");
        assert_eq!(parsed.spans[1].style.color, Color::Default);
    }

    #[test]
    fn test_256_palette_mirrors_standard_colors() {
        let mut parser = AnsiParser::new();
        for i in 0u8..16 {
            let parsed = parser.feed(&format!("\x1b[38;5;{i}mx"));
            assert_eq!(
                parsed.spans[0].style.color,
                standard_color(i as usize),
                "index {i}"
            );
        }
    }

    #[test]
    fn test_256_palette_color_cube() {
        // 196 = 16 + 36*5: pure red corner of the cube.
        assert_eq!(palette_256(196), Color::Rgb(255, 0, 0));
        // 16: the black corner.
        assert_eq!(palette_256(16), Color::Rgb(0, 0, 0));
        // 231: the white corner.
        assert_eq!(palette_256(231), Color::Rgb(255, 255, 255));
        // 17: one step of blue, scaled 55 + 40.
        assert_eq!(palette_256(17), Color::Rgb(0, 0, 95));
    }

    #[test]
    fn test_256_palette_grayscale_ramp() {
        assert_eq!(palette_256(232), Color::Rgb(8, 8, 8));
        assert_eq!(palette_256(243), Color::Rgb(118, 118, 118));
        assert_eq!(palette_256(255), Color::Rgb(238, 238, 238));
    }

    #[test]
    fn test_truecolor_foreground() {
        let mut parser = AnsiParser::new();
        let parsed = parser.feed("\x1b[38;2;12;200;255mx");
        assert_eq!(parsed.spans[0].style.color, Color::Rgb(12, 200, 255));
    }

    #[test]
    fn test_background_codes_consumed_and_ignored() {
        let mut parser = AnsiParser::new();
        let parsed = parser.feed("\x1b[41mx\x1b[48;5;196my\x1b[48;2;1;2;3mz");
        // One span: no style ever changed.
        assert_eq!(parsed.spans.len(), 1);
        assert_eq!(parsed.spans[0].text, "xyz");
        assert_eq!(parsed.spans[0].style, Style::default());
    }

    #[test]
    fn test_extended_background_params_not_misread() {
        // 48;5;2: the 2 must not be read as "dim".
        let mut parser = AnsiParser::new();
        let parsed = parser.feed("\x1b[48;5;2mx");
        assert!(!parsed.spans[0].style.dim);
    }

    #[test]
    fn test_non_sgr_sequences_dropped() {
        let mut parser = AnsiParser::new();
        let parsed = parser.feed("a\x1b[2Jb\x1b[Hc\x1b[10;20Hd");
        assert_eq!(parsed.spans.len(), 1);
        assert_eq!(parsed.spans[0].text, "abcd");
    }

    #[test]
    fn test_malformed_introducer_drops_esc_only() {
        let mut parser = AnsiParser::new();
        let parsed = parser.feed("a\x1b(b");
        assert_eq!(parsed.spans.len(), 1);
        assert_eq!(parsed.spans[0].text, "a(b");
    }

    #[test]
    fn test_unterminated_sequence_returned_as_remainder() {
        let mut parser = AnsiParser::new();
        let parsed = parser.feed("before\x1b[38;5;1");
        assert_eq!(parsed.spans.len(), 1);
        assert_eq!(parsed.spans[0].text, "before");
        assert_eq!(parsed.remainder, "\x1b[38;5;1");
    }

    #[test]
    fn test_lone_esc_at_end_returned_as_remainder() {
        let mut parser = AnsiParser::new();
        let parsed = parser.feed("text\x1b");
        assert_eq!(parsed.spans[0].text, "text");
        assert_eq!(parsed.remainder, "\x1b");
    }

    #[test]
    fn test_split_sequence_across_fragments() {
        let mut parser = AnsiParser::new();
        let first = parser.feed("ok\x1b[3");
        assert_eq!(first.remainder, "\x1b[3");

        // The caller re-feeds remainder + next fragment.
        let input = format!("{}{}", first.remainder, "1mred");
        let second = parser.feed(&input);
        assert_eq!(second.spans.len(), 1);
        assert_eq!(second.spans[0].text, "red");
        assert_eq!(second.spans[0].style.color, red());
        assert!(second.remainder.is_empty());
    }

    #[test]
    fn test_style_persists_across_fragments() {
        let mut parser = AnsiParser::new();
        parser.feed("\x1b[31m");
        let parsed = parser.feed("still red");
        assert_eq!(parsed.spans[0].style.color, red());
    }

    #[test]
    fn test_reset_clears_carried_style() {
        let mut parser = AnsiParser::new();
        parser.feed("\x1b[1;31m");
        parser.reset();
        let parsed = parser.feed("plain");
        assert_eq!(parsed.spans[0].style, Style::default());
    }

    #[test]
    fn test_same_style_sgr_does_not_split_span() {
        let mut parser = AnsiParser::new();
        let parsed = parser.feed("\x1b[31mab\x1b[31mcd");
        assert_eq!(parsed.spans.len(), 1);
        assert_eq!(parsed.spans[0].text, "abcd");
    }
}
