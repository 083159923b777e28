//! Render ANSI-colored traceback lines as HTML.
//!
//! IPython tracebacks arrive as a list of strings carrying SGR escape
//! sequences. Each line is fed through a `vte` parser: printed text is
//! HTML-escaped, SGR colors become inline-styled spans, and every other
//! control, CSI, OSC or ESC sequence is dropped. Lines are joined with `<br>`.

use std::fmt::Write as _;

use alacritty_terminal::vte::{Params, Parser, Perform};

/// xterm palette for the 16 named colors (30-37, 90-97 and their backgrounds).
const PALETTE: [&str; 16] = [
    "#000000", "#cd3131", "#0dbc79", "#e5e510", "#2472c8", "#bc3fbc", "#11a8cd", "#e5e5e5",
    "#666666", "#f14c4c", "#23d18b", "#f5f543", "#3b8eea", "#d670d6", "#29b8db", "#ffffff",
];

/// Escape text for inclusion in HTML element content or attribute values.
pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        push_escaped(&mut escaped, c);
    }
    escaped
}

fn push_escaped(out: &mut String, c: char) {
    match c {
        '&' => out.push_str("&amp;"),
        '<' => out.push_str("&lt;"),
        '>' => out.push_str("&gt;"),
        '"' => out.push_str("&quot;"),
        '\'' => out.push_str("&#39;"),
        _ => out.push(c),
    }
}

/// Render traceback lines into a single sanitized HTML fragment.
pub fn render_traceback(lines: &[String]) -> String {
    lines
        .iter()
        .flat_map(|entry| entry.split('\n'))
        .map(ansi_to_html)
        .collect::<Vec<_>>()
        .join("<br>")
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Style {
    fg: Option<String>,
    bg: Option<String>,
    bold: bool,
}

impl Style {
    fn is_plain(&self) -> bool {
        *self == Style::default()
    }

    fn css(&self) -> String {
        let mut css = String::new();
        if let Some(fg) = &self.fg {
            let _ = write!(css, "color:{};", fg);
        }
        if let Some(bg) = &self.bg {
            let _ = write!(css, "background-color:{};", bg);
        }
        if self.bold {
            css.push_str("font-weight:bold;");
        }
        css
    }

    /// Apply one SGR parameter list (`[0, 31]`, `[38, 5, 208]`, ...).
    fn apply(&mut self, codes: &[u16]) {
        if codes.is_empty() {
            *self = Style::default();
            return;
        }

        let mut iter = codes.iter().map(|&c| u32::from(c));
        while let Some(code) = iter.next() {
            match code {
                0 => *self = Style::default(),
                1 => self.bold = true,
                22 => self.bold = false,
                30..=37 => self.fg = Some(PALETTE[(code - 30) as usize].to_string()),
                90..=97 => self.fg = Some(PALETTE[(code - 90 + 8) as usize].to_string()),
                39 => self.fg = None,
                40..=47 => self.bg = Some(PALETTE[(code - 40) as usize].to_string()),
                100..=107 => self.bg = Some(PALETTE[(code - 100 + 8) as usize].to_string()),
                49 => self.bg = None,
                38 | 48 => {
                    let color = extended_color(&mut iter);
                    if code == 38 {
                        self.fg = color;
                    } else {
                        self.bg = color;
                    }
                }
                _ => {}
            }
        }
    }
}

/// Parse the tail of a `38;5;n` or `38;2;r;g;b` sequence.
fn extended_color(iter: &mut impl Iterator<Item = u32>) -> Option<String> {
    match iter.next()? {
        5 => {
            let idx = iter.next()?;
            Some(indexed_color(idx))
        }
        2 => {
            let (r, g, b) = (iter.next()?, iter.next()?, iter.next()?);
            Some(format!("#{:02x}{:02x}{:02x}", r.min(255), g.min(255), b.min(255)))
        }
        _ => None,
    }
}

/// Map a 256-color palette index to a hex color.
fn indexed_color(idx: u32) -> String {
    match idx {
        0..=15 => PALETTE[idx as usize].to_string(),
        16..=231 => {
            let i = idx - 16;
            let level = |v: u32| if v == 0 { 0 } else { 55 + v * 40 };
            format!(
                "#{:02x}{:02x}{:02x}",
                level(i / 36),
                level((i / 6) % 6),
                level(i % 6)
            )
        }
        _ => {
            let gray = 8 + (idx.min(255) - 232) * 10;
            format!("#{:02x}{:02x}{:02x}", gray, gray, gray)
        }
    }
}

/// Builds the HTML for one line as the parser walks it.
#[derive(Default)]
struct HtmlWriter {
    html: String,
    style: Style,
    span_open: bool,
}

impl HtmlWriter {
    fn set_style(&mut self, next: Style) {
        if next == self.style {
            return;
        }
        if self.span_open {
            self.html.push_str("</span>");
            self.span_open = false;
        }
        if !next.is_plain() {
            let _ = write!(self.html, "<span style=\"{}\">", next.css());
            self.span_open = true;
        }
        self.style = next;
    }

    fn finish(mut self) -> String {
        if self.span_open {
            self.html.push_str("</span>");
        }
        self.html
    }
}

impl Perform for HtmlWriter {
    fn print(&mut self, c: char) {
        push_escaped(&mut self.html, c);
    }

    fn execute(&mut self, byte: u8) {
        if byte == b'\t' {
            self.html.push('\t');
        }
    }

    fn csi_dispatch(&mut self, params: &Params, intermediates: &[u8], ignore: bool, action: char) {
        if action != 'm' || ignore || !intermediates.is_empty() {
            return;
        }
        // Colon sub-parameters (`38:2:r:g:b`) flatten to the same sequence.
        let codes: Vec<u16> = params.iter().flatten().copied().collect();
        let mut next = self.style.clone();
        next.apply(&codes);
        self.set_style(next);
    }
}

fn ansi_to_html(line: &str) -> String {
    let mut parser = Parser::new();
    let mut writer = HtmlWriter {
        html: String::with_capacity(line.len()),
        ..Default::default()
    };
    parser.advance(&mut writer, line.as_bytes());
    writer.finish()
}
