// # Output Formatting
//
// A small state machine over printf-like template strings. Every call site
// passes a whitelist of the directives that make sense for it; directives
// outside the whitelist emit nothing, unavailable data emits nothing, and
// unknown `%` sequences print literally.

use crate::config::Settings;
use crate::engine::{DimMap, Forest};
use chrono::{Local, TimeZone};
use std::io::{self, Write};

/// Everything one output line may refer to. Fields that a call site cannot
/// provide stay `None` and their directives print nothing.
pub struct RecordView<'a> {
    pub score: f64,
    pub line_no: usize,
    pub forest: Option<&'a Forest>,
    pub values: Option<&'a [String]>,
    pub dimension: Option<&'a [f64]>,
}

pub struct Printer<'a> {
    pub settings: &'a Settings,
    pub dims: &'a DimMap,
}

impl<'a> Printer<'a> {
    /// Render one template line. `allowed` lists the permitted directive
    /// characters; `dim_scores` lazily supplies the per-dimension
    /// attribution scores for `%e` and `%m`.
    pub fn print_line(
        &self,
        out: &mut dyn Write,
        view: &RecordView,
        template: &str,
        allowed: &str,
        dim_scores: &mut dyn FnMut() -> Option<Vec<f64>>,
    ) -> io::Result<()> {
        const KNOWN: &str = "rnohsSclmdeavxCt:.%";
        let chars: Vec<char> = template.chars().collect();
        let mut attribution: Option<Option<Vec<f64>>> = None;
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];
            if c == '%' && i + 1 < chars.len() && KNOWN.contains(chars[i + 1]) {
                let d = chars[i + 1];
                i += 2;
                // directives outside the call site's whitelist are
                // consumed silently
                if allowed.contains(d) || ":.%".contains(d) {
                    self.directive(out, view, d, &mut attribution, dim_scores)?;
                }
                continue;
            }
            if c == '\\' && i + 1 < chars.len() {
                if let Some(e) = unescape(chars[i + 1]) {
                    write!(out, "{}", e)?;
                    i += 2;
                    continue;
                }
            }
            write!(out, "{}", c)?;
            i += 1;
        }

        if !template.is_empty() {
            writeln!(out)?;
        }
        Ok(())
    }

    fn directive(
        &self,
        out: &mut dyn Write,
        view: &RecordView,
        directive: char,
        attribution: &mut Option<Option<Vec<f64>>>,
        dim_scores: &mut dyn FnMut() -> Option<Vec<f64>>,
    ) -> io::Result<()> {
        match directive {
            'r' => write!(out, "{}", view.line_no)?,
            'n' => {
                if let Some(f) = view.forest {
                    write!(out, "{}", f.total_rows)?;
                }
            }
            'o' => {
                if let Some(f) = view.forest {
                    write!(out, "{}", f.analyzed_rows)?;
                }
            }
            'h' => {
                if let Some(f) = view.forest {
                    write!(out, "{}", f.high_analyzed_rows)?;
                }
            }
            's' => write!(out, "{:.6}", view.score)?,
            'S' => {
                if let Some(f) = view.forest {
                    write!(out, "{:.6}", f.test_average_score)?;
                }
            }
            'c' => {
                if let Some(values) = view.values {
                    write!(
                        out,
                        "{}",
                        self.dims
                            .category_key(values, self.settings.category_separator)
                    )?;
                }
            }
            'l' => {
                if let Some(values) = view.values {
                    write!(
                        out,
                        "{}",
                        self.dims.label_key(values, self.settings.label_separator)
                    )?;
                }
            }
            'd' => self.print_dimension_list(out, view)?,
            'a' => {
                if let Some(f) = view.forest {
                    for i in 0..self.dims.dimensions {
                        if let Some(avg) = f.avg.get(i) {
                            write!(out, "{}", self.format_value(*avg))?;
                        }
                        self.list_separator(out, i)?;
                    }
                }
            }
            'e' => {
                if attribution.is_none() {
                    *attribution = Some(dim_scores());
                }
                if let Some(Some(scores)) = attribution {
                    for i in 0..self.dims.dimensions {
                        if let Some(s) = scores.get(i) {
                            write!(out, "{:.6}", s)?;
                        }
                        self.list_separator(out, i)?;
                    }
                }
            }
            'm' => {
                if let Some(sub) = self.settings.dimension_template.clone() {
                    for i in 0..self.dims.dimensions {
                        self.print_dimension_line(out, view, &sub, i, attribution, dim_scores)?;
                        self.list_separator(out, i)?;
                    }
                }
            }
            'v' => {
                if let Some(values) = view.values {
                    for (i, v) in values.iter().enumerate() {
                        write!(out, "{}", v)?;
                        if i + 1 < values.len() {
                            write!(out, "{}", self.settings.list_separator as char)?;
                        }
                    }
                }
            }
            'x' => write!(out, "{:06X}", score_to_rgb(view.score))?,
            'C' => {
                if let Some(f) = view.forest {
                    write!(out, "{}", f.category)?;
                }
            }
            't' => {
                if let Some(f) = view.forest {
                    if let Some(stamp) = Local.timestamp_opt(f.last_updated, 0).single() {
                        write!(out, "{}", stamp.format("%c"))?;
                    }
                }
            }
            ':' => write!(out, "{}", self.settings.category_separator as char)?,
            '.' => write!(out, "{}", self.settings.label_separator as char)?,
            '%' => write!(out, "%")?,
            _ => {}
        }
        Ok(())
    }

    /// The `%d` list: per dimension either the original text of a text
    /// column or the formatted numeric value.
    fn print_dimension_list(&self, out: &mut dyn Write, view: &RecordView) -> io::Result<()> {
        for i in 0..self.dims.dimensions {
            self.print_single_dimension(out, view, i)?;
            self.list_separator(out, i)?;
        }
        Ok(())
    }

    fn print_single_dimension(
        &self,
        out: &mut dyn Write,
        view: &RecordView,
        i: usize,
    ) -> io::Result<()> {
        let field = self.dims.dim_idx.get(i).copied();
        if let (Some(field), Some(values)) = (field, view.values) {
            if self.dims.is_text_field(field) {
                if let Some(v) = values.get(field) {
                    write!(out, "{}", v)?;
                }
                return Ok(());
            }
        }
        if let Some(dimension) = view.dimension {
            if let Some(v) = dimension.get(i) {
                write!(out, "{}", self.format_value(*v))?;
            }
        }
        Ok(())
    }

    /// One `%m` sub-template expansion for dimension `i`. Supports `%d`,
    /// `%a`, `%e` and `%i` plus the usual escapes.
    fn print_dimension_line(
        &self,
        out: &mut dyn Write,
        view: &RecordView,
        sub: &str,
        i: usize,
        attribution: &mut Option<Option<Vec<f64>>>,
        dim_scores: &mut dyn FnMut() -> Option<Vec<f64>>,
    ) -> io::Result<()> {
        let chars: Vec<char> = sub.chars().collect();
        let mut pos = 0;
        while pos < chars.len() {
            let c = chars[pos];
            if c == '%' && pos + 1 < chars.len() && "daei".contains(chars[pos + 1]) {
                match chars[pos + 1] {
                    'd' => self.print_single_dimension(out, view, i)?,
                    'a' => {
                        if let Some(f) = view.forest {
                            if let Some(avg) = f.avg.get(i) {
                                write!(out, "{}", self.format_value(*avg))?;
                            }
                        }
                    }
                    'e' => {
                        if attribution.is_none() {
                            *attribution = Some(dim_scores());
                        }
                        if let Some(Some(scores)) = attribution {
                            if let Some(s) = scores.get(i) {
                                write!(out, "{:.6}", s)?;
                            }
                        }
                    }
                    'i' => write!(out, "{}", i + 1)?,
                    _ => {}
                }
                pos += 2;
                continue;
            }
            if c == '\\' && pos + 1 < chars.len() {
                if let Some(e) = unescape(chars[pos + 1]) {
                    write!(out, "{}", e)?;
                    pos += 2;
                    continue;
                }
            }
            write!(out, "{}", c)?;
            pos += 1;
        }
        Ok(())
    }

    fn list_separator(&self, out: &mut dyn Write, i: usize) -> io::Result<()> {
        if i + 1 < self.dims.dimensions {
            write!(out, "{}", self.settings.list_separator as char)?;
        }
        Ok(())
    }

    /// Format a dimension or average value: the user's printf format when
    /// one is configured, the decimals setting otherwise.
    fn format_value(&self, v: f64) -> String {
        if self.settings.printf_format.is_empty() {
            format!("{:.*}", self.settings.decimals, v)
        } else {
            format_printf(&self.settings.printf_format, self.settings.decimals, v)
        }
    }
}

fn unescape(c: char) -> Option<char> {
    match c {
        't' => Some('\t'),
        'n' => Some('\n'),
        '\\' => Some('\\'),
        '"' => Some('"'),
        '\'' => Some('\''),
        _ => None,
    }
}

/// Map a score onto a six-digit RGB value: blue at 0, green at 0.5, red
/// at 1, black for exactly zero.
pub fn score_to_rgb(score: f64) -> u32 {
    if score == 0.0 {
        return 0;
    }
    let green = if score < 0.5 {
        (2.0 * 255.0 * score) as u32
    } else {
        (255.0 * 2.0 * (1.0 - score)) as u32
    };
    let red = if score > 0.5 {
        (2.0 * 255.0 * (score - 0.5)) as u32
    } else {
        0
    };
    let blue = if score < 0.5 {
        (2.0 * 255.0 * (0.5 - score)) as u32
    } else {
        0
    };
    (red << 16) + (green << 8) + blue
}

/// Render one value with a printf-style format such as `%8.3f` or `%e`.
/// Unsupported patterns fall back to plain decimals formatting.
fn format_printf(fmt: &str, decimals: usize, v: f64) -> String {
    let Some(start) = fmt.find('%') else {
        return format!("{:.*}", decimals, v);
    };
    let spec = &fmt[start + 1..];
    let mut left = false;
    let mut zero = false;
    let mut chars = spec.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            '-' => {
                left = true;
                chars.next();
            }
            '0' => {
                zero = true;
                chars.next();
            }
            _ => break,
        }
    }
    let mut width = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_ascii_digit() {
            width.push(c);
            chars.next();
        } else {
            break;
        }
    }
    let mut precision = String::new();
    if chars.peek() == Some(&'.') {
        chars.next();
        while let Some(&c) = chars.peek() {
            if c.is_ascii_digit() {
                precision.push(c);
                chars.next();
            } else {
                break;
            }
        }
    }
    let conv = chars.next().unwrap_or('f');
    let width: usize = width.parse().unwrap_or(0);
    let precision: usize = precision.parse().unwrap_or(6);

    let body = match conv {
        'e' | 'E' => format!("{:.*e}", precision, v),
        'g' | 'G' => format!("{}", v),
        _ => format!("{:.*}", precision, v),
    };

    let prefix = &fmt[..start];
    let padded = if body.len() >= width {
        body
    } else if left {
        format!("{:<width$}", body, width = width)
    } else if zero {
        let negative = body.starts_with('-');
        if negative {
            let digits = &body[1..];
            format!("-{:0>width$}", digits, width = width - 1)
        } else {
            format!("{:0>width$}", body, width = width)
        }
    } else {
        format!("{:>width$}", body, width = width)
    };
    format!("{}{}", prefix, padded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::engine::Forest;

    fn printer_fixture() -> (Settings, DimMap) {
        let mut settings = Settings::default();
        settings.category_dims = "1".to_string();
        let mut dims = DimMap::from_settings(&settings).unwrap();
        dims.init_from_record(3);
        (settings, dims)
    }

    fn render(
        settings: &Settings,
        dims: &DimMap,
        view: &RecordView,
        template: &str,
        allowed: &str,
    ) -> String {
        let printer = Printer { settings, dims };
        let mut out = Vec::new();
        printer
            .print_line(&mut out, view, template, allowed, &mut || None)
            .unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_basic_directives() {
        let (settings, dims) = printer_fixture();
        let mut forest = Forest::new("web".to_string(), 0);
        forest.total_rows = 7;
        forest.high_analyzed_rows = 2;
        let values: Vec<String> = vec!["web".into(), "1".into(), "2".into()];
        let dimension = vec![1.0, 2.0];
        let view = RecordView {
            score: 0.75,
            line_no: 12,
            forest: Some(&forest),
            values: Some(&values),
            dimension: Some(&dimension),
        };

        let line = render(&settings, &dims, &view, "%r %s %C %n %h", "rsCnh");
        assert_eq!(line, "12 0.750000 web 7 2\n");
    }

    #[test]
    fn test_whitelist_suppresses_directives() {
        let (settings, dims) = printer_fixture();
        let view = RecordView {
            score: 0.5,
            line_no: 1,
            forest: None,
            values: None,
            dimension: None,
        };
        // 'r' allowed, 's' not: %s emits nothing
        let line = render(&settings, &dims, &view, "%r|%s|", "r");
        assert_eq!(line, "1||\n");
        // unknown directives pass through literally
        let line = render(&settings, &dims, &view, "%r %z", "r");
        assert_eq!(line, "1 %z\n");
    }

    #[test]
    fn test_dimension_and_value_lists() {
        let (settings, dims) = printer_fixture();
        let values: Vec<String> = vec!["web".into(), "1.5".into(), "x".into()];
        let dimension = vec![1.5, 0.0];
        let view = RecordView {
            score: 0.0,
            line_no: 0,
            forest: None,
            values: Some(&values),
            dimension: Some(&dimension),
        };
        let line = render(&settings, &dims, &view, "%d", "d");
        assert_eq!(line, "1.500000,0.000000\n");
        let line = render(&settings, &dims, &view, "%v", "v");
        assert_eq!(line, "web,1.5,x\n");
        let line = render(&settings, &dims, &view, "%c", "c");
        assert_eq!(line, "web\n");
    }

    #[test]
    fn test_escapes_and_literal_percent() {
        let (settings, dims) = printer_fixture();
        let view = RecordView {
            score: 0.0,
            line_no: 3,
            forest: None,
            values: None,
            dimension: None,
        };
        let line = render(&settings, &dims, &view, "a\\tb %% %r", "r");
        assert_eq!(line, "a\tb % 3\n");
    }

    #[test]
    fn test_empty_template_prints_nothing() {
        let (settings, dims) = printer_fixture();
        let view = RecordView {
            score: 0.0,
            line_no: 0,
            forest: None,
            values: None,
            dimension: None,
        };
        assert_eq!(render(&settings, &dims, &view, "", "rs"), "");
    }

    #[test]
    fn test_score_to_rgb_anchors() {
        assert_eq!(score_to_rgb(0.0), 0x000000);
        assert_eq!(score_to_rgb(1.0), 0xFF0000);
        assert_eq!(score_to_rgb(0.5), 0xFF00); // pure green
        // low scores shade towards blue
        assert_eq!(score_to_rgb(0.25) & 0xFF, 0x7F);
    }

    #[test]
    fn test_printf_format_patterns() {
        assert_eq!(format_printf("%8.2f", 6, 3.14159), "    3.14");
        assert_eq!(format_printf("%-8.2f", 6, 3.14159), "3.14    ");
        assert_eq!(format_printf("%08.2f", 6, -3.14159), "-0003.14");
        assert_eq!(format_printf("%.0f", 6, 2.7), "3");
        assert_eq!(format_printf("v=%5.1f", 6, 2.25), "v=  2.2");
    }

    #[test]
    fn test_dimension_sub_template() {
        let (mut settings, dims) = printer_fixture();
        settings.dimension_template = Some("%i:%d".to_string());
        let values: Vec<String> = vec!["web".into(), "1".into(), "2".into()];
        let dimension = vec![1.0, 2.0];
        let view = RecordView {
            score: 0.0,
            line_no: 0,
            forest: None,
            values: Some(&values),
            dimension: Some(&dimension),
        };
        let line = render(&settings, &dims, &view, "%m", "m");
        assert_eq!(line, "1:1.000000,2:2.000000\n");
    }
}
