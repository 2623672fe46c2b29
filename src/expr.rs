// # Field Rewrite Formulas
//
// Input fields can be rewritten before value parsing with formulas of the
// form `$n = expression`, where `$k` references input field values and a
// trailing `:d` selects the decimals used when rendering the result.
// Evaluation failures are fatal unless demoted to zero by configuration.

use crate::error::{GroveError, Result};

const DEFAULT_DECIMALS: usize = 6;

/// One parsed rewrite formula.
#[derive(Debug, Clone)]
pub struct Formula {
    /// Original formula text, used for removal matching.
    text: String,
    /// 0-based index of the field to replace.
    target: usize,
    /// Right side of the equation, decimals suffix removed.
    expression: String,
    decimals: usize,
}

/// The ordered set of active formulas.
#[derive(Debug, Default)]
pub struct FormulaSet {
    formulas: Vec<Formula>,
    /// Replace failed evaluations with zero instead of failing the run.
    pub ignore_errors: bool,
}

impl FormulaSet {
    pub fn is_empty(&self) -> bool {
        self.formulas.is_empty()
    }

    /// Add a formula, or remove a previously added one when the spec starts
    /// with `-`.
    pub fn add(&mut self, spec: &str) -> Result<()> {
        if let Some(rest) = spec.strip_prefix('-') {
            self.formulas.retain(|f| f.text != rest);
            return Ok(());
        }

        let (target, right) = parse_sides(spec)
            .ok_or_else(|| GroveError::Expression(spec.to_string()))?;

        let (expression, decimals) = match right.rsplit_once(':') {
            Some((e, d)) if d.chars().all(|c| c.is_ascii_digit()) && !d.is_empty() => {
                (e.to_string(), d.parse().unwrap_or(DEFAULT_DECIMALS))
            }
            _ => (right.to_string(), DEFAULT_DECIMALS),
        };

        if expression.trim().is_empty() {
            return Err(GroveError::Expression(spec.to_string()));
        }

        self.formulas.push(Formula {
            text: spec.to_string(),
            target,
            expression,
            decimals,
        });
        Ok(())
    }

    /// Apply every formula to a parsed record in place. Formulas only touch
    /// fields that hold a valid numeric value; text fields pass through.
    pub fn rewrite(&self, fields: &mut [String]) -> Result<()> {
        for formula in &self.formulas {
            if formula.target >= fields.len() {
                continue;
            }
            if fields[formula.target].parse::<f64>().is_err() {
                continue;
            }

            let expanded = substitute_references(&formula.expression, fields);
            match evaluate(&expanded) {
                Ok(v) => {
                    fields[formula.target] = format!("{:.*}", formula.decimals, v);
                }
                Err(_) if self.ignore_errors => {
                    tracing::warn!(
                        expression = %expanded,
                        "expression cannot be evaluated, replaced by zero"
                    );
                    fields[formula.target] = format!("{:.*}", formula.decimals, 0.0);
                }
                Err(_) => {
                    return Err(GroveError::ExpressionEval(expanded));
                }
            }
        }
        Ok(())
    }
}

/// Split `$n = expr` into the 0-based target index and the expression text.
fn parse_sides(spec: &str) -> Option<(usize, String)> {
    let spec = spec.trim();
    let rest = spec.strip_prefix('$')?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    let n: usize = digits.parse().ok()?;
    if n < 1 {
        return None;
    }
    let after = rest[digits.len()..].trim_start();
    let right = after.strip_prefix('=')?.trim();
    if right.is_empty() {
        return None;
    }
    Some((n - 1, right.to_string()))
}

/// Replace every `$k` reference with the corresponding field text. An
/// out-of-range reference expands to nothing and surfaces as an evaluation
/// error downstream.
fn substitute_references(expression: &str, fields: &[String]) -> String {
    let mut out = String::with_capacity(expression.len());
    let chars: Vec<char> = expression.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '$' {
            let start = i + 1;
            let mut end = start;
            while end < chars.len() && chars[end].is_ascii_digit() {
                end += 1;
            }
            if end > start {
                let idx: usize = chars[start..end].iter().collect::<String>().parse().unwrap();
                if idx >= 1 && idx <= fields.len() {
                    out.push_str(&fields[idx - 1]);
                }
                i = end;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

// ============================================================================
// Expression evaluator
// ============================================================================

/// Evaluate an arithmetic expression over plain numbers. Supports the four
/// basic operators, `%`, `^`, parentheses, unary minus, and a small set of
/// functions (abs, sqrt, ln, log, exp, floor, ceil).
pub fn evaluate(expression: &str) -> std::result::Result<f64, String> {
    let mut parser = Parser {
        chars: expression.chars().collect(),
        pos: 0,
    };
    let value = parser.expr()?;
    parser.skip_whitespace();
    if parser.pos != parser.chars.len() {
        return Err(format!("trailing input at position {}", parser.pos));
    }
    if !value.is_finite() {
        return Err("result is not a finite number".to_string());
    }
    Ok(value)
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn skip_whitespace(&mut self) {
        while self.pos < self.chars.len() && self.chars[self.pos].is_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_whitespace();
        self.chars.get(self.pos).copied()
    }

    fn expr(&mut self) -> std::result::Result<f64, String> {
        let mut value = self.term()?;
        while let Some(op) = self.peek() {
            match op {
                '+' => {
                    self.pos += 1;
                    value += self.term()?;
                }
                '-' => {
                    self.pos += 1;
                    value -= self.term()?;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn term(&mut self) -> std::result::Result<f64, String> {
        let mut value = self.power()?;
        while let Some(op) = self.peek() {
            match op {
                '*' => {
                    self.pos += 1;
                    value *= self.power()?;
                }
                '/' => {
                    self.pos += 1;
                    value /= self.power()?;
                }
                '%' => {
                    self.pos += 1;
                    value %= self.power()?;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn power(&mut self) -> std::result::Result<f64, String> {
        let base = self.unary()?;
        if self.peek() == Some('^') {
            self.pos += 1;
            let exponent = self.power()?;
            return Ok(base.powf(exponent));
        }
        Ok(base)
    }

    fn unary(&mut self) -> std::result::Result<f64, String> {
        if self.peek() == Some('-') {
            self.pos += 1;
            return Ok(-self.unary()?);
        }
        self.primary()
    }

    fn primary(&mut self) -> std::result::Result<f64, String> {
        match self.peek() {
            Some('(') => {
                self.pos += 1;
                let value = self.expr()?;
                if self.peek() != Some(')') {
                    return Err("missing closing parenthesis".to_string());
                }
                self.pos += 1;
                Ok(value)
            }
            Some(c) if c.is_ascii_digit() || c == '.' => self.number(),
            Some(c) if c.is_ascii_alphabetic() => self.function(),
            _ => Err("expected a value".to_string()),
        }
    }

    fn number(&mut self) -> std::result::Result<f64, String> {
        self.skip_whitespace();
        let start = self.pos;
        while self.pos < self.chars.len()
            && (self.chars[self.pos].is_ascii_digit() || self.chars[self.pos] == '.')
        {
            self.pos += 1;
        }
        // scientific notation
        if self.pos < self.chars.len() && matches!(self.chars[self.pos], 'e' | 'E') {
            let mark = self.pos;
            self.pos += 1;
            if self.pos < self.chars.len() && matches!(self.chars[self.pos], '+' | '-') {
                self.pos += 1;
            }
            if self.pos < self.chars.len() && self.chars[self.pos].is_ascii_digit() {
                while self.pos < self.chars.len() && self.chars[self.pos].is_ascii_digit() {
                    self.pos += 1;
                }
            } else {
                self.pos = mark;
            }
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        text.parse().map_err(|_| format!("bad number: {}", text))
    }

    fn function(&mut self) -> std::result::Result<f64, String> {
        self.skip_whitespace();
        let start = self.pos;
        while self.pos < self.chars.len() && self.chars[self.pos].is_ascii_alphabetic() {
            self.pos += 1;
        }
        let name: String = self.chars[start..self.pos].iter().collect();
        if self.peek() != Some('(') {
            return Err(format!("unknown symbol: {}", name));
        }
        self.pos += 1;
        let arg = self.expr()?;
        if self.peek() != Some(')') {
            return Err("missing closing parenthesis".to_string());
        }
        self.pos += 1;
        match name.as_str() {
            "abs" => Ok(arg.abs()),
            "sqrt" => Ok(arg.sqrt()),
            "ln" => Ok(arg.ln()),
            "log" => Ok(arg.log10()),
            "exp" => Ok(arg.exp()),
            "floor" => Ok(arg.floor()),
            "ceil" => Ok(arg.ceil()),
            other => Err(format!("unknown function: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evaluate_basics() {
        assert_eq!(evaluate("1 + 2 * 3").unwrap(), 7.0);
        assert_eq!(evaluate("(1 + 2) * 3").unwrap(), 9.0);
        assert_eq!(evaluate("-4 + 2").unwrap(), -2.0);
        assert_eq!(evaluate("2 ^ 10").unwrap(), 1024.0);
        assert_eq!(evaluate("10 % 3").unwrap(), 1.0);
        assert_eq!(evaluate("sqrt(16)").unwrap(), 4.0);
        assert_eq!(evaluate("1.5e2").unwrap(), 150.0);
    }

    #[test]
    fn test_evaluate_errors() {
        assert!(evaluate("1 +").is_err());
        assert!(evaluate("foo(1)").is_err());
        assert!(evaluate("(1").is_err());
        assert!(evaluate("1 / 0").is_err()); // infinity is not a usable value
    }

    #[test]
    fn test_formula_parsing() {
        let mut set = FormulaSet::default();
        set.add("$3 = $3 / $1").unwrap();
        assert!(!set.is_empty());
        assert!(set.add("3 = 1").is_err());
        assert!(set.add("$0 = 1").is_err());
        assert!(set.add("$2 =").is_err());
    }

    #[test]
    fn test_formula_removal() {
        let mut set = FormulaSet::default();
        set.add("$1 = $1 * 2").unwrap();
        set.add("-$1 = $1 * 2").unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn test_rewrite_applies_to_numeric_fields() {
        let mut set = FormulaSet::default();
        set.add("$2 = $2 / $1:2").unwrap();
        let mut fields = vec!["4".to_string(), "10".to_string()];
        set.rewrite(&mut fields).unwrap();
        assert_eq!(fields[1], "2.50");
        // text target is left intact
        let mut fields = vec!["4".to_string(), "label".to_string()];
        set.rewrite(&mut fields).unwrap();
        assert_eq!(fields[1], "label");
    }

    #[test]
    fn test_rewrite_error_demotion() {
        let mut set = FormulaSet::default();
        set.add("$1 = $1 / $9").unwrap(); // $9 missing, expands to nothing
        let mut fields = vec!["4".to_string()];
        assert!(set.rewrite(&mut fields).is_err());

        set.ignore_errors = true;
        let mut fields = vec!["4".to_string()];
        set.rewrite(&mut fields).unwrap();
        assert_eq!(fields[0], "0.000000");
    }
}
