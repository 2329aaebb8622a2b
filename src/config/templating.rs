use chrono::{Datelike, NaiveDate};
use indexmap::IndexMap;
use regex::Regex;

use crate::errors::Result;

/// What to do with a `{{ name }}` token that has no mapping entry.
///
/// `Keep` (the default everywhere) leaves the token verbatim so a later stage
/// can render it; the extraction task relies on this to receive
/// `{{ part_number }}` untouched. `Discard` replaces it with an empty string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Undefined {
    #[default]
    Keep,
    Discard,
}

/// Substitutes `{{ identifier }}` tokens in `content` against `mapping`.
///
/// Identifier-only on purpose: job templates use plain names, never
/// expressions, so a full template engine has nothing to add here.
///
/// # Example
///
/// ```
/// use indexmap::IndexMap;
/// use dbtap::config::templating::{render_template, Undefined};
///
/// let mut mapping = IndexMap::new();
/// mapping.insert("ptn_yyyy".to_string(), "2024".to_string());
/// let out = render_template("x_{{ ptn_yyyy }}_{{ part_number }}", &mapping, Undefined::Keep)
///     .unwrap();
/// assert_eq!(out, "x_2024_{{ part_number }}");
/// ```
pub fn render_template(
    content: &str,
    mapping: &IndexMap<String, String>,
    undefined: Undefined,
) -> Result<String> {
    let re = Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}")?;

    let mut result = String::with_capacity(content.len());
    let mut last_match = 0;

    for cap in re.captures_iter(content) {
        let full_match = cap.get(0).expect("capture 0 always present");
        let name = cap.get(1).expect("group 1 always present").as_str();

        result.push_str(&content[last_match..full_match.start()]);

        match (mapping.get(name), undefined) {
            (Some(value), _) => result.push_str(value),
            (None, Undefined::Keep) => result.push_str(full_match.as_str()),
            (None, Undefined::Discard) => {}
        }

        last_match = full_match.end();
    }

    result.push_str(&content[last_match..]);
    Ok(result)
}

/// Date-derived placeholder values for one job run.
#[derive(Debug, Clone)]
pub struct DateParts {
    pub pos_dt: String,
    pub ptn_yyyy: String,
    pub ptn_mm: String,
    pub ptn_dd: String,
    pub ptn_qtr: String,
    pub ptn_yyyy_be: String,
    pub env: String,
}

impl DateParts {
    pub fn new(pos_dt: &str, env: &str) -> Result<Self> {
        let date = NaiveDate::parse_from_str(pos_dt, "%Y-%m-%d")?;
        Ok(Self {
            pos_dt: pos_dt.to_string(),
            ptn_yyyy: date.format("%Y").to_string(),
            ptn_mm: date.format("%m").to_string(),
            ptn_dd: date.format("%d").to_string(),
            ptn_qtr: format!("{:02}", (date.month() - 1) / 3 + 1),
            // Buddhist calendar year, used by Thai-facing file names
            ptn_yyyy_be: (date.year() + 543).to_string(),
            env: env.to_string(),
        })
    }

    pub fn mapping(&self) -> IndexMap<String, String> {
        let mut map = IndexMap::new();
        map.insert("pos_dt".to_string(), self.pos_dt.clone());
        map.insert("ptn_yyyy".to_string(), self.ptn_yyyy.clone());
        map.insert("ptn_mm".to_string(), self.ptn_mm.clone());
        map.insert("ptn_dd".to_string(), self.ptn_dd.clone());
        map.insert("ptn_qtr".to_string(), self.ptn_qtr.clone());
        map.insert("ptn_yyyy_be".to_string(), self.ptn_yyyy_be.clone());
        map.insert("env".to_string(), self.env.clone());
        map
    }
}
