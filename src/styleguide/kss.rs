//! Parser for KSS-style documentation comments in Sass sources.
//!
//! ```scss
//! // Buttons
//! //
//! // Use for every clickable action.
//! //
//! // Markup: <button class="btn">Go</button>
//! //
//! // Styleguide 1.2
//! ```
//!
//! A block is a run of `//` lines, split into paragraphs by empty comment
//! lines. Blocks that do not end in a `Styleguide` reference are ordinary
//! comments and are ignored.

use std::cmp::Ordering;
use std::fmt::{self, Display};
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};

/// Dotted section number such as `1.2.3`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference(Vec<u32>);

impl Reference {
    pub fn top(&self) -> u32 {
        self.0.first().copied().unwrap_or_default()
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }
}

impl FromStr for Reference {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .trim_end_matches('.')
            .split('.')
            .map(str::parse)
            .collect::<Result<Vec<_>, _>>()
            .map(Reference)
    }
}

impl Ord for Reference {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for Reference {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, n) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{n}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Section {
    pub reference: Reference,
    pub title: String,
    /// Markdown.
    pub description: String,
    pub markup: Option<String>,
    pub source: Utf8PathBuf,
}

/// Extract every documented section from one stylesheet.
pub fn parse(source: &Utf8Path, text: &str) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut block: Vec<&str> = Vec::new();

    for line in text.lines() {
        match line.trim_start().strip_prefix("//") {
            Some(rest) => block.push(rest.strip_prefix(' ').unwrap_or(rest).trim_end()),
            None => {
                if let Some(section) = parse_block(source, &block) {
                    sections.push(section);
                }
                block.clear();
            }
        }
    }

    if let Some(section) = parse_block(source, &block) {
        sections.push(section);
    }

    sections
}

fn parse_block(source: &Utf8Path, lines: &[&str]) -> Option<Section> {
    let mut paragraphs: Vec<Vec<&str>> = Vec::new();
    let mut current = Vec::new();

    for &line in lines {
        if line.trim().is_empty() {
            if !current.is_empty() {
                paragraphs.push(std::mem::take(&mut current));
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        paragraphs.push(current);
    }

    let last = paragraphs.pop()?;
    let reference = match last.as_slice() {
        [line] => line
            .trim()
            .strip_prefix("Styleguide")?
            .trim_start_matches(':')
            .parse()
            .ok()?,
        _ => return None,
    };

    let mut paragraphs = paragraphs.into_iter();
    let title = paragraphs.next()?.join(" ");

    let mut description = Vec::new();
    let mut markup = None;

    for paragraph in paragraphs {
        match paragraph[0].strip_prefix("Markup:") {
            Some(first) => {
                let mut lines = Vec::with_capacity(paragraph.len());
                if !first.trim().is_empty() {
                    lines.push(first.trim());
                }
                lines.extend(&paragraph[1..]);
                markup = Some(lines.join("\n"));
            }
            None => description.push(paragraph.join("\n")),
        }
    }

    Some(Section {
        reference,
        title,
        description: description.join("\n\n"),
        markup,
        source: source.to_path_buf(),
    })
}
