use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

static DOC_EXTENSIONS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    ["md", "markdown", "mdx", "txt", "rst", "adoc"]
        .into_iter()
        .collect()
});

/// Category of documents that sit directly in the corpus root.
pub const ROOT_CATEGORY: &str = "general";

/// A heading-delimited part of a source document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocSection {
    /// Heading text, or the file stem for text before the first heading
    pub title: String,

    /// Heading depth (1-6), 0 for the preamble
    pub level: usize,

    /// First line, 1-based
    pub start_line: usize,

    /// Last line, 1-based and inclusive
    pub end_line: usize,

    /// Section text including its heading line
    pub content: String,
}

/// A parsed source document.
#[derive(Debug, Clone, Serialize)]
pub struct DocFile {
    /// Path relative to the corpus root, with `/` separators
    pub relative_path: String,

    /// First directory component of the relative path
    pub category: String,

    /// Sections in document order
    pub sections: Vec<DocSection>,

    /// Number of lines in the source
    pub total_lines: usize,

    /// Number of chars in the source
    pub total_chars: usize,
}

impl DocFile {
    /// Splits a document into sections on ATX headings.
    ///
    /// Lines inside fenced code blocks never start a section. Text before the first
    /// heading becomes a level-0 section titled after the file stem; it is omitted
    /// when blank.
    #[must_use]
    pub fn parse(relative_path: &str, content: &str) -> Self {
        let lines: Vec<&str> = content.lines().collect();
        let mut sections = Vec::new();
        let mut in_fence = false;

        let mut title = file_stem(relative_path).to_string();
        let mut level = 0;
        let mut start = 0;

        for (idx, line) in lines.iter().enumerate() {
            if is_fence(line) {
                in_fence = !in_fence;
                continue;
            }
            if in_fence {
                continue;
            }
            if let Some((heading_level, heading)) = parse_heading(line) {
                push_section(&mut sections, &lines, &title, level, start, idx);
                title = heading.to_string();
                level = heading_level;
                start = idx;
            }
        }
        push_section(&mut sections, &lines, &title, level, start, lines.len());

        Self {
            relative_path: relative_path.to_string(),
            category: category_of(relative_path),
            sections,
            total_lines: lines.len(),
            total_chars: content.chars().count(),
        }
    }

    /// Returns the file name without directories or extension.
    #[must_use]
    pub fn stem(&self) -> &str {
        file_stem(&self.relative_path)
    }
}

fn push_section(
    sections: &mut Vec<DocSection>,
    lines: &[&str],
    title: &str,
    level: usize,
    start: usize,
    end: usize,
) {
    if start >= end {
        return;
    }
    let content = lines[start..end].join("\n");
    if level == 0 && content.trim().is_empty() {
        return;
    }
    sections.push(DocSection {
        title: title.to_string(),
        level,
        start_line: start + 1,
        end_line: end,
        content,
    });
}

/// Parses an ATX heading line into its depth and text.
pub(crate) fn parse_heading(line: &str) -> Option<(usize, &str)> {
    let trimmed = line.trim_start();
    // more than three spaces of indent is a code block
    if line.len() - trimmed.len() > 3 {
        return None;
    }
    let level = trimmed.bytes().take_while(|&b| b == b'#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let rest = &trimmed[level..];
    if !rest.is_empty() && !rest.starts_with([' ', '\t']) {
        return None;
    }
    Some((level, rest.trim().trim_end_matches('#').trim_end()))
}

fn is_fence(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("```") || trimmed.starts_with("~~~")
}

fn file_stem(relative_path: &str) -> &str {
    let name = relative_path.rsplit('/').next().unwrap_or(relative_path);
    match name.rfind('.') {
        Some(dot) if dot > 0 => &name[..dot],
        _ => name,
    }
}

fn category_of(relative_path: &str) -> String {
    match relative_path.split_once('/') {
        Some((dir, _)) if !dir.is_empty() => dir.to_string(),
        _ => ROOT_CATEGORY.to_string(),
    }
}

/// Determines if a file is likely binary by analyzing its content.
///
/// # Algorithm
///
/// 1. Reads the first 8KB of the file
/// 2. Checks for null bytes (binary indicator)
/// 3. Calculates the ratio of ASCII characters
/// 4. Files with null bytes or low ASCII ratio are considered binary
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read.
pub(crate) fn is_likely_binary(path: &Path) -> Result<bool> {
    const BUFFER_SIZE: usize = 8192;
    const ASCII_THRESHOLD: f64 = 0.85;

    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, file);
    let mut buffer = [0u8; BUFFER_SIZE];

    let bytes_read = reader.read(&mut buffer).map_err(|e| Error::io(path, e))?;

    if bytes_read == 0 {
        return Ok(false);
    }

    let sample = &buffer[..bytes_read];

    if memchr::memchr(0, sample).is_some() {
        return Ok(true);
    }

    // UTF-8 text in other scripts is mostly non-ASCII, so only reject it if it
    // does not decode either
    let ascii_count = sample.iter().filter(|&&b| b < 128).count();
    let ascii_ratio = ascii_count as f64 / bytes_read as f64;
    if ascii_ratio >= ASCII_THRESHOLD {
        return Ok(false);
    }

    Ok(match std::str::from_utf8(sample) {
        Ok(_) => false,
        // a multi-byte char cut off by the buffer end is still text
        Err(e) => e.error_len().is_some(),
    })
}

/// Checks if a file extension marks a documentation file.
#[must_use]
pub(crate) fn has_doc_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| DOC_EXTENSIONS.contains(ext.to_ascii_lowercase().as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;
    use std::io::Write;

    const GUIDE: &str = "Intro text before any heading.

# Walkers

Walkers traverse graphs.

```jac
# not a heading
walker w {}
```

## Spawning

Spawn with `spawn`.
";

    #[test]
    fn test_parse_sections() {
        let doc = DocFile::parse("learn/guide.md", GUIDE);

        assert_eq!(doc.category, "learn");
        assert_eq!(doc.total_lines, 14);
        let titles: Vec<&str> = doc.sections.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["guide", "Walkers", "Spawning"]);

        let walkers = &doc.sections[1];
        assert_eq!(walkers.level, 1);
        assert_eq!(walkers.start_line, 3);
        assert_eq!(walkers.end_line, 11);
        assert!(walkers.content.starts_with("# Walkers"));
        assert!(walkers.content.contains("# not a heading"));

        let spawning = &doc.sections[2];
        assert_eq!(spawning.level, 2);
        assert_eq!(spawning.start_line, 12);
        assert_eq!(spawning.end_line, 14);
    }

    #[test]
    fn test_parse_without_preamble() {
        let doc = DocFile::parse("top.md", "# Title\nbody\n");

        assert_eq!(doc.category, ROOT_CATEGORY);
        assert_eq!(doc.sections.len(), 1);
        assert_eq!(doc.sections[0].title, "Title");
        assert_eq!(doc.sections[0].start_line, 1);
    }

    #[test]
    fn test_parse_no_headings() {
        let doc = DocFile::parse("notes/plain.txt", "just\nsome\ntext");

        assert_eq!(doc.sections.len(), 1);
        assert_eq!(doc.sections[0].level, 0);
        assert_eq!(doc.sections[0].title, "plain");
        assert_eq!(doc.stem(), "plain");
    }

    #[test]
    fn test_parse_heading() {
        assert_eq!(parse_heading("## Setup"), Some((2, "Setup")));
        assert_eq!(parse_heading("# Closed #"), Some((1, "Closed")));
        assert_eq!(parse_heading("#hashtag"), None);
        assert_eq!(parse_heading("####### seven"), None);
        assert_eq!(parse_heading("     # indented"), None);
        assert_eq!(parse_heading("plain"), None);
    }

    #[test]
    fn test_is_likely_binary_text_file() {
        let temp = assert_fs::TempDir::new().unwrap();
        let file = temp.child("test.md");
        file.write_str("# Hello, world!").unwrap();

        assert!(!is_likely_binary(file.path()).unwrap());
    }

    #[test]
    fn test_is_likely_binary_non_latin_text() {
        let temp = assert_fs::TempDir::new().unwrap();
        let file = temp.child("ru.md");
        file.write_str("Документация по графам и обходчикам").unwrap();

        assert!(!is_likely_binary(file.path()).unwrap());
    }

    #[test]
    fn test_is_likely_binary_binary_file() {
        let temp = assert_fs::TempDir::new().unwrap();
        let file = temp.child("test.md");

        let mut f = File::create(file.path()).unwrap();
        f.write_all(&[0u8; 100]).unwrap();

        assert!(is_likely_binary(file.path()).unwrap());
    }

    #[test]
    fn test_has_doc_extension() {
        assert!(has_doc_extension(Path::new("README.md")));
        assert!(has_doc_extension(Path::new("notes.TXT")));
        assert!(has_doc_extension(Path::new("guide.rst")));
        assert!(!has_doc_extension(Path::new("main.rs")));
        assert!(!has_doc_extension(Path::new("no_extension")));
    }
}
