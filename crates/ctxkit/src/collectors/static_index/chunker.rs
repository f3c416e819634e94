//! Regex-based extraction of definition chunks from source files.
//!
//! Each supported language family has a definition pattern. A chunk runs
//! from its definition line to the line before the next definition at the
//! same or a shallower indentation (less any doc comment attached to that
//! next definition). Definitions nested inside a class-like chunk are
//! qualified with the parent's name: `Parent::child` for Rust, `Parent.child`
//! elsewhere.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::LazyLock;

/// Characters of body text included in an embedding input.
const EMBED_BODY_CHARS: usize = 500;

static RUST_ITEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^(\s*)(?:pub(?:\([^)]*\))?\s+)?(?:(?:const|async|unsafe|default|extern(?:\s+"[^"]*")?)\s+)*(fn|struct|enum|trait|mod|union)\s+([A-Za-z_][A-Za-z0-9_]*)"#,
    )
    .expect("rust item regex must be valid")
});

static RUST_IMPL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\s*)(?:unsafe\s+)?impl\b(.*)$").expect("rust impl regex must be valid")
});

static PYTHON_DEF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\s*)(?:async\s+)?(def|class)\s+([A-Za-z_][A-Za-z0-9_]*)")
        .expect("python def regex must be valid")
});

static JS_DEF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(\s*)(?:export\s+)?(?:default\s+)?(?:abstract\s+)?(?:async\s+)?(function\*?|class)\s*([A-Za-z_$][A-Za-z0-9_$]*)",
    )
    .expect("js def regex must be valid")
});

static JS_ARROW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(\s*)(?:export\s+)?(?:const|let)\s+([A-Za-z_$][A-Za-z0-9_$]*)\s*(?::[^=]+)?=\s*(?:async\s+)?(?:function\b|\([^)]*\)\s*(?::[^=]+)?=>|[A-Za-z_$][A-Za-z0-9_$]*\s*=>)",
    )
    .expect("js arrow regex must be valid")
});

static GO_FUNC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\s*)func\s+(?:\(\s*[A-Za-z_0-9]*\s*\*?\s*([A-Za-z_][A-Za-z0-9_]*)[^)]*\)\s*)?([A-Za-z_][A-Za-z0-9_]*)")
        .expect("go func regex must be valid")
});

static GO_TYPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\s*)type\s+([A-Za-z_][A-Za-z0-9_]*)").expect("go type regex must be valid")
});

/// What a chunk holds.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Function,
    /// Class-like containers: classes, structs, enums, traits, impls, modules
    /// declared inline, Go types.
    Class,
    /// A whole file with no recognized definitions.
    Module,
}

impl ChunkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkKind::Function => "function",
            ChunkKind::Class => "class",
            ChunkKind::Module => "module",
        }
    }
}

/// One retrievable unit of source code.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CodeChunk {
    /// Path relative to the index root, `/`-separated.
    pub path: String,
    pub kind: ChunkKind,
    pub name: String,
    pub text: String,
    /// First line, 1-based.
    pub start_line: usize,
    /// Last line, 1-based, inclusive.
    pub end_line: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docstring: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl CodeChunk {
    /// Input text for embedding: name, docstring, then the start of the body.
    pub fn embedding_text(&self) -> String {
        let body: String = self.text.chars().take(EMBED_BODY_CHARS).collect();
        match &self.docstring {
            Some(doc) => format!("{}\n{doc}\n{body}", self.name),
            None => format!("{}\n{body}", self.name),
        }
    }

    /// Lowercased text searched by lexical retrieval.
    pub fn search_text(&self) -> String {
        let mut s = self.name.to_lowercase();
        if let Some(doc) = &self.docstring {
            s.push('\n');
            s.push_str(&doc.to_lowercase());
        }
        s.push('\n');
        s.push_str(&self.text.to_lowercase());
        s
    }
}

/// Language families with definition patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Rust,
    Python,
    JavaScript,
    Go,
}

impl Language {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "rs" => Some(Language::Rust),
            "py" | "pyi" => Some(Language::Python),
            "js" | "jsx" | "mjs" | "cjs" | "ts" | "tsx" | "mts" | "cts" => Some(Language::JavaScript),
            "go" => Some(Language::Go),
            _ => None,
        }
    }

    fn separator(self) -> &'static str {
        match self {
            Language::Rust => "::",
            _ => ".",
        }
    }
}

/// A definition found on one line.
#[derive(Debug, Clone)]
struct Definition {
    line: usize,
    indent: usize,
    kind: ChunkKind,
    name: String,
}

fn indent_width(s: &str) -> usize {
    s.chars()
        .map(|c| match c {
            '\t' => 4,
            _ => 1,
        })
        .sum()
}

/// Self type of an `impl` header, given the text after `impl`.
fn impl_target(rest: &str) -> Option<String> {
    let mut rest = rest.trim_start();
    // Skip the generic parameter list, which may nest.
    if rest.starts_with('<') {
        let mut depth = 0usize;
        let mut cut = rest.len();
        for (i, c) in rest.char_indices() {
            match c {
                '<' => depth += 1,
                '>' => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        cut = i + c.len_utf8();
                        break;
                    }
                }
                _ => {}
            }
        }
        rest = rest.get(cut..).unwrap_or("").trim_start();
    }
    if let Some((_, target)) = rest.split_once(" for ") {
        rest = target.trim_start();
    }
    let rest = rest.trim_start_matches(['&', '*']).trim_start();
    let name: String = rest
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == ':')
        .collect();
    let name = name.rsplit("::").next().unwrap_or("").to_string();
    (!name.is_empty()).then_some(name)
}

fn match_definition(language: Language, line: &str, index: usize) -> Option<Definition> {
    let def = |indent: &str, kind, name: String| Definition {
        line: index,
        indent: indent_width(indent),
        kind,
        name,
    };
    match language {
        Language::Rust => {
            if let Some(c) = RUST_IMPL.captures(line) {
                let target = impl_target(c.get(2)?.as_str())?;
                return Some(def(c.get(1)?.as_str(), ChunkKind::Class, target));
            }
            let c = RUST_ITEM.captures(line)?;
            let keyword = c.get(2)?.as_str();
            // `mod foo;` declares a file, it has no body here.
            if keyword == "mod" && line.trim_end().ends_with(';') {
                return None;
            }
            let kind = if keyword == "fn" {
                ChunkKind::Function
            } else {
                ChunkKind::Class
            };
            Some(def(c.get(1)?.as_str(), kind, c.get(3)?.as_str().to_string()))
        }
        Language::Python => {
            let c = PYTHON_DEF.captures(line)?;
            let kind = if c.get(2)?.as_str() == "class" {
                ChunkKind::Class
            } else {
                ChunkKind::Function
            };
            Some(def(c.get(1)?.as_str(), kind, c.get(3)?.as_str().to_string()))
        }
        Language::JavaScript => {
            if let Some(c) = JS_DEF.captures(line) {
                let kind = if c.get(2)?.as_str() == "class" {
                    ChunkKind::Class
                } else {
                    ChunkKind::Function
                };
                return Some(def(c.get(1)?.as_str(), kind, c.get(3)?.as_str().to_string()));
            }
            let c = JS_ARROW.captures(line)?;
            Some(def(c.get(1)?.as_str(), ChunkKind::Function, c.get(2)?.as_str().to_string()))
        }
        Language::Go => {
            if let Some(c) = GO_FUNC.captures(line) {
                let name = c.get(3)?.as_str();
                let name = match c.get(2) {
                    Some(recv) => format!("{}.{name}", recv.as_str()),
                    None => name.to_string(),
                };
                return Some(def(c.get(1)?.as_str(), ChunkKind::Function, name));
            }
            let c = GO_TYPE.captures(line)?;
            Some(def(c.get(1)?.as_str(), ChunkKind::Class, c.get(2)?.as_str().to_string()))
        }
    }
}

fn is_comment_line(language: Language, trimmed: &str) -> bool {
    match language {
        Language::Python => trimmed.starts_with('#'),
        Language::Rust => trimmed.starts_with("//") || trimmed.starts_with("#["),
        _ => {
            trimmed.starts_with("//")
                || trimmed.starts_with("/*")
                || trimmed.starts_with('*')
                || trimmed.starts_with('@')
        }
    }
}

/// First line of the comment/attribute block directly above `line`.
fn attached_start(language: Language, lines: &[&str], line: usize) -> usize {
    let mut start = line;
    while start > 0 && is_comment_line(language, lines[start - 1].trim()) {
        start -= 1;
    }
    start
}

fn strip_comment_marker(trimmed: &str) -> Option<&str> {
    for marker in ["///", "//!", "//", "/**", "/*", "*/", "*", "#"] {
        if let Some(rest) = trimmed.strip_prefix(marker) {
            if marker == "#" && rest.starts_with('[') {
                return None;
            }
            return Some(rest.trim_end_matches("*/").trim());
        }
    }
    None
}

/// Doc comment lines directly above a definition.
fn comment_doc(language: Language, lines: &[&str], line: usize) -> Option<String> {
    let start = attached_start(language, lines, line);
    let doc: Vec<&str> = lines[start..line]
        .iter()
        .filter_map(|l| strip_comment_marker(l.trim()))
        .filter(|l| !l.is_empty())
        .collect();
    (!doc.is_empty()).then(|| doc.join("\n"))
}

/// Python docstring: the first statement of the body, if it is a string.
fn python_docstring(lines: &[&str], def_line: usize, end: usize) -> Option<String> {
    let mut i = def_line;
    // Skip the rest of a signature that spans several lines.
    while i <= end && !lines[i].trim_end().ends_with(':') {
        i += 1;
    }
    let first = (i + 1..=end).find(|&j| !lines[j].trim().is_empty())?;
    let head = lines[first].trim();
    let quote = ["\"\"\"", "'''"].into_iter().find(|q| {
        head.starts_with(q) || head.strip_prefix(['r', 'R']).is_some_and(|h| h.starts_with(q))
    })?;
    let opened = head.trim_start_matches(['r', 'R']).strip_prefix(quote)?;

    if let Some((inner, _)) = opened.split_once(quote) {
        let inner = inner.trim();
        return (!inner.is_empty()).then(|| inner.to_string());
    }
    let mut parts = vec![opened.trim().to_string()];
    for l in lines.iter().take(end + 1).skip(first + 1) {
        if let Some((inner, _)) = l.split_once(quote) {
            parts.push(inner.trim().to_string());
            break;
        }
        parts.push(l.trim().to_string());
    }
    let doc = parts
        .into_iter()
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    (!doc.is_empty()).then_some(doc)
}

/// Leading module documentation (`//!` lines or a Python module docstring).
fn module_doc(language: Option<Language>, lines: &[&str]) -> Option<String> {
    match language {
        Some(Language::Python) if !lines.is_empty() => {
            // Treat the file as the body of a definition on a virtual line.
            let mut padded = vec![":"];
            padded.extend_from_slice(lines);
            python_docstring(&padded, 0, padded.len() - 1)
        }
        Some(Language::Rust) => {
            let doc: Vec<&str> = lines
                .iter()
                .map(|l| l.trim())
                .take_while(|l| l.starts_with("//!") || l.is_empty())
                .filter_map(|l| l.strip_prefix("//!"))
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .collect();
            (!doc.is_empty()).then(|| doc.join("\n"))
        }
        _ => None,
    }
}

fn file_stem(path: &str) -> String {
    let file = path.rsplit('/').next().unwrap_or(path);
    match file.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => file.to_string(),
    }
}

/// Extract chunks from one file. `path` is the index-relative path, whose
/// extension selects the language. Blank files yield no chunks.
pub fn extract_chunks(path: &str, source: &str) -> Vec<CodeChunk> {
    let lines: Vec<&str> = source.lines().collect();
    if lines.iter().all(|l| l.trim().is_empty()) {
        return Vec::new();
    }
    let language = path
        .rsplit_once('.')
        .and_then(|(_, ext)| Language::from_extension(ext));

    let defs: Vec<Definition> = match language {
        Some(lang) => lines
            .iter()
            .enumerate()
            .filter_map(|(i, l)| match_definition(lang, l, i))
            .collect(),
        None => Vec::new(),
    };

    let Some(lang) = language.filter(|_| !defs.is_empty()) else {
        return vec![CodeChunk {
            path: path.to_string(),
            kind: ChunkKind::Module,
            name: file_stem(path),
            text: lines.join("\n"),
            start_line: 1,
            end_line: lines.len(),
            docstring: module_doc(language, &lines),
            embedding: None,
        }];
    };

    // Inclusive 0-based end line of each definition.
    let ends: Vec<usize> = defs
        .iter()
        .enumerate()
        .map(|(i, d)| {
            let next = defs.iter().skip(i + 1).find(|n| n.indent <= d.indent);
            let mut end = match next {
                Some(n) => attached_start(lang, &lines, n.line).saturating_sub(1),
                None => lines.len() - 1,
            };
            while end > d.line && lines[end].trim().is_empty() {
                end -= 1;
            }
            end.max(d.line)
        })
        .collect();

    let mut names: Vec<String> = Vec::with_capacity(defs.len());
    for (i, d) in defs.iter().enumerate() {
        // Innermost enclosing definition, if any.
        let parent = (0..i)
            .rev()
            .find(|&p| defs[p].indent < d.indent && ends[p] >= d.line);
        let name = match parent {
            Some(p) if defs[p].kind == ChunkKind::Class => {
                format!("{}{}{}", names[p], lang.separator(), d.name)
            }
            _ => d.name.clone(),
        };
        names.push(name);
    }

    let mut seen: HashMap<String, usize> = HashMap::new();
    defs.iter()
        .zip(ends)
        .zip(names)
        .map(|((d, end), name)| {
            let count = seen.entry(name.clone()).or_insert(0);
            *count += 1;
            let name = if *count > 1 {
                format!("{name}@L{}", d.line + 1)
            } else {
                name
            };
            let docstring = match lang {
                Language::Python => python_docstring(&lines, d.line, end),
                _ => comment_doc(lang, &lines, d.line),
            };
            CodeChunk {
                path: path.to_string(),
                kind: d.kind,
                name,
                text: lines[d.line..=end].join("\n"),
                start_line: d.line + 1,
                end_line: end + 1,
                docstring,
                embedding: None,
            }
        })
        .collect()
}
