use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

// Directories holding this crate's Rust sources. Anything else in the checkout
// (vendored material, target/, scratch files) is left alone.
const SOURCE_DIRS: [&str; 4] = ["stack", "cli", "tests", "benches"];

const FORBIDDEN_WORDS: &str = "FIXED|CORRECTED|FIX|FIXES|NEW|CHANGED|CHANGES|CHANGE|MODIFIED|MODIFIES|MODIFY|UPDATED|UPDATES|UPDATE";

#[derive(Clone, Copy)]
enum Rule {
    UnderscorePrefix,
    ForbiddenWord,
    StarsInComment,
    AllCapsComment,
    AllowDeadCode,
}

impl Rule {
    const ALL: [Rule; 5] = [
        Rule::UnderscorePrefix,
        Rule::ForbiddenWord,
        Rule::StarsInComment,
        Rule::AllCapsComment,
        Rule::AllowDeadCode,
    ];

    fn pattern(self) -> String {
        match self {
            Rule::UnderscorePrefix => r"\b(_[a-zA-Z0-9_]+)\b".to_string(),
            Rule::ForbiddenWord => format!(r"(//|/\*|///).*(?:{FORBIDDEN_WORDS})"),
            Rule::StarsInComment => r"(//|/\*).*\*\*".to_string(),
            Rule::AllCapsComment => r"(//|/\*|///).*".to_string(),
            Rule::AllowDeadCode => r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]".to_string(),
        }
    }

    fn explanation(self) -> &'static str {
        match self {
            Rule::UnderscorePrefix => {
                "Underscore-prefixed names are not allowed in this project.\n   Either use the variable (removing the underscore) or remove it completely."
            }
            Rule::ForbiddenWord => {
                "Comments announcing fixes, changes or updates are not allowed in this project.\n   Remove them completely rather than commenting them out."
            }
            Rule::StarsInComment => {
                "The '**' pattern is not allowed in regular comments (but is allowed in doc comments)."
            }
            Rule::AllCapsComment => {
                "Comments where all alphabetic characters are uppercase are not allowed.\n   Strongly consider deleting the comment completely."
            }
            Rule::AllowDeadCode => {
                "#[allow(dead_code)] attributes are not allowed in this project.\n   Either use the code (removing the attribute) or remove it completely."
            }
        }
    }

    // The build script spells out the patterns it hunts for, so only the
    // identifier check applies to it.
    fn applies_to_build_script(self) -> bool {
        matches!(self, Rule::UnderscorePrefix)
    }

    fn accepts(self, line_text: &str) -> bool {
        match self {
            Rule::UnderscorePrefix => is_comment(line_text) || underscore_only_in_strings(line_text),
            Rule::StarsInComment => is_doc_comment(line_text),
            Rule::AllCapsComment => !comment_is_all_caps(line_text),
            Rule::ForbiddenWord | Rule::AllowDeadCode => false,
        }
    }
}

// Collects the violating lines of one file for one rule.
struct ViolationCollector {
    rule: Rule,
    violations: Vec<String>,
    file_path: PathBuf,
}

impl ViolationCollector {
    fn new(rule: Rule, file_path: &Path) -> Self {
        Self {
            rule,
            violations: Vec::new(),
            file_path: file_path.to_path_buf(),
        }
    }

    fn check_and_get_error_message(&self) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }

        let file_name = self.file_path.to_str().unwrap_or("?");
        let mut error_msg = format!(
            "\n❌ ERROR: Found {} violations in {}:\n",
            self.violations.len(),
            file_name
        );
        for violation in &self.violations {
            error_msg.push_str(&format!("   {violation}\n"));
        }
        error_msg.push_str(&format!("\n⚠️ {}\n", self.rule.explanation()));
        Some(error_msg)
    }
}

impl Sink for ViolationCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();

        if !self.rule.accepts(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn is_comment(line_text: &str) -> bool {
    let trimmed = line_text.trim_start();
    trimmed.starts_with("//") || trimmed.starts_with("/*")
}

fn is_doc_comment(line_text: &str) -> bool {
    let trimmed = line_text.trim_start();
    trimmed.starts_with("///") || trimmed.starts_with("//!")
}

// True when every underscore-prefixed token sits inside a string literal.
fn underscore_only_in_strings(line_text: &str) -> bool {
    let code: String = line_text
        .split('"')
        .enumerate()
        .filter(|(i, _)| i % 2 == 0)
        .map(|(_, part)| part)
        .collect::<Vec<_>>()
        .join(" ");
    !code
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .any(|token| token.starts_with('_') && token.len() > 1)
}

fn comment_is_all_caps(line_text: &str) -> bool {
    let trimmed = line_text.trim_start();
    let comment_text = if let Some(rest) = trimmed
        .strip_prefix("///")
        .or_else(|| trimmed.strip_prefix("//!"))
        .or_else(|| trimmed.strip_prefix("//"))
    {
        rest
    } else if let Some(idx) = line_text.find("/*") {
        let rest = &line_text[idx + 2..];
        rest.find("*/").map_or(rest, |end| &rest[..end])
    } else {
        return false;
    };

    let mut alphabetic = comment_text.chars().filter(|c| c.is_alphabetic()).peekable();
    alphabetic.peek().is_some() && alphabetic.all(char::is_uppercase)
}

fn rust_sources() -> impl Iterator<Item = PathBuf> {
    SOURCE_DIRS
        .into_iter()
        .flat_map(|dir| WalkDir::new(dir).into_iter().filter_map(|e| e.ok()))
        .map(|entry| entry.into_path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "rs"))
        .chain(std::iter::once(PathBuf::from("build.rs")))
}

fn scan(rule: Rule) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(&rule.pattern())?;
    let mut searcher = Searcher::new();

    for path in rust_sources() {
        if path == Path::new("build.rs") && !rule.applies_to_build_script() {
            continue;
        }
        let mut collector = ViolationCollector::new(rule, &path);
        searcher.search_path(&matcher, &path, &mut collector)?;
        if let Some(error_message) = collector.check_and_get_error_message() {
            return Err(error_message.into());
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    let build_timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    println!("cargo:rustc-env=RLT_BUILD_TIMESTAMP={build_timestamp}");

    for rule in Rule::ALL {
        if let Err(e) = scan(rule) {
            // eprintln keeps the report visible in cargo's output.
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
