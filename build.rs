use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

/// Crate directories whose sources are held to the lint policy.
const SOURCE_ROOTS: [&str; 6] = ["engine", "data", "voi", "cli", "tests", "benches"];

// Collects every matching line of one file so the error names all of them.
struct DeadCodeCollector {
    violations: Vec<String>,
    file_path: PathBuf,
}

impl DeadCodeCollector {
    fn new(file_path: &Path) -> Self {
        Self {
            violations: Vec::new(),
            file_path: file_path.to_path_buf(),
        }
    }

    fn check_and_get_error_message(&self) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }
        let file_name = self.file_path.to_str().unwrap_or("?");
        let mut message = format!(
            "\n\n❌ #[allow(dead_code)] found in {file_name}. Delete the unused item instead:\n"
        );
        for violation in &self.violations {
            message.push_str(&format!("   {file_name}:{violation}\n"));
        }
        Some(message)
    }
}

impl Sink for DeadCodeCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        self.violations.push(format!("{line_number}:{line_text}"));
        Ok(true)
    }
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for root in SOURCE_ROOTS {
        println!("cargo:rerun-if-changed={root}");
    }

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    println!("cargo:rustc-env=TRD_CEA_BUILD_TIMESTAMP={timestamp}");

    if let Err(e) = scan_for_allow_dead_code() {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

fn scan_for_allow_dead_code() -> Result<(), Box<dyn Error>> {
    let pattern = r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]";
    let matcher = RegexMatcher::new_line_matcher(pattern)?;
    let mut searcher = Searcher::new();

    for entry in SOURCE_ROOTS
        .iter()
        .flat_map(|root| WalkDir::new(root).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
    {
        let path = entry.path();
        let mut collector = DeadCodeCollector::new(path);
        searcher.search_path(&matcher, path, &mut collector)?;
        if let Some(error_message) = collector.check_and_get_error_message() {
            return Err(error_message.into());
        }
    }
    Ok(())
}
