// Fails the build when a lint-suppression attribute ("#[" + "allow") shows up in
// the crate's sources. Set STOCKCMD_ALLOW_CHECK=0 to skip.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const SCANNED: [&str; 2] = ["src", "tests"];

struct Violation {
    file: PathBuf,
    line: usize,
    text: String,
}

fn main() {
    println!("cargo:rerun-if-env-changed=STOCKCMD_ALLOW_CHECK");
    for dir in SCANNED {
        println!("cargo:rerun-if-changed={dir}");
    }

    if env::var("STOCKCMD_ALLOW_CHECK").is_ok_and(|value| value == "0") {
        return;
    }

    let root = PathBuf::from(env::var("CARGO_MANIFEST_DIR").expect("cargo sets CARGO_MANIFEST_DIR"));
    let mut violations = Vec::new();
    for dir in SCANNED {
        collect(&root.join(dir), &mut violations);
    }

    if violations.is_empty() {
        return;
    }

    for violation in &violations {
        eprintln!(
            "{}:{}: {}",
            violation.file.display(),
            violation.line,
            violation.text.trim()
        );
    }
    panic!(
        "{} lint suppression attribute(s) found in stockcmd; fix the lint instead",
        violations.len()
    );
}

fn collect(path: &Path, violations: &mut Vec<Violation>) {
    let Ok(entries) = fs::read_dir(path) else {
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect(&path, violations);
            continue;
        }
        if path.extension().map_or(true, |ext| ext != "rs") {
            continue;
        }
        let Ok(source) = fs::read_to_string(&path) else {
            continue;
        };
        let marker = concat!("#", "[allow");
        let inner_marker = concat!("#", "![allow");
        violations.extend(
            source
                .lines()
                .enumerate()
                .filter(|(_, text)| text.contains(marker) || text.contains(inner_marker))
                .map(|(index, text)| Violation {
                    file: path.clone(),
                    line: index + 1,
                    text: text.to_string(),
                }),
        );
    }
}
