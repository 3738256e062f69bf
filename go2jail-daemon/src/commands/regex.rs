//! `go2jail regex` — try patterns against the lines of a file.
//!
//! Prints `MATCH` with the extracted groups for lines that match (and
//! are not ignored), `MISS:` otherwise.

use std::io::{BufRead, BufReader};

use anyhow::{Context, Result};

use go2jail_core::matcher::Matcher;

use crate::cli::RegexArgs;

pub fn run(args: RegexArgs) -> Result<()> {
    let matches = Matcher::compile(&args.matches)?;
    matches.expect_groups(&["ip"])?;
    let ignores = if args.ignores.is_empty() {
        None
    } else {
        Some(Matcher::compile(&args.ignores)?)
    };

    println!("match: {:?}", matches.pattern_strings());
    if let Some(ignores) = &ignores {
        println!("ignore: {:?}", ignores.pattern_strings());
    }

    let file = std::fs::File::open(&args.file)
        .with_context(|| format!("open {}", args.file.display()))?;
    for line in BufReader::new(file).lines() {
        let line = line?;
        let ignored = ignores.as_ref().is_some_and(|m| m.test(&line));
        match matches.capture(&line) {
            Some(groups) if !ignored => println!("MATCH\t{groups}"),
            _ => println!("MISS:\t{line}"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn rejects_patterns_without_ip_group() {
        let args = RegexArgs {
            matches: vec!["no group".to_owned()],
            ignores: vec![],
            file: PathBuf::from("/dev/null"),
        };
        assert!(run(args).is_err());
    }

    #[test]
    fn runs_over_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("lines.log");
        std::fs::write(&file, "1.1.1.1 root\nnothing\n").unwrap();
        let args = RegexArgs {
            matches: vec!["%(ip)".to_owned()],
            ignores: vec![],
            file,
        };
        run(args).unwrap();
    }
}
