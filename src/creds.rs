use anyhow::{bail, Context, Result};
use std::env;
use std::fs;
use std::fs::File;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use whoami::username;

/// Credentials for the EC2 endpoint, persisted as a line-delimited file:
/// access key, secret key, optional endpoint override. Lines past the
/// third are ignored.
#[derive(Clone, Debug, PartialEq)]
pub struct CredentialSet {
    pub access_key: String,
    pub secret_key: String,
    pub endpoint: Option<String>,
}

/// Path to the credentials file, `AWSSECRET` overriding the default.
pub fn config_path() -> PathBuf {
    match env::var("AWSSECRET") {
        Ok(path) => PathBuf::from(path),
        Err(_) => PathBuf::from("/home/".to_owned() + &username() + "/.awssecret"),
    }
}

/// A missing or unreadable file is an empty credential set, not an error.
pub fn read_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .map(|contents| contents.lines().map(|s| s.to_string()).collect())
        .unwrap_or_default()
}

const PROMPTS: [&str; 3] = [
    "access key",
    "secret access key",
    "endpoint (blank for the AWS default)",
];

/// Prompt for each credential line in turn, echoing the current value as
/// the default. Blank input keeps the default; only non-empty lines are
/// written back, so a blank endpoint leaves a two-line file.
pub fn bootstrap(path: &Path, input: &mut impl BufRead, output: &mut impl Write) -> Result<()> {
    let existing = read_lines(path);
    let mut file = File::create(path)
        .with_context(|| format!("failed to open {} for writing", path.display()))?;

    for (i, prompt) in PROMPTS.iter().enumerate() {
        let default = existing.get(i).map(String::as_str).unwrap_or("");
        write!(output, "{prompt} ({default}): ")?;
        output.flush()?;

        let mut line = String::new();
        input.read_line(&mut line)?;
        let mut line = line.trim_end_matches(['\r', '\n']).to_string();
        if line.is_empty() {
            line = default.to_string();
        }
        if !line.is_empty() {
            writeln!(file, "{line}")?;
        }
    }

    Ok(())
}

/// Load credentials, running the interactive bootstrap first if the file
/// has fewer than two lines.
pub fn load(path: &Path, input: &mut impl BufRead, output: &mut impl Write) -> Result<CredentialSet> {
    let mut lines = read_lines(path);

    if lines.len() < 2 {
        writeln!(output, "Will try and update configuration in {}", path.display())?;
        bootstrap(path, input, output)?;
        lines = read_lines(path);
    }

    if lines.len() < 2 {
        bail!(
            "need at least an access key and a secret key in {}",
            path.display()
        );
    }

    Ok(CredentialSet {
        access_key: lines[0].clone(),
        secret_key: lines[1].clone(),
        endpoint: lines.get(2).filter(|s| !s.is_empty()).cloned(),
    })
}
