// Copyright (c) The testplat Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::ipc::PipeName;
use camino::Utf8Path;
use testplat_metadata::RetryOptionNames;

/// Builds the arguments for a test host attempt.
///
/// Options the supervisor owns are removed from `args`, in both the `--opt value` and
/// `--opt=value` forms. The attempt's results directory and pipe name are appended.
pub fn test_host_args(args: &[String], results_dir: &Utf8Path, pipe_name: &PipeName) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len() + 4);
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match stripped_option(arg) {
            Some(StrippedForm::Separate) => {
                // Skip the value too, unless it's missing.
                iter.next();
            }
            Some(StrippedForm::Joined) => {}
            None => out.push(arg.clone()),
        }
    }

    out.push(format!("--{}", RetryOptionNames::RESULTS_DIRECTORY));
    out.push(results_dir.to_string());
    out.push(format!("--{}", RetryOptionNames::INTERNAL_RETRY_PIPE_NAME));
    out.push(pipe_name.to_string());
    out
}

enum StrippedForm {
    Separate,
    Joined,
}

fn stripped_option(arg: &str) -> Option<StrippedForm> {
    let name = arg.strip_prefix("--")?;
    RetryOptionNames::STRIPPED_FROM_CHILD
        .iter()
        .find_map(|option| match name.strip_prefix(option) {
            Some("") => Some(StrippedForm::Separate),
            Some(rest) if rest.starts_with('=') => Some(StrippedForm::Joined),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test_case(&["--filter", "x"], &["--filter", "x"]; "unrelated options kept")]
    #[test_case(&["--retry-failed-tests", "3", "--filter", "x"], &["--filter", "x"]; "separate value")]
    #[test_case(&["--retry-failed-tests=3", "--filter", "x"], &["--filter", "x"]; "joined value")]
    #[test_case(
        &["--retry-failed-tests-max-percentage", "10", "--retry-failed-tests=2"], &[];
        "longer option name with shared prefix"
    )]
    #[test_case(
        &["--results-directory", "old", "--internal-retry-pipename=stale", "a"], &["a"];
        "injected options replaced"
    )]
    #[test_case(&["--retry-failed-tests"], &[]; "missing value")]
    #[test_case(&["--retry-failed-tests-other", "1"], &["--retry-failed-tests-other", "1"]; "prefix of another option")]
    fn strips_supervisor_options(args: &[&str], expected_prefix: &[&str]) {
        let name = PipeName::from("pipe".to_owned());
        let out = test_host_args(&strings(args), Utf8Path::new("dir/1"), &name);

        let mut expected = strings(expected_prefix);
        expected.extend(strings(&[
            "--results-directory",
            "dir/1",
            "--internal-retry-pipename",
            "pipe",
        ]));
        assert_eq!(out, expected);
    }
}
