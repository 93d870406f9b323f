//! `oncommit` command specifications and argument templating.

use serde::Deserialize;

use crate::payload::Commit;

/// Token replaced with the commit's `ref`.
pub const BRANCH_TOKEN: &str = "$branch";
/// Token replaced with the commit hash.
pub const HASH_TOKEN: &str = "$hash";
/// Substituted when the event lacks the field a token refers to.
pub const MISSING_VALUE: &str = "??";

/// The command a subscription runs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum OnCommit {
    /// A single program path, run without arguments.
    Line(String),
    /// Program and arguments; `$branch` and `$hash` tokens are templated.
    Args(Vec<String>),
}

impl OnCommit {
    /// Resolve into a concrete argument vector for `commit`.
    ///
    /// Only tokens that are exactly `$branch` or `$hash` are replaced.
    #[must_use]
    pub fn resolve(&self, commit: Option<&Commit>) -> Vec<String> {
        match self {
            Self::Line(line) if line.trim().is_empty() => Vec::new(),
            Self::Line(line) => vec![line.clone()],
            Self::Args(args) => {
                let branch = commit.and_then(|c| c.branch.as_deref()).unwrap_or(MISSING_VALUE);
                let hash = commit.and_then(|c| c.hash.as_deref()).unwrap_or(MISSING_VALUE);
                args.iter()
                    .map(|arg| match arg.as_str() {
                        BRANCH_TOKEN => branch.to_string(),
                        HASH_TOKEN => hash.to_string(),
                        _ => arg.clone(),
                    })
                    .collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::ChangeSet;

    fn commit(branch: Option<&str>, hash: Option<&str>) -> Commit {
        Commit {
            changes: ChangeSet::Empty,
            branch: branch.map(str::to_string),
            hash: hash.map(str::to_string),
        }
    }

    #[test]
    fn line_is_a_single_element_command() {
        let cmd = OnCommit::Line("deploy.sh".to_string());
        assert_eq!(cmd.resolve(None), vec!["deploy.sh"]);
    }

    #[test]
    fn blank_line_resolves_to_nothing() {
        assert!(OnCommit::Line("  ".to_string()).resolve(None).is_empty());
        assert!(OnCommit::Args(Vec::new()).resolve(None).is_empty());
    }

    #[test]
    fn tokens_are_substituted() {
        let cmd = OnCommit::Args(vec![
            "build.sh".to_string(),
            "$branch".to_string(),
            "--rev".to_string(),
            "$hash".to_string(),
        ]);
        let c = commit(Some("refs/heads/main"), Some("deadbeef"));
        assert_eq!(
            cmd.resolve(Some(&c)),
            vec!["build.sh", "refs/heads/main", "--rev", "deadbeef"]
        );
    }

    #[test]
    fn only_exact_tokens_are_substituted() {
        let cmd = OnCommit::Args(vec!["run".to_string(), "my$branch".to_string(), "$hash2".to_string()]);
        let c = commit(Some("main"), Some("abc"));
        assert_eq!(cmd.resolve(Some(&c)), vec!["run", "my$branch", "$hash2"]);
    }

    #[test]
    fn missing_fields_fall_back_to_placeholder() {
        let cmd = OnCommit::Args(vec!["run".to_string(), "$branch".to_string(), "$hash".to_string()]);
        assert_eq!(cmd.resolve(None), vec!["run", "??", "??"]);

        let c = commit(Some("trunk"), None);
        assert_eq!(cmd.resolve(Some(&c)), vec!["run", "trunk", "??"]);
    }

    #[test]
    fn deserializes_both_shapes() {
        let line: OnCommit = serde_yaml::from_str("deploy.sh").unwrap();
        assert_eq!(line, OnCommit::Line("deploy.sh".to_string()));

        let args: OnCommit = serde_yaml::from_str("[build.sh, $branch]").unwrap();
        assert_eq!(
            args,
            OnCommit::Args(vec!["build.sh".to_string(), "$branch".to_string()])
        );
    }
}
