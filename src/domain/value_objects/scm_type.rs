use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Source control system backing a repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScmType {
    Git,
    #[serde(alias = "hg")]
    Mercurial,
    #[serde(alias = "svn")]
    Subversion,
    Cvs,
    #[serde(alias = "p4")]
    Perforce,
    /// Google's `repo` meta tool managing a tree of Git repositories
    Repo,
    #[serde(alias = "sccs")]
    Teamware,
}

impl fmt::Display for ScmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.config_key())
    }
}

impl FromStr for ScmType {
    type Err = ScmTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "git" => Ok(ScmType::Git),
            "mercurial" | "hg" => Ok(ScmType::Mercurial),
            "subversion" | "svn" => Ok(ScmType::Subversion),
            "cvs" => Ok(ScmType::Cvs),
            "perforce" | "p4" => Ok(ScmType::Perforce),
            "repo" => Ok(ScmType::Repo),
            "teamware" | "sccs" => Ok(ScmType::Teamware),
            _ => Err(ScmTypeError::UnsupportedScmType(s.to_string())),
        }
    }
}

impl ScmType {
    pub const ALL: [ScmType; 7] = [
        ScmType::Git,
        ScmType::Mercurial,
        ScmType::Subversion,
        ScmType::Cvs,
        ScmType::Perforce,
        ScmType::Repo,
        ScmType::Teamware,
    ];

    /// Key used for this SCM in the `commands` configuration section
    pub fn config_key(&self) -> &'static str {
        match self {
            ScmType::Git => "git",
            ScmType::Mercurial => "mercurial",
            ScmType::Subversion => "subversion",
            ScmType::Cvs => "cvs",
            ScmType::Perforce => "perforce",
            ScmType::Repo => "repo",
            ScmType::Teamware => "teamware",
        }
    }

    /// Get the metadata directory name for this SCM
    pub fn metadata_dir(&self) -> &'static str {
        match self {
            ScmType::Git => ".git",
            ScmType::Mercurial => ".hg",
            ScmType::Subversion => ".svn",
            ScmType::Cvs => "CVS",
            ScmType::Perforce => ".p4config",
            ScmType::Repo => ".repo",
            ScmType::Teamware => "Codemgr_wsdata",
        }
    }

    /// Get the standard executable name for this SCM
    pub fn executable_name(&self) -> &'static str {
        match self {
            ScmType::Git => "git",
            ScmType::Mercurial => "hg",
            ScmType::Subversion => "svn",
            ScmType::Cvs => "cvs",
            ScmType::Perforce => "p4",
            ScmType::Repo => "repo",
            ScmType::Teamware => "bringover",
        }
    }

    /// Whether processing this repository covers every repository below it
    pub fn is_top_level(&self) -> bool {
        matches!(self, ScmType::Repo)
    }
}

/// Errors that can occur when working with SCM types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScmTypeError {
    /// The specified SCM type is not supported
    UnsupportedScmType(String),
}

impl fmt::Display for ScmTypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScmTypeError::UnsupportedScmType(scm) => write!(
                f,
                "Unsupported SCM type: '{}'. Supported types are: git, mercurial, subversion, cvs, perforce, repo, teamware",
                scm
            ),
        }
    }
}

impl std::error::Error for ScmTypeError {}
