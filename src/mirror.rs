// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Mirror node model and ranking.
//!
//! A __mirror node__ is an alternate endpoint believed to serve the same
//! upstream repository content as the primary host. Nodes exist to route
//! around connectivity restrictions, so only repositories hosted on a
//! platform with known third-party mirrors are eligible for them. Everything
//! else is fetched directly from its configured URL.
//!
//! # URL Templates
//!
//! Each node carries a URL template describing how it rewrites an upstream
//! URL. The same template is applied to the canonical clone URL and to the
//! raw file URL used for HTTP probing. Recognized placeholders:
//!
//! - `{url}`: full upstream URL, e.g. `https://github.com/owner/repo.git`.
//! - `{path}`: upstream URL without its scheme.
//! - `{owner}`: repository owner.
//! - `{repo}`: repository name without `.git`.
//!
//! # Ranking
//!
//! Probed nodes are ranked by one total order: nodes verified against the
//! VCS protocol first, then higher historical score, then lower HTTP latency,
//! then lower configured priority.

pub mod probe;
pub mod score;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering,
    fmt::{Display, Formatter, Result as FmtResult},
    sync::LazyLock,
    time::Duration,
};

static HOSTED_REPO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(github|gitee|gitcode)\.com[/:]([^/]+)/([^/]+?)(?:\.git)?/?$")
        .expect("hosted repository pattern is valid")
});

/// Statically configured mirror node.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct MirrorNode {
    /// Unique node name, also the key of its persisted statistics.
    pub name: String,

    /// URL rewriting template.
    pub url_template: String,

    /// Human assigned tie-break. Lower is preferred.
    #[serde(default)]
    pub priority: u32,

    /// Whether the node can serve raw files for HTTP probing.
    #[serde(default = "default_http_probe")]
    pub http_probe: bool,
}

fn default_http_probe() -> bool {
    true
}

impl MirrorNode {
    /// Construct new mirror node.
    pub fn new(name: impl Into<String>, url_template: impl Into<String>, priority: u32) -> Self {
        Self {
            name: name.into(),
            url_template: url_template.into(),
            priority,
            http_probe: true,
        }
    }

    /// Default node list: direct access plus well-known proxy mirrors.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new("GitHub", "{url}", 0),
            Self::new("Ghfast", "https://ghfast.top/{url}", 10),
            Self::new("GhproxyNet", "https://ghproxy.net/{url}", 20),
            Self::new("MirrorGhproxy", "https://mirror.ghproxy.com/{url}", 30),
            Self {
                http_probe: false,
                ..Self::new("GitClone", "https://gitclone.com/{path}", 40)
            },
        ]
    }

    /// Construct clone URL of repository through this node.
    ///
    /// Repositories on platforms without mirrors always use their configured
    /// URL.
    pub fn clone_url(&self, repo: &RepoUrl) -> String {
        match repo.canonical_clone_url() {
            Some(canonical) => self.render(&canonical, repo),
            None => repo.as_str().to_string(),
        }
    }

    /// Construct URL of a small known file fetched through this node.
    ///
    /// Returns `None` if node cannot serve raw files, or repository is not
    /// mirrored.
    pub fn probe_url(&self, repo: &RepoUrl, branch: &str, file: &str) -> Option<String> {
        if !self.http_probe {
            return None;
        }

        repo.raw_file_url(branch, file)
            .map(|upstream| self.render(&upstream, repo))
    }

    fn render(&self, upstream: &str, repo: &RepoUrl) -> String {
        let path = upstream
            .split_once("://")
            .map_or(upstream, |(_, rest)| rest);

        self.url_template
            .replace("{url}", upstream)
            .replace("{path}", path)
            .replace("{owner}", repo.owner().unwrap_or_default())
            .replace("{repo}", repo.name().unwrap_or_default())
    }
}

/// Hosting platform of a repository URL.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Platform {
    GitHub,
    Gitee,
    GitCode,
    Unknown,
}

impl Platform {
    /// Platform has known third-party mirror endpoints.
    pub fn is_mirrored(self) -> bool {
        matches!(self, Self::GitHub)
    }
}

impl Display for Platform {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let name = match self {
            Self::GitHub => "github",
            Self::Gitee => "gitee",
            Self::GitCode => "gitcode",
            Self::Unknown => "direct",
        };
        fmt.write_str(name)
    }
}

/// Parsed upstream repository URL.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct RepoUrl {
    url: String,
    platform: Platform,
    owner: Option<String>,
    name: Option<String>,
}

impl RepoUrl {
    /// Parse repository URL.
    ///
    /// URLs that do not match a known hosting platform are kept verbatim with
    /// [`Platform::Unknown`].
    pub fn parse(url: impl Into<String>) -> Self {
        let url = url.into();
        let Some(captures) = HOSTED_REPO.captures(&url) else {
            return Self {
                url,
                platform: Platform::Unknown,
                owner: None,
                name: None,
            };
        };

        let platform = match &captures[1] {
            "github" => Platform::GitHub,
            "gitee" => Platform::Gitee,
            _ => Platform::GitCode,
        };
        let owner = Some(captures[2].to_string());
        let name = Some(captures[3].to_string());

        Self {
            url,
            platform,
            owner,
            name,
        }
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Repository is eligible for mirror node routing.
    pub fn is_mirrored(&self) -> bool {
        self.platform.is_mirrored()
    }

    fn canonical_clone_url(&self) -> Option<String> {
        match (self.platform, &self.owner, &self.name) {
            (Platform::GitHub, Some(owner), Some(name)) => {
                Some(format!("https://github.com/{owner}/{name}.git"))
            }
            _ => None,
        }
    }

    fn raw_file_url(&self, branch: &str, file: &str) -> Option<String> {
        match (self.platform, &self.owner, &self.name) {
            (Platform::GitHub, Some(owner), Some(name)) => Some(format!(
                "https://raw.githubusercontent.com/{owner}/{name}/{branch}/{file}"
            )),
            _ => None,
        }
    }
}

impl Display for RepoUrl {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(&self.url)
    }
}

/// Mirror node with the results of one probing round.
///
/// Only valid for the acquisition attempt that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbedNode {
    pub node: MirrorNode,
    pub http_available: bool,
    pub http_latency: Option<Duration>,
    pub vcs_available: bool,
    pub score: f64,
}

impl ProbedNode {
    /// Pseudo-node for repositories fetched directly from their configured
    /// URL.
    pub fn direct(repo: &RepoUrl) -> Self {
        Self {
            node: MirrorNode::new(repo.platform().to_string(), "{url}", 0),
            http_available: false,
            http_latency: None,
            vcs_available: false,
            score: 0.0,
        }
    }

    /// Node passed at least one probe.
    pub fn is_eligible(&self) -> bool {
        self.http_available || self.vcs_available
    }

    pub fn name(&self) -> &str {
        self.node.name.as_str()
    }
}

/// Sort probed nodes into attempt order.
pub fn rank(mut nodes: Vec<ProbedNode>) -> Vec<ProbedNode> {
    nodes.sort_by(attempt_order);
    nodes
}

fn attempt_order(a: &ProbedNode, b: &ProbedNode) -> Ordering {
    b.vcs_available
        .cmp(&a.vcs_available)
        .then_with(|| b.score.total_cmp(&a.score))
        .then_with(|| latency_key(a).cmp(&latency_key(b)))
        .then_with(|| a.node.priority.cmp(&b.node.priority))
}

fn latency_key(node: &ProbedNode) -> Duration {
    node.http_latency.unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;

    fn probed(name: &str, vcs: bool, score: f64, latency_ms: Option<u64>, priority: u32) -> ProbedNode {
        ProbedNode {
            node: MirrorNode::new(name, "{url}", priority),
            http_available: latency_ms.is_some(),
            http_latency: latency_ms.map(Duration::from_millis),
            vcs_available: vcs,
            score,
        }
    }

    #[test_case("https://github.com/owner/repo.git", Platform::GitHub; "github https")]
    #[test_case("git@github.com:owner/repo.git", Platform::GitHub; "github ssh")]
    #[test_case("https://gitee.com/owner/repo", Platform::Gitee; "gitee without suffix")]
    #[test_case("https://gitcode.com/owner/repo.git", Platform::GitCode; "gitcode")]
    #[test_case("file:///srv/git/repo.git", Platform::Unknown; "local file url")]
    #[test]
    fn parse_platform(url: &str, expect: Platform) {
        pretty_assertions::assert_eq!(RepoUrl::parse(url).platform(), expect);
    }

    #[test]
    fn parse_owner_and_name() {
        let repo = RepoUrl::parse("https://github.com/owner/gallery-core.git");
        assert_eq!(repo.owner(), Some("owner"));
        assert_eq!(repo.name(), Some("gallery-core"));
    }

    #[test_case("{url}", "https://github.com/owner/repo.git"; "direct")]
    #[test_case("https://ghfast.top/{url}", "https://ghfast.top/https://github.com/owner/repo.git"; "prefix proxy")]
    #[test_case("https://gitclone.com/{path}", "https://gitclone.com/github.com/owner/repo.git"; "scheme stripped")]
    #[test_case("https://mirror.example/{owner}/{repo}.git", "https://mirror.example/owner/repo.git"; "owner and name")]
    #[test]
    fn render_clone_url(template: &str, expect: &str) {
        let repo = RepoUrl::parse("git@github.com:owner/repo.git");
        let node = MirrorNode::new("node", template, 0);
        pretty_assertions::assert_eq!(node.clone_url(&repo), expect);
    }

    #[test]
    fn unmirrored_repository_keeps_configured_url() {
        let repo = RepoUrl::parse("https://gitee.com/owner/repo.git");
        let node = MirrorNode::new("Ghfast", "https://ghfast.top/{url}", 0);
        assert_eq!(node.clone_url(&repo), "https://gitee.com/owner/repo.git");
        assert_eq!(node.probe_url(&repo, "main", "README.md"), None);
    }

    #[test]
    fn probe_url_goes_through_template() {
        let repo = RepoUrl::parse("https://github.com/owner/repo.git");
        let node = MirrorNode::new("Ghfast", "https://ghfast.top/{url}", 0);
        assert_eq!(
            node.probe_url(&repo, "dev", "README.md").as_deref(),
            Some("https://ghfast.top/https://raw.githubusercontent.com/owner/repo/dev/README.md")
        );

        let node = MirrorNode {
            http_probe: false,
            ..node
        };
        assert_eq!(node.probe_url(&repo, "dev", "README.md"), None);
    }

    #[test]
    fn vcs_available_sorts_before_higher_score() {
        let ranked = rank(vec![
            probed("B", false, 0.95, Some(10), 0),
            probed("A", true, 0.9, Some(500), 1),
        ]);
        let names = ranked.iter().map(ProbedNode::name).collect::<Vec<_>>();
        assert_eq!(names, vec!["A", "B"]);
    }

    #[test]
    fn rank_breaks_ties_by_score_then_latency_then_priority() {
        let ranked = rank(vec![
            probed("slow", true, 0.5, Some(900), 0),
            probed("unmeasured", true, 0.5, None, 0),
            probed("best", true, 0.8, Some(999), 9),
            probed("fast-low-priority", true, 0.5, Some(100), 5),
            probed("fast-high-priority", true, 0.5, Some(100), 1),
            probed("http-only", false, 1.0, Some(1), 0),
        ]);
        let names = ranked.iter().map(ProbedNode::name).collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![
                "best",
                "fast-high-priority",
                "fast-low-priority",
                "slow",
                "unmeasured",
                "http-only",
            ]
        );
    }
}
