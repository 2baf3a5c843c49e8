// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Mirror node health probing.
//!
//! Two independent checks run for every candidate node, and every candidate
//! is checked at the same time:
//!
//! 1. HTTP fetch of a small known file through the node, timing the round
//!    trip.
//! 2. `git ls-remote --heads` of the requested branch through the node's
//!    clone URL.
//!
//! Nodes failing both checks are dropped. Nodes passing only the HTTP check
//! stay, because some mirrors answer `ls-remote` badly while still serving
//! clones just fine.

use crate::{
    config::GitSettings,
    mirror::{MirrorNode, ProbedNode, RepoUrl},
    process::{Callbacks, CommandSpec, Execute, ProcessRunner},
};

use futures::future::join_all;
use std::{future::Future, time::Duration};
use tokio::time::Instant;
use tracing::{debug, info, instrument};

/// Health check of candidate mirror nodes.
pub trait NodeProbe {
    /// Probe `nodes` for `repo` on `branch`, returning every eligible node.
    fn probe(
        &self,
        repo: &RepoUrl,
        nodes: &[MirrorNode],
        branch: &str,
    ) -> impl Future<Output = Vec<ProbedNode>> + Send;
}

/// Probe nodes over the network.
#[derive(Debug, Clone)]
pub struct MirrorProber<E = ProcessRunner> {
    client: reqwest::Client,
    runner: E,
    ls_remote_timeout: Duration,
    probe_file: String,
}

impl MirrorProber<ProcessRunner> {
    /// Construct new prober from git settings.
    ///
    /// # Errors
    ///
    /// - Return [`ProbeError::Client`] if HTTP client cannot be built.
    pub fn new(settings: &GitSettings) -> Result<Self> {
        Self::with_runner(settings, ProcessRunner::new())
    }
}

impl<E> MirrorProber<E>
where
    E: Execute + Sync,
{
    /// Construct new prober using `runner` for `ls-remote` checks.
    pub fn with_runner(settings: &GitSettings, runner: E) -> Result<Self> {
        // INVARIANT: Ambient proxies never decide which node is reachable.
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(settings.probe_timeout())
            .build()?;

        Ok(Self {
            client,
            runner,
            ls_remote_timeout: settings.ls_remote_timeout(),
            probe_file: settings.probe_file.clone(),
        })
    }

    async fn probe_node(&self, repo: &RepoUrl, node: &MirrorNode, branch: &str) -> ProbedNode {
        let http = async {
            match node.probe_url(repo, branch, &self.probe_file) {
                Some(url) => self.http_check(&url).await,
                None => None,
            }
        };
        let clone_url = node.clone_url(repo);
        let vcs = self.vcs_check(&clone_url, branch);
        let (http_latency, vcs_available) = tokio::join!(http, vcs);

        debug!(
            "node {} http: {:?}, vcs: {vcs_available}",
            node.name, http_latency
        );

        ProbedNode {
            node: node.clone(),
            http_available: http_latency.is_some(),
            http_latency,
            vcs_available,
            score: 0.0,
        }
    }

    async fn http_check(&self, url: &str) -> Option<Duration> {
        let started = Instant::now();
        match self.client.get(url).send().await {
            Ok(response) if response.status().is_success() => Some(started.elapsed()),
            Ok(response) => {
                debug!("probe of {url} answered {}", response.status());
                None
            }
            Err(err) => {
                debug!("probe of {url} failed: {err}");
                None
            }
        }
    }

    async fn vcs_check(&self, clone_url: &str, branch: &str) -> bool {
        let spec = CommandSpec::git(["ls-remote", "--heads", clone_url, branch])
            .total_timeout(self.ls_remote_timeout);

        match self.runner.execute(&spec, Callbacks::none()).await {
            Ok(_) => true,
            Err(err) => {
                debug!("ls-remote of {clone_url} failed: {err}");
                false
            }
        }
    }
}

impl<E> NodeProbe for MirrorProber<E>
where
    E: Execute + Sync,
{
    #[instrument(skip(self, nodes), fields(repo = %repo), level = "debug")]
    async fn probe(&self, repo: &RepoUrl, nodes: &[MirrorNode], branch: &str) -> Vec<ProbedNode> {
        if !repo.is_mirrored() {
            debug!("{} is not mirrored, using direct access", repo.platform());
            return vec![ProbedNode::direct(repo)];
        }

        let probed = join_all(nodes.iter().map(|node| self.probe_node(repo, node, branch))).await;
        let eligible = probed
            .into_iter()
            .filter(ProbedNode::is_eligible)
            .collect::<Vec<_>>();

        info!("{} of {} mirror nodes reachable", eligible.len(), nodes.len());
        eligible
    }
}

/// Node probing error types.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// HTTP client cannot be constructed.
    #[error("failed to build HTTP probe client")]
    Client(#[from] reqwest::Error),
}

/// Friendly result alias :3
pub type Result<T, E = ProbeError> = std::result::Result<T, E>;
