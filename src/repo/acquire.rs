// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Mirror-aware repository acquisition.
//!
//! The [`Acquirer`] makes sure a repository's working copy exists and is
//! current. For repositories on a mirrored platform it probes every
//! configured mirror node, ranks them by probe results and historical score,
//! and then walks down the ranking one node at a time until one attempt
//! succeeds. Attempts for one repository never overlap.
//!
//! # Clone
//!
//! Each attempt makes a shallow clone into fresh scratch space below the
//! temp root. Only a finished clone is delivered to the working copy
//! location, see [`deliver`]. Scratch space is dropped on every exit path.
//!
//! # Update
//!
//! Each attempt points `origin` at the node, then tries a fast-forward-only
//! pull. Working copies are disposable projections of upstream, so a pull
//! refused because local history diverged is resolved by fetching and hard
//! resetting onto the remote branch.

use crate::{
    config::{GitSettings, OptionalContentRule},
    mirror::{
        probe::{MirrorProber, NodeProbe, ProbeError},
        rank,
        score::NodeScorer,
        ProbedNode,
    },
    process::{Callbacks, CommandSpec, Execute, ProcessError, ProcessRunner},
    repo::{
        deliver::{deliver, remove_path, DeliveryError},
        exclude::{ExcludeDrafter, ExcludeError},
        head_oid, RepositoryDescriptor,
    },
};

use mkdirp::mkdirp;
use std::{
    fs::read_dir,
    path::{Path, PathBuf},
    time::Duration,
};
use tempfile::{Builder as TempBuilder, TempDir};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Node name reported when every candidate failed.
pub const ALL_NODES_FAILED: &str = "All Nodes Failed";

const SCRATCH_PREFIX: &str = "tmpclone-";

const CONFLICT_SIGNATURES: [&str; 8] = [
    "not possible to fast-forward",
    "diverging branches",
    "divergent branches",
    "unrelated histories",
    "commit your changes",
    "needs merge",
    "non-fast-forward",
    "would be overwritten",
];

/// What to do with a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Clone,
    Update,
}

/// Outcome of one acquisition call.
#[derive(Debug)]
pub struct AcquisitionResult {
    /// Node that served the successful attempt, the platform name for
    /// direct access, or [`ALL_NODES_FAILED`].
    pub node_name: String,

    /// Update resolved a conflict by hard resetting onto upstream.
    pub was_force_reset: bool,

    /// Working copy `HEAD` moved.
    pub has_changes: bool,

    /// Terminal error, `None` on success.
    pub error: Option<AcquireError>,
}

impl AcquisitionResult {
    fn succeeded(node_name: impl Into<String>, was_force_reset: bool) -> Self {
        Self {
            node_name: node_name.into(),
            was_force_reset,
            has_changes: true,
            error: None,
        }
    }

    fn failed(node_name: impl Into<String>, error: AcquireError) -> Self {
        Self {
            node_name: node_name.into(),
            was_force_reset: false,
            has_changes: false,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Classification of a failed fast-forward pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullFailure {
    /// Local history cannot be fast-forwarded onto upstream.
    Conflict,

    /// Anything else, most likely the network.
    Other,
}

/// Classify failed pull by its diagnostic output.
///
/// Only known conflict signatures count as conflicts. Everything
/// unrecognized is reported as [`PullFailure::Other`].
pub fn classify_pull_failure(stderr: &str) -> PullFailure {
    let stderr = stderr.to_lowercase();
    if CONFLICT_SIGNATURES
        .iter()
        .any(|signature| stderr.contains(signature))
    {
        PullFailure::Conflict
    } else {
        PullFailure::Other
    }
}

/// Clone and update repositories through ranked mirror nodes.
#[derive(Debug)]
pub struct Acquirer<P = MirrorProber, E = ProcessRunner> {
    settings: GitSettings,
    temp_root: PathBuf,
    scorer: NodeScorer,
    prober: P,
    runner: E,
    optional_content: Vec<OptionalContentRule>,
}

impl Acquirer<MirrorProber, ProcessRunner> {
    /// Construct new acquirer driving real processes over the network.
    ///
    /// # Errors
    ///
    /// - Return [`ProbeError`] if HTTP probe client cannot be built.
    pub fn new(
        settings: GitSettings,
        temp_root: impl Into<PathBuf>,
        scorer: NodeScorer,
    ) -> Result<Self, ProbeError> {
        let prober = MirrorProber::new(&settings)?;
        Ok(Self::with_parts(settings, temp_root, scorer, prober, ProcessRunner::new()))
    }
}

impl<P, E> Acquirer<P, E>
where
    P: NodeProbe + Sync,
    E: Execute + Sync,
{
    /// Construct new acquirer from explicit collaborators.
    pub fn with_parts(
        settings: GitSettings,
        temp_root: impl Into<PathBuf>,
        scorer: NodeScorer,
        prober: P,
        runner: E,
    ) -> Self {
        Self {
            settings,
            temp_root: temp_root.into(),
            scorer,
            prober,
            runner,
            optional_content: Vec::new(),
        }
    }

    /// Exclude optional folders from working copies after acquisition.
    pub fn with_optional_content(mut self, rules: Vec<OptionalContentRule>) -> Self {
        self.optional_content = rules;
        self
    }

    /// Clone or update `repo`.
    pub async fn acquire(&self, repo: &RepositoryDescriptor, mode: Mode) -> AcquisitionResult {
        match mode {
            Mode::Clone => self.clone_repository(repo, None).await,
            Mode::Update => self.update_repository(repo).await,
        }
    }

    /// Clone `repo` into its working copy location.
    ///
    /// When `on_progress` is given it sees every transfer percentage, and
    /// each attempt is bounded by the no-progress timeout instead of the
    /// total clone timeout.
    #[instrument(skip_all, fields(repo = repo.id()), level = "debug")]
    pub async fn clone_repository<'o>(
        &self,
        repo: &RepositoryDescriptor,
        mut on_progress: Option<&mut (dyn FnMut(u8) + Send + 'o)>,
    ) -> AcquisitionResult {
        if !repo.url().is_mirrored() {
            let node = ProbedNode::direct(repo.url());
            info!("cloning {} directly from {}", repo.id(), repo.url());
            return match self.clone_through(repo, &node, on_progress).await {
                Ok(()) => self.finish_clone(repo, node.name()),
                Err(err) => AcquisitionResult::failed(node.name(), err),
            };
        }

        let ranked = self.rank_nodes(repo).await;
        let attempted = ranked.len();
        let mut last = None;
        for node in &ranked {
            let started = Instant::now();
            match self.clone_through(repo, node, on_progress.as_deref_mut()).await {
                Ok(()) => {
                    self.record(node, true, started.elapsed());
                    return self.finish_clone(repo, node.name());
                }
                Err(err @ AcquireError::Delivery(_)) => {
                    // INVARIANT: Node served the clone, only local delivery failed.
                    self.record(node, true, started.elapsed());
                    error!("clone through {} could not be delivered: {err}", node.name());
                    return AcquisitionResult::failed(node.name(), err);
                }
                Err(err) => {
                    self.record(node, false, started.elapsed());
                    warn!("clone through {} failed: {err}", node.name());
                    last = Some(Box::new(err));
                }
            }
        }

        AcquisitionResult::failed(
            ALL_NODES_FAILED,
            AcquireError::AllNodesExhausted { attempted, last },
        )
    }

    /// Update working copy of `repo` in place.
    #[instrument(skip_all, fields(repo = repo.id()), level = "debug")]
    pub async fn update_repository(&self, repo: &RepositoryDescriptor) -> AcquisitionResult {
        if !repo.is_downloaded() {
            return AcquisitionResult::failed(
                repo.url().platform().to_string(),
                AcquireError::NotDownloaded {
                    path: repo.local_path().to_path_buf(),
                },
            );
        }

        let before = head_oid(repo.local_path());
        let mut result = self.update_through_nodes(repo).await;
        if result.is_success() {
            result.has_changes = head_oid(repo.local_path()) != before;
            self.apply_optional_content(repo);
        }

        result
    }

    async fn update_through_nodes(&self, repo: &RepositoryDescriptor) -> AcquisitionResult {
        let direct = repo.url().platform().to_string();
        if !repo.url().is_mirrored() {
            return match self.pull(repo).await {
                Ok(forced) => AcquisitionResult::succeeded(direct, forced),
                Err(err) => AcquisitionResult::failed(direct, err),
            };
        }

        let ranked = self.rank_nodes(repo).await;
        if ranked.is_empty() {
            warn!("no mirror node reachable, updating {} from {}", repo.id(), repo.url());
            let outcome = match self.set_origin(repo, repo.url().as_str()).await {
                Ok(()) => self.pull(repo).await,
                Err(err) => Err(err),
            };
            return match outcome {
                Ok(forced) => AcquisitionResult::succeeded(direct, forced),
                Err(err) => AcquisitionResult::failed(
                    ALL_NODES_FAILED,
                    AcquireError::AllNodesExhausted {
                        attempted: 0,
                        last: Some(Box::new(err)),
                    },
                ),
            };
        }

        let attempted = ranked.len();
        let mut last = None;
        for node in &ranked {
            let started = Instant::now();
            let url = node.node.clone_url(repo.url());
            info!("updating {} through {} ({url})", repo.id(), node.name());

            let outcome = match self.set_origin(repo, &url).await {
                Ok(()) => self.pull(repo).await,
                Err(err) => Err(err),
            };

            match outcome {
                Ok(forced) => {
                    self.record(node, true, started.elapsed());
                    return AcquisitionResult::succeeded(node.name(), forced);
                }
                Err(err) => {
                    self.record(node, false, started.elapsed());
                    warn!("update through {} failed: {err}", node.name());
                    last = Some(Box::new(err));
                }
            }
        }

        AcquisitionResult::failed(
            ALL_NODES_FAILED,
            AcquireError::AllNodesExhausted { attempted, last },
        )
    }

    async fn rank_nodes(&self, repo: &RepositoryDescriptor) -> Vec<ProbedNode> {
        let mut probed = self
            .prober
            .probe(repo.url(), &self.settings.mirrors, repo.branch())
            .await;

        for node in &mut probed {
            node.score = self.scorer.score(node.name()).unwrap_or_else(|err| {
                warn!("cannot read statistics of {}: {err}", node.name());
                0.0
            });
        }

        let ranked = rank(probed);
        info!(
            "node order for {}: {}",
            repo.id(),
            ranked
                .iter()
                .map(|node| format!("{}({:.2})", node.name(), node.score))
                .collect::<Vec<_>>()
                .join(" -> ")
        );

        ranked
    }

    async fn clone_through<'o>(
        &self,
        repo: &RepositoryDescriptor,
        node: &ProbedNode,
        on_progress: Option<&mut (dyn FnMut(u8) + Send + 'o)>,
    ) -> Result<()> {
        let scratch = self.scratch()?;
        let checkout = scratch.path().join(repo.local_name());
        let url = node.node.clone_url(repo.url());
        info!("cloning {} through {} ({url})", repo.id(), node.name());

        let spec = CommandSpec::git([
            "clone".to_string(),
            format!("--depth={}", self.settings.clone_depth),
            "--progress".to_string(),
            "--branch".to_string(),
            repo.branch().to_string(),
            url,
            checkout.to_string_lossy().into_owned(),
        ])
        .total_timeout(self.settings.clone_timeout())
        .no_progress_timeout(self.settings.no_progress_timeout());

        let callbacks = match on_progress {
            Some(observer) => Callbacks::with_progress(observer),
            None => Callbacks::none(),
        };
        self.runner.execute(&spec, callbacks).await?;

        deliver(&checkout, repo.local_path(), self.settings.delivery_grace()).await?;

        // INVARIANT: Scratch space is removed here, or on any earlier return.
        drop(scratch);

        Ok(())
    }

    fn finish_clone(&self, repo: &RepositoryDescriptor, node_name: &str) -> AcquisitionResult {
        info!("cloned {} through {node_name}", repo.id());
        self.apply_optional_content(repo);
        AcquisitionResult::succeeded(node_name, false)
    }

    fn scratch(&self) -> Result<TempDir> {
        mkdirp(&self.temp_root).map_err(|err| AcquireError::Scratch {
            source: err,
            path: self.temp_root.clone(),
        })?;

        TempBuilder::new()
            .prefix(SCRATCH_PREFIX)
            .tempdir_in(&self.temp_root)
            .map_err(|err| AcquireError::Scratch {
                source: err,
                path: self.temp_root.clone(),
            })
    }

    async fn set_origin(&self, repo: &RepositoryDescriptor, url: &str) -> Result<()> {
        let spec = CommandSpec::git(["remote", "set-url", "origin", url])
            .current_dir(repo.local_path())
            .total_timeout(self.settings.pull_timeout());
        self.runner.execute(&spec, Callbacks::none()).await?;

        Ok(())
    }

    /// Fast-forward pull, falling back to a hard reset on conflicts.
    ///
    /// Returns whether the hard reset was needed.
    async fn pull(&self, repo: &RepositoryDescriptor) -> Result<bool> {
        let branch = repo.branch();
        let pull = self.git_in(repo, ["pull", "origin", branch, "--ff-only"]);
        let err = match self.runner.execute(&pull, Callbacks::none()).await {
            Ok(_) => return Ok(false),
            Err(err) => err,
        };

        if !matches!(err, ProcessError::NonZeroExit { .. })
            || classify_pull_failure(err.stderr()) == PullFailure::Other
        {
            return Err(err.into());
        }

        warn!("{} diverged from upstream, resetting onto origin/{branch}", repo.id());
        let fetch = self.git_in(repo, ["fetch", "origin"]);
        self.runner.execute(&fetch, Callbacks::none()).await?;

        let upstream = format!("origin/{branch}");
        let reset = self.git_in(repo, ["reset", "--hard", upstream.as_str()]);
        self.runner.execute(&reset, Callbacks::none()).await?;

        Ok(true)
    }

    fn git_in<'s>(&self, repo: &RepositoryDescriptor, args: impl IntoIterator<Item = &'s str>) -> CommandSpec {
        CommandSpec::git(args)
            .current_dir(repo.local_path())
            .total_timeout(self.settings.pull_timeout())
    }

    fn record(&self, node: &ProbedNode, success: bool, duration: Duration) {
        if let Err(err) = self.scorer.update_stats(node.name(), success, duration) {
            warn!("cannot record statistics of {}: {err}", node.name());
        }
    }

    fn apply_optional_content(&self, repo: &RepositoryDescriptor) {
        if !repo.has_optional_content() || self.optional_content.is_empty() {
            return;
        }

        if let Err(err) = apply_optional_content(repo.local_path(), &self.optional_content) {
            warn!("cannot update optional content of {}: {err}", repo.id());
        }
    }
}

/// Hide every optional folder whose consumer is missing from working copy
/// at `work_tree`, and reveal the rest.
///
/// # Errors
///
/// - Return [`ExcludeError`] if exclude file cannot be edited.
pub fn apply_optional_content(
    work_tree: &Path,
    rules: &[OptionalContentRule],
) -> Result<(), ExcludeError> {
    ExcludeDrafter::new(work_tree).edit(|edit| {
        for rule in rules {
            if rule.marker.exists() {
                debug!("{:?} present, tracking {}", rule.marker.display(), rule.folder);
                edit.remove_rule(&rule.folder);
            } else {
                debug!("{:?} missing, excluding {}", rule.marker.display(), rule.folder);
                edit.insert_rule(&rule.folder);
            }
        }
    })
}

/// Remove scratch directories left behind by interrupted runs.
///
/// Returns number of directories removed.
///
/// # Errors
///
/// - Return [`DeliveryError`] if a leftover cannot be removed.
pub async fn sweep_stale_clones(temp_root: &Path) -> Result<usize, DeliveryError> {
    let Ok(entries) = read_dir(temp_root) else {
        return Ok(0);
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        if !entry.file_name().to_string_lossy().starts_with(SCRATCH_PREFIX) {
            continue;
        }

        if remove_path(&entry.path()).await? {
            debug!("removed stale clone {:?}", entry.path().display());
            removed += 1;
        }
    }

    Ok(removed)
}

/// Acquisition error types.
#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    /// Every candidate node failed.
    #[error("all {attempted} candidate nodes failed")]
    AllNodesExhausted {
        attempted: usize,
        #[source]
        last: Option<Box<AcquireError>>,
    },

    /// Driven VCS process failed.
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// Finished clone could not be moved into place.
    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    /// Scratch space cannot be prepared.
    #[error("failed to prepare scratch space in {:?}", path.display())]
    Scratch {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Update requested for a repository without working copy.
    #[error("no working copy at {:?}", path.display())]
    NotDownloaded { path: PathBuf },
}

/// Friendly result alias :3
pub type Result<T, E = AcquireError> = std::result::Result<T, E>;
