// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Mirror-aware repository acquisition and allow-list synchronization.
//!
//! Mirrorkeep keeps a set of externally hosted gallery repositories on disk
//! and projects an allowed subset of their files into consumer directories.
//!
//! # Acquisition
//!
//! Upstream hosts are often slow or unreachable depending on where a user
//! sits. A repository hosted on a known platform can usually be reached
//! through several __mirror nodes__ instead: proxies that serve the same
//! content under a rewritten URL. Before cloning, every configured node is
//! probed over HTTP and through the VCS tool itself, ranked by reachability
//! and its historical performance, and then tried in order until one clone
//! succeeds. Clones are made in scratch space and moved into place only when
//! complete.
//!
//! # Synchronization
//!
//! The core repository carries a JSON index of every content file. After
//! acquisition, the allowed subset of those files is copied into target
//! directories, and files that stopped being allowed since the last pass
//! are removed again.

pub mod config;
pub mod mirror;
pub mod path;
pub mod process;
pub mod repo;
pub mod store;
pub mod sync;

pub use config::{Config, ConfigFile};
pub use repo::{
    acquire::{Acquirer, AcquisitionResult, Mode},
    Gallery, RepositoryDescriptor,
};
pub use store::JsonStore;
pub use sync::{SyncReport, Synchronizer};
