// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Release deployment for the fixjam web application.
//!
//! Every deploy host keeps each release of the application in its own
//! directory, and serves whatever release the `current` symlink points at.
//! Deploying fetches a new release, prepares it, then atomically swaps
//! `current` over to it. Older releases stay on disk, so rolling back is
//! just another swap.
//!
//! # Stages and Roles
//!
//! Hosts are grouped into __stages__ (dev, staging, production), and each
//! host plays one or more __roles__ within its stage: nginx, application,
//! database, or mail. Selecting a stage produces a
//! [`DeploymentContext`](stage::DeploymentContext) that every other
//! component receives explicitly. Operations declare the roles they need,
//! and are skipped on hosts that play none of them.

pub mod activate;
pub mod config;
pub mod gate;
pub mod git;
pub mod path;
pub mod release;
pub mod remote;
pub mod role;
pub mod stage;
pub mod task;
pub mod workflow;
