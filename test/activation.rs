// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::StageFixture;

use fixjam_deploy::{
    activate::{ActivationController, ActivationError},
    path::PREPARED_MARKER,
    release::ReleaseStatus,
    workflow::Workflow,
};

use anyhow::Result;
use pretty_assertions::assert_eq;
use sealed_test::prelude::*;
use std::{
    fs,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
};

fn deploy(version: &str) -> Workflow {
    Workflow::Deploy {
        version: version.into(),
    }
}

#[sealed_test]
fn rollback_without_fetching_again() -> Result<()> {
    let fixture = StageFixture::new()?;
    let first = fixture.commit("urlpatterns = ['first']\n")?;
    let second = fixture.commit("urlpatterns = ['second']\n")?;
    let executor = fixture.executor();
    deploy(&first).run_on_host(&fixture.ctx, &executor)?;
    deploy(&second).run_on_host(&fixture.ctx, &executor)?;
    assert_eq!(fixture.current_target()?, fixture.release_dir(&second));

    // Origin is gone, so any attempt to fetch would fail.
    fs::remove_dir_all(&fixture.origin_path)?;

    let rollback = Workflow::Rollback {
        version: first.clone(),
    };
    rollback.run_on_host(&fixture.ctx, &executor)?;
    assert_eq!(fixture.current_target()?, fixture.release_dir(&first));
    assert_eq!(
        fs::read_to_string(fixture.root.join("current/fixjam/urls.py"))?,
        "urlpatterns = ['first']\n"
    );
    assert_eq!(fixture.log_lines("restarts.log"), 3);

    Ok(())
}

#[sealed_test]
fn rollback_to_unknown_release_fails() -> Result<()> {
    let fixture = StageFixture::new()?;
    let version = fixture.commit("urlpatterns = []\n")?;
    let executor = fixture.executor();
    deploy(&version).run_on_host(&fixture.ctx, &executor)?;

    let controller = ActivationController::new(&fixture.ctx);
    let result = controller.rollback_to("0123456789abcdef", &executor);
    assert!(matches!(result, Err(ActivationError::NotPrepared { .. })));
    assert_eq!(fixture.current_target()?, fixture.release_dir(&version));

    Ok(())
}

#[sealed_test]
fn readers_always_find_prepared_release() -> Result<()> {
    let fixture = StageFixture::new()?;
    let first = fixture.commit("urlpatterns = ['first']\n")?;
    let second = fixture.commit("urlpatterns = ['second']\n")?;
    let executor = fixture.executor();
    deploy(&first).run_on_host(&fixture.ctx, &executor)?;
    let prepare = Workflow::Prepare {
        version: second.clone(),
    };
    prepare.run_on_host(&fixture.ctx, &executor)?;

    let done = Arc::new(AtomicBool::new(false));
    let misses = Arc::new(AtomicUsize::new(0));
    let marker = fixture.root.join("current").join(PREPARED_MARKER);
    let reader = {
        let (done, misses) = (done.clone(), misses.clone());
        thread::spawn(move || {
            while !done.load(Ordering::Relaxed) {
                if !marker.exists() {
                    misses.fetch_add(1, Ordering::Relaxed);
                }
            }
        })
    };

    let controller = ActivationController::new(&fixture.ctx);
    for round in 0..20 {
        let version = if round % 2 == 0 { &second } else { &first };
        controller.rollback_to(version, &executor)?;
    }
    done.store(true, Ordering::Relaxed);
    reader.join().unwrap();

    assert_eq!(misses.load(Ordering::Relaxed), 0);
    assert_eq!(fixture.current_target()?, fixture.release_dir(&first));

    // No temporary links may be left behind next to current.
    let leftovers = fs::read_dir(&fixture.root)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(".current-"))
        .count();
    assert_eq!(leftovers, 0);

    Ok(())
}

#[sealed_test]
fn fresh_host_has_no_releases() -> Result<()> {
    let fixture = StageFixture::new()?;
    let executor = fixture.executor();

    let controller = ActivationController::new(&fixture.ctx);
    assert!(controller.list_releases(&executor, 10)?.is_empty());
    assert_eq!(controller.current_release(&executor)?, None);

    Ok(())
}

#[sealed_test]
fn list_and_prune_releases() -> Result<()> {
    let fixture = StageFixture::new()?;
    let first = fixture.commit("urlpatterns = ['first']\n")?;
    let second = fixture.commit("urlpatterns = ['second']\n")?;
    let executor = fixture.executor();
    deploy(&first).run_on_host(&fixture.ctx, &executor)?;
    deploy(&second).run_on_host(&fixture.ctx, &executor)?;

    let controller = ActivationController::new(&fixture.ctx);
    assert_eq!(controller.current_release(&executor)?, Some(second.clone()));

    let entries = controller
        .list_releases(&executor, 10)?
        .into_iter()
        .map(|entry| (entry.version, entry.status))
        .collect::<Vec<_>>();
    assert_eq!(
        entries,
        vec![
            (second.clone(), ReleaseStatus::Active),
            (first.clone(), ReleaseStatus::Stale),
        ]
    );

    let result = controller.remove_stale(&second, &executor);
    assert!(matches!(result, Err(ActivationError::StillActive { .. })));
    assert!(fixture.release_dir(&second).exists());

    assert!(controller.remove_stale(&first, &executor)?);
    assert!(!fixture.release_dir(&first).exists());
    assert!(!controller.remove_stale(&first, &executor)?);

    Ok(())
}
