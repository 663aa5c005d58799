use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use serde_json::json;

use centraldogma_server as cd;

use cd::cluster::{ClusterCoordinator, LeaderListener};
use cd::{
    Author, CentralDogma, CentralDogmaConfig, Change, Command, CommitMessage, Query, Repository,
    Revision, ServerStatus, StatusScope,
};

fn author() -> Author {
    Author::new("minux", "minux@m.x")
}

fn config(dir: &std::path::Path) -> CentralDogmaConfig {
    CentralDogmaConfig {
        data_dir: dir.to_path_buf(),
        mirror_tick_interval_millis: 3_600_000,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_read_only_mode_survives_restart() -> Result<()> {
    let dir = tempfile::tempdir().context("Failed to create a temp dir")?;
    {
        let dogma = CentralDogma::open(config(dir.path())).await?;
        dogma
            .execute(Command::create_project("foo", author()))
            .await?;
        dogma
            .execute(Command::create_repository("foo", "bar", author()))
            .await?;
        dogma
            .execute(Command::push(
                "foo",
                "bar",
                Revision::HEAD,
                author(),
                CommitMessage::only_summary("seed"),
                vec![Change::upsert_json("/a.json", json!(1))],
            ))
            .await?;

        // Drain writes.
        let updated = dogma
            .update_status(
                &json!([{"op": "replace", "path": "/writable", "value": false}]),
                StatusScope::All,
            )
            .await?
            .context("status update was a no-op")?;
        ensure!(
            updated
                == ServerStatus {
                    writable: false,
                    replicating: true
                }
        );

        // Mutations fail, reads keep working.
        let push = dogma
            .execute(Command::push(
                "foo",
                "bar",
                Revision::HEAD,
                author(),
                CommitMessage::only_summary("rejected"),
                vec![Change::upsert_json("/a.json", json!(2))],
            ))
            .await;
        ensure!(matches!(push, Err(cd::Error::ReadOnly)), "push must fail read-only");
        let repo = dogma.repo("foo", "bar").await?;
        let entry = repo
            .get(Revision::HEAD, &Query::of_json("/a.json").unwrap())
            .await?;
        ensure!(entry.revision == Revision::from(2));
    }

    // The mode survives the restart.
    let dogma = CentralDogma::open(config(dir.path())).await?;
    ensure!(!dogma.status().writable, "read-only mode was not persisted");
    let push = dogma
        .execute(Command::push(
            "foo",
            "bar",
            Revision::HEAD,
            author(),
            CommitMessage::only_summary("still rejected"),
            vec![Change::upsert_json("/a.json", json!(2))],
        ))
        .await;
    ensure!(matches!(push, Err(cd::Error::ReadOnly)));

    // Re-enable writes; pushes succeed again.
    dogma
        .update_status(
            &json!([{"op": "replace", "path": "/writable", "value": true}]),
            StatusScope::All,
        )
        .await?;
    dogma
        .execute(Command::push(
            "foo",
            "bar",
            Revision::HEAD,
            author(),
            CommitMessage::only_summary("accepted"),
            vec![Change::upsert_json("/a.json", json!(2))],
        ))
        .await
        .context("push after re-enabling writes")?;
    Ok(())
}

#[tokio::test]
async fn test_status_update_rules() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let dogma = CentralDogma::open(config(dir.path())).await?;

    // writable && !replicating is rejected outright.
    let invalid = dogma
        .update_status(
            &json!([{"op": "replace", "path": "/replicating", "value": false}]),
            StatusScope::Local,
        )
        .await;
    ensure!(matches!(invalid, Err(cd::Error::InvalidParams(_))));

    // A no-change update answers None (NOT_MODIFIED).
    let unchanged = dogma
        .update_status(
            &json!([{"op": "replace", "path": "/writable", "value": true}]),
            StatusScope::Local,
        )
        .await?;
    ensure!(unchanged.is_none());

    // Disabling writable first, then replicating, drains gracefully.
    dogma
        .update_status(
            &json!([{"op": "replace", "path": "/writable", "value": false}]),
            StatusScope::Local,
        )
        .await?;
    dogma
        .update_status(
            &json!([{"op": "replace", "path": "/replicating", "value": false}]),
            StatusScope::Local,
        )
        .await?;
    ensure!(
        dogma.status()
            == ServerStatus {
                writable: false,
                replicating: false
            }
    );
    Ok(())
}

#[tokio::test]
async fn test_soft_removed_project_restores() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let dogma = CentralDogma::open(config(dir.path())).await?;
    dogma
        .execute(Command::create_project("foo", author()))
        .await?;
    dogma
        .execute(Command::RemoveProject {
            name: "foo".to_string(),
            author: author(),
        })
        .await?;
    ensure!(dogma.repo("foo", "meta").await.is_err());

    dogma
        .execute(Command::RestoreProject {
            name: "foo".to_string(),
        })
        .await?;
    ensure!(dogma.repo("foo", "meta").await.is_ok());
    Ok(())
}

struct Flag(AtomicBool);

impl LeaderListener for Flag {
    fn on_elected(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
    fn on_revoked(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_zone_leader_uniqueness_and_failover() -> Result<()> {
    let coordinator = ClusterCoordinator::new();
    let zones = ["east", "west"];
    let mut members = Vec::new();
    let mut flags = Vec::new();
    for zone in &zones {
        for n in 0..3 {
            let flag = Arc::new(Flag(AtomicBool::new(false)));
            members.push((
                *zone,
                coordinator.join(zone, &format!("{}-{}", zone, n), flag.clone()),
            ));
            flags.push((*zone, flag));
        }
    }

    // Exactly one leader per zone.
    for zone in &zones {
        let leaders = flags
            .iter()
            .filter(|(z, f)| z == zone && f.0.load(Ordering::SeqCst))
            .count();
        ensure!(leaders == 1, "zone {} has {} leaders", zone, leaders);
    }

    // Killing the east leader promotes another east member; west is
    // untouched.
    let east_leader = coordinator.leader_of("east").context("east has a leader")?;
    let position = members
        .iter()
        .position(|(z, _)| *z == "east")
        .context("east member present")?;
    members.remove(position);
    let new_leader = coordinator.leader_of("east").context("east re-elected")?;
    ensure!(new_leader != east_leader, "east leadership moved");
    ensure!(
        coordinator.leader_of("west").is_some(),
        "west keeps its leader"
    );
    let east_leaders = flags
        .iter()
        .filter(|(z, f)| *z == "east" && f.0.load(Ordering::SeqCst))
        .count();
    ensure!(east_leaders == 1, "east has exactly one leader after failover");
    Ok(())
}
