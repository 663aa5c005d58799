use std::time::Duration;

use anyhow::{ensure, Context, Result};
use futures::StreamExt;
use serde_json::json;

use centraldogma_server as cd;

use cd::{
    Author, CentralDogma, CentralDogmaConfig, Change, Command, CommitMessage, EntryContent,
    Query, Revision,
};

fn author() -> Author {
    Author::new("minux", "minux@m.x")
}

async fn setup() -> Result<(tempfile::TempDir, std::sync::Arc<CentralDogma>)> {
    let dir = tempfile::tempdir().context("Failed to create a temp dir")?;
    let dogma = CentralDogma::open(CentralDogmaConfig {
        data_dir: dir.path().to_path_buf(),
        mirror_tick_interval_millis: 3_600_000,
        ..Default::default()
    })
    .await
    .context("Failed to open the server")?;
    dogma
        .execute(Command::create_project("foo", author()))
        .await?;
    dogma
        .execute(Command::create_repository("foo", "bar", author()))
        .await?;
    Ok((dir, std::sync::Arc::new(dogma)))
}

async fn push_json(dogma: &CentralDogma, path: &str, value: serde_json::Value) -> Result<Revision> {
    let result = dogma
        .execute(Command::push(
            "foo",
            "bar",
            Revision::HEAD,
            author(),
            CommitMessage::only_summary(&format!("update {}", path)),
            vec![Change::upsert_json(path, value)],
        ))
        .await?
        .unwrap_push();
    Ok(result.revision)
}

#[tokio::test]
async fn test_watch_fires_only_for_matching_path() -> Result<()> {
    let (_dir, dogma) = setup().await?;

    // head == 2 after this push; the watcher baselines there.
    push_json(&dogma, "/foo.json", json!({"n": 0})).await?;

    let watcher = {
        let dogma = dogma.clone();
        tokio::spawn(async move {
            dogma
                .watch_repo("foo", "bar", Revision::from(2), "/foo.json", Duration::from_secs(10))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    // A commit elsewhere does not wake the watcher.
    push_json(&dogma, "/bar.json", json!({"n": 1})).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    ensure!(!watcher.is_finished(), "watcher fired for an unrelated path");

    let expected = push_json(&dogma, "/foo.json", json!({"n": 2})).await?;
    let commit = watcher
        .await
        .context("watcher panicked")??
        .context("watcher timed out")?;
    ensure!(commit.revision == expected, "watcher saw the wrong revision");
    Ok(())
}

#[tokio::test]
async fn test_watch_answers_immediately_from_history() -> Result<()> {
    let (_dir, dogma) = setup().await?;
    push_json(&dogma, "/foo.json", json!(1)).await?; // rev 2
    push_json(&dogma, "/foo.json", json!(2)).await?; // rev 3

    let commit = dogma
        .watch_repo("foo", "bar", Revision::INIT, "/foo.json", Duration::from_secs(5))
        .await?
        .context("expected an immediate answer")?;
    ensure!(
        commit.revision == Revision::from(2),
        "the smallest matching commit answers first"
    );
    Ok(())
}

#[tokio::test]
async fn test_watch_timeout_is_none() -> Result<()> {
    let (_dir, dogma) = setup().await?;
    let result = dogma
        .watch_repo("foo", "bar", Revision::HEAD, "/**", Duration::from_millis(200))
        .await?;
    ensure!(result.is_none(), "an idle repository watch times out");
    Ok(())
}

#[tokio::test]
async fn test_cancelled_watch_is_never_signalled() -> Result<()> {
    let (_dir, dogma) = setup().await?;

    let watcher = {
        let dogma = dogma.clone();
        tokio::spawn(async move {
            dogma
                .watch_repo("foo", "bar", Revision::HEAD, "/**", Duration::from_secs(30))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    watcher.abort();
    let aborted = watcher.await;
    ensure!(aborted.is_err(), "abort cancels the watch future");

    // The commit after the cancellation must not blow up on the dead
    // waiter and nobody observes it.
    push_json(&dogma, "/foo.json", json!(1)).await?;
    Ok(())
}

#[tokio::test]
async fn test_watch_file_sees_queried_value() -> Result<()> {
    let (_dir, dogma) = setup().await?;
    push_json(&dogma, "/foo.json", json!({"watched": 1, "noise": 1})).await?;

    let query = Query::of_json_path("/foo.json", vec!["$.watched".to_string()]).unwrap();
    let watcher = {
        let dogma = dogma.clone();
        let query = query.clone();
        tokio::spawn(async move {
            dogma
                .watch_file("foo", "bar", Revision::HEAD, &query, Duration::from_secs(10))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Only the noise changes; the queried value is stable.
    push_json(&dogma, "/foo.json", json!({"watched": 1, "noise": 2})).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    ensure!(!watcher.is_finished(), "watcher fired for an unchanged query result");

    push_json(&dogma, "/foo.json", json!({"watched": 2, "noise": 2})).await?;
    let result = watcher
        .await
        .context("watcher panicked")??
        .context("watcher timed out")?;
    ensure!(
        result.entry.content == EntryContent::Json(json!(2)),
        "watch_file delivers the queried content: {:?}",
        result.entry.content
    );
    Ok(())
}

#[tokio::test]
async fn test_watch_repo_stream() -> Result<()> {
    let (_dir, dogma) = setup().await?;
    let mut stream = dogma.watch_repo_stream("foo", "bar", "/counter.json").await?;

    let pusher = {
        let dogma = dogma.clone();
        tokio::spawn(async move {
            for n in 0..2 {
                tokio::time::sleep(Duration::from_millis(150)).await;
                push_json(&dogma, "/counter.json", json!({ "n": n })).await.unwrap();
            }
        })
    };

    let first = tokio::time::timeout(Duration::from_secs(10), stream.next())
        .await
        .context("stream produced nothing")?
        .context("stream ended")?;
    let second = tokio::time::timeout(Duration::from_secs(10), stream.next())
        .await
        .context("stream produced only one item")?
        .context("stream ended")?;
    ensure!(
        second.revision > first.revision,
        "stream delivers commits in order"
    );
    pusher.await?;
    Ok(())
}
