use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use syncbox::client::{commands, sync, ClientConfig, SyncEngine};
use syncbox::message::Message;
use syncbox::server;
use syncbox::watcher;
use syncbox::wire::Connection;

fn free_port() -> Result<u16> {
    let sock = std::net::TcpListener::bind("127.0.0.1:0")?;
    let port = sock.local_addr()?.port();
    drop(sock);
    Ok(port)
}

async fn start_server(root: &Path) -> Result<(String, tokio::task::JoinHandle<()>)> {
    let port = free_port()?;
    let bind = format!("127.0.0.1:{port}");
    let serve_bind = bind.clone();
    let root = root.to_path_buf();
    let task = tokio::spawn(async move {
        let _ = server::serve(&serve_bind, &root).await;
    });

    // Wait for the daemon to start accepting connections
    for _ in 0..50u32 {
        if tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .is_ok()
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok((bind, task))
}

fn config(server: &str, sync_dir: &Path) -> ClientConfig {
    ClientConfig {
        server: server.to_string(),
        username: "alice".to_string(),
        sync_dir: sync_dir.to_path_buf(),
    }
}

async fn eventually<F>(mut check: F, what: &str) -> Result<()>
where
    F: FnMut() -> bool,
{
    for _ in 0..200u32 {
        if check() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    anyhow::bail!("timed out waiting for {what}")
}

fn read(path: &Path) -> Option<String> {
    std::fs::read_to_string(path).ok()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upload_download_delete_roundtrip() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let work = tempfile::tempdir()?;
    let dest = tempfile::tempdir()?;
    let (bind, server_task) = start_server(srv.path()).await?;
    let cfg = config(&bind, work.path());

    let src = work.path().join("report.txt");
    std::fs::write(&src, "quarterly numbers\n")?;
    commands::upload(&cfg, &src).await?;
    assert!(srv.path().join("alice/report.txt").exists());

    let listing = commands::list_server(&cfg).await?;
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].filename, "report.txt");

    let downloaded = commands::download(&cfg, "report.txt", dest.path()).await?;
    assert_eq!(read(&downloaded).as_deref(), Some("quarterly numbers\n"));

    assert!(commands::delete(&cfg, "report.txt").await?);
    assert!(!srv.path().join("alice/report.txt").exists());
    // Already gone: reported, not an error.
    assert!(!commands::delete(&cfg, "report.txt").await?);
    assert_eq!(commands::list_server(&cfg).await?.len(), 0);

    server_task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn downloading_a_missing_file_reports_not_found() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let dest = tempfile::tempdir()?;
    let (bind, server_task) = start_server(srv.path()).await?;
    let cfg = config(&bind, dest.path());

    let err = commands::download(&cfg, "nope.txt", dest.path())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not found"));

    server_task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn changes_reach_a_subscribed_device() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let a_work = tempfile::tempdir()?;
    let b_sync = tempfile::tempdir()?;
    let (bind, server_task) = start_server(srv.path()).await?;

    // Device A seeds a file before B ever connects.
    let a_cfg = config(&bind, a_work.path());
    let src = a_work.path().join("notes.txt");
    std::fs::write(&src, "v1\n")?;
    commands::upload(&a_cfg, &src).await?;

    // Device B comes online: the baseline must bring the file down.
    let b_cfg = config(&bind, b_sync.path());
    let engine = SyncEngine::start(b_cfg);
    let _watcher = watcher::spawn(engine.clone())?;
    let _subscription = sync::spawn(engine);
    let b_copy = b_sync.path().join("notes.txt");
    eventually(|| read(&b_copy).as_deref() == Some("v1\n"), "baseline download").await?;

    // Timestamps have second granularity; make the next version measurably newer.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    std::fs::write(&src, "v2\n")?;
    commands::upload(&a_cfg, &src).await?;
    eventually(|| read(&b_copy).as_deref() == Some("v2\n"), "pushed update").await?;

    commands::delete(&a_cfg, "notes.txt").await?;
    eventually(|| !b_copy.exists(), "pushed delete").await?;

    server_task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn superseding_upload_waits_for_the_writer_it_replaces() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let (bind, server_task) = start_server(srv.path()).await?;

    // Two sessions race on the same filename; the protocol is driven by hand
    // so the ordering is deterministic.
    let mut first = Connection::connect(&bind, "alice").await?;
    let mut second = Connection::connect(&bind, "alice").await?;
    let upload = Message::Upload {
        filename: "contested.txt".into(),
    };

    first.send(&upload).await?;
    first.expect_ok().await?;

    // The second writer is accepted but must stay chained behind the first.
    second.send(&upload).await?;
    let blocked = tokio::time::timeout(Duration::from_millis(300), second.recv()).await;
    assert!(blocked.is_err(), "successor started before its predecessor finished");

    first.send(&Message::Start).await?;
    first.expect_ok().await?;
    first.send(&Message::Data(b"older content\n".to_vec())).await?;
    first.expect_ok().await?;
    first.send(&Message::End).await?;
    first.expect_ok().await?;

    // Only now is the successor released.
    second.expect_ok().await?;
    second.send(&Message::Start).await?;
    second.expect_ok().await?;
    second.send(&Message::Data(b"newer content\n".to_vec())).await?;
    second.expect_ok().await?;
    second.send(&Message::End).await?;
    second.expect_ok().await?;

    assert_eq!(
        read(&srv.path().join("alice/contested.txt")).as_deref(),
        Some("newer content\n")
    );

    server_task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_downloads_both_complete() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let work = tempfile::tempdir()?;
    let dest_a = tempfile::tempdir()?;
    let dest_b = tempfile::tempdir()?;
    let (bind, server_task) = start_server(srv.path()).await?;
    let cfg = config(&bind, work.path());

    let src = work.path().join("shared.txt");
    std::fs::write(&src, "read me twice\n")?;
    commands::upload(&cfg, &src).await?;

    let (a, b) = tokio::join!(
        commands::download(&cfg, "shared.txt", dest_a.path()),
        commands::download(&cfg, "shared.txt", dest_b.path()),
    );
    assert_eq!(read(&a?).as_deref(), Some("read me twice\n"));
    assert_eq!(read(&b?).as_deref(), Some("read me twice\n"));

    server_task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn an_aborted_upload_closes_the_session() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let (bind, server_task) = start_server(srv.path()).await?;

    let mut conn = Connection::connect(&bind, "alice").await?;
    let reply = conn
        .request(&Message::Upload {
            filename: "broken.txt".into(),
        })
        .await?;
    assert!(reply.is_ok());
    // End in place of Start aborts the transfer server-side; the server must
    // close the socket rather than leave both sides waiting.
    conn.send(&Message::End).await?;
    assert_eq!(conn.recv().await?, Message::Empty);

    // A fresh session still works against the same filename.
    let work = tempfile::tempdir()?;
    let cfg = config(&bind, work.path());
    let src = work.path().join("broken.txt");
    std::fs::write(&src, "good\n")?;
    commands::upload(&cfg, &src).await?;
    assert_eq!(
        read(&srv.path().join("alice/broken.txt")).as_deref(),
        Some("good\n")
    );

    server_task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watched_local_files_are_uploaded() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let sync_dir = tempfile::tempdir()?;
    let (bind, server_task) = start_server(srv.path()).await?;

    let engine = SyncEngine::start(config(&bind, sync_dir.path()));
    let _watcher = watcher::spawn(engine.clone())?;
    let _subscription = sync::spawn(engine);

    // Give the watcher a moment to arm before writing.
    tokio::time::sleep(Duration::from_millis(200)).await;
    std::fs::write(sync_dir.path().join("draft.txt"), "hello\n")?;

    let stored = srv.path().join("alice/draft.txt");
    eventually(
        || read(&stored).as_deref() == Some("hello\n"),
        "watched upload",
    )
    .await?;

    server_task.abort();
    Ok(())
}
