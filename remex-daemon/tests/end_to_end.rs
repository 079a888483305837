#![cfg(unix)]

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use remex_core::digest::sha1_file;
use remex_core::paths::resolve_under;
use remex_core::Sink;
use remex_daemon::{ClientConfig, Dispatcher, LaunchIo, SinkService, SourceClient};

/// Collects everything written to it.
#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

struct Harness {
    _sink_root: TempDir,
    local: TempDir,
    sink: Arc<SinkService>,
    dispatcher: Dispatcher,
    client: SourceClient,
    stdout: Captured,
    stderr: Captured,
}

impl Harness {
    async fn start() -> Self {
        let sink_root = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        let sink = SinkService::open(sink_root.path()).unwrap();
        let dispatcher = Dispatcher::for_sink("127.0.0.1", 0, sink.clone());
        let addr = dispatcher.open().await.unwrap();

        let client = SourceClient::connect(&ClientConfig::new("127.0.0.1", addr.port()), local.path())
            .await
            .unwrap();
        client.session().open(None).await.unwrap();

        Self {
            _sink_root: sink_root,
            local,
            sink,
            dispatcher,
            client,
            stdout: Captured::default(),
            stderr: Captured::default(),
        }
    }

    fn io(&self) -> LaunchIo {
        LaunchIo {
            stdin: None,
            stdout: Box::new(self.stdout.clone()),
            stderr: Box::new(self.stderr.clone()),
        }
    }

    async fn launch(&self, args: &[&str]) {
        self.client
            .session()
            .launch(
                BTreeMap::new(),
                args.iter().map(|a| a.to_string()).collect(),
                self.io(),
            )
            .await
            .unwrap();
    }

    async fn join(&self) -> i32 {
        tokio::time::timeout(Duration::from_secs(20), self.client.session().join())
            .await
            .expect("run finished in time")
            .unwrap()
    }

    async fn stop(self) {
        self.client.close().await.unwrap();
        self.dispatcher.close().await;
    }
}

#[tokio::test]
async fn launched_argument_file_is_synced_before_the_process_reads_it() {
    let h = Harness::start().await;
    let outside = TempDir::new().unwrap();
    let data = outside.path().join("data.txt");
    std::fs::write(&data, b"remote payload\n").unwrap();
    let data_arg = data.display().to_string();

    h.launch(&["cat", &data_arg]).await;
    assert_eq!(h.join().await, 0);
    assert_eq!(h.stdout.text(), "remote payload\n");

    let area = h.client.session().area().unwrap().clone();
    let info = h.sink.get_area(&area).await.unwrap();
    let remote = h.client.session().fs().to_remote(&data).unwrap();
    assert!(remote.starts_with("_ABS/"));
    let landed = resolve_under(&info.cwd, &remote).unwrap();
    assert_eq!(sha1_file(&landed).unwrap(), sha1_file(&data).unwrap());

    h.stop().await;
}

#[tokio::test]
async fn arguments_reach_the_process_rewritten() {
    let h = Harness::start().await;
    let inside = h.local.path().join("src");
    std::fs::create_dir_all(&inside).unwrap();
    std::fs::write(inside.join("main.txt"), b"x").unwrap();
    let arg = inside.join("main.txt").display().to_string();

    h.launch(&["echo", &arg]).await;
    assert_eq!(h.join().await, 0);
    assert_eq!(h.stdout.text(), "src/main.txt\n");

    h.stop().await;
}

#[tokio::test]
async fn stderr_and_exit_code_are_relayed() {
    let h = Harness::start().await;
    h.launch(&["sh", "-c", "echo oops >&2; exit 7"]).await;
    assert_eq!(h.join().await, 7);
    assert_eq!(h.stderr.text(), "oops\n");
    assert!(h.stdout.text().is_empty());
    h.stop().await;
}

#[tokio::test]
async fn cancel_drives_area_to_exited_and_canceled() {
    let h = Harness::start().await;
    h.launch(&["sleep", "30"]).await;

    let session = h.client.session();
    assert!(session.is_running());
    assert!(session
        .launch(BTreeMap::new(), vec!["true".into()], h.io())
        .await
        .is_err());

    session.cancel().await.unwrap();
    let code = h.join().await;
    assert_ne!(code, 0);

    let info = h
        .sink
        .get_area(session.area().unwrap())
        .await
        .unwrap();
    assert!(!info.running);
    assert!(info.canceled);
    h.stop().await;
}

#[tokio::test]
async fn input_is_fed_to_stdin() {
    let h = Harness::start().await;
    h.launch(&["cat"]).await;

    let session = h.client.session();
    let area = session.area().unwrap().clone();
    h.client.sink().input(&area, "ping\n".to_string()).await.unwrap();

    for _ in 0..200 {
        if h.stdout.text().contains("ping") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(h.stdout.text(), "ping\n");

    session.cancel().await.unwrap();
    h.join().await;
    h.stop().await;
}

#[tokio::test]
async fn exit_cancels_and_reports_code() {
    let h = Harness::start().await;
    h.launch(&["sleep", "30"]).await;
    let code = h.client.session().exit().await.unwrap();
    assert_eq!(code, 128 + 15, "terminated by SIGTERM");
    h.join().await;
    h.stop().await;
}

#[tokio::test]
async fn transform_file_is_sent_rewritten() {
    let h = Harness::start().await;
    let outside = TempDir::new().unwrap();
    let jar = outside.path().join("dep.jar");
    std::fs::write(&jar, b"jar bytes").unwrap();
    let bnd = h.local.path().join("bnd.bnd");
    std::fs::write(&bnd, format!("-runpath: {}\n", jar.display())).unwrap();

    let session = h.client.session();
    session.update(&bnd).unwrap();
    session.sync().await.unwrap();

    let text = session.view("bnd.bnd").await.unwrap().unwrap();
    assert_eq!(
        String::from_utf8(text).unwrap(),
        format!("-runpath: _ABS{}\n", jar.display())
    );
    let jar_remote = format!("_ABS{}", jar.display());
    assert_eq!(session.view(&jar_remote).await.unwrap().unwrap(), b"jar bytes");
    h.stop().await;
}
