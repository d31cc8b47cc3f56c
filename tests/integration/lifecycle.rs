use crate::*;

use cvp_core::wire::Frame;
use cvp_services::transport::write_frame;

#[tokio::test]
async fn concurrent_sessions_stay_separate() -> Result<()> {
    let daemon = Arc::new(Daemon::start().await?);

    let mut tasks = Vec::new();
    for n in 0..8usize {
        let daemon = daemon.clone();
        tasks.push(tokio::spawn(async move {
            let original: Vec<u8> = content(2000 + n * 700)
                .into_iter()
                .map(|b| b.wrapping_add(n as u8))
                .collect();
            let (_, returned) = daemon
                .inspect(&format!("file-{n}.txt"), Action::ReadOnly, &original)
                .await?;
            anyhow::ensure!(returned == original, "session {n} got someone else's bytes");
            Ok::<_, anyhow::Error>(())
        }));
    }
    for task in tasks {
        task.await??;
    }

    daemon.wait_for_clean_scratch().await?;
    let daemon = Arc::try_unwrap(daemon)
        .map_err(|_| anyhow::anyhow!("daemon still shared"))?;
    daemon.stop().await
}

#[tokio::test]
async fn abandoned_upload_is_cleaned_up() -> Result<()> {
    let daemon = Daemon::start().await?;

    {
        let mut stream = TcpStream::connect(daemon.addr).await?;
        write_frame(&mut stream, &Frame::Request(RequestParams::default())).await?;
        write_frame(&mut stream, &Frame::Data(Bytes::from(content(100)))).await?;
        // Give the daemon time to stage the partial upload.
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    daemon.wait_for_clean_scratch().await?;

    // The daemon keeps serving other peers.
    let original = content(2500);
    let (_, returned) = daemon.inspect("after.txt", Action::ReadOnly, &original).await?;
    assert_eq!(returned, original);

    daemon.stop().await
}

#[tokio::test]
async fn shutdown_ends_open_sessions() -> Result<()> {
    let daemon = Daemon::start().await?;

    let mut stream = TcpStream::connect(daemon.addr).await?;
    write_frame(&mut stream, &Frame::Request(RequestParams::default())).await?;
    write_frame(&mut stream, &Frame::Data(Bytes::from_static(b"in flight"))).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    daemon.stop().await?;

    // The peer sees its connection closed.
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(
        Duration::from_secs(5),
        tokio::io::AsyncReadExt::read(&mut stream, &mut buf),
    )
    .await?;
    assert!(matches!(read, Ok(0) | Err(_)));
    Ok(())
}
