use crate::*;

use cvp_core::verdict::flags;
use cvp_core::Opinion;

#[tokio::test]
async fn clean_file_comes_back_unchanged() -> Result<()> {
    let daemon = Daemon::start().await?;
    let original = content(10 * SERVER_CHUNK + 123);

    let (verdict, returned) = daemon.inspect("report.pdf", Action::ReadOnly, &original).await?;
    assert_eq!(verdict.opinion, Opinion::Safe);
    assert_eq!(verdict.flags(), flags::CONTENT_SAFE | flags::CONTENT_NOT_MODIFIED);
    assert_eq!(verdict.explanation, "files beginning with 'r' are known to be safe");
    assert_eq!(returned, original);

    daemon.wait_for_clean_scratch().await?;
    daemon.stop().await
}

#[tokio::test]
async fn infected_file_is_reported_without_write_access() -> Result<()> {
    let daemon = Daemon::start().await?;
    let original = content(3000);

    let (verdict, returned) = daemon.inspect("virus.exe", Action::ReadOnly, &original).await?;
    assert_eq!(verdict.opinion, Opinion::Unsafe);
    assert_eq!(verdict.warning, "file was scanned and found infected");
    assert_eq!(
        verdict.explanation,
        "Found virus. CVP server is not allowed to modify content."
    );
    assert_eq!(returned, original);

    daemon.stop().await
}

#[tokio::test]
async fn infected_file_is_fixed_with_write_access() -> Result<()> {
    let daemon = Daemon::start().await?;
    let original = content(500);

    let (verdict, returned) = daemon.inspect("virus.doc", Action::ReadWrite, &original).await?;
    assert_eq!(verdict.opinion, Opinion::Fixed);
    assert_eq!(
        verdict.flags(),
        flags::CONTENT_SAFE | flags::ORIGINAL_CONTENT_UNSAFE | flags::CONTENT_MODIFIED
    );
    assert_eq!(returned.len(), original.len());

    daemon.stop().await
}

#[tokio::test]
async fn empty_file_gets_a_verdict_and_nothing_back() -> Result<()> {
    let daemon = Daemon::start().await?;

    let (verdict, returned) = daemon.inspect("empty.txt", Action::ReadOnly, &[]).await?;
    assert_eq!(verdict.opinion, Opinion::Safe);
    assert!(returned.is_empty());

    daemon.wait_for_clean_scratch().await?;
    daemon.stop().await
}

#[tokio::test]
async fn exact_chunk_multiple_round_trips() -> Result<()> {
    let daemon = Daemon::start().await?;
    let original = content(4 * SERVER_CHUNK);

    let (_, returned) = daemon.inspect("aligned.bin", Action::None, &original).await?;
    assert_eq!(returned, original);

    daemon.stop().await
}
