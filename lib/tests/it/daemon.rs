//! Tests that require a local container runtime. Ignored by default; run
//! with `cargo test -- --ignored` on a machine with a docker socket.

use color_eyre::Result;
use whittle_lib::daemon::Daemon;

#[test_log::test(tokio::test)]
#[ignore = "requires a local docker daemon"]
async fn connect_verifies_the_daemon() -> Result<()> {
    Daemon::connect().await?;
    Ok(())
}

#[test_log::test(tokio::test)]
#[ignore = "requires a local docker daemon"]
async fn export_root_materializes_a_tree() -> Result<()> {
    let daemon = Daemon::connect().await?;
    let containers = std::env::var("WHITTLE_TEST_CONTAINER");
    let Ok(container) = containers else {
        eprintln!("set WHITTLE_TEST_CONTAINER to a container id to run this test");
        return Ok(());
    };

    let dest = tempfile::tempdir()?;
    daemon.export_root(&container, dest.path()).await?;
    assert!(
        dest.path().join("etc").exists() || dest.path().join("bin").exists(),
        "exported tree should contain a root layout"
    );
    Ok(())
}
