//! Run one statement against a cluster configured from the environment.
//!
//! ```text
//! CQLWIRE_CONTACT_POINTS=127.0.0.1 RUST_LOG=cqlwire_driver=debug \
//!     cargo run --example query -- "SELECT release_version FROM system.local"
//! ```

use cqlwire_driver::{ClusterConfig, ResultBody, Session};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cql = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "SELECT release_version FROM system.local".to_string());

    let mut config = ClusterConfig::from_env();
    if config.contact_points.is_empty() {
        config.contact_points.push("127.0.0.1".to_string());
    }

    let session = Session::connect(config).await?;
    let result = session.query(cql).await?;

    match &result.body {
        ResultBody::Rows(rows) => println!(
            "{} columns, {} bytes of row data, more pages: {}",
            rows.column_count,
            rows.content.len(),
            rows.has_more_pages()
        ),
        other => println!("{other:?}"),
    }
    println!(
        "host {:?}, consistency {}, retries {}",
        result.info.queried_host, result.info.achieved_consistency, result.info.retry_count
    );
    if !result.info.errors.is_empty() {
        println!("failed over from {} host(s)", result.info.errors.len());
    }

    session.shutdown().await;
    Ok(())
}
