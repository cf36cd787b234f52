//! OJS Demo Worker - Entry Point
//!
//! In-process worker that registers the demo handlers and serves health probes.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    ojs_demo_worker::run().await
}
