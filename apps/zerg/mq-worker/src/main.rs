//! MQ Worker Service - Entry Point
//!
//! Serves the demo handlers over Redis queues.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    zerg_mq_worker::run().await
}
